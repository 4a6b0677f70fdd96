//! Header-reference index for markdown vaults.
//!
//! Documents are split into headed sections carrying bullet metadata (`- Key: Value`)
//! and inline `\label{..}` citations. Queries run over a document store handed in by
//! the caller and a borrowed configuration snapshot; nothing here reaches for global
//! state, and every query re-parses the files it selects.

pub mod core {
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{fmt, path::PathBuf, str::FromStr};

    /* ------------------------------ Documents ------------------------------ */

    /// A document known to the store, without its body.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct DocumentInfo {
        /// Vault-relative path with `/` separators, e.g. `analysis/compactness.md`.
        pub path: String,
        pub modified_time: DateTime<Utc>,
    }

    impl DocumentInfo {
        pub fn new(path: impl Into<String>, modified_time: DateTime<Utc>) -> Self {
            Self {
                path: path.into(),
                modified_time,
            }
        }

        pub fn folder(&self) -> &str {
            folder_of(&self.path)
        }
    }

    /// Everything before the last `/`; documents at the vault root live in `""`.
    pub fn folder_of(path: &str) -> &str {
        path.rfind('/').map(|idx| &path[..idx]).unwrap_or("")
    }

    /// Drop a trailing `.ext` from the final path component.
    pub fn strip_extension(path: &str) -> &str {
        match path.rfind('.') {
            Some(idx) if idx + 1 < path.len() && !path[idx + 1..].contains('/') => &path[..idx],
            _ => path,
        }
    }

    /* ------------------------------ Sections ------------------------------ */

    /// One `- Key: Value` bullet inside a section. `line` is 1-based.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Entry {
        pub key: String,
        pub value: String,
        pub line: usize,
    }

    /// A heading and the lines it owns, up to the next heading or end of document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Section {
        pub header: String,
        pub header_line: usize,
        /// Inclusive; equals `header_line` when the next heading follows immediately.
        pub end_line: usize,
        #[serde(default)]
        pub entries: Vec<Entry>,
        /// First-seen order, no duplicates.
        #[serde(default)]
        pub labels: Vec<String>,
    }

    impl Section {
        pub fn open(header: &str, header_line: usize) -> Self {
            Self {
                header: header.trim().to_string(),
                header_line,
                end_line: header_line,
                entries: Vec::new(),
                labels: Vec::new(),
            }
        }

        pub fn contains_line(&self, line: usize) -> bool {
            self.header_line <= line && line <= self.end_line
        }

        pub fn add_label(&mut self, label: &str) {
            if !self.labels.iter().any(|known| known == label) {
                self.labels.push(label.to_string());
            }
        }
    }

    /* ----------------------------- Categories ----------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Category {
        pub name: String,
        #[serde(default)]
        pub aliases: Vec<String>,
    }

    impl Category {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                aliases: Vec::new(),
            }
        }

        pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            self.aliases.extend(aliases.into_iter().map(Into::into));
            self
        }
    }

    /// Named group of categories. Members are canonical names resolved at query time.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SuperCategory {
        pub name: String,
        #[serde(default)]
        pub categories: Vec<String>,
    }

    /* ------------------------------- Results ------------------------------- */

    /// A query hit: one named reference inside one section of one document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Header {
        /// Canonical category, or a synthetic parent such as `Label` / `Proof Status`.
        pub parent: String,
        pub name: String,
        pub header: String,
        /// `file_path` without its extension.
        pub file: String,
        pub file_path: String,
        pub modified_time: DateTime<Utc>,
        #[serde(default)]
        pub labels: Vec<String>,
        /// Normalized key -> values in document order.
        #[serde(default)]
        pub metadata: IndexMap<String, Vec<String>>,
    }

    impl Header {
        /// Wiki-style link that points at the section and displays the reference name.
        pub fn link_text(&self) -> String {
            format!("[[{}#{}|{}]]", self.file, self.header, self.name)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ValidationIssue {
        pub file_path: String,
        pub line: usize,
        pub message: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PrerequisiteInfo {
        pub header: String,
        pub file_path: String,
        pub uses: Vec<String>,
        pub depends_on: Vec<String>,
        pub generalizes: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub proof_status: Option<String>,
    }

    /* ------------------------------- Options ------------------------------- */

    /// Which documents a query considers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum SearchScope {
        #[default]
        Vault,
        CurrentFile,
        CurrentFolder,
    }

    /// Primary ordering applied before the header/name tiebreak.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum SortMode {
        #[default]
        Category,
        File,
        Recency,
    }

    /// How a presenter buckets an ordered result list.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum GroupMode {
        #[default]
        None,
        Category,
        File,
    }

    impl SearchScope {
        pub fn as_str(self) -> &'static str {
            match self {
                SearchScope::Vault => "vault",
                SearchScope::CurrentFile => "current-file",
                SearchScope::CurrentFolder => "current-folder",
            }
        }
    }

    impl SortMode {
        pub fn as_str(self) -> &'static str {
            match self {
                SortMode::Category => "category",
                SortMode::File => "file",
                SortMode::Recency => "recency",
            }
        }
    }

    impl GroupMode {
        pub fn as_str(self) -> &'static str {
            match self {
                GroupMode::None => "none",
                GroupMode::Category => "category",
                GroupMode::File => "file",
            }
        }
    }

    impl FromStr for SearchScope {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "vault" => Ok(SearchScope::Vault),
                "current-file" => Ok(SearchScope::CurrentFile),
                "current-folder" => Ok(SearchScope::CurrentFolder),
                other => Err(format!(
                    "unknown scope `{other}`; expected vault|current-file|current-folder"
                )),
            }
        }
    }

    impl FromStr for SortMode {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "category" => Ok(SortMode::Category),
                "file" => Ok(SortMode::File),
                "recency" => Ok(SortMode::Recency),
                other => Err(format!(
                    "unknown sort mode `{other}`; expected category|file|recency"
                )),
            }
        }
    }

    impl FromStr for GroupMode {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "none" => Ok(GroupMode::None),
                "category" => Ok(GroupMode::Category),
                "file" => Ok(GroupMode::File),
                other => Err(format!(
                    "unknown group mode `{other}`; expected none|category|file"
                )),
            }
        }
    }

    impl fmt::Display for SearchScope {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl fmt::Display for SortMode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl fmt::Display for GroupMode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct SearchOptions {
        pub scope: SearchScope,
        /// Path of the document the query is issued from; required by the non-vault scopes.
        pub anchor_path: Option<String>,
        pub sort_mode: SortMode,
    }

    impl SearchOptions {
        pub fn new(scope: SearchScope) -> Self {
            Self {
                scope,
                ..Self::default()
            }
        }

        pub fn anchored(mut self, path: impl Into<String>) -> Self {
            self.anchor_path = Some(path.into());
            self
        }

        pub fn sorted_by(mut self, sort_mode: SortMode) -> Self {
            self.sort_mode = sort_mode;
            self
        }
    }

    /* ---------------------------- Errors (store) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("document `{0}` does not exist")]
        NotFound(String),
        #[error("failed to read `{path}`")]
        Io {
            path: String,
            #[source]
            source: std::io::Error,
        },
        #[error("failed to scan {dir:?}")]
        Walk {
            dir: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }

}

pub mod storage {
    //! The document-store capability the engine consumes, plus filesystem and
    //! in-memory implementations.

    use crate::core::{DocumentInfo, StoreError};
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use log::warn;
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    /// Read-only access to a corpus of markdown documents.
    pub trait DocumentStore {
        /// Every document in the corpus. Order carries no meaning.
        fn list_documents(&self) -> Result<Vec<DocumentInfo>, StoreError>;

        /// Full text of the document at `path`.
        fn read_document(&self, path: &str) -> Result<String, StoreError>;

        /// Look up a single document; `None` when the path is not part of the corpus.
        fn resolve_path(&self, path: &str) -> Option<DocumentInfo>;
    }

    /* ------------------------------ Filesystem ------------------------------ */

    /// A vault directory on disk. Paths handed out are relative to `root`.
    #[derive(Debug, Clone)]
    pub struct FsDocumentStore {
        root: PathBuf,
    }

    impl FsDocumentStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        fn abs_path(&self, rel: &str) -> PathBuf {
            rel.split('/')
                .filter(|segment| !segment.is_empty())
                .fold(self.root.clone(), |path, segment| path.join(segment))
        }
    }

    impl DocumentStore for FsDocumentStore {
        fn list_documents(&self) -> Result<Vec<DocumentInfo>, StoreError> {
            let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Walk {
                dir: self.root.clone(),
                source,
            })?;
            let mut out = Vec::new();
            collect_entries(entries, &self.root, "", &mut out);
            out.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(out)
        }

        fn read_document(&self, path: &str) -> Result<String, StoreError> {
            let abs = self.abs_path(path);
            fs::read_to_string(&abs).map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    StoreError::NotFound(path.to_string())
                } else {
                    StoreError::Io {
                        path: path.to_string(),
                        source,
                    }
                }
            })
        }

        fn resolve_path(&self, path: &str) -> Option<DocumentInfo> {
            // Same visibility rules as `list_documents`: no parent hops, no hidden entries.
            if path.split('/').any(|segment| segment.starts_with('.')) {
                return None;
            }
            let abs = self.abs_path(path);
            let metadata = fs::metadata(&abs).ok()?;
            if !metadata.is_file() || !is_markdown(&abs) {
                return None;
            }
            Some(DocumentInfo::new(path, modified_utc(&metadata)))
        }
    }

    /// Collect markdown documents below `dir`.
    ///
    /// Unreadable entries and subdirectories are logged and skipped; the caller
    /// decides what to do when `dir` itself cannot be opened.
    fn collect_entries(entries: fs::ReadDir, dir: &Path, rel: &str, out: &mut Vec<DocumentInfo>) {
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    skipped(dir, &err);
                    continue;
                }
            };
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    skipped(&entry.path(), &err);
                    continue;
                }
            };
            if file_type.is_symlink() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let child_rel = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            let path = entry.path();
            if file_type.is_dir() {
                visit_subdir(&path, &child_rel, out);
            } else if file_type.is_file() && is_markdown(&path) {
                let modified = entry
                    .metadata()
                    .map(|metadata| modified_utc(&metadata))
                    .unwrap_or_default();
                out.push(DocumentInfo::new(child_rel, modified));
            }
        }
    }

    fn visit_subdir(dir: &Path, rel: &str, out: &mut Vec<DocumentInfo>) {
        match fs::read_dir(dir) {
            Ok(entries) => collect_entries(entries, dir, rel, out),
            Err(err) => skipped(dir, &err),
        }
    }

    fn skipped(dir: &Path, err: &std::io::Error) {
        warn!(
            "event=list_documents module=storage status=skipped dir={} error={}",
            dir.display(),
            err
        );
    }

    fn is_markdown(path: &Path) -> bool {
        path.extension()
            .map(|ext| ext == "md" || ext == "markdown")
            .unwrap_or(false)
    }

    fn modified_utc(metadata: &fs::Metadata) -> DateTime<Utc> {
        metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default()
    }

    /* ------------------------------- In-memory ------------------------------- */

    /// Insertion-ordered corpus held in memory.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryStore {
        documents: IndexMap<String, (DocumentInfo, String)>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Add or replace a document.
        pub fn insert(
            &mut self,
            path: impl Into<String>,
            text: impl Into<String>,
            modified_time: DateTime<Utc>,
        ) -> &mut Self {
            let path = path.into();
            let info = DocumentInfo::new(path.clone(), modified_time);
            self.documents.insert(path, (info, text.into()));
            self
        }

        pub fn with_document(
            mut self,
            path: impl Into<String>,
            text: impl Into<String>,
            modified_time: DateTime<Utc>,
        ) -> Self {
            self.insert(path, text, modified_time);
            self
        }

        pub fn remove(&mut self, path: &str) -> bool {
            self.documents.shift_remove(path).is_some()
        }

        pub fn len(&self) -> usize {
            self.documents.len()
        }

        pub fn is_empty(&self) -> bool {
            self.documents.is_empty()
        }
    }

    impl DocumentStore for MemoryStore {
        fn list_documents(&self) -> Result<Vec<DocumentInfo>, StoreError> {
            Ok(self
                .documents
                .values()
                .map(|(info, _)| info.clone())
                .collect())
        }

        fn read_document(&self, path: &str) -> Result<String, StoreError> {
            self.documents
                .get(path)
                .map(|(_, text)| text.clone())
                .ok_or_else(|| StoreError::NotFound(path.to_string()))
        }

        fn resolve_path(&self, path: &str) -> Option<DocumentInfo> {
            self.documents.get(path).map(|(info, _)| info.clone())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::fs;

        #[test]
        fn fs_store_lists_markdown_recursively_with_relative_paths() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            fs::create_dir_all(root.join("analysis/topology")).expect("mkdir");
            fs::create_dir_all(root.join(".obsidian")).expect("mkdir hidden");
            fs::write(root.join("index.md"), "# Index").expect("write index");
            fs::write(root.join("analysis/topology/compact.md"), "# Compact").expect("write");
            fs::write(root.join("analysis/notes.txt"), "ignored").expect("write txt");
            fs::write(root.join(".obsidian/cache.md"), "# hidden").expect("write hidden");

            let store = FsDocumentStore::new(root);
            let paths: Vec<String> = store
                .list_documents()
                .expect("list")
                .into_iter()
                .map(|doc| doc.path)
                .collect();

            assert_eq!(paths, vec!["analysis/topology/compact.md", "index.md"]);
            assert_eq!(
                store
                    .read_document("analysis/topology/compact.md")
                    .expect("read"),
                "# Compact"
            );
        }

        #[test]
        fn fs_store_reports_missing_documents() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = FsDocumentStore::new(tmp.path());

            assert!(matches!(
                store.read_document("gone.md"),
                Err(StoreError::NotFound(path)) if path == "gone.md"
            ));
            assert!(store.resolve_path("gone.md").is_none());
            assert!(store.resolve_path("../outside.md").is_none());
        }

        #[test]
        fn fs_store_listing_fails_for_missing_root() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = FsDocumentStore::new(tmp.path().join("missing"));
            assert!(matches!(
                store.list_documents(),
                Err(StoreError::Walk { .. })
            ));
        }

        #[test]
        fn unreadable_subdirectory_is_skipped() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut out = Vec::new();
            visit_subdir(&tmp.path().join("vanished"), "vanished", &mut out);
            assert!(out.is_empty());
        }

        #[cfg(unix)]
        #[test]
        fn locked_subdirectory_does_not_fail_listing() {
            use std::os::unix::fs::PermissionsExt;

            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            let locked = root.join("locked");
            fs::create_dir_all(&locked).expect("mkdir locked");
            fs::write(locked.join("secret.md"), "# Secret").expect("write secret");
            fs::write(root.join("open.md"), "# Open").expect("write open");
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");

            let listed = FsDocumentStore::new(root).list_documents();
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("restore");

            // Root bypasses the permission bits and still sees `locked/secret.md`.
            let paths: Vec<String> = listed
                .expect("listing survives")
                .into_iter()
                .map(|doc| doc.path)
                .collect();
            assert!(paths.contains(&"open.md".to_string()));
        }

        #[test]
        fn fs_store_resolve_hides_dot_entries() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            fs::create_dir_all(root.join(".obsidian")).expect("mkdir hidden");
            fs::write(root.join(".obsidian/cache.md"), "# hidden").expect("write hidden");
            fs::write(root.join(".draft.md"), "# draft").expect("write dotfile");
            fs::write(root.join("visible.md"), "# visible").expect("write visible");

            let store = FsDocumentStore::new(root);
            assert!(store.resolve_path(".obsidian/cache.md").is_none());
            assert!(store.resolve_path(".draft.md").is_none());
            assert!(store.resolve_path("visible.md").is_some());
        }

        #[test]
        fn memory_store_keeps_insertion_order() {
            let store = MemoryStore::new()
                .with_document("b.md", "# B", DateTime::<Utc>::default())
                .with_document("a.md", "# A", DateTime::<Utc>::default());

            let paths: Vec<String> = store
                .list_documents()
                .expect("list")
                .into_iter()
                .map(|doc| doc.path)
                .collect();
            assert_eq!(paths, vec!["b.md", "a.md"]);
            assert!(store.resolve_path("a.md").is_some());
            assert!(matches!(
                store.read_document("c.md"),
                Err(StoreError::NotFound(_))
            ));
        }
    }
}

pub mod parser {
    //! Line-oriented section parser built on `nom`.
    //!
    //! Only three kinds of line matter:
    //! - headings: up to 3 leading spaces, 1-6 `#`, whitespace, title (closing `#`s dropped)
    //! - metadata bullets: `- Key: Value`, key up to the first colon
    //! - label citations: `\label{ID}`, anywhere in a line, possibly several per line
    //!
    //! Everything else is prose and is skipped.

    use crate::core::{Entry, Section};
    use nom::{
        IResult,
        bytes::complete::{is_not, tag, take_while, take_while_m_n, take_while1},
        character::complete::char,
        combinator::recognize,
        error::{Error, ErrorKind},
        sequence::{delimited, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T>;

    const LABEL_OPEN: &str = "\\label{";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeadingLine<'a> {
        pub level: usize,
        pub title: &'a str,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MetadataLine<'a> {
        pub key: &'a str,
        pub value: &'a str,
    }

    /* ------------------------------ Lines ------------------------------ */

    /// 1-based lines split on `\n`, each with one trailing `\r` removed.
    ///
    /// A trailing newline produces a final empty line, which still counts as the
    /// last line of the document.
    pub fn document_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
        text.split('\n')
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.strip_suffix('\r').unwrap_or(line)))
    }

    /* ------------------------------ Grammar ------------------------------ */

    pub fn heading_line(line: &str) -> PResult<'_, HeadingLine<'_>> {
        let (i, _) = take_while_m_n(0, 3, char::is_whitespace)(line)?;
        let (i, marks) = take_while_m_n(1, 6, |c: char| c == '#')(i)?;
        let (i, _) = take_while1(char::is_whitespace)(i)?;
        let title = strip_closing_sequence(i);
        if title.is_empty() {
            return Err(nom::Err::Error(Error::new(i, ErrorKind::Verify)));
        }
        Ok((
            "",
            HeadingLine {
                level: marks.len(),
                title,
            },
        ))
    }

    /// Shortest non-empty prefix of `raw` followed only by an optional run of `#`
    /// padded with whitespace.
    fn strip_closing_sequence(raw: &str) -> &str {
        raw.char_indices()
            .map(|(idx, c)| &raw[..idx + c.len_utf8()])
            .find(|title| is_closing_sequence(&raw[title.len()..]))
            .unwrap_or(raw)
    }

    fn is_closing_sequence(rest: &str) -> bool {
        rest.trim().chars().all(|c| c == '#')
    }

    /// `-` (optionally indented) followed by at least one whitespace character.
    pub fn bullet_prefix(line: &str) -> PResult<'_, &str> {
        recognize(tuple((
            take_while(char::is_whitespace),
            char('-'),
            take_while1(char::is_whitespace),
        )))(line)
    }

    pub fn metadata_line(line: &str) -> PResult<'_, MetadataLine<'_>> {
        let (i, _) = bullet_prefix(line)?;
        let (i, key) = take_while1(|c: char| c != ':')(i)?;
        let (value, _) = char(':')(i)?;
        Ok((
            "",
            MetadataLine {
                key: key.trim(),
                value: value.trim(),
            },
        ))
    }

    pub fn label_citation(i: &str) -> PResult<'_, &str> {
        delimited(tag(LABEL_OPEN), is_not("}"), char('}'))(i)
    }

    /// Trimmed, non-empty label IDs in the order they appear on the line.
    pub fn extract_labels(line: &str) -> Vec<&str> {
        let mut labels = Vec::new();
        let mut rest = line;
        while let Some(start) = rest.find(LABEL_OPEN) {
            match label_citation(&rest[start..]) {
                Ok((after, id)) => {
                    let id = id.trim();
                    if !id.is_empty() {
                        labels.push(id);
                    }
                    rest = after;
                }
                Err(_) => rest = &rest[start + 1..],
            }
        }
        labels
    }

    /* ------------------------------ Sections ------------------------------ */

    /// Partition `text` into headed sections.
    ///
    /// Lines before the first heading belong to no section. A section ends on the
    /// line before the next heading, or on the document's last line.
    pub fn parse_sections(text: &str) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut current: Option<Section> = None;
        let mut last_line = 0;

        for (number, line) in document_lines(text) {
            last_line = number;

            if let Ok((_, heading)) = heading_line(line) {
                if let Some(mut open) = current.take() {
                    open.end_line = number - 1;
                    sections.push(open);
                }
                current = Some(Section::open(heading.title, number));
                continue;
            }

            let Some(section) = current.as_mut() else {
                continue;
            };

            if let Ok((_, meta)) = metadata_line(line) {
                section.entries.push(Entry {
                    key: meta.key.to_string(),
                    value: meta.value.to_string(),
                    line: number,
                });
            }

            for label in extract_labels(line) {
                section.add_label(label);
            }
        }

        if let Some(mut open) = current {
            open.end_line = last_line;
            sections.push(open);
        }

        sections
    }

}

pub mod categories {
    //! Alias-aware category lookup.
    //!
    //! Keys are compared after `normalize_key`: trimmed, internal whitespace runs
    //! collapsed to one space, lower-cased.

    use crate::core::Category;
    use indexmap::{IndexMap, IndexSet};
    use serde::Serialize;
    use std::collections::HashMap;

    pub fn normalize_key(raw: &str) -> String {
        raw.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    /// Normalized name or alias -> canonical category name.
    ///
    /// Later categories overwrite earlier ones on a key clash; configuration is
    /// expected to keep keys unique (see [`find_collisions`]).
    #[derive(Debug, Clone, Default)]
    pub struct CategoryResolver {
        lookup: HashMap<String, String>,
    }

    impl CategoryResolver {
        pub fn new(categories: &[Category]) -> Self {
            let mut lookup = HashMap::new();
            for category in categories {
                let canonical = category.name.trim();
                if canonical.is_empty() {
                    continue;
                }
                for spelling in spellings(category) {
                    let key = normalize_key(spelling);
                    if !key.is_empty() {
                        lookup.insert(key, canonical.to_string());
                    }
                }
            }
            Self { lookup }
        }

        pub fn resolve(&self, name: &str) -> Option<&str> {
            self.lookup.get(&normalize_key(name)).map(String::as_str)
        }

        pub fn is_known(&self, name: &str) -> bool {
            self.resolve(name).is_some()
        }

        /// Canonical names for `requested`, first occurrence order, unknown names dropped.
        pub fn resolve_category_names<S: AsRef<str>>(&self, requested: &[S]) -> Vec<String> {
            requested
                .iter()
                .filter_map(|name| self.resolve(name.as_ref()))
                .map(str::to_string)
                .collect::<IndexSet<_>>()
                .into_iter()
                .collect()
        }
    }

    fn spellings(category: &Category) -> impl Iterator<Item = &str> {
        std::iter::once(category.name.as_str()).chain(category.aliases.iter().map(String::as_str))
    }

    /// Two different categories claiming the same normalized key.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct CategoryCollision {
        pub key: String,
        /// Category that claimed the key first.
        pub first: String,
        /// Category whose name or alias clashes with it (and wins in the resolver).
        pub second: String,
    }

    pub fn find_collisions(categories: &[Category]) -> Vec<CategoryCollision> {
        let mut owners: IndexMap<String, usize> = IndexMap::new();
        let mut collisions = Vec::new();

        for (idx, category) in categories.iter().enumerate() {
            let canonical = category.name.trim();
            if canonical.is_empty() {
                continue;
            }
            let mut claimed = IndexSet::new();
            for spelling in spellings(category) {
                let key = normalize_key(spelling);
                if key.is_empty() || !claimed.insert(key.clone()) {
                    continue;
                }
                match owners.get(&key).copied() {
                    Some(owner) if owner != idx => collisions.push(CategoryCollision {
                        key: key.clone(),
                        first: categories[owner].name.trim().to_string(),
                        second: canonical.to_string(),
                    }),
                    Some(_) => {}
                    None => {
                        owners.insert(key, idx);
                    }
                }
            }
        }

        collisions
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn categories() -> Vec<Category> {
            vec![
                Category::new("Definition").with_aliases(["Def.", "Defn"]),
                Category::new("Theorem").with_aliases(["Thm"]),
                Category::new("  Proof   Sketch "),
            ]
        }

        #[test]
        fn normalize_trims_collapses_and_lowercases() {
            assert_eq!(normalize_key("  Proof \t  status "), "proof status");
            assert_eq!(normalize_key("DEF."), "def.");
            assert_eq!(normalize_key("   "), "");
        }

        #[test]
        fn alias_spellings_resolve_to_same_canonical() {
            let resolver = CategoryResolver::new(&categories());
            for spelling in ["  Def.  ", "def.", "DEF.", "definition", "defn"] {
                assert_eq!(resolver.resolve(spelling), Some("Definition"), "{spelling}");
            }
            assert_eq!(resolver.resolve("proof sketch"), Some("Proof   Sketch"));
            assert_eq!(resolver.resolve("Lemma"), None);
        }

        #[test]
        fn resolve_names_dedups_and_drops_unknown() {
            let resolver = CategoryResolver::new(&categories());
            let resolved = resolver.resolve_category_names(&["thm", "Lemma", "Def.", "Theorem"]);
            assert_eq!(resolved, vec!["Theorem", "Definition"]);
            assert!(resolver.resolve_category_names::<&str>(&[]).is_empty());
        }

        #[test]
        fn later_category_wins_on_collision() {
            let clashing = vec![
                Category::new("Lemma").with_aliases(["Claim"]),
                Category::new("Proposition").with_aliases(["claim"]),
            ];
            let resolver = CategoryResolver::new(&clashing);
            assert_eq!(resolver.resolve("CLAIM"), Some("Proposition"));

            let collisions = find_collisions(&clashing);
            assert_eq!(
                collisions,
                vec![CategoryCollision {
                    key: "claim".into(),
                    first: "Lemma".into(),
                    second: "Proposition".into(),
                }]
            );
        }

        #[test]
        fn self_overlap_is_not_a_collision() {
            let cats = vec![Category::new("Lemma").with_aliases(["lemma", " LEMMA "])];
            assert!(find_collisions(&cats).is_empty());
        }

        #[test]
        fn blank_category_names_are_ignored() {
            let cats = vec![Category::new("  ").with_aliases(["ghost"])];
            let resolver = CategoryResolver::new(&cats);
            assert!(!resolver.is_known("ghost"));
        }
    }
}

pub mod config {
    //! Configuration snapshot consumed by queries.
    //!
    //! Loaded from TOML; every field has a default so a partial file is fine.

    use crate::categories::{CategoryCollision, find_collisions, normalize_key};
    use crate::core::{Category, GroupMode, SearchScope, SortMode, SuperCategory};
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    pub const DEFAULT_PROOF_STATUS_KEY: &str = "Proof status";

    /// Vault-local config file name.
    pub const CONFIG_FILE_NAME: &str = ".headref.toml";

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("failed to read config {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("invalid config {path:?}")]
        Parse {
            path: PathBuf,
            #[source]
            source: toml::de::Error,
        },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        pub categories: Vec<Category>,
        pub super_categories: Vec<SuperCategory>,
        /// Extra bullet keys the validator accepts besides categories and labels.
        pub metadata_keys: Vec<String>,
        pub proof_status_key: String,
        pub default_scope: SearchScope,
        pub sort_mode: SortMode,
        pub group_mode: GroupMode,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                categories: default_categories(),
                super_categories: vec![SuperCategory {
                    name: "Propositions".into(),
                    categories: ["Theorem", "Proposition", "Corollary", "Lemma"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                }],
                metadata_keys: ["Uses", "Depends on", "Generalizes"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                proof_status_key: DEFAULT_PROOF_STATUS_KEY.to_string(),
                default_scope: SearchScope::Vault,
                sort_mode: SortMode::Category,
                group_mode: GroupMode::None,
            }
        }
    }

    fn default_categories() -> Vec<Category> {
        [
            "General",
            "Definition",
            "Theorem",
            "Proposition",
            "Corollary",
            "Lemma",
        ]
        .into_iter()
        .map(Category::new)
        .collect()
    }

    impl Settings {
        /// Parse TOML text and normalize the result.
        pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
            toml::from_str::<Settings>(text).map(Settings::normalized)
        }

        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }

        /// `~/.config/headref/config.toml` (platform equivalent elsewhere).
        pub fn global_config_path() -> Option<PathBuf> {
            dirs::config_dir().map(|p| p.join("headref").join("config.toml"))
        }

        /// First existing config among the vault-local file and the global one.
        pub fn discover(vault_root: &Path) -> Result<Option<(PathBuf, Self)>, ConfigError> {
            let candidates = std::iter::once(vault_root.join(CONFIG_FILE_NAME))
                .chain(Self::global_config_path());
            for candidate in candidates {
                if candidate.is_file() {
                    let settings = Self::load(&candidate)?;
                    return Ok(Some((candidate, settings)));
                }
            }
            Ok(None)
        }

        /// Trim names, drop blank categories/aliases/members, dedup aliases.
        pub fn normalized(mut self) -> Self {
            self.categories = self
                .categories
                .into_iter()
                .filter_map(|category| {
                    let name = category.name.trim().to_string();
                    if name.is_empty() {
                        return None;
                    }
                    let mut seen = vec![normalize_key(&name)];
                    let mut aliases = Vec::new();
                    for alias in category.aliases {
                        let alias = alias.trim().to_string();
                        let key = normalize_key(&alias);
                        if key.is_empty() || seen.contains(&key) {
                            continue;
                        }
                        seen.push(key);
                        aliases.push(alias);
                    }
                    Some(Category { name, aliases })
                })
                .collect();

            self.super_categories = self
                .super_categories
                .into_iter()
                .filter_map(|group| {
                    let name = group.name.trim().to_string();
                    if name.is_empty() {
                        return None;
                    }
                    let categories = group
                        .categories
                        .into_iter()
                        .map(|member| member.trim().to_string())
                        .filter(|member| !member.is_empty())
                        .collect();
                    Some(SuperCategory { name, categories })
                })
                .collect();

            self.metadata_keys = self
                .metadata_keys
                .into_iter()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect();

            let proof_key = self.proof_status_key.trim();
            self.proof_status_key = if proof_key.is_empty() {
                DEFAULT_PROOF_STATUS_KEY.to_string()
            } else {
                proof_key.to_string()
            };

            self
        }

        pub fn category_names(&self) -> Vec<String> {
            self.categories.iter().map(|c| c.name.clone()).collect()
        }

        pub fn super_category(&self, name: &str) -> Option<&SuperCategory> {
            let key = normalize_key(name);
            self.super_categories
                .iter()
                .find(|group| normalize_key(&group.name) == key)
        }

        /// Name/alias clashes across categories; meant to be shown when the config is edited.
        pub fn collisions(&self) -> Vec<CategoryCollision> {
            find_collisions(&self.categories)
        }
    }

}

pub mod search {
    //! Query layer: scope selection, per-file parsing, filtering, deterministic ordering.

    use crate::categories::{CategoryResolver, normalize_key};
    use crate::config::Settings;
    use crate::core::*;
    use crate::parser::parse_sections;
    use crate::storage::DocumentStore;
    use crate::validate::{MetadataVocabulary, sort_issues, validate_document};
    use indexmap::{IndexMap, IndexSet};
    use log::{debug, trace, warn};
    use std::cmp::Ordering;
    use uuid::Uuid;

    pub const LABEL_PARENT: &str = "Label";
    pub const PROOF_STATUS_PARENT: &str = "Proof Status";

    /// Normalized proof statuses that mark a section as unfinished.
    pub const INCOMPLETE_STATUSES: [&str; 5] = ["draft", "review", "todo", "incomplete", "wip"];

    const LABEL_KEY: &str = "label";
    const USES_KEY: &str = "uses";
    const DEPENDS_ON_KEY: &str = "depends on";
    const GENERALIZES_KEY: &str = "generalizes";

    /* ----------------------------- Shared helpers ----------------------------- */

    /// Normalized key -> trimmed values, keeping entry order; repeated keys accumulate.
    pub fn build_metadata(entries: &[Entry]) -> IndexMap<String, Vec<String>> {
        let mut metadata: IndexMap<String, Vec<String>> = IndexMap::new();
        for entry in entries {
            metadata
                .entry(normalize_key(&entry.key))
                .or_default()
                .push(entry.value.trim().to_string());
        }
        metadata
    }

    pub fn compare_headers(a: &Header, b: &Header, mode: SortMode) -> Ordering {
        let primary = match mode {
            SortMode::Recency => b.modified_time.cmp(&a.modified_time),
            SortMode::File => a.file_path.cmp(&b.file_path),
            SortMode::Category => a.parent.cmp(&b.parent),
        };
        primary
            .then_with(|| a.header.cmp(&b.header))
            .then_with(|| a.name.cmp(&b.name))
    }

    /// Stable sort: mode tier first, then header, then name.
    pub fn sort_headers(headers: &mut [Header], mode: SortMode) {
        headers.sort_by(|a, b| compare_headers(a, b, mode));
    }

    /// Bucket an ordered list by category or file, keeping first-appearance order.
    ///
    /// `GroupMode::None` yields a single bucket with an empty key.
    pub fn group_headers(headers: Vec<Header>, mode: GroupMode) -> Vec<(String, Vec<Header>)> {
        let mut groups: IndexMap<String, Vec<Header>> = IndexMap::new();
        for header in headers {
            let key = match mode {
                GroupMode::None => String::new(),
                GroupMode::Category => header.parent.clone(),
                GroupMode::File => header.file_path.clone(),
            };
            groups.entry(key).or_default().push(header);
        }
        groups.into_iter().collect()
    }

    /// Narrow `documents` to the scope. Without an anchor every scope means the whole vault.
    pub fn select_documents(
        documents: Vec<DocumentInfo>,
        scope: SearchScope,
        anchor_path: Option<&str>,
    ) -> Vec<DocumentInfo> {
        let Some(anchor) = anchor_path else {
            return documents;
        };
        match scope {
            SearchScope::Vault => documents,
            SearchScope::CurrentFile => documents
                .into_iter()
                .filter(|doc| doc.path == anchor)
                .collect(),
            SearchScope::CurrentFolder => {
                let folder = folder_of(anchor);
                documents
                    .into_iter()
                    .filter(|doc| doc.folder() == folder)
                    .collect()
            }
        }
    }

    fn first_value<'m>(metadata: &'m IndexMap<String, Vec<String>>, key: &str) -> Option<&'m str> {
        metadata
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn values_of(metadata: &IndexMap<String, Vec<String>>, key: &str) -> Vec<String> {
        metadata.get(key).cloned().unwrap_or_default()
    }

    fn uniform_index(len: usize) -> usize {
        // The low 62 bits of a v4 uuid are all random, so the modulo bias for
        // result-list sizes is negligible.
        (Uuid::new_v4().as_u128() % len as u128) as usize
    }

    /* --------------------------------- Engine --------------------------------- */

    /// One parsed section together with the document it came from.
    struct SectionContext<'q> {
        document: &'q DocumentInfo,
        section: &'q Section,
        metadata: &'q IndexMap<String, Vec<String>>,
    }

    impl SectionContext<'_> {
        fn header(&self, parent: &str, name: &str) -> Header {
            Header {
                parent: parent.to_string(),
                name: name.to_string(),
                header: self.section.header.clone(),
                file: strip_extension(&self.document.path).to_string(),
                file_path: self.document.path.clone(),
                modified_time: self.document.modified_time,
                labels: self.section.labels.clone(),
                metadata: self.metadata.clone(),
            }
        }
    }

    /// Query entry point over a document store and a borrowed settings snapshot.
    ///
    /// The settings cannot change while the engine holds them, so every query
    /// observes one consistent configuration.
    pub struct ReferenceEngine<'a, S: DocumentStore + ?Sized> {
        store: &'a S,
        settings: &'a Settings,
        resolver: CategoryResolver,
    }

    impl<'a, S: DocumentStore + ?Sized> ReferenceEngine<'a, S> {
        pub fn new(store: &'a S, settings: &'a Settings) -> Self {
            Self {
                store,
                settings,
                resolver: CategoryResolver::new(&settings.categories),
            }
        }

        pub fn settings(&self) -> &Settings {
            self.settings
        }

        pub fn resolver(&self) -> &CategoryResolver {
            &self.resolver
        }

        /// Every entry whose key resolves to one of `category_names`.
        ///
        /// Returns nothing when none of the names resolve.
        pub fn search_references<N: AsRef<str>>(
            &self,
            category_names: &[N],
            options: &SearchOptions,
        ) -> Result<Vec<Header>, StoreError> {
            let targets = self.resolver.resolve_category_names(category_names);
            if targets.is_empty() {
                debug!("event=search_references module=search status=skipped reason=no_categories");
                return Ok(Vec::new());
            }

            self.collect(options, |ctx, out| {
                for entry in &ctx.section.entries {
                    let Some(canonical) = self.resolver.resolve(&entry.key) else {
                        continue;
                    };
                    let value = entry.value.trim();
                    if value.is_empty() || !targets.iter().any(|t| t == canonical) {
                        continue;
                    }
                    out.push(ctx.header(canonical, value));
                }
            })
        }

        /// `search_references` over the members of a configured super category.
        pub fn search_super_category(
            &self,
            name: &str,
            options: &SearchOptions,
        ) -> Result<Vec<Header>, StoreError> {
            match self.settings.super_category(name) {
                Some(group) => self.search_references(&group.categories, options),
                None => {
                    debug!("event=search_super_category module=search status=unknown name={name}");
                    Ok(Vec::new())
                }
            }
        }

        /// One hit per label: inline `\label{..}` citations plus `Label` bullets.
        pub fn search_by_labels(&self, options: &SearchOptions) -> Result<Vec<Header>, StoreError> {
            self.collect(options, |ctx, out| {
                let mut labels: IndexSet<&str> =
                    ctx.section.labels.iter().map(String::as_str).collect();
                if let Some(values) = ctx.metadata.get(LABEL_KEY) {
                    labels.extend(values.iter().map(String::as_str).filter(|v| !v.is_empty()));
                }
                for label in labels {
                    out.push(ctx.header(LABEL_PARENT, label));
                }
            })
        }

        /// Sections whose first proof-status value is one of [`INCOMPLETE_STATUSES`].
        pub fn list_proofs_to_finish(
            &self,
            options: &SearchOptions,
        ) -> Result<Vec<Header>, StoreError> {
            let status_key = normalize_key(&self.settings.proof_status_key);
            self.collect(options, |ctx, out| {
                let Some(status) = first_value(ctx.metadata, &status_key) else {
                    return;
                };
                if INCOMPLETE_STATUSES.contains(&normalize_key(status).as_str()) {
                    let name = format!("{status}: {}", ctx.section.header);
                    out.push(ctx.header(PROOF_STATUS_PARENT, &name));
                }
            })
        }

        pub fn get_random_reference<N: AsRef<str>>(
            &self,
            category_names: &[N],
            options: &SearchOptions,
        ) -> Result<Option<Header>, StoreError> {
            self.get_random_reference_with(category_names, options, uniform_index)
        }

        /// Like [`Self::get_random_reference`], with the index drawn by `pick(len)`.
        ///
        /// `pick` is only called for non-empty results; out-of-range picks yield `None`.
        pub fn get_random_reference_with<N, F>(
            &self,
            category_names: &[N],
            options: &SearchOptions,
            pick: F,
        ) -> Result<Option<Header>, StoreError>
        where
            N: AsRef<str>,
            F: FnOnce(usize) -> usize,
        {
            let mut headers = self.search_references(category_names, options)?;
            if headers.is_empty() {
                return Ok(None);
            }
            let idx = pick(headers.len());
            if idx >= headers.len() {
                return Ok(None);
            }
            Ok(Some(headers.swap_remove(idx)))
        }

        /// Prerequisite metadata of the section covering `line_number` (1-based).
        pub fn get_prerequisites_for_location(
            &self,
            file_path: &str,
            line_number: usize,
        ) -> Option<PrerequisiteInfo> {
            let document = self.store.resolve_path(file_path)?;
            let text = self.read_or_skip(&document)?;
            let sections = parse_sections(&text);
            let section = sections.iter().find(|s| s.contains_line(line_number))?;
            let metadata = build_metadata(&section.entries);
            let status_key = normalize_key(&self.settings.proof_status_key);

            Some(PrerequisiteInfo {
                header: section.header.clone(),
                file_path: document.path.clone(),
                uses: values_of(&metadata, USES_KEY),
                depends_on: values_of(&metadata, DEPENDS_ON_KEY),
                generalizes: values_of(&metadata, GENERALIZES_KEY),
                proof_status: first_value(&metadata, &status_key).map(str::to_string),
            })
        }

        /// Metadata findings for every document in scope, ordered by path then line.
        pub fn validate_metadata(
            &self,
            scope: SearchScope,
            anchor_path: Option<&str>,
        ) -> Result<Vec<ValidationIssue>, StoreError> {
            let vocabulary = MetadataVocabulary::new(self.settings, &self.resolver);
            let documents = self.documents_in_scope(scope, anchor_path)?;
            let mut issues = Vec::new();
            for document in &documents {
                let Some(text) = self.read_or_skip(document) else {
                    continue;
                };
                issues.extend(validate_document(&document.path, &text, &vocabulary));
            }
            sort_issues(&mut issues);
            debug!(
                "event=validate_metadata module=search status=ok files={} issues={}",
                documents.len(),
                issues.len()
            );
            Ok(issues)
        }

        /* ------------------------------ internals ------------------------------ */

        fn documents_in_scope(
            &self,
            scope: SearchScope,
            anchor_path: Option<&str>,
        ) -> Result<Vec<DocumentInfo>, StoreError> {
            let all = self.store.list_documents()?;
            let selected = select_documents(all, scope, anchor_path);
            debug!(
                "event=select_documents module=search scope={} files={}",
                scope,
                selected.len()
            );
            Ok(selected)
        }

        /// Unreadable documents are logged and skipped so one bad file cannot sink a scan.
        fn read_or_skip(&self, document: &DocumentInfo) -> Option<String> {
            match self.store.read_document(&document.path) {
                Ok(text) => Some(text),
                Err(err) => {
                    warn!(
                        "event=read_document module=search status=skipped path={} error={}",
                        document.path, err
                    );
                    None
                }
            }
        }

        fn collect<F>(&self, options: &SearchOptions, mut emit: F) -> Result<Vec<Header>, StoreError>
        where
            F: FnMut(&SectionContext<'_>, &mut Vec<Header>),
        {
            let documents = self.documents_in_scope(options.scope, options.anchor_path.as_deref())?;
            let mut headers = Vec::new();
            for document in &documents {
                let Some(text) = self.read_or_skip(document) else {
                    continue;
                };
                let sections = parse_sections(&text);
                trace!(
                    "event=parse_document module=search path={} sections={}",
                    document.path,
                    sections.len()
                );
                for section in &sections {
                    let metadata = build_metadata(&section.entries);
                    let ctx = SectionContext {
                        document,
                        section,
                        metadata: &metadata,
                    };
                    emit(&ctx, &mut headers);
                }
            }
            sort_headers(&mut headers, options.sort_mode);
            debug!(
                "event=collect_headers module=search status=ok files={} results={}",
                documents.len(),
                headers.len()
            );
            Ok(headers)
        }
    }

}

pub mod validate {
    //! Metadata well-formedness checks.
    //!
    //! Works on raw lines rather than parsed sections: the section parser silently
    //! drops malformed bullets, and those are exactly what gets reported here.

    use crate::categories::{CategoryResolver, normalize_key};
    use crate::config::Settings;
    use crate::core::ValidationIssue;
    use crate::parser::{bullet_prefix, document_lines, heading_line, metadata_line};
    use std::collections::HashSet;

    pub const MALFORMED_BULLET: &str = "Bullet metadata is malformed. Expected `- Key: Value`.";
    pub const METADATA_BEFORE_HEADER: &str = "Metadata appears before any markdown header.";
    pub const EMPTY_VALUE: &str = "Metadata value is empty.";

    /// Bullet keys the validator accepts.
    pub struct MetadataVocabulary<'a> {
        keys: HashSet<String>,
        resolver: &'a CategoryResolver,
    }

    impl<'a> MetadataVocabulary<'a> {
        pub fn new(settings: &Settings, resolver: &'a CategoryResolver) -> Self {
            let mut keys: HashSet<String> = settings
                .metadata_keys
                .iter()
                .map(|key| normalize_key(key))
                .collect();
            keys.insert(normalize_key(&settings.proof_status_key));
            keys.insert("label".to_string());
            Self { keys, resolver }
        }

        pub fn is_known(&self, raw_key: &str) -> bool {
            self.keys.contains(&normalize_key(raw_key)) || self.resolver.is_known(raw_key)
        }
    }

    fn unknown_key_message(raw_key: &str) -> String {
        format!("Unknown metadata key: `{raw_key}`.")
    }

    /// Findings for one document, in line order.
    pub fn validate_document(
        path: &str,
        text: &str,
        vocabulary: &MetadataVocabulary<'_>,
    ) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut inside_header = false;
        let mut report = |line: usize, message: String| {
            issues.push(ValidationIssue {
                file_path: path.to_string(),
                line,
                message,
            })
        };

        for (number, line) in document_lines(text) {
            if line.trim().is_empty() {
                continue;
            }
            if heading_line(line).is_ok() {
                inside_header = true;
                continue;
            }

            let meta = match metadata_line(line) {
                Ok((_, meta)) => meta,
                Err(_) => {
                    if bullet_prefix(line).is_ok() {
                        report(number, MALFORMED_BULLET.to_string());
                    }
                    continue;
                }
            };

            if !inside_header {
                report(number, METADATA_BEFORE_HEADER.to_string());
                continue;
            }
            if meta.value.is_empty() {
                report(number, EMPTY_VALUE.to_string());
            }
            if !vocabulary.is_known(meta.key) {
                report(number, unknown_key_message(meta.key));
            }
        }

        issues
    }

    /// By file path, then line; stable within a line.
    pub fn sort_issues(issues: &mut [ValidationIssue]) {
        issues.sort_by(|a, b| a.file_path.cmp(&b.file_path).then(a.line.cmp(&b.line)));
    }

}

pub use categories::{CategoryResolver, normalize_key};
pub use config::Settings;
pub use crate::core::{
    Category, DocumentInfo, Entry, GroupMode, Header, PrerequisiteInfo, SearchOptions,
    SearchScope, Section, SortMode, StoreError, SuperCategory, ValidationIssue,
};
pub use parser::parse_sections;
pub use search::{ReferenceEngine, group_headers, sort_headers};
pub use storage::{DocumentStore, FsDocumentStore, MemoryStore};
