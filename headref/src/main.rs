use std::{
    io::{self, Write},
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use headref::config::Settings;
use headref::core::{GroupMode, Header, SearchOptions, SearchScope, SortMode};
use headref::parser::parse_sections;
use headref::search::{ReferenceEngine, group_headers};
use headref::storage::{DocumentStore, FsDocumentStore};
use log::{debug, info, warn};

const RANDOM_DEFAULT_CATEGORIES: [&str; 2] = ["Theorem", "Definition"];

#[derive(Debug, Parser)]
#[command(
    name = "headref",
    about = "Index and query header references in a markdown vault",
    version
)]
struct Cli {
    /// Vault root directory.
    #[arg(long, global = true, default_value = ".")]
    vault: PathBuf,
    /// Config file. Defaults to `<vault>/.headref.toml`, then the user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List references in the given categories (all configured categories by default).
    Search(SearchArgs),

    /// List every `\label{..}` and `Label:` entry.
    Labels(QueryArgs),

    /// List sections whose proof status marks them unfinished.
    Proofs(QueryArgs),

    /// Pick one reference at random.
    Random(RandomArgs),

    /// Show the prerequisites of the section covering a line.
    Prereqs(PrereqsArgs),

    /// Report malformed or unknown metadata bullets.
    Validate(ValidateArgs),

    /// Print the parsed sections of a single document.
    Sections(SectionsArgs),

    /// Print the effective configuration and any category clashes.
    CheckConfig,
}

#[derive(Debug, Args)]
struct QueryArgs {
    /// vault | current-file | current-folder (config default when omitted).
    #[arg(long)]
    scope: Option<SearchScope>,
    /// Document the query is issued from, relative to the vault.
    #[arg(long)]
    anchor: Option<String>,
    /// category | file | recency (config default when omitted).
    #[arg(long)]
    sort: Option<SortMode>,
    /// none | category | file (config default when omitted).
    #[arg(long)]
    group: Option<GroupMode>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
    /// Print wiki link text instead of the summary line.
    #[arg(long)]
    links: bool,
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Category names or aliases.
    categories: Vec<String>,
    /// Search the members of a super category instead.
    #[arg(long = "super", conflicts_with = "categories")]
    super_category: Option<String>,
    #[command(flatten)]
    query: QueryArgs,
}

#[derive(Debug, Args)]
struct RandomArgs {
    /// Category names or aliases. Defaults to Theorem and Definition.
    categories: Vec<String>,
    #[command(flatten)]
    query: QueryArgs,
}

#[derive(Debug, Args)]
struct PrereqsArgs {
    /// Document path relative to the vault.
    file: String,
    /// 1-based line number.
    line: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    scope: Option<SearchScope>,
    #[arg(long)]
    anchor: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SectionsArgs {
    /// Document path relative to the vault.
    file: String,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = init_logging(cli.verbose)?;

    let settings = load_settings(&cli.vault, cli.config.as_deref())?;
    let store = FsDocumentStore::new(&cli.vault);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Search(args) => handle_search(&store, &settings, args, &mut out),
        Commands::Labels(args) => handle_labels(&store, &settings, args, &mut out),
        Commands::Proofs(args) => handle_proofs(&store, &settings, args, &mut out),
        Commands::Random(args) => handle_random(&store, &settings, args, &mut out),
        Commands::Prereqs(args) => handle_prereqs(&store, &settings, args, &mut out),
        Commands::Validate(args) => handle_validate(&store, &settings, args, &mut out),
        Commands::Sections(args) => handle_sections(&store, args, &mut out),
        Commands::CheckConfig => handle_check_config(&settings, &mut out),
    }
}

fn init_logging(verbose: bool) -> Result<LoggerHandle> {
    let level = if verbose { "debug" } else { "warn" };
    Logger::try_with_env_or_str(level)
        .context("parsing log specification")?
        .log_to_stderr()
        .format(flexi_logger::default_format)
        .start()
        .context("starting logger")
}

fn load_settings(vault: &Path, explicit: Option<&Path>) -> Result<Settings> {
    let settings = match explicit {
        Some(path) => {
            Settings::load(path).with_context(|| format!("loading config {:?}", path))?
        }
        None => match Settings::discover(vault)? {
            Some((path, settings)) => {
                info!("event=config_load module=cli status=ok path={}", path.display());
                settings
            }
            None => {
                debug!("event=config_load module=cli status=defaults");
                Settings::default()
            }
        },
    };
    for clash in settings.collisions() {
        warn!(
            "event=category_collision module=cli key={} first={} second={}",
            clash.key, clash.first, clash.second
        );
    }
    Ok(settings)
}

/// Normalize a user-supplied path into the store's `/`-separated vault-relative form.
fn vault_relative(vault: &Path, raw: &str) -> String {
    let path = Path::new(raw);
    let relative = match path.strip_prefix(vault) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => canonical_relative(vault, path).unwrap_or_else(|| path.to_path_buf()),
    };
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_relative(vault: &Path, path: &Path) -> Option<PathBuf> {
    let vault = vault.canonicalize().ok()?;
    let path = path.canonicalize().ok()?;
    path.strip_prefix(&vault).ok().map(Path::to_path_buf)
}

fn search_options(store: &FsDocumentStore, settings: &Settings, query: &QueryArgs) -> SearchOptions {
    SearchOptions {
        scope: query.scope.unwrap_or(settings.default_scope),
        anchor_path: query
            .anchor
            .as_deref()
            .map(|anchor| vault_relative(store.root(), anchor)),
        sort_mode: query.sort.unwrap_or(settings.sort_mode),
    }
}

fn handle_search(
    store: &FsDocumentStore,
    settings: &Settings,
    args: SearchArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let SearchArgs {
        categories,
        super_category,
        query,
    } = args;
    let engine = ReferenceEngine::new(store, settings);
    let options = search_options(store, settings, &query);

    let headers = match super_category {
        Some(name) => {
            if settings.super_category(&name).is_none() {
                anyhow::bail!("unknown super category `{name}`");
            }
            engine.search_super_category(&name, &options)?
        }
        None if categories.is_empty() => {
            engine.search_references(&settings.category_names(), &options)?
        }
        None => engine.search_references(&categories, &options)?,
    };
    render_headers(out, headers, settings, &query)
}

fn handle_labels(
    store: &FsDocumentStore,
    settings: &Settings,
    query: QueryArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let engine = ReferenceEngine::new(store, settings);
    let headers = engine.search_by_labels(&search_options(store, settings, &query))?;
    render_headers(out, headers, settings, &query)
}

fn handle_proofs(
    store: &FsDocumentStore,
    settings: &Settings,
    query: QueryArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let engine = ReferenceEngine::new(store, settings);
    let headers = engine.list_proofs_to_finish(&search_options(store, settings, &query))?;
    render_headers(out, headers, settings, &query)
}

fn handle_random(
    store: &FsDocumentStore,
    settings: &Settings,
    args: RandomArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let RandomArgs { categories, query } = args;
    let categories = if categories.is_empty() {
        RANDOM_DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect()
    } else {
        categories
    };
    let engine = ReferenceEngine::new(store, settings);
    let picked =
        engine.get_random_reference(&categories, &search_options(store, settings, &query))?;
    render_headers(out, picked.into_iter().collect(), settings, &query)
}

fn handle_prereqs(
    store: &FsDocumentStore,
    settings: &Settings,
    args: PrereqsArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let PrereqsArgs { file, line, json } = args;
    let path = vault_relative(store.root(), &file);
    let engine = ReferenceEngine::new(store, settings);

    let Some(info) = engine.get_prerequisites_for_location(&path, line) else {
        eprintln!("No section covers {path}:{line}.");
        return Ok(());
    };

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
        return Ok(());
    }

    writeln!(out, "{} ({})", info.header, info.file_path)?;
    for (label, values) in [
        ("Uses", &info.uses),
        ("Depends on", &info.depends_on),
        ("Generalizes", &info.generalizes),
    ] {
        if !values.is_empty() {
            writeln!(out, "  {label}: {}", values.join(", "))?;
        }
    }
    if let Some(status) = &info.proof_status {
        writeln!(out, "  {}: {status}", settings.proof_status_key)?;
    }
    Ok(())
}

fn handle_validate(
    store: &FsDocumentStore,
    settings: &Settings,
    args: ValidateArgs,
    out: &mut dyn Write,
) -> Result<()> {
    let ValidateArgs {
        scope,
        anchor,
        json,
    } = args;
    let anchor = anchor.map(|anchor| vault_relative(store.root(), &anchor));
    let engine = ReferenceEngine::new(store, settings);
    let issues = engine.validate_metadata(
        scope.unwrap_or(settings.default_scope),
        anchor.as_deref(),
    )?;

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&issues)?)?;
    } else if issues.is_empty() {
        eprintln!("No metadata issues found.");
    } else {
        for issue in &issues {
            writeln!(out, "{}:{} - {}", issue.file_path, issue.line, issue.message)?;
        }
    }
    Ok(())
}

fn handle_sections(store: &FsDocumentStore, args: SectionsArgs, out: &mut dyn Write) -> Result<()> {
    let SectionsArgs { file, json } = args;
    let path = vault_relative(store.root(), &file);
    let text = store
        .read_document(&path)
        .with_context(|| format!("reading {path}"))?;
    let sections = parse_sections(&text);

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&sections)?)?;
        return Ok(());
    }
    if sections.is_empty() {
        eprintln!("No sections in {path}.");
        return Ok(());
    }
    for section in &sections {
        writeln!(
            out,
            "{}-{} {}",
            section.header_line, section.end_line, section.header
        )?;
        for entry in &section.entries {
            writeln!(out, "  {:>4}  {}: {}", entry.line, entry.key, entry.value)?;
        }
        if !section.labels.is_empty() {
            writeln!(out, "  labels: {}", section.labels.join(", "))?;
        }
    }
    Ok(())
}

fn handle_check_config(settings: &Settings, out: &mut dyn Write) -> Result<()> {
    let rendered = toml::to_string_pretty(settings).context("rendering config")?;
    write!(out, "{rendered}")?;
    let collisions = settings.collisions();
    if collisions.is_empty() {
        return Ok(());
    }
    writeln!(out)?;
    for clash in collisions {
        writeln!(
            out,
            "# `{}` is claimed by both {} and {}; {} wins",
            clash.key, clash.first, clash.second, clash.second
        )?;
    }
    Ok(())
}

fn render_headers(
    out: &mut dyn Write,
    headers: Vec<Header>,
    settings: &Settings,
    query: &QueryArgs,
) -> Result<()> {
    if headers.is_empty() && !query.json {
        eprintln!("No references found.");
        return Ok(());
    }

    let group_mode = query.group.unwrap_or(settings.group_mode);
    let groups = group_headers(headers, group_mode);

    if query.json {
        if group_mode == GroupMode::None {
            let flat: Vec<&Header> = groups.iter().flat_map(|(_, items)| items).collect();
            writeln!(out, "{}", serde_json::to_string_pretty(&flat)?)?;
        } else {
            #[derive(serde::Serialize)]
            struct JsonGroup<'a> {
                group: &'a str,
                headers: &'a [Header],
            }

            let payload: Vec<JsonGroup<'_>> = groups
                .iter()
                .map(|(group, headers)| JsonGroup { group, headers })
                .collect();
            writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
        }
        return Ok(());
    }

    for (idx, (group, items)) in groups.iter().enumerate() {
        if !group.is_empty() {
            if idx > 0 {
                writeln!(out)?;
            }
            writeln!(out, "== {group} ==")?;
        }
        for header in items {
            if query.links {
                writeln!(out, "{}", header.link_text())?;
            } else {
                writeln!(out, "{}", summary_line(header))?;
            }
        }
    }
    Ok(())
}

fn summary_line(header: &Header) -> String {
    format!(
        "{} | {} | {}#{}",
        header.name, header.parent, header.file_path, header.header
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn vault() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("topology")).expect("mkdir topology");
        fs::write(
            root.join("topology/compactness.md"),
            "## Theorem (Compactness)\n- Theorem: Every open cover has a finite subcover.\n- Uses: Heine-Borel\n\\label{thm:compactness}\n\n### Proof sketch\n- Proof status: draft\n- Depends on: Bolzano-Weierstrass\n",
        )
        .expect("write compactness");
        fs::write(
            root.join("index.md"),
            "- Theorem: too early\n# Index\n- Definition: vault\n- Mystery: ?\n- broken bullet\n",
        )
        .expect("write index");
        tmp
    }

    fn query() -> QueryArgs {
        QueryArgs {
            scope: None,
            anchor: None,
            sort: None,
            group: None,
            json: false,
            links: false,
        }
    }

    fn output(buf: Vec<u8>) -> String {
        String::from_utf8(buf).expect("utf8 output")
    }

    #[test]
    fn vault_relative_strips_root_and_dot_segments() {
        let root = Path::new("/notes");
        assert_eq!(vault_relative(root, "/notes/topology/a.md"), "topology/a.md");
        assert_eq!(vault_relative(root, "./topology/a.md"), "topology/a.md");
        assert_eq!(vault_relative(root, "index.md"), "index.md");
    }

    #[test]
    fn search_defaults_to_all_categories() {
        let tmp = vault();
        let store = FsDocumentStore::new(tmp.path());
        let settings = Settings::default();
        let args = SearchArgs {
            categories: vec![],
            super_category: None,
            query: query(),
        };

        let mut buf = Vec::new();
        handle_search(&store, &settings, args, &mut buf).expect("search");
        let text = output(buf);
        assert_eq!(
            text.lines().collect::<Vec<_>>(),
            vec![
                "vault | Definition | index.md#Index",
                "Every open cover has a finite subcover. | Theorem | topology/compactness.md#Theorem (Compactness)",
            ]
        );
    }

    #[test]
    fn search_links_and_grouping() {
        let tmp = vault();
        let store = FsDocumentStore::new(tmp.path());
        let settings = Settings::default();
        let mut q = query();
        q.links = true;
        q.group = Some(GroupMode::File);
        let args = SearchArgs {
            categories: vec!["theorem".into()],
            super_category: None,
            query: q,
        };

        let mut buf = Vec::new();
        handle_search(&store, &settings, args, &mut buf).expect("search");
        assert_eq!(
            output(buf),
            "== topology/compactness.md ==\n[[topology/compactness#Theorem (Compactness)|Every open cover has a finite subcover.]]\n"
        );
    }

    #[test]
    fn unknown_super_category_is_an_error() {
        let tmp = vault();
        let store = FsDocumentStore::new(tmp.path());
        let settings = Settings::default();
        let args = SearchArgs {
            categories: vec![],
            super_category: Some("Nope".into()),
            query: query(),
        };
        let mut buf = Vec::new();
        assert!(handle_search(&store, &settings, args, &mut buf).is_err());
    }

    #[test]
    fn proofs_json_lists_unfinished_sections() {
        let tmp = vault();
        let store = FsDocumentStore::new(tmp.path());
        let settings = Settings::default();
        let mut q = query();
        q.json = true;

        let mut buf = Vec::new();
        handle_proofs(&store, &settings, q, &mut buf).expect("proofs");
        let parsed: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(parsed[0]["name"], "draft: Proof sketch");
        assert_eq!(parsed[0]["parent"], "Proof Status");
        assert_eq!(parsed[0]["filePath"], "topology/compactness.md");
    }

    #[test]
    fn prereqs_prints_section_metadata() {
        let tmp = vault();
        let store = FsDocumentStore::new(tmp.path());
        let settings = Settings::default();
        let args = PrereqsArgs {
            file: "topology/compactness.md".into(),
            line: 7,
            json: false,
        };

        let mut buf = Vec::new();
        handle_prereqs(&store, &settings, args, &mut buf).expect("prereqs");
        assert_eq!(
            output(buf),
            "Proof sketch (topology/compactness.md)\n  Depends on: Bolzano-Weierstrass\n  Proof status: draft\n"
        );
    }

    #[test]
    fn validate_prints_sorted_findings() {
        let tmp = vault();
        let store = FsDocumentStore::new(tmp.path());
        let settings = Settings::default();
        let args = ValidateArgs {
            scope: None,
            anchor: None,
            json: false,
        };

        let mut buf = Vec::new();
        handle_validate(&store, &settings, args, &mut buf).expect("validate");
        assert_eq!(
            output(buf),
            "index.md:1 - Metadata appears before any markdown header.\n\
             index.md:4 - Unknown metadata key: `Mystery`.\n\
             index.md:5 - Bullet metadata is malformed. Expected `- Key: Value`.\n"
        );
    }

    #[test]
    fn sections_lists_line_ranges() {
        let tmp = vault();
        let store = FsDocumentStore::new(tmp.path());
        let args = SectionsArgs {
            file: "topology/compactness.md".into(),
            json: false,
        };

        let mut buf = Vec::new();
        handle_sections(&store, args, &mut buf).expect("sections");
        let text = output(buf);
        let headings: Vec<&str> = text.lines().filter(|l| !l.starts_with(' ')).collect();
        assert_eq!(headings, vec!["1-5 Theorem (Compactness)", "6-9 Proof sketch"]);
        assert!(text.contains("labels: thm:compactness"));
    }

    #[test]
    fn load_settings_prefers_explicit_file() {
        let tmp = vault();
        let config = tmp.path().join("custom.toml");
        fs::write(&config, "sort_mode = \"recency\"").expect("write config");
        fs::write(tmp.path().join(".headref.toml"), "sort_mode = \"file\"")
            .expect("write vault config");

        let explicit = load_settings(tmp.path(), Some(&config)).expect("explicit");
        assert_eq!(explicit.sort_mode, SortMode::Recency);

        let discovered = load_settings(tmp.path(), None).expect("discovered");
        assert_eq!(discovered.sort_mode, SortMode::File);
    }

    #[test]
    fn check_config_renders_toml() {
        let mut buf = Vec::new();
        handle_check_config(&Settings::default(), &mut buf).expect("render");
        let rendered = output(buf);
        let reparsed = Settings::from_toml_str(&rendered).expect("round trip");
        assert_eq!(reparsed, Settings::default());
    }
}
