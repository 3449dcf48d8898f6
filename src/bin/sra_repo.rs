use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use sra_repo::config::{ConfigLoader, RepoConfig};
use sra_repo::domain::{AccessionId, ProviderSite};
use sra_repo::error::{Missing, RepoError};
use sra_repo::output::{InfoResult, JsonOutput, LinkEntry, LinkResult, ListResult};
use sra_repo::pipeline::{FetchOptions, FetchPipeline, FetchReport};
use sra_repo::providers::providers_for_site;
use sra_repo::store::{ContentStore, LinkKind};
use sra_repo::toolkit::SystemToolkit;
use sra_repo::transfer::{HttpTransferClient, TransferEngine};
use sra_repo::validator::{ValidationReport, Validator};

#[derive(Parser)]
#[command(name = "sra-repo")]
#[command(about = "Local, integrity-verified mirror of SRA/ENA read accessions")]
#[command(version, author)]
struct Cli {
    /// Storage root (overrides `root` in the config file)
    #[arg(long, global = true)]
    rootfs: Option<Utf8PathBuf>,

    /// Config file (default: ./sra-repo.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create a storage root")]
    Init,
    #[command(about = "Fetch read files by accession")]
    Fetch(FetchArgs),
    #[command(about = "Check accessions in the repository")]
    Check(CheckArgs),
    #[command(about = "Link read files of accessions into a directory")]
    Link(LinkArgs),
    #[command(about = "Show read file paths")]
    Path(PathArgs),
    #[command(about = "Show stored validation info")]
    Info(IdArgs),
    #[command(about = "List accessions in the repository")]
    List(ListArgs),
    #[command(about = "Re-apply read-only permissions to entries")]
    FixPerms(IdArgs),
}

#[derive(Args, Clone)]
struct IdArgs {
    /// Accession ids
    ids: Vec<String>,

    /// File containing whitespace-separated accession ids
    #[arg(long)]
    idfile: Option<PathBuf>,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    input: IdArgs,

    /// Download even when the accession is already stored
    #[arg(long)]
    force: bool,

    #[arg(long)]
    tmpdir: Option<Utf8PathBuf>,

    /// Number of concurrent downloads
    #[arg(long)]
    ntasks: Option<usize>,

    /// Only fetch this many accessions from the list
    #[arg(long)]
    count: Option<usize>,

    #[arg(long)]
    reverselist: bool,

    /// Move downloaded files here instead of storing them
    #[arg(long)]
    targetdir: Option<PathBuf>,

    #[arg(long, value_enum)]
    site: Option<ProviderSite>,

    /// Log every download URL
    #[arg(long)]
    showurl: bool,
}

#[derive(Args)]
struct CheckArgs {
    // Every stored accession is checked when no ids are given.
    #[command(flatten)]
    input: IdArgs,

    /// Compare sizes and checksums, rebuilding missing validation info
    #[arg(long)]
    validate: bool,

    #[arg(long)]
    ntasks: Option<usize>,

    #[arg(long)]
    count: Option<usize>,

    #[arg(long, value_enum)]
    site: Option<ProviderSite>,
}

#[derive(Args)]
struct LinkArgs {
    #[command(flatten)]
    input: IdArgs,

    #[arg(long)]
    outdir: PathBuf,

    /// Create hard links instead of symlinks
    #[arg(long)]
    hard: bool,

    /// Only report what would be linked
    #[arg(long)]
    check: bool,
}

#[derive(Args)]
struct PathArgs {
    #[command(flatten)]
    input: IdArgs,

    /// Separate paths with newlines instead of spaces
    #[arg(long)]
    newline: bool,
}

#[derive(Args)]
struct ListArgs {
    /// Only list accessions containing one of these patterns
    patterns: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<RepoError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &RepoError) -> u8 {
    match error {
        RepoError::NotFound { .. }
        | RepoError::InvalidIdentifier(_)
        | RepoError::NotARepository(_)
        | RepoError::ConfigRead(_)
        | RepoError::ConfigParse(_) => 2,
        RepoError::RemoteNotFound { .. }
        | RepoError::RemoteError { .. }
        | RepoError::RemoteHttp { .. }
        | RepoError::Transfer(_)
        | RepoError::MissingTool(_)
        | RepoError::Tool(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let root = cli
        .rootfs
        .clone()
        .or_else(|| config.root.clone())
        .ok_or_else(|| miette::miette!("no storage root given (use --rootfs or `root` in the config)"))?;

    if let Commands::Init = cli.command {
        let store = ContentStore::init(&root)?;
        println!("initialised storage root at {}", store.root());
        return Ok(());
    }
    let store = ContentStore::open(root)?.with_lock_timeout(config.lock_timeout);

    match cli.command {
        Commands::Init => Ok(()),
        Commands::Fetch(args) => run_fetch(args, &store, &config, cli.json),
        Commands::Check(args) => run_check(args, &store, &config, cli.json),
        Commands::Link(args) => run_link(args, &store, cli.json),
        Commands::Path(args) => run_path(args, &store),
        Commands::Info(args) => run_info(args, &store, cli.json),
        Commands::List(args) => run_list(args, &store, cli.json),
        Commands::FixPerms(args) => run_fix_perms(args, &store),
    }
}

fn run_fetch(
    args: FetchArgs,
    store: &ContentStore,
    config: &RepoConfig,
    json: bool,
) -> miette::Result<()> {
    let ids = read_ids(&args.input)?;
    let providers = providers_for_site(args.site.unwrap_or(config.site))?;
    let toolkit = SystemToolkit::new(config.command_prefix.clone());
    let engine = TransferEngine::new(
        HttpTransferClient::new()?,
        args.ntasks.unwrap_or(config.ntasks),
    )
    .with_retries(config.retries)
    .with_submit_delay(config.submit_delay);
    let tmpdir = args.tmpdir.unwrap_or_else(|| config.tmpdir.clone());
    let pipeline = FetchPipeline::new(store, &providers, &toolkit, engine, tmpdir);

    let options = FetchOptions {
        force: args.force,
        count: args.count,
        reverse: args.reverselist,
        target_dir: args.targetdir,
        show_urls: args.showurl,
    };
    let report = pipeline.fetch(&ids, &options)?;
    if json {
        JsonOutput::print_fetch(&report).into_diagnostic()?;
    } else {
        print_fetch_summary(&report);
    }
    if report.is_clean() {
        Ok(())
    } else {
        Err(miette::miette!(
            "{} accession(s) were not fetched",
            report.errors.len() + report.unfinished.len()
        ))
    }
}

fn run_check(
    args: CheckArgs,
    store: &ContentStore,
    config: &RepoConfig,
    json: bool,
) -> miette::Result<()> {
    let mut ids = if args.input.ids.is_empty() && args.input.idfile.is_none() {
        let mut ids = store.list_entries()?.collect::<Vec<_>>();
        ids.sort();
        ids
    } else {
        parse_ids(&read_ids(&args.input)?)?
    };
    if let Some(count) = args.count {
        ids.truncate(count);
    }

    let providers = providers_for_site(args.site.unwrap_or(config.site))?;
    let toolkit = SystemToolkit::new(config.command_prefix.clone());
    let validator = Validator::new(
        store,
        &providers,
        &toolkit,
        args.ntasks.unwrap_or(config.ntasks),
    )
    .with_submit_delay(config.validate_delay)
    .with_full_validation(args.validate);
    let report = validator.validate(&ids);

    if json {
        JsonOutput::print_validation(&report).into_diagnostic()?;
    } else {
        print_validation_summary(&report, args.validate);
    }
    if report.errors.is_empty() && report.finished == report.total {
        Ok(())
    } else {
        Err(miette::miette!(
            "errors found in {} accession(s)",
            report.errors.len()
        ))
    }
}

fn run_link(args: LinkArgs, store: &ContentStore, json: bool) -> miette::Result<()> {
    if !args.outdir.is_dir() {
        return Err(miette::miette!(
            "directory {} does not exist, please create it first",
            args.outdir.display()
        ));
    }
    let kind = if args.hard {
        LinkKind::Hard
    } else {
        LinkKind::Symbolic
    };

    let mut result = LinkResult {
        linked: 0,
        accessions: Vec::new(),
    };
    for id in parse_ids(&read_ids(&args.input)?)? {
        match store.link_out(&id, &args.outdir, kind, args.check) {
            Ok(report) => {
                for name in &report.conflicts {
                    warn!("file {name} for {id} already exists in {}", args.outdir.display());
                }
                result.linked += report.linked.len();
                result.accessions.push(LinkEntry {
                    id: id.to_string(),
                    report,
                });
            }
            Err(RepoError::NotFound { .. }) => {
                warn!("{id} is not in the repository, please fetch it first");
            }
            Err(err) => return Err(err.into()),
        }
    }

    if json {
        JsonOutput::print_link(&result).into_diagnostic()?;
    } else {
        println!(
            "linked {} file(s) from {} accession(s)",
            result.linked,
            result.accessions.len()
        );
    }
    Ok(())
}

fn run_path(args: PathArgs, store: &ContentStore) -> miette::Result<()> {
    let mut paths = Vec::new();
    for id in parse_ids(&read_ids(&args.input)?)? {
        paths.extend(store.read_files(&id)?);
    }
    let separator = if args.newline { "\n" } else { " " };
    let output = paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(separator);
    println!("{output}");
    Ok(())
}

fn run_info(args: IdArgs, store: &ContentStore, json: bool) -> miette::Result<()> {
    let mut result = InfoResult {
        info: Vec::new(),
        errors: Vec::new(),
    };
    for id in parse_ids(&read_ids(&args)?)? {
        match store.read_info(&id) {
            Ok(info) => result.info.push(info),
            Err(RepoError::NotFound {
                missing: Missing::Sidecar,
                ..
            }) => result.errors.push(format!(
                "{id} does not have validation info, please run: sra-repo check --validate {id}"
            )),
            Err(err) => result.errors.push(err.to_string()),
        }
    }

    if json {
        JsonOutput::print_info(&result).into_diagnostic()?;
        return Ok(());
    }
    for info in &result.info {
        println!("{}", serde_json::to_string_pretty(info).into_diagnostic()?);
    }
    for error in &result.errors {
        eprintln!("{error}");
    }
    Ok(())
}

fn run_list(args: ListArgs, store: &ContentStore, json: bool) -> miette::Result<()> {
    let mut ids = store
        .list_entries()?
        .map(|id| id.to_string())
        .filter(|id| {
            args.patterns.is_empty()
                || args
                    .patterns
                    .iter()
                    .any(|pattern| id.contains(&pattern.to_uppercase()))
        })
        .collect::<Vec<_>>();
    ids.sort();
    let result = ListResult {
        total: ids.len(),
        ids,
    };

    if json {
        JsonOutput::print_list(&result).into_diagnostic()?;
    } else {
        for id in &result.ids {
            println!("{id}");
        }
        eprintln!("Total accessions: {}", result.total);
    }
    Ok(())
}

fn run_fix_perms(args: IdArgs, store: &ContentStore) -> miette::Result<()> {
    let ids = if args.ids.is_empty() && args.idfile.is_none() {
        store.list_entries()?.collect::<Vec<_>>()
    } else {
        parse_ids(&read_ids(&args)?)?
    };
    let mut files = 0;
    for id in &ids {
        files += store.fix_permissions(id)?;
    }
    println!("fixed permissions of {files} file(s) in {} entries", ids.len());
    Ok(())
}

fn read_ids(args: &IdArgs) -> miette::Result<Vec<String>> {
    let mut ids = Vec::new();
    if let Some(path) = &args.idfile {
        let content = fs::read_to_string(path).into_diagnostic()?;
        ids.extend(content.split_whitespace().map(str::to_string));
    }
    ids.extend(args.ids.iter().cloned());
    if ids.is_empty() {
        return Err(miette::miette!("no accession ids given"));
    }
    Ok(ids)
}

fn parse_ids(raw: &[String]) -> Result<Vec<AccessionId>, RepoError> {
    raw.iter()
        .filter(|id| !id.starts_with('#'))
        .map(|id| id.parse())
        .collect()
}

fn print_fetch_summary(report: &FetchReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!(
        "Total: {}  Existed: {}  Skipped: {}",
        report.total, report.existed, report.skipped
    );
    if report.is_clean() {
        println!(
            "{green}All {} accession(s) have been successfully downloaded.{reset}",
            report.completed
        );
        return;
    }
    println!(
        "{yellow}Completed {} out of {} accession(s) to download.{reset}",
        report.completed, report.queued
    );
    if let Some(fatal) = &report.fatal {
        println!("{red}Stopped early: {fatal}{reset}");
    }
    for error in &report.errors {
        println!("{red}{}: {}{reset}", error.id, error.reason);
    }
    for id in &report.unfinished {
        println!("{red}{id}: unfinished{reset}");
    }
}

fn print_validation_summary(report: &ValidationReport, validated: bool) {
    let unfinished = report.total - report.finished;
    if !report.errors.is_empty() || unfinished > 0 {
        println!("Unfinished validation: {unfinished}");
        println!("Errors found in {} accession(s):", report.errors.len());
        for error in &report.errors {
            println!("{} - {}", error.id, error.reason);
        }
    }
    let passed = report.finished.saturating_sub(report.errors.len());
    if validated {
        println!("{passed} accession(s) have been validated successfully.");
    } else {
        println!("{passed} accession(s) are in the repository (no validation checks were performed).");
    }
}
