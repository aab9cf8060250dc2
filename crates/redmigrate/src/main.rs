use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use redmigrate_core::config::{ConfigOverrides, ResolvedConfig, load_config};
use redmigrate_core::confluence::{ConfluenceClient, ConfluenceClientConfig};
use redmigrate_core::links::MigrationMode;
use redmigrate_core::markup::{TargetMode, TranslateContext, translate};
use redmigrate_core::redmine::{RedmineClient, RedmineClientConfig};
use redmigrate_core::runtime::{ResolutionContext, ResolvedPaths, resolve_paths};
use redmigrate_core::wiki::{
    ServiceDirectory, WikiMigrationOptions, WikiMigrationReport, migrate_wiki,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "redmigrate",
    version,
    about = "Migrate Redmine wiki pages to Confluence"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log progress at info level")]
    verbose: bool,
    #[arg(long, global = true, value_name = "PATH", help = "Append log output to a file")]
    log_file: Option<PathBuf>,
    #[arg(long, global = true, value_name = "KEY", help = "Redmine API key")]
    redmine_key: Option<String>,
    #[arg(long, global = true, value_name = "PROJECT", help = "Redmine project identifier")]
    redmine_project: Option<String>,
    #[arg(long, global = true, value_name = "SPACE", help = "Confluence space key")]
    confluence_space: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: Option<PathBuf>,
    diagnostics: bool,
    overrides: ConfigOverrides,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            overrides: ConfigOverrides {
                redmine_api_key: cli.redmine_key.clone(),
                redmine_project: cli.redmine_project.clone(),
                confluence_space: cli.confluence_space.clone(),
            },
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate a wiki page, its subtree, or the whole project wiki.
    Wiki(WikiArgs),
    /// Print the translation of a local Textile file.
    Translate(TranslateArgs),
    /// Print the resolved configuration with secrets masked.
    Config,
}

#[derive(Debug, Args)]
struct WikiArgs {
    /// Redmine title of the page to start from.
    title: String,
    #[arg(short = 'm', long, help = "Also migrate every child page")]
    multiple: bool,
    #[arg(short = 'a', long, help = "Migrate every page of the project wiki")]
    all: bool,
    #[arg(long, help = "Append a link to the new page into the Redmine page")]
    leave_link: bool,
    #[arg(short = 'r', long, help = "Replace the Redmine page body with a link to the new page")]
    remove: bool,
    #[arg(long, help = "Translate and report without publishing")]
    dry_run: bool,
    #[arg(long, help = "Abort on the first page that cannot be published")]
    fail_fast: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct TranslateArgs {
    file: PathBuf,
    #[arg(long, help = "Translate for a Jira issue description instead of a wiki page")]
    issue: bool,
    #[arg(long, value_name = "TITLE", help = "Redmine title the text belongs to")]
    title: Option<String>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Wiki(args)) => run_wiki(&runtime, args),
        Some(Commands::Translate(args)) => run_translate(&runtime, args),
        Some(Commands::Config) => run_config(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// `RUST_LOG` wins; otherwise `info` with `--verbose` and `warn` without.
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn resolve_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, ResolvedConfig)> {
    let context = ResolutionContext::from_process()?;
    let paths = resolve_paths(&context, runtime.config.as_deref());
    let config = load_config(&paths.config_path)?;
    let resolved = config.resolve(&runtime.overrides)?;
    Ok((paths, resolved))
}

fn build_clients(config: &ResolvedConfig) -> Result<(RedmineClient, ConfluenceClient)> {
    let redmine = RedmineClient::new(RedmineClientConfig::new(
        &config.redmine_server,
        &config.redmine_api_key,
        &config.user_agent,
    ))?;
    let confluence = ConfluenceClient::new(ConfluenceClientConfig::new(
        &config.confluence_server,
        &config.confluence_user,
        &config.confluence_password,
        &config.user_agent,
    ))?;
    Ok((redmine, confluence))
}

fn run_wiki(runtime: &RuntimeOptions, args: WikiArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let (mut redmine, mut confluence) = build_clients(&config)?;

    let mode = if args.all {
        MigrationMode::AllPages
    } else if args.multiple {
        MigrationMode::Subtree
    } else {
        MigrationMode::SinglePage
    };
    let options = WikiMigrationOptions {
        project: config.redmine_project.clone(),
        space: config.confluence_space.clone(),
        source_server: config.redmine_server.clone(),
        mode,
        leave_link: args.leave_link || config.migration.leave_link,
        replace_source: args.remove || config.migration.replace_source,
        dry_run: args.dry_run,
        fail_fast: args.fail_fast || config.migration.fail_fast,
        transfer_attachments: config.migration.transfer_attachments,
        max_publish_attempts: config.migration.max_publish_attempts,
    };
    info!(
        "migrating {} ({}) from Redmine project {} to Confluence space {}",
        args.title,
        mode.as_str(),
        options.project,
        options.space
    );

    let report = migrate_wiki(&mut redmine, &mut confluence, &args.title, &options)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_wiki_report(&report);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    if !report.success {
        bail!(
            "wiki migration finished with {} failed page(s)",
            report.failed
        );
    }
    Ok(())
}

fn print_wiki_report(report: &WikiMigrationReport) {
    println!("wiki migration");
    println!("root: {}", report.root);
    println!("mode: {}", report.mode);
    println!("dry_run: {}", report.dry_run);
    println!("published: {}", report.published);
    println!("already_migrated: {}", report.already_migrated);
    if report.dry_run {
        println!("would_publish: {}", report.would_publish);
    }
    println!("failed: {}", report.failed);
    println!("skipped: {}", report.skipped);
    println!("source_requests: {}", report.source_request_count);
    println!("destination_requests: {}", report.destination_request_count);
    if !report.pages.is_empty() {
        println!("pages:");
        for page in &report.pages {
            let mut line = format!("  - {} [{}]", page.title, page.outcome.as_str());
            if let Some(url) = &page.destination_url {
                line.push_str(&format!(" {url}"));
            }
            if let Some(detail) = &page.detail {
                line.push_str(&format!(" ({detail})"));
            }
            println!("{line}");
        }
    }
    if !report.unreachable.is_empty() {
        println!("unreachable:");
        for title in &report.unreachable {
            println!("  - {title}");
        }
    }
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
}

fn run_translate(runtime: &RuntimeOptions, args: TranslateArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let (mut redmine, mut confluence) = build_clients(&config)?;
    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let title = match args.title {
        Some(title) => title,
        None => args
            .file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string(),
    };

    let context = TranslateContext {
        target: if args.issue {
            TargetMode::IssueDescription
        } else {
            TargetMode::WikiPage
        },
        mode: MigrationMode::SinglePage,
        source_server: &config.redmine_server,
        project: &config.redmine_project,
        current_page: &title,
    };
    let mut directory = ServiceDirectory::new(&mut redmine, &mut confluence, &config.confluence_space);
    println!("{}", translate(&text, &context, &mut directory));
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_config(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    println!("{}", config.describe());
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}
