use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use hatnotebot_core::cleanup::{
    CleanupReport, PageAction, PageInspection, PageResult, Progress, inspect_page,
    run_with_connector,
};
use hatnotebot_core::mediawiki::MediaWikiClient;
use hatnotebot_core::settings::{BotSettings, SettingsOverrides};

#[derive(Debug, Parser)]
#[command(
    name = "hatnotebot",
    version,
    about = "Removes hatnote templates that link to nonexistent pages"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved settings diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Clean up the tracking category")]
    Run(RunArgs),
    #[command(about = "Show what the filter would remove from one page")]
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, conflicts_with = "live", help = "Report edits without saving them")]
    dry_run: bool,
    #[arg(long, help = "Save edits to the wiki")]
    live: bool,
    #[arg(long, value_name = "N", help = "Maximum number of articles to process")]
    max_articles: Option<usize>,
    #[arg(long, help = "Print a unified diff for every changed page")]
    diff: bool,
}

#[derive(Debug, Args)]
struct InspectArgs {
    title: String,
    #[arg(long, help = "Print a unified diff of the cleaned text")]
    diff: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(args)) => run_cleanup_command(cli.config, cli.diagnostics, args),
        Some(Commands::Inspect(args)) => run_inspect_command(cli.config, cli.diagnostics, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_cleanup_command(config: Option<PathBuf>, diagnostics: bool, args: RunArgs) -> Result<()> {
    let dry_run = match (args.dry_run, args.live) {
        (true, _) => Some(true),
        (false, true) => Some(false),
        (false, false) => None,
    };
    let settings = load_settings(SettingsOverrides {
        config_path: config,
        dry_run,
        max_articles: args.max_articles,
        show_diff: args.diff,
    })?;
    if diagnostics {
        println!("[diagnostics]\n{}\n", settings.diagnostics());
    }

    let report = run_with_connector(
        &settings,
        |client| MediaWikiClient::new(client.clone()),
        &mut |event| print_progress(&settings, event),
    )?;
    print_summary(&report);
    Ok(())
}

fn run_inspect_command(
    config: Option<PathBuf>,
    diagnostics: bool,
    args: InspectArgs,
) -> Result<()> {
    let settings = load_settings(SettingsOverrides {
        config_path: config,
        dry_run: Some(true),
        max_articles: None,
        show_diff: args.diff,
    })?;
    if diagnostics {
        println!("[diagnostics]\n{}\n", settings.diagnostics());
    }

    let mut client = MediaWikiClient::new(settings.client.clone())?;
    let inspection = inspect_page(&mut client, &settings, &args.title)?;
    print_inspection(&inspection);
    Ok(())
}

fn load_settings(overrides: SettingsOverrides) -> Result<BotSettings> {
    dotenvy::dotenv().ok();
    BotSettings::from_process(&overrides)
}

fn print_progress(settings: &BotSettings, event: Progress<'_>) {
    match event {
        Progress::Started {
            logged_in_as,
            template_names,
            candidates,
        } => {
            println!("hatnote cleanup");
            println!("dry_run: {}", format_flag(settings.dry_run));
            println!("max_articles: {}", settings.max_articles);
            println!("logged_in_as: {logged_in_as}");
            println!("hatnote_templates: {template_names}");
            println!("candidates: {candidates}");
        }
        Progress::Page(page) => print_page(page),
    }
}

fn print_page(page: &PageResult) {
    match page.action {
        PageAction::WouldEdit => println!("[dry-run] would edit: {}", page.title),
        action => match &page.detail {
            Some(detail) => println!("{}: {} ({detail})", action.as_str(), page.title),
            None => println!("{}: {}", action.as_str(), page.title),
        },
    }
    for removal in &page.removals {
        println!(
            "  - removed {{{{{}}}}} (missing [[{}]])",
            removal.template, removal.missing_target
        );
    }
    if let Some(diff) = &page.diff {
        print!("{diff}");
    }
}

fn print_summary(report: &CleanupReport) {
    println!("pages_processed: {}", report.pages_processed);
    println!("edits_made: {}", report.edits_made);
    if report.dry_run {
        println!("would_edit: {}", report.would_edit);
    }
    println!("edits_rejected: {}", report.rejected);
    println!("skipped: {}", report.skipped());
    println!("existence_queries: {}", report.existence_queries);
    println!("cached_titles: {}", report.cached_titles);
    println!("api_requests: {}", report.request_count);
}

fn print_inspection(inspection: &PageInspection) {
    println!("hatnote inspect");
    println!("title: {}", inspection.title);
    println!("hatnote_templates: {}", inspection.template_names);
    let Some(outcome) = &inspection.outcome else {
        println!("page: missing");
        println!("api_requests: {}", inspection.request_count);
        return;
    };

    println!("modified: {}", format_flag(outcome.modified));
    println!("removals: {}", outcome.removals.len());
    for removal in &outcome.removals {
        println!(
            "  - {{{{{}}}}} (missing [[{}]])",
            removal.template, removal.missing_target
        );
    }
    if let Some(diff) = &inspection.diff {
        print!("{diff}");
    }
    println!("existence_queries: {}", inspection.existence_queries);
    println!("api_requests: {}", inspection.request_count);
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
