use anyhow::Result;
use clap::Parser;
use dumpsieve::cli::{Cli, Commands, SectionCommand};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Build a context once, pass everywhere
    let ctx = cli.context();

    // RUST_LOG wins; otherwise info, or warn under --quiet
    let default_level = if ctx.quiet { "warn" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(!ctx.no_color)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Sections(args) => dumpsieve::core::splice::list(args, &ctx),
        Commands::Plan(args) => dumpsieve::plan_run(args, &ctx),
        Commands::Categorize(args) => dumpsieve::categorize_run(args, &ctx),
        Commands::Compare(args) => dumpsieve::compare_run(args, &ctx),
        Commands::Archive(args) => dumpsieve::archive_run(args, &ctx),
        Commands::Undumped(args) => dumpsieve::undumped_run(args, &ctx),
        Commands::Section(SectionCommand::Extract(args)) => {
            dumpsieve::core::splice::run_extract(args, &ctx)
        }
        Commands::Section(SectionCommand::Replace(args)) => {
            dumpsieve::core::splice::run_replace(args, &ctx)
        }
        Commands::Init(args) => dumpsieve::infra::config::init(args, &ctx),
        Commands::Completions(args) => dumpsieve::completion::run(args, &ctx),
    }
}
