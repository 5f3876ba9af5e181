use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::core::archive::BlobLayout;

/// Shared application context for global flags
#[derive(Clone, Debug, Default)]
pub struct AppContext {
    pub quiet: bool,                  // global --quiet
    pub no_color: bool,               // global --no-color
    pub dry_run: bool,                // global --dry-run
    pub config_path: Option<PathBuf>, // global --config
}

#[derive(Parser)]
#[command(name = "dsv")]
#[command(
    about = "Turns raw object-dump session logs into a categorized, scrubbed and indexed data corpus"
)]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Suppress progress bars and non-essential output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Show what would be done without executing
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Configuration file (defaults to ./dumpsieve.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn context(&self) -> AppContext {
        AppContext {
            quiet: self.quiet,
            no_color: self.no_color,
            dry_run: self.dry_run,
            config_path: self.config.clone(),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the sections of a raw log with per-section counts
    Sections(SectionsArgs),

    /// Resolve forward/reverse enumerations and write dump batch files
    Plan(PlanArgs),

    /// Split dump logs into per-class, deduplicated, scrubbed files
    Categorize(CategorizeArgs),

    /// Compare two corpora (categorized directories or archives)
    Compare(CompareArgs),

    /// Package a categorized corpus into blobs plus an SQLite index
    Archive(ArchiveArgs),

    /// Find planned objects that were never dumped and write a makeup plan
    Undumped(UndumpedArgs),

    /// Extract or replace one section of a raw log
    #[command(subcommand)]
    Section(SectionCommand),

    /// Initialize a dumpsieve.toml config file
    Init(InitArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Parser)]
pub struct SectionsArgs {
    /// Raw log (plain or .gz)
    pub log: PathBuf,

    /// Treat the log as an enumeration pass (repeated sections are malformed)
    #[arg(long)]
    pub enumeration: bool,

    /// Emit JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct PlanArgs {
    /// Forward enumeration log
    #[arg(long)]
    pub forward: PathBuf,

    /// Reverse enumeration log
    #[arg(long, required_unless_present = "unfiltered")]
    pub reverse: Option<PathBuf>,

    /// Plan every forward object without a reverse confirmation pass
    #[arg(long, conflicts_with = "reverse")]
    pub unfiltered: bool,

    /// Output directory for batch files and plan.json
    #[arg(short, long, default_value = "plan")]
    pub out: PathBuf,

    /// Maximum objects per batch file (overrides config)
    #[arg(long)]
    pub max_batch_size: Option<usize>,

    /// Additional excluded class (repeatable)
    #[arg(long, value_name = "CLASS")]
    pub exclude: Vec<String>,

    /// Do not synthesize default-object batches
    #[arg(long)]
    pub no_defaults: bool,

    /// Write phase diagnostics as JSON to this path
    #[arg(long, value_name = "FILE")]
    pub diagnostics: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct CategorizeArgs {
    /// Dump logs, processed in order (plain or .gz)
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output directory for <Class>.dump files
    #[arg(short, long, default_value = "categorized")]
    pub out: PathBuf,

    /// Scrub pattern file, one literal per line (overrides config)
    #[arg(long, value_name = "FILE")]
    pub scrub_file: Option<PathBuf>,

    /// Previous scrub_hits.tsv; new hits become warnings
    #[arg(long, value_name = "FILE")]
    pub known_hits: Option<PathBuf>,

    /// Maximum simultaneously open class files (overrides config)
    #[arg(long)]
    pub max_open_files: Option<usize>,

    /// Write phase diagnostics as JSON to this path
    #[arg(long, value_name = "FILE")]
    pub diagnostics: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct CompareArgs {
    /// Corpus from the current run
    pub current: PathBuf,

    /// Corpus to compare against
    pub reference: PathBuf,

    /// Write the JSON report here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Ignore Transient.* objects
    #[arg(long)]
    pub suppress_transient: bool,

    /// Ignore Loader.TheWorld:* and Willow* runtime objects
    #[arg(long)]
    pub suppress_dynamic_suffix: bool,

    /// Ignore classes listed in compare.known_noise_classes
    #[arg(long)]
    pub suppress_known_noise_classes: bool,

    /// Ignore default objects
    #[arg(long)]
    pub suppress_defaults: bool,

    /// Enable every built-in suppression
    #[arg(long)]
    pub clean: bool,

    /// Ignore classes matching this glob (repeatable, case-insensitive)
    #[arg(long, value_name = "GLOB")]
    pub suppress_class: Vec<String>,

    /// Ignore objects whose name matches this glob (repeatable, case-insensitive)
    #[arg(long, value_name = "GLOB")]
    pub suppress_name: Vec<String>,

    /// Attach unified diffs for changed bodies
    #[arg(long)]
    pub detail: bool,

    /// List unchanged objects too
    #[arg(long)]
    pub include_unchanged: bool,

    /// Write phase diagnostics as JSON to this path
    #[arg(long, value_name = "FILE")]
    pub diagnostics: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct ArchiveArgs {
    /// Finished categorized corpus
    pub corpus: PathBuf,

    /// Archive output directory
    #[arg(short, long, default_value = "archive")]
    pub out: PathBuf,

    /// Blob layout (overrides config)
    #[arg(long, value_enum)]
    pub layout: Option<BlobLayout>,

    /// Uncompressed bytes at which a per-class blob rolls over (overrides config)
    #[arg(long)]
    pub max_blob_bytes: Option<u64>,

    /// Fixed value for meta.generated_at (reproducible builds)
    #[arg(long, value_name = "TIMESTAMP")]
    pub generated_at: Option<String>,

    /// Write phase diagnostics as JSON to this path
    #[arg(long, value_name = "FILE")]
    pub diagnostics: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct UndumpedArgs {
    /// Plan directory that was executed
    #[arg(long)]
    pub plan: PathBuf,

    /// Dump log produced by running the plan
    #[arg(long)]
    pub log: PathBuf,

    /// Makeup plan directory (defaults to <plan>/makeup)
    #[arg(long)]
    pub makeup: Option<PathBuf>,

    /// Maximum objects per makeup batch (overrides config)
    #[arg(long)]
    pub max_batch_size: Option<usize>,

    /// Write phase diagnostics as JSON to this path
    #[arg(long, value_name = "FILE")]
    pub diagnostics: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum SectionCommand {
    /// Copy the first occurrence of a section to a new file
    Extract(ExtractArgs),

    /// Replace the first occurrence of a section with another file's contents
    Replace(ReplaceArgs),
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Raw log to read
    pub log: PathBuf,

    /// Section id (the part after switch.to.)
    #[arg(short, long)]
    pub section: String,

    /// Output file
    #[arg(short, long)]
    pub out: PathBuf,
}

#[derive(Debug, Args)]
pub struct ReplaceArgs {
    /// Raw log to read
    pub log: PathBuf,

    /// Section id (the part after switch.to.)
    #[arg(short, long)]
    pub section: String,

    /// File holding the replacement section
    #[arg(short, long)]
    pub with: PathBuf,

    /// Output file
    #[arg(short, long)]
    pub out: PathBuf,
}

#[derive(Debug, Parser)]
pub struct InitArgs {
    /// Directory to initialize config in
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Overwrite existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,

    /// Output directory; if omitted and --stdout not set, prints error
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Print completion script to stdout instead of a file
    #[arg(long)]
    pub stdout: bool,
}
