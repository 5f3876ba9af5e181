//! **dumpsieve** - Streaming pipeline from raw object-dump session logs to a
//! categorized, scrubbed, indexed data corpus
//!
//! Reader → Resolver → Plan Builder → (external dump run) → Categorizer →
//! Comparator → Archive Generator. Every phase streams its input once and
//! leaves an `INCOMPLETE` marker on output it did not finish.

/// Command-line interface with clap integration
pub mod cli;

/// Shell completion generation
pub mod completion;

/// Pipeline phases
pub mod core {
    /// Marker grammar: classifies single log lines
    pub mod grammar;

    /// Section-tokenizing reader (lazy event stream over one log)
    pub mod reader;
    pub use reader::{Event, LogSection, ObjectRecord, ReaderOptions, SectionReader};

    /// Differential resolver: forward ∩ reverse enumeration per section
    pub mod resolve;
    pub use resolve::{ResolvedSection, Resolver};

    /// Dump plan builder with the global seen-set
    pub mod plan;
    pub use plan::{DumpBatch, PlanBuilder, run as plan_run};

    /// Literal and identifier redaction
    pub mod scrub;
    pub use scrub::Scrubber;

    /// Bounded LRU pool of per-class output files
    pub mod sinks;

    /// Reading categorized class files back
    pub mod corpus;

    /// Dump log → per-class corpus
    pub mod categorize;
    pub use categorize::{Categorizer, run as categorize_run};

    /// Cross-run comparator with noise filters
    pub mod compare;
    pub use compare::run as compare_run;

    /// Blob packing and SQLite index
    pub mod archive;
    pub use archive::{ArchiveReader, run as archive_run};

    /// Class hierarchy and object name tree behind the archive browse tables
    pub mod browse;

    /// Planned-but-undumped check and makeup plans
    pub mod undumped;
    pub use undumped::run as undumped_run;

    /// Section listing, extraction and replacement on raw logs
    pub mod splice;

    /// Domain error taxonomy and per-phase diagnostics
    pub mod diagnostics;
    pub use diagnostics::PhaseDiagnostics;
}

/// Infrastructure - configuration, byte I/O, output markers, helpers
pub mod infra {
    /// Layered configuration with TOML support
    pub mod config;
    pub use config::{Config, init as config_init, load_config};

    /// Byte-oriented log I/O with transparent gzip
    pub mod io;

    /// Output directory guard with the incomplete marker
    pub mod output;
    pub use output::OutputGuard;

    /// Utility functions and helpers for common operations
    pub mod utils;
}

// Strategic re-exports for clean CLI interface
pub use cli::{AppContext, Cli, Commands};
pub use core::{archive_run, categorize_run, compare_run, plan_run, undumped_run};
pub use infra::{Config, load_config};
