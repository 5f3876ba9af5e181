//! Categorizer: dump log → per-class, deduplicated, scrubbed records.
//!
//! The log is streamed once. Each dump block is accumulated, scrubbed and
//! appended to its class file through the bounded [`SinkPool`]. An object
//! name seen again (case-insensitively) is discarded: the first dump wins.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use bstr::ByteSlice;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cli::{AppContext, CategorizeArgs};
use crate::core::diagnostics::{DuplicateObject, MalformedSection, PhaseDiagnostics};
use crate::core::grammar::dump_header;
use crate::core::reader::{Event, ReaderOptions, SectionReader};
use crate::core::scrub::{IdentifierRule, Scrubber};
use crate::core::sinks::{DUMP_EXTENSION, SinkPool, SinkStats};
use crate::infra::config::load_config;
use crate::infra::io::{latin1_to_string, string_to_latin1};
use crate::infra::output::OutputGuard;
use crate::infra::utils::{NameUtils, ProgressUtils};

/// Audit file of `(object, rule-id)` pairs.
pub const SCRUB_HITS_FILE: &str = "scrub_hits.tsv";

/// How often the progress spinner is refreshed, in events.
const PROGRESS_EVERY: u64 = 50_000;

pub struct CategorizeOptions {
    pub out_dir: PathBuf,
    pub max_open_files: usize,
    pub scrubber: Scrubber,
    /// Previously accepted scrub hits; additions become warnings.
    pub known_hits: Option<BTreeSet<(String, String)>>,
}

/// Final report of a categorize run.
#[derive(Debug, Clone, Serialize)]
pub struct CategorizeSummary {
    pub complete: bool,
    pub classes: u64,
    pub objects_written: u64,
    pub duplicates_discarded: u64,
    pub scrub_hits: u64,
    pub unexpected_scrub_hits: Vec<(String, String)>,
    pub sinks: SinkStats,
}

struct PendingEntry {
    class: String,
    name: String,
    body: Vec<u8>,
    keep: bool,
}

pub struct Categorizer {
    guard: OutputGuard,
    sinks: SinkPool,
    scrubber: Scrubber,
    known_hits: Option<BTreeSet<(String, String)>>,
    seen: HashSet<String>,
    hits: BTreeSet<(String, String)>,
    current: Option<PendingEntry>,
    cancel: Arc<AtomicBool>,
    cancelled: bool,
    diag: PhaseDiagnostics,
}

impl Categorizer {
    /// Claim `opts.out_dir` and clear class files left by a previous run.
    pub fn new(opts: CategorizeOptions) -> Result<Self> {
        let guard = OutputGuard::begin(&opts.out_dir, "categorize")?;
        clear_previous_output(&opts.out_dir)?;
        let sinks = SinkPool::new(&opts.out_dir, opts.max_open_files)?;
        Ok(Self {
            guard,
            sinks,
            scrubber: opts.scrubber,
            known_hits: opts.known_hits,
            seen: HashSet::new(),
            hits: BTreeSet::new(),
            current: None,
            cancel: Arc::new(AtomicBool::new(false)),
            cancelled: false,
            diag: PhaseDiagnostics::new("categorize"),
        })
    }

    /// Share a stop flag; once set, consumption stops at the next line.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Replace how class files are opened.
    #[cfg(test)]
    pub(crate) fn with_sink_opener(mut self, opener: crate::core::sinks::SinkOpener) -> Self {
        self.sinks.set_opener(opener);
        self
    }

    pub fn diagnostics(&self) -> &PhaseDiagnostics {
        &self.diag
    }

    /// Stream one dump log. Several logs may be consumed in order; they
    /// share one dedup set as if concatenated.
    #[instrument(skip_all)]
    pub fn consume<R: BufRead>(&mut self, reader: SectionReader<R>, ctx: &AppContext) -> Result<()> {
        let pb = ProgressUtils::spinner(ctx, "categorizing");
        let mut events = 0u64;

        for event in reader {
            if self.cancel.load(Ordering::Relaxed) {
                if let Some(dropped) = self.current.take() {
                    debug!(object = %dropped.name, "pending dump dropped on cancel");
                }
                self.cancelled = true;
                break;
            }

            events += 1;
            if events % PROGRESS_EVERY == 0 {
                pb.set_position(events);
            }

            match event? {
                Event::DumpBegin {
                    line, class, name, ..
                } => {
                    self.finish_entry()?;
                    self.begin_entry(line, class, name);
                }
                Event::DumpLine(bytes) => {
                    if let Some(entry) = self.current.as_mut()
                        && entry.keep
                    {
                        entry.body.extend_from_slice(&bytes);
                        entry.body.push(b'\n');
                    }
                }
                Event::DumpEnd { truncated } => {
                    if truncated {
                        self.diag.add("truncated_blocks", 1);
                    }
                    self.finish_entry()?;
                }
                Event::SectionStart(_) => self.diag.add("sections", 1),
                Event::NotFound { .. } => self.diag.add("not_found", 1),
                Event::Malformed(m) => {
                    self.diag.add("malformed", 1);
                    self.diag.warn(m.to_string());
                }
                Event::Incomplete(i) => {
                    self.diag.add("incomplete_sections", 1);
                    self.diag.warn(i.to_string());
                }
                Event::Object(_) | Event::Line { .. } | Event::StreamEnd { .. } => {}
            }
        }
        self.finish_entry()?;
        self.sinks.flush_all()?;
        pb.finish_and_clear();
        Ok(())
    }

    fn begin_entry(&mut self, line: u64, class: String, name: String) {
        self.diag.add("objects_seen", 1);

        let keep = if !NameUtils::is_safe_class_name(&class) {
            self.diag.add("unsafe_class_names", 1);
            self.diag
                .warn(MalformedSection::UnsafeClassName { line, class: class.clone() }.to_string());
            false
        } else if !self.seen.insert(NameUtils::key(&name)) {
            self.diag.add("duplicates_discarded", 1);
            self.diag.warn(
                DuplicateObject {
                    line,
                    class: class.clone(),
                    name: name.clone(),
                }
                .to_string(),
            );
            false
        } else {
            true
        };

        self.current = Some(PendingEntry {
            class,
            name,
            body: Vec::new(),
            keep,
        });
    }

    fn finish_entry(&mut self) -> Result<()> {
        let Some(mut entry) = self.current.take() else {
            return Ok(());
        };
        if !entry.keep {
            return Ok(());
        }

        // trailing blank lines would merge with the record separator
        while entry.body.ends_with(b"\n\n") {
            entry.body.pop();
        }
        if entry.body.trim().is_empty() {
            entry.body.clear();
        }

        let outcome = self
            .scrubber
            .scrub(&entry.name, &entry.class, &mut entry.body);
        let (class, class_hits) = self.scrubber.scrub_label(&entry.class);
        let (name, name_hits) = self.scrubber.scrub_label(&entry.name);
        if outcome.scrubbed() || !class_hits.is_empty() || !name_hits.is_empty() {
            self.diag.add("scrubbed_objects", 1);
        }
        for w in outcome.warnings {
            self.diag.add("scrub_expectation_warnings", 1);
            self.diag.warn(w.to_string());
        }
        if outcome.identifiers_zeroed > 0 {
            self.diag
                .add("identifiers_zeroed", outcome.identifiers_zeroed as u64);
        }
        for rule in outcome.hits.into_iter().chain(class_hits).chain(name_hits) {
            self.hits.insert((name.clone(), rule));
        }

        // the header and file name carry only redacted labels
        let mut record = string_to_latin1(&dump_header(&class, &name));
        record.reserve(entry.body.len() + 2);
        record.push(b'\n');
        record.extend_from_slice(&entry.body);
        record.push(b'\n');

        if let Some(event) = self.sinks.write(&class, &record)? {
            self.diag.add("file_handle_exhaustion", 1);
            self.diag.warn(event.to_string());
        }
        self.diag.add("objects_written", 1);
        Ok(())
    }

    /// Close every sink, write the scrub audit and mark the output complete
    /// (unless cancelled).
    #[instrument(skip_all)]
    pub fn finish(mut self) -> Result<(CategorizeSummary, PhaseDiagnostics)> {
        self.finish_entry()?;
        let sinks = self.sinks.close_all()?;
        self.diag.set("classes", sinks.classes);
        self.diag.set("sinks_reopened", sinks.reopened);
        self.diag.set("sink_evictions", sinks.evictions);
        self.diag.set("sinks_peak_open", sinks.peak_open);

        write_scrub_hits(&self.guard.dir().join(SCRUB_HITS_FILE), &self.hits)?;
        self.diag.set("scrub_hits", self.hits.len() as u64);

        let mut unexpected = Vec::new();
        if let Some(known) = &self.known_hits {
            for hit in self.hits.difference(known) {
                self.diag
                    .warn(format!("unexpected scrub hit: {} {}", hit.0, hit.1));
                unexpected.push(hit.clone());
            }
            let absent = known.difference(&self.hits).count() as u64;
            self.diag.set("unexpected_scrub_hits", unexpected.len() as u64);
            self.diag.set("known_scrub_hits_absent", absent);
        }

        let complete = !self.cancelled;
        if complete {
            self.guard.complete()?;
            self.diag.mark_complete();
            info!(objects = self.diag.get("objects_written"), "categorize complete");
        } else {
            self.guard.abandon("cancelled");
            warn!("categorize cancelled; output marked incomplete");
        }

        let summary = CategorizeSummary {
            complete,
            classes: sinks.classes,
            objects_written: self.diag.get("objects_written"),
            duplicates_discarded: self.diag.get("duplicates_discarded"),
            scrub_hits: self.hits.len() as u64,
            unexpected_scrub_hits: unexpected,
            sinks,
        };
        Ok((summary, self.diag))
    }

    /// Give up after a fatal error: flush what exists and keep the marker.
    pub fn abort(mut self, err: &anyhow::Error) -> PhaseDiagnostics {
        self.current = None;
        if let Err(e) = self.sinks.flush_all() {
            warn!(error = %e, "flush during abort failed");
        }
        self.guard.abandon(&format!("{err:#}"));
        self.diag.record_error(err);
        self.diag
    }
}

/// Remove class files and audit output of an earlier run in `dir`.
fn clear_previous_output(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if entry.file_type()?.is_file()
            && (name.ends_with(&format!(".{DUMP_EXTENSION}")) || name == SCRUB_HITS_FILE)
        {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn write_scrub_hits(path: &Path, hits: &BTreeSet<(String, String)>) -> Result<()> {
    let mut out = Vec::new();
    for (object, rule) in hits {
        out.extend_from_slice(&string_to_latin1(object));
        out.push(b'\t');
        out.extend_from_slice(rule.as_bytes());
        out.push(b'\n');
    }
    fs::write(path, out).with_context(|| format!("Failed to write {}", path.display()))
}

/// Parse a scrub audit file (`object<TAB>rule-id` per line).
pub fn load_known_hits(path: &Path) -> Result<BTreeSet<(String, String)>> {
    let raw = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut set = BTreeSet::new();
    for line in ByteSlice::lines(raw.as_slice()) {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once_str("\t") {
            Some((object, rule)) => {
                set.insert((latin1_to_string(object), latin1_to_string(rule.trim())));
            }
            None => anyhow::bail!(
                "Malformed line in {}: {}",
                path.display(),
                latin1_to_string(line)
            ),
        }
    }
    Ok(set)
}

pub fn run(args: CategorizeArgs, ctx: &AppContext) -> Result<()> {
    let config = load_config(ctx.config_path.as_deref())?.categorize;

    let scrub_file = args.scrub_file.clone().or(config.scrub_file.clone());
    let known_file = args.known_hits.clone().or(config.known_hits_file.clone());
    let max_open = args.max_open_files.unwrap_or(config.max_open_files);

    if ctx.dry_run {
        if !ctx.quiet {
            println!("{}", "DRY RUN: Would categorize:".yellow());
            for input in &args.inputs {
                println!("  {}", input.display());
            }
            println!("  into {}", args.out.display());
            println!("  max open files: {max_open}");
        }
        return Ok(());
    }

    let identifier = IdentifierRule::new(&config.identifier_tag, config.identifier_classes.clone());
    let scrubber = Scrubber::load(scrub_file.as_deref(), identifier)?;
    let known_hits = known_file.as_deref().map(load_known_hits).transpose()?;

    let mut categorizer = Categorizer::new(CategorizeOptions {
        out_dir: args.out.clone(),
        max_open_files: max_open,
        scrubber,
        known_hits,
    })?;

    let consumed = args.inputs.iter().try_for_each(|input| {
        info!(input = %input.display(), "reading dump log");
        categorizer.consume(SectionReader::open(input, ReaderOptions::dump_log())?, ctx)
    });

    match consumed {
        Ok(()) => {
            let (summary, diag) = categorizer.finish()?;
            diag.emit(ctx, args.diagnostics.as_deref())?;
            if !ctx.quiet {
                let line = format!(
                    "Categorized {} objects into {} class files in {}",
                    summary.objects_written,
                    summary.classes,
                    args.out.display()
                );
                if ctx.no_color {
                    println!("{line}");
                } else {
                    println!("{}", line.green());
                }
            }
            Ok(())
        }
        Err(e) => {
            let diag = categorizer.abort(&e);
            diag.emit(ctx, args.diagnostics.as_deref())?;
            Err(e)
        }
    }
}
