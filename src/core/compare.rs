//! Cross-run comparator.
//!
//! Summarizes two corpora (categorized directories or packaged archives) as
//! name → (class, content hash) maps and diffs them both ways. Noise filters
//! drop expected churn before anything is reported; the report is JSON so
//! other tooling can re-filter it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use itertools::{EitherOrBoth, Itertools};
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use tracing::{debug, info, instrument};

use crate::cli::{AppContext, CompareArgs};
use crate::core::archive::{ArchiveReader, INDEX_FILE};
use crate::core::corpus::{CorpusEntry, CorpusFile, list_class_files};
use crate::core::diagnostics::PhaseDiagnostics;
use crate::infra::config::load_config;
use crate::infra::io::latin1_to_string;
use crate::infra::output::{ensure_complete, write_json_atomic};
use crate::infra::utils::NameUtils;

const DIFF_CONTEXT_LINES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonStatus {
    New,
    Missing,
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub object_name: String,
    pub class_name: String,
    pub status: ComparisonStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Name, class and content hash of one corpus object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub class_name: String,
    pub name: String,
    pub hash: String,
}

/// Where a corpus lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusSource {
    Categorized(PathBuf),
    Archive(PathBuf),
}

impl CorpusSource {
    /// A directory holding an index file is an archive.
    pub fn detect(path: &Path) -> Result<Self> {
        ensure_complete(path)?;
        if path.join(INDEX_FILE).is_file() {
            Ok(Self::Archive(path.to_path_buf()))
        } else {
            Ok(Self::Categorized(path.to_path_buf()))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Categorized(p) | Self::Archive(p) => p,
        }
    }

    /// Visit every stored object in class order.
    pub fn for_each_entry<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(CorpusEntry) -> Result<()>,
    {
        match self {
            Self::Categorized(dir) => {
                for (_, path) in list_class_files(dir)? {
                    for entry in CorpusFile::open(&path)? {
                        f(entry?)?;
                    }
                }
                Ok(())
            }
            Self::Archive(dir) => ArchiveReader::open(dir)?.for_each_entry(f),
        }
    }

    /// Case-insensitive name key → summary. Later duplicates are counted.
    pub fn summarize(&self, diag: &mut PhaseDiagnostics) -> Result<BTreeMap<String, ObjectSummary>> {
        let mut out = BTreeMap::new();
        let mut duplicates = 0u64;
        self.for_each_entry(|entry| {
            let key = NameUtils::key(&entry.name);
            if out.contains_key(&key) {
                duplicates += 1;
                return Ok(());
            }
            let hash = entry.content_hash();
            out.insert(
                key,
                ObjectSummary {
                    class_name: entry.class_name,
                    name: entry.name,
                    hash,
                },
            );
            Ok(())
        })?;
        if duplicates > 0 {
            diag.add("duplicate_names", duplicates);
            diag.warn(format!(
                "{}: {duplicates} objects stored more than once",
                self.path().display()
            ));
        }
        debug!(source = %self.path().display(), objects = out.len(), "corpus summarized");
        Ok(out)
    }

    /// Bodies of the named objects (keys as produced by [`NameUtils::key`]).
    fn bodies_for(&self, wanted: &HashSet<String>) -> Result<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::new();
        if wanted.is_empty() {
            return Ok(out);
        }
        self.for_each_entry(|entry| {
            let key = NameUtils::key(&entry.name);
            if wanted.contains(&key) && !out.contains_key(&key) {
                out.insert(key, entry.body);
            }
            Ok(())
        })?;
        Ok(out)
    }
}

/// Which noise filters are active.
#[derive(Debug, Clone, Default)]
pub struct NoiseOptions {
    pub suppress_transient: bool,
    pub suppress_dynamic_suffix: bool,
    pub suppress_known_noise_classes: bool,
    pub suppress_defaults: bool,
    pub class_globs: Vec<String>,
    pub name_globs: Vec<String>,
}

impl NoiseOptions {
    /// Everything built in.
    pub fn clean() -> Self {
        Self {
            suppress_transient: true,
            suppress_dynamic_suffix: true,
            suppress_known_noise_classes: true,
            suppress_defaults: true,
            ..Self::default()
        }
    }
}

/// Compiled noise predicates over (class, name).
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    classes: GlobSet,
    names: GlobSet,
    willow_suffix: bool,
}

fn glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(GlobBuilder::new(p).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}

impl NoiseFilter {
    pub fn build(opts: &NoiseOptions, known_noise_classes: &[String]) -> Result<Self> {
        let mut class_globs = opts.class_globs.clone();
        if opts.suppress_known_noise_classes {
            class_globs.extend(known_noise_classes.iter().cloned());
        }

        let mut name_globs = opts.name_globs.clone();
        if opts.suppress_transient {
            name_globs.push("Transient.*".to_string());
        }
        if opts.suppress_dynamic_suffix {
            name_globs.push("Loader.TheWorld:*".to_string());
        }
        if opts.suppress_defaults {
            name_globs.push("*.Default__*".to_string());
            name_globs.push("Default__*".to_string());
        }

        Ok(Self {
            classes: glob_set(&class_globs)?,
            names: glob_set(&name_globs)?,
            willow_suffix: opts.suppress_dynamic_suffix,
        })
    }

    /// Filter that suppresses nothing.
    pub fn none() -> Self {
        Self {
            classes: GlobSet::empty(),
            names: GlobSet::empty(),
            willow_suffix: false,
        }
    }

    pub fn suppresses(&self, class: &str, name: &str) -> bool {
        if self.classes.is_match(class) || self.names.is_match(name) {
            return true;
        }
        self.willow_suffix
            && name
                .rsplit('.')
                .next()
                .and_then(|last| last.get(..6))
                .is_some_and(|p| p.eq_ignore_ascii_case("willow"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonCounts {
    pub new: u64,
    pub missing: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub suppressed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMismatches {
    pub only_current: Vec<String>,
    pub only_reference: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub current: String,
    pub reference: String,
    pub counts: ComparisonCounts,
    pub class_mismatches: ClassMismatches,
    pub results: Vec<ComparisonResult>,
}

/// Diff two summaries. Results are ordered by name key; unchanged objects
/// are counted but only listed with `include_unchanged`.
pub fn compare(
    current: &BTreeMap<String, ObjectSummary>,
    reference: &BTreeMap<String, ObjectSummary>,
    filter: &NoiseFilter,
    include_unchanged: bool,
) -> (Vec<ComparisonResult>, ComparisonCounts) {
    let mut results = Vec::new();
    let mut counts = ComparisonCounts::default();

    for pair in current.iter().merge_join_by(reference.iter(), |a, b| a.0.cmp(b.0)) {
        let (obj, status, detail) = match pair {
            EitherOrBoth::Left((_, cur)) => (cur, ComparisonStatus::New, None),
            EitherOrBoth::Right((_, old)) => (old, ComparisonStatus::Missing, None),
            EitherOrBoth::Both((_, cur), (_, old)) => {
                if cur.class_name != old.class_name {
                    let detail = format!("class {} -> {}", old.class_name, cur.class_name);
                    (cur, ComparisonStatus::Changed, Some(detail))
                } else if cur.hash != old.hash {
                    (cur, ComparisonStatus::Changed, None)
                } else {
                    (cur, ComparisonStatus::Unchanged, None)
                }
            }
        };

        if filter.suppresses(&obj.class_name, &obj.name) {
            counts.suppressed += 1;
            continue;
        }
        match status {
            ComparisonStatus::New => counts.new += 1,
            ComparisonStatus::Missing => counts.missing += 1,
            ComparisonStatus::Changed => counts.changed += 1,
            ComparisonStatus::Unchanged => {
                counts.unchanged += 1;
                if !include_unchanged {
                    continue;
                }
            }
        }
        results.push(ComparisonResult {
            object_name: obj.name.clone(),
            class_name: obj.class_name.clone(),
            status,
            detail,
        });
    }
    (results, counts)
}

fn class_mismatches(
    current: &BTreeMap<String, ObjectSummary>,
    reference: &BTreeMap<String, ObjectSummary>,
) -> ClassMismatches {
    let classes = |m: &BTreeMap<String, ObjectSummary>| -> BTreeSet<String> {
        m.values().map(|o| o.class_name.clone()).collect()
    };
    let (cur, old) = (classes(current), classes(reference));
    ClassMismatches {
        only_current: cur.difference(&old).cloned().collect(),
        only_reference: old.difference(&cur).cloned().collect(),
    }
}

/// Attach unified diffs to changed results whose bodies differ.
fn attach_diffs(
    results: &mut [ComparisonResult],
    current: &CorpusSource,
    reference: &CorpusSource,
) -> Result<()> {
    let wanted: HashSet<String> = results
        .iter()
        .filter(|r| r.status == ComparisonStatus::Changed)
        .map(|r| NameUtils::key(&r.object_name))
        .collect();
    let new_bodies = current.bodies_for(&wanted)?;
    let old_bodies = reference.bodies_for(&wanted)?;

    for r in results.iter_mut().filter(|r| r.status == ComparisonStatus::Changed) {
        let key = NameUtils::key(&r.object_name);
        let (Some(new), Some(old)) = (new_bodies.get(&key), old_bodies.get(&key)) else {
            continue;
        };
        if new == old {
            continue;
        }
        let (old, new) = (latin1_to_string(old), latin1_to_string(new));
        let diff = TextDiff::from_lines(&old, &new)
            .unified_diff()
            .context_radius(DIFF_CONTEXT_LINES)
            .header("reference", "current")
            .to_string();
        r.detail = Some(match r.detail.take() {
            Some(prefix) => format!("{prefix}\n{diff}"),
            None => diff,
        });
    }
    Ok(())
}

#[instrument(skip_all, fields(current = %current.path().display(), reference = %reference.path().display()))]
pub fn build_report(
    current: &CorpusSource,
    reference: &CorpusSource,
    filter: &NoiseFilter,
    include_unchanged: bool,
    detail: bool,
    diag: &mut PhaseDiagnostics,
) -> Result<ComparisonReport> {
    let cur = current.summarize(diag)?;
    let old = reference.summarize(diag)?;
    diag.set("current_objects", cur.len() as u64);
    diag.set("reference_objects", old.len() as u64);

    let (mut results, counts) = compare(&cur, &old, filter, include_unchanged);
    if detail {
        attach_diffs(&mut results, current, reference)?;
    }
    let class_mismatches = class_mismatches(&cur, &old);

    diag.set("new", counts.new);
    diag.set("missing", counts.missing);
    diag.set("changed", counts.changed);
    diag.set("unchanged", counts.unchanged);
    diag.set("suppressed", counts.suppressed);
    diag.set("classes_only_current", class_mismatches.only_current.len() as u64);
    diag.set("classes_only_reference", class_mismatches.only_reference.len() as u64);

    Ok(ComparisonReport {
        current: current.path().display().to_string(),
        reference: reference.path().display().to_string(),
        counts,
        class_mismatches,
        results,
    })
}

pub fn run(args: CompareArgs, ctx: &AppContext) -> Result<()> {
    let config = load_config(ctx.config_path.as_deref())?.compare;

    let mut noise = if args.clean {
        NoiseOptions::clean()
    } else {
        NoiseOptions {
            suppress_transient: args.suppress_transient,
            suppress_dynamic_suffix: args.suppress_dynamic_suffix,
            suppress_known_noise_classes: args.suppress_known_noise_classes,
            suppress_defaults: args.suppress_defaults,
            ..NoiseOptions::default()
        }
    };
    noise.class_globs = args.suppress_class.clone();
    noise.name_globs = args.suppress_name.clone();
    let filter = NoiseFilter::build(&noise, &config.known_noise_classes)?;

    let mut diag = PhaseDiagnostics::new("compare");
    let result = (|| {
        let current = CorpusSource::detect(&args.current)?;
        let reference = CorpusSource::detect(&args.reference)?;
        if current == reference {
            bail!("current and reference are the same corpus");
        }
        build_report(
            &current,
            &reference,
            &filter,
            args.include_unchanged,
            args.detail,
            &mut diag,
        )
    })();

    let outcome = result.and_then(|report| {
        match &args.out {
            Some(path) if !ctx.dry_run => {
                write_json_atomic(path, &report)?;
                info!(path = %path.display(), "comparison report written");
            }
            Some(path) => {
                if !ctx.quiet {
                    println!("{} {}", "DRY RUN: Would write".yellow(), path.display());
                }
            }
            None => println!("{}", serde_json::to_string_pretty(&report)?),
        }
        Ok(())
    });

    match &outcome {
        Ok(()) => diag.mark_complete(),
        Err(e) => diag.record_error(e),
    }
    diag.emit(ctx, args.diagnostics.as_deref())?;
    outcome
}
