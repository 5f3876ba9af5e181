//! Undumped-object check.
//!
//! Cross-references a written plan with the dump log it produced: every
//! planned object that drew a "no objects found" reply and was not dumped
//! later in the same log goes into a makeup plan under `<plan>/makeup/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use bstr::ByteSlice;
use indexmap::IndexMap;
use owo_colors::OwoColorize;
use regex::Regex;
use serde::Serialize;
use tabled::{Table, Tabled};
use tracing::{debug, info, instrument};

use crate::cli::{AppContext, UndumpedArgs};
use crate::core::diagnostics::PhaseDiagnostics;
use crate::core::grammar::SWITCH_PREFIX;
use crate::core::plan::{DEFAULTS_SECTION, DumpBatch, PlanManifest, PlanStats, PlanWriter};
use crate::core::reader::{Event, ReaderOptions, SectionReader};
use crate::infra::config::load_config;
use crate::infra::io::latin1_to_string;
use crate::infra::output::ensure_complete;
use crate::infra::utils::NameUtils;

pub const MAKEUP_DIR: &str = "makeup";

/// Batch sections whose objects are not tracked.
const UNTRACKED_SECTIONS: [&str; 2] = [DEFAULTS_SECTION, "getall"];

/// Not-found targets that are expected and never made up.
const IGNORED_PREFIXES: [&str; 3] = [SWITCH_PREFIX, "Loader.TheWorld:", "Transient."];

/// Where a planned object came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedObject
{
    pub name: String,
    pub section: String,
    pub sequence: usize,
}

/// Outcome of one check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UndumpedReport
{
    pub attempted: u64,
    pub not_found: u64,
    pub recovered: u64,
    pub ignored: u64,
    pub unplanned: Vec<String>,
    pub missing: Vec<PlannedObject>,
}

#[derive(Tabled)]
struct SectionRow
{
    section: String,
    missing: usize,
}

impl UndumpedReport
{
    /// Missing objects per section, in first-seen order.
    pub fn by_section(&self) -> IndexMap<&str, Vec<&str>>
    {
        let mut out: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for obj in &self.missing
        {
            out.entry(obj.section.as_str())
                .or_default()
                .push(obj.name.as_str());
        }
        out
    }

    pub fn render_table(&self) -> String
    {
        let rows: Vec<SectionRow> = self
            .by_section()
            .into_iter()
            .map(|(section, names)| SectionRow { section: section.to_string(), missing: names.len() })
            .collect();
        Table::new(rows).to_string()
    }
}

/// Read every tracked batch file in `plan_dir`, keyed case-insensitively.
pub fn load_attempted(plan_dir: &Path) -> Result<IndexMap<String, PlannedObject>>
{
    ensure_complete(plan_dir)?;
    let batch_re = Regex::new(r"^(\w+)\.(\d+)$")?;

    let mut files = Vec::new();
    for entry in
        fs::read_dir(plan_dir).with_context(|| format!("Failed to list {}", plan_dir.display()))?
    {
        let entry = entry?;
        if !entry
            .file_type()?
            .is_file()
        {
            continue;
        }
        let file_name = entry
            .file_name()
            .to_string_lossy()
            .into_owned();
        let Some(caps) = batch_re.captures(&file_name)
        else
        {
            debug!(file = %file_name, "not a batch file");
            continue;
        };
        let section = caps[1].to_string();
        if UNTRACKED_SECTIONS.contains(&section.as_str())
        {
            continue;
        }
        let sequence: usize = caps[2].parse()?;
        files.push((section, sequence, entry.path()));
    }
    files.sort();

    let mut attempted = IndexMap::new();
    for (section, sequence, path) in files
    {
        let raw = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        for line in raw.lines()
        {
            if line
                .trim()
                .is_empty()
            {
                continue;
            }
            let Some(name) = line.strip_prefix(b"obj dump ")
            else
            {
                bail!("Unexpected line in {}: {}", path.display(), latin1_to_string(line));
            };
            let name = latin1_to_string(name.trim());
            attempted
                .entry(NameUtils::key(&name))
                .or_insert(PlannedObject { name, section: section.clone(), sequence });
        }
    }
    Ok(attempted)
}

fn is_ignored(
    target: &str,
    root_sentinels: &[String],
) -> bool
{
    IGNORED_PREFIXES
        .iter()
        .any(|p| target.starts_with(p))
        || root_sentinels.contains(&NameUtils::key(NameUtils::last_component(target)))
}

/// Scan `dump_log` against the objects attempted by the plan in `plan_dir`.
#[instrument(skip(diag))]
pub fn check(
    plan_dir: &Path,
    dump_log: &Path,
    reserved_root_class: &str,
    diag: &mut PhaseDiagnostics,
) -> Result<UndumpedReport>
{
    let attempted = load_attempted(plan_dir)?;
    let root = NameUtils::default_object(reserved_root_class);
    let root_sentinels = [NameUtils::key(&root), NameUtils::key(&NameUtils::default_object(&root))];

    let mut report = UndumpedReport { attempted: attempted.len() as u64, ..UndumpedReport::default() };
    let mut missing: IndexMap<String, PlannedObject> = IndexMap::new();

    for event in SectionReader::open(dump_log, ReaderOptions::dump_log())?
    {
        match event?
        {
            Event::NotFound { target, .. } =>
            {
                report.not_found += 1;
                if is_ignored(&target, &root_sentinels)
                {
                    report.ignored += 1;
                    continue;
                }
                let key = NameUtils::key(&target);
                if missing.contains_key(&key)
                {
                    continue;
                }
                match attempted.get(&key)
                {
                    Some(planned) =>
                    {
                        missing.insert(key, planned.clone());
                    }
                    None =>
                    {
                        diag.warn(format!("{target} was not found but is not in the plan"));
                        report
                            .unplanned
                            .push(target);
                    }
                }
            }
            Event::DumpBegin { name, .. } =>
            {
                if missing
                    .shift_remove(&NameUtils::key(&name))
                    .is_some()
                {
                    report.recovered += 1;
                }
            }
            _ =>
            {}
        }
    }

    report.missing = missing
        .into_values()
        .collect();
    diag.set("attempted", report.attempted);
    diag.set("not_found", report.not_found);
    diag.set("ignored", report.ignored);
    diag.set("recovered", report.recovered);
    diag.set("unplanned", report.unplanned.len() as u64);
    diag.set("missing", report.missing.len() as u64);
    Ok(report)
}

/// Write the makeup plan: one batch series per section, `max_batch_size`
/// objects per file.
pub fn write_makeup(
    report: &UndumpedReport,
    makeup_dir: &Path,
    max_batch_size: usize,
) -> Result<PlanManifest>
{
    if max_batch_size == 0
    {
        bail!("max_batch_size must be at least 1");
    }
    let mut writer = PlanWriter::begin(Some(makeup_dir))?;
    let mut stats = PlanStats::default();
    for (section, names) in report.by_section()
    {
        for (sequence, chunk) in names
            .chunks(max_batch_size)
            .enumerate()
        {
            let batch = DumpBatch {
                section: section.to_string(),
                sequence,
                objects: chunk
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            };
            stats.planned += batch.objects.len() as u64;
            stats.batches += 1;
            writer.write_batch(&batch)?;
        }
    }
    writer.finish(&[], stats, max_batch_size)
}

pub fn run(
    args: UndumpedArgs,
    ctx: &AppContext,
) -> Result<()>
{
    let config = load_config(ctx.config_path.as_deref())?.plan;
    let max_batch_size = args
        .max_batch_size
        .unwrap_or(config.max_batch_size);
    let makeup_dir: PathBuf = args
        .makeup
        .clone()
        .unwrap_or_else(|| args.plan.join(MAKEUP_DIR));

    let mut diag = PhaseDiagnostics::new("undumped");
    let result = check(&args.plan, &args.log, &config.reserved_root_class, &mut diag).and_then(|report| {
        if report
            .missing
            .is_empty()
        {
            return Ok(report);
        }
        if ctx.dry_run
        {
            if !ctx.quiet
            {
                println!("{} {}", "DRY RUN: Would write makeup plan to".yellow(), makeup_dir.display());
            }
        }
        else
        {
            let manifest = write_makeup(&report, &makeup_dir, max_batch_size)?;
            diag.set("makeup_batches", manifest.batches.len() as u64);
            info!(dir = %makeup_dir.display(), batches = manifest.batches.len(), "makeup plan written");
        }
        Ok(report)
    });

    match &result
    {
        Ok(report) =>
        {
            diag.mark_complete();
            if !ctx.quiet
            {
                if report
                    .missing
                    .is_empty()
                {
                    println!("No undumped objects");
                }
                else
                {
                    println!("{}", report.render_table());
                }
            }
        }
        Err(e) => diag.record_error(e),
    }
    diag.emit(ctx, args.diagnostics.as_deref())?;
    result.map(|_| ())
}
