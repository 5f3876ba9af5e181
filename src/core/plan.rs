//! Dump plan builder.
//!
//! Condenses resolved sections into batches of `obj dump` commands. A single
//! global seen-set spans the whole plan, so an object confirmed in several
//! sections is only planned the first time it is visited.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use indexmap::IndexSet;
use owo_colors::OwoColorize;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::cli::{AppContext, PlanArgs};
use crate::core::diagnostics::PhaseDiagnostics;
use crate::core::reader::{ReaderOptions, SectionReader};
use crate::core::resolve::{ResolvedSection, Resolver, pass_forward};
use crate::infra::config::{PlanConfig, load_config};
use crate::infra::io::string_to_latin1;
use crate::infra::output::{OutputGuard, write_json_atomic};
use crate::infra::utils::{NameUtils, ProgressUtils};

/// Synthetic section holding default-object sentinels.
pub const DEFAULTS_SECTION: &str = "defaults";

/// Manifest written next to the batch files.
pub const PLAN_MANIFEST: &str = "plan.json";

#[derive(Debug, Clone)]
pub struct PlanOptions
{
    pub max_batch_size: usize,
    pub excluded_classes: BTreeSet<String>,
    pub reserved_root_class: String,
    pub synthesize_defaults: bool,
}

impl PlanOptions
{
    pub fn from_config(cfg: &PlanConfig) -> Result<Self>
    {
        let opts = Self {
            max_batch_size: cfg.max_batch_size,
            excluded_classes: cfg
                .excluded_classes
                .clone(),
            reserved_root_class: cfg
                .reserved_root_class
                .clone(),
            synthesize_defaults: cfg.synthesize_defaults,
        };
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()>
    {
        if self.max_batch_size == 0
        {
            bail!("max_batch_size must be at least 1");
        }
        Ok(())
    }
}

/// One independently executable group of dump commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpBatch
{
    pub section: String,
    pub sequence: usize,
    pub objects: Vec<String>,
}

impl DumpBatch
{
    /// `<section>.<NNN>`
    pub fn file_name(&self) -> String
    {
        format!("{}.{:03}", self.section, self.sequence)
    }

    /// File contents: one `obj dump` command per line, Latin-1.
    pub fn render(&self) -> Vec<u8>
    {
        let mut out = Vec::new();
        for name in &self.objects
        {
            out.extend_from_slice(b"obj dump ");
            out.extend_from_slice(&string_to_latin1(name));
            out.push(b'\n');
        }
        out
    }
}

/// Totals over a whole plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanStats
{
    pub confirmed: u64,
    pub planned: u64,
    pub already_planned: u64,
    pub excluded: u64,
    pub reserved: u64,
    pub defaults: u64,
    pub batches: u64,
}

/// Sequential plan builder owning the global seen-set.
#[derive(Debug)]
pub struct PlanBuilder
{
    opts: PlanOptions,
    seen: IndexSet<String>,
    classes: IndexSet<String>,
    reserved_sentinel: String,
    stats: PlanStats,
}

impl PlanBuilder
{
    pub fn new(opts: PlanOptions) -> Result<Self>
    {
        opts.validate()?;
        let reserved_sentinel =
            NameUtils::key(&NameUtils::default_object(&opts.reserved_root_class));
        Ok(Self {
            opts,
            seen: IndexSet::new(),
            classes: IndexSet::new(),
            reserved_sentinel,
            stats: PlanStats::default(),
        })
    }

    fn is_reserved_sentinel(
        &self,
        name: &str,
    ) -> bool
    {
        NameUtils::key(NameUtils::last_component(name)) == self.reserved_sentinel
    }

    /// Plan one resolved section, returning its sealed batches in order.
    pub fn push_section(
        &mut self,
        resolved: &ResolvedSection,
    ) -> Vec<DumpBatch>
    {
        let mut batches = Vec::new();
        let mut current: Vec<String> = Vec::new();

        for obj in &resolved.confirmed
        {
            self.stats.confirmed += 1;

            if self
                .opts
                .excluded_classes
                .contains(&obj.class_name)
            {
                self.stats.excluded += 1;
                continue;
            }
            if self.is_reserved_sentinel(&obj.qualified_name)
            {
                self.stats.reserved += 1;
                continue;
            }

            self.classes
                .insert(obj.class_name.clone());

            if !self
                .seen
                .insert(obj.key())
            {
                self.stats.already_planned += 1;
                continue;
            }

            current.push(obj.qualified_name.clone());
            if current.len() == self.opts.max_batch_size
            {
                batches.push(self.seal(&resolved.section.id, batches.len(), &mut current));
            }
        }
        if !current.is_empty()
        {
            batches.push(self.seal(&resolved.section.id, batches.len(), &mut current));
        }

        debug!(section = %resolved.section, batches = batches.len(), "section planned");
        batches
    }

    fn seal(
        &mut self,
        section: &str,
        sequence: usize,
        current: &mut Vec<String>,
    ) -> DumpBatch
    {
        self.stats.planned += current.len() as u64;
        self.stats.batches += 1;
        DumpBatch {
            section: section.to_string(),
            sequence,
            objects: std::mem::take(current),
        }
    }

    /// Seal the plan, producing the default-object batches.
    pub fn finish(mut self) -> (Vec<DumpBatch>, PlanStats)
    {
        let mut batches = Vec::new();
        if self
            .opts
            .synthesize_defaults
        {
            let mut current = Vec::new();
            let classes = std::mem::take(&mut self.classes);
            for class in classes
            {
                if class == self.opts.reserved_root_class
                {
                    continue;
                }
                let sentinel = NameUtils::default_object(&class);
                if !self
                    .seen
                    .insert(NameUtils::key(&sentinel))
                {
                    continue;
                }
                self.stats.defaults += 1;
                current.push(sentinel);
                if current.len() == self.opts.max_batch_size
                {
                    batches.push(self.seal(DEFAULTS_SECTION, batches.len(), &mut current));
                }
            }
            if !current.is_empty()
            {
                batches.push(self.seal(DEFAULTS_SECTION, batches.len(), &mut current));
            }
        }
        (batches, self.stats)
    }
}

/// Entry of the plan manifest, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry
{
    pub file: String,
    pub section: String,
    pub sequence: usize,
    pub objects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanManifest
{
    pub max_batch_size: usize,
    pub batches: Vec<ManifestEntry>,
    pub stats: PlanStats,
}

/// Writes batch files as they are sealed, then the manifest.
pub struct PlanWriter
{
    guard: Option<OutputGuard>,
    section_batches: Vec<ManifestEntry>,
}

impl PlanWriter
{
    /// `out = None` builds the manifest without touching disk.
    pub fn begin(out: Option<&Path>) -> Result<Self>
    {
        let guard = match out
        {
            Some(dir) =>
            {
                let guard = OutputGuard::begin(dir, "plan")?;
                clear_stale_batches(dir)?;
                Some(guard)
            }
            None => None,
        };
        Ok(Self { guard, section_batches: Vec::new() })
    }

    fn write(
        &self,
        batch: &DumpBatch,
    ) -> Result<ManifestEntry>
    {
        if let Some(guard) = &self.guard
        {
            let path = guard
                .dir()
                .join(batch.file_name());
            fs::write(&path, batch.render())
                .with_context(|| format!("Failed to write batch {}", path.display()))?;
        }
        Ok(ManifestEntry {
            file: batch.file_name(),
            section: batch
                .section
                .clone(),
            sequence: batch.sequence,
            objects: batch
                .objects
                .len(),
        })
    }

    pub fn write_batch(
        &mut self,
        batch: &DumpBatch,
    ) -> Result<()>
    {
        let entry = self.write(batch)?;
        self.section_batches
            .push(entry);
        Ok(())
    }

    /// Write default batches and the manifest (defaults first), then mark
    /// the directory complete.
    pub fn finish(
        self,
        defaults: &[DumpBatch],
        stats: PlanStats,
        max_batch_size: usize,
    ) -> Result<PlanManifest>
    {
        let mut batches = Vec::with_capacity(defaults.len() + self.section_batches.len());
        for batch in defaults
        {
            batches.push(self.write(batch)?);
        }
        batches.extend(self.section_batches);

        let manifest = PlanManifest { max_batch_size, batches, stats };
        if let Some(guard) = self.guard
        {
            write_json_atomic(
                &guard
                    .dir()
                    .join(PLAN_MANIFEST),
                &manifest,
            )?;
            guard.complete()?;
        }
        Ok(manifest)
    }
}

/// Remove batch files and manifest left by an earlier plan in `dir`.
fn clear_stale_batches(dir: &Path) -> Result<()>
{
    let batch_re = Regex::new(r"^\w+\.\d{3}$")?;
    let mut removed = 0usize;
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?
    {
        let entry = entry?;
        let name = entry
            .file_name()
            .to_string_lossy()
            .into_owned();
        if entry
            .file_type()?
            .is_file()
            && (batch_re.is_match(&name) || name == PLAN_MANIFEST)
        {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0
    {
        debug!(removed, dir = %dir.display(), "cleared previous plan");
    }
    Ok(())
}

/// Resolve the enumeration logs and build the plan into `out`. Without a
/// reverse log every forward object is planned unconfirmed.
#[instrument(skip(opts, ctx, diag))]
pub fn build_plan(
    forward: &Path,
    reverse: Option<&Path>,
    out: Option<&Path>,
    opts: PlanOptions,
    ctx: &AppContext,
    diag: &mut PhaseDiagnostics,
) -> Result<PlanManifest>
{
    let max_batch_size = opts.max_batch_size;
    let mut builder = PlanBuilder::new(opts)?;
    let pb = ProgressUtils::spinner(ctx, "reading enumerations");

    let resolver = match reverse
    {
        Some(reverse) =>
        {
            pb.set_message("spooling reverse enumeration");
            Some(Resolver::spool_reverse(
                SectionReader::open(reverse, ReaderOptions::enumeration())?,
                diag,
            )?)
        }
        None =>
        {
            diag.set("unfiltered", 1);
            None
        }
    };

    let mut writer = PlanWriter::begin(out)?;
    pb.set_message("resolving forward enumeration");
    let forward = SectionReader::open(forward, ReaderOptions::enumeration())?;
    let mut plan_section = |resolved: ResolvedSection| -> Result<()> {
        pb.inc(1);
        pb.set_message(resolved.section.id.clone());
        for batch in builder.push_section(&resolved)
        {
            writer.write_batch(&batch)?;
        }
        Ok(())
    };
    match &resolver
    {
        Some(resolver) => resolver.resolve_forward(forward, diag, &mut plan_section)?,
        None => pass_forward(forward, diag, &mut plan_section)?,
    }
    pb.finish_and_clear();

    let (defaults, stats) = builder.finish();
    diag.set("planned", stats.planned);
    diag.set("already_planned", stats.already_planned);
    diag.set("excluded", stats.excluded);
    diag.set("reserved_skipped", stats.reserved);
    diag.set("defaults", stats.defaults);
    diag.set("batches", stats.batches);

    let manifest = writer.finish(&defaults, stats, max_batch_size)?;
    info!(batches = manifest.batches.len(), "plan built");
    Ok(manifest)
}

pub fn run(
    args: PlanArgs,
    ctx: &AppContext,
) -> Result<()>
{
    let config = load_config(ctx.config_path.as_deref())?;
    let mut plan_cfg = config.plan;
    if let Some(n) = args.max_batch_size
    {
        plan_cfg.max_batch_size = n;
    }
    plan_cfg
        .excluded_classes
        .extend(args.exclude.iter().cloned());
    if args.no_defaults
    {
        plan_cfg.synthesize_defaults = false;
    }

    let mut diag = PhaseDiagnostics::new("plan");
    let out: Option<PathBuf> = (!ctx.dry_run).then(|| args.out.clone());
    let result = PlanOptions::from_config(&plan_cfg).and_then(|opts| {
        build_plan(&args.forward, args.reverse.as_deref(), out.as_deref(), opts, ctx, &mut diag)
    });

    match &result
    {
        Ok(manifest) =>
        {
            diag.mark_complete();
            if !ctx.quiet
            {
                let verb = if ctx.dry_run { "Would write" } else { "Wrote" };
                let line = format!(
                    "{verb} {} batch files to {}",
                    manifest.batches.len(),
                    args.out.display()
                );
                if ctx.no_color
                {
                    println!("{line}");
                }
                else
                {
                    println!("{}", line.green());
                }
            }
        }
        Err(e) => diag.record_error(e),
    }
    diag.emit(ctx, args.diagnostics.as_deref())?;
    result.map(|_| ())
}
