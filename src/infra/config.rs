use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::{AppContext, InitArgs};
use crate::core::archive::BlobLayout;

/// Config file names looked up in the working directory, in priority order.
pub const CONFIG_FILES: [&str; 3] = ["dumpsieve.toml", ".dumpsieve.toml", "dumpsieve.json"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config
{
    /// Dump plan construction
    pub plan: PlanConfig,

    /// Dump log categorization and redaction
    pub categorize: CategorizeConfig,

    /// Cross-run comparison noise filters
    pub compare: CompareConfig,

    /// Archive packaging
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig
{
    /// Maximum dump commands per batch file
    pub max_batch_size: usize,

    /// Classes never planned (their dumps crash the producing session)
    pub excluded_classes: BTreeSet<String>,

    /// Root class whose default object must never be dumped
    pub reserved_root_class: String,

    /// Emit one default-object dump per encountered class
    pub synthesize_defaults: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CategorizeConfig
{
    /// Ceiling on simultaneously open per-class output files
    pub max_open_files: usize,

    /// Literal redaction patterns, one per line
    pub scrub_file: Option<PathBuf>,

    /// Previously accepted scrub hits (`scrub_hits.tsv`)
    pub known_hits_file: Option<PathBuf>,

    /// Tag introducing the 16-byte identifier field
    pub identifier_tag: String,

    /// Classes whose dumps are expected to carry the identifier tag
    pub identifier_classes: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareConfig
{
    /// Class globs suppressed by `--suppress-known-noise-classes`
    pub known_noise_classes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig
{
    pub layout: BlobLayout,

    /// Uncompressed size at which a per-class blob is rolled over
    pub max_blob_bytes: u64,
}

impl Default for PlanConfig
{
    fn default() -> Self
    {
        Self {
            max_batch_size: 800,
            excluded_classes: [
                "AnimSequence",
                "SwfMovie",
                "GFxRawData",
                "GBXNavMesh",
                "Terrain",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            reserved_root_class: "Class".to_string(),
            synthesize_defaults: true,
        }
    }
}

impl Default for CategorizeConfig
{
    fn default() -> Self
    {
        Self {
            max_open_files: 1000,
            scrub_file: None,
            known_hits_file: None,
            identifier_tag: "UniqueId=".to_string(),
            identifier_classes: BTreeSet::new(),
        }
    }
}

impl Default for ArchiveConfig
{
    fn default() -> Self
    {
        Self { layout: BlobLayout::PerClass, max_blob_bytes: 15 * 1024 * 1024 }
    }
}

impl Config
{
    /// Expand `~` and `$VAR` in configured paths.
    fn expand_paths(&mut self) -> Result<()>
    {
        for slot in [
            &mut self
                .categorize
                .scrub_file,
            &mut self
                .categorize
                .known_hits_file,
        ]
        {
            if let Some(p) = slot.take()
            {
                let raw = p
                    .to_string_lossy()
                    .into_owned();
                let expanded = shellexpand::full(&raw)
                    .with_context(|| format!("Failed to expand path {raw}"))?;
                *slot = Some(PathBuf::from(expanded.as_ref()));
            }
        }
        Ok(())
    }
}

/// Load configuration from an explicit file, or the first of
/// [`CONFIG_FILES`] found in the working directory, layered under
/// `DUMPSIEVE__*` environment variables.
pub fn load_config(explicit: Option<&Path>) -> Result<Config>
{
    let mut builder = config::Config::builder();

    if let Some(path) = explicit
    {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    else
    {
        for path in &CONFIG_FILES
        {
            if Path::new(path).exists()
            {
                builder = builder.add_source(config::File::with_name(path));
                break;
            }
        }
    }

    // e.g. DUMPSIEVE__PLAN__MAX_BATCH_SIZE=500
    builder = builder.add_source(
        config::Environment::with_prefix("DUMPSIEVE")
            .prefix_separator("__")
            .separator("__"),
    );

    let cfg = builder
        .build()
        .context("Failed to load configuration")?;
    let mut parsed: Config = cfg
        .try_deserialize()
        .context("Failed to parse configuration")?;
    parsed.expand_paths()?;

    Ok(parsed)
}

pub fn init(
    args: InitArgs,
    ctx: &AppContext,
) -> Result<()>
{
    let config_path = args
        .path
        .join(CONFIG_FILES[0]);

    if config_path.exists() && !args.force
    {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    if ctx.dry_run
    {
        if !ctx.quiet
        {
            println!("Would write {}:\n{toml_string}", config_path.display());
        }
        return Ok(());
    }

    std::fs::write(&config_path, toml_string).context("Failed to write config file")?;

    if !ctx.quiet
    {
        println!("Created config file at {}", config_path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml()
    {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.plan.max_batch_size, 800);
        assert!(back
            .plan
            .excluded_classes
            .contains("AnimSequence"));
        assert_eq!(back.categorize.identifier_tag, "UniqueId=");
        assert_eq!(back.archive.layout, BlobLayout::PerClass);
    }

    #[test]
    fn partial_file_keeps_other_defaults()
    {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("custom.toml");
        std::fs::write(&path, "[plan]\nmax_batch_size = 5\n").unwrap();

        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.plan.max_batch_size, 5);
        assert_eq!(cfg.plan.reserved_root_class, "Class");
        assert_eq!(cfg.categorize.max_open_files, 1000);
    }
}
