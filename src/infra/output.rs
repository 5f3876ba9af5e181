//! Output directory guard with an `INCOMPLETE` marker.
//!
//! A phase claims its output directory by writing the marker first and only
//! removes it once everything has been written and verified. Any early
//! return, error, or panic leaves the marker behind, so a partial directory
//! can never be mistaken for a finished one.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Marker file name present while a directory is being produced.
pub const INCOMPLETE_MARKER: &str = "INCOMPLETE";

/// Claims a directory for writing; see module docs.
#[derive(Debug)]
pub struct OutputGuard {
    dir: PathBuf,
    marker: PathBuf,
    completed: bool,
}

impl OutputGuard {
    /// Create `dir` (if needed) and drop the marker into it.
    pub fn begin(dir: &Path, phase: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create output dir: {}", dir.display()))?;

        let marker = dir.join(INCOMPLETE_MARKER);
        let mut f = File::create(&marker)
            .with_context(|| format!("create marker: {}", marker.display()))?;
        writeln!(f, "phase={phase}").ok();
        writeln!(f, "started={}", chrono::Utc::now().to_rfc3339()).ok();
        f.sync_all().ok();

        Ok(Self {
            dir: dir.to_path_buf(),
            marker,
            completed: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove the marker; the directory is now a finished product.
    pub fn complete(mut self) -> Result<()> {
        fs::remove_file(&self.marker)
            .with_context(|| format!("remove marker: {}", self.marker.display()))?;
        let _ = sync_dir(&self.dir);
        self.completed = true;
        Ok(())
    }

    /// Record why the output was abandoned, keeping the marker in place.
    pub fn abandon(self, reason: &str) {
        if let Ok(mut f) = OpenOptions::new().append(true).open(&self.marker) {
            let _ = writeln!(f, "reason={reason}");
            let _ = f.sync_all();
        }
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if !self.completed {
            tracing::warn!(dir = %self.dir.display(), "output left marked incomplete");
        }
    }
}

/// True when `dir` carries the incomplete marker.
pub fn is_incomplete(dir: &Path) -> bool {
    dir.join(INCOMPLETE_MARKER).exists()
}

/// Refuse to read a directory that a previous phase did not finish.
pub fn ensure_complete(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("not a directory: {}", dir.display());
    }
    if is_incomplete(dir) {
        bail!(
            "{} is marked incomplete (found {}); rerun the phase that produced it",
            dir.display(),
            INCOMPLETE_MARKER
        );
    }
    Ok(())
}

/// Serialize `value` as pretty JSON via temp file + rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize json")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text.as_bytes()).with_context(|| format!("write {}", tmp.display()))?;
    File::open(&tmp)?.sync_all().ok();
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} → {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Cross-platform directory fsync helper.
#[cfg(unix)]
fn sync_dir(p: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let f = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(p)?;
    f.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_p: &Path) -> std::io::Result<()> {
    // No reliable directory fsync here; best-effort no-op.
    Ok(())
}
