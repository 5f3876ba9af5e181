//! Bounded pool of per-class output files.
//!
//! A dump log can mention thousands of classes, more than many systems allow
//! open at once. Writers live in an LRU cache keyed by class; the least
//! recently written one is flushed and closed when the pool is full and
//! reopened in append mode on its next write. When the OS refuses a new
//! descriptor anyway, half the pool is evicted and the pool shrinks to fit.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use lru::LruCache;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::diagnostics::FileHandleExhaustion;

const SINK_BUFFER_BYTES: usize = 64 * 1024;

/// File extension of categorized class files.
pub const DUMP_EXTENSION: &str = "dump";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub classes: u64,
    pub opened: u64,
    pub reopened: u64,
    pub evictions: u64,
    pub exhaustion_events: u64,
    pub peak_open: u64,
    pub final_capacity: u64,
}

/// Opens one sink file: `first` creates (truncating), otherwise appends.
/// Also receives the number of sinks currently open.
pub type SinkOpener = Box<dyn FnMut(&Path, bool, usize) -> io::Result<File>>;

pub struct SinkPool {
    dir: PathBuf,
    open: LruCache<String, BufWriter<File>>,
    created: HashSet<String>,
    stats: SinkStats,
    opener: SinkOpener,
}

fn open_sink(path: &Path, first: bool, _open: usize) -> io::Result<File> {
    if first {
        File::create(path)
    } else {
        OpenOptions::new().append(true).open(path)
    }
}

/// True for "too many open files" errors.
fn is_exhaustion(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
    }
    #[cfg(not(unix))]
    {
        // ERROR_TOO_MANY_OPEN_FILES
        err.raw_os_error() == Some(4)
    }
}

impl SinkPool {
    pub fn new(dir: &Path, max_open: usize) -> Result<Self> {
        let Some(cap) = NonZeroUsize::new(max_open) else {
            bail!("max_open_files must be at least 1");
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            open: LruCache::new(cap),
            created: HashSet::new(),
            stats: SinkStats::default(),
            opener: Box::new(open_sink),
        })
    }

    /// Replace how sink files are opened.
    #[cfg(test)]
    pub(crate) fn set_opener(&mut self, opener: SinkOpener) {
        self.opener = opener;
    }

    pub fn path_for(&self, class: &str) -> PathBuf {
        self.dir.join(format!("{class}.{DUMP_EXTENSION}"))
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn capacity(&self) -> usize {
        self.open.cap().get()
    }

    /// Append `data` to the sink of `class`. Returns the exhaustion event if
    /// opening the sink required emergency eviction.
    pub fn write(&mut self, class: &str, data: &[u8]) -> Result<Option<FileHandleExhaustion>> {
        let pressure = self.acquire(class)?;
        let path = self.path_for(class);
        let writer = self
            .open
            .get_mut(class)
            .with_context(|| format!("sink for {class} vanished from pool"))?;
        writer
            .write_all(data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(pressure)
    }

    fn acquire(&mut self, class: &str) -> Result<Option<FileHandleExhaustion>> {
        if self.open.contains(class) {
            return Ok(None);
        }

        let path = self.path_for(class);
        let first = !self.created.contains(class);
        let mut pressure = None;

        let file = loop {
            match (self.opener)(&path, first, self.open.len()) {
                Ok(f) => break f,
                Err(e) if is_exhaustion(&e) && !self.open.is_empty() => {
                    let event = FileHandleExhaustion {
                        class: class.to_string(),
                        open: self.open.len(),
                    };
                    warn!(%event, "evicting half of the sink pool");
                    self.stats.exhaustion_events += 1;
                    self.shed(self.open.len().div_ceil(2))?;
                    // The OS limit is below our ceiling; stay under it
                    let cap = NonZeroUsize::new(self.open.len().max(1)).unwrap_or(NonZeroUsize::MIN);
                    self.open.resize(cap);
                    pressure = Some(event);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to open sink {}", path.display()));
                }
            }
        };

        if first {
            self.created.insert(class.to_string());
            self.stats.classes += 1;
            self.stats.opened += 1;
        } else {
            self.stats.reopened += 1;
        }

        let writer = BufWriter::with_capacity(SINK_BUFFER_BYTES, file);
        if let Some((evicted, mut w)) = self.open.push(class.to_string(), writer) {
            // push only returns an entry for a different key when full
            self.stats.evictions += 1;
            w.flush()
                .with_context(|| format!("Failed to flush sink {evicted}"))?;
            debug!(evicted = %evicted, "sink evicted");
        }
        self.stats.peak_open = self.stats.peak_open.max(self.open.len() as u64);
        Ok(pressure)
    }

    /// Flush and close the `n` least recently written sinks.
    fn shed(&mut self, n: usize) -> Result<()> {
        for _ in 0..n {
            let Some((class, mut w)) = self.open.pop_lru() else {
                break;
            };
            self.stats.evictions += 1;
            w.flush()
                .with_context(|| format!("Failed to flush sink {class}"))?;
        }
        Ok(())
    }

    /// Flush every open sink without closing it.
    pub fn flush_all(&mut self) -> Result<()> {
        for (class, w) in self.open.iter_mut() {
            w.flush()
                .with_context(|| format!("Failed to flush sink {class}"))?;
        }
        Ok(())
    }

    /// Flush and close everything.
    pub fn close_all(mut self) -> Result<SinkStats> {
        while let Some((class, mut w)) = self.open.pop_lru() {
            w.flush()
                .with_context(|| format!("Failed to flush sink {class}"))?;
        }
        self.stats.final_capacity = self.open.cap().get() as u64;
        Ok(self.stats)
    }

    /// Classes that have a file in this run, unordered.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.created.iter().map(String::as_str)
    }
}

/// Opener that runs out of descriptors once `limit` sinks are open.
#[cfg(all(test, unix))]
pub(crate) fn limited_opener(limit: usize) -> SinkOpener {
    Box::new(move |path: &Path, first: bool, open: usize| {
        if open >= limit {
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }
        open_sink(path, first, open)
    })
}
