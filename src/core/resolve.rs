//! Differential object-set resolver.
//!
//! Two full enumerations of the same game state, visited in opposite level
//! orders, are intersected per section. Only names present in both passes
//! (compared case-insensitively) are trusted as stable.
//!
//! The reverse enumeration is spooled first into one gzip file per section
//! under a private temp dir; the forward log is then streamed and each
//! section is resolved against its spooled counterpart, so only one
//! section's name set is ever held in memory.

use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use indexmap::IndexMap;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, instrument};

use crate::core::diagnostics::{LogSide, PhaseDiagnostics, SectionSetMismatch};
use crate::core::reader::{Event, LogSection, ObjectRecord, SectionReader};
use crate::infra::io::{
    create_gz_writer, finish_gz_writer, latin1_to_string, open_log, read_line_bytes,
    string_to_latin1,
};
use crate::infra::utils::NameUtils;

/// Per-section tallies, reported alongside the confirmed objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SectionTally {
    pub forward_distinct: u64,
    pub confirmed: u64,
    pub unconfirmed: u64,
    pub reverse_only: u64,
    pub repeats: u64,
}

/// Confirmed objects of one forward section, in forward visitation order.
#[derive(Debug, Clone)]
pub struct ResolvedSection {
    pub section: Arc<LogSection>,
    pub confirmed: Vec<ObjectRecord>,
    pub tally: SectionTally,
}

/// Reverse enumeration spooled to disk, keyed by section id.
pub struct Resolver {
    dir: TempDir,
    spooled: IndexMap<String, PathBuf>,
}

impl Resolver {
    /// Spool the reverse enumeration. Reader events other than objects and
    /// section starts are folded into `diag`.
    #[instrument(skip_all)]
    pub fn spool_reverse<R: BufRead>(
        reverse: SectionReader<R>,
        diag: &mut PhaseDiagnostics,
    ) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("dsv-reverse-")
            .tempdir()
            .context("Failed to create spool directory")?;
        let mut spooled = IndexMap::new();
        let mut current: Option<GzEncoder<std::io::BufWriter<std::fs::File>>> = None;

        for event in reverse {
            match event? {
                Event::SectionStart(section) => {
                    if let Some(w) = current.take() {
                        finish_gz_writer(w)?;
                    }
                    let path = dir.path().join(format!("{:05}.gz", section.ordinal));
                    current = Some(create_gz_writer(&path)?);
                    spooled.insert(section.id.clone(), path);
                    diag.add("reverse_sections", 1);
                }
                Event::Object(rec) => {
                    if let Some(w) = current.as_mut() {
                        let mut line = string_to_latin1(&rec.key());
                        line.push(b'\n');
                        w.write_all(&line).context("Failed to write spool file")?;
                        diag.add("reverse_objects", 1);
                    }
                }
                other => fold_reader_signal(other, LogSide::Reverse, diag),
            }
        }
        if let Some(w) = current.take() {
            finish_gz_writer(w)?;
        }

        debug!(sections = spooled.len(), dir = %dir.path().display(), "reverse enumeration spooled");
        Ok(Self { dir, spooled })
    }

    pub fn spooled_sections(&self) -> impl Iterator<Item = &str> {
        self.spooled.keys().map(String::as_str)
    }

    fn load(&self, id: &str) -> Result<Option<HashSet<String>>> {
        let Some(path) = self.spooled.get(id) else {
            return Ok(None);
        };
        let mut reader = open_log(path)?;
        let mut set = HashSet::new();
        let mut buf = Vec::new();
        while read_line_bytes(&mut reader, &mut buf)
            .with_context(|| format!("Failed to read spool {}", path.display()))?
        {
            set.insert(latin1_to_string(&buf));
        }
        Ok(Some(set))
    }

    /// Stream the forward enumeration, handing each resolved section to
    /// `sink` as soon as the next section starts.
    #[instrument(skip_all)]
    pub fn resolve_forward<R, F>(
        &self,
        forward: SectionReader<R>,
        diag: &mut PhaseDiagnostics,
        mut sink: F,
    ) -> Result<()>
    where
        R: BufRead,
        F: FnMut(ResolvedSection) -> Result<()>,
    {
        let mut open: Option<OpenSection> = None;
        let mut visited: HashSet<String> = HashSet::new();

        for event in forward {
            match event? {
                Event::SectionStart(section) => {
                    if let Some(done) = open.take() {
                        sink(done.close(diag))?;
                    }
                    visited.insert(section.id.clone());
                    let reverse = self.load(&section.id)?;
                    if reverse.is_none() {
                        diag.fail(
                            SectionSetMismatch {
                                section: section.id.clone(),
                                only_in: LogSide::Forward,
                            }
                            .to_string(),
                        );
                        diag.add("section_mismatches", 1);
                    }
                    diag.add("sections", 1);
                    open = Some(OpenSection::new(section, reverse));
                }
                Event::Object(rec) => {
                    if let Some(sec) = open.as_mut() {
                        sec.observe(rec);
                    }
                }
                other => fold_reader_signal(other, LogSide::Forward, diag),
            }
        }
        if let Some(done) = open.take() {
            sink(done.close(diag))?;
        }

        for id in self.spooled.keys() {
            if !visited.contains(id) {
                diag.fail(
                    SectionSetMismatch {
                        section: id.clone(),
                        only_in: LogSide::Reverse,
                    }
                    .to_string(),
                );
                diag.add("section_mismatches", 1);
            }
        }
        Ok(())
    }

    /// Path of the spool directory; removed when the resolver drops.
    pub fn spool_dir(&self) -> &std::path::Path {
        self.dir.path()
    }
}

struct OpenSection {
    section: Arc<LogSection>,
    reverse: Option<HashSet<String>>,
    accept_all: bool,
    seen: HashSet<String>,
    confirmed: Vec<ObjectRecord>,
    tally: SectionTally,
}

impl OpenSection {
    fn new(section: Arc<LogSection>, reverse: Option<HashSet<String>>) -> Self {
        Self {
            section,
            reverse,
            accept_all: false,
            seen: HashSet::new(),
            confirmed: Vec::new(),
            tally: SectionTally::default(),
        }
    }

    fn unfiltered(section: Arc<LogSection>) -> Self {
        Self {
            accept_all: true,
            ..Self::new(section, None)
        }
    }

    fn observe(&mut self, rec: ObjectRecord) {
        let key = NameUtils::key(&rec.qualified_name);
        if !self.seen.insert(key.clone()) {
            self.tally.repeats += 1;
            return;
        }
        self.tally.forward_distinct += 1;

        // Removing on match leaves exactly the reverse-only names behind
        let in_reverse = self.accept_all
            || self
                .reverse
                .as_mut()
                .is_some_and(|set| set.remove(&key));
        if in_reverse {
            self.tally.confirmed += 1;
            self.confirmed.push(rec);
        } else {
            self.tally.unconfirmed += 1;
        }
    }

    fn close(self, diag: &mut PhaseDiagnostics) -> ResolvedSection {
        let mut tally = self.tally;
        tally.reverse_only = self.reverse.as_ref().map_or(0, |s| s.len() as u64);

        diag.add("forward_objects", tally.forward_distinct);
        diag.add("confirmed", tally.confirmed);
        diag.add("unconfirmed", tally.unconfirmed);
        diag.add("reverse_only", tally.reverse_only);
        diag.add("repeats", tally.repeats);
        debug!(section = %self.section, ?tally, "section resolved");

        ResolvedSection {
            section: self.section,
            confirmed: self.confirmed,
            tally,
        }
    }
}

/// Forward-only resolution: every distinct object of each forward section
/// counts as confirmed. No reverse pass, so no section-set checks.
#[instrument(skip_all)]
pub fn pass_forward<R, F>(
    forward: SectionReader<R>,
    diag: &mut PhaseDiagnostics,
    mut sink: F,
) -> Result<()>
where
    R: BufRead,
    F: FnMut(ResolvedSection) -> Result<()>,
{
    let mut open: Option<OpenSection> = None;
    for event in forward {
        match event? {
            Event::SectionStart(section) => {
                if let Some(done) = open.take() {
                    sink(done.close(diag))?;
                }
                diag.add("sections", 1);
                open = Some(OpenSection::unfiltered(section));
            }
            Event::Object(rec) => {
                if let Some(sec) = open.as_mut() {
                    sec.observe(rec);
                }
            }
            other => fold_reader_signal(other, LogSide::Forward, diag),
        }
    }
    if let Some(done) = open.take() {
        sink(done.close(diag))?;
    }
    Ok(())
}

/// Record reader-level structure problems.
pub(crate) fn fold_reader_signal(event: Event, side: LogSide, diag: &mut PhaseDiagnostics) {
    let side = match side {
        LogSide::Forward => "forward",
        LogSide::Reverse => "reverse",
    };
    match event {
        Event::Malformed(m) => {
            diag.add("malformed", 1);
            diag.warn(format!("{side}: {m}"));
        }
        Event::Incomplete(i) => {
            diag.add("incomplete_sections", 1);
            diag.warn(format!("{side}: {i}"));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reader::ReaderOptions;
    use std::io::Cursor;

    fn enumeration(sections: &[(&str, &[&str])]) -> SectionReader<Cursor<Vec<u8>>> {
        let mut text = String::from("Log: Log file open, 01/01/19 00:00:00\n");
        for (id, objs) in sections {
            text.push_str(&format!(
                "[0001.00] Log: No objects found using command 'obj dump switch.to.{id}'\n"
            ));
            for (i, o) in objs.iter().enumerate() {
                text.push_str(&format!("[0002.00] Log: {i}) Foo {o}.Name = '{o}'\n"));
            }
        }
        text.push_str("Log: Closing by request\n");
        SectionReader::new(Cursor::new(text.into_bytes()), ReaderOptions::enumeration())
    }

    fn resolve(
        fwd: &[(&str, &[&str])],
        rev: &[(&str, &[&str])],
    ) -> (Vec<ResolvedSection>, PhaseDiagnostics) {
        let mut diag = PhaseDiagnostics::new("resolve");
        let resolver = Resolver::spool_reverse(enumeration(rev), &mut diag).unwrap();
        let mut out = Vec::new();
        resolver
            .resolve_forward(enumeration(fwd), &mut diag, |s| {
                out.push(s);
                Ok(())
            })
            .unwrap();
        (out, diag)
    }

    fn names(s: &ResolvedSection) -> Vec<&str> {
        s.confirmed.iter().map(|o| o.qualified_name.as_str()).collect()
    }

    #[test]
    fn intersects_per_section_across_orderings() {
        let (out, diag) = resolve(
            &[("MapA_P", &["X", "Y", "Z"]), ("MapB_P", &["X", "Y", "Z"])],
            &[("MapB_P", &["X", "Y", "Z"]), ("MapA_P", &["X", "Y"])],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].section.id, "MapA_P");
        assert_eq!(names(&out[0]), vec!["X", "Y"]);
        assert_eq!(out[0].tally.unconfirmed, 1);
        assert_eq!(names(&out[1]), vec!["X", "Y", "Z"]);
        assert_eq!(diag.get("unconfirmed"), 1);
        assert_eq!(diag.get("section_mismatches"), 0);
    }

    #[test]
    fn casing_is_normalized_but_forward_casing_kept() {
        let (out, diag) = resolve(
            &[("MapA_P", &["GD_Foo.Bar", "GD_Foo.bar", "Only.Forward"])],
            &[("MapA_P", &["gd_foo.BAR", "Only.Reverse"])],
        );
        assert_eq!(names(&out[0]), vec!["GD_Foo.Bar"]);
        assert_eq!(out[0].tally.repeats, 1);
        assert_eq!(out[0].tally.reverse_only, 1);
        assert_eq!(diag.get("reverse_only"), 1);
    }

    #[test]
    fn section_set_mismatch_is_a_failure() {
        let (out, diag) = resolve(
            &[("MapA_P", &["X"]), ("Fwd_P", &["X"])],
            &[("MapA_P", &["X"]), ("Rev_P", &["Q"])],
        );
        assert_eq!(out.len(), 2);
        assert!(out[1].confirmed.is_empty());
        assert_eq!(diag.get("section_mismatches"), 2);
        assert!(diag.failures.iter().any(|f| f.contains("Fwd_P") && f.contains("Forward")));
        assert!(diag.failures.iter().any(|f| f.contains("Rev_P") && f.contains("Reverse")));
    }

    #[test]
    fn forward_only_pass_keeps_every_distinct_object() {
        let mut diag = PhaseDiagnostics::new("resolve");
        let mut out = Vec::new();
        pass_forward(
            enumeration(&[("MapA_P", &["X", "Y", "x"]), ("MapB_P", &["Z"])]),
            &mut diag,
            |s| {
                out.push(s);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(names(&out[0]), vec!["X", "Y"]);
        assert_eq!(out[0].tally.repeats, 1);
        assert_eq!(names(&out[1]), vec!["Z"]);
        assert_eq!(diag.get("confirmed"), 3);
        assert_eq!(diag.get("unconfirmed"), 0);
        assert_eq!(diag.get("section_mismatches"), 0);
    }
}
