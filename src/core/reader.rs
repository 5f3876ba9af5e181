//! Section-tokenizing reader.
//!
//! Streams a raw session log one line at a time and turns it into a flat
//! sequence of [`Event`]s. The reader is a small explicit state machine
//! (`Seeking` → `InSection` ⇄ `InDumpBlock`); it keeps only the current
//! section handle, the set of section ids seen so far and at most one
//! pending line, so memory stays flat however large the log grows.
//!
//! Malformed structure never aborts the stream: it surfaces as
//! [`Event::Malformed`] and the offending region is skipped. A log that ends
//! while a section or dump block is still open yields [`Event::Incomplete`].

use std::collections::VecDeque;
use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::diagnostics::MalformedSection;
use crate::core::grammar::{Grammar, LineKind};
use crate::infra::io::{latin1_to_string, open_log, read_line_bytes};
use crate::infra::utils::NameUtils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionKind {
    Level,
    CharVehicle,
    MainMenu,
}

impl SectionKind {
    pub fn from_id(id: &str) -> Self {
        if id.eq_ignore_ascii_case("charvehicle") {
            Self::CharVehicle
        } else if id.eq_ignore_ascii_case("mainmenu") {
            Self::MainMenu
        } else {
            Self::Level
        }
    }
}

/// One logical region of a log, opened by a switch marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogSection {
    pub id: String,
    pub kind: SectionKind,
    /// Order of first appearance within its stream, from 0.
    pub ordinal: usize,
}

impl LogSection {
    pub fn new(id: impl Into<String>, ordinal: usize) -> Self {
        let id = id.into();
        let kind = SectionKind::from_id(&id);
        Self { id, kind, ordinal }
    }
}

impl fmt::Display for LogSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// One enumerated object. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub qualified_name: String,
    pub class_name: String,
    pub section: Arc<LogSection>,
}

impl ObjectRecord {
    /// Case-insensitive identity.
    pub fn key(&self) -> String {
        NameUtils::key(&self.qualified_name)
    }
}

/// A section or dump block left open when input ran out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("input ended inside {}", describe_open(.section, .open_dump))]
pub struct IncompleteSection {
    pub section: Option<String>,
    pub open_dump: Option<String>,
}

fn describe_open(section: &Option<String>, open_dump: &Option<String>) -> String {
    match (section, open_dump) {
        (Some(s), Some(d)) => format!("section {s} while dumping {d}"),
        (Some(s), None) => format!("section {s}"),
        (None, Some(d)) => format!("dump of {d}"),
        (None, None) => "an unterminated run".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Seeking,
    InSection,
    InDumpBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SectionStart(Arc<LogSection>),
    Object(ObjectRecord),
    DumpBegin {
        line: u64,
        class: String,
        name: String,
        section: Option<Arc<LogSection>>,
    },
    /// Body line of the open dump block, log prefix stripped.
    DumpLine(Vec<u8>),
    DumpEnd {
        truncated: bool,
    },
    NotFound {
        line: u64,
        target: String,
        section: Option<Arc<LogSection>>,
    },
    /// Any other line inside a section; only with `emit_raw_lines`.
    Line {
        section: Arc<LogSection>,
        bytes: Vec<u8>,
    },
    Malformed(MalformedSection),
    Incomplete(IncompleteSection),
    /// Input exhausted; `clean` when the last run closed normally.
    StreamEnd {
        clean: bool,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    /// Treat a second switch to an already-seen section as malformed and
    /// skip its content (enumeration logs). Otherwise the section resumes.
    pub reject_repeated_sections: bool,
    pub emit_raw_lines: bool,
}

impl ReaderOptions {
    pub fn enumeration() -> Self {
        Self {
            reject_repeated_sections: true,
            emit_raw_lines: false,
        }
    }

    pub fn dump_log() -> Self {
        Self::default()
    }
}

/// Lazy, single-pass tokenizer over one log stream.
pub struct SectionReader<R> {
    input: R,
    grammar: Grammar,
    opts: ReaderOptions,
    state: ReaderState,
    section: Option<Arc<LogSection>>,
    sections: IndexMap<String, Arc<LogSection>>,
    skipping: bool,
    open_dump: Option<String>,
    clean_end: bool,
    line_no: u64,
    buf: Vec<u8>,
    pending: VecDeque<Event>,
    done: bool,
}

impl SectionReader<Box<dyn BufRead + Send>> {
    /// Open a log file (plain or `.gz`).
    pub fn open<P: AsRef<Path>>(path: P, opts: ReaderOptions) -> Result<Self> {
        Ok(Self::new(open_log(path)?, opts))
    }
}

impl<R: BufRead> SectionReader<R> {
    pub fn new(input: R, opts: ReaderOptions) -> Self {
        Self {
            input,
            grammar: Grammar::new(),
            opts,
            state: ReaderState::Seeking,
            section: None,
            sections: IndexMap::new(),
            skipping: false,
            open_dump: None,
            clean_end: false,
            line_no: 0,
            buf: Vec::with_capacity(256),
            pending: VecDeque::new(),
            done: false,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn line_number(&self) -> u64 {
        self.line_no
    }

    pub fn current_section(&self) -> Option<&Arc<LogSection>> {
        self.section.as_ref()
    }

    /// Sections seen so far, in order of first appearance.
    pub fn sections(&self) -> impl Iterator<Item = &Arc<LogSection>> {
        self.sections.values()
    }

    fn resting_state(&self) -> ReaderState {
        if self.section.is_some() {
            ReaderState::InSection
        } else {
            ReaderState::Seeking
        }
    }

    fn close_dump(&mut self, truncated: bool) {
        if self.open_dump.take().is_some() {
            self.pending.push_back(Event::DumpEnd { truncated });
        }
        if self.state == ReaderState::InDumpBlock {
            self.state = self.resting_state();
        }
    }

    fn leave_section(&mut self) {
        self.section = None;
        self.skipping = false;
        self.state = ReaderState::Seeking;
    }

    fn step(&mut self, line: &[u8]) {
        let line_no = self.line_no;

        match self.grammar.classify(line) {
            LineKind::DumpBegin { class, name } => {
                self.close_dump(false);
                let name = latin1_to_string(name);
                self.open_dump = Some(name.clone());
                self.state = ReaderState::InDumpBlock;
                self.clean_end = false;
                self.pending.push_back(Event::DumpBegin {
                    line: line_no,
                    class: latin1_to_string(class),
                    name,
                    section: self.section.clone(),
                });
            }
            LineKind::SectionSwitch(raw) => {
                self.close_dump(false);
                self.clean_end = false;
                let id = latin1_to_string(raw);

                let existing = self.sections.get(&id).cloned();
                let section = match existing {
                    Some(_) if self.opts.reject_repeated_sections => {
                        self.leave_section();
                        self.skipping = true;
                        self.pending
                            .push_back(Event::Malformed(MalformedSection::RepeatedSection {
                                line: line_no,
                                id,
                            }));
                        return;
                    }
                    Some(existing) => existing,
                    None => {
                        let s = Arc::new(LogSection::new(id.clone(), self.sections.len()));
                        self.sections.insert(id, Arc::clone(&s));
                        s
                    }
                };

                tracing::debug!(section = %section, line = line_no, "section start");
                self.section = Some(Arc::clone(&section));
                self.skipping = false;
                self.state = ReaderState::InSection;
                self.pending.push_back(Event::SectionStart(section));
            }
            LineKind::BadSwitch(raw) => {
                self.close_dump(false);
                self.leave_section();
                self.skipping = true;
                self.pending
                    .push_back(Event::Malformed(MalformedSection::BadSectionId {
                        line: line_no,
                        raw: latin1_to_string(raw),
                    }));
            }
            LineKind::NotFound(target) => {
                self.close_dump(false);
                if !self.skipping {
                    self.pending.push_back(Event::NotFound {
                        line: line_no,
                        target: latin1_to_string(target),
                        section: self.section.clone(),
                    });
                }
            }
            LineKind::Object { class, name } => {
                if self.state == ReaderState::InDumpBlock {
                    self.pending
                        .push_back(Event::DumpLine(self.grammar.strip_prefix(line).to_vec()));
                } else if self.skipping {
                    // content of a rejected section
                } else if let Some(section) = &self.section {
                    self.pending.push_back(Event::Object(ObjectRecord {
                        qualified_name: latin1_to_string(name),
                        class_name: latin1_to_string(class),
                        section: Arc::clone(section),
                    }));
                } else {
                    self.pending
                        .push_back(Event::Malformed(MalformedSection::OrphanObject {
                            line: line_no,
                            name: latin1_to_string(name),
                        }));
                }
            }
            LineKind::RunStart => {
                self.close_dump(false);
                if self.section.is_some() && !self.clean_end {
                    self.pending.push_back(Event::Incomplete(IncompleteSection {
                        section: self.section.as_ref().map(|s| s.id.clone()),
                        open_dump: None,
                    }));
                }
                self.leave_section();
                self.clean_end = false;
            }
            LineKind::ExecWarning => {
                self.close_dump(false);
            }
            LineKind::EndOfStream => {
                self.close_dump(false);
                self.leave_section();
                self.clean_end = true;
            }
            LineKind::Other => {
                if self.state == ReaderState::InDumpBlock {
                    self.pending
                        .push_back(Event::DumpLine(self.grammar.strip_prefix(line).to_vec()));
                } else if self.opts.emit_raw_lines
                    && !self.skipping
                    && let Some(section) = &self.section
                {
                    self.pending.push_back(Event::Line {
                        section: Arc::clone(section),
                        bytes: line.to_vec(),
                    });
                }
            }
        }
    }

    fn finish(&mut self) {
        let open_dump = self.open_dump.clone();
        let open_section = self.section.as_ref().map(|s| s.id.clone());
        if open_dump.is_some() {
            self.close_dump(true);
        }
        if !self.clean_end && (open_dump.is_some() || open_section.is_some()) {
            self.pending.push_back(Event::Incomplete(IncompleteSection {
                section: open_section,
                open_dump,
            }));
        }
        self.pending.push_back(Event::StreamEnd {
            clean: self.clean_end,
        });
        self.state = ReaderState::Seeking;
        self.done = true;
    }
}

impl<R: BufRead> Iterator for SectionReader<R> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Some(Ok(ev));
            }
            if self.done {
                return None;
            }

            let mut buf = std::mem::take(&mut self.buf);
            match read_line_bytes(&mut self.input, &mut buf) {
                Ok(true) => {
                    self.line_no += 1;
                    self.step(&buf);
                }
                Ok(false) => self.finish(),
                Err(e) => {
                    self.done = true;
                    self.buf = buf;
                    let line = self.line_no + 1;
                    return Some(
                        Err::<Event, _>(e)
                            .with_context(|| format!("Failed to read log at line {line}")),
                    );
                }
            }
            self.buf = buf;
        }
    }
}
