//! Reading a categorized corpus back.
//!
//! A corpus directory holds one `<Class>.dump` file per class. Each record
//! is the dump header line, the body lines, and one blank separator line.

use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::grammar::{Grammar, LineKind, dump_header};
use crate::core::sinks::DUMP_EXTENSION;
use crate::infra::io::{latin1_to_string, open_log, read_line_bytes, string_to_latin1};

const HEADER_START: &[u8] = b"*** Property dump for object '";

/// One stored object: identity plus scrubbed body (newline-terminated lines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub class_name: String,
    pub name: String,
    pub body: Vec<u8>,
}

impl CorpusEntry {
    /// Exact stored bytes: header line followed by the body.
    pub fn record(&self) -> Vec<u8> {
        let mut out = string_to_latin1(&dump_header(&self.class_name, &self.name));
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }

    /// BLAKE3 of the body, hex encoded.
    pub fn content_hash(&self) -> String {
        blake3::hash(&self.body).to_hex().to_string()
    }
}

/// Streams the records of one class file.
pub struct CorpusFile<R> {
    input: R,
    grammar: Grammar,
    buf: Vec<u8>,
    pending: Option<(String, String)>,
    body: Vec<u8>,
    done: bool,
}

impl CorpusFile<Box<dyn BufRead + Send>> {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_log(path)?))
    }
}

impl<R: BufRead> CorpusFile<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            grammar: Grammar::new(),
            buf: Vec::new(),
            pending: None,
            body: Vec::new(),
            done: false,
        }
    }

    fn header(&self, line: &[u8]) -> Option<(String, String)> {
        if !line.starts_with(HEADER_START) {
            return None;
        }
        match self.grammar.classify(line) {
            LineKind::DumpBegin { class, name } => {
                Some((latin1_to_string(class), latin1_to_string(name)))
            }
            _ => None,
        }
    }

    fn emit(&mut self, (class_name, name): (String, String)) -> CorpusEntry {
        let mut body = std::mem::take(&mut self.body);
        // drop the blank separator
        while body.ends_with(b"\n\n") {
            body.pop();
        }
        if body == b"\n" {
            body.clear();
        }
        CorpusEntry {
            class_name,
            name,
            body,
        }
    }
}

impl<R: BufRead> Iterator for CorpusFile<R> {
    type Item = Result<CorpusEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let mut buf = std::mem::take(&mut self.buf);
            let more = match read_line_bytes(&mut self.input, &mut buf) {
                Ok(more) => more,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            if !more {
                self.done = true;
                self.buf = buf;
                return self.pending.take().map(|h| Ok(self.emit(h)));
            }

            if let Some(header) = self.header(&buf) {
                self.buf = buf;
                if let Some(prev) = self.pending.replace(header) {
                    return Some(Ok(self.emit(prev)));
                }
                continue;
            }

            if self.pending.is_some() {
                self.body.extend_from_slice(&buf);
                self.body.push(b'\n');
            } else if !buf.is_empty() {
                tracing::debug!("stray line before first record ignored");
            }
            self.buf = buf;
        }
    }
}

/// Class files in `dir`, sorted by class name.
pub fn list_class_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let stem = name
            .strip_suffix(".gz")
            .unwrap_or(&name)
            .strip_suffix(&format!(".{DUMP_EXTENSION}"));
        if let Some(class) = stem {
            out.push((class.to_string(), path));
        }
    }
    out.sort();
    Ok(out)
}
