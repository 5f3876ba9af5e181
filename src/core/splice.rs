//! Section-level tools over raw logs: listing, extraction and replacement.
//!
//! Extraction and replacement copy bytes verbatim (line terminators
//! included) and act on the first occurrence of a section only. A section
//! runs from its switch line up to the next switch to a different section.

use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use owo_colors::OwoColorize;
use serde::Serialize;
use tabled::{Table, Tabled};
use tracing::info;

use crate::cli::{AppContext, ExtractArgs, ReplaceArgs, SectionsArgs};
use crate::core::grammar::Grammar;
use crate::core::reader::{Event, LogSection, ReaderOptions, SectionReader};
use crate::infra::io::open_log;

/// Line counts of one splice operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub copied: u64,
    pub removed: u64,
    pub inserted: u64,
}

fn marker_of(grammar: &Grammar, raw: &[u8]) -> Option<Vec<u8>> {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    grammar.section_marker(line).map(<[u8]>::to_vec)
}

/// Copy the first occurrence of `section` from `input` to `out`.
pub fn extract<R: BufRead, W: Write>(input: &mut R, out: &mut W, section: &str) -> Result<SpliceStats> {
    let grammar = Grammar::new();
    let mut stats = SpliceStats::default();
    let mut writing = false;
    let mut buf = Vec::new();

    while input.read_until(b'\n', &mut buf)? > 0 {
        if let Some(id) = marker_of(&grammar, &buf) {
            if id == section.as_bytes() {
                writing = true;
            } else if writing {
                break;
            }
        }
        if writing {
            out.write_all(&buf)?;
            stats.copied += 1;
        }
        buf.clear();
    }
    if !writing {
        bail!("section {section} not found");
    }
    Ok(stats)
}

/// Copy `input` to `out`, substituting the first occurrence of `section`
/// with the bytes of `replacement`.
pub fn replace<R: BufRead, S: BufRead, W: Write>(
    input: &mut R,
    replacement: &mut S,
    out: &mut W,
    section: &str,
) -> Result<SpliceStats> {
    let grammar = Grammar::new();
    let mut stats = SpliceStats::default();
    let mut skipping = false;
    let mut replaced = false;
    let mut buf = Vec::new();

    while input.read_until(b'\n', &mut buf)? > 0 {
        if let Some(id) = marker_of(&grammar, &buf) {
            if id == section.as_bytes() && !replaced {
                replaced = true;
                skipping = true;
                let mut line = Vec::new();
                while replacement.read_until(b'\n', &mut line)? > 0 {
                    out.write_all(&line)?;
                    stats.inserted += 1;
                    line.clear();
                }
            } else {
                skipping = false;
            }
        }
        if skipping {
            stats.removed += 1;
        } else {
            out.write_all(&buf)?;
            stats.copied += 1;
        }
        buf.clear();
    }
    if !replaced {
        bail!("section {section} not found");
    }
    Ok(stats)
}

/// Per-section counts from one tokenizer pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Tabled)]
pub struct SectionSummary {
    pub section: String,
    pub kind: String,
    pub objects: u64,
    pub dumps: u64,
    pub not_found: u64,
    pub incomplete: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogSummary {
    pub sections: Vec<SectionSummary>,
    pub malformed: Vec<String>,
    pub clean_end: bool,
}

fn entry<'a>(sections: &'a mut IndexMap<String, SectionSummary>, s: &LogSection) -> &'a mut SectionSummary {
    sections.entry(s.id.clone()).or_insert_with(|| SectionSummary {
        section: s.id.clone(),
        kind: format!("{:?}", s.kind),
        ..SectionSummary::default()
    })
}

/// Tokenize a log and count what each section holds.
pub fn summarize<R: BufRead>(reader: SectionReader<R>) -> Result<LogSummary> {
    let mut sections: IndexMap<String, SectionSummary> = IndexMap::new();
    let mut summary = LogSummary::default();

    for event in reader {
        match event? {
            Event::SectionStart(s) => {
                entry(&mut sections, &s);
            }
            Event::Object(obj) => entry(&mut sections, &obj.section).objects += 1,
            Event::DumpBegin {
                section: Some(s), ..
            } => entry(&mut sections, &s).dumps += 1,
            Event::NotFound {
                section: Some(s), ..
            } => entry(&mut sections, &s).not_found += 1,
            Event::Malformed(m) => summary.malformed.push(m.to_string()),
            Event::Incomplete(inc) => {
                if let Some(id) = &inc.section
                    && let Some(s) = sections.get_mut(id)
                {
                    s.incomplete = true;
                }
            }
            Event::StreamEnd { clean } => summary.clean_end = clean,
            _ => {}
        }
    }
    summary.sections = sections.into_values().collect();
    Ok(summary)
}

pub fn list(args: SectionsArgs, ctx: &AppContext) -> Result<()> {
    let opts = if args.enumeration {
        ReaderOptions::enumeration()
    } else {
        ReaderOptions::dump_log()
    };
    let summary = summarize(SectionReader::open(&args.log, opts)?)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    if ctx.quiet {
        return Ok(());
    }

    println!("{}", Table::new(&summary.sections));
    for m in &summary.malformed {
        if ctx.no_color {
            println!("malformed: {m}");
        } else {
            println!("{} {m}", "malformed:".red());
        }
    }
    if !summary.clean_end {
        println!("log did not end with a clean shutdown marker");
    }
    Ok(())
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    ))
}

pub fn run_extract(args: ExtractArgs, ctx: &AppContext) -> Result<()> {
    if ctx.dry_run {
        if !ctx.quiet {
            println!(
                "{} section {} of {} to {}",
                "DRY RUN: Would extract".yellow(),
                args.section,
                args.log.display(),
                args.out.display()
            );
        }
        return Ok(());
    }

    let mut input = open_log(&args.log)?;
    let mut out = create_output(&args.out)?;
    let stats = extract(&mut input, &mut out, &args.section)?;
    out.flush()?;
    info!(section = %args.section, lines = stats.copied, "section extracted");
    if !ctx.quiet {
        println!("Wrote {} lines to {}", stats.copied, args.out.display());
    }
    Ok(())
}

pub fn run_replace(args: ReplaceArgs, ctx: &AppContext) -> Result<()> {
    if ctx.dry_run {
        if !ctx.quiet {
            println!(
                "{} section {} of {} with {}",
                "DRY RUN: Would replace".yellow(),
                args.section,
                args.log.display(),
                args.with.display()
            );
        }
        return Ok(());
    }

    let mut input = open_log(&args.log)?;
    let mut replacement = open_log(&args.with)?;
    let mut out = create_output(&args.out)?;
    let stats = replace(&mut input, &mut replacement, &mut out, &args.section)?;
    out.flush()?;
    info!(
        section = %args.section,
        removed = stats.removed,
        inserted = stats.inserted,
        "section replaced"
    );
    if !ctx.quiet {
        println!(
            "Removed {} lines, inserted {} lines into {}",
            stats.removed,
            stats.inserted,
            args.out.display()
        );
    }
    Ok(())
}
