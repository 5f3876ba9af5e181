//! Recoverable-condition taxonomy and per-phase diagnostics summaries.
//!
//! Phases never stop on the conditions defined here; they record them in a
//! [`PhaseDiagnostics`] which is always emitted, whether the phase succeeded
//! or not. Fatal conditions (archive consistency) live with the code that
//! raises them.

use std::path::Path;

use anyhow::Result;
use indexmap::IndexMap;
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use tabled::{Table, Tabled};

use crate::cli::AppContext;
use crate::infra::output::write_json_atomic;

/// Cap on stored warning/failure messages per phase; counts stay exact.
const MAX_MESSAGES: usize = 500;

/// Marker structure violated; the offending region is skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedSection
{
    #[error("line {line}: object {name} listed before any section marker")]
    OrphanObject
    {
        line: u64, name: String
    },

    #[error("line {line}: section {id} appears again; repeated content skipped")]
    RepeatedSection
    {
        line: u64, id: String
    },

    #[error("line {line}: unusable section id {raw:?}")]
    BadSectionId
    {
        line: u64, raw: String
    },

    #[error("line {line}: class name {class:?} cannot name an output file")]
    UnsafeClassName
    {
        line: u64, class: String
    },
}

/// Which enumeration a section was exclusively found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSide
{
    Forward,
    Reverse,
}

/// Forward and reverse enumerations disagree on section membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("section {section} only present in the {only_in:?} enumeration")]
pub struct SectionSetMismatch
{
    pub section: String,
    pub only_in: LogSide,
}

/// A dump block for an object that was already categorized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: duplicate dump of {name} ({class}); first occurrence kept")]
pub struct DuplicateObject
{
    pub line: u64,
    pub class: String,
    pub name: String,
}

/// The OS refused another open file; handled by evicting sinks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("open file limit hit while opening sink {class} with {open} sinks open")]
pub struct FileHandleExhaustion
{
    pub class: String,
    pub open: usize,
}

/// A sensitive-location tag was expected but not found in usable shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{object}: {reason}")]
pub struct ScrubPatternUnmatchedExpectation
{
    pub object: String,
    pub reason: String,
}

/// Counters, warnings and failures for one phase run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDiagnostics
{
    pub phase: String,
    pub complete: bool,
    pub counts: IndexMap<String, u64>,
    pub warnings: Vec<String>,
    pub failures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Tabled)]
struct CountRow
{
    counter: String,
    value: u64,
}

impl PhaseDiagnostics
{
    pub fn new(phase: &str) -> Self
    {
        Self {
            phase: phase.to_string(),
            complete: false,
            counts: IndexMap::new(),
            warnings: Vec::new(),
            failures: Vec::new(),
            error: None,
        }
    }

    /// Set a counter to an absolute value.
    pub fn set(
        &mut self,
        key: &str,
        value: u64,
    )
    {
        self.counts
            .insert(key.to_string(), value);
    }

    /// Increment a counter.
    pub fn add(
        &mut self,
        key: &str,
        n: u64,
    )
    {
        *self
            .counts
            .entry(key.to_string())
            .or_insert(0) += n;
    }

    pub fn get(
        &self,
        key: &str,
    ) -> u64
    {
        self.counts
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn warn(
        &mut self,
        msg: impl Into<String>,
    )
    {
        self.add("warnings", 1);
        if self.warnings.len() < MAX_MESSAGES
        {
            self.warnings
                .push(msg.into());
        }
    }

    /// Hard diagnostic: processing continued but the result is flagged.
    pub fn fail(
        &mut self,
        msg: impl Into<String>,
    )
    {
        self.add("failures", 1);
        if self.failures.len() < MAX_MESSAGES
        {
            self.failures
                .push(msg.into());
        }
    }

    pub fn mark_complete(&mut self)
    {
        self.complete = true;
    }

    /// Attach the fatal error that ended the phase.
    pub fn record_error(
        &mut self,
        err: &anyhow::Error,
    )
    {
        self.complete = false;
        self.error = Some(format!("{err:#}"));
    }

    pub fn render_table(&self) -> String
    {
        let rows: Vec<CountRow> = self
            .counts
            .iter()
            .map(|(k, v)| CountRow { counter: k.clone(), value: *v })
            .collect();
        Table::new(rows).to_string()
    }

    /// Print the summary (unless quiet) and optionally persist it as JSON.
    /// Called on every exit path of a phase.
    pub fn emit(
        &self,
        ctx: &AppContext,
        json_path: Option<&Path>,
    ) -> Result<()>
    {
        tracing::info!(
            phase = %self.phase,
            complete = self.complete,
            warnings = self.get("warnings"),
            failures = self.get("failures"),
            "phase finished"
        );

        if !ctx.quiet
        {
            let status = if self.complete
            {
                "complete"
            }
            else
            {
                "INCOMPLETE"
            };
            if ctx.no_color
            {
                eprintln!("{} diagnostics ({status})", self.phase);
            }
            else if self.complete
            {
                eprintln!("{} diagnostics ({})", self.phase, status.green());
            }
            else
            {
                eprintln!("{} diagnostics ({})", self.phase, status.red());
            }
            eprintln!("{}", self.render_table());
            for f in &self.failures
            {
                eprintln!("  ✗ {f}");
            }
            for w in self
                .warnings
                .iter()
                .take(20)
            {
                eprintln!("  ! {w}");
            }
            if self.warnings.len() > 20
            {
                eprintln!("  … {} more warnings", self.get("warnings") - 20);
            }
            if let Some(err) = &self.error
            {
                eprintln!("  error: {err}");
            }
        }

        if let Some(path) = json_path
            && !ctx.dry_run
        {
            write_json_atomic(path, self)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn counters_and_message_cap()
    {
        let mut d = PhaseDiagnostics::new("test");
        d.add("objects_seen", 2);
        d.add("objects_seen", 3);
        d.set("batches", 7);
        assert_eq!(d.get("objects_seen"), 5);
        assert_eq!(d.get("batches"), 7);
        assert_eq!(d.get("missing"), 0);

        for i in 0..(MAX_MESSAGES + 10)
        {
            d.warn(format!("w{i}"));
        }
        assert_eq!(d.warnings.len(), MAX_MESSAGES);
        assert_eq!(d.get("warnings"), (MAX_MESSAGES + 10) as u64);
    }

    #[test]
    fn json_shape_is_stable()
    {
        let mut d = PhaseDiagnostics::new("plan");
        d.set("planned", 3);
        d.fail(SectionSetMismatch { section: "MapA_P".into(), only_in: LogSide::Forward }.to_string());
        d.mark_complete();

        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["phase"], "plan");
        assert_eq!(v["complete"], true);
        assert_eq!(v["counts"]["planned"], 3);
        assert!(v.get("error").is_none());
        assert!(v["failures"][0]
            .as_str()
            .unwrap()
            .contains("MapA_P"));
    }
}
