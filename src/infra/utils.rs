//! Utility helpers organized by small, focused structs.
//! All functions are associated fns to keep call sites
//! ergonomic, testable, and discoverable.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::cli::AppContext;

/// Object and class name helpers
pub struct NameUtils;

impl NameUtils
{
    /// Identity key for a qualified name: names compare case-insensitively
    pub fn key(name: &str) -> String
    {
        name.to_lowercase()
    }

    /// True when `class` can be used verbatim as an output file stem
    pub fn is_safe_class_name(class: &str) -> bool
    {
        !class.is_empty()
            && class != "."
            && class != ".."
            && !class
                .chars()
                .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
    }

    /// Last dotted/colon-separated component of a qualified name
    pub fn last_component(name: &str) -> &str
    {
        name.rsplit(['.', ':'])
            .next()
            .unwrap_or(name)
    }

    /// Default-object sentinel for `class`
    pub fn default_object(class: &str) -> String
    {
        format!("Default__{class}")
    }

    /// True when the last component of `name` is a default-object sentinel
    pub fn is_default_object(name: &str) -> bool
    {
        Self::last_component(name)
            .get(..9)
            .is_some_and(|p| p.eq_ignore_ascii_case("default__"))
    }
}

/// Terminal progress helpers
pub struct ProgressUtils;

impl ProgressUtils
{
    /// Spinner for streaming phases with no known length; hidden when quiet
    pub fn spinner(
        ctx: &AppContext,
        msg: &str,
    ) -> ProgressBar
    {
        if ctx.quiet
        {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {pos} {msg}")
        {
            pb.set_style(style);
        }
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }

    /// Bar over a known number of work items; hidden when quiet
    pub fn bar(
        ctx: &AppContext,
        len: u64,
    ) -> ProgressBar
    {
        if ctx.quiet
        {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}
