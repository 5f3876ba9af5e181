//! Shared test utilities for integration tests
//!
//! Builds synthetic session logs in the exact shape the producing session
//! writes them, so the pipeline can be driven end to end.

#![allow(dead_code)]

use assert_fs::prelude::*;

/// Section switch acknowledgement line.
pub fn switch_line(section: &str) -> String
{
    format!("[0001.00] Log: No objects found using command 'obj dump switch.to.{section}'\r\n")
}

/// Enumeration log: each section lists `(class, qualified name)` pairs.
pub fn enumeration_log(sections: &[(&str, &[(&str, &str)])]) -> String
{
    let mut out = String::from("Log: Log file open, 01/01/23 00:00:00\r\n");
    for (section, objects) in sections
    {
        out.push_str(&switch_line(section));
        for (i, (class, name)) in objects
            .iter()
            .enumerate()
        {
            let short = name
                .rsplit('.')
                .next()
                .unwrap_or(name);
            out.push_str(&format!("[0001.00] Log: {i}) {class} {name}.Name = '{short}'\r\n"));
        }
    }
    out.push_str("Log: Log file closed, 01/01/23 00:10:00\r\n");
    out
}

/// One dump block: `(class, name, body lines)`.
pub type Dump<'a> = (&'a str, &'a str, &'a [&'a str]);

/// Dump log: each section runs its dumps in order; `missing` names produce
/// a no-objects-found reply instead.
pub fn dump_log(sections: &[(&str, &[Dump<'_>], &[&str])]) -> String
{
    let mut out = String::from("Log: Log file open, 01/01/23 01:00:00\r\n");
    for (section, dumps, missing) in sections
    {
        out.push_str(&switch_line(section));
        for (class, name, body) in dumps.iter()
        {
            out.push_str(&format!("[0002.00] Log: *** Property dump for object '{class} {name}' ***\r\n"));
            for line in body.iter()
            {
                out.push_str(&format!("[0002.00] Log: {line}\r\n"));
            }
        }
        for name in missing.iter()
        {
            out.push_str(&format!(
                "[0002.00] Log: No objects found using command 'obj dump {name}'\r\n"
            ));
        }
    }
    out.push_str("Log: Log file closed, 01/01/23 01:10:00\r\n");
    out
}

/// Write `text` to `name` inside `tmp` and return its path.
pub fn write(
    tmp: &assert_fs::TempDir,
    name: &str,
    text: &str,
) -> std::path::PathBuf
{
    let child = tmp.child(name);
    child
        .write_str(text)
        .expect("write fixture");
    child
        .path()
        .to_path_buf()
}
