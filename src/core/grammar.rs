//! Marker grammar for session logs.
//!
//! Classifies single (terminator-stripped) log lines into the handful of
//! markers the pipeline cares about. Everything is matched on bytes since
//! the logs are Latin-1, not UTF-8.

use bstr::ByteSlice;
use memchr::memmem;
use regex::bytes::Regex;

/// Prefix of the dump target used as a section switch sentinel.
pub const SWITCH_PREFIX: &str = "switch.to.";

/// Lines that terminate any open dump block.
const RUN_START: &[u8] = b"Log file open";
const EXEC_WARNING: &[u8] = b"ExecWarning";
const END_OF_STREAM: [&[u8]; 2] = [b"Closing by request", b"Log file closed"];

/// One classified line. Borrowed slices point into the input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind<'a>
{
    /// `switch.to.<id>` acknowledgement; `id` is validated as `\w+`.
    SectionSwitch(&'a [u8]),
    /// Switch acknowledgement whose id is not a word.
    BadSwitch(&'a [u8]),
    /// "No objects found" for a regular dump target.
    NotFound(&'a [u8]),
    /// One entry of a full-object enumeration.
    Object { class: &'a [u8], name: &'a [u8] },
    /// Start of a property dump block.
    DumpBegin { class: &'a [u8], name: &'a [u8] },
    RunStart,
    ExecWarning,
    EndOfStream,
    Other,
}

/// Compiled marker patterns; build once per reader.
#[derive(Debug, Clone)]
pub struct Grammar
{
    prefix: Regex,
    object: Regex,
    dump_needle: memmem::Finder<'static>,
    not_found_needle: memmem::Finder<'static>,
    dump_begin: Regex,
    not_found: Regex,
    word: Regex,
}

impl Default for Grammar
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Grammar
{
    pub fn new() -> Self
    {
        // Patterns are constants; failure here is a programming error
        let build = |p: &str| Regex::new(p).expect("static marker pattern");

        Self {
            prefix: build(r"^(?:\[[0-9.]+\] )?Log: "),
            object: build(r"^(?:\[[0-9.]+\] )?Log: \d+\) (\w+) (\S+)\.Name = "),
            dump_begin: build(r"^\*\*\* Property dump for object '(\S+) (\S+)' \*\*\*"),
            not_found: build(r"No objects found using command '(?:obj dump )?([^']*)'"),
            word: build(r"^\w+$"),
            dump_needle: memmem::Finder::new(b"*** Property dump for object '"),
            not_found_needle: memmem::Finder::new(b"No objects found"),
        }
    }

    /// Strip the `[time] Log: ` prefix, if any.
    pub fn strip_prefix<'a>(
        &self,
        line: &'a [u8],
    ) -> &'a [u8]
    {
        match self
            .prefix
            .find(line)
        {
            Some(m) => &line[m.end()..],
            None => line,
        }
    }

    /// Classify a line. Dump-begin wins over everything else, then the
    /// no-objects-found family, then the plain substring markers.
    pub fn classify<'a>(
        &self,
        line: &'a [u8],
    ) -> LineKind<'a>
    {
        // Cheap substring checks gate the regexes; most lines are neither
        // The header must open the message; the same text inside a body
        // line is property data
        if self
            .dump_needle
            .find(line)
            .is_some()
            && let Some(caps) = self
                .dump_begin
                .captures(self.strip_prefix(line))
        {
            return LineKind::DumpBegin {
                class: caps
                    .get(1)
                    .map_or(&[][..], |m| m.as_bytes()),
                name: caps
                    .get(2)
                    .map_or(&[][..], |m| m.as_bytes()),
            };
        }

        if self
            .not_found_needle
            .find(line)
            .is_some()
            && let Some(caps) = self
                .not_found
                .captures(line)
        {
            let target = caps
                .get(1)
                .map_or(&[][..], |m| m.as_bytes());
            if let Some(id) = target.strip_prefix(SWITCH_PREFIX.as_bytes())
            {
                let id = id.trim();
                return if self
                    .word
                    .is_match(id)
                {
                    LineKind::SectionSwitch(id)
                }
                else
                {
                    LineKind::BadSwitch(id)
                };
            }
            return LineKind::NotFound(target.trim());
        }

        if let Some(caps) = self
            .object
            .captures(line)
        {
            return LineKind::Object {
                class: caps
                    .get(1)
                    .map_or(&[][..], |m| m.as_bytes()),
                name: caps
                    .get(2)
                    .map_or(&[][..], |m| m.as_bytes()),
            };
        }

        if line.contains_str(RUN_START)
        {
            return LineKind::RunStart;
        }
        if line.contains_str(EXEC_WARNING)
        {
            return LineKind::ExecWarning;
        }
        if END_OF_STREAM
            .iter()
            .any(|m| line.contains_str(m))
        {
            return LineKind::EndOfStream;
        }

        LineKind::Other
    }

    /// Section id named by a switch marker anywhere in `line`, if any.
    /// Used by byte-preserving tools that do not otherwise tokenize.
    pub fn section_marker<'a>(
        &self,
        line: &'a [u8],
    ) -> Option<&'a [u8]>
    {
        match self.classify(line)
        {
            LineKind::SectionSwitch(id) => Some(id),
            _ => None,
        }
    }
}

/// Header line written at the top of every stored dump record.
pub fn dump_header(
    class: &str,
    name: &str,
) -> String
{
    format!("*** Property dump for object '{class} {name}' ***")
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn classifies_enumeration_line()
    {
        let g = Grammar::new();
        let line = b"[0012.34] Log: 17) WillowAIPawn Stockade_P.TheWorld:PersistentLevel.Bandit_1.Name = 'Bandit_1'";
        assert_eq!(
            g.classify(line),
            LineKind::Object {
                class: b"WillowAIPawn",
                name: b"Stockade_P.TheWorld:PersistentLevel.Bandit_1"
            }
        );
    }

    #[test]
    fn classifies_switch_and_not_found()
    {
        let g = Grammar::new();
        let switch = b"[0001.00] Log: No objects found using command 'obj dump switch.to.Stockade_P'";
        assert_eq!(g.classify(switch), LineKind::SectionSwitch(b"Stockade_P"));

        let missing = b"[0001.00] Log: No objects found using command 'obj dump GD_Foo.Bar'";
        assert_eq!(g.classify(missing), LineKind::NotFound(b"GD_Foo.Bar"));

        let bad = b"Log: No objects found using command 'obj dump switch.to.Bad Id'";
        assert_eq!(g.classify(bad), LineKind::BadSwitch(b"Bad Id"));
    }

    #[test]
    fn classifies_dump_begin_and_terminators()
    {
        let g = Grammar::new();
        let begin = b"[0100.00] Log: *** Property dump for object 'Foo GD_Foo.Bar_1' ***";
        assert_eq!(
            g.classify(begin),
            LineKind::DumpBegin { class: b"Foo", name: b"GD_Foo.Bar_1" }
        );
        assert_eq!(
            g.classify(b"*** Property dump for object 'Foo GD_Foo.Bar_2' ***"),
            LineKind::DumpBegin { class: b"Foo", name: b"GD_Foo.Bar_2" }
        );
        assert_eq!(g.classify(b"Log: Log file open, 01/01/19"), LineKind::RunStart);
        assert_eq!(g.classify(b"ExecWarning: bad command"), LineKind::ExecWarning);
        assert_eq!(g.classify(b"Log: Closing by request"), LineKind::EndOfStream);
        assert_eq!(g.classify(b"Log:   Prop=1"), LineKind::Other);
    }

    #[test]
    fn header_text_inside_a_body_line_is_not_a_dump()
    {
        let g = Grammar::new();
        let line = b"[0100.00] Log:   Note=*** Property dump for object 'Foo Fake' ***";
        assert_eq!(g.classify(line), LineKind::Other);
    }

    #[test]
    fn strips_log_prefix()
    {
        let g = Grammar::new();
        assert_eq!(g.strip_prefix(b"[0100.00] Log:   Prop=1"), b"  Prop=1");
        assert_eq!(g.strip_prefix(b"Log: x"), b"x");
        assert_eq!(g.strip_prefix(b"no prefix"), b"no prefix");
    }
}
