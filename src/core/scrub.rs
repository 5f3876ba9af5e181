//! Redaction of dump bodies.
//!
//! Two kinds of rule run over every body before it is persisted:
//!
//! - literal patterns from the scrub file, replaced by [`HIDDEN`] with a
//!   single leftmost-longest Aho-Corasick pass;
//! - the fixed identifier rule, which zeroes the 16-byte field introduced by
//!   a textual tag (rendered as 32 hex digits) in place.
//!
//! Patterns that could recombine with the replacement token are refused at
//! load time; with those gone one pass leaves no pattern in the output.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use anyhow::{Context, Result};
use bstr::ByteSlice;

use crate::core::diagnostics::ScrubPatternUnmatchedExpectation;
use crate::infra::io::{latin1_to_string, string_to_latin1};

/// Replacement token for every literal rule.
pub const HIDDEN: &str = "<hidden>";

/// Rule id reported when an identifier field was zeroed.
pub const IDENTIFIER_RULE_ID: &str = "identifier";

/// Hex digits in the identifier field (16 bytes).
const IDENTIFIER_DIGITS: usize = 32;

/// Re-check passes after the main replacement.
const MAX_PASSES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScrubConfigError
{
    #[error("{rule}: pattern overlaps the replacement token <hidden>")]
    OverlapsReplacement
    {
        rule: String
    },

    #[error("failed to build scrub matcher: {0}")]
    Matcher(String),
}

/// One literal redaction rule. `id` is safe to log; `pattern` is not.
#[derive(Clone, PartialEq, Eq)]
pub struct ScrubRule
{
    pub id: String,
    pub pattern: Vec<u8>,
}

impl std::fmt::Debug for ScrubRule
{
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result
    {
        f.debug_struct("ScrubRule")
            .field("id", &self.id)
            .field("len", &self.pattern.len())
            .finish()
    }
}

/// The fixed binary-identifier rule.
#[derive(Debug, Clone)]
pub struct IdentifierRule
{
    pub tag: Vec<u8>,
    pub expected_classes: BTreeSet<String>,
}

impl IdentifierRule
{
    pub fn new(
        tag: &str,
        expected_classes: BTreeSet<String>,
    ) -> Self
    {
        Self { tag: tag.as_bytes().to_vec(), expected_classes }
    }
}

/// What scrubbing one body did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrubOutcome
{
    /// Distinct rule ids that matched, sorted.
    pub hits: Vec<String>,
    pub replacements: usize,
    pub identifiers_zeroed: usize,
    pub warnings: Vec<ScrubPatternUnmatchedExpectation>,
}

impl ScrubOutcome
{
    pub fn scrubbed(&self) -> bool
    {
        !self.hits.is_empty()
    }
}

#[derive(Debug)]
pub struct Scrubber
{
    rules: Vec<ScrubRule>,
    matcher: Option<AhoCorasick>,
    identifier: IdentifierRule,
}

/// True when replacing matches with [`HIDDEN`] could create a new match of
/// `pattern` straddling or inside the token.
fn overlaps_hidden(pattern: &[u8]) -> bool
{
    let hidden = HIDDEN.as_bytes();
    if pattern.contains_str(hidden) || hidden.contains_str(pattern)
    {
        return true;
    }
    (1..hidden.len()).any(|k| {
        // token suffix followed by text, or text followed by token prefix
        pattern.starts_with(&hidden[hidden.len() - k..]) || pattern.ends_with(&hidden[..k])
    })
}

impl Scrubber
{
    /// Build from literal patterns. Rule ids are `rule-<n>`, 1-based.
    pub fn new(
        patterns: Vec<Vec<u8>>,
        identifier: IdentifierRule,
    ) -> Result<Self, ScrubConfigError>
    {
        let rules: Vec<ScrubRule> = patterns
            .into_iter()
            .enumerate()
            .map(|(i, pattern)| ScrubRule { id: format!("rule-{}", i + 1), pattern })
            .collect();

        for rule in &rules
        {
            if overlaps_hidden(&rule.pattern)
            {
                return Err(ScrubConfigError::OverlapsReplacement { rule: rule.id.clone() });
            }
        }

        let matcher = if rules.is_empty()
        {
            None
        }
        else
        {
            Some(
                AhoCorasickBuilder::new()
                    .match_kind(MatchKind::LeftmostLongest)
                    .build(
                        rules
                            .iter()
                            .map(|r| &r.pattern),
                    )
                    .map_err(|e| ScrubConfigError::Matcher(e.to_string()))?,
            )
        };

        Ok(Self { rules, matcher, identifier })
    }

    /// Load literal patterns, one per line; blank lines are skipped and do
    /// not consume a rule number. `None` means no literal rules.
    pub fn load(
        path: Option<&Path>,
        identifier: IdentifierRule,
    ) -> Result<Self>
    {
        let mut patterns = Vec::new();
        if let Some(path) = path
        {
            let raw = fs::read(path)
                .with_context(|| format!("Failed to read scrub file {}", path.display()))?;
            for line in raw.lines()
            {
                if line
                    .trim()
                    .is_empty()
                {
                    continue;
                }
                patterns.push(line.to_vec());
            }
        }
        let scrubber = Self::new(patterns, identifier)
            .with_context(|| format!("Invalid scrub configuration ({})", describe(path)))?;
        tracing::debug!(rules = scrubber.rules.len(), "scrub rules loaded");
        Ok(scrubber)
    }

    pub fn rules(&self) -> &[ScrubRule]
    {
        &self.rules
    }

    /// Scrub `body` in place. `object` only labels warnings.
    pub fn scrub(
        &self,
        object: &str,
        class: &str,
        body: &mut Vec<u8>,
    ) -> ScrubOutcome
    {
        let mut outcome = ScrubOutcome::default();
        let mut hit_ids = BTreeSet::new();

        self.zero_identifiers(object, class, body, &mut outcome);
        if outcome.identifiers_zeroed > 0
        {
            hit_ids.insert(IDENTIFIER_RULE_ID.to_string());
        }

        if let Some(matcher) = &self.matcher
        {
            outcome.replacements += self.redact(matcher, body, &mut hit_ids);
        }

        outcome.hits = hit_ids
            .into_iter()
            .collect();
        outcome
    }

    /// Redact literal patterns in an object or class name. Returns the
    /// redacted label and the ids of the rules that matched.
    pub fn scrub_label(
        &self,
        label: &str,
    ) -> (String, Vec<String>)
    {
        let Some(matcher) = &self.matcher
        else
        {
            return (label.to_string(), Vec::new());
        };
        let mut bytes = string_to_latin1(label);
        let mut hit_ids = BTreeSet::new();
        if self.redact(matcher, &mut bytes, &mut hit_ids) == 0
        {
            return (label.to_string(), Vec::new());
        }
        (
            latin1_to_string(&bytes),
            hit_ids
                .into_iter()
                .collect(),
        )
    }

    /// Replace every literal match in `text` with [`HIDDEN`], re-checking
    /// until nothing matches. Returns the number of replacements.
    fn redact(
        &self,
        matcher: &AhoCorasick,
        text: &mut Vec<u8>,
        hit_ids: &mut BTreeSet<String>,
    ) -> usize
    {
        let mut replacements = 0;
        for _ in 0..MAX_PASSES
        {
            if !matcher.is_match(text.as_slice())
            {
                break;
            }
            let mut out = Vec::with_capacity(text.len());
            let mut last = 0;
            for m in matcher.find_iter(text.as_slice())
            {
                out.extend_from_slice(&text[last..m.start()]);
                out.extend_from_slice(HIDDEN.as_bytes());
                last = m.end();
                replacements += 1;
                hit_ids.insert(
                    self.rules[m
                        .pattern()
                        .as_usize()]
                    .id
                    .clone(),
                );
            }
            out.extend_from_slice(&text[last..]);
            *text = out;
        }
        replacements
    }

    fn zero_identifiers(
        &self,
        object: &str,
        class: &str,
        body: &mut [u8],
        outcome: &mut ScrubOutcome,
    )
    {
        let tag = &self
            .identifier
            .tag;
        if tag.is_empty()
        {
            return;
        }

        let mut found = false;
        let mut from = 0;
        while let Some(pos) = body[from..].find(tag)
        {
            found = true;
            let start = from + pos + tag.len();
            let field_len = body[start..]
                .iter()
                .take_while(|b| b.is_ascii_hexdigit() || **b == b'-')
                .count();
            let field = &mut body[start..start + field_len];
            let digits = field
                .iter()
                .filter(|b| b.is_ascii_hexdigit())
                .count();

            if digits == IDENTIFIER_DIGITS
            {
                let mut nonzero = false;
                for b in field
                    .iter_mut()
                    .filter(|b| b.is_ascii_hexdigit())
                {
                    nonzero |= *b != b'0';
                    *b = b'0';
                }
                if nonzero
                {
                    outcome.identifiers_zeroed += 1;
                }
            }
            else
            {
                outcome
                    .warnings
                    .push(ScrubPatternUnmatchedExpectation {
                        object: object.to_string(),
                        reason: format!(
                            "identifier field has {digits} hex digits, expected {IDENTIFIER_DIGITS}"
                        ),
                    });
            }
            from = start + field_len;
        }

        if !found
            && self
                .identifier
                .expected_classes
                .contains(class)
        {
            outcome
                .warnings
                .push(ScrubPatternUnmatchedExpectation {
                    object: object.to_string(),
                    reason: format!("class {class} carries no identifier field"),
                });
        }
    }
}

fn describe(path: Option<&Path>) -> String
{
    path.map_or_else(|| "no scrub file".to_string(), |p| p.display().to_string())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use proptest::prelude::*;

    fn ident() -> IdentifierRule
    {
        IdentifierRule::new("UniqueId=", ["WillowPlayerPawn".to_string()].into())
    }

    fn scrubber(patterns: &[&str]) -> Scrubber
    {
        Scrubber::new(
            patterns
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect(),
            ident(),
        )
        .unwrap()
    }

    #[test]
    fn replaces_literals_and_reports_rule_ids()
    {
        let s = scrubber(&["C:\\Users\\alice", "alice"]);
        let mut body = b"  Path=C:\\Users\\alice\\Docs\n  Owner=alice\n".to_vec();
        let out = s.scrub("GD.X", "Foo", &mut body);

        assert_eq!(body, b"  Path=<hidden>\\Docs\n  Owner=<hidden>\n".to_vec());
        assert_eq!(out.hits, vec!["rule-1", "rule-2"]);
        assert_eq!(out.replacements, 2);
    }

    #[test]
    fn labels_are_redacted_like_bodies()
    {
        let s = scrubber(&["alice"]);
        let (name, hits) = s.scrub_label("GD.alice_Save");
        assert_eq!(name, "GD.<hidden>_Save");
        assert_eq!(hits, vec!["rule-1"]);

        let (name, hits) = s.scrub_label("GD.Bob_Save");
        assert_eq!(name, "GD.Bob_Save");
        assert!(hits.is_empty());
    }

    #[test]
    fn zeroes_identifier_field()
    {
        let s = scrubber(&[]);
        let mut body = b"  UniqueId=0123456789ABCDEF-0123456789abcdef\n  Next=1\n".to_vec();
        let out = s.scrub("GD.X", "Foo", &mut body);

        assert_eq!(
            body,
            b"  UniqueId=0000000000000000-0000000000000000\n  Next=1\n".to_vec()
        );
        assert_eq!(out.hits, vec![IDENTIFIER_RULE_ID]);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn malformed_or_missing_identifier_warns()
    {
        let s = scrubber(&[]);
        let mut body = b"  UniqueId=1234\n".to_vec();
        let out = s.scrub("GD.X", "Foo", &mut body);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(body, b"  UniqueId=1234\n".to_vec());

        let mut body = b"  Other=1\n".to_vec();
        let out = s.scrub("Pawn_1", "WillowPlayerPawn", &mut body);
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0]
            .reason
            .contains("WillowPlayerPawn"));
        assert!(!out.scrubbed());
    }

    #[test]
    fn patterns_overlapping_the_token_are_rejected()
    {
        for bad in ["den", "<hidden>", "xx<hidden>yy", "n>secret", "secret<hi"]
        {
            let res = Scrubber::new(vec![bad.as_bytes().to_vec()], ident());
            assert!(
                matches!(res, Err(ScrubConfigError::OverlapsReplacement { .. })),
                "{bad} accepted"
            );
        }
        assert!(Scrubber::new(vec![b"secret".to_vec()], ident()).is_ok());
    }

    #[test]
    fn load_skips_blank_lines_for_numbering()
    {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("scrub.txt");
        fs::write(&path, "first\n\n  \nsecond\r\n").unwrap();

        let s = Scrubber::load(Some(&path), ident()).unwrap();
        let ids: Vec<_> = s
            .rules()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["rule-1", "rule-2"]);
        assert_eq!(s.rules()[1].pattern, b"second".to_vec());
    }

    proptest! {
        #[test]
        fn no_pattern_survives(
            patterns in prop::collection::vec("[a-cx-z]{2,4}", 1..5),
            body in "[a-cx-z<> ]{0,80}",
            name in "[a-cx-z._]{1,24}",
        )
        {
            let s = Scrubber::new(
                patterns.iter().map(|p| p.as_bytes().to_vec()).collect(),
                ident(),
            ).unwrap();
            let mut bytes = body.into_bytes();
            s.scrub("obj", "Foo", &mut bytes);
            let (scrubbed_name, _) = s.scrub_label(&name);
            for p in &patterns
            {
                prop_assert!(bytes.find(p.as_bytes()).is_none(), "{} survived", p);
                prop_assert!(!scrubbed_name.contains(p.as_str()), "{} survived in name", p);
            }
        }
    }
}
