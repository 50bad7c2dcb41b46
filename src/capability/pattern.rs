//! Resource patterns: glob-style matching and coverage.
//!
//! Syntax: `*` matches any run of characters within one `/`-separated
//! segment, `?` matches a single character, `{a,b}` matches one of the
//! listed alternatives, and a segment of exactly `**` matches zero or more
//! whole segments. Matches are anchored: the pattern must cover the entire
//! resource string.
//!
//! Coverage (`q.covers(p)`: every resource matching `p` also matches `q`)
//! is decided structurally on a segment normal form, cross-checked with
//! substitution probes over a fixed alphabet. When coverage cannot be
//! proven, the answer is `false` — callers treat that as DENY.

use crate::error::CapabilityError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on `{a,b}` expansion products, to keep the validator cheap.
const MAX_EXPANSIONS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Char(char),
    Star,
    Question,
    Alt(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    DoubleStar,
    Toks(Vec<Tok>),
}

/// A parsed, validated resource pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePattern {
    text: String,
    segments: Vec<Segment>,
}

impl TryFrom<String> for ResourcePattern {
    type Error = CapabilityError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        ResourcePattern::parse(&text)
    }
}

impl From<ResourcePattern> for String {
    fn from(pattern: ResourcePattern) -> String {
        pattern.text
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl ResourcePattern {
    pub fn parse(text: &str) -> Result<Self, CapabilityError> {
        if text.is_empty() {
            return Err(CapabilityError::InvalidPattern {
                pattern: text.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }

        let mut segments = Vec::new();
        for raw_segment in text.split('/') {
            if raw_segment == "**" {
                segments.push(Segment::DoubleStar);
                continue;
            }
            let mut toks = Vec::new();
            let mut chars = raw_segment.chars().peekable();
            while let Some(ch) = chars.next() {
                match ch {
                    '*' => toks.push(Tok::Star),
                    '?' => toks.push(Tok::Question),
                    '{' => {
                        let mut alternatives = Vec::new();
                        let mut current = String::new();
                        let mut closed = false;
                        for inner in chars.by_ref() {
                            match inner {
                                '}' => {
                                    alternatives.push(std::mem::take(&mut current));
                                    closed = true;
                                    break;
                                }
                                ',' => alternatives.push(std::mem::take(&mut current)),
                                '*' | '?' | '{' | '/' => {
                                    return Err(CapabilityError::InvalidPattern {
                                        pattern: text.to_string(),
                                        reason: format!(
                                            "`{}` is not allowed inside `{{...}}`",
                                            inner
                                        ),
                                    });
                                }
                                other => current.push(other),
                            }
                        }
                        if !closed {
                            return Err(CapabilityError::InvalidPattern {
                                pattern: text.to_string(),
                                reason: "unterminated `{` alternation".to_string(),
                            });
                        }
                        if alternatives.is_empty() {
                            return Err(CapabilityError::InvalidPattern {
                                pattern: text.to_string(),
                                reason: "empty `{}` alternation".to_string(),
                            });
                        }
                        toks.push(Tok::Alt(alternatives));
                    }
                    '}' => {
                        return Err(CapabilityError::InvalidPattern {
                            pattern: text.to_string(),
                            reason: "`}` without matching `{`".to_string(),
                        });
                    }
                    other => toks.push(Tok::Char(other)),
                }
            }
            segments.push(Segment::Toks(toks));
        }

        Ok(ResourcePattern {
            text: text.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Anchored full match of `resource` against this pattern.
    pub fn matches(&self, resource: &str) -> bool {
        let parts: Vec<&str> = resource.split('/').collect();
        match_segments(&self.segments, &parts)
    }

    /// True when every resource matching `other` also matches `self`.
    pub fn covers(&self, other: &ResourcePattern) -> bool {
        let q_expansions = expand_alternations(&self.segments);
        let p_expansions = expand_alternations(&other.segments);
        if q_expansions.is_empty() || p_expansions.is_empty() {
            // Expansion overflow: cannot prove coverage.
            return false;
        }

        let structurally_covered = p_expansions.iter().all(|pe| {
            q_expansions
                .iter()
                .any(|qe| covers_simple(qe, pe))
        });
        if !structurally_covered {
            return false;
        }

        // Substitution probes: every sample drawn from `other` must match
        // `self`. A failing probe vetoes the structural answer.
        probes(other).iter().all(|probe| self.matches(probe))
    }
}

fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
    match pattern.first() {
        None => parts.is_empty(),
        Some(Segment::DoubleStar) => {
            // Zero or more whole segments.
            if match_segments(&pattern[1..], parts) {
                return true;
            }
            if parts.is_empty() {
                return false;
            }
            match_segments(pattern, &parts[1..])
        }
        Some(Segment::Toks(toks)) => {
            let Some(part) = parts.first() else {
                return false;
            };
            if !match_toks(toks, &part.chars().collect::<Vec<_>>()) {
                return false;
            }
            match_segments(&pattern[1..], &parts[1..])
        }
    }
}

fn match_toks(toks: &[Tok], chars: &[char]) -> bool {
    match toks.first() {
        None => chars.is_empty(),
        Some(Tok::Char(c)) => {
            chars.first() == Some(c) && match_toks(&toks[1..], &chars[1..])
        }
        Some(Tok::Question) => !chars.is_empty() && match_toks(&toks[1..], &chars[1..]),
        Some(Tok::Star) => {
            for skip in 0..=chars.len() {
                if match_toks(&toks[1..], &chars[skip..]) {
                    return true;
                }
            }
            false
        }
        Some(Tok::Alt(alternatives)) => alternatives.iter().any(|alt| {
            let alt_chars: Vec<char> = alt.chars().collect();
            chars.len() >= alt_chars.len()
                && chars[..alt_chars.len()] == alt_chars[..]
                && match_toks(&toks[1..], &chars[alt_chars.len()..])
        }),
    }
}

/// Replace every `Alt` with each of its choices; the result is a list of
/// alternation-free segment vectors. Returns an empty list on overflow.
fn expand_alternations(segments: &[Segment]) -> Vec<Vec<Segment>> {
    let mut out: Vec<Vec<Segment>> = vec![Vec::new()];
    for segment in segments {
        match segment {
            Segment::DoubleStar => {
                for variant in &mut out {
                    variant.push(Segment::DoubleStar);
                }
            }
            Segment::Toks(toks) => {
                let variants = expand_segment(toks);
                let mut next = Vec::new();
                for base in &out {
                    for variant in &variants {
                        if next.len() >= MAX_EXPANSIONS {
                            return Vec::new();
                        }
                        let mut grown = base.clone();
                        grown.push(Segment::Toks(variant.clone()));
                        next.push(grown);
                    }
                }
                out = next;
            }
        }
    }
    out
}

fn expand_segment(toks: &[Tok]) -> Vec<Vec<Tok>> {
    let mut out: Vec<Vec<Tok>> = vec![Vec::new()];
    for tok in toks {
        match tok {
            Tok::Alt(alternatives) => {
                let mut next = Vec::new();
                for base in &out {
                    for alt in alternatives {
                        if next.len() >= MAX_EXPANSIONS {
                            return vec![toks.to_vec()];
                        }
                        let mut grown = base.clone();
                        grown.extend(alt.chars().map(Tok::Char));
                        next.push(grown);
                    }
                }
                out = next;
            }
            other => {
                for variant in &mut out {
                    variant.push(other.clone());
                }
            }
        }
    }
    out
}

/// Coverage on alternation-free patterns; conservative.
fn covers_simple(q: &[Segment], p: &[Segment]) -> bool {
    // `**` alone covers everything.
    if q == [Segment::DoubleStar] {
        return true;
    }

    let q_has_double = q.contains(&Segment::DoubleStar);
    let p_has_double = p.contains(&Segment::DoubleStar);

    if q_has_double {
        // Only the trailing-`**` form is decided; everything else is DENY
        // unless identical.
        if q.last() == Some(&Segment::DoubleStar)
            && q[..q.len() - 1].iter().all(|s| *s != Segment::DoubleStar)
        {
            let q_prefix = &q[..q.len() - 1];
            if p_has_double {
                // p's `**` must sit inside the region q's `**` absorbs.
                if p.len() < q_prefix.len() {
                    return false;
                }
                if p[..q_prefix.len()].iter().any(|s| *s == Segment::DoubleStar) {
                    return false;
                }
                return zip_covers(q_prefix, &p[..q_prefix.len()]);
            }
            if p.len() < q_prefix.len() {
                return false;
            }
            return zip_covers(q_prefix, &p[..q_prefix.len()]);
        }
        return q == p;
    }

    if p_has_double {
        // p matches arbitrarily many segments; a fixed-length q cannot
        // cover it.
        return false;
    }

    if q.len() != p.len() {
        return false;
    }
    zip_covers(q, p)
}

fn zip_covers(q: &[Segment], p: &[Segment]) -> bool {
    q.iter().zip(p.iter()).all(|(qs, ps)| match (qs, ps) {
        (Segment::Toks(qt), Segment::Toks(pt)) => segment_covers(qt, pt),
        (Segment::DoubleStar, _) => true,
        (_, Segment::DoubleStar) => false,
    })
}

/// Within-segment coverage for alternation-free token lists.
fn segment_covers(q: &[Tok], p: &[Tok]) -> bool {
    let star_count = q.iter().filter(|t| **t == Tok::Star).count();

    if star_count == 0 {
        // 1:1 token coverage.
        if q.len() != p.len() {
            return false;
        }
        return q.iter().zip(p.iter()).all(|(qt, pt)| tok_covers(qt, pt));
    }

    // Only the `prefix * suffix` shape is decided (consecutive stars
    // collapse into one). Anything more intricate: deny unless identical.
    let first = q.iter().position(|t| *t == Tok::Star).unwrap();
    let last = q.iter().rposition(|t| *t == Tok::Star).unwrap();
    if q[first..=last].iter().any(|t| *t != Tok::Star) {
        return q == p;
    }

    let q_prefix = &q[..first];
    let q_suffix = &q[last + 1..];
    if p.len() < q_prefix.len() + q_suffix.len() {
        return false;
    }
    let p_prefix = &p[..q_prefix.len()];
    let p_suffix = &p[p.len() - q_suffix.len()..];
    // The fixed flanks must cover 1:1 and must not swallow a star in p.
    if p_prefix.iter().any(|t| *t == Tok::Star) || p_suffix.iter().any(|t| *t == Tok::Star) {
        return false;
    }
    q_prefix
        .iter()
        .zip(p_prefix.iter())
        .all(|(qt, pt)| tok_covers(qt, pt))
        && q_suffix
            .iter()
            .zip(p_suffix.iter())
            .all(|(qt, pt)| tok_covers(qt, pt))
}

fn tok_covers(q: &Tok, p: &Tok) -> bool {
    match (q, p) {
        (Tok::Question, Tok::Char(_)) | (Tok::Question, Tok::Question) => true,
        (Tok::Char(a), Tok::Char(b)) => a == b,
        // A literal can never cover `?` or `*`; `*` is handled above.
        _ => false,
    }
}

/// Sample resources drawn from `pattern` by substituting wildcards with
/// members of a fixed alphabet.
fn probes(pattern: &ResourcePattern) -> Vec<String> {
    const STAR_SAMPLES: [&str; 3] = ["", "a", "ab0"];
    const QUESTION_SAMPLES: [char; 2] = ['a', '0'];
    const DOUBLE_SAMPLES: [&str; 3] = ["", "a", "a/b"];

    let mut out: Vec<String> = vec![String::new()];
    let mut first_segment = true;
    for segment in &pattern.segments {
        let mut seg_variants: Vec<String> = vec![String::new()];
        let absorb_separator = match segment {
            Segment::DoubleStar => {
                seg_variants = DOUBLE_SAMPLES.iter().map(|s| s.to_string()).collect();
                true
            }
            Segment::Toks(toks) => {
                for tok in toks {
                    let choices: Vec<String> = match tok {
                        Tok::Char(c) => vec![c.to_string()],
                        Tok::Star => STAR_SAMPLES.iter().map(|s| s.to_string()).collect(),
                        Tok::Question => {
                            QUESTION_SAMPLES.iter().map(|c| c.to_string()).collect()
                        }
                        Tok::Alt(alts) => alts.clone(),
                    };
                    let mut next = Vec::new();
                    for base in &seg_variants {
                        for choice in &choices {
                            if next.len() >= MAX_EXPANSIONS {
                                next.push(format!("{}{}", base, choice));
                                break;
                            }
                            next.push(format!("{}{}", base, choice));
                        }
                    }
                    seg_variants = next;
                    seg_variants.truncate(MAX_EXPANSIONS);
                }
                false
            }
        };

        let mut next = Vec::new();
        for base in &out {
            for variant in &seg_variants {
                if next.len() >= MAX_EXPANSIONS * 4 {
                    break;
                }
                // `**` matched zero segments: skip the separator too.
                if absorb_separator && variant.is_empty() {
                    next.push(base.clone());
                } else if first_segment {
                    next.push(variant.clone());
                } else {
                    next.push(format!("{}/{}", base, variant));
                }
            }
        }
        out = next;
        first_segment = false;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(text: &str) -> ResourcePattern {
        ResourcePattern::parse(text).expect("pattern")
    }

    #[test]
    fn test_literal_match() {
        assert!(pat("data/a.csv").matches("data/a.csv"));
        assert!(!pat("data/a.csv").matches("data/b.csv"));
        assert!(!pat("data/a.csv").matches("data/a.csv/x"));
    }

    #[test]
    fn test_star_stays_in_segment() {
        let p = pat("data/*.csv");
        assert!(p.matches("data/a.csv"));
        assert!(p.matches("data/.csv"));
        assert!(!p.matches("data/sub/a.csv"));
        assert!(!p.matches("other/a.csv"));
    }

    #[test]
    fn test_question_and_alternation() {
        assert!(pat("file?.txt").matches("file1.txt"));
        assert!(!pat("file?.txt").matches("file10.txt"));
        let alt = pat("logs/{app,sys}.log");
        assert!(alt.matches("logs/app.log"));
        assert!(alt.matches("logs/sys.log"));
        assert!(!alt.matches("logs/db.log"));
    }

    #[test]
    fn test_double_star() {
        let p = pat("data/**");
        assert!(p.matches("data"));
        assert!(p.matches("data/a"));
        assert!(p.matches("data/a/b/c"));
        assert!(!p.matches("other/a"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(ResourcePattern::parse("").is_err());
        assert!(ResourcePattern::parse("a{b").is_err());
        assert!(ResourcePattern::parse("a}b").is_err());
        assert!(ResourcePattern::parse("a{}b").is_err());
        assert!(ResourcePattern::parse("a{b*c}").is_err());
    }

    #[test]
    fn test_coverage_basics() {
        assert!(pat("data/*.csv").covers(&pat("data/a.csv")));
        assert!(pat("data/*").covers(&pat("data/*.csv")));
        assert!(pat("*/a.csv").covers(&pat("data/a.csv")));
        assert!(!pat("data/a.csv").covers(&pat("data/*.csv")));
        assert!(!pat("data/*.csv").covers(&pat("data/*")));
        assert!(!pat("data/*.csv").covers(&pat("other/a.csv")));
    }

    #[test]
    fn test_coverage_question() {
        assert!(pat("file?.txt").covers(&pat("file1.txt")));
        assert!(pat("file?.txt").covers(&pat("file?.txt")));
        assert!(!pat("file1.txt").covers(&pat("file?.txt")));
        assert!(pat("file*.txt").covers(&pat("file?.txt")));
    }

    #[test]
    fn test_coverage_alternation() {
        assert!(pat("logs/{app,sys}.log").covers(&pat("logs/app.log")));
        assert!(pat("logs/*.log").covers(&pat("logs/{app,sys}.log")));
        assert!(!pat("logs/{app,sys}.log").covers(&pat("logs/*.log")));
        assert!(pat("logs/{app,sys,db}.log").covers(&pat("logs/{app,db}.log")));
        assert!(!pat("logs/{app,sys}.log").covers(&pat("logs/{app,db}.log")));
    }

    #[test]
    fn test_coverage_double_star() {
        assert!(pat("**").covers(&pat("data/*.csv")));
        assert!(pat("data/**").covers(&pat("data/a/b.csv")));
        assert!(pat("data/**").covers(&pat("data/**")));
        assert!(pat("data/**").covers(&pat("data/*/b.csv")));
        assert!(!pat("data/*").covers(&pat("data/**")));
        assert!(!pat("data/**").covers(&pat("other/**")));
    }

    #[test]
    fn test_coverage_denies_when_unprovable() {
        // q has stars separated by a literal: undecided shape, identical
        // patterns still cover themselves.
        assert!(pat("a*b*c").covers(&pat("a*b*c")));
        assert!(!pat("a*b*c").covers(&pat("a*x*c")));
        // `**` in the middle is only decided for identical patterns.
        assert!(pat("a/**/b").covers(&pat("a/**/b")));
        assert!(!pat("a/**/b").covers(&pat("a/x/b")));
    }

    #[test]
    fn test_serde_roundtrip() {
        let p = pat("data/{a,b}/*.csv");
        let json = serde_json::to_string(&p).unwrap();
        let back: ResourcePattern = serde_json::from_str(&json).unwrap();
        assert!(back.matches("data/a/x.csv"));
        assert_eq!(back.as_str(), p.as_str());
    }
}
