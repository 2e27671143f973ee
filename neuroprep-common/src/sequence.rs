//! Sequence vocabulary and the sequence resolver
//!
//! Raw session folders contain one entry (DICOM folder or NIfTI file) per
//! acquisition, named however the scanner operator chose. The resolver maps
//! those names onto the canonical [`Sequence`] tags using an ordered list of
//! substring patterns per tag.
//!
//! # Matching rules
//! - Tags are visited in configured order, and each tag's patterns in
//!   configured order.
//! - An entry matches a pattern when it contains it (ASCII case-insensitive).
//! - A matched entry leaves the candidate pool, so no later tag or pattern
//!   can claim it. Ambiguous names resolve by configured precedence, never by
//!   specificity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical MRI acquisition tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Sequence {
    T1,
    T2,
    FL,
    DWI,
    ADC,
    #[serde(rename = "eADC")]
    EAdc,
    #[serde(rename = "b0")]
    B0,
    #[serde(rename = "b1000")]
    B1000,
    #[serde(rename = "b2600")]
    B2600,
}

impl Sequence {
    /// Every tag in vocabulary order
    pub const ALL: [Sequence; 9] = [
        Sequence::T1,
        Sequence::T2,
        Sequence::FL,
        Sequence::DWI,
        Sequence::ADC,
        Sequence::EAdc,
        Sequence::B0,
        Sequence::B1000,
        Sequence::B2600,
    ];

    /// Structural sequences that can serve as a registration target
    pub const STRUCTURAL: [Sequence; 3] = [Sequence::T1, Sequence::T2, Sequence::FL];

    /// Diffusion-derived sequences
    pub const DIFFUSION: [Sequence; 6] = [
        Sequence::DWI,
        Sequence::ADC,
        Sequence::EAdc,
        Sequence::B1000,
        Sequence::B0,
        Sequence::B2600,
    ];

    /// Tag as it appears in file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Sequence::T1 => "T1",
            Sequence::T2 => "T2",
            Sequence::FL => "FL",
            Sequence::DWI => "DWI",
            Sequence::ADC => "ADC",
            Sequence::EAdc => "eADC",
            Sequence::B0 => "b0",
            Sequence::B1000 => "b1000",
            Sequence::B2600 => "b2600",
        }
    }

    /// Parse a file-name token (case-insensitive, exact)
    pub fn from_token(token: &str) -> Option<Sequence> {
        Sequence::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(token))
    }

    pub fn is_structural(&self) -> bool {
        Sequence::STRUCTURAL.contains(self)
    }

    pub fn is_diffusion(&self) -> bool {
        Sequence::DIFFUSION.contains(self)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substring patterns for one tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRule {
    pub tag: Sequence,
    pub patterns: Vec<String>,
}

/// Ordered tag → patterns configuration
///
/// Order is significant: it is the tie-break authority for names that match
/// more than one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequencePatterns {
    rules: Vec<SequenceRule>,
}

impl SequencePatterns {
    pub fn new(rules: Vec<SequenceRule>) -> Self {
        Self { rules }
    }

    /// Built-in pattern list used when the configuration has none
    pub fn builtin() -> Self {
        let rule = |tag: Sequence, patterns: &[&str]| SequenceRule {
            tag,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        };

        Self::new(vec![
            rule(Sequence::T1, &["T1", "MPRAGE"]),
            rule(Sequence::T2, &["T2"]),
            rule(Sequence::FL, &["FLAIR", "FL"]),
            rule(Sequence::EAdc, &["EADC", "EXP_ADC"]),
            rule(Sequence::ADC, &["ADC"]),
            rule(Sequence::B1000, &["B1000"]),
            rule(Sequence::B2600, &["B2600"]),
            rule(Sequence::B0, &["B0"]),
            rule(Sequence::DWI, &["DWI", "TRACE", "DIFFUSION"]),
        ])
    }

    pub fn rules(&self) -> &[SequenceRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classify entry names into tags
    ///
    /// Consume-once, precedence-ordered matching; see the module docs.
    /// Entries matching no pattern are dropped.
    pub fn resolve<S: AsRef<str>>(&self, entries: &[S]) -> ResolvedSequences {
        let mut pool: Vec<(String, String)> = entries
            .iter()
            .map(|e| (e.as_ref().to_string(), e.as_ref().to_ascii_lowercase()))
            .collect();
        let mut assignments = Vec::with_capacity(self.rules.len());

        for rule in &self.rules {
            let mut matched = Vec::new();

            for pattern in &rule.patterns {
                let needle = pattern.to_ascii_lowercase();
                let (hits, rest): (Vec<_>, Vec<_>) = pool
                    .into_iter()
                    .partition(|(_, lower)| lower.contains(&needle));
                pool = rest;
                matched.extend(hits.into_iter().map(|(name, _)| name));
            }

            assignments.push((rule.tag, matched));
        }

        tracing::debug!(
            unmatched = pool.len(),
            "Sequence resolution complete"
        );

        ResolvedSequences { assignments }
    }
}

impl Default for SequencePatterns {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Result of [`SequencePatterns::resolve`], in configured tag order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSequences {
    assignments: Vec<(Sequence, Vec<String>)>,
}

impl ResolvedSequences {
    /// Entries assigned to `tag` (empty if the tag is not configured)
    pub fn get(&self, tag: Sequence) -> &[String] {
        self.assignments
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, entries)| entries.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Sequence, &[String])> {
        self.assignments
            .iter()
            .map(|(tag, entries)| (*tag, entries.as_slice()))
    }

    /// Tag an entry was assigned to, if any
    pub fn tag_of(&self, entry: &str) -> Option<Sequence> {
        self.assignments
            .iter()
            .find(|(_, entries)| entries.iter().any(|e| e == entry))
            .map(|(tag, _)| *tag)
    }

    pub fn total(&self) -> usize {
        self.assignments.iter().map(|(_, e)| e.len()).sum()
    }
}
