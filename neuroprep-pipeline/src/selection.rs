//! Registration target and brain mask selection
//!
//! # Target priority
//! T1, then T2, then FL. A session that already holds registration outputs
//! keeps the target those outputs were registered to. ADC registration uses
//! its own order (T2, T1, FL).
//!
//! # Mask preference
//! A hand-edited mask (`mask_edit`) always beats a generated one. Among
//! several candidates of the same kind the first in listing order wins and
//! a warning names the ambiguity.

use crate::error::StageError;
use crate::state::SessionState;
use neuroprep_common::Sequence;
use std::path::PathBuf;
use tracing::warn;

/// Default structural target order
pub const TARGET_PRIORITY: [Sequence; 3] = [Sequence::T1, Sequence::T2, Sequence::FL];

/// Target order used when registering ADC images
pub const ADC_TARGET_PRIORITY: [Sequence; 3] = [Sequence::T2, Sequence::T1, Sequence::FL];

/// Where the chosen target was inferred from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSource {
    /// Existing `..._to_{target}_...` registration outputs
    Registered,
    /// Presence of the axial converted image
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetChoice {
    pub sequence: Sequence,
    pub source: TargetSource,
}

/// First sequence in `priority` whose axial image exists
pub fn select_raw_target(state: &SessionState, priority: &[Sequence]) -> Option<Sequence> {
    priority.iter().copied().find(|s| state.has_axial(*s))
}

/// Registered-first target selection
///
/// When outputs registered to more than one target exist, the highest
/// priority one is used.
pub fn select_target(state: &SessionState) -> Option<TargetChoice> {
    let registered = state.registration_targets();

    if let Some(sequence) = TARGET_PRIORITY.iter().copied().find(|s| registered.contains(s)) {
        if registered.len() > 1 {
            warn!(
                subject = state.subject(),
                targets = ?registered,
                chosen = %sequence,
                "Registration outputs exist for several targets"
            );
        }
        return Some(TargetChoice {
            sequence,
            source: TargetSource::Registered,
        });
    }

    select_raw_target(state, &TARGET_PRIORITY).map(|sequence| TargetChoice {
        sequence,
        source: TargetSource::Raw,
    })
}

/// Like [`select_target`], failing with `MissingModality`
pub fn require_target(state: &SessionState, purpose: &str) -> Result<TargetChoice, StageError> {
    select_target(state).ok_or_else(|| {
        StageError::MissingModality(format!(
            "Subject {} has no T1, T2 or FL to {}",
            state.subject(),
            purpose
        ))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    Edited,
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskChoice {
    pub file: PathBuf,
    pub kind: MaskKind,
}

/// Brain mask for `target`, edited before generated
pub fn select_mask(state: &SessionState, target: Sequence) -> Option<MaskChoice> {
    let candidates = state.mask_candidates(target);

    let (names, kind) = if !candidates.edited.is_empty() {
        (candidates.edited, MaskKind::Edited)
    } else if !candidates.generated.is_empty() {
        (candidates.generated, MaskKind::Generated)
    } else {
        return None;
    };

    if names.len() > 1 {
        warn!(
            subject = state.subject(),
            candidates = ?names,
            chosen = names[0],
            "Several masks found, using the first"
        );
    }

    Some(MaskChoice {
        file: state.path(names[0]),
        kind,
    })
}

/// Like [`select_mask`], failing with `MissingArtifact`
pub fn require_mask(state: &SessionState, target: Sequence, purpose: &str) -> Result<MaskChoice, StageError> {
    select_mask(state, target).ok_or_else(|| {
        StageError::MissingArtifact(format!(
            "Cannot find {} mask for subject {}, skipping {}",
            target,
            state.subject(),
            purpose
        ))
    })
}
