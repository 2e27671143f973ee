//! Per-session filename grammar
//!
//! The pipeline keeps no state of its own: what has already happened to a
//! session is encoded in the names of the files in its output folder. Every
//! name the pipeline writes or recognises is built or parsed here.
//!
//! | artifact            | name                                               |
//! |---------------------|----------------------------------------------------|
//! | converted image     | `{subject}_{view}_{sequence}.nii.gz`               |
//! | repeat conversion   | `{subject}_{view}_{sequence}_{n}.nii.gz`           |
//! | mask                | `{subject}_{view}_{sequence}_mask.nii.gz`          |
//! | edited mask         | contains `_mask_edit`                              |
//! | skull-stripped      | `{stem}_brain.nii.gz`                              |
//! | registration output | `{subject}_{moving}_to_{target}_Warped.nii.gz`     |
//! | registration affine | `{subject}_{moving}_to_{target}_0GenericAffine.mat`|
//! | template space      | `{stem}_to_template_Warped.nii.gz`                 |

use crate::sequence::Sequence;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Compressed NIfTI extension
pub const NIFTI_EXT: &str = ".nii.gz";

/// Registration infix separating moving and target labels
pub const TO_INFIX: &str = "_to_";

/// Suffix of the warped image written by a registration
pub const WARPED_SUFFIX: &str = "Warped.nii.gz";

/// Suffix of the affine transform written by a registration
pub const AFFINE_SUFFIX: &str = "0GenericAffine.mat";

/// Target label used for template-space registration outputs
pub const TEMPLATE_TARGET: &str = "template";

const AXIAL_ORIENTATION: [i64; 6] = [1, 0, 0, 0, 1, 0];
const SAGITTAL_ORIENTATION: [i64; 6] = [0, 1, 0, 0, 0, -1];
const CORONAL_ORIENTATION: [i64; 6] = [1, 0, 0, 0, 0, -1];

/// Anatomical imaging plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum View {
    #[serde(rename = "AX")]
    Axial,
    #[serde(rename = "SAG")]
    Sagittal,
    #[serde(rename = "COR")]
    Coronal,
    #[serde(rename = "UK")]
    Unknown,
}

impl View {
    pub fn as_str(&self) -> &'static str {
        match self {
            View::Axial => "AX",
            View::Sagittal => "SAG",
            View::Coronal => "COR",
            View::Unknown => "UK",
        }
    }

    pub fn from_token(token: &str) -> Option<View> {
        match token {
            "AX" => Some(View::Axial),
            "SAG" => Some(View::Sagittal),
            "COR" => Some(View::Coronal),
            "UK" => Some(View::Unknown),
            _ => None,
        }
    }

    /// Classify a DICOM image orientation (row and column direction cosines)
    ///
    /// Components are rounded to the nearest integer before comparison.
    pub fn from_orientation(cosines: &[f64]) -> View {
        if cosines.len() != 6 || cosines.iter().any(|c| !c.is_finite()) {
            return View::Unknown;
        }

        let mut rounded = [0i64; 6];
        for (slot, value) in rounded.iter_mut().zip(cosines) {
            *slot = value.round() as i64;
        }

        if rounded == AXIAL_ORIENTATION {
            View::Axial
        } else if rounded == SAGITTAL_ORIENTATION {
            View::Sagittal
        } else if rounded == CORONAL_ORIENTATION {
            View::Coronal
        } else {
            View::Unknown
        }
    }

    /// Parse orientation probe output such as `(0020,0037) DS [1\0\0\0\1\0]`
    ///
    /// Takes the bracketed value when present, otherwise the whole text;
    /// components may be separated by backslashes, commas or whitespace.
    pub fn from_probe_output(text: &str) -> View {
        let value = match (text.find('['), text.rfind(']')) {
            (Some(open), Some(close)) if open < close => &text[open + 1..close],
            _ => text,
        };

        let cosines: Result<Vec<f64>, _> = value
            .split(|c: char| c == '\\' || c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(str::parse::<f64>)
            .collect();

        match cosines {
            Ok(values) => View::from_orientation(&values),
            Err(_) => View::Unknown,
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Builders
// ============================================================================

/// `{subject}_{view}_{sequence}` (no extension)
pub fn raw_stem(subject: &str, view: View, sequence: Sequence) -> String {
    format!("{}_{}_{}", subject, view, sequence)
}

/// `{subject}_{view}_{sequence}.nii.gz`
pub fn raw_nifti(subject: &str, view: View, sequence: Sequence) -> String {
    format!("{}{}", raw_stem(subject, view, sequence), NIFTI_EXT)
}

/// `{subject}_AX_{sequence}.nii.gz`, the image every later stage keys on
pub fn axial_nifti(subject: &str, sequence: Sequence) -> String {
    raw_nifti(subject, View::Axial, sequence)
}

/// `{subject}_{view}_{sequence}_mask.nii.gz`
pub fn mask_nifti(subject: &str, view: View, sequence: Sequence) -> String {
    format!("{}_mask{}", raw_stem(subject, view, sequence), NIFTI_EXT)
}

/// `{stem}_brain.nii.gz` for an existing `{stem}.nii.gz` name
pub fn brain_nifti(file_name: &str) -> String {
    format!("{}_brain{}", nifti_stem(file_name), NIFTI_EXT)
}

/// Output prefix handed to the registration tool:
/// `{subject}_{moving}_to_{target}_`
pub fn registration_prefix(subject: &str, moving: &str, target: &str) -> String {
    format!("{}_{}{}{}_", subject, moving, TO_INFIX, target)
}

/// `{subject}_{moving}_to_{target}_Warped.nii.gz`
pub fn warped_nifti(subject: &str, moving: &str, target: &str) -> String {
    format!("{}{}", registration_prefix(subject, moving, target), WARPED_SUFFIX)
}

/// `{subject}_{moving}_to_{target}_0GenericAffine.mat`
pub fn affine_transform(subject: &str, moving: &str, target: &str) -> String {
    format!("{}{}", registration_prefix(subject, moving, target), AFFINE_SUFFIX)
}

/// `{stem}_to_template_Warped.nii.gz`, where `stem` is the part of the name
/// before any earlier `_to_` infix
pub fn template_warped_nifti(file_name: &str) -> String {
    let stem = nifti_stem(file_name);
    let stem = stem.split(TO_INFIX).next().unwrap_or(stem);
    format!("{}{}{}_{}", stem, TO_INFIX, TEMPLATE_TARGET, WARPED_SUFFIX)
}

/// Name without `.nii.gz` (or `.nii`)
pub fn nifti_stem(file_name: &str) -> &str {
    file_name
        .strip_suffix(NIFTI_EXT)
        .or_else(|| file_name.strip_suffix(".nii"))
        .unwrap_or(file_name)
}

pub fn is_nifti(file_name: &str) -> bool {
    file_name.ends_with(NIFTI_EXT)
}

// ============================================================================
// Parsers
// ============================================================================

/// Converted image name split into its grammar parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNifti {
    pub view: View,
    pub sequence: Sequence,
    /// Sequence token plus any repeat suffix, e.g. `T2` or `T2_1`.
    /// Used as the moving label of registration outputs.
    pub label: String,
    /// Repeat-conversion counter, `None` for the first conversion
    pub repeat: Option<u32>,
}

impl RawNifti {
    /// Parse `{subject}_{view}_{sequence}[_{n}].nii.gz`
    ///
    /// Anything else (masks, brains, registration outputs, renamed `_old`
    /// files) is rejected.
    pub fn parse(subject: &str, file_name: &str) -> Option<RawNifti> {
        let rest = file_name.strip_suffix(NIFTI_EXT)?;
        let rest = rest.strip_prefix(subject)?.strip_prefix('_')?;
        let (view_token, label) = rest.split_once('_')?;
        let view = View::from_token(view_token)?;

        let (sequence_token, repeat) = match label.split_once('_') {
            Some((seq, n)) => (seq, Some(n.parse::<u32>().ok()?)),
            None => (label, None),
        };
        let sequence = Sequence::from_token(sequence_token)?;

        Some(RawNifti {
            view,
            sequence,
            label: label.to_string(),
            repeat,
        })
    }
}

/// Target label of a registration output (`..._to_{target}_...`)
pub fn registration_target_token(file_name: &str) -> Option<&str> {
    let (_, after) = file_name.split_once(TO_INFIX)?;
    after.split('_').next().filter(|t| !t.is_empty())
}

// ============================================================================
// Idempotent naming
// ============================================================================

/// First unused `{stem}.nii.gz`, `{stem}_1.nii.gz`, `{stem}_2.nii.gz`, ...
///
/// A repeated conversion into the same folder never overwrites earlier
/// output.
pub fn next_free_nifti(dir: &Path, stem: &str) -> PathBuf {
    let first = dir.join(format!("{}{}", stem, NIFTI_EXT));
    if !first.exists() {
        return first;
    }

    let mut count: u32 = 1;
    loop {
        let candidate = dir.join(format!("{}_{}{}", stem, count, NIFTI_EXT));
        if !candidate.exists() {
            return candidate;
        }
        count += 1;
    }
}
