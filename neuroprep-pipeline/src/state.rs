//! Session folder state
//!
//! A session's progress lives only in the names of the files in its folder.
//! [`SessionState`] takes one sorted listing and answers typed questions
//! about it so that stages never match raw substrings themselves.
//!
//! Every stage reads its state fresh from disk when it starts.

use crate::error::StageError;
use neuroprep_common::naming::{self, RawNifti, TEMPLATE_TARGET, TO_INFIX};
use neuroprep_common::session::list_entry_names;
use neuroprep_common::Sequence;
use std::path::{Path, PathBuf};

const SEGMENTATION_MARKERS: [&str; 3] = ["seg", "lesion", "stroke"];

fn lower_contains(name: &str, needle: &str) -> bool {
    name.to_ascii_lowercase().contains(needle)
}

fn is_segmentation(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SEGMENTATION_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_template_space(name: &str) -> bool {
    lower_contains(name, TEMPLATE_TARGET)
}

fn is_registered(name: &str) -> bool {
    lower_contains(name, TO_INFIX)
}

/// Snapshot of one session folder
#[derive(Debug, Clone)]
pub struct SessionState {
    subject: String,
    dir: PathBuf,
    entries: Vec<String>,
}

impl SessionState {
    /// List `dir`; a missing folder reads as empty
    pub fn read(subject: &str, dir: &Path) -> Result<Self, StageError> {
        let entries = if dir.is_dir() {
            list_entry_names(dir)?
        } else {
            Vec::new()
        };
        Ok(Self::from_entries(subject, dir, entries))
    }

    pub fn from_entries(subject: &str, dir: &Path, mut entries: Vec<String>) -> Self {
        entries.sort();
        Self {
            subject: subject.to_string(),
            dir: dir.to_path_buf(),
            entries,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// `name` carries `tag` as one of its `_`-separated tokens after the
    /// subject prefix, so subject names never count as sequence tags
    fn has_tag(&self, name: &str, tag: &str) -> bool {
        let rest = name
            .strip_prefix(self.subject.as_str())
            .and_then(|r| r.strip_prefix('_'))
            .unwrap_or(name);
        rest.split(['_', '.']).any(|token| token.eq_ignore_ascii_case(tag))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e == name)
    }

    /// `{subject}_AX_{sequence}.nii.gz`
    pub fn axial(&self, sequence: Sequence) -> Option<PathBuf> {
        let name = naming::axial_nifti(&self.subject, sequence);
        self.contains(&name).then(|| self.path(&name))
    }

    pub fn has_axial(&self, sequence: Sequence) -> bool {
        self.axial(sequence).is_some()
    }

    /// Converted images, parsed, in listing order
    pub fn raw_niftis(&self) -> Vec<(&str, RawNifti)> {
        self.entries
            .iter()
            .filter_map(|name| RawNifti::parse(&self.subject, name).map(|raw| (name.as_str(), raw)))
            .collect()
    }

    /// Structural sequences that already have a registration output in this
    /// folder (`..._to_{T1|T2|FL}_...`), excluding template space
    pub fn registration_targets(&self) -> Vec<Sequence> {
        let mut targets: Vec<Sequence> = self
            .entries
            .iter()
            .filter(|n| naming::is_nifti(n) && !is_template_space(n))
            .filter_map(|n| naming::registration_target_token(n))
            .filter_map(Sequence::from_token)
            .filter(Sequence::is_structural)
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Registration outputs still to be skull stripped
    pub fn registered_images(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(String::as_str)
            .filter(|n| naming::is_nifti(n) && is_registered(n))
            .filter(|n| !lower_contains(n, "brain") && !is_template_space(n) && !is_segmentation(n))
            .collect()
    }

    /// Skull-stripped registration outputs (target space)
    pub fn registered_brains(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(String::as_str)
            .filter(|n| naming::is_nifti(n) && is_registered(n) && lower_contains(n, "brain"))
            .filter(|n| !is_template_space(n) && !lower_contains(n, "resampled"))
            .collect()
    }

    /// Segmentations registered to the session's structural target
    pub fn target_space_segmentations(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(String::as_str)
            .filter(|n| naming::is_nifti(n) && is_registered(n) && is_segmentation(n))
            .filter(|n| !is_template_space(n))
            .collect()
    }

    /// Segmentations already in template space
    pub fn template_segmentations(&self) -> Vec<&str> {
        let marker = format!("{}{}", TO_INFIX, TEMPLATE_TARGET);
        self.entries
            .iter()
            .map(String::as_str)
            .filter(|n| naming::is_nifti(n) && is_segmentation(n) && lower_contains(n, &marker))
            .collect()
    }

    /// Skull-stripped, unregistered images of `target`
    pub fn target_brains(&self, target: Sequence) -> Vec<&str> {
        self.entries
            .iter()
            .map(String::as_str)
            .filter(|n| naming::is_nifti(n) && lower_contains(n, "brain"))
            .filter(|n| !lower_contains(n, "resampled") && !is_registered(n))
            .filter(|n| self.has_tag(n, target.as_str()))
            .collect()
    }

    /// Mask candidates for `target`: names containing `mask` and the target
    /// tag token, split into hand-edited and generated
    pub fn mask_candidates(&self, target: Sequence) -> MaskCandidates<'_> {
        let mut candidates = MaskCandidates::default();

        for name in self.entries.iter().map(String::as_str) {
            if !name.contains("mask") || !self.has_tag(name, target.as_str()) {
                continue;
            }
            if name.contains("mask_edit") {
                candidates.edited.push(name);
            } else if name.ends_with(&format!("_mask{}", naming::NIFTI_EXT)) {
                candidates.generated.push(name);
            }
        }

        candidates
    }
}

/// Masks found for one target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskCandidates<'a> {
    pub edited: Vec<&'a str>,
    pub generated: Vec<&'a str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(entries: &[&str]) -> SessionState {
        SessionState::from_entries(
            "S01",
            Path::new("/out/S01"),
            entries.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_raw_niftis_skip_derived_files() {
        let s = state(&[
            "S01_AX_T1.nii.gz",
            "S01_AX_T1_brain.nii.gz",
            "S01_AX_T1_mask.nii.gz",
            "S01_SAG_T2.nii.gz",
            "S01_T2_to_T1_Warped.nii.gz",
            "S01_AX_T1.json",
        ]);
        let names: Vec<&str> = s.raw_niftis().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["S01_AX_T1.nii.gz", "S01_SAG_T2.nii.gz"]);
    }

    #[test]
    fn test_registered_file_classes() {
        let s = state(&[
            "S01_ADC_to_T1_Warped.nii.gz",
            "S01_ADC_to_T1_Warped_brain.nii.gz",
            "S01_ADC_to_T1_0GenericAffine.mat",
            "S01_stroke_segmentation_to_T1_Warped.nii.gz",
            "S01_T1_to_template_Warped.nii.gz",
            "S01_ADC_to_template_Warped.nii.gz",
            "S01_stroke_segmentation_to_template_Warped.nii.gz",
        ]);

        assert_eq!(s.registered_images(), vec!["S01_ADC_to_T1_Warped.nii.gz"]);
        assert_eq!(s.registered_brains(), vec!["S01_ADC_to_T1_Warped_brain.nii.gz"]);
        assert_eq!(
            s.target_space_segmentations(),
            vec!["S01_stroke_segmentation_to_T1_Warped.nii.gz"]
        );
        assert_eq!(
            s.template_segmentations(),
            vec!["S01_stroke_segmentation_to_template_Warped.nii.gz"]
        );
        assert_eq!(s.registration_targets(), vec![Sequence::T1]);
    }

    #[test]
    fn test_target_brains_exclude_resampled_and_registered() {
        let s = state(&[
            "S01_AX_T1_brain.nii.gz",
            "S01_AX_T1_brain_resampled.nii.gz",
            "S01_T2_to_T1_Warped_brain.nii.gz",
            "S01_AX_T2_brain.nii.gz",
        ]);
        assert_eq!(s.target_brains(Sequence::T1), vec!["S01_AX_T1_brain.nii.gz"]);
    }

    #[test]
    fn test_mask_candidates_split_edited_and_generated() {
        let s = state(&[
            "S01_AX_T1_mask.nii.gz",
            "S01_AX_T1_mask_edit.nii.gz",
            "S01_AX_T2_mask.nii.gz",
            "S01_AX_T1_mask.json",
        ]);
        let candidates = s.mask_candidates(Sequence::T1);
        assert_eq!(candidates.edited, vec!["S01_AX_T1_mask_edit.nii.gz"]);
        assert_eq!(candidates.generated, vec!["S01_AX_T1_mask.nii.gz"]);
    }

    #[test]
    fn test_target_tag_ignores_subject_name() {
        let s = SessionState::from_entries(
            "SUBJECT10",
            Path::new("/out/SUBJECT10"),
            vec![
                "SUBJECT10_AX_T2_mask.nii.gz".to_string(),
                "SUBJECT10_AX_T2_brain.nii.gz".to_string(),
            ],
        );
        assert_eq!(s.mask_candidates(Sequence::T1), MaskCandidates::default());
        assert!(s.target_brains(Sequence::T1).is_empty());
        assert_eq!(s.mask_candidates(Sequence::T2).generated, vec!["SUBJECT10_AX_T2_mask.nii.gz"]);
        assert_eq!(s.target_brains(Sequence::T2), vec!["SUBJECT10_AX_T2_brain.nii.gz"]);

        let s = SessionState::from_entries(
            "P_T1",
            Path::new("/out/P_T1"),
            vec!["P_T1_AX_T2_mask_edit.nii.gz".to_string()],
        );
        assert!(s.mask_candidates(Sequence::T1).edited.is_empty());
        assert_eq!(s.mask_candidates(Sequence::T2).edited, vec!["P_T1_AX_T2_mask_edit.nii.gz"]);
    }

    #[test]
    fn test_missing_folder_reads_empty() {
        let s = SessionState::read("S01", Path::new("/nonexistent/neuroprep/S01")).unwrap();
        assert!(s.entries().is_empty());
    }
}
