//! Session model and subject/session discovery
//!
//! A [`SessionInfo`] is created once per scan session before any stage runs
//! and flows through every stage unchanged, with one exception: after
//! conversion the orchestrator re-points `session_folder` at the output
//! folder (see [`SessionInfo::advanced`]).
//!
//! # Discovery rules
//! - Subjects are root sub-folders whose names end with a digit, or the
//!   names listed one per line in a subject file.
//! - A subject folder is itself a session when it holds NIfTI files, or when
//!   its first sub-folder holds DICOM files. Otherwise each sub-folder is a
//!   session.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One scan session's input and output locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub subject: String,
    pub session: String,
    /// Folder the next stage reads its inputs from
    pub session_folder: PathBuf,
    /// Folder stages write into
    pub output_folder: PathBuf,
    /// Root shared by all subjects (population artifacts live here)
    pub output_root: PathBuf,
}

impl SessionInfo {
    /// Build the session record for `session_folder` of `subject`
    ///
    /// Output goes to `{output_root}/{subject}` for single-session subjects
    /// and `{output_root}/{subject}/{session}` otherwise.
    pub fn new(subject: &str, session_folder: &Path, output_root: &Path) -> Self {
        let session = session_folder
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| subject.to_string());

        let output_folder = if session == subject {
            output_root.join(subject)
        } else {
            output_root.join(subject).join(&session)
        };

        Self {
            subject: subject.to_string(),
            session,
            session_folder: session_folder.to_path_buf(),
            output_folder,
            output_root: output_root.to_path_buf(),
        }
    }

    /// Same session, reading its inputs from its own output folder
    ///
    /// Called by the orchestrator between conversion and every later stage.
    pub fn advanced(self) -> Self {
        Self {
            session_folder: self.output_folder.clone(),
            ..self
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::InvalidInput(format!("session description: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::InvalidInput(format!("session description: {}", e)))
    }
}

/// Names of the entries directly inside `dir`, sorted by name
///
/// This is the listing order every "first candidate" decision refers to.
pub fn list_entry_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("listing {}: {}", dir.display(), e),
            ))
        })?;
        names.push(entry.file_name().to_string_lossy().to_string());
    }

    Ok(names)
}

/// Sub-folder names directly inside `dir`, sorted by name
fn list_subfolders(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Error accessing entry in {}: {}", dir.display(), e);
            }
        }
    }

    Ok(names)
}

fn ends_with_digit(name: &str) -> bool {
    name.chars().last().is_some_and(|c| c.is_ascii_digit())
}

/// Subjects to process under `root`
///
/// With a subject file, every listed name must end with a digit and exist as
/// a folder under `root`; otherwise all digit-terminated sub-folders are used.
pub fn discover_subjects(root: &Path, subject_file: Option<&Path>) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Err(Error::NotFound(format!("root folder {}", root.display())));
    }

    let folders: Vec<String> = list_subfolders(root)?
        .into_iter()
        .filter(|name| ends_with_digit(name))
        .collect();

    let Some(subject_file) = subject_file else {
        return Ok(folders);
    };

    let content = std::fs::read_to_string(subject_file)?;
    let subjects: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    for subject in &subjects {
        if !ends_with_digit(subject) {
            return Err(Error::InvalidInput(format!(
                "Subject folder names must end with a number but subject {} provided in subject file does not",
                subject
            )));
        }
        if !folders.contains(subject) {
            return Err(Error::NotFound(format!(
                "Subject {} provided in subject file, but folder named {} can not be found in {}",
                subject,
                subject,
                root.display()
            )));
        }
    }

    Ok(subjects)
}

/// Whether `folder` directly holds session data
pub fn is_session_folder(folder: &Path) -> Result<bool> {
    let entries = list_entry_names(folder)?;

    let has_nifti = entries
        .iter()
        .any(|name| name.ends_with(".nii") || name.ends_with(".nii.gz"));
    if has_nifti {
        return Ok(true);
    }

    if let Some(first) = list_subfolders(folder)?.first() {
        let inner = list_entry_names(&folder.join(first))?;
        if inner.iter().any(|name| name.ends_with("dcm")) {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Session folders of one subject (possibly the subject folder itself)
pub fn find_sessions_for_subject(subject_folder: &Path) -> Result<Vec<PathBuf>> {
    if is_session_folder(subject_folder)? {
        return Ok(vec![subject_folder.to_path_buf()]);
    }

    Ok(list_subfolders(subject_folder)?
        .into_iter()
        .map(|name| subject_folder.join(name))
        .collect())
}

/// Session records for every subject, in subject then session order
pub fn discover_sessions(
    root: &Path,
    output_root: &Path,
    subjects: &[String],
) -> Result<Vec<SessionInfo>> {
    let mut sessions = Vec::new();

    for subject in subjects {
        for folder in find_sessions_for_subject(&root.join(subject))? {
            sessions.push(SessionInfo::new(subject, &folder, output_root));
        }
    }

    Ok(sessions)
}
