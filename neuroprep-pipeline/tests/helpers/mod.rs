//! Test helper utilities shared by the neuroprep-pipeline integration tests

#![allow(dead_code)]

pub mod fake_tools;
pub mod log_capture;

pub use fake_tools::{read_volume, write_volume, FakePredictor, FakeTools};
pub use log_capture::{capture_logs, LogCapture};

use neuroprep_common::{PipelineConfig, SessionInfo};
use neuroprep_pipeline::Pipeline;
use std::path::Path;
use std::sync::Arc;

/// Pipeline wired to fakes, with run id `test`
pub fn fake_pipeline(config: PipelineConfig) -> (Pipeline, Arc<FakeTools>, Arc<FakePredictor>) {
    let tools = FakeTools::new();
    let predictor = FakePredictor::new();
    let pipeline = Pipeline::new(Arc::new(config), tools.clone(), predictor.clone(), "test");
    (pipeline, tools, predictor)
}

/// Session that reads and writes `{root}/{subject}` (the state after
/// conversion)
pub fn converted_session(root: &Path, subject: &str) -> SessionInfo {
    let folder = root.join(subject);
    std::fs::create_dir_all(&folder).unwrap();
    SessionInfo::new(subject, &folder, root).advanced()
}

/// Create `names` in `dir`, each holding `content`
pub fn touch_all(dir: &Path, names: &[&str], content: &str) {
    std::fs::create_dir_all(dir).unwrap();
    for name in names {
        std::fs::write(dir.join(name), content).unwrap();
    }
}

/// Sorted entry names of `dir`
pub fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}
