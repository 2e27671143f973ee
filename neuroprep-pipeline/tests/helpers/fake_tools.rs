//! In-process stand-ins for the imaging toolkit and the prediction models
//!
//! Images are text files of whitespace-separated integers ("volumes").
//! `fslmaths` arithmetic is evaluated for real on those volumes; every
//! other tool produces the files its real counterpart would, copying its
//! input where it has one.

use async_trait::async_trait;
use neuroprep_pipeline::predict::{PredictError, PredictionRequest, Predictor};
use neuroprep_pipeline::tools::{ToolCommand, ToolError, ToolOutput, ToolRunner};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn read_volume(path: &Path) -> Vec<i64> {
    std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("reading volume {}: {}", path.display(), e))
        .split_whitespace()
        .map(|v| v.parse().unwrap())
        .collect()
}

pub fn write_volume(path: &Path, voxels: &[i64]) {
    let text: Vec<String> = voxels.iter().map(|v| v.to_string()).collect();
    std::fs::write(path, text.join(" ")).unwrap();
}

fn try_read_volume(path: &str) -> Option<Vec<i64>> {
    let text = std::fs::read_to_string(path).ok()?;
    text.split_whitespace().map(|v| v.parse().ok()).collect()
}

#[derive(Default)]
pub struct FakeTools {
    calls: Mutex<Vec<ToolCommand>>,
    failures: Mutex<Vec<(String, String)>>,
    volume_counts: Mutex<HashMap<String, u32>>,
    orientation: Mutex<Option<String>>,
    stderr: Mutex<HashMap<String, String>>,
}

impl FakeTools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            orientation: Mutex::new(Some("(0020,0037) DS [1\\0\\0\\0\\1\\0]".to_string())),
            ..Self::default()
        })
    }

    /// Make `program` exit 1 whenever one of its arguments contains `needle`
    pub fn fail_when(&self, program: &str, needle: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((program.to_string(), needle.to_string()));
    }

    /// Volume count reported for files whose path contains `needle`
    pub fn set_volume_count(&self, needle: &str, count: u32) {
        self.volume_counts
            .lock()
            .unwrap()
            .insert(needle.to_string(), count);
    }

    /// Text written to stderr by every run of `program`
    pub fn set_stderr(&self, program: &str, text: &str) {
        self.stderr
            .lock()
            .unwrap()
            .insert(program.to_string(), text.to_string());
    }

    /// Orientation probe output; `None` makes the probe fail
    pub fn set_orientation(&self, output: Option<&str>) {
        *self.orientation.lock().unwrap() = output.map(str::to_string);
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<ToolCommand> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    fn should_fail(&self, command: &ToolCommand) -> bool {
        self.failures
            .lock()
            .unwrap()
            .iter()
            .any(|(program, needle)| {
                *program == command.program && command.args.iter().any(|a| a.contains(needle.as_str()))
            })
    }

    async fn voxel_math(&self, command: &ToolCommand) -> ToolOutput {
        let [input, op, operand, output] = command.args.as_slice() else {
            return failed(command, "usage: fslmaths <in> <op> <operand> <out>");
        };
        let Some(a) = try_read_volume(input) else {
            return failed(command, &format!("cannot read {}", input));
        };

        let result: Vec<i64> = match op.as_str() {
            "-thr" => {
                let thr: i64 = operand.parse().unwrap();
                a.iter().map(|&v| if v < thr { 0 } else { v }).collect()
            }
            "-add" | "-mul" => {
                let Some(b) = try_read_volume(operand) else {
                    return failed(command, &format!("cannot read {}", operand));
                };
                let len = if op == "-add" { a.len().max(b.len()) } else { a.len() };
                (0..len)
                    .map(|i| {
                        let x = a.get(i).copied().unwrap_or(0);
                        let y = b.get(i).copied().unwrap_or(0);
                        if op == "-add" { x + y } else { x * y }
                    })
                    .collect()
            }
            other => return failed(command, &format!("unsupported op {}", other)),
        };

        // Widen the read-modify-write window so unguarded writers would race
        tokio::time::sleep(Duration::from_millis(5)).await;

        write_volume(Path::new(output), &result);
        ok(command, "")
    }

    fn volume_count(&self, command: &ToolCommand) -> ToolOutput {
        let input = command.args.first().cloned().unwrap_or_default();
        let count = self
            .volume_counts
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| input.contains(needle.as_str()))
            .map(|(_, c)| *c)
            .unwrap_or(1);
        ok(command, &format!("{}\n", count))
    }
}

fn ok(command: &ToolCommand, stdout: &str) -> ToolOutput {
    ToolOutput {
        command: command.clone(),
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(command: &ToolCommand, stderr: &str) -> ToolOutput {
    ToolOutput {
        command: command.clone(),
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn copy(command: &ToolCommand, from: Option<&str>, to: Option<&str>) -> ToolOutput {
    let (Some(from), Some(to)) = (from, to) else {
        return failed(command, "missing input or output argument");
    };
    if from == to {
        return ok(command, "");
    }
    match std::fs::copy(from, to) {
        Ok(_) => ok(command, ""),
        Err(e) => failed(command, &format!("{}: {}", from, e)),
    }
}

fn touch(path: &Path) {
    std::fs::write(path, "").unwrap();
}

#[async_trait]
impl ToolRunner for FakeTools {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
        self.calls.lock().unwrap().push(command.clone());

        let stderr = self.stderr.lock().unwrap().get(&command.program).cloned();
        if self.should_fail(command) {
            let mut output = failed(command, "simulated failure");
            if let Some(text) = stderr {
                output.stderr = text;
            }
            return Ok(output);
        }

        let arg = |i: usize| command.args.get(i).map(String::as_str);
        let orientation = self.orientation.lock().unwrap().clone();

        let output = match command.program.as_str() {
            "fslmaths" => self.voxel_math(command).await,
            "dcm2niix" => {
                let (Some(dir), Some(name)) = (command.flag_value("-o"), command.flag_value("-f")) else {
                    return Ok(failed(command, "missing -o or -f"));
                };
                touch(&Path::new(dir).join(format!("{}.nii.gz", name)));
                ok(command, "")
            }
            "dcmdump" => match orientation {
                Some(text) => ok(command, &text),
                None => failed(command, "cannot read DICOM"),
            },
            "fslval" => self.volume_count(command),
            "fslroi" | "bet" => copy(command, arg(0), arg(1)),
            "flirt" => copy(command, command.flag_value("-in"), command.flag_value("-out")),
            "antsApplyTransforms" => {
                copy(command, command.flag_value("--input"), command.flag_value("--output"))
            }
            "antsRegistration" => {
                let Some(outputs) = command.flag_value("--output") else {
                    return Ok(failed(command, "missing --output"));
                };
                let prefix = outputs
                    .trim_start_matches('[')
                    .split(',')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                touch(&PathBuf::from(format!("{}Warped.nii.gz", prefix)));
                touch(&PathBuf::from(format!("{}0GenericAffine.mat", prefix)));
                ok(command, "")
            }
            _ => ok(command, ""),
        };

        Ok(match stderr {
            Some(text) => ToolOutput { stderr: text, ..output },
            None => output,
        })
    }
}

/// Writes a fixed volume for every request
pub struct FakePredictor {
    requests: Mutex<Vec<PredictionRequest>>,
    volume: Vec<i64>,
    fail: Mutex<bool>,
}

impl FakePredictor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            volume: vec![1, 1, 0, 0],
            fail: Mutex::new(false),
        })
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn requests(&self) -> Vec<PredictionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Predictor for FakePredictor {
    async fn predict(&self, request: &PredictionRequest) -> Result<(), PredictError> {
        self.requests.lock().unwrap().push(request.clone());
        if *self.fail.lock().unwrap() {
            return Err(PredictError::Failed {
                command: "fake-predict".to_string(),
                exit_code: 1,
                stderr: "simulated failure".to_string(),
            });
        }
        write_volume(&request.output, &self.volume);
        Ok(())
    }
}
