//! Pipeline configuration
//!
//! One immutable [`PipelineConfig`] is built at process start and handed to
//! every component that needs it. Nothing reads configuration lazily.
//!
//! # Sources (highest priority first)
//! 1. `--config <path>` command-line argument
//! 2. `NEUROPREP_CONFIG` environment variable
//! 3. `~/.config/neuroprep/config.toml`
//! 4. Compiled defaults
//!
//! An explicitly named file that cannot be read or parsed is an error. A
//! missing user config file falls through to the compiled defaults.

use crate::sequence::SequencePatterns;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "NEUROPREP_CONFIG";

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Ordered sequence tag → substring patterns
    #[serde(default)]
    pub sequences: SequencePatterns,

    #[serde(default)]
    pub conversion: ConversionConfig,

    /// External tool invocation templates
    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub registration: RegistrationConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub templates: TemplatesConfig,

    #[serde(default)]
    pub heatmap: HeatmapConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// DICOM → NIfTI conversion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Entries resolved as T1 that contain one of these substrings are not
    /// converted
    #[serde(default = "default_t1_exclusions")]
    pub t1_exclusions: Vec<String>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            t1_exclusions: default_t1_exclusions(),
        }
    }
}

fn default_t1_exclusions() -> Vec<String> {
    vec!["FLE".to_string()]
}

/// A program plus argument list containing `{token}` placeholders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolTemplate {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Substitute every `{name}` with its value
    ///
    /// Unknown placeholders are left as written.
    pub fn render(&self, tokens: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| substitute(arg, tokens))
            .collect()
    }
}

/// Replace `{name}` occurrences in `text`
pub fn substitute(text: &str, tokens: &[(&str, &str)]) -> String {
    let mut value = text.to_string();
    for (name, replacement) in tokens {
        value = value.replace(&format!("{{{}}}", name), replacement);
    }
    value
}

/// External tool templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// DICOM folder → NIfTI; tokens `{name}`, `{output_dir}`, `{input_dir}`
    pub converter: ToolTemplate,
    /// Prints the image orientation of one DICOM file; token `{dicom_file}`
    pub orientation_probe: ToolTemplate,
    /// Optional in-place reorientation after conversion; token `{input}`
    pub reorient: Option<ToolTemplate>,
    /// Resample `{input}` onto the grid of `{reference}` into `{output}`
    /// with `{interpolation}`
    pub conform: ToolTemplate,
    /// Prints the number of volumes of `{input}`
    pub volume_count: ToolTemplate,
    /// First volume of `{input}` into `{output}`
    pub first_volume: ToolTemplate,
    /// Skull strip `{input}` into `{output}`
    pub skull_strip: ToolTemplate,
    /// Voxelwise arithmetic program (`-mul`, `-add`, `-thr`)
    pub fslmaths: String,
    /// Apply `{transform}` to `{input}` on the grid of `{reference}`
    pub apply_transforms: ToolTemplate,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            converter: ToolTemplate::new(
                "dcm2niix",
                &["-z", "y", "-f", "{name}", "-o", "{output_dir}", "{input_dir}"],
            ),
            orientation_probe: ToolTemplate::new("dcmdump", &["+P", "0020,0037", "{dicom_file}"]),
            reorient: None,
            conform: ToolTemplate::new(
                "flirt",
                &[
                    "-in", "{input}", "-ref", "{reference}", "-out", "{output}",
                    "-applyxfm", "-usesqform", "-interp", "{interpolation}",
                ],
            ),
            volume_count: ToolTemplate::new("fslval", &["{input}", "dim4"]),
            first_volume: ToolTemplate::new("fslroi", &["{input}", "{output}", "0", "1"]),
            skull_strip: ToolTemplate::new("bet", &["{input}", "{output}", "-m", "-f", "0.3"]),
            fslmaths: "fslmaths".to_string(),
            apply_transforms: ToolTemplate::new(
                "antsApplyTransforms",
                &[
                    "--dimensionality", "3", "--float", "0",
                    "--input", "{input}", "--reference-image", "{reference}",
                    "--output", "{output}", "--interpolation", "{interpolation}",
                    "--transform", "[{transform},0]",
                ],
            ),
        }
    }
}

/// One `--{option} {value}` pair of the registration command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationOption {
    pub option: String,
    pub value: String,
}

/// Registration command settings
///
/// Values may use `{prefix}`, `{target_file}` and `{moving_file}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub program: String,
    pub options: Vec<RegistrationOption>,
}

impl RegistrationConfig {
    /// Render the option list as `--{option} {value}` argument pairs
    pub fn render(&self, tokens: &[(&str, &str)]) -> Vec<String> {
        let mut args = Vec::with_capacity(self.options.len() * 2);
        for opt in &self.options {
            args.push(format!("--{}", opt.option.trim()));
            args.push(substitute(&opt.value, tokens).trim().to_string());
        }
        args
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        let opt = |option: &str, value: &str| RegistrationOption {
            option: option.to_string(),
            value: value.to_string(),
        };

        Self {
            program: "antsRegistration".to_string(),
            options: vec![
                opt("dimensionality", "3"),
                opt("float", "0"),
                opt("output", "[{prefix},{prefix}Warped.nii.gz]"),
                opt("interpolation", "Linear"),
                opt("winsorize-image-intensities", "[0.005,0.995]"),
                opt("use-histogram-matching", "0"),
                opt("initial-moving-transform", "[{target_file},{moving_file},1]"),
                opt("transform", "Rigid[0.1]"),
                opt("metric", "MI[{target_file},{moving_file},1,32,Regular,0.25]"),
                opt("convergence", "[1000x500x250x100,1e-6,10]"),
                opt("shrink-factors", "8x4x2x1"),
                opt("smoothing-sigmas", "3x2x1x0vox"),
            ],
        }
    }
}

/// Model-backed prediction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Prediction command; tokens `{model}`, `{output}`; input images are
    /// appended after the rendered arguments
    pub command: ToolTemplate,
    /// Directory model paths are relative to
    pub dir: PathBuf,
    /// Brain mask model; token `{sequence}` (lower-case tag)
    pub brain_mask_model: String,
    /// Stroke model; token `{input}` (`dwi` or `b1000`)
    pub stroke_model: String,
}

impl ModelsConfig {
    pub fn brain_mask_model_path(&self, sequence: &str) -> PathBuf {
        self.dir
            .join(substitute(&self.brain_mask_model, &[("sequence", &sequence.to_lowercase())]))
    }

    pub fn stroke_model_path(&self, on_dwi: bool) -> PathBuf {
        let input = if on_dwi { "dwi" } else { "b1000" };
        self.dir
            .join(substitute(&self.stroke_model, &[("input", input)]))
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            command: ToolTemplate::new(
                "neuroprep-predict",
                &["--model", "{model}", "--output", "{output}"],
            ),
            dir: PathBuf::from("models"),
            brain_mask_model: "3d/{sequence}_brain_extraction.keras".to_string(),
            stroke_model: "2d/stroke_segmentation_{input}.keras".to_string(),
        }
    }
}

/// Population template brains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatesConfig {
    pub t1: PathBuf,
    pub t2: PathBuf,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            t1: PathBuf::from("templates/template_t1.nii.gz"),
            t2: PathBuf::from("templates/template_t2.nii.gz"),
        }
    }
}

/// Lesion heatmap aggregation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    /// Fraction of contributing subjects a voxel needs to survive thresholding
    pub threshold_fraction: f64,
    /// Give up acquiring the ledger lock after this long
    pub lock_timeout_secs: u64,
    /// A lock file older than this is considered orphaned and broken
    pub lock_stale_secs: u64,
    /// Delay between lock acquisition attempts
    pub poll_interval_ms: u64,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            threshold_fraction: 0.1,
            lock_timeout_secs: 600,
            lock_stale_secs: 3600,
            poll_interval_ms: 250,
        }
    }
}

/// Where the active configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    CommandLine(PathBuf),
    Environment(PathBuf),
    UserFile(PathBuf),
    Defaults,
}

impl PipelineConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Resolve and load the configuration following the priority order in
    /// the module docs
    pub fn load(cli_path: Option<&Path>) -> Result<(Self, ConfigSource)> {
        // Priority 1: Command-line argument
        if let Some(path) = cli_path {
            let config = Self::from_file(path)?;
            return Ok((config, ConfigSource::CommandLine(path.to_path_buf())));
        }

        // Priority 2: Environment variable
        if let Ok(value) = std::env::var(CONFIG_ENV_VAR) {
            if !value.trim().is_empty() {
                let path = PathBuf::from(value);
                let config = Self::from_file(&path)?;
                return Ok((config, ConfigSource::Environment(path)));
            }
        }

        // Priority 3: User config file
        if let Some(path) = user_config_path() {
            if path.exists() {
                match Self::from_file(&path) {
                    Ok(config) => return Ok((config, ConfigSource::UserFile(path))),
                    Err(e) => {
                        warn!("Ignoring user config {}: {}", path.display(), e);
                    }
                }
            }
        }

        // Priority 4: Compiled defaults
        info!("No configuration file found, using compiled defaults");
        Ok((Self::default(), ConfigSource::Defaults))
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.sequences.is_empty() {
            return Err(Error::Config("sequence pattern list is empty".to_string()));
        }

        if let Some(rule) = self.sequences.rules().iter().find(|r| r.patterns.is_empty()) {
            return Err(Error::Config(format!("sequence {} has no patterns", rule.tag)));
        }

        let fraction = self.heatmap.threshold_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(Error::Config(format!(
                "heatmap.threshold_fraction must be in (0, 1], got {}",
                fraction
            )));
        }

        if self.heatmap.poll_interval_ms == 0 {
            return Err(Error::Config("heatmap.poll_interval_ms must be positive".to_string()));
        }

        Ok(())
    }
}

/// `~/.config/neuroprep/config.toml` on the current platform
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("neuroprep").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_replaces_all_tokens() {
        assert_eq!(
            substitute("[{prefix},{prefix}Warped.nii.gz]", &[("prefix", "/o/S_T2_to_T1_")]),
            "[/o/S_T2_to_T1_,/o/S_T2_to_T1_Warped.nii.gz]"
        );
        assert_eq!(substitute("{unknown}", &[("prefix", "x")]), "{unknown}");
    }

    #[test]
    fn test_registration_render_pairs_options() {
        let config = RegistrationConfig {
            program: "antsRegistration".to_string(),
            options: vec![
                RegistrationOption { option: " dimensionality ".into(), value: "3".into() },
                RegistrationOption { option: "metric".into(), value: "MI[{target_file},{moving_file}]".into() },
            ],
        };
        let args = config.render(&[("target_file", "t.nii.gz"), ("moving_file", "m.nii.gz")]);
        assert_eq!(args, ["--dimensionality", "3", "--metric", "MI[t.nii.gz,m.nii.gz]"]);
    }

    #[test]
    fn test_model_paths() {
        let models = ModelsConfig::default();
        assert_eq!(
            models.brain_mask_model_path("T1"),
            PathBuf::from("models/3d/t1_brain_extraction.keras")
        );
        assert_eq!(
            models.stroke_model_path(true),
            PathBuf::from("models/2d/stroke_segmentation_dwi.keras")
        );
    }

    #[test]
    fn test_defaults_validate() {
        assert!(PipelineConfig::default().validate().is_ok());
    }
}
