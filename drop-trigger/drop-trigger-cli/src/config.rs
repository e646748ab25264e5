use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use drop_trigger_types::{CapturePreferences, DETECTION_FRAME_RATE, DetectorConfig};

use crate::synthetic::{LED_COOLDOWN, LED_DEBOUNCE, LED_ON_DURATION};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("TOML serialization error: {source}")]
    TomlSerError {
        #[from]
        source: toml::ser::Error,
    },
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),
}

type Result<T> = std::result::Result<T, ConfigError>;

fn default_output_dir() -> PathBuf {
    PathBuf::from("drop-captures")
}

/// Top-level configuration of the `drop-trigger` program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropTriggerConfig {
    /// Where recordings are written. Relative paths are relative to the
    /// configuration file.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub capture: CapturePreferences,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

impl Default for DropTriggerConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            capture: CapturePreferences::default(),
            detector: DetectorConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

/// The simulated camera preview and LED trigger box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Amplitude of the background noise, in pixel values.
    pub noise: u8,
    /// The simulated button is pressed this long after arming.
    pub flash_delay_secs: f64,
    pub led_on_secs: f64,
    pub debounce_secs: f64,
    pub cooldown_secs: f64,
    /// Seed of the noise generator. Random if not given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            frame_rate: DETECTION_FRAME_RATE,
            noise: 8,
            flash_delay_secs: 1.0,
            led_on_secs: LED_ON_DURATION.as_secs_f64(),
            debounce_secs: LED_DEBOUNCE.as_secs_f64(),
            cooldown_secs: LED_COOLDOWN.as_secs_f64(),
            seed: None,
        }
    }
}

impl DropTriggerConfig {
    fn fixup_relative_paths(&mut self, orig_path: &Path) -> Result<()> {
        let dirname = orig_path.parent().unwrap_or(Path::new("."));
        fixup_relative_path(&mut self.output_dir, dirname)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn fixup_relative_path(path: &mut PathBuf, dirname: &Path) -> Result<()> {
    let pathstr = path
        .to_str()
        .ok_or_else(|| ConfigError::NonUtf8Path(path.clone()))?;
    let expanded = shellexpand::full(pathstr)?;
    *path = PathBuf::from(expanded.as_ref());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

pub fn parse_config_file<P: AsRef<Path>>(fname: P) -> Result<DropTriggerConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let mut cfg: DropTriggerConfig = toml::from_str(&contents)?;
    cfg.fixup_relative_paths(fname.as_ref())?;
    Ok(cfg)
}

/// Expand `~` and environment variables in the default output directory.
pub fn expand_default_paths(cfg: &mut DropTriggerConfig) -> Result<()> {
    fixup_relative_path(&mut cfg.output_dir, Path::new("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let cfg = DropTriggerConfig::default();
        let buf = cfg.to_toml().unwrap();
        let parsed: DropTriggerConfig = toml::from_str(&buf).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop-trigger.toml");
        std::fs::write(
            &path,
            r#"
output_dir = "captures"

[capture]
drop_height_cm = 45.0

[detector]
threshold = 0.8
"#,
        )
        .unwrap();
        let cfg = parse_config_file(&path).unwrap();
        assert_eq!(cfg.output_dir, dir.path().join("captures"));
        assert_eq!(cfg.capture.drop_height_cm, 45.0);
        assert_eq!(cfg.capture.recording_duration_secs, 2.0);
        assert_eq!(cfg.detector.threshold, 0.8);
        assert_eq!(cfg.source, SourceConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[capture]\ndrop_height = 30.0\n").unwrap();
        assert!(matches!(
            parse_config_file(&path),
            Err(ConfigError::TomlDeError { .. })
        ));
    }

    #[test]
    fn absolute_output_dir_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("elsewhere");
        let path = dir.path().join("abs.toml");
        std::fs::write(&path, format!("output_dir = {:?}\n", out.to_str().unwrap())).unwrap();
        let cfg = parse_config_file(&path).unwrap();
        assert_eq!(cfg.output_dir, out);
    }
}
