use facetrail_core::recognizer::DEFAULT_MATCH_THRESHOLD;
use facetrail_core::registry::ParsePolicyError;
use facetrail_core::AssociationPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid association policy: {0}")]
    Association(#[from] ParsePolicyError),
}

/// Optional TOML layer; every key falls back to the built-in default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    gallery_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    association: Option<String>,
    preview_path: Option<PathBuf>,
    font_path: Option<PathBuf>,
    window: Option<bool>,
}

/// Runtime configuration: defaults, then the TOML file, then `FACETRAIL_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Directory of known-face reference images.
    pub gallery_dir: PathBuf,
    /// Maximum embedding distance for a labelled match.
    pub match_threshold: f32,
    /// Detection-to-track association rule.
    pub association: AssociationPolicy,
    /// Annotated frames are written here each frame when set.
    pub preview_path: Option<PathBuf>,
    /// TTF font used for labels; boxes only when unset.
    pub font_path: Option<PathBuf>,
    /// Show the live preview window (quit with `q` or Esc).
    pub window: bool,
}

impl Config {
    /// Load from the process environment, reading `FACETRAIL_CONFIG` if set.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = match env("FACETRAIL_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let association = match env("FACETRAIL_ASSOCIATION").or(file.association) {
            Some(policy) => policy.parse::<AssociationPolicy>()?,
            None => AssociationPolicy::default(),
        };

        Ok(Self {
            camera_device: env("FACETRAIL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| facetrail_hw::DEFAULT_DEVICE.to_string()),
            model_dir: env("FACETRAIL_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(|| default_model_dir(&env)),
            gallery_dir: env("FACETRAIL_GALLERY_DIR")
                .map(PathBuf::from)
                .or(file.gallery_dir)
                .unwrap_or_else(|| PathBuf::from("known_faces")),
            match_threshold: env_f32(&env, "FACETRAIL_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            association,
            preview_path: env("FACETRAIL_PREVIEW_PATH").map(PathBuf::from).or(file.preview_path),
            font_path: env("FACETRAIL_FONT_PATH").map(PathBuf::from).or(file.font_path),
            window: env_bool(&env, "FACETRAIL_WINDOW").or(file.window).unwrap_or(true),
        })
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_model_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facetrail/models")
}

fn env_f32(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f32> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable number");
            None
        }
    }
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = env(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring unparsable flag");
            None
        }
    }
}
