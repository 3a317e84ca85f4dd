use presence_core::PipelineConfig;
use std::path::PathBuf;

/// Largest accepted upload, in bytes.
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10_000_000;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Directory containing the trainer artifacts (`gallery.json`, `labels.json`).
    pub data_dir: PathBuf,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
    /// Uploads larger than this are rejected before decoding.
    pub max_upload_bytes: usize,
    /// Recognition thresholds and vote size.
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key → value source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("PRESENCE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(presence_core::default_model_dir);

        let data_dir = var("PRESENCE_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("presence")
        });

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            match_threshold: parse_positive_or(&var, "PRESENCE_MATCH_THRESHOLD", defaults.match_threshold),
            inspect_detection_threshold: parse_or(
                &var,
                "PRESENCE_INSPECT_DETECTION_THRESHOLD",
                defaults.inspect_detection_threshold,
            ),
            commit_detection_threshold: parse_or(
                &var,
                "PRESENCE_COMMIT_DETECTION_THRESHOLD",
                defaults.commit_detection_threshold,
            ),
            // Unset (or 0) keeps the k the gallery was trained with.
            vote_neighbors: var("PRESENCE_VOTE_NEIGHBORS")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|&k| k > 0)
                .or(defaults.vote_neighbors),
        };

        Self {
            model_dir,
            data_dir,
            session_bus: var("PRESENCE_SESSION_BUS").map(|v| v == "1").unwrap_or(false),
            max_upload_bytes: parse_or(&var, "PRESENCE_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            pipeline,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the FaceNet embedding model.
    pub fn facenet_model_path(&self) -> String {
        self.model_dir
            .join("facenet512.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn gallery_path(&self) -> PathBuf {
        self.data_dir.join("gallery.json")
    }

    pub fn labels_path(&self) -> PathBuf {
        self.data_dir.join("labels.json")
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Like [`parse_or`], but NaN, infinities and values `<= 0` fall back too.
fn parse_positive_or(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    match var(key).map(|v| v.parse::<f32>()) {
        Some(Ok(value)) if value.is_finite() && value > 0.0 => value,
        Some(_) => {
            tracing::warn!(key, default, "ignoring invalid value");
            default
        }
        None => default,
    }
}
