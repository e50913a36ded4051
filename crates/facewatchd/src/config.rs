use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory of still images replayed as the stream. Unset runs the
    /// built-in synthetic source.
    pub frames_dir: Option<PathBuf>,
    /// Camera label carried on notifications.
    pub camera: String,
    /// Owner all records are scoped to.
    pub owner_id: i64,
    /// Process every Nth source frame.
    pub frame_skip: u64,
    /// Frames buffered between reader and worker.
    pub buffer_capacity: usize,
    /// Milliseconds between consolidation passes.
    pub consolidate_interval_ms: u64,
    /// Attempts before a stream that will not open is terminal.
    pub open_attempts: u32,
    /// Seconds between open attempts.
    pub open_retry_secs: u64,
}

impl Config {
    /// Load configuration from `FACEWATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facewatch");

        let db_path = std::env::var("FACEWATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("facewatch.db"));

        Self {
            db_path,
            frames_dir: std::env::var("FACEWATCH_FRAMES_DIR").map(PathBuf::from).ok(),
            camera: std::env::var("FACEWATCH_CAMERA").unwrap_or_else(|_| "camera-1".to_string()),
            owner_id: env_i64("FACEWATCH_OWNER_ID", 1),
            frame_skip: env_u64("FACEWATCH_FRAME_SKIP", facewatch_pipeline::runtime::FRAME_SKIP),
            buffer_capacity: env_usize(
                "FACEWATCH_BUFFER_CAPACITY",
                facewatch_pipeline::runtime::BUFFER_CAPACITY,
            ),
            consolidate_interval_ms: env_u64("FACEWATCH_CONSOLIDATE_INTERVAL_MS", 1_000),
            open_attempts: env_u32(
                "FACEWATCH_OPEN_ATTEMPTS",
                facewatch_pipeline::runtime::MAX_OPEN_ATTEMPTS,
            ),
            open_retry_secs: env_u64("FACEWATCH_OPEN_RETRY_SECS", 2),
        }
    }

    pub fn consolidate_interval(&self) -> Duration {
        Duration::from_millis(self.consolidate_interval_ms.max(1))
    }

    pub fn open_retry_delay(&self) -> Duration {
        Duration::from_secs(self.open_retry_secs)
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
