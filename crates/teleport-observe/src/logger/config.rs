use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Directory for the daily-rotated log file.
    pub dir: PathBuf,
    /// Base file name; rotated files get a `.YYYY-MM-DD` suffix.
    pub file_prefix: String,
    /// Filter directive applied when debug mode is off.
    pub level: String,
    /// Mirror log lines to stdout in addition to the file.
    pub stdout: bool,
    pub with_targets: bool,
}

impl LoggerConfig {
    pub fn new(dir: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_prefix: file_prefix.into(),
            level: "info".to_string(),
            stdout: true,
            with_targets: true,
        }
    }
}
