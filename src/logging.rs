use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the logging system
///
/// Logs never go to stdout: that stream carries protocol traffic.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "warn", "error")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    ///
    /// - `RUST_LOG`: level filter
    /// - `CODEX_PROXY_LOG_FILE`: write to this file instead of stderr
    /// - `CODEX_PROXY_LOG_UNIQUE=true`: add the pid to the file name
    /// - `CODEX_PROXY_LOG_JSON=true`: one JSON object per log line
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let unique = env::var("CODEX_PROXY_LOG_UNIQUE").unwrap_or_default() == "true";
        let file_path = env::var("CODEX_PROXY_LOG_FILE").ok().map(|path| {
            let path = PathBuf::from(path);
            if unique {
                with_pid_suffix(&path, std::process::id())
            } else {
                path
            }
        });

        let json_format = env::var("CODEX_PROXY_LOG_JSON").unwrap_or_default() == "true";

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// `proxy.log` -> `proxy.<pid>.log`, `proxy` -> `proxy.<pid>`
///
/// Several proxies started by the same client can then share one log directory.
fn with_pid_suffix(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };
    let file_name = match path.extension().and_then(|ext| ext.to_str()) {
        Some(extension) => format!("{}.{}.{}", stem.to_string_lossy(), pid, extension),
        None => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(file_name)
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            subscriber
                .with(fmt::layer().json().with_writer(file).with_ansi(false))
                .init();
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(file_layer).init();
        }
        (None, true) => {
            subscriber
                .with(fmt::layer().json().with_writer(io::stderr).with_ansi(false))
                .init();
        }
        // Stderr, human readable (default)
        (None, false) => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_line_number(true);

            subscriber.with(stderr_layer).init();
        }
    }

    Ok(())
}

/// Log one relayed message as a single structured line
#[macro_export]
macro_rules! log_proxy_message {
    ($level:expr, $direction:expr, $message:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            kind = $message.kind(),
            method = $message.method().unwrap_or("-"),
            id = %$message
                .id()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            "Relayed message"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_suffix() {
        assert_eq!(
            with_pid_suffix(Path::new("/tmp/proxy.log"), 42),
            PathBuf::from("/tmp/proxy.42.log")
        );
        assert_eq!(
            with_pid_suffix(Path::new("/tmp/proxy"), 42),
            PathBuf::from("/tmp/proxy.42")
        );
    }

    #[test]
    fn test_overrides_take_precedence() {
        let config = LogConfig::default()
            .with_overrides(Some("debug".to_string()), Some(PathBuf::from("x.log")));
        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("x.log")));

        let config = LogConfig::default().with_overrides(None, None);
        assert_eq!(config.level, "info");
        assert!(config.file_path.is_none());
    }
}
