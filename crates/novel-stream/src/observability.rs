//! Process-wide `tracing` setup for the library and the `novel` binary.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

/// Where log records go.
#[derive(Debug, PartialEq, Eq)]
enum LogSink {
    /// Compact lines on stderr. Stdout stays free for generated text.
    Stderr,
    /// JSON lines appended to `dir/file`.
    JsonFile { dir: PathBuf, file: String },
}

#[derive(Debug, PartialEq, Eq)]
struct LogSettings {
    enabled: bool,
    directives: Option<String>,
    sink: LogSink,
}

impl LogSettings {
    /// Reads `NOVEL_OBSERVABILITY_ENABLED`, `NOVEL_LOG_LEVEL`, `RUST_LOG` and
    /// `NOVEL_JSON_LOG_PATH` through `var`.
    fn resolve(var: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = var("NOVEL_OBSERVABILITY_ENABLED").is_none_or(|raw| {
            !matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off" | "disabled"
            )
        });
        let directives = var("NOVEL_LOG_LEVEL")
            .filter(|d| EnvFilter::try_new(d).is_ok())
            .or_else(|| var("RUST_LOG"));
        let sink = var("NOVEL_JSON_LOG_PATH")
            .and_then(|raw| json_sink(Path::new(&raw)))
            .unwrap_or(LogSink::Stderr);
        Self {
            enabled,
            directives,
            sink,
        }
    }

    fn filter(&self, default_level: &str) -> EnvFilter {
        self.directives
            .as_deref()
            .and_then(|d| EnvFilter::try_new(d).ok())
            .unwrap_or_else(|| EnvFilter::new(default_level))
    }
}

/// A path without a file name (`logs/`, `..`) keeps logging on stderr.
fn json_sink(path: &Path) -> Option<LogSink> {
    let file = path.file_name()?.to_str()?.to_owned();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Some(LogSink::JsonFile { dir, file })
}

/// Initialize logging once per process at `info` unless overridden.
///
/// Environment variables:
/// - `NOVEL_OBSERVABILITY_ENABLED`: `0`, `false`, `no`, `off` or `disabled`
///   turns logging off.
/// - `NOVEL_LOG_LEVEL`: filter directives, taking precedence over `RUST_LOG`.
/// - `NOVEL_JSON_LOG_PATH`: write JSONL to this file instead of stderr.
pub fn init_observability() {
    init_observability_with_default("info");
}

/// Same as [`init_observability`], with the level used when no override is set.
pub fn init_observability_with_default(default_level: &str) {
    INIT.get_or_init(|| {
        let settings = LogSettings::resolve(|key| std::env::var(key).ok());
        if !settings.enabled {
            return;
        }
        let filter = settings.filter(default_level);
        let (json, console) = match settings.sink {
            LogSink::JsonFile { dir, file } => {
                let _ = std::fs::create_dir_all(&dir);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(false)
                    .with_writer(tracing_appender::rolling::never(dir, file));
                (Some(layer), None)
            }
            LogSink::Stderr => {
                let layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                (None, Some(layer))
            }
        };
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .with(console)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(pairs: &[(&str, &str)]) -> LogSettings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        LogSettings::resolve(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_to_enabled_stderr_logging() {
        let settings = resolve(&[]);
        assert!(settings.enabled);
        assert_eq!(settings.directives, None);
        assert_eq!(settings.sink, LogSink::Stderr);
    }

    #[test]
    fn disable_flag_accepts_common_spellings() {
        assert!(!resolve(&[("NOVEL_OBSERVABILITY_ENABLED", " Off ")]).enabled);
        assert!(!resolve(&[("NOVEL_OBSERVABILITY_ENABLED", "0")]).enabled);
        assert!(resolve(&[("NOVEL_OBSERVABILITY_ENABLED", "yes")]).enabled);
    }

    #[test]
    fn novel_level_wins_over_rust_log_unless_invalid() {
        let both = resolve(&[("NOVEL_LOG_LEVEL", "debug"), ("RUST_LOG", "trace")]);
        assert_eq!(both.directives.as_deref(), Some("debug"));
        let invalid = resolve(&[("NOVEL_LOG_LEVEL", "novel=loud"), ("RUST_LOG", "trace")]);
        assert_eq!(invalid.directives.as_deref(), Some("trace"));
    }

    #[test]
    fn json_path_splits_into_directory_and_file() {
        let nested = resolve(&[("NOVEL_JSON_LOG_PATH", "logs/novel.jsonl")]);
        assert_eq!(
            nested.sink,
            LogSink::JsonFile {
                dir: PathBuf::from("logs"),
                file: "novel.jsonl".to_owned()
            }
        );
        let bare = resolve(&[("NOVEL_JSON_LOG_PATH", "novel.jsonl")]);
        assert_eq!(
            bare.sink,
            LogSink::JsonFile {
                dir: PathBuf::from("."),
                file: "novel.jsonl".to_owned()
            }
        );
        assert_eq!(resolve(&[("NOVEL_JSON_LOG_PATH", "..")]).sink, LogSink::Stderr);
    }

    #[test]
    fn init_is_idempotent() {
        init_observability();
        init_observability_with_default("debug");
    }
}
