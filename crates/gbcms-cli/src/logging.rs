//! Log bootstrap for the `gbcms` binary.
//!
//! Events go to `<dir>/gbcms-<host>.log`; `GBCMS_LOG_STDOUT` mirrors them to
//! stdout. `RUST_LOG` wins over `GBCMS_LOG_LEVEL`.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_DIR: &str = ".gbcms/logs";
const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub level: String,
    pub mirror_stdout: bool,
}

impl LogSettings {
    /// `--log-dir` first, then `GBCMS_LOG_DIR`, then `.gbcms/logs`.
    pub fn resolve(dir_flag: &str) -> Self {
        Self::from_lookup(dir_flag, |key| env::var(key).ok())
    }

    fn from_lookup(dir_flag: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_blank = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let dir = Some(dir_flag.trim())
            .filter(|flag| !flag.is_empty())
            .map(str::to_string)
            .or_else(|| non_blank("GBCMS_LOG_DIR"))
            .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string());
        Self {
            dir: PathBuf::from(dir),
            level: non_blank("GBCMS_LOG_LEVEL").unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
            mirror_stdout: non_blank("GBCMS_LOG_STDOUT").is_some_and(|value| is_truthy(&value)),
        }
    }

    pub fn file_path(&self, host: &str) -> PathBuf {
        let host: String = host
            .chars()
            .map(|ch| match ch {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("gbcms-{host}.log"))
    }

    /// Installs the global subscriber. A log file that cannot be opened is
    /// reported on stderr and logging carries on without it.
    pub fn install(&self, host: &str) {
        let path = self.file_path(host);
        let file = match open_append(&path) {
            Ok(file) => Some(Arc::new(file)),
            Err(err) => {
                eprintln!("log_file_error: {}: {err}", path.display());
                None
            }
        };
        let writer = match (file, self.mirror_stdout) {
            (Some(file), true) => BoxMakeWriter::new(file.and(io::stdout)),
            (Some(file), false) => BoxMakeWriter::new(file),
            (None, true) => BoxMakeWriter::new(io::stdout),
            (None, false) => BoxMakeWriter::new(io::sink),
        };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(writer)
            .try_init();
        if installed.is_err() {
            warn!("log_subscriber_already_set");
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
