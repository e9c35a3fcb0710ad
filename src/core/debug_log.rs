//! Size-bounded debug log.
//!
//! The engine's only writable on-disk state: a flat text log at
//! `results/debug.log`, opened, appended, and closed per write. When the
//! file grows past 5 MiB it is swapped to `debug.log.1`, replacing any
//! previous swap. Enabled with `CFSCAN_DEBUG=true`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::Local;
use fs2::FileExt;

use crate::core::types::parse_env_bool;

const LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;

pub struct DebugLog {
    enabled: bool,
    path: PathBuf,
}

impl DebugLog {
    pub fn new() -> Self {
        Self::with_path(PathBuf::from("results").join("debug.log"))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            enabled: parse_env_bool("CFSCAN_DEBUG"),
            path,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append one line, rotating first if the file is over budget.
    /// Logging failures are swallowed; the log must never take a scan down.
    pub fn write(&self, component: &str, message: &str) {
        if !self.enabled {
            return;
        }
        let _ = self.write_inner(component, message);
    }

    fn write_inner(&self, component: &str, message: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.rotate_if_needed()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(
            file,
            "{} [{}] {}",
            Local::now().format("%H:%M:%S"),
            component,
            message
        )
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size <= LOG_MAX_BYTES {
            return Ok(());
        }

        // Advisory lock so two processes scanning the same workspace don't
        // both rename at once.
        let lock_path = self.path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_ok() {
            let swap = self.path.with_extension("log.1");
            let _ = std::fs::remove_file(&swap);
            let _ = std::fs::rename(&self.path, &swap);
            let _ = std::fs::remove_file(&lock_path);
        }
        Ok(())
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: OnceLock<DebugLog> = OnceLock::new();

/// Process-wide logger handle.
pub fn debug_log() -> &'static DebugLog {
    GLOBAL.get_or_init(DebugLog::new)
}

/// Shorthand used by the scan and pipeline internals.
pub fn dbg_line(component: &str, message: &str) {
    debug_log().write(component, message);
}
