use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::{Error, Result};

/// Severity levels for the text log, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    pub fn parse(name: &str) -> Level {
        match name {
            "DEBUG" => Level::Debug,
            "WARNING" => Level::Warning,
            "ERROR" => Level::Error,
            "CRITICAL" => Level::Critical,
            _ => Level::Info,
        }
    }
}

/// Append-only, timestamped text log shared across threads.
///
/// Lines look like `[component] 2026-01-02T03:04:05Z INFO message`.
#[derive(Clone)]
pub struct LogSink {
    component: String,
    threshold: Level,
    file: Arc<Mutex<File>>,
    path: PathBuf,
}

impl LogSink {
    pub fn open(component: &str, path: &Path, threshold: Level) -> Result<LogSink> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| Error::PreflightFailed {
                message: format!("Unable to open log {}: {err}", path.display()),
            })?;
        Ok(LogSink {
            component: component.to_string(),
            threshold,
            file: Arc::new(Mutex::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn debug(&self, message: &str) {
        self.line(Level::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.line(Level::Info, message);
    }

    pub fn warning(&self, message: &str) {
        self.line(Level::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.line(Level::Error, message);
    }

    /// Write one log line. Logging failures are swallowed: losing a line is
    /// preferable to failing the operation being logged.
    pub fn line(&self, level: Level, message: &str) {
        if level < self.threshold {
            return;
        }
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        let line = format!(
            "[{}] {} {} {}\n",
            self.component,
            utc_timestamp(),
            level.as_str(),
            message
        );
        let _ = file.write_all(line.as_bytes());
        let _ = file.flush();
    }
}

/// Newline-delimited JSON log. Every record gains a `timestamp` field.
#[derive(Clone)]
pub struct JsonLog {
    file: Arc<Mutex<File>>,
}

impl JsonLog {
    pub fn open(path: &Path) -> Result<JsonLog> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| Error::PreflightFailed {
                message: format!("Unable to open JSON log {}: {err}", path.display()),
            })?;
        Ok(JsonLog {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Append one JSON object per line. Non-object values are wrapped as
    /// `{"msg": ...}`.
    pub fn record(&self, value: Value) {
        let mut object = match value {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("msg".to_string(), other);
                map
            }
        };
        object.insert("timestamp".to_string(), Value::String(utc_timestamp()));

        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if serde_json::to_writer(&mut *file, &Value::Object(object)).is_ok() {
            let _ = file.write_all(b"\n");
            let _ = file.flush();
        }
    }

    /// Split a captured output buffer into lines and record each: JSON lines
    /// verbatim, everything else as a `msg` wrapper.
    pub fn record_output(&self, buffer: &str) {
        for line in buffer.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value @ Value::Object(_)) => self.record(value),
                _ => self.record(Value::String(trimmed.to_string())),
            }
        }
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn utc_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    match time::OffsetDateTime::from_unix_timestamp(now.as_secs() as i64) {
        Ok(stamp) => stamp
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "-".to_string()),
        Err(_) => "-".to_string(),
    }
}

/// Seconds since the Unix epoch.
pub fn unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
