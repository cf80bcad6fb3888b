use chrono::Local;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::progress::log_progress;

/// Severity of a logged line. Wranglers may raise (never lower) the
/// severity of cab output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
    Fatal = 5,
}

impl Severity {
    pub fn parse(name: &str) -> Option<Severity> {
        match name.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Severity::Debug),
            "INFO" => Some(Severity::Info),
            "WARNING" => Some(Severity::Warning),
            "ERROR" => Some(Severity::Error),
            "CRITICAL" => Some(Severity::Critical),
            "FATAL" => Some(Severity::Fatal),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
            Severity::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

struct RunLogInner {
    file: Option<Mutex<File>>,
    logdir: Option<PathBuf>,
    file_level: Severity,
    console_level: Severity,
}

/// Per-run logger. Writes severity-tagged lines to a per-recipe (or
/// per-step) log file; warnings and worse are echoed to the progress sink.
/// Child loggers share the file sink under a derived name.
#[derive(Clone)]
pub struct RunLog {
    name: String,
    inner: Arc<RunLogInner>,
}

fn console_level_from_env() -> Severity {
    std::env::var("SCABHA_LOG_LEVEL")
        .ok()
        .and_then(|level| Severity::parse(&level))
        .unwrap_or(Severity::Warning)
}

impl RunLog {
    /// Console-only logger.
    pub fn new(name: impl Into<String>) -> Self {
        RunLog {
            name: name.into(),
            inner: Arc::new(RunLogInner {
                file: None,
                logdir: None,
                file_level: Severity::Info,
                console_level: console_level_from_env(),
            }),
        }
    }

    /// Logger backed by a file in the given directory. The filename pattern
    /// may reference {fqname}. The directory is created if needed.
    pub fn with_file(
        name: impl Into<String>,
        dir: &Path,
        pattern: &str,
        level: Severity,
    ) -> std::io::Result<Self> {
        let name: String = name.into();
        std::fs::create_dir_all(dir)?;
        let basename = pattern
            .replace("{info.fqname}", &name)
            .replace("{fqname}", &name)
            .replace('/', ".");
        let path = dir.join(basename);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(RunLog {
            name,
            inner: Arc::new(RunLogInner {
                file: Some(Mutex::new(file)),
                logdir: Some(dir.to_path_buf()),
                file_level: level,
                console_level: console_level_from_env(),
            }),
        })
    }

    /// Child logger sharing this logger's sinks under a derived name.
    pub fn child(&self, suffix: &str) -> RunLog {
        RunLog {
            name: format!("{}.{suffix}", self.name),
            inner: self.inner.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn logdir(&self) -> Option<&Path> {
        self.inner.logdir.as_deref()
    }

    pub fn log(&self, severity: Severity, message: impl AsRef<str>) {
        let message = message.as_ref();
        if severity >= self.inner.file_level {
            if let Some(file) = &self.inner.file {
                let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
                let line = format!("{stamp} {severity} {}: {message}\n", self.name);
                if let Ok(mut f) = file.lock() {
                    let _ = f.write_all(line.as_bytes());
                }
            }
        }
        if severity >= self.inner.console_level {
            log_progress(format!("phase=log severity={severity} task={} msg={message}", self.name));
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(Severity::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(Severity::Info, message);
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.log(Severity::Warning, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(Severity::Error, message);
    }

    /// Logs an error once: errors carry a logged flag so the same failure is
    /// not reported at every level of the recipe tree.
    pub fn log_exception(&self, exc: &crate::errors::StimelaError, severity: Severity) {
        if exc.logged() {
            return;
        }
        self.log(severity, exc.to_string());
        for line in exc.cause_lines() {
            self.log(severity, format!("  {line}"));
        }
        exc.mark_logged();
    }
}

impl fmt::Debug for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLog").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_and_parse() {
        assert!(Severity::Error > Severity::Warning);
        assert_eq!(Severity::parse("warning"), Some(Severity::Warning));
        assert_eq!(Severity::parse("FATAL"), Some(Severity::Fatal));
        assert_eq!(Severity::parse("nope"), None);
    }

    #[test]
    fn file_logging_and_children() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::with_file("recipe", dir.path(), "log-{fqname}.txt", Severity::Info).unwrap();
        log.info("starting up");
        log.debug("not written at info level");
        let child = log.child("step1");
        child.warning("watch out");

        let content = std::fs::read_to_string(dir.path().join("log-recipe.txt")).unwrap();
        assert!(content.contains("INFO recipe: starting up"));
        assert!(!content.contains("not written"));
        assert!(content.contains("WARNING recipe.step1: watch out"));
    }

    #[test]
    fn exceptions_logged_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::with_file("r", dir.path(), "{fqname}.log", Severity::Info).unwrap();
        let err = crate::errors::backend_error("no backend");
        log.log_exception(&err, Severity::Error);
        log.log_exception(&err, Severity::Error);
        let content = std::fs::read_to_string(dir.path().join("r.log")).unwrap();
        assert_eq!(content.matches("no backend").count(), 1);
    }
}
