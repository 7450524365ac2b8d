//! Per-run log artifact.
//!
//! Every task run owns a plain-text log in its report directory; the file is
//! listed among the reports of the `TaskDone` call, so the user who started
//! the task can read it from the Control Center. The operator does not watch
//! this file, which is why it is written directly instead of through the
//! tracing stack; lines are mirrored to tracing at debug level for live
//! monitoring.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, warn};

/// Severity tag of a run log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLogLevel {
    Info,
    Warning,
}

impl RunLogLevel {
    fn tag(&self) -> &'static str {
        match self {
            RunLogLevel::Info => "INFO",
            RunLogLevel::Warning => "WARNING",
        }
    }
}

/// Log sink for one task run and its external processes.
pub struct RunLog {
    file: Mutex<File>,
}

impl RunLog {
    /// Create the log file, truncating a leftover from an earlier run of the
    /// same task.
    pub fn create(path: &Path) -> io::Result<RunLog> {
        Ok(RunLog {
            file: Mutex::new(File::create(path)?),
        })
    }

    pub fn info(&self, message: &str) {
        self.log(RunLogLevel::Info, message);
    }

    pub fn warning(&self, message: &str) {
        self.log(RunLogLevel::Warning, message);
    }

    /// Append one timestamped line. Logging is best effort: a full disk must
    /// not take the run down, so write errors are reported to the operator
    /// log only.
    pub fn log(&self, level: RunLogLevel, message: &str) {
        debug!(target: "fabrun::run", "{} {}", level.tag(), message);
        let line = format!(
            "{} {} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            level.tag(),
            message
        );
        match self.file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!("Error writing run log: {e}");
                }
            }
            Err(_) => warn!("Run log lock poisoned; dropping line"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_tagged_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapper_log.txt");
        let log = RunLog::create(&path).unwrap();
        log.info("Starting wrapper");
        log.warning("something looks off");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("INFO Starting wrapper"));
        assert!(lines[1].ends_with("WARNING something looks off"));
    }
}
