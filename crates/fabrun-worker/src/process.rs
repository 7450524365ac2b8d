//! Supervision of a single external wrapper process.
//!
//! Reads stdout and stderr of the child and logs the lines to the run log.
//! For every external process execution a new `ExternalProcess` should be
//! created; the life cycle is construction, `start`, then `abort` and/or
//! `wait_for`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fabrun_core::TaskRunError;

use crate::runlog::{RunLog, RunLogLevel};

pub struct ExternalProcess {
    arguments: Vec<String>,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    log: Arc<RunLog>,
    abort: CancellationToken,
    state: Mutex<ProcessState>,
}

#[derive(Default)]
struct ProcessState {
    running: bool,
    exit_rx: Option<oneshot::Receiver<io::Result<ExitStatus>>>,
    readers: Vec<JoinHandle<()>>,
}

impl ExternalProcess {
    /// Create a process monitor for the given command line. When a process
    /// wrapper is configured it is prepended to the command.
    pub fn new(
        working_dir: &Path,
        args: Vec<String>,
        env: Vec<(String, String)>,
        process_wrapper: Option<&str>,
        log: Arc<RunLog>,
    ) -> Self {
        let mut arguments = Vec::with_capacity(args.len() + 1);
        if let Some(wrapper) = process_wrapper {
            arguments.push(wrapper.to_owned());
        }
        arguments.extend(args);
        Self {
            arguments,
            working_dir: working_dir.to_owned(),
            env,
            log,
            abort: CancellationToken::new(),
            state: Mutex::new(ProcessState::default()),
        }
    }

    /// Start the external process and the logging of its output.
    pub fn start(&self) -> io::Result<()> {
        self.log
            .info(&format!("Starting wrapper: {:?}", self.arguments));

        let mut command = Command::new(&self.arguments[0]);
        command
            .args(&self.arguments[1..])
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in &self.env {
            command.env(name, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.log.warning(&format!("Wrapper execution failed: {e}"));
                return Err(e);
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("wrapper stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("wrapper stderr not captured"))?;
        let readers = vec![
            tokio::spawn(forward(stdout, RunLogLevel::Info, self.log.clone())),
            tokio::spawn(forward(stderr, RunLogLevel::Warning, self.log.clone())),
        ];

        // The waiter owns the child: it reaps it on normal exit, and kills
        // it first when the abort token fires.
        let (exit_tx, exit_rx) = oneshot::channel();
        let token = self.abort.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let _ = exit_tx.send(status);
                }
                _ = token.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        log.warning(&format!("Failed to kill wrapper: {e}"));
                    }
                    match child.try_wait() {
                        Ok(Some(status)) => log.info(&format!(
                            "The wrapper has been aborted, the exit code is: {:?}",
                            status.code()
                        )),
                        _ => log.warning("The wrapper is still running"),
                    }
                    let _ = exit_tx.send(child.wait().await);
                }
            }
        });

        let mut state = lock_state(&self.state);
        state.running = true;
        state.exit_rx = Some(exit_rx);
        state.readers = readers;
        Ok(())
    }

    /// Abort the external process. Best effort: the exit code is recorded if
    /// the child is already reaped; a subsequent `wait_for` remains valid.
    pub fn abort(&self) {
        if !lock_state(&self.state).running {
            self.log.warning("Wrapper not running");
            return;
        }
        self.log.info("Aborting wrapper");
        self.abort.cancel();
    }

    /// Wait for the external process to finish, then join both output
    /// readers. Returns the exit code (-1 when killed by a signal).
    pub async fn wait_for(&self) -> Result<i32, TaskRunError> {
        let (exit_rx, readers) = {
            let mut state = lock_state(&self.state);
            (state.exit_rx.take(), std::mem::take(&mut state.readers))
        };
        let exit_rx = exit_rx.ok_or_else(|| TaskRunError::new("Wrapper not running"))?;

        let status = exit_rx
            .await
            .map_err(|_| TaskRunError::new("Wrapper supervision ended unexpectedly"))?
            .map_err(|e| TaskRunError::with_source("Error waiting for wrapper to finish", e))?;

        // Drain the output readers to EOF before reporting completion.
        for reader in readers {
            let _ = reader.await;
        }
        lock_state(&self.state).running = false;

        let exit_value = status.code().unwrap_or(-1);
        self.log
            .info(&format!("Finished wrapper, exit value: {exit_value}"));
        Ok(exit_value)
    }
}

fn lock_state(state: &Mutex<ProcessState>) -> std::sync::MutexGuard<'_, ProcessState> {
    // The state lock is only held for field updates; a poisoned lock means a
    // panic mid-update, which we treat as recovered state.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Forward log lines from a child stream to the run log until EOF.
async fn forward<R>(stream: R, level: RunLogLevel, log: Arc<RunLog>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log.log(level, &line),
            Ok(None) => return,
            Err(e) => {
                log.warning(&format!("Logging of wrapper output aborted: {e}"));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log(dir: &Path) -> (Arc<RunLog>, PathBuf) {
        let path = dir.join("wrapper_log.txt");
        (Arc::new(RunLog::create(&path).unwrap()), path)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_forwarded_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let (log, log_path) = test_log(dir.path());
        let process = ExternalProcess::new(
            dir.path(),
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "echo out line; echo err line >&2; exit 3".to_owned(),
            ],
            Vec::new(),
            None,
            log,
        );
        process.start().unwrap();
        let exit = process.wait_for().await.unwrap();
        assert_eq!(exit, 3);

        let text = std::fs::read_to_string(&log_path).unwrap();
        assert!(text.contains("INFO out line"));
        assert!(text.contains("WARNING err line"));
        assert!(text.contains("Finished wrapper, exit value: 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abort_terminates_child() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _) = test_log(dir.path());
        let process = ExternalProcess::new(
            dir.path(),
            vec!["sh".to_owned(), "-c".to_owned(), "sleep 30".to_owned()],
            Vec::new(),
            None,
            log,
        );
        process.start().unwrap();
        process.abort();
        // Killed by SIGKILL, so no exit code.
        let exit = process.wait_for().await.unwrap();
        assert_eq!(exit, -1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_wrapper_prepended() {
        let dir = tempfile::tempdir().unwrap();
        let (log, log_path) = test_log(dir.path());
        // "env" as process wrapper simply runs the rest of the command line.
        let process = ExternalProcess::new(
            dir.path(),
            vec!["echo".to_owned(), "hello".to_owned()],
            Vec::new(),
            Some("env"),
            log,
        );
        process.start().unwrap();
        assert_eq!(process.wait_for().await.unwrap(), 0);
        let text = std::fs::read_to_string(&log_path).unwrap();
        assert!(text.contains("INFO hello"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _) = test_log(dir.path());
        let process = ExternalProcess::new(
            dir.path(),
            vec!["definitely-not-a-real-binary".to_owned()],
            Vec::new(),
            None,
            log,
        );
        assert!(process.start().is_err());
    }
}
