//! Synchronizes between the sync loop and the task-run worker.
//!
//! The "at most one run in progress" rule lives here: a single slot guarded
//! by a lock, plus a notify that wakes the sync loop's delay early when the
//! run finishes. Both the sync request and the result report are queued
//! while the slot lock is held, so the Control Center can never observe a
//! run as finished and still in progress at the same time.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::error;

use fabrun_core::{ResultCode, TaskResult};

use crate::config::Config;
use crate::factory::RunFactory;
use crate::protocol::{xml_escape, TaskRunInfo};
use crate::server::{ReplyListener, RequestQueue, ServerRequest, XmlRequest};
use crate::taskrun::{self, RunHandle};

struct ActiveRun {
    handle: Arc<RunHandle>,
    run_info: Arc<TaskRunInfo>,
}

pub struct RunStatus {
    config: Arc<Config>,
    queue: RequestQueue,
    slot: Mutex<Option<ActiveRun>>,
    trigger: Notify,
}

impl RunStatus {
    pub fn new(config: Arc<Config>, queue: RequestQueue) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            slot: Mutex::new(None),
            trigger: Notify::new(),
        })
    }

    /// Wait until the current task ends or the timeout expires, whichever
    /// comes first.
    pub async fn delay(&self, timeout_ms: u64) {
        if timeout_ms == 0 {
            return;
        }
        let finished = self.trigger.notified();
        tokio::select! {
            _ = finished => {}
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {}
        }
    }

    /// Start a new task run as specified by the Control Center.
    pub async fn start_task(self: Arc<Self>, run_info: TaskRunInfo) {
        let factory = Arc::new(RunFactory::new(
            self.config.clone(),
            Arc::new(run_info),
            self.queue.clone(),
        ));
        taskrun::launch(factory, self).await;
    }

    /// Abort the task run in progress; no-op if none.
    pub fn abort_task(&self) {
        let slot = self.lock_slot();
        if let Some(active) = slot.as_ref() {
            active.handle.abort();
        }
    }

    /// Queue a sync request describing this host and the run in progress.
    pub fn submit_sync(&self, listener: Arc<dyn ReplyListener>) {
        let host = hostname();
        // Building and queueing the request must be atomic with respect to
        // `run_finished`: a TaskDone queued after us must not invalidate a
        // request that says the run is still in progress.
        let slot = self.lock_slot();
        let mut body = format!(
            "<request host=\"{}\" runnerVersion=\"{}\">\r\n",
            xml_escape(&host),
            crate::VERSION
        );
        if let Some(active) = slot.as_ref() {
            body.push_str(&active.run_info.run_id_xml());
            body.push_str("\r\n");
        }
        body.push_str("</request>\r\n");
        self.queue
            .submit(ServerRequest::Xml(XmlRequest::new("Synchronize", body)), listener);
    }

    /// Wait until no run is in progress.
    pub async fn wait_idle(&self) {
        loop {
            let finished = self.trigger.notified();
            if self.lock_slot().is_none() {
                return;
            }
            finished.await;
        }
    }

    /// Called just before the run's worker is spawned.
    pub(crate) fn run_started(&self, handle: Arc<RunHandle>, run_info: Arc<TaskRunInfo>) {
        let mut slot = self.lock_slot();
        if slot.is_some() {
            error!("Previous task was not yet done");
        }
        *slot = Some(ActiveRun { handle, run_info });
    }

    /// Called by the worker when the run has finished. Clearing the slot and
    /// queueing the report happen under one lock: a sync built before this
    /// call describes the run as in progress, one built after does not.
    pub(crate) fn run_finished(&self, factory: &RunFactory, result: TaskResult) {
        let mut slot = self.lock_slot();
        *slot = None;
        if result.code() != ResultCode::Ignore {
            factory.report_result(&result);
        }
        self.trigger.notify_waiters();
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_owned())
}
