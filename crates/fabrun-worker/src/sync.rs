//! Polls the Control Center to fetch tasks to run.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use roxmltree::Node;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::protocol::{ProtocolError, TaskRunInfo};
use crate::server::{PermanentFailure, ReplyListener, RequestQueue};
use crate::status::RunStatus;

/// Time in milliseconds between two sync requests if the Control Center did
/// not specify a delay.
const DEFAULT_SYNC_DELAY_MS: u64 = 10_000;

enum SyncError {
    /// The response violates the command protocol.
    Command(String),
    /// A task descriptor did not parse.
    Descriptor(ProtocolError),
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Descriptor(e)
    }
}

pub struct SyncLoop {
    status: Arc<RunStatus>,
    queue: RequestQueue,
    queue_task: Option<JoinHandle<()>>,
    running: bool,
}

impl SyncLoop {
    pub fn new(status: Arc<RunStatus>, queue: RequestQueue, queue_task: JoinHandle<()>) -> Self {
        Self {
            status,
            queue,
            queue_task: Some(queue_task),
            running: true,
        }
    }

    pub async fn main_loop(mut self) {
        while self.running {
            // Submit a sync request, then wait for the one-slot reply buffer.
            let (listener, reply) = SyncReplyListener::new();
            self.status.submit_sync(listener);
            let response = reply.await.unwrap_or(None);

            let delay = match response {
                None => DEFAULT_SYNC_DELAY_MS,
                Some(text) => self.handle_commands(&text).await,
            };
            self.status.delay(delay).await;
        }

        // A task started by the final response still runs to completion; its
        // result report goes through the queue we are about to drain.
        self.status.wait_idle().await;
        if let Some(task) = self.queue_task.take() {
            self.queue.shutdown(task).await;
        }
    }

    async fn handle_commands(&mut self, text: &str) -> u64 {
        let document = match roxmltree::Document::parse(text) {
            Ok(document) => document,
            Err(e) => {
                error!("Control Center returned bad XML: {e}");
                return DEFAULT_SYNC_DELAY_MS;
            }
        };
        let mut delay = DEFAULT_SYNC_DELAY_MS;
        match self.dispatch(&document.root_element(), &mut delay).await {
            Ok(()) => {}
            Err(SyncError::Descriptor(e)) => {
                error!(
                    "Error parsing task parameters: {e}, Control Center is probably \
                     communicating in a different protocol version than the Task Runner supports"
                );
            }
            Err(SyncError::Command(message)) => {
                error!("Exception in sync loop: {message}");
            }
        }
        delay
    }

    /// Process the commands of one response in document order. The order is
    /// material: `start` and `wait` may coexist, and the last `wait` wins.
    async fn dispatch(&mut self, root: &Node<'_, '_>, delay: &mut u64) -> Result<(), SyncError> {
        if root.tag_name().name() != "response" {
            return Err(SyncError::Command("Invalid response".to_owned()));
        }
        for command in root.children().filter(Node::is_element) {
            match command.tag_name().name() {
                "start" => {
                    debug!("Received <start> command");
                    let info = TaskRunInfo::parse_execute(&command)?;
                    self.status.clone().start_task(info).await;
                }
                "extract" => {
                    debug!("Received <extract> command");
                    let info = TaskRunInfo::parse_extract(&command)?;
                    self.status.clone().start_task(info).await;
                }
                "abort" => {
                    debug!("Received <abort> command");
                    self.status.abort_task();
                }
                "exit" => {
                    debug!("Received <exit> command");
                    info!("Control Center requested exit");
                    self.running = false; // leave main loop
                    *delay = 0; // exit immediately
                }
                "wait" => {
                    debug!("Received <wait> command");
                    let seconds: i64 = command
                        .attribute("seconds")
                        .ok_or_else(|| {
                            SyncError::Command("Missing \"seconds\" on <wait>".to_owned())
                        })?
                        .parse()
                        .map_err(|_| SyncError::Command("Invalid delay".to_owned()))?;
                    if seconds < 0 {
                        return Err(SyncError::Command(format!("Invalid delay: {seconds}")));
                    }
                    *delay = seconds as u64 * 1000;
                }
                other => {
                    return Err(SyncError::Command(format!("Invalid command: {other}")));
                }
            }
        }
        Ok(())
    }
}

/// One-slot buffer passing the sync response from the queue's callback to
/// the main loop. `None` signals a permanent failure.
struct SyncReplyListener {
    reply: Mutex<Option<oneshot::Sender<Option<String>>>>,
}

impl SyncReplyListener {
    fn new() -> (Arc<Self>, oneshot::Receiver<Option<String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                reply: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn fill(&self, response: Option<String>) {
        let sender = self.reply.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            let _ = sender.send(response);
        }
    }
}

#[async_trait]
impl ReplyListener for SyncReplyListener {
    async fn server_replied(&self, body: &[u8]) -> io::Result<()> {
        // Whatever the body holds, synchronization must go on; XML errors
        // are diagnosed by the main loop.
        self.fill(Some(String::from_utf8_lossy(body).into_owned()));
        Ok(())
    }

    async fn server_failed(&self, error: &PermanentFailure) {
        error!("Control Center failed to synchronize: {error}");
        self.fill(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_loop() -> SyncLoop {
        let xml = r#"<taskrunner>
            <controlCenter serverBaseURL="http://cc.example.com/" tokenId="t" tokenPass="p"/>
            <output reportBaseDir="/tmp" productBaseDir="/tmp"/>
            <generic logLevel="info"/>
            <wrappers dir="/tmp"/>
        </taskrunner>"#;
        let config = Arc::new(Config::parse(xml).unwrap());
        let (queue, task) = RequestQueue::start(&config.control_center);
        let status = RunStatus::new(config, queue.clone());
        SyncLoop::new(status, queue, task)
    }

    #[tokio::test]
    async fn test_wait_command_sets_delay() {
        let mut sync_loop = test_loop();
        let delay = sync_loop
            .handle_commands("<response><wait seconds=\"15\"/></response>")
            .await;
        assert_eq!(delay, 15_000);
    }

    #[tokio::test]
    async fn test_last_wait_wins() {
        let mut sync_loop = test_loop();
        let delay = sync_loop
            .handle_commands(
                "<response><wait seconds=\"5\"/><wait seconds=\"2\"/></response>",
            )
            .await;
        assert_eq!(delay, 2_000);
    }

    #[tokio::test]
    async fn test_zero_wait_is_allowed() {
        let mut sync_loop = test_loop();
        let delay = sync_loop
            .handle_commands("<response><wait seconds=\"0\"/></response>")
            .await;
        assert_eq!(delay, 0);
    }

    #[tokio::test]
    async fn test_negative_wait_is_rejected() {
        let mut sync_loop = test_loop();
        // The error abandons the command stream; the delay accumulated so
        // far stands.
        let delay = sync_loop
            .handle_commands("<response><wait seconds=\"-1\"/></response>")
            .await;
        assert_eq!(delay, DEFAULT_SYNC_DELAY_MS);
    }

    #[tokio::test]
    async fn test_exit_command_stops_loop() {
        let mut sync_loop = test_loop();
        let delay = sync_loop
            .handle_commands("<response><exit/></response>")
            .await;
        assert_eq!(delay, 0);
        assert!(!sync_loop.running);
    }

    #[tokio::test]
    async fn test_invalid_command_keeps_running() {
        let mut sync_loop = test_loop();
        let delay = sync_loop
            .handle_commands("<response><reboot/></response>")
            .await;
        assert_eq!(delay, DEFAULT_SYNC_DELAY_MS);
        assert!(sync_loop.running);
    }

    #[tokio::test]
    async fn test_invalid_root_element() {
        let mut sync_loop = test_loop();
        let delay = sync_loop.handle_commands("<reply/>").await;
        assert_eq!(delay, DEFAULT_SYNC_DELAY_MS);
    }

    #[tokio::test]
    async fn test_bad_xml_uses_default_delay() {
        let mut sync_loop = test_loop();
        let delay = sync_loop.handle_commands("not xml at all").await;
        assert_eq!(delay, DEFAULT_SYNC_DELAY_MS);
    }

    #[tokio::test]
    async fn test_bad_descriptor_is_protocol_error() {
        let mut sync_loop = test_loop();
        // A <start> without <run>/<task> is a descriptor parse error; the
        // loop logs it and keeps its default delay.
        let delay = sync_loop
            .handle_commands("<response><start/><wait seconds=\"9\"/></response>")
            .await;
        assert_eq!(delay, DEFAULT_SYNC_DELAY_MS);
        assert!(sync_loop.running);
    }
}
