//! Communication with the Control Center.
//!
//! All outbound traffic goes through one queue with a single drain task, so
//! requests reach the server strictly in submission order. Transient
//! failures retry the head of the queue in place; permanent failures are
//! reported to the submitting listener and popped.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ControlCenterConfig;

/// Time to wait before retrying a request to the Control Center.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// A request that failed and has little chance of succeeding by retrying.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PermanentFailure {
    message: String,
}

impl PermanentFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A request to the Control Center.
///
/// Form requests keep query and body as ordered `(name, value)` sequences;
/// repeated names are preserved. XML requests carry a `text/xml` body.
#[derive(Debug, Clone)]
pub enum ServerRequest {
    Form(FormRequest),
    Xml(XmlRequest),
}

impl ServerRequest {
    fn page(&self) -> &str {
        match self {
            ServerRequest::Form(form) => &form.page,
            ServerRequest::Xml(xml) => &xml.page,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FormRequest {
    page: String,
    query: Vec<(String, String)>,
    body: Vec<(String, String)>,
}

impl FormRequest {
    pub fn new(page: impl Into<String>) -> Self {
        Self {
            page: page.into(),
            query: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a parameter that identifies the resource being modified.
    pub fn add_query_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.query.push((name.into(), value.into()));
    }

    /// Add a parameter that describes how the resource should be modified.
    pub fn add_body_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.body.push((name.into(), value.into()));
    }

    /// Add one body parameter per value, under the same name.
    pub fn add_body_param_seq<I>(&mut self, name: &str, values: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        for value in values {
            self.add_body_param(name, value);
        }
    }

    /// Add multiple `(name, value)` body parameters.
    pub fn add_body_params<I>(&mut self, params: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in params {
            self.add_body_param(name, value);
        }
    }

    #[cfg(test)]
    pub(crate) fn body_params(&self) -> &[(String, String)] {
        &self.body
    }

    #[cfg(test)]
    pub(crate) fn query_params(&self) -> &[(String, String)] {
        &self.query
    }
}

#[derive(Debug, Clone)]
pub struct XmlRequest {
    page: String,
    body: String,
}

impl XmlRequest {
    pub fn new(page: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            page: page.into(),
            body: body.into(),
        }
    }
}

/// Receives the outcome of a submitted request. Exactly one of the two
/// callbacks is invoked per submission.
#[async_trait]
pub trait ReplyListener: Send + Sync {
    /// Called with the reply body when the request succeeded. Returning an
    /// IO error causes the whole request to be retried; any other failure
    /// must be handled (and logged) by the listener itself.
    async fn server_replied(&self, body: &[u8]) -> io::Result<()>;

    /// Called when the request failed permanently. Transient failures are
    /// retried internally and never reach the listener.
    async fn server_failed(&self, error: &PermanentFailure);
}

/// Listener which logs the outcome of a request and does nothing more.
/// Useful for API calls whose returned value is unimportant.
pub struct ApiReplyListener {
    description: String,
}

impl ApiReplyListener {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

#[async_trait]
impl ReplyListener for ApiReplyListener {
    async fn server_replied(&self, body: &[u8]) -> io::Result<()> {
        let response = String::from_utf8_lossy(body);
        debug!(
            "Succeeded to {}, server replied: {}",
            self.description,
            response.trim()
        );
        Ok(())
    }

    async fn server_failed(&self, error: &PermanentFailure) {
        warn!("Failed to {}: {}", self.description, error);
    }
}

struct QueuedRequest {
    request: ServerRequest,
    listener: Arc<dyn ReplyListener>,
}

enum QueueMessage {
    Request(QueuedRequest),
    Shutdown,
}

/// Handle for queueing requests to the Control Center.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
}

impl RequestQueue {
    /// Start the drain task and return the queue handle plus the task's join
    /// handle. The task runs until [`RequestQueue::shutdown`] is awaited.
    pub fn start(config: &ControlCenterConfig) -> (RequestQueue, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Transport {
            client: reqwest::Client::new(),
            base_url: config.server_base_url.clone(),
            token_id: config.token_id.clone(),
            token_pass: config.token_pass.clone(),
        };
        let handle = tokio::spawn(drain_queue(transport, rx));
        (RequestQueue { tx }, handle)
    }

    /// Queue a request. The listener is called back exactly once, when the
    /// request has either succeeded or failed permanently.
    ///
    /// This never blocks, so it can be called while holding locks.
    pub fn submit(&self, request: ServerRequest, listener: Arc<dyn ReplyListener>) {
        if self
            .tx
            .send(QueueMessage::Request(QueuedRequest { request, listener }))
            .is_err()
        {
            warn!("Request queue is shut down; dropping request");
        }
    }

    /// Shut down the queue. Requests submitted before this call are still
    /// delivered; the given join handle completes once the queue is empty.
    pub async fn shutdown(&self, handle: JoinHandle<()>) {
        debug!("Waiting for Control Center communication to end");
        let _ = self.tx.send(QueueMessage::Shutdown);
        if handle.await.is_err() {
            warn!("Control Center communication task failed");
        }
        debug!("Control Center communication has ended");
    }
}

struct Transport {
    client: reqwest::Client,
    base_url: String,
    token_id: String,
    token_pass: String,
}

async fn drain_queue(transport: Transport, mut rx: mpsc::UnboundedReceiver<QueueMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            QueueMessage::Request(queued) => deliver(&transport, queued).await,
            QueueMessage::Shutdown => return,
        }
    }
}

/// Deliver one request, retrying transient failures until it either
/// succeeds or fails permanently.
async fn deliver(transport: &Transport, queued: QueuedRequest) {
    loop {
        match attempt(transport, &queued.request).await {
            Ok(body) => match queued.listener.server_replied(&body).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        page = queued.request.page(),
                        error = %e,
                        "Error handling server reply; retrying request"
                    );
                }
            },
            Err(Disposition::Transient(message)) => {
                warn!(
                    page = queued.request.page(),
                    "Transient error sending request to Control Center: {message}"
                );
            }
            Err(Disposition::Permanent(failure)) => {
                warn!(
                    page = queued.request.page(),
                    "Permanent error sending request to Control Center: {failure}"
                );
                queued.listener.server_failed(&failure).await;
                return;
            }
        }
        // Avoid overloading the server with failing requests.
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

enum Disposition {
    Transient(String),
    Permanent(PermanentFailure),
}

async fn attempt(transport: &Transport, request: &ServerRequest) -> Result<Vec<u8>, Disposition> {
    let url = format!("{}{}", transport.base_url, request.page());
    // All calls change state on the server, so everything is a POST. Token
    // credentials travel as HTTP Basic authentication.
    let mut builder = transport
        .client
        .post(&url)
        .basic_auth(&transport.token_id, Some(&transport.token_pass));
    builder = match request {
        ServerRequest::Form(form) => {
            if !form.query.is_empty() {
                builder = builder.query(&form.query);
            }
            if form.body.is_empty() {
                builder
            } else {
                builder.form(&form.body)
            }
        }
        ServerRequest::Xml(xml) => builder
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(xml.body.clone()),
    };

    let response = builder
        .send()
        .await
        .map_err(|e| Disposition::Transient(e.to_string()))?;
    classify_status(response.status())?;
    response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|e| Disposition::Transient(e.to_string()))
}

/// Sort a response status into success, retry, or give-up.
fn classify_status(status: StatusCode) -> Result<(), Disposition> {
    let reason = status.canonical_reason().unwrap_or("(no message)");
    match status.as_u16() {
        // Repeating the request will most likely trigger the same error
        // again, so give up now.
        500 => Err(permanent(
            "Server encountered an internal error processing the request",
        )),
        400 => Err(permanent(format!(
            "Server rejected the request as bad: {reason}"
        ))),
        401 => Err(permanent(format!(
            "Server requires authentication: {reason}"
        ))),
        407 => Err(permanent(format!("Proxy requires authentication: {reason}"))),
        403 => Err(permanent(format!("Server disallowed access: {reason}"))),
        411 => Err(permanent("Server requires Content-Length header")),
        code if code >= 400 => Err(Disposition::Transient(format!(
            "Response code {code}: {reason}"
        ))),
        _ => Ok(()),
    }
}

fn permanent(message: impl Into<String>) -> Disposition {
    Disposition::Permanent(PermanentFailure::new(message))
}
