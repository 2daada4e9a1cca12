use crate::error::StreamError;
use crate::protocol::{self, FallbackResponse, StreamFrame};
use crate::throttle::{DEFAULT_THROTTLE_DELAY, ThrottledRenderBuffer};
use futures::{Stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde_json::Value;
use std::string::FromUtf8Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ACCUMULATED_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub accumulated_text: String,
    pub started_at: Option<Instant>,
    pub first_byte_at: Option<Instant>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            accumulated_text: String::new(),
            started_at: None,
            first_byte_at: None,
        }
    }
}

/// Lifecycle callbacks for one session.
///
/// `on_first_chunk` fires at most once and before any content update.
/// Exactly one of `on_error` / `on_done` fires for a session that was not
/// cancelled; a cancelled session fires neither.
pub trait SessionObserver: Send + Sync {
    fn on_first_chunk(&self);
    fn on_content_update(&self, text: &str);
    fn on_error(&self, error: &StreamError);
    fn on_done(&self);
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub throttle_delay: Duration,
    pub max_accumulated_bytes: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            throttle_delay: DEFAULT_THROTTLE_DELAY,
            max_accumulated_bytes: DEFAULT_MAX_ACCUMULATED_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Value,
}

pub struct StreamSession {
    http: reqwest::Client,
    options: SessionOptions,
    cancel: CancellationToken,
    state: SessionState,
    overrun: bool,
}

impl StreamSession {
    pub fn new(http: reqwest::Client, options: SessionOptions, cancel: CancellationToken) -> Self {
        Self {
            http,
            options,
            cancel,
            state: SessionState::default(),
            overrun: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Idempotent; has no effect once the session is terminal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run the request to a terminal phase and return that phase.
    ///
    /// A session runs once: calling `start` again returns the current phase
    /// without touching the network.
    pub async fn start(
        &mut self,
        request: &SessionRequest,
        observer: Arc<dyn SessionObserver>,
    ) -> SessionPhase {
        if self.state.phase != SessionPhase::Idle {
            warn!(phase = ?self.state.phase, "stream session already started");
            return self.state.phase;
        }
        self.begin();

        let cancel = self.cancel.clone();
        let send = self
            .http
            .post(&request.url)
            .headers(request.headers.clone())
            .json(&request.body)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return self.finish_cancelled(None),
            result = send => match result {
                Ok(response) => response,
                Err(err) => return self.fail(&observer, None, StreamError::transport(err)),
            },
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = tokio::select! {
                biased;
                () = cancel.cancelled() => return self.finish_cancelled(None),
                body = response.text() => body.unwrap_or_default(),
            };
            return self.fail(&observer, None, StreamError::http(status, &body));
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("text/event-stream"));

        if is_event_stream {
            self.consume_events(response.bytes_stream(), observer).await
        } else {
            let body = tokio::select! {
                biased;
                () = cancel.cancelled() => return self.finish_cancelled(None),
                body = response.text() => body,
            };
            match body {
                Ok(body) => self.apply_fallback(&body, &observer),
                Err(err) => self.fail(&observer, None, StreamError::transport(err)),
            }
        }
    }

    pub async fn consume_events<S, B, E>(
        &mut self,
        stream: S,
        observer: Arc<dyn SessionObserver>,
    ) -> SessionPhase
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        if self.state.phase == SessionPhase::Idle {
            self.begin();
        }
        if !self.transition(SessionPhase::Streaming) {
            return self.state.phase;
        }

        let sink_observer = Arc::clone(&observer);
        let throttle = ThrottledRenderBuffer::new(
            self.options.throttle_delay,
            Arc::new(move |text: &str| sink_observer.on_content_update(text)),
        );
        let cancel = self.cancel.clone();
        let mut stream = std::pin::pin!(stream);
        let mut lines = LineBuffer::default();

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return self.finish_cancelled(Some(&throttle)),
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => lines.push(bytes.as_ref()),
                Some(Err(err)) => {
                    return self.fail(&observer, Some(&throttle), StreamError::transport(err));
                }
                None => break,
            }

            while let Some(line) = lines.next_line() {
                if cancel.is_cancelled() {
                    return self.finish_cancelled(Some(&throttle));
                }
                if let Some(phase) = self.handle_line(line, &observer, &throttle) {
                    return phase;
                }
            }
        }

        // Body closed without an explicit end marker.
        if let Some(line) = lines.finish() {
            if let Some(phase) = self.handle_line(line, &observer, &throttle) {
                return phase;
            }
        }
        self.complete(&observer, &throttle)
    }

    fn handle_line(
        &mut self,
        line: Result<String, FromUtf8Error>,
        observer: &Arc<dyn SessionObserver>,
        throttle: &ThrottledRenderBuffer,
    ) -> Option<SessionPhase> {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                let error = StreamError::transport(format!("invalid UTF-8 in event stream: {err}"));
                return Some(self.fail(observer, Some(throttle), error));
            }
        };
        let payload = protocol::strip_data_prefix(&line)?;

        match StreamFrame::parse(payload) {
            StreamFrame::Content { text } => {
                self.append(&text, observer, throttle);
                None
            }
            StreamFrame::Error { code, message } => Some(self.fail(
                observer,
                Some(throttle),
                StreamError::Server { code, message },
            )),
            StreamFrame::Done => Some(self.complete(observer, throttle)),
            StreamFrame::Skip => None,
        }
    }

    fn append(
        &mut self,
        text: &str,
        observer: &Arc<dyn SessionObserver>,
        throttle: &ThrottledRenderBuffer,
    ) {
        if self.overrun {
            return;
        }
        if self.state.accumulated_text.len() + text.len() > self.options.max_accumulated_bytes {
            self.overrun = true;
            warn!(
                limit = self.options.max_accumulated_bytes,
                accumulated = self.state.accumulated_text.len(),
                "stream output exceeded size cap, dropping further content"
            );
            return;
        }

        if self.state.first_byte_at.is_none() {
            self.state.first_byte_at = Some(Instant::now());
            observer.on_first_chunk();
        }
        self.state.accumulated_text.push_str(text);
        throttle.update(self.state.accumulated_text.as_str());
    }

    // The non-streaming body is delivered whole, so it bypasses the throttle.
    fn apply_fallback(&mut self, body: &str, observer: &Arc<dyn SessionObserver>) -> SessionPhase {
        let response: FallbackResponse = match serde_json::from_str(body) {
            Ok(response) => response,
            Err(err) => {
                let error = StreamError::transport(format!("invalid response body: {err}"));
                return self.fail(observer, None, error);
            }
        };

        match response {
            FallbackResponse {
                success: true,
                content: Some(content),
                ..
            } => {
                self.transition(SessionPhase::Streaming);
                self.state.first_byte_at = Some(Instant::now());
                self.state.accumulated_text = content;
                observer.on_first_chunk();
                observer.on_content_update(&self.state.accumulated_text);
                self.transition(SessionPhase::Completed);
                observer.on_done();
                SessionPhase::Completed
            }
            FallbackResponse { error, .. } => {
                let error = StreamError::Server {
                    code: "REQUEST_FAILED".to_string(),
                    message: error.unwrap_or_else(|| "unknown error".to_string()),
                };
                self.fail(observer, None, error)
            }
        }
    }

    fn begin(&mut self) {
        self.state.started_at = Some(Instant::now());
        self.transition(SessionPhase::Connecting);
    }

    fn transition(&mut self, next: SessionPhase) -> bool {
        if self.state.phase.is_terminal() {
            return false;
        }
        self.state.phase = next;
        true
    }

    fn complete(
        &mut self,
        observer: &Arc<dyn SessionObserver>,
        throttle: &ThrottledRenderBuffer,
    ) -> SessionPhase {
        if !self.transition(SessionPhase::Completed) {
            return self.state.phase;
        }
        throttle.flush();
        observer.on_done();
        SessionPhase::Completed
    }

    fn fail(
        &mut self,
        observer: &Arc<dyn SessionObserver>,
        throttle: Option<&ThrottledRenderBuffer>,
        error: StreamError,
    ) -> SessionPhase {
        if let Some(throttle) = throttle {
            throttle.cancel();
        }
        if !self.transition(SessionPhase::Failed) {
            return self.state.phase;
        }
        observer.on_error(&error);
        SessionPhase::Failed
    }

    fn finish_cancelled(&mut self, throttle: Option<&ThrottledRenderBuffer>) -> SessionPhase {
        if let Some(throttle) = throttle {
            throttle.cancel();
        }
        if !self.transition(SessionPhase::Cancelled) {
            return self.state.phase;
        }
        debug!(
            accumulated = self.state.accumulated_text.len(),
            "stream session cancelled"
        );
        SessionPhase::Cancelled
    }
}

/// Splits raw body bytes into lines, decoding each only once it is complete
/// so multi-byte characters may straddle chunk boundaries.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<Result<String, FromUtf8Error>> {
        let end = self.bytes.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.bytes.drain(..=end).collect();
        line.pop();
        Some(Self::decode(line))
    }

    fn finish(&mut self) -> Option<Result<String, FromUtf8Error>> {
        if self.bytes.is_empty() {
            return None;
        }
        Some(Self::decode(std::mem::take(&mut self.bytes)))
    }

    fn decode(mut line: Vec<u8>) -> Result<String, FromUtf8Error> {
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
    }
}
