use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::protocol::{ChatRequest, StreamEvent};

/// Raw response body, chunked however the transport delivers it.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ChatError>> + Send>>;

/// Opens the chunked event stream for one chat request.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, ChatError>;
}

/// HTTP client for the chat endpoints
pub struct StreamClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl StreamClient {
    pub fn new(base_url: impl Into<String>, http_client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        }
    }

    /// `/api/chat/mcp` for server-orchestrated requests, `/api/chat/stream` otherwise.
    pub fn endpoint(&self, auto_parse: bool) -> String {
        if auto_parse {
            format!("{}/api/chat/mcp", self.base_url)
        } else {
            format!("{}/api/chat/stream", self.base_url)
        }
    }
}

#[async_trait]
impl ChatTransport for StreamClient {
    async fn open_stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, ChatError> {
        let url = self.endpoint(request.auto_parse);
        tracing::debug!(%url, model = %request.model_id, "opening chat stream");

        let send = self.http_client.post(&url).json(request).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            response = send => response?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Http { status, body });
        }

        let stream = response
            .bytes_stream()
            .map(|item| item.map(|bytes| bytes.to_vec()).map_err(ChatError::from));
        Ok(Box::pin(stream))
    }
}

/// One decoded line of the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StreamEvent),
    /// `data: [DONE]`, a terminator hint with no effect of its own.
    DoneMarker,
    /// A `data:` line whose payload did not decode.
    Malformed { payload: String, reason: String },
}

/// Reassembles `data: <JSON>` lines across arbitrary chunk boundaries.
///
/// Splitting happens on raw bytes so multi-byte characters cut by the
/// transport are only decoded once the whole line is present.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(idx) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=idx).collect();
            if let Some(frame) = decode_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<Frame> {
        let line = std::mem::take(&mut self.pending);
        decode_line(&line).into_iter().collect()
    }
}

fn decode_line(raw: &[u8]) -> Option<Frame> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
    if line.trim().is_empty() {
        return None;
    }

    // The server writes `data: `; a bare `data:` is accepted too, as SSE allows.
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim() == "[DONE]" {
        return Some(Frame::DoneMarker);
    }

    match serde_json::from_str::<StreamEvent>(data) {
        Ok(event) => Some(Frame::Event(event)),
        Err(e) => Some(Frame::Malformed {
            payload: data.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Pulls decoded events off a byte stream in arrival order.
pub struct EventReader<S> {
    inner: S,
    decoder: FrameDecoder,
    ready: VecDeque<StreamEvent>,
    exhausted: bool,
    malformed: usize,
}

impl<S> EventReader<S>
where
    S: Stream<Item = Result<Vec<u8>, ChatError>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            exhausted: false,
            malformed: 0,
        }
    }

    /// Number of frames skipped because their payload did not decode.
    pub fn malformed_count(&self) -> usize {
        self.malformed
    }

    /// Next event, `Ok(None)` at end of stream.
    ///
    /// A cancelled token wins over any buffered or in-flight data.
    pub async fn next_event(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<StreamEvent>, ChatError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            if self.exhausted {
                return Ok(None);
            }

            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                item = self.inner.next() => item,
            };

            let frames = match item {
                Some(Ok(chunk)) => self.decoder.feed(&chunk),
                Some(Err(e)) => return Err(e),
                None => {
                    self.exhausted = true;
                    self.decoder.finish()
                }
            };
            self.queue(frames);
        }
    }

    fn queue(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            match frame {
                Frame::Event(event) => self.ready.push_back(event),
                Frame::DoneMarker => tracing::debug!("received [DONE] marker"),
                Frame::Malformed { payload, reason } => {
                    self.malformed += 1;
                    tracing::warn!(%payload, "skipping malformed event frame: {}", reason);
                }
            }
        }
    }
}
