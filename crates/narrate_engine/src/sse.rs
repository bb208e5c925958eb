use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use narrate_logging::{narrate_trace, narrate_warn};

use crate::{ChannelMessage, TransportError};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ChannelMessage, TransportError>> + Send>>;

/// Longest unterminated line kept while waiting for its end.
const MAX_LINE_BYTES: usize = 1 << 20;

/// Incremental `text/event-stream` decoder.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence or a
/// CRLF pair; only complete lines are interpreted. Lines end in LF, CRLF or a
/// lone CR.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
    last_event_id: Option<String>,
    started: bool,
    /// The previous chunk ended in CR; an LF opening the next one belongs to it.
    skip_lf: bool,
    /// Dropping the rest of an overlong line.
    discarding: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the most recent event that carried one.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Consumes a chunk and returns every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ChannelMessage> {
        let mut chunk = chunk;
        if self.skip_lf && !chunk.is_empty() {
            self.skip_lf = false;
            if let Some(rest) = chunk.strip_prefix(b"\n") {
                chunk = rest;
            }
        }

        // Whatever is buffered holds no line end, so scanning resumes at its tail.
        let mut index = self.buffer.len();
        self.buffer.extend_from_slice(chunk);
        let mut start = 0;
        let mut messages = Vec::new();
        while index < self.buffer.len() {
            let byte = self.buffer[index];
            if byte != b'\n' && byte != b'\r' {
                index += 1;
                continue;
            }
            let end = index;
            index += 1;
            if byte == b'\r' {
                match self.buffer.get(index) {
                    Some(b'\n') => index += 1,
                    Some(_) => {}
                    None => self.skip_lf = true,
                }
            }
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            start = index;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if let Some(message) = self.process_line(line) {
                messages.push(message);
            }
        }
        self.buffer.drain(..start);

        if self.buffer.len() > MAX_LINE_BYTES {
            narrate_warn!(
                "SSE line exceeds {} bytes; dropping it and the event in progress",
                MAX_LINE_BYTES
            );
            self.buffer.clear();
            self.discarding = true;
            self.reset_event();
        }
        messages
    }

    fn reset_event(&mut self) {
        self.event = None;
        self.data.clear();
        self.id = None;
        self.retry = None;
    }

    fn process_line(&mut self, mut line: String) -> Option<ChannelMessage> {
        if !self.started {
            self.started = true;
            if let Some(stripped) = line.strip_prefix('\u{feff}') {
                line = stripped.to_string();
            }
        }
        let line = line.as_str();
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            narrate_trace!("SSE comment {}", line);
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "retry" => {
                if !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit()) {
                    self.retry = value.parse().ok();
                }
            }
            _ => narrate_trace!("Ignoring SSE field {}", field),
        }
        None
    }

    fn dispatch(&mut self) -> Option<ChannelMessage> {
        let event = self.event.take().filter(|name| !name.is_empty());
        let id = self.id.take();
        let retry = self.retry.take();
        if id.is_some() {
            self.last_event_id.clone_from(&id);
        }
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(ChannelMessage {
            event,
            data,
            id,
            retry,
        })
    }
}

/// Turns a response body into a stream of events.
///
/// The stream ends with exactly one error: `IdleTimeout` when no bytes arrive
/// for `idle_timeout`, `Closed` at end of body, or `Stream` on a read error.
/// An unterminated trailing event is dropped.
pub fn decode_body<S, E>(body: S, idle_timeout: Duration) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    struct State<S> {
        body: Pin<Box<S>>,
        decoder: SseDecoder,
        ready: VecDeque<ChannelMessage>,
        finished: bool,
    }

    let state = State {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    let events = stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(message) = state.ready.pop_front() {
                return Some((Ok(message), state));
            }
            if state.finished {
                return None;
            }
            let error = match tokio::time::timeout(idle_timeout, state.body.next()).await {
                Ok(Some(Ok(chunk))) => {
                    state.ready.extend(state.decoder.feed(&chunk));
                    continue;
                }
                Ok(Some(Err(err))) => TransportError::Stream(err.to_string()),
                Ok(None) => TransportError::Closed,
                Err(_) => TransportError::IdleTimeout(idle_timeout),
            };
            state.finished = true;
            return Some((Err(error), state));
        }
    });
    events.boxed()
}
