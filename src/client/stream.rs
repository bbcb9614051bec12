//! Server-sent event decoding for streamed completions
//!
//! Frames are newline-delimited `data: {json}` lines ending with
//! `data: [DONE]`. Network reads can split a frame anywhere, including inside
//! a multi-byte character, so bytes are buffered until a full line arrives.

use crate::{ChatError, Result};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Accumulates delta content from raw stream bytes.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    line_buffer: Vec<u8>,
    accumulated: String,
    strict: bool,
    saw_done: bool,
}

impl StreamDecoder {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            ..Default::default()
        }
    }

    /// Text accumulated so far
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    /// Feed one network chunk, calling `on_partial` with the full text after
    /// every non-empty delta.
    pub fn feed(
        &mut self,
        bytes: &[u8],
        on_partial: &mut (dyn for<'p> FnMut(&'p str) + Send),
    ) -> Result<()> {
        self.line_buffer.extend_from_slice(bytes);
        while let Some(pos) = self.line_buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.line_buffer.drain(..=pos).collect();
            self.decode_line(&line, on_partial)?;
        }
        Ok(())
    }

    /// Flush a trailing frame that had no newline and return the final text.
    pub fn finish(
        mut self,
        on_partial: &mut (dyn for<'p> FnMut(&'p str) + Send),
    ) -> Result<String> {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            self.decode_line(&line, on_partial)?;
        }
        Ok(self.accumulated)
    }

    fn decode_line(
        &mut self,
        raw: &[u8],
        on_partial: &mut (dyn for<'p> FnMut(&'p str) + Send),
    ) -> Result<()> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return Ok(());
        }

        let Some(data) = line.strip_prefix("data:") else {
            if ["event:", "id:", "retry:"].iter().any(|p| line.starts_with(p)) {
                return Ok(());
            }
            return self.malformed(format!("unexpected line: {line}"));
        };
        let data = data.trim_start();
        if data == DONE_SENTINEL {
            self.saw_done = true;
            return Ok(());
        }

        let chunk = match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => chunk,
            Err(e) => return self.malformed(format!("{e}: {data}")),
        };
        let content = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .unwrap_or_default();
        if !content.is_empty() {
            self.accumulated.push_str(&content);
            on_partial(&self.accumulated);
        }
        Ok(())
    }

    fn malformed(&self, reason: String) -> Result<()> {
        if self.strict {
            return Err(ChatError::StreamDecode(reason));
        }
        warn!("Skipping malformed stream frame: {}", reason);
        Ok(())
    }
}

/// Drain a byte stream through a [`StreamDecoder`].
///
/// The cancellation token is checked before every read; cancelling drops the
/// stream, which releases the underlying connection.
pub async fn consume_stream<S, B, E>(
    stream: S,
    strict: bool,
    on_partial: &mut (dyn for<'p> FnMut(&'p str) + Send),
    cancel: &CancellationToken,
) -> Result<String>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = StreamDecoder::new(strict);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stream cancelled after {} bytes of text", decoder.text().len());
                return Err(ChatError::Cancelled);
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => decoder.feed(chunk.as_ref(), on_partial)?,
            Some(Err(e)) => return Err(ChatError::Network(format!("stream error: {e}"))),
            None => break,
        }
    }

    if !decoder.saw_done() {
        debug!("Stream ended without {} sentinel", DONE_SENTINEL);
    }
    decoder.finish(on_partial)
}
