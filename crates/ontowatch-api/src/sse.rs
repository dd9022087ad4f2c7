// ── Server-Sent Events framing ──
//
// Pull-based incremental parser: bytes are appended to a buffer and complete
// lines are consumed as they appear. Events are dispatched on a blank line.
// Handles LF, CR, and CRLF line endings, including a CRLF split across chunks.

use bytes::{Buf, Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;

use crate::error::Error;

/// One dispatched SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buf: BytesMut,
    /// Previous chunk ended on `\r`; drop a leading `\n`.
    skip_lf: bool,
    /// `Some` once a `data` line was seen; each line is stored with a trailing LF.
    data: Option<String>,
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            if self.skip_lf && !self.buf.is_empty() {
                if self.buf.first() == Some(&b'\n') {
                    self.buf.advance(1);
                }
                self.skip_lf = false;
            }

            let Some(pos) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                break;
            };
            let line = self.buf.split_to(pos);
            let terminator = self.buf.first().copied();
            self.buf.advance(1);
            if terminator == Some(b'\r') {
                if self.buf.is_empty() {
                    self.skip_lf = true;
                } else if self.buf.first() == Some(&b'\n') {
                    self.buf.advance(1);
                }
            }

            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush at end of stream: a trailing line without terminator still counts,
    /// and a pending event is dispatched.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buf.is_empty() {
            let line = self.buf.split();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &[u8]) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.first() == Some(&b':') {
            return None;
        }

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };

        match field {
            "data" => {
                let data = self.data.get_or_insert_with(String::new);
                data.push_str(value);
                data.push('\n');
            }
            "event" => self.event = Some(value.to_owned()),
            "id" if !value.contains('\0') => self.id = Some(value.to_owned()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            _ => tracing::trace!(field, "ignoring unknown SSE field"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let retry = self.retry.take();
        let mut data = self.data.take()?;
        if data.ends_with('\n') {
            data.pop();
        }
        Some(SseEvent {
            event,
            data,
            id: self.id.clone(),
            retry,
        })
    }
}

/// Adapt a byte stream (e.g. `reqwest::Response::bytes_stream`) into events.
pub fn sse_events<S, E>(body: S) -> impl Stream<Item = Result<SseEvent, Error>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Error>,
{
    async_stream::try_stream! {
        let mut parser = SseParser::new();
        let mut body = std::pin::pin!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(Into::<Error>::into)?;
            for event in parser.feed(&chunk) {
                yield event;
            }
        }
        if let Some(event) = parser.finish() {
            yield event;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn data_of(events: &[SseEvent]) -> Vec<&str> {
        events.iter().map(|e| e.data.as_str()).collect()
    }

    #[test]
    fn dispatches_on_blank_line() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: message\ndata: {\"a\":1}\n\ndata: two\n\n");
        assert_eq!(data_of(&events), vec!["{\"a\":1}", "two"]);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[1].event, None);
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: first\ndata:second\n\n");
        assert_eq!(data_of(&events), vec!["first\nsecond"]);
    }

    #[test]
    fn events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"da").is_empty());
        assert!(parser.feed(b"ta: hel").is_empty());
        assert!(parser.feed(b"lo\n").is_empty());
        let events = parser.feed(b"\n");
        assert_eq!(data_of(&events), vec!["hello"]);
    }

    #[test]
    fn crlf_split_between_chunks_is_one_terminator() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: a\r").is_empty());
        // The LF completes the CRLF; only the following CRLF ends the event.
        assert!(parser.feed(b"\n").is_empty());
        let events = parser.feed(b"\r\n");
        assert_eq!(data_of(&events), vec!["a"]);
    }

    #[test]
    fn bare_cr_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: x\r\rdata: y\r\r");
        assert_eq!(data_of(&events), vec!["x", "y"]);
    }

    #[test]
    fn comments_and_unknown_fields_are_skipped() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keep-alive\nfoo: bar\n\n: ping\ndata: z\nid: 7\nretry: 1500\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "z");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].retry, Some(1500));
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail").is_empty());
        let event = parser.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(parser.finish().is_none());
    }

    #[tokio::test]
    async fn adapts_byte_streams() {
        let chunks: Vec<Result<Bytes, Error>> = vec![
            Ok(Bytes::from_static(b"data: 1\n")),
            Ok(Bytes::from_static(b"\ndata: 2\n\n")),
        ];
        let events: Vec<_> = sse_events(futures_util::stream::iter(chunks))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(data_of(&events), vec!["1", "2"]);
    }
}
