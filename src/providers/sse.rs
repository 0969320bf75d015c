//! Server-Sent Events framing.
//!
//! Turns a raw byte stream into SSE events. Only the framing lives here;
//! interpreting the `data` payload is each driver's job.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::Stream;
use pin_project_lite::pin_project;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

pin_project! {
    /// Adapter from a `Bytes` stream to a stream of [`SseEvent`]s.
    ///
    /// Events are delimited by a blank line; partial events are buffered
    /// across byte chunks and the trailing buffer is flushed at end of
    /// stream.
    pub struct SseStream<S> {
        #[pin]
        bytes: S,
        buffer: String,
        ready: VecDeque<SseEvent>,
    }
}

impl<S> SseStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    pub fn new(bytes: S) -> Self {
        Self {
            bytes,
            buffer: String::new(),
            ready: VecDeque::new(),
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    type Item = Result<SseEvent, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if let Some(event) = this.ready.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }

        loop {
            match this.bytes.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.push_str(&String::from_utf8_lossy(&chunk));

                    while let Some(pos) = this.buffer.find("\n\n") {
                        let block: String = this.buffer.drain(..pos).collect();
                        this.buffer.drain(..2);
                        if let Some(event) = parse_block(&block) {
                            this.ready.push_back(event);
                        }
                    }

                    if let Some(event) = this.ready.pop_front() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    if !this.buffer.is_empty() {
                        if let Some(event) = parse_block(this.buffer) {
                            this.ready.push_back(event);
                        }
                        this.buffer.clear();
                    }
                    return match this.ready.pop_front() {
                        Some(event) => Poll::Ready(Some(Ok(event))),
                        None => Poll::Ready(None),
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data = String::new();

    for line in block.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // Comment lines (":keepalive") and id fields are ignored.
    }

    if data.is_empty() && event.is_none() {
        return None;
    }

    Some(SseEvent { event, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};

    fn events(input: &'static str) -> Vec<SseEvent> {
        let byte_stream = stream::iter(vec![Ok(Bytes::from(input))]);
        futures::executor::block_on(
            SseStream::new(byte_stream)
                .map(|r| r.unwrap())
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_basic_events() {
        let parsed = events("data: hello\n\ndata: world\nevent: message\n\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].data, "hello");
        assert_eq!(parsed[1].data, "world");
        assert_eq!(parsed[1].event.as_deref(), Some("message"));
    }

    #[test]
    fn test_multiline_data_joined_with_newline() {
        let parsed = events("data: line1\ndata: line2\n\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].data, "line1\nline2");
    }

    #[test]
    fn test_keepalive_comments_skipped() {
        let parsed = events(": keepalive\n\ndata: x\n\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].data, "x");
    }

    #[tokio::test]
    async fn test_event_split_across_chunks() {
        let byte_stream = stream::iter(vec![
            Ok(Bytes::from("data: hel")),
            Ok(Bytes::from("lo\n\n")),
        ]);
        let mut sse = SseStream::new(byte_stream);
        let event = sse.next().await.unwrap().unwrap();
        assert_eq!(event.data, "hello");
        assert!(sse.next().await.is_none());
    }

    #[tokio::test]
    async fn test_trailing_buffer_flushed_at_eof() {
        let byte_stream = stream::iter(vec![Ok(Bytes::from("data: tail"))]);
        let mut sse = SseStream::new(byte_stream);
        let event = sse.next().await.unwrap().unwrap();
        assert_eq!(event.data, "tail");
    }
}
