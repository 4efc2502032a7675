//! Streams an upstream response to the client line-by-line, translating
//! each line through a `Transformer::stream_chunk` (spec §4.3 step 5).

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use crate::transformer::Transformer;

const CHANNEL_CAPACITY: usize = 16;

fn io_error(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

/// Reads `upstream` line by line, feeds each complete line through
/// `transformer.stream_chunk`, and forwards non-`None` output to the
/// client as `data: <json>\n\n`. Bytes are delivered in the order received
/// (no reordering, no buffering beyond one line — spec §5). Dropping the
/// returned body (client disconnect) cancels the spawned task's channel
/// send, which ends the loop and releases `upstream`.
pub fn stream_response(upstream: reqwest::Response, transformer: Arc<dyn Transformer>) -> Response {
    let byte_stream = upstream
        .bytes_stream()
        .map(|item| item.map_err(io_error));
    let reader = StreamReader::new(byte_stream);
    let mut lines = FramedRead::new(reader, LinesCodec::new());

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        loop {
            match lines.next().await {
                Some(Ok(line)) => {
                    let Some(translated) = transformer.stream_chunk(&line) else {
                        continue;
                    };
                    let frame = format!("data: {translated}\n\n");
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        // Client disconnected; dropping `lines` cancels the
                        // upstream read when this task exits.
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "upstream stream ended with a read error");
                    break;
                }
                None => break,
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .expect("static header values are always valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{CanonicalRequest, CanonicalResponse};
    use crate::error::AppError;
    use crate::transformer::RequestParts;

    struct EchoUpperTransformer;

    impl Transformer for EchoUpperTransformer {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn request(&self, _: &CanonicalRequest, _: &crate::config::Provider) -> Result<RequestParts, AppError> {
            unreachable!()
        }
        fn response(&self, _: &serde_json::Value, _: &CanonicalRequest) -> Result<CanonicalResponse, AppError> {
            unreachable!()
        }
        fn stream_chunk(&self, line: &str) -> Option<String> {
            if line.is_empty() {
                None
            } else {
                Some(format!("\"{}\"", line.to_uppercase()))
            }
        }
        fn supports_streaming(&self) -> bool {
            true
        }
    }

    #[test]
    fn transformer_skips_empty_lines() {
        let t = EchoUpperTransformer;
        assert!(t.stream_chunk("").is_none());
        assert_eq!(t.stream_chunk("hi").unwrap(), "\"HI\"");
    }
}
