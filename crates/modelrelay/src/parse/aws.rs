use std::pin::Pin;
use std::task::{Context, Poll};

use aws_smithy_eventstream::frame::{DecodedFrame, MessageFrameDecoder};
use aws_smithy_types::event_stream::{HeaderValue, Message};
use axum::body::BodyDataStream;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use pin_project_lite::pin_project;
use serde::Deserialize;
use tracing::debug;

use crate::http::Body;

/// Payload of a Bedrock `chunk` event: the provider-native stream event,
/// base64-encoded.
#[derive(Deserialize)]
struct ChunkPayload {
	bytes: String,
}

fn event_type(message: &Message) -> Option<&str> {
	message
		.headers()
		.iter()
		.find(|h| h.name().as_str() == ":event-type")
		.and_then(|h| match h.value() {
			HeaderValue::String(s) => Some(s.as_str()),
			_ => None,
		})
}

pin_project! {
	/// Decodes an AWS event stream and re-frames each `chunk` payload as a
	/// `data: <json>\n\n` SSE frame, so Bedrock responses flow through the
	/// same stream conversions as the native Anthropic API.
	struct EventStreamToSse {
		#[pin]
		inner: BodyDataStream,
		decoder: MessageFrameDecoder,
		buf: BytesMut,
		done: bool,
	}
}

impl Stream for EventStreamToSse {
	type Item = Result<Bytes, axum::Error>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let mut this = self.project();
		loop {
			if *this.done {
				return Poll::Ready(None);
			}
			// Drain every complete frame already buffered.
			let mut out = BytesMut::new();
			loop {
				match this.decoder.decode_frame(&mut *this.buf) {
					Ok(DecodedFrame::Complete(message)) => {
						if event_type(&message) != Some("chunk") {
							continue;
						}
						let Ok(chunk) = serde_json::from_slice::<ChunkPayload>(message.payload()) else {
							debug!("undecodable bedrock chunk payload");
							continue;
						};
						match base64::engine::general_purpose::STANDARD.decode(&chunk.bytes) {
							Ok(decoded) => {
								out.extend_from_slice(b"data: ");
								out.extend_from_slice(&decoded);
								out.extend_from_slice(b"\n\n");
							},
							Err(_) => debug!("bedrock chunk payload is not base64"),
						}
					},
					Ok(DecodedFrame::Incomplete) => break,
					Err(e) => {
						*this.done = true;
						return Poll::Ready(Some(Err(axum::Error::new(e))));
					},
				}
			}
			if !out.is_empty() {
				return Poll::Ready(Some(Ok(out.freeze())));
			}
			match this.inner.as_mut().poll_next(cx) {
				Poll::Ready(Some(Ok(chunk))) => {
					this.buf.extend_from_slice(&chunk);
				},
				Poll::Ready(Some(Err(e))) => {
					*this.done = true;
					return Poll::Ready(Some(Err(e)));
				},
				Poll::Ready(None) => {
					*this.done = true;
					return Poll::Ready(None);
				},
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

/// Re-frame a Bedrock event-stream body as Claude-shape SSE.
pub fn eventstream_to_sse(body: Body) -> Body {
	Body::from_stream(EventStreamToSse {
		inner: body.into_data_stream(),
		decoder: MessageFrameDecoder::new(),
		buf: BytesMut::new(),
		done: false,
	})
}

#[cfg(test)]
mod tests {
	use aws_smithy_types::event_stream::Header;
	use http_body_util::BodyExt;

	use super::*;

	fn chunk_message(inner_json: &str) -> Vec<u8> {
		let payload = serde_json::json!({
			"bytes": base64::engine::general_purpose::STANDARD.encode(inner_json),
		});
		let message = Message::new(Bytes::from(serde_json::to_vec(&payload).unwrap())).add_header(
			Header::new(":event-type", HeaderValue::String("chunk".into())),
		);
		let mut out = Vec::new();
		aws_smithy_eventstream::frame::write_message_to(&message, &mut out).unwrap();
		out
	}

	#[tokio::test]
	async fn chunks_become_sse_frames() {
		let mut raw = chunk_message("{\"type\":\"message_stop\"}");
		raw.extend(chunk_message("{\"type\":\"ping\"}"));
		let body = eventstream_to_sse(Body::from(raw));
		let bytes = body.collect().await.unwrap().to_bytes();
		assert_eq!(
			bytes.as_ref(),
			b"data: {\"type\":\"message_stop\"}\n\ndata: {\"type\":\"ping\"}\n\n"
		);
	}

	#[tokio::test]
	async fn non_chunk_events_are_skipped() {
		let payload = serde_json::json!({"message": "internal error"});
		let message = Message::new(Bytes::from(serde_json::to_vec(&payload).unwrap())).add_header(
			Header::new(
				":event-type",
				HeaderValue::String("internalServerException".into()),
			),
		);
		let mut raw = Vec::new();
		aws_smithy_eventstream::frame::write_message_to(&message, &mut raw).unwrap();
		let body = eventstream_to_sse(Body::from(raw));
		let bytes = body.collect().await.unwrap().to_bytes();
		assert!(bytes.is_empty());
	}
}
