use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::BodyDataStream;
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use pin_project_lite::pin_project;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::http::Body;

pub const DEFAULT_LINE_LIMIT: usize = 1024 * 1024;

/// Stream terminator for OpenAI-shape SSE.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Line-buffered splitter. SSE semantics are line delimited; partial JSON in
/// a partial line is never parsed. Oversized lines (beyond the cap) are
/// dropped whole rather than parsed in pieces.
struct LineBuffer {
	buf: BytesMut,
	cap: usize,
	overflowing: bool,
}

impl LineBuffer {
	fn new(cap: usize) -> Self {
		Self {
			buf: BytesMut::new(),
			cap: if cap == 0 { DEFAULT_LINE_LIMIT } else { cap },
			overflowing: false,
		}
	}

	fn push(&mut self, chunk: &[u8]) -> Vec<String> {
		self.buf.extend_from_slice(chunk);
		let mut lines = Vec::new();
		while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
			let line = self.buf.split_to(pos + 1);
			if self.overflowing {
				// Tail of a line we already dropped.
				self.overflowing = false;
				continue;
			}
			let line = &line[..line.len() - 1];
			let line = line.strip_suffix(b"\r").unwrap_or(line);
			match std::str::from_utf8(line) {
				Ok(s) => lines.push(s.to_string()),
				Err(_) => debug!("dropping non-utf8 SSE line"),
			}
		}
		if self.buf.len() > self.cap {
			debug!(len = self.buf.len(), "dropping SSE line over the size cap");
			self.buf.clear();
			self.overflowing = true;
		}
		lines
	}
}

/// One parsed SSE line, classified.
enum SseLine<'a> {
	/// `data: <payload>`
	Data(&'a str),
	/// Comments and heartbeats (lines starting with `:`), kept for liveness.
	Comment(&'a str),
	/// `event:` names and any other field; semantics come from the data.
	Other,
	Blank,
}

fn classify(line: &str) -> SseLine<'_> {
	if line.is_empty() {
		SseLine::Blank
	} else if let Some(rest) = line.strip_prefix("data:") {
		SseLine::Data(rest.strip_prefix(' ').unwrap_or(rest))
	} else if line.starts_with(':') {
		SseLine::Comment(line)
	} else {
		SseLine::Other
	}
}

pin_project! {
	/// Drives a body through a line handler. In passthrough mode the original
	/// bytes flow unchanged and the handler only observes; otherwise the
	/// handler's output replaces the stream. The handler is called one final
	/// time with `None` at upstream end so trailing frames can be emitted.
	struct SseStream<F> {
		#[pin]
		inner: BodyDataStream,
		lines: LineBuffer,
		handler: F,
		passthrough: bool,
		tail: Option<Bytes>,
		done: bool,
	}
}

impl<F> Stream for SseStream<F>
where
	F: FnMut(Option<&str>) -> BytesMut,
{
	type Item = Result<Bytes, axum::Error>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let mut this = self.project();
		loop {
			if *this.done {
				return Poll::Ready(None);
			}
			if let Some(tail) = this.tail.take() {
				*this.done = true;
				if tail.is_empty() {
					return Poll::Ready(None);
				}
				return Poll::Ready(Some(Ok(tail)));
			}
			match this.inner.as_mut().poll_next(cx) {
				Poll::Ready(Some(Ok(chunk))) => {
					let mut out = BytesMut::new();
					for line in this.lines.push(&chunk) {
						let emitted = match classify(&line) {
							SseLine::Data(data) => (this.handler)(Some(data)),
							SseLine::Comment(c) => {
								if *this.passthrough {
									BytesMut::new()
								} else {
									let mut keep = BytesMut::from(c.as_bytes());
									keep.extend_from_slice(b"\n\n");
									keep
								}
							},
							SseLine::Other | SseLine::Blank => BytesMut::new(),
						};
						out.extend_from_slice(&emitted);
					}
					if *this.passthrough {
						return Poll::Ready(Some(Ok(chunk)));
					}
					if !out.is_empty() {
						return Poll::Ready(Some(Ok(out.freeze())));
					}
					// Nothing to forward from this chunk; poll for more.
				},
				Poll::Ready(Some(Err(e))) => {
					*this.done = true;
					return Poll::Ready(Some(Err(e)));
				},
				Poll::Ready(None) => {
					let tail = (this.handler)(None);
					*this.tail = Some(tail.freeze());
				},
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

/// Forward the upstream stream byte-for-byte while observing every data
/// frame as `T`. The callback sees `None` once at stream end.
pub fn json_passthrough<T>(
	body: Body,
	limit: usize,
	mut f: impl FnMut(Option<Result<T, serde_json::Error>>) + Send + 'static,
) -> Body
where
	T: DeserializeOwned + Send + 'static,
{
	let stream = SseStream {
		inner: body.into_data_stream(),
		lines: LineBuffer::new(limit),
		handler: move |line: Option<&str>| {
			match line {
				Some("[DONE]") => {},
				Some(data) => f(Some(serde_json::from_str::<T>(data))),
				None => f(None),
			}
			BytesMut::new()
		},
		passthrough: true,
		tail: None,
		done: false,
	};
	Body::from_stream(stream)
}

/// Parse each upstream data frame as `I` and emit the transformed frames the
/// callback returns, as OpenAI-shape `data:` frames. A single terminal
/// `data: [DONE]` frame is appended at upstream end.
pub fn json_transform<I, O>(
	body: Body,
	limit: usize,
	mut f: impl FnMut(Result<I, serde_json::Error>) -> Option<O> + Send + 'static,
) -> Body
where
	I: DeserializeOwned + Send + 'static,
	O: Serialize + Send + 'static,
{
	let stream = SseStream {
		inner: body.into_data_stream(),
		lines: LineBuffer::new(limit),
		handler: move |line: Option<&str>| {
			let mut out = BytesMut::new();
			match line {
				Some("[DONE]") => {},
				Some(data) => {
					if let Some(frame) = f(serde_json::from_str::<I>(data)) {
						write_data_frame(&mut out, &frame);
					}
				},
				None => out.extend_from_slice(DONE_FRAME.as_bytes()),
			}
			out
		},
		passthrough: false,
		tail: None,
		done: false,
	};
	Body::from_stream(stream)
}

/// Like [`json_transform`] but for egress shapes whose frames carry event
/// names (Claude messages, OpenAI responses). The callback may return several
/// frames per input and sees `None` once at upstream end for trailing frames
/// (e.g. `message_stop`). No `[DONE]` terminator is appended.
pub fn json_transform_multi<I, O>(
	body: Body,
	limit: usize,
	mut f: impl FnMut(Option<Result<I, serde_json::Error>>) -> Vec<(&'static str, O)> + Send + 'static,
) -> Body
where
	I: DeserializeOwned + Send + 'static,
	O: Serialize + Send + 'static,
{
	let stream = SseStream {
		inner: body.into_data_stream(),
		lines: LineBuffer::new(limit),
		handler: move |line: Option<&str>| {
			let mut out = BytesMut::new();
			let frames = match line {
				Some("[DONE]") => Vec::new(),
				Some(data) => f(Some(serde_json::from_str::<I>(data))),
				None => f(None),
			};
			for (event, frame) in frames {
				write_event_frame(&mut out, event, &frame);
			}
			out
		},
		passthrough: false,
		tail: None,
		done: false,
	};
	Body::from_stream(stream)
}

fn write_data_frame<O: Serialize>(out: &mut BytesMut, frame: &O) {
	let json = serde_json::to_vec(frame).expect("stream frame serializes");
	out.extend_from_slice(b"data: ");
	out.extend_from_slice(&json);
	out.extend_from_slice(b"\n\n");
}

fn write_event_frame<O: Serialize>(out: &mut BytesMut, event: &str, frame: &O) {
	let json = serde_json::to_vec(frame).expect("stream frame serializes");
	out.extend_from_slice(b"event: ");
	out.extend_from_slice(event.as_bytes());
	out.extend_from_slice(b"\ndata: ");
	out.extend_from_slice(&json);
	out.extend_from_slice(b"\n\n");
}

#[cfg(test)]
#[path = "sse_tests.rs"]
mod tests;
