use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::BodyDataStream;
use bytes::Bytes;
use futures_core::Stream;
use pin_project_lite::pin_project;

use crate::http::Body;

/// How a streamed response ended, as seen from the egress side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
	/// Upstream finished and every byte reached the client.
	Completed,
	/// The stream died on an error (idle timeout, upstream reset).
	Errored,
	/// The client went away before the stream finished.
	Cancelled,
}

pin_project! {
	/// Wraps an egress body so billing runs exactly once when the stream
	/// terminates, including on client disconnect (drop).
	struct FinalizedBody<F>
	where
		F: FnOnce(StreamEnd),
	{
		#[pin]
		inner: BodyDataStream,
		callback: Option<F>,
		erred: bool,
	}

	impl<F> PinnedDrop for FinalizedBody<F>
	where
		F: FnOnce(StreamEnd),
	{
		fn drop(this: Pin<&mut Self>) {
			let this = this.project();
			if let Some(cb) = this.callback.take() {
				cb(if *this.erred {
					StreamEnd::Errored
				} else {
					StreamEnd::Cancelled
				});
			}
		}
	}
}

impl<F> Stream for FinalizedBody<F>
where
	F: FnOnce(StreamEnd),
{
	type Item = Result<Bytes, axum::Error>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let this = self.project();
		match this.inner.poll_next(cx) {
			Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
			Poll::Ready(Some(Err(e))) => {
				*this.erred = true;
				Poll::Ready(Some(Err(e)))
			},
			Poll::Ready(None) => {
				if let Some(cb) = this.callback.take() {
					cb(StreamEnd::Completed);
				}
				Poll::Ready(None)
			},
			Poll::Pending => Poll::Pending,
		}
	}
}

pub fn on_stream_end(
	body: Body,
	callback: impl FnOnce(StreamEnd) + Send + 'static,
) -> Body {
	Body::from_stream(FinalizedBody {
		inner: body.into_data_stream(),
		callback: Some(callback),
		erred: false,
	})
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use http_body_util::BodyExt;
	use parking_lot::Mutex;

	use super::*;

	#[tokio::test]
	async fn callback_fires_once_on_completion() {
		let ends: Arc<Mutex<Vec<StreamEnd>>> = Default::default();
		let ends2 = ends.clone();
		let body = on_stream_end(Body::from("hello"), move |end| ends2.lock().push(end));
		let bytes = body.collect().await.unwrap().to_bytes();
		assert_eq!(bytes.as_ref(), b"hello");
		assert_eq!(*ends.lock(), vec![StreamEnd::Completed]);
	}

	#[tokio::test]
	async fn callback_fires_on_drop_as_cancelled() {
		let ends: Arc<Mutex<Vec<StreamEnd>>> = Default::default();
		let ends2 = ends.clone();
		let body = on_stream_end(Body::from("hello"), move |end| ends2.lock().push(end));
		drop(body);
		assert_eq!(*ends.lock(), vec![StreamEnd::Cancelled]);
	}
}
