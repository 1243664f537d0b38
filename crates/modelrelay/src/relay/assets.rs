use base64::Engine;
use serde_json::Value;
use tracing::debug;

use crate::llm::Payload;
use crate::llm::types::{completions, messages};

/// Fetch user-supplied image URLs and inline them as base64 when the bytes
/// fit under the configured cap; oversized (or unfetchable) URLs are
/// forwarded verbatim.
pub async fn inline_images(client: &reqwest::Client, payload: &mut Payload, max_size: usize) {
	match payload {
		Payload::Chat(req) => {
			for msg in &mut req.messages {
				let Some(completions::MessageContent::Parts(parts)) = &mut msg.content else {
					continue;
				};
				for part in parts {
					if part.part_type != "image_url" {
						continue;
					}
					let Some(image) = &mut part.image_url else {
						continue;
					};
					if !image.url.starts_with("http://") && !image.url.starts_with("https://") {
						continue;
					}
					if let Some((media_type, data)) = fetch(client, &image.url, max_size).await {
						image.url = format!("data:{media_type};base64,{data}");
					}
				}
			}
		},
		Payload::Messages(req) => {
			for msg in &mut req.messages {
				for block in &mut msg.content {
					let messages::ContentBlock::Known(messages::KnownBlock::Image { source, .. }) = block
					else {
						continue;
					};
					if source.get("type").and_then(Value::as_str) != Some("url") {
						continue;
					}
					let Some(url) = source.get("url").and_then(Value::as_str) else {
						continue;
					};
					if let Some((media_type, data)) = fetch(client, &url.to_string(), max_size).await {
						*source = serde_json::json!({
							"type": "base64",
							"media_type": media_type,
							"data": data,
						});
					}
				}
			}
		},
		_ => {},
	}
}

async fn fetch(client: &reqwest::Client, url: &str, max_size: usize) -> Option<(String, String)> {
	let resp = match client.get(url).send().await {
		Ok(resp) if resp.status().is_success() => resp,
		Ok(resp) => {
			debug!(url, status = %resp.status(), "asset fetch failed, forwarding url");
			return None;
		},
		Err(e) => {
			debug!(url, error = %e, "asset fetch failed, forwarding url");
			return None;
		},
	};
	let media_type = resp
		.headers()
		.get(http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("image/png")
		.to_string();
	let bytes = resp.bytes().await.ok()?;
	if bytes.len() > max_size {
		debug!(url, len = bytes.len(), "asset over inline cap, forwarding url");
		return None;
	}
	Some((
		media_type,
		base64::engine::general_purpose::STANDARD.encode(&bytes),
	))
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	fn chat_with_image(url: &str) -> Payload {
		Payload::Chat(
			serde_json::from_value(serde_json::json!({
				"model": "gpt-4o-mini",
				"messages": [{"role": "user", "content": [
					{"type": "text", "text": "describe"},
					{"type": "image_url", "image_url": {"url": url}}
				]}]
			}))
			.unwrap(),
		)
	}

	fn image_url(payload: &Payload) -> String {
		let Payload::Chat(req) = payload else {
			panic!("chat payload")
		};
		let Some(completions::MessageContent::Parts(parts)) = &req.messages[0].content else {
			panic!("parts content")
		};
		parts[1].image_url.as_ref().unwrap().url.clone()
	}

	#[tokio::test]
	async fn inlines_exactly_at_the_cap_and_forwards_over_it() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/img.png"))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("content-type", "image/png")
					.set_body_bytes(vec![7u8; 64]),
			)
			.mount(&server)
			.await;
		let client = reqwest::Client::new();
		let url = format!("{}/img.png", server.uri());

		// Exactly at the cap: inlined.
		let mut payload = chat_with_image(&url);
		inline_images(&client, &mut payload, 64).await;
		let inlined = image_url(&payload);
		assert!(inlined.starts_with("data:image/png;base64,"), "{inlined}");

		// One byte under the response size: forwarded untouched.
		let mut payload = chat_with_image(&url);
		inline_images(&client, &mut payload, 63).await;
		assert_eq!(image_url(&payload), url);
	}

	#[tokio::test]
	async fn data_urls_are_left_alone() {
		let client = reqwest::Client::new();
		let mut payload = chat_with_image("data:image/png;base64,AAAA");
		inline_images(&client, &mut payload, 1024).await;
		assert_eq!(image_url(&payload), "data:image/png;base64,AAAA");
	}
}
