use std::sync::Arc;

use http::{HeaderMap, HeaderValue, header};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::llm::AIProvider;
use crate::relay::RelayService;
use crate::types::{Channel, ChannelStatus, RelayMode};

/// Background probe that re-enables auto-disabled channels: the configured
/// test prompt goes through the normal adaptor and dispatch machinery, and a
/// single success re-enables the channel.
pub fn spawn(service: Arc<RelayService>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(service.cfg.probe_interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			let channels = match service.store.channels().await {
				Ok(channels) => channels,
				Err(e) => {
					warn!(error = %e, "probe could not list channels");
					continue;
				},
			};
			for channel in channels
				.iter()
				.filter(|c| c.status == ChannelStatus::AutoDisabled)
			{
				match probe_channel(&service, channel).await {
					Ok(()) => {
						info!(channel = channel.id, "probe succeeded, re-enabling channel");
						let _ = service
							.store
							.set_channel_status(channel.id, ChannelStatus::Enabled)
							.await;
						service.health.reset_channel(channel.id);
						let _ = service.registry.rebuild().await;
					},
					Err(e) => debug!(channel = channel.id, error = %e, "probe failed"),
				}
			}
		}
	})
}

async fn probe_channel(service: &RelayService, channel: &Arc<Channel>) -> anyhow::Result<()> {
	let Some(model) = channel.probe_model() else {
		anyhow::bail!("channel declares no models");
	};
	let provider = AIProvider::from(channel.channel_type);
	let upstream_model = channel.upstream_model(model).to_string();
	let format = provider.upstream_format(RelayMode::Chat)?;

	let chat: crate::llm::types::completions::Request = serde_json::from_value(json!({
		"model": upstream_model,
		"messages": [{"role": "user", "content": "ping"}],
		"max_completion_tokens": 8,
	}))?;
	let body = match format {
		crate::llm::UpstreamFormat::Completions => serde_json::to_vec(&chat)?,
		crate::llm::UpstreamFormat::Messages => {
			let translated = crate::llm::conversion::messages::from_completions::translate(&chat)?;
			if provider == AIProvider::Bedrock {
				crate::llm::conversion::messages::prepare_bedrock(&translated)?
			} else {
				serde_json::to_vec(&translated)?
			}
		},
		other => anyhow::bail!("chat probe cannot target {other:?}"),
	};

	let url = provider.build_url(channel, RelayMode::Chat, &upstream_model, false)?;
	let mut headers = HeaderMap::new();
	headers.insert(
		header::CONTENT_TYPE,
		HeaderValue::from_static("application/json"),
	);
	provider.build_headers(channel, &mut headers)?;
	if provider == AIProvider::Bedrock {
		crate::llm::bedrock::sign_request(&channel.credential, "POST", &url, &mut headers, &body)?;
	}
	let resp = service
		.client
		.post(&url)
		.headers(headers)
		.body(body)
		.timeout(std::time::Duration::from_secs(30))
		.send()
		.await?;
	if !resp.status().is_success() {
		anyhow::bail!("probe returned {}", resp.status());
	}
	Ok(())
}
