use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use modelrelay::http::{AppState, router};
use modelrelay::ledger::QuotaLedger;
use modelrelay::ratelimit::RateLimiter;
use modelrelay::registry::ChannelRegistry;
use modelrelay::relay::{RelayService, probe};
use modelrelay::store::{LocalState, MemoryStore, Store};
use modelrelay::{Config, RawConfig, health::HealthController};
use tracing::info;

#[derive(Parser)]
#[command(name = "modelrelay", about = "Multi-tenant relay gateway for LLM providers")]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short, long)]
	config: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();
	let cfg = match &args.config {
		Some(path) => {
			let raw = fs_err::read_to_string(path).context("reading config file")?;
			RawConfig::parse_yaml(&raw)?.build()?
		},
		None => Config::default(),
	};

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
	let cfg = Arc::new(cfg);
	modelrelay::llm::preload_tokenizers();

	let store: Arc<dyn Store> = match &cfg.local_state_path {
		Some(path) => {
			let raw = fs_err::read_to_string(path).context("reading local state file")?;
			let state: LocalState = serde_yaml_compat(&raw)?;
			Arc::new(MemoryStore::from_local_state(state))
		},
		None => Arc::new(MemoryStore::new()),
	};

	let ledger = match &cfg.journal_path {
		Some(path) => Arc::new(QuotaLedger::with_journal(store.clone(), path.clone()).await?),
		None => Arc::new(QuotaLedger::new(store.clone())),
	};
	let registry = Arc::new(ChannelRegistry::new(store.clone()).await?);
	let health = Arc::new(HealthController::new(cfg.health.clone()));
	let limiter = match &cfg.redis_url {
		Some(url) => Arc::new(RateLimiter::redis(cfg.rate_limits.clone(), url).await?),
		None => Arc::new(RateLimiter::in_memory(cfg.rate_limits.clone())),
	};

	let relay = Arc::new(RelayService::new(
		cfg.clone(),
		store,
		ledger,
		registry.clone(),
		health,
		limiter,
	)?);
	registry.spawn_sync(cfg.sync_interval);
	probe::spawn(relay.clone());

	let app = router(AppState {
		relay,
	});
	let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
	info!(addr = %cfg.listen_addr, "modelrelay listening");
	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await?;
	Ok(())
}

fn serde_yaml_compat(raw: &str) -> anyhow::Result<LocalState> {
	// Local state is YAML (JSON is a YAML subset, so both work).
	Ok(serde_yaml::from_str(raw)?)
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("shutting down");
}
