//! chime demo: in-memory store, one process, signals that fail a few times
//! before they get through.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use chime_core::impls::{InMemoryNotificationCenter, InMemorySignalStore};
use chime_core::ports::DistributionGateway;
use chime_core::{
    DeliveryError, ServiceBuilder, ServiceConfig, SignalKey, SignalSubmission, SignalSubmitter,
};

#[derive(Debug, Parser)]
#[command(name = "chime", about = "Run the delayed-signal pipeline against an in-memory store")]
struct Args {
    /// TOML service configuration; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,

    /// Number of signals to submit.
    #[arg(short = 'n', long, default_value_t = 5)]
    signals: u32,

    /// Group the signals are submitted under.
    #[arg(short, long, default_value = "hello")]
    group: String,

    /// Deliveries that fail before the gateway starts accepting.
    #[arg(long, default_value_t = 2)]
    fail_first: u32,

    /// Spacing between consecutive fire times.
    #[arg(long, default_value_t = 500)]
    spread_ms: u64,

    /// Give up waiting for signals to settle after this long.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Logs each greeting; refuses the first `remaining_failures` deliveries.
struct HelloGateway {
    remaining_failures: AtomicU32,
}

impl HelloGateway {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl DistributionGateway for HelloGateway {
    async fn distribute(&self, key: &SignalKey, payload: &str) -> Result<(), DeliveryError> {
        let p: HelloPayload = serde_json::from_str(payload)
            .map_err(|e| DeliveryError::new(format!("json decode: {e}")))?;

        let refused = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(DeliveryError::new("intentional failure"));
        }

        info!(%key, "Hello, {}!", p.name);
        Ok(())
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("LOG_LEVEL")
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ServiceConfig> {
    let Some(path) = path else {
        return Ok(ServiceConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = toml::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }
    init_tracing()?;

    let store = InMemorySignalStore::new();
    let center = InMemoryNotificationCenter::new();
    let policies = config.policies.build_provider()?;

    let service = ServiceBuilder::new()
        .store(Arc::new(store.clone()))
        .gateway(Arc::new(HelloGateway::new(args.fail_first)))
        .policies(Arc::new(policies))
        .subscriber(Arc::new(center.subscriber()))
        .config(config)
        .build()?;
    let service = Arc::new(service);
    let submitter = SignalSubmitter::new(Arc::new(store.clone()), Arc::new(center.publisher()));

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        async move { service.run(cancel).await }
    });

    let now = Utc::now();
    let spread = chrono::Duration::milliseconds(i64::try_from(args.spread_ms)?);
    let mut submissions = Vec::with_capacity(args.signals as usize);
    for n in 0..args.signals {
        let payload = serde_json::to_string(&HelloPayload {
            name: format!("signal-{n}"),
        })?;
        submissions.push(SignalSubmission::new(
            args.group.clone(),
            payload,
            now + spread * i32::try_from(n)?,
        ));
    }
    let keys = submitter.submit_batch(submissions).await?;
    info!(count = keys.len(), group = %args.group, "signals submitted");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    loop {
        let counts = store.counts_by_state();
        if counts.is_settled() {
            info!(success = counts.success, failed = counts.failed, "all signals settled");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(pending = counts.pending, processing = counts.processing, "timed out waiting for signals");
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }

    cancel.cancel();
    running.await?;

    println!("{}", serde_json::to_string_pretty(&store.counts_by_state())?);
    Ok(())
}
