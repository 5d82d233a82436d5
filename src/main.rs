//! polofeed: mirrors Poloniex order books to structured logs.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use polofeed::notify::{BookObserver, ChangeKind, ChangeNotification, Diagnostic, LifecycleObserver};
use polofeed::transport::{TransportError, WsTransport};
use polofeed::{FeedConfig, FeedEngine, RestClient};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = FeedConfig::from_env();
    info!(
        ws_url = %config.ws_url,
        symbols = ?config.symbols,
        depth = config.depth,
        "🚀 polofeed starting"
    );

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("Failed to build HTTP client")?;
    let rest = Arc::new(RestClient::new(http, config.rest_url.clone()));

    let engine = FeedEngine::new(config, Arc::new(WsTransport), rest.clone(), rest)
        .with_book_observer(Arc::new(LogObserver))
        .with_lifecycle_observer(Arc::new(LogObserver));
    let handle = engine.start().await.context("engine failed to start")?;

    let stopper = handle.stopper();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, stopping");
            stopper.stop().await;
        }
    });

    if let Err(error) = handle.join().await {
        warn!(%error, "engine terminated");
        return Err(error.into());
    }
    info!("done");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polofeed=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Writes every change and diagnostic to the log; stands in for a real
/// downstream consumer.
struct LogObserver;

impl BookObserver for LogObserver {
    fn on_change(&self, change: &ChangeNotification) {
        match &change.kind {
            ChangeKind::Levels { side, levels } => {
                let stack: Vec<String> = levels
                    .iter()
                    .map(|level| format!("{}x{}", level.price, level.size))
                    .collect();
                info!(symbol = %change.symbol, side = %side, stack = ?stack, "book update");
            }
            ChangeKind::Trade { side, trade } => {
                info!(
                    symbol = %change.symbol,
                    side = %side,
                    price = %trade.price,
                    size = %trade.size,
                    trade_id = %trade.trade_id,
                    "trade"
                );
            }
            ChangeKind::SnapshotApplied { bids, asks } => {
                info!(
                    symbol = %change.symbol,
                    bids = bids.len(),
                    asks = asks.len(),
                    "snapshot applied"
                );
            }
        }
    }

    fn on_diagnostic(&self, diagnostic: &Diagnostic) {
        warn!(?diagnostic, "feed diagnostic");
    }
}

impl LifecycleObserver for LogObserver {
    fn on_connect(&self) {
        info!("feed connected");
    }

    fn on_disconnect(&self) {
        info!("feed disconnected");
    }

    fn on_connect_error(&self, error: &TransportError) {
        warn!(%error, "feed connect error");
    }

    fn on_reconnect(&self) {
        info!("feed reconnected");
    }
}
