use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod broker;
mod chat;
mod client;
mod config;
mod error;

use crate::broker::BrokerHandle;
use crate::chat::JoinSchedulerHandle;
use crate::config::load_settings;
use crate::error::Result as AppResult;

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_PKG_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = load_settings()?;
    tracing::info!(
        broker.port = settings.broker.port,
        upstream = %settings.upstream.addr(),
        "configuration loaded"
    );

    let limits = settings.limits.to_limits();
    let scheduler = JoinSchedulerHandle::spawn(limits.join_interval);
    let broker = BrokerHandle::new(settings.upstream.addr(), limits, scheduler);

    let listener = TcpListener::bind(("0.0.0.0", settings.broker.port)).await?;
    tracing::info!(port = settings.broker.port, "listening for clients");
    client::run_listener(listener, broker, settings.broker.pass).await;

    Ok(())
}
