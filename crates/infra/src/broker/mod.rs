//! Broker backends for the command channel.
//!
//! - `memory://` → [`InMemoryChannel`] (single process)
//! - `redis://`, `rediss://` → [`redis_streams::RedisStreamsChannel`] (feature `redis`)

use std::sync::Arc;

use relaygate_channel::{ChannelError, CommandChannel, InMemoryChannel};
use tracing::info;

use crate::config::{MEMORY_BROKER_URL, RelayConfig};

#[cfg(feature = "redis")]
pub mod redis_streams;

/// Open the broker named by `config.broker_url`.
pub async fn connect(config: &RelayConfig) -> Result<Arc<dyn CommandChannel>, ChannelError> {
    let url = config.broker_url.as_str();

    if url.starts_with(MEMORY_BROKER_URL) {
        info!("using in-process broker");
        return Ok(Arc::new(InMemoryChannel::new()));
    }

    #[cfg(feature = "redis")]
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let options = redis_streams::RedisStreamsOptions::default()
            .with_claim_idle(config.claim_idle)
            .with_poll_interval(config.poll_interval);
        let channel = redis_streams::RedisStreamsChannel::connect(url, options).await?;
        info!(broker = %redact(url), "connected to redis broker");
        return Ok(Arc::new(channel));
    }

    Err(ChannelError::transport(format!(
        "unsupported broker url '{}'",
        redact(url)
    )))
}

/// Strip credentials from a broker URL before it is logged.
pub fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
