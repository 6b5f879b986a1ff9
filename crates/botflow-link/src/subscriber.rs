//! Background telemetry subscriber feeding the [`StatusCache`].

use std::sync::Arc;
use std::time::Duration;

use botflow_types::BotError;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::normalize::parse_telemetry_data;
use crate::protocol::{SubscribeRequest, TELEMETRY_TOPIC, TopicMessage};
use crate::status_cache::StatusCache;
use crate::transport::{Dialer, Transport};

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// `ws://host:port` of the device.
    pub endpoint: String,
    /// Pause between a lost connection and the next dial.
    pub reconnect_delay: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:9090".to_string(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Keeps one long-lived telemetry subscription open and writes every decoded
/// frame into the cache.  Reconnects forever until shut down.
pub struct StatusSubscriber {
    dialer: Arc<dyn Dialer>,
    cache: Arc<StatusCache>,
    config: SubscriberConfig,
}

impl StatusSubscriber {
    pub fn new(dialer: Arc<dyn Dialer>, cache: Arc<StatusCache>, config: SubscriberConfig) -> Self {
        Self {
            dialer,
            cache,
            config,
        }
    }

    /// Run on a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let endpoint = self.config.endpoint.as_str();
        info!(endpoint, "status subscriber started");
        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.session() => outcome,
            };
            if let Err(e) = outcome {
                warn!(
                    endpoint,
                    error = %e,
                    retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                    "telemetry subscription lost"
                );
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        info!(endpoint, "status subscriber stopped");
    }

    /// One connection lifetime: dial, subscribe, then consume frames until
    /// the connection fails.
    async fn session(&self) -> Result<(), BotError> {
        let transport = self.dialer.dial(&self.config.endpoint).await?;
        let result = self.consume(transport.as_ref()).await;
        transport.close().await;
        result
    }

    async fn consume(&self, transport: &dyn Transport) -> Result<(), BotError> {
        transport.send(SubscribeRequest::telemetry().encode()?).await?;
        debug!(endpoint = %self.config.endpoint, topic = TELEMETRY_TOPIC, "subscribed");
        loop {
            let frame = transport.recv().await?;
            self.ingest(&frame);
        }
    }

    /// Decode one frame and update the cache.  Frames that are not status
    /// publications, or that fail to decode, are skipped.
    fn ingest(&self, frame: &str) {
        let message = match serde_json::from_str::<TopicMessage>(frame) {
            Ok(message) if message.op == "publish" && message.topic == TELEMETRY_TOPIC => message,
            Ok(_) => return,
            Err(e) => {
                debug!(error = %e, "ignoring non-topic frame");
                return;
            }
        };
        match parse_telemetry_data(&message.msg.data, Utc::now()) {
            Ok(status) => self.cache.update(status),
            Err(e) => debug!(error = %e, "skipping undecodable telemetry"),
        }
    }
}
