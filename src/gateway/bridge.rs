//! Bridge between the room topic and local web clients

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::registry::ClientRegistry;
use crate::network::{ChatTopic, HostError, TopicSubscription};
use crate::types::ChatMessage;
use crate::util::truncate_str;

/// Why the inbound loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundExit {
    /// Shutdown was signalled
    Cancelled,
    /// The subscription failed and will not recover
    SubscriptionFailed(HostError),
}

/// Publishes local lines to the topic and fans topic messages out to clients
pub struct TopicBridge<T: ChatTopic> {
    topic: Arc<T>,
}

impl<T: ChatTopic> TopicBridge<T> {
    pub fn new(topic: Arc<T>) -> Self {
        Self { topic }
    }

    /// Wrap `text` as a message from `from`, stamped now, and publish it once
    pub async fn publish_line(&self, from: &str, text: &str) -> Result<ChatMessage, HostError> {
        let msg = ChatMessage::new(from, text);
        let data = msg
            .to_json()
            .map_err(|e| HostError::Publish(e.to_string()))?
            .into_bytes();

        match self.topic.publish(data).await {
            Ok(()) => {
                debug!("Published \"{}\"", truncate_str(text, 64));
                Ok(msg)
            }
            Err(e) => {
                warn!("Publish failed: {}", e);
                Err(e)
            }
        }
    }
}

/// Decode topic messages and broadcast them until shutdown or the
/// subscription fails. Undecodable payloads are skipped.
pub async fn run_inbound<S: TopicSubscription>(
    mut subscription: S,
    registry: Arc<ClientRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) -> InboundExit {
    loop {
        tokio::select! {
            next = subscription.next_message() => {
                let data = match next {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Topic subscription ended: {}", e);
                        return InboundExit::SubscriptionFailed(e);
                    }
                };

                let msg = match ChatMessage::from_slice(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("Discarding malformed topic message ({} bytes): {}", data.len(), e);
                        continue;
                    }
                };

                let report = registry.broadcast(&msg);
                if report.dropped > 0 {
                    debug!("Message from {} dropped for {} slow clients", msg.sender, report.dropped);
                }
            }
            _ = shutdown.recv() => {
                info!("Topic bridge shutting down");
                return InboundExit::Cancelled;
            }
        }
    }
}
