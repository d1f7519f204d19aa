use futures::stream::StreamExt;
use redis::Client as RedisClient;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use convrelay_core::models::{ConversationId, ServerId};

use crate::error::{Error, Result};
use crate::events::RoutedEvent;
use crate::rooms::RoomHub;

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Name of the channel partition carrying a conversation's events to the
/// instance that owns it
#[must_use]
pub fn channel_name(server: &ServerId, conversation: &ConversationId) -> String {
    format!("{server}:{conversation}")
}

/// Request to publish a routed event toward the owning instance
#[derive(Debug)]
pub struct PublishRequest {
    pub channel: String,
    pub event: RoutedEvent,
}

/// Redis Pub/Sub transport for cross-instance event delivery.
///
/// Each instance subscribes once, by pattern, to its own channel partition
/// (`"<server_id>:*"`), and publishes inbound events onto the partition of
/// whichever instance the registry names as owner. A message is consumed by
/// at most the one instance whose partition it was addressed to.
///
/// Both halves run on dedicated background tasks so neither request handling
/// nor session fan-out ever waits on the broker. Publishing goes through a
/// bounded queue; a publish that fails is logged and dropped, keeping
/// delivery at-most-once.
pub struct RoutingChannel {
    redis_client: RedisClient,
    hub: Arc<RoomHub>,
    server_id: ServerId,
    cancel_token: CancellationToken,
}

impl RoutingChannel {
    /// Capacity of the publish queue. Events are dropped with a warning when
    /// full (e.g., during a prolonged Redis outage).
    pub const PUBLISH_QUEUE_CAPACITY: usize = 10_000;

    pub fn new(redis_url: &str, hub: Arc<RoomHub>, server_id: ServerId) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url)?;

        Ok(Self {
            redis_client,
            hub,
            server_id,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Get the cancellation token for external shutdown signaling
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Shut down the channel (cancels subscriber and publisher tasks)
    pub fn shutdown(&self) {
        info!("Shutting down routing channel");
        self.cancel_token.cancel();
    }

    /// Start the publisher and subscriber tasks.
    ///
    /// Returns the sender the inbound pipeline enqueues publish requests on.
    pub async fn start(self: Arc<Self>) -> Result<mpsc::Sender<PublishRequest>> {
        let (publish_tx, mut publish_rx) =
            mpsc::channel::<PublishRequest>(Self::PUBLISH_QUEUE_CAPACITY);

        let publish_client = self.redis_client.clone();
        let cancel_publisher = self.cancel_token.clone();

        // Publisher task: drains the queue into Redis, reconnecting with
        // backoff when the connection drops. A request whose publish fails
        // is dropped, not retried.
        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                let mut conn = match timeout(
                    Duration::from_secs(REDIS_TIMEOUT_SECS),
                    publish_client.get_multiplexed_async_connection(),
                )
                .await
                {
                    Ok(Ok(conn)) => {
                        backoff_secs = INITIAL_BACKOFF_SECS;
                        conn
                    }
                    Ok(Err(e)) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Failed to get Redis connection for publishing, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        continue;
                    }
                    Err(_) => {
                        error!(
                            backoff_secs = backoff_secs,
                            "Timed out getting Redis connection for publishing, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        continue;
                    }
                };

                info!("Routing channel publisher (re)connected");

                // Process requests until the connection breaks or we are
                // cancelled
                loop {
                    let req = tokio::select! {
                        () = cancel_publisher.cancelled() => {
                            info!("Routing channel publisher cancelled");
                            return;
                        }
                        req = publish_rx.recv() => req,
                    };

                    let Some(req) = req else {
                        warn!("Publish queue closed, publisher exiting");
                        return;
                    };

                    match Self::publish_event(&mut conn, &req).await {
                        Ok(receivers) => {
                            debug!(
                                channel = %req.channel,
                                receivers = receivers,
                                data_type = %req.event.data_type,
                                "Routed event published"
                            );
                        }
                        Err(e) => {
                            // At-most-once: the event is gone; reconnect for
                            // the ones behind it
                            error!(
                                error = %e,
                                channel = %req.channel,
                                "Failed to publish routed event, dropping it"
                            );
                            break;
                        }
                    }
                }

                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });

        let self_clone = self;
        let cancel_subscriber = self_clone.cancel_token.clone();

        // Subscriber task: holds the pattern subscription for this instance
        // and reconnects with exponential backoff
        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                if cancel_subscriber.is_cancelled() {
                    info!("Routing channel subscriber cancelled");
                    return;
                }

                match self_clone.run_subscriber().await {
                    SubscriberExit::Disconnected => {
                        // Connection was healthy before it dropped; reset
                        // backoff since the server was reachable
                        error!(
                            "Routing channel subscription ended (connection lost), reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Routing channel subscriber failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    () = cancel_subscriber.cancelled() => {
                        info!("Routing channel subscriber cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });

        Ok(publish_tx)
    }

    /// Single-instance delivery loop used when Redis is not configured.
    ///
    /// Publish requests short-circuit straight into the local room hub;
    /// there is no other instance a conversation could be owned by.
    #[must_use]
    pub fn start_local(hub: Arc<RoomHub>) -> mpsc::Sender<PublishRequest> {
        let (publish_tx, mut publish_rx) =
            mpsc::channel::<PublishRequest>(Self::PUBLISH_QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(req) = publish_rx.recv().await {
                let conversation =
                    ConversationId::from_string(req.event.conversation_name.clone());
                let delivered = hub.broadcast(&conversation, &req.event);
                debug!(
                    conversation = %conversation,
                    delivered = delivered,
                    data_type = %req.event.data_type,
                    "Routed event delivered locally"
                );
            }
            info!("Local delivery loop exiting, publish queue closed");
        });

        publish_tx
    }

    /// Run one subscription until it fails or the connection drops.
    ///
    /// Returns `SubscriberExit::Disconnected` if the subscription was
    /// established but the stream then ended, `SubscriberExit::ConnectFailed`
    /// if connecting or subscribing failed.
    async fn run_subscriber(&self) -> SubscriberExit {
        let mut pubsub = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.redis_client.get_async_pubsub(),
        )
        .await
        {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(Error::Redis(format!(
                    "Failed to get Redis Pub/Sub connection: {e}"
                )));
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::Timeout(
                    "getting Redis Pub/Sub connection".to_string(),
                ));
            }
        };

        // One pattern subscription covers every per-conversation sub-channel
        // addressed to this instance
        let pattern = format!("{}:*", self.server_id);
        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.psubscribe(&pattern),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(Error::Redis(format!(
                    "Failed to subscribe to pattern {pattern}: {e}"
                )));
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::Timeout(format!(
                    "subscribing to pattern {pattern}"
                )));
            }
        }

        info!(pattern = %pattern, "Routing channel subscriber connected");

        let mut stream = pubsub.on_message();

        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();

            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Invalid payload");
                    continue;
                }
            };

            self.dispatch(&channel, &payload);
        }

        // Stream returned None: the Redis connection was lost
        SubscriberExit::Disconnected
    }

    /// Hand one received message to the local room hub.
    ///
    /// A message that does not parse is logged and dropped; the broker
    /// offers no redelivery at this layer.
    pub fn dispatch(&self, channel: &str, payload: &str) {
        // Channel is "<server_id>:<conversation>"; the trailing segment
        // names the room
        let Some((_, conversation)) = channel.split_once(':') else {
            warn!(channel = %channel, "Invalid channel format");
            return;
        };

        match serde_json::from_str::<RoutedEvent>(payload) {
            Ok(event) => {
                let conversation = ConversationId::from_string(conversation.to_string());
                let delivered = self.hub.broadcast(&conversation, &event);

                debug!(
                    channel = %channel,
                    conversation = %conversation,
                    delivered = delivered,
                    data_type = %event.data_type,
                    "Routed event dispatched to local sessions"
                );
            }
            Err(e) => {
                warn!(
                    error = %e,
                    channel = %channel,
                    "Failed to parse routed event, dropping"
                );
            }
        }
    }

    /// Publish one routed event, returning the receiver count Redis reports
    async fn publish_event(
        conn: &mut redis::aio::MultiplexedConnection,
        req: &PublishRequest,
    ) -> Result<usize> {
        let payload = serde_json::to_string(&req.event)?;

        let receivers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            redis::cmd("PUBLISH")
                .arg(&req.channel)
                .arg(&payload)
                .query_async(conn),
        )
        .await
        .map_err(|_| Error::Timeout("PUBLISH".to_string()))??;

        Ok(receivers)
    }
}

/// Describes how the subscriber loop exited, enabling proper backoff
/// behavior.
enum SubscriberExit {
    /// The subscription was live and then the stream ended (Redis
    /// disconnected). Backoff resets since the server was reachable.
    Disconnected,
    /// Failed to connect or subscribe. Backoff keeps increasing to avoid
    /// hammering an unavailable server.
    ConnectFailed(Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn routed_event(conversation: &str) -> RoutedEvent {
        RoutedEvent {
            conversation_name: conversation.to_string(),
            data: r#"{"conversation":"x"}"#.to_string(),
            data_type: "new-message-event".to_string(),
            ack_time: Utc::now(),
            publish_time: String::new(),
            message_id: "m-1".to_string(),
        }
    }

    #[test]
    fn test_channel_name() {
        let server = ServerId::from_string("s1".to_string());
        let conversation =
            ConversationId::from_string("projects/p/conversations/c1".to_string());

        assert_eq!(
            channel_name(&server, &conversation),
            "s1:projects/p/conversations/c1"
        );
    }

    #[tokio::test]
    async fn test_dispatch_delivers_to_room() {
        let hub = Arc::new(RoomHub::new());
        let channel = RoutingChannel::new(
            "redis://127.0.0.1:6379",
            hub.clone(),
            ServerId::from_string("s1".to_string()),
        )
        .unwrap();

        let conversation =
            ConversationId::from_string("projects/p/conversations/c1".to_string());
        let mut rx = hub.register("conn1".to_string());
        hub.join("conn1", conversation.clone());

        let payload = serde_json::to_string(&routed_event(conversation.as_str())).unwrap();
        channel.dispatch("s1:projects/p/conversations/c1", &payload);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.conversation_name, conversation.as_str());
        assert_eq!(received.data_type, "new-message-event");
    }

    #[tokio::test]
    async fn test_dispatch_drops_unparseable_payload() {
        let hub = Arc::new(RoomHub::new());
        let channel = RoutingChannel::new(
            "redis://127.0.0.1:6379",
            hub.clone(),
            ServerId::from_string("s1".to_string()),
        )
        .unwrap();

        let conversation =
            ConversationId::from_string("projects/p/conversations/c1".to_string());
        let mut rx = hub.register("conn1".to_string());
        hub.join("conn1", conversation.clone());

        channel.dispatch("s1:projects/p/conversations/c1", "not json");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_delivery_loop() {
        let hub = Arc::new(RoomHub::new());
        let conversation =
            ConversationId::from_string("projects/p/conversations/c1".to_string());
        let mut rx = hub.register("conn1".to_string());
        hub.join("conn1", conversation.clone());

        let publish_tx = RoutingChannel::start_local(hub);
        publish_tx
            .send(PublishRequest {
                channel: "s1:projects/p/conversations/c1".to_string(),
                event: routed_event(conversation.as_str()),
            })
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.conversation_name, conversation.as_str());
    }

    // Integration test requires Redis running
    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_cross_instance_delivery() {
        let redis_url = "redis://127.0.0.1:6379";

        // Two instances with separate hubs, simulating separate replicas
        let hub1 = Arc::new(RoomHub::new());
        let hub2 = Arc::new(RoomHub::new());
        let s1 = ServerId::from_string("it-s1".to_string());
        let s2 = ServerId::from_string("it-s2".to_string());

        let channel1 =
            Arc::new(RoutingChannel::new(redis_url, hub1.clone(), s1.clone()).unwrap());
        let channel2 =
            Arc::new(RoutingChannel::new(redis_url, hub2.clone(), s2.clone()).unwrap());

        let _tx1 = channel1.clone().start().await.unwrap();
        let tx2 = channel2.clone().start().await.unwrap();

        // Wait for subscriptions to establish
        tokio::time::sleep(Duration::from_millis(500)).await;

        let conversation =
            ConversationId::from_string("projects/p/conversations/it-c1".to_string());
        let mut rx = hub1.register("conn1".to_string());
        hub1.join("conn1", conversation.clone());

        // Instance 2 publishes toward instance 1's partition
        tx2.send(PublishRequest {
            channel: channel_name(&s1, &conversation),
            event: routed_event(conversation.as_str()),
        })
        .await
        .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.conversation_name, conversation.as_str());

        // Nothing lands on instance 2's hub
        assert_eq!(hub2.connection_count(), 0);

        channel1.shutdown();
        channel2.shutdown();
    }
}
