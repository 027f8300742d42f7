//! MQTT transport.
//!
//! A single rumqttc event loop task is the delivery thread: every inbound
//! PUBLISH is matched against the registered topic filters and all matching
//! handlers fire, in registration order, on that task. Handlers must not
//! block; the engine's handlers only decode and push onto a channel.
//!
//! On every CONNACK the transport publishes `online` (retained, QoS 1) to the
//! availability topic and re-issues all known subscriptions, since rumqttc
//! does not resubscribe on its own. The last will is `offline` on the same
//! topic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS,
};
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::error::TransportError;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Callback for inbound messages: `(topic, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Publish/subscribe connection to a broker.
pub trait Transport: Send + Sync {
    /// Subscribe to a topic filter. Subscribing twice is a no-op.
    fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Register a handler for every message matching `filter`.
    fn on_message(&self, filter: &str, handler: MessageHandler);

    /// Queue a publish without waiting for the broker.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;
}

/// MQTT topic filter match with `+` (one level) and `#` (rest) wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}

// ── Route table ─────────────────────────────────────────

struct Route {
    filter: String,
    handler: MessageHandler,
}

/// Filter → handler routes plus the set of active subscriptions.
#[derive(Default)]
pub(crate) struct RouteTable {
    routes: RwLock<Vec<Route>>,
    subscriptions: RwLock<Vec<String>>,
}

impl RouteTable {
    pub(crate) fn add_route(&self, filter: &str, handler: MessageHandler) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Route {
                filter: filter.to_string(),
                handler,
            });
    }

    /// Record a subscription; returns false if it was already known.
    pub(crate) fn add_subscription(&self, filter: &str) -> bool {
        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        if subs.iter().any(|s| s == filter) {
            return false;
        }
        subs.push(filter.to_string());
        true
    }

    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Invoke every handler whose filter matches. Returns how many fired.
    pub(crate) fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        // Clone the matching handlers out so a handler may register routes.
        let matching: Vec<MessageHandler> = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| topic_matches(&r.filter, topic))
            .map(|r| r.handler.clone())
            .collect();

        for handler in &matching {
            handler(topic, payload);
        }
        matching.len()
    }
}

// ── rumqttc transport ───────────────────────────────────

pub struct MqttTransport {
    client: AsyncClient,
    routes: RouteTable,
    availability_topic: String,
    closing: AtomicBool,
}

impl MqttTransport {
    /// Connect to the broker and spawn the delivery loop.
    ///
    /// Fails if the broker does not accept the connection within the
    /// keepalive window; after that, reconnects are rumqttc's business.
    pub async fn start(config: &BridgeConfig) -> anyhow::Result<(Arc<Self>, JoinHandle<()>)> {
        let options = mqtt_options(config);
        let (client, mut eventloop) = AsyncClient::new(options, 256);

        tracing::info!("Connecting to MQTT {}:{}", config.broker, config.port);
        wait_for_connack(&mut eventloop, &config.broker, config.keepalive_secs).await?;
        tracing::info!("Connected to MQTT {}:{}", config.broker, config.port);

        let transport = Arc::new(Self::new(client, config));
        transport.announce_online();

        let delivery = transport.clone();
        let handle = tokio::spawn(async move {
            delivery.run(eventloop).await;
        });

        Ok((transport, handle))
    }

    async fn run(&self, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    let restored = self.on_reconnect();
                    tracing::info!("MQTT reconnected, restored {} subscriptions", restored);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if self.routes.deliver(&publish.topic, &publish.payload) == 0 {
                        tracing::debug!("No handler for {}", publish.topic);
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::info!("MQTT disconnected");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if self.closing.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::error!("MQTT event loop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn new(client: AsyncClient, config: &BridgeConfig) -> Self {
        Self {
            client,
            routes: RouteTable::default(),
            availability_topic: config.availability_topic.clone(),
            closing: AtomicBool::new(false),
        }
    }

    /// Announce `online` and re-issue every known subscription, since
    /// rumqttc does not resubscribe on its own. Returns how many were
    /// re-issued.
    fn on_reconnect(&self) -> usize {
        self.announce_online();
        let mut restored = 0;
        for filter in self.routes.subscriptions() {
            match self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                Ok(()) => restored += 1,
                Err(e) => tracing::error!("MQTT resubscribe {} failed: {}", filter, e),
            }
        }
        restored
    }

    fn announce_online(&self) {
        let msg = availability(&self.availability_topic, PAYLOAD_ONLINE);
        if let Err(e) = self
            .client
            .try_publish(msg.topic, msg.qos, msg.retain, msg.message.to_vec())
        {
            tracing::error!("Failed to publish availability: {}", e);
        }
    }

    /// Publish `offline` and close the connection.
    pub fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let msg = availability(&self.availability_topic, PAYLOAD_OFFLINE);
        if let Err(e) = self
            .client
            .try_publish(msg.topic, msg.qos, msg.retain, msg.message.to_vec())
        {
            tracing::warn!("Failed to publish offline status: {}", e);
        }
        if let Err(e) = self.client.try_disconnect() {
            tracing::warn!("MQTT disconnect failed: {}", e);
        }
    }
}

/// Retained QoS 1 message on the availability topic. Used for the last
/// will and for the `online`/`offline` announcements.
pub(crate) fn availability(topic: &str, payload: &'static str) -> LastWill {
    LastWill::new(topic, payload, QoS::AtLeastOnce, true)
}

pub(crate) fn mqtt_options(config: &BridgeConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id(), &config.broker, config.port);
    options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    options.set_last_will(availability(&config.availability_topic, PAYLOAD_OFFLINE));
    options
}

async fn wait_for_connack(
    eventloop: &mut EventLoop,
    broker: &str,
    secs: u64,
) -> Result<(), TransportError> {
    let connect = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(TransportError::Connect(format!("{:?}", ack.code)))
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }
    };

    tokio::time::timeout(Duration::from_secs(secs), connect)
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            broker: broker.to_string(),
            secs,
        })?
}

impl Transport for MqttTransport {
    fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        if !self.routes.add_subscription(filter) {
            return Ok(());
        }
        tracing::debug!("Subscribing to {}", filter);
        self.client.try_subscribe(filter, QoS::AtMostOnce)?;
        Ok(())
    }

    fn on_message(&self, filter: &str, handler: MessageHandler) {
        self.routes.add_route(filter, handler);
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client.try_publish(topic, qos, retain, payload)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct Published {
        pub topic: String,
        pub payload: Vec<u8>,
        pub qos: QoS,
        pub retain: bool,
    }

    /// In-memory transport: records publishes, delivers injected messages.
    #[derive(Default)]
    pub struct MemoryTransport {
        routes: RouteTable,
        published: Mutex<Vec<Published>>,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Simulate an inbound message from the broker.
        pub fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
            self.routes.deliver(topic, payload)
        }

        pub fn subscriptions(&self) -> Vec<String> {
            self.routes.subscriptions()
        }

        pub fn published(&self) -> Vec<Published> {
            self.published.lock().unwrap().clone()
        }

        pub fn published_json(&self, index: usize) -> serde_json::Value {
            serde_json::from_slice(&self.published()[index].payload).unwrap()
        }
    }

    impl Transport for MemoryTransport {
        fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
            self.routes.add_subscription(filter);
            Ok(())
        }

        fn on_message(&self, filter: &str, handler: MessageHandler) {
            self.routes.add_route(filter, handler);
        }

        fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            qos: QoS,
            retain: bool,
        ) -> Result<(), TransportError> {
            self.published.lock().unwrap().push(Published {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
            Ok(())
        }
    }
}
