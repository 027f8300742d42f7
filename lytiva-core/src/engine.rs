//! The engine task.
//!
//! Transport handlers run on the delivery loop; they only decode and push
//! [`Inbound`] messages onto an unbounded channel. The engine is the single
//! consumer and the only owner of the shadow directory, dispatcher and topic
//! index, so shadow state is never touched from the delivery loop.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{self, RawMessage};
use crate::config::BridgeConfig;
use crate::directory::ShadowDirectory;
use crate::discovery::{Discovered, DiscoveryRegistry};
use crate::dispatch::{replay_platform, DiscoveryHandler, Dispatcher, Platform};
use crate::error::{CommandError, TransportError};
use crate::router::{route_status, Routed, TopicIndex};
use crate::shadow::Intent;
use crate::state::EntitySink;
use crate::template::TemplateEngine;
use crate::transport::Transport;

pub enum Inbound {
    Discovery(Discovered),
    Status(Value),
    Topic {
        topic: String,
        msg: RawMessage,
    },
    Command {
        target: String,
        intent: Intent,
        reply: Option<oneshot::Sender<Result<(), CommandError>>>,
    },
    RegisterPlatform {
        platform: Platform,
        handler: Box<dyn DiscoveryHandler>,
    },
    Shutdown,
}

/// Cloneable way in for the host.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl EngineHandle {
    /// Run an intent against an entity id (`light.42`) or canonical id (`42`).
    pub async fn command(&self, target: &str, intent: Intent) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::Command {
                target: target.to_string(),
                intent,
                reply: Some(reply),
            })
            .map_err(|_| CommandError::EngineStopped)?;
        rx.await.map_err(|_| CommandError::EngineStopped)?
    }

    /// Add a platform handler; known payloads for that platform are replayed.
    pub fn register_platform(&self, platform: Platform, handler: Box<dyn DiscoveryHandler>) {
        if self
            .tx
            .send(Inbound::RegisterPlatform { platform, handler })
            .is_err()
        {
            tracing::warn!("Engine stopped; {} handler not registered", platform.as_str());
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Inbound::Shutdown);
    }
}

pub struct Engine {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EntitySink>,
    templates: Arc<dyn TemplateEngine>,
    registry: Arc<DiscoveryRegistry>,
    dispatcher: Dispatcher,
    directory: ShadowDirectory,
    topics: TopicIndex,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl Engine {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EntitySink>,
        templates: Arc<dyn TemplateEngine>,
        registry: Arc<DiscoveryRegistry>,
        dispatcher: Dispatcher,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            transport,
            sink,
            templates,
            registry,
            dispatcher,
            directory: ShadowDirectory::new(),
            topics: TopicIndex::new(),
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn directory(&self) -> &ShadowDirectory {
        &self.directory
    }

    /// Subscribe to discovery and status streams.
    pub fn install(&self, config: &BridgeConfig) -> Result<(), TransportError> {
        let discovery_filter = config.discovery_filter();
        let registry = self.registry.clone();
        let tx = self.tx.clone();
        self.transport.on_message(
            &discovery_filter,
            Arc::new(move |topic: &str, payload: &[u8]| {
                if let Some(discovered) = registry.on_discovery_message(topic, payload) {
                    let _ = tx.send(Inbound::Discovery(discovered));
                }
            }),
        );
        self.transport.subscribe(&discovery_filter)?;

        for filter in &config.status_topics {
            let tx = self.tx.clone();
            self.transport.on_message(
                filter,
                Arc::new(move |topic: &str, payload: &[u8]| match codec::decode_json(payload) {
                    Ok(doc) => {
                        let _ = tx.send(Inbound::Status(doc));
                    }
                    Err(e) => tracing::debug!("Status on {}: {}", topic, e),
                }),
            );
            self.transport.subscribe(filter)?;
        }

        tracing::info!(
            "Listening for discovery on {} and status on {:?}",
            discovery_filter,
            config.status_topics
        );
        Ok(())
    }

    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            if !self.process(msg) {
                break;
            }
        }
        tracing::info!("Engine stopped with {} shadows", self.directory.len());
    }

    /// Process everything already queued. Returns how many were handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.rx.try_recv() {
            handled += 1;
            if !self.process(msg) {
                break;
            }
        }
        handled
    }

    /// Returns `false` on shutdown.
    fn process(&mut self, msg: Inbound) -> bool {
        match msg {
            Inbound::Discovery(discovered) => {
                let created = self.dispatcher.dispatch(&discovered, &mut self.directory);
                self.on_new_shadows(created);
            }
            Inbound::Status(doc) => self.on_status(&doc),
            Inbound::Topic { topic, msg } => {
                let updated = self
                    .topics
                    .route(&mut self.directory, &topic, &msg, self.templates.as_ref());
                for id in updated {
                    self.push_state(&id);
                }
            }
            Inbound::Command {
                target,
                intent,
                reply,
            } => {
                let result = self.on_command(&target, &intent);
                if let Err(e) = &result {
                    tracing::warn!("Command {} on {} failed: {}", intent.name(), target, e);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Inbound::RegisterPlatform { platform, handler } => {
                self.dispatcher.register(platform, handler);
                self.replay(platform);
            }
            Inbound::Shutdown => return false,
        }
        true
    }

    fn on_status(&mut self, doc: &Value) {
        match route_status(&mut self.directory, doc) {
            Routed::Applied(ids) => {
                for id in ids {
                    self.push_state(&id);
                }
            }
            Routed::Ignored(ids) => tracing::debug!("Status for {:?} had nothing they use", ids),
            Routed::Unresolved | Routed::NoAddress => {}
        }
    }

    /// Replay stored payloads the late-joining platform is responsible for.
    fn replay(&mut self, platform: Platform) {
        let pending: Vec<Discovered> = self
            .registry
            .entries()
            .into_iter()
            .filter(|d| replay_platform(d) == platform)
            .collect();
        if pending.is_empty() {
            return;
        }
        tracing::debug!("Replaying {} payloads to {}", pending.len(), platform.as_str());

        let mut created = Vec::new();
        for discovered in &pending {
            created.extend(
                self.dispatcher
                    .dispatch_to(platform, discovered, &mut self.directory),
            );
        }
        self.on_new_shadows(created);
    }

    /// Register new shadows with the host and wire up their state topics.
    fn on_new_shadows(&mut self, ids: Vec<String>) {
        for id in ids {
            let (entity_id, state, topics) = match self.directory.get(&id) {
                Some(shadow) => (shadow.entity_id(), shadow.state(), shadow.state_topics()),
                None => continue,
            };
            self.sink.register(&entity_id, &state);

            for topic in topics {
                if !self.topics.add(&topic, &id) {
                    continue;
                }
                let tx = self.tx.clone();
                let key = topic.clone();
                self.transport.on_message(
                    &topic,
                    Arc::new(move |_: &str, payload: &[u8]| {
                        let _ = tx.send(Inbound::Topic {
                            topic: key.clone(),
                            msg: RawMessage::from_bytes(payload),
                        });
                    }),
                );
                if let Err(e) = self.transport.subscribe(&topic) {
                    tracing::error!("Subscribing {} for {} failed: {}", topic, entity_id, e);
                }
            }
        }
    }

    fn push_state(&self, id: &str) {
        if let Some(shadow) = self.directory.get(id) {
            self.sink.update(&shadow.entity_id(), &shadow.state());
        }
    }

    /// `light.42` → `42` when the kind matches; a bare id passes through.
    fn resolve_target(&self, target: &str) -> Option<String> {
        if self.directory.contains(target) {
            return Some(target.to_string());
        }
        let (kind, id) = target.split_once('.')?;
        let shadow = self.directory.get(id)?;
        (shadow.kind().as_str() == kind).then(|| id.to_string())
    }

    fn on_command(&mut self, target: &str, intent: &Intent) -> Result<(), CommandError> {
        let id = self
            .resolve_target(target)
            .ok_or_else(|| CommandError::UnknownEntity(target.to_string()))?;
        let shadow = self
            .directory
            .get_mut(&id)
            .ok_or_else(|| CommandError::UnknownEntity(target.to_string()))?;

        let commands = shadow.encode(intent, self.templates.as_ref())?;
        for command in &commands {
            codec::publish_command(self.transport.as_ref(), command);
        }
        self.push_state(&id);
        Ok(())
    }
}
