//! Dispatch-on-discovery.
//!
//! Handlers are registered per [`Platform`] and invoked from the engine task
//! for every accepted discovery message. Handlers must be idempotent: the
//! registry re-dispatches known ids, and late-joining platforms get a replay.

use std::collections::HashMap;

use crate::directory::ShadowDirectory;
use crate::discovery::{Discovered, DiscoveryPayload};
use crate::shadow::{self, ShadowKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Cover,
    Climate,
    Fan,
    Light,
    /// Switches, sensors, binary sensors and scenes.
    Other,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Cover,
        Platform::Climate,
        Platform::Fan,
        Platform::Light,
        Platform::Other,
    ];

    /// Platform for a discovery topic's component segment.
    pub fn from_component(component: &str) -> Self {
        match component {
            "cover" => Platform::Cover,
            "climate" => Platform::Climate,
            "fan" => Platform::Fan,
            "light" => Platform::Light,
            _ => Platform::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Cover => "cover",
            Platform::Climate => "climate",
            Platform::Fan => "fan",
            Platform::Light => "light",
            Platform::Other => "other",
        }
    }

    /// Shadow kind built for this platform; `Other` depends on the component.
    pub fn shadow_kind(self, component: &str) -> Option<ShadowKind> {
        match self {
            Platform::Cover => Some(ShadowKind::Cover),
            Platform::Climate => Some(ShadowKind::Climate),
            Platform::Fan => Some(ShadowKind::Fan),
            Platform::Light => Some(ShadowKind::Light),
            Platform::Other => ShadowKind::from_component(component).filter(|k| {
                !matches!(
                    k,
                    ShadowKind::Cover | ShadowKind::Climate | ShadowKind::Fan | ShadowKind::Light
                )
            }),
        }
    }
}

type Predicate = fn(&DiscoveryPayload) -> bool;

fn is_cover(p: &DiscoveryPayload) -> bool {
    p.str("device_class")
        .is_some_and(|c| c.contains("cover") || c.contains("curtain"))
}

fn is_climate(p: &DiscoveryPayload) -> bool {
    p.has("mode_state_topic") || p.has("temperature_command_topic")
}

fn is_fan(p: &DiscoveryPayload) -> bool {
    p.has("fan_modes")
}

fn is_light(p: &DiscoveryPayload) -> bool {
    p.has("state_topic") || p.has("command_topic") || p.has("unique_id")
}

/// Shape heuristics, first match wins. Anything unmatched is `Other`.
pub const CLASSIFIERS: [(Predicate, Platform); 4] = [
    (is_cover, Platform::Cover),
    (is_climate, Platform::Climate),
    (is_fan, Platform::Fan),
    (is_light, Platform::Light),
];

pub fn classify(payload: &DiscoveryPayload) -> Platform {
    CLASSIFIERS
        .iter()
        .find(|(matches, _)| matches(payload))
        .map(|(_, platform)| *platform)
        .unwrap_or(Platform::Other)
}

/// Platform a stored payload is replayed to. The announced component wins
/// when it names a shadow kind; shape heuristics decide otherwise.
pub fn replay_platform(discovered: &Discovered) -> Platform {
    match ShadowKind::from_component(&discovered.component) {
        Some(_) => Platform::from_component(&discovered.component),
        None => classify(&discovered.payload),
    }
}

/// Reacts to a discovery message. Returns the id of a newly created shadow.
pub trait DiscoveryHandler: Send {
    fn on_discovered(&self, discovered: &Discovered, directory: &mut ShadowDirectory) -> Option<String>;
}

/// Default add-function: builds the platform's shadow unless one exists.
pub struct ShadowFactory {
    platform: Platform,
}

impl ShadowFactory {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

impl DiscoveryHandler for ShadowFactory {
    fn on_discovered(&self, discovered: &Discovered, directory: &mut ShadowDirectory) -> Option<String> {
        if directory.contains(&discovered.id) {
            tracing::debug!("{} {} already materialized", self.platform.as_str(), discovered.id);
            return None;
        }

        let kind = match self.platform.shadow_kind(&discovered.component) {
            Some(kind) => kind,
            None => {
                tracing::debug!(
                    "No shadow kind for component {} ({})",
                    discovered.component,
                    discovered.id
                );
                return None;
            }
        };

        let shadow = match shadow::build(kind, &discovered.payload) {
            Some(s) => s,
            None => {
                tracing::warn!(
                    "Discovery payload for {} can't back a {} shadow",
                    discovered.id,
                    kind.as_str()
                );
                return None;
            }
        };

        tracing::info!(
            "New {} shadow {} ({})",
            kind.as_str(),
            shadow.id(),
            shadow.identity().name
        );
        let id = shadow.id().to_string();
        directory.insert(shadow);
        Some(id)
    }
}

/// Platform → ordered handlers.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<Platform, Vec<Box<dyn DiscoveryHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`ShadowFactory`] for every platform.
    pub fn with_default_handlers() -> Self {
        let mut dispatcher = Self::new();
        for platform in Platform::ALL {
            dispatcher.register(platform, Box::new(ShadowFactory::new(platform)));
        }
        dispatcher
    }

    pub fn register(&mut self, platform: Platform, handler: Box<dyn DiscoveryHandler>) {
        self.handlers.entry(platform).or_default().push(handler);
    }

    pub fn has_handlers(&self, platform: Platform) -> bool {
        self.handlers.get(&platform).is_some_and(|h| !h.is_empty())
    }

    /// Invoke the handlers for the message's platform, or the `Other` list if
    /// that platform has none. Returns ids of newly created shadows.
    pub fn dispatch(&self, discovered: &Discovered, directory: &mut ShadowDirectory) -> Vec<String> {
        let mut platform = Platform::from_component(&discovered.component);
        if !self.has_handlers(platform) {
            platform = Platform::Other;
        }
        self.dispatch_to(platform, discovered, directory)
    }

    /// Invoke one platform's handlers directly.
    pub fn dispatch_to(
        &self,
        platform: Platform,
        discovered: &Discovered,
        directory: &mut ShadowDirectory,
    ) -> Vec<String> {
        self.handlers
            .get(&platform)
            .map(|handlers| {
                handlers
                    .iter()
                    .filter_map(|h| h.on_discovered(discovered, directory))
                    .collect()
            })
            .unwrap_or_default()
    }
}
