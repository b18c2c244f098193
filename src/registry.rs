use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::router::RouterCore;

/// The plugin ABI (§6, §9): "dynamic class loading" becomes a static,
/// compile-time registry mapping class name to callback constructor, instead
/// of loading a module by string at runtime. Each stage owns a `RouterCore`
/// handle (composition, not inheritance) and drives it to branch, notify,
/// retry, or abort before handing back an ack outcome.
#[async_trait]
pub trait StageCallback: Send + Sync {
    /// The class name this callback implements (`consume_pm` in `ClassConfig`).
    fn class_name(&self) -> &str;

    /// Processes one packet already popped off the class's queue. Returning
    /// `Err` never tears down the worker (§7) — callers are expected to have
    /// already converted failures into a `publish_abort` call on `core`
    /// before returning `Ok`; an `Err` here only covers transport-level
    /// failure to even read/act on the packet (e.g. malformed payload).
    async fn process(&self, core: RouterCore, packet: crate::packet::MessagePacket) -> anyhow::Result<()>;
}

/// Class name → stage implementation, built once at process start.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn StageCallback>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self { stages: HashMap::new() }
    }

    pub fn register(&mut self, stage: Arc<dyn StageCallback>) {
        self.stages.insert(stage.class_name().to_string(), stage);
    }

    pub fn get(&self, class_name: &str) -> Option<Arc<dyn StageCallback>> {
        self.stages.get(class_name).cloned()
    }
}
