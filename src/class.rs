use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};

/// Sentinel route entries the router injects itself; never present in a
/// `ClassRegistry` and never dispatched to a stage callback.
pub const RETRY_SENTINEL: &str = "Retry";
pub const ABORT_SENTINEL: &str = "Abort";
pub const DEFAULT_ABORT_ROUTE: &[&str] = &["RequestResults"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassKind {
    Work,
    Exchange,
    Notify,
}

/// Per-class configuration (§3). `process_route` only applies to `Work`
/// classes; `retry_max`/`retry_seconds` only to `Exchange` classes, per the
/// spec's field grouping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassConfig {
    pub name: String,
    pub kind: Option<ClassKind>,
    pub exchange: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub route_key: Option<String>,
    #[serde(default)]
    pub consume_pm: Option<String>,
    #[serde(default)]
    pub consume_lib: Option<String>,
    #[serde(default)]
    pub process_route: Option<Vec<String>>,
    #[serde(default)]
    pub abort_route: Option<Vec<String>>,
    #[serde(default)]
    pub retry_max: Option<u32>,
    #[serde(default)]
    pub retry_seconds: Option<u64>,
    #[serde(default)]
    pub default_common: Option<String>,
    #[serde(default)]
    pub min_delay: Option<i64>,
}

impl ClassConfig {
    pub fn kind(&self) -> ClassKind {
        self.kind.unwrap_or(ClassKind::Exchange)
    }

    /// `A ++ default_abort_route` default fallback is the single-element
    /// `[RequestResults]` per §3 when the class names none of its own.
    pub fn abort_route_or_default(&self) -> Vec<String> {
        self.abort_route.clone().unwrap_or_else(|| {
            DEFAULT_ABORT_ROUTE.iter().map(|s| s.to_string()).collect()
        })
    }

    /// Publish args derived from this class's own exchange/queue, used when
    /// `settings.route_args` carries no override for the hop (§4.3).
    pub fn default_publish_args(&self) -> crate::packet::PublishArgs {
        crate::packet::PublishArgs {
            exchange: self.exchange.clone(),
            routing_key: self
                .route_key
                .clone()
                .or_else(|| self.queue.clone())
                .unwrap_or_default(),
        }
    }
}

/// Class name → configuration, grouped by kind for fast lookup. Built once by
/// the config loader and read-only afterward (§3 ownership).
#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    classes: HashMap<String, ClassConfig>,
}

impl ClassRegistry {
    pub fn new(classes: Vec<ClassConfig>) -> Self {
        let classes = classes.into_iter().map(|c| (c.name.clone(), c)).collect();
        Self { classes }
    }

    pub fn get(&self, name: &str) -> Option<&ClassConfig> {
        self.classes.get(name)
    }

    pub fn work_class(&self, name: &str) -> Result<&ClassConfig> {
        let cls = self
            .get(name)
            .ok_or_else(|| RouterError::UnknownWorkClass(name.to_string()))?;
        if cls.kind() != ClassKind::Work {
            return Err(RouterError::UnknownWorkClass(name.to_string()));
        }
        Ok(cls)
    }

    pub fn notify_class(&self, name: &str) -> Result<&ClassConfig> {
        let cls = self
            .get(name)
            .ok_or_else(|| RouterError::UnknownNotifyClass(name.to_string()))?;
        if cls.kind() != ClassKind::Notify {
            return Err(RouterError::UnknownNotifyClass(name.to_string()));
        }
        Ok(cls)
    }

    pub fn exchange_class(&self, name: &str) -> Result<&ClassConfig> {
        let cls = self
            .get(name)
            .ok_or_else(|| RouterError::NotExchangeClass(name.to_string()))?;
        if cls.kind() != ClassKind::Exchange {
            return Err(RouterError::NotExchangeClass(name.to_string()));
        }
        Ok(cls)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassConfig> {
        self.classes.values()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
