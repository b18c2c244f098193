//! Contracts for collaborators this repository never implements (§6).
//!
//! Stage business logic (phone-vs-segment dispatch, SMS rendering, carrier
//! lookup), the macro-expansion text engine, and the table-diff deploy
//! utility all live outside this crate. These traits document the seams the
//! router expects a deployment to plug in; nothing here has a production
//! body.

use async_trait::async_trait;

/// Injected wall-clock source (§9 design note: replace `SELECT now()` with a
/// stubbable clock). `SystemClock` is the only implementation this crate
/// ships; tests use a `FixedClock`.
pub trait Clock: Send + Sync {
    fn now_epoch(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that always reports the same instant, for deterministic tests of
/// delay rounding and TTL arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_epoch(&self) -> i64 {
        self.0
    }
}

/// Looks up pre-authored business text by name (`message_name` in
/// `publish_abort`, §4.3). Out of scope: this repo only calls through the
/// trait.
#[async_trait]
pub trait MessageTextSource: Send + Sync {
    async fn lookup(
        &self,
        name: &str,
        context: &serde_json::Value,
        system_id: Option<&str>,
        carrier: Option<&str>,
        language: Option<&str>,
    ) -> anyhow::Result<String>;
}

/// Expands a template against a binding map. Distinct from the router's own
/// `%%field%%` substitution (§4.3.1), which is in scope and lives in
/// `router::expand_macros`.
pub trait MacroExpander: Send + Sync {
    fn expand(&self, source: &str, bindings: &serde_json::Value) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemDirectoryEntry {
    pub system_id: String,
    pub system_name: String,
    pub system_csc: String,
}

#[async_trait]
pub trait SystemDirectory: Send + Sync {
    async fn lookup_by_id(&self, system_id: &str) -> anyhow::Result<SystemDirectoryEntry>;
    async fn lookup_by_name(&self, system_name: &str) -> anyhow::Result<SystemDirectoryEntry>;
}

#[async_trait]
pub trait TimeZoneService: Send + Sync {
    async fn map_epoch(&self, epoch: i64, zone: Option<&str>, granularity: &str) -> anyhow::Result<i64>;
    async fn convert_zone(&self, epoch: i64, from_tz: &str, to_tz: &str) -> anyhow::Result<i64>;
}

#[async_trait]
pub trait ApiBridge: Send + Sync {
    async fn post_request(&self, args: serde_json::Value) -> anyhow::Result<()>;
}
