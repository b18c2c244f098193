//! Multi-stage message-queue router: a broker-driven worker that threads a
//! message packet through an ordered process route, branching, retrying, and
//! aborting as stages report outcomes, while asynchronously persisting
//! request state via its own DB-updates queue and tracking batch fan-out in
//! a KV store.

pub mod batch;
pub mod broker;
pub mod class;
pub mod config;
pub mod db_publisher;
pub mod delay;
pub mod error;
pub mod external;
pub mod packet;
pub mod reference_schema;
pub mod registry;
pub mod router;

pub use broker::{AckOutcome, BrokerError, BrokerPort, Delivery, LapinBroker, QueueCallback};
pub use class::{ClassConfig, ClassKind, ClassRegistry};
pub use config::{ConfigLoader, RouterSettings};
pub use db_publisher::{DbMutation, DbUpdatePublisher, TransactionMode};
pub use delay::{DelayRequest, DelayScheduler};
pub use error::{Result, RouterError};
pub use packet::{MessagePacket, PublishArgs, RetryState, Settings, SitoReturn};
pub use registry::{StageCallback, StageRegistry};
pub use router::{AbortReason, RouterCore};
