use thiserror::Error;

/// Every error kind the router surfaces, per the error-handling design (§7).
///
/// Stage-local failures never reach this type directly — a stage callback
/// reports a [`RouterError`] into `publish_abort`, which decides retry vs.
/// abort and never lets the error tear down the consumer loop.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("missing required configuration key: {0}")]
    MissingConfig(String),

    #[error("unknown work class: {0}")]
    UnknownWorkClass(String),

    #[error("unknown notify class: {0}")]
    UnknownNotifyClass(String),

    #[error("class {0} is not an exchange class")]
    NotExchangeClass(String),

    #[error("missing required input: {0}")]
    MissingInput(String),

    #[error("work class {0} has no process route")]
    NoProcessRoute(String),

    #[error("router operation called before packet initialization")]
    OutOfSequence,

    #[error("history for class {class} has drifted past the process route (history_count={history_count}, route_count={route_count})")]
    HistoryDriftedPastRoute {
        class: String,
        history_count: usize,
        route_count: usize,
    },

    #[error("last history entry {0} is not present in the process route")]
    MissingLastInRoute(String),

    #[error("failed to encode packet as JSON: {0}")]
    JsonEncodeError(String),

    #[error("failed to decode packet from JSON: {0}")]
    JsonDecodeError(String),

    #[error("broker topology declaration failed: {0}")]
    BrokerDeclareFailed(String),

    #[error("broker publish failed: {0}")]
    BrokerPublishFailed(String),

    #[error("consumer failed: {0}")]
    ConsumerFailed(String),

    #[error("transaction {0} aborted")]
    TransactionAborted(String),

    #[error("invalid timezone: {0}")]
    TimeZoneInvalid(String),

    #[error("failed to parse time value: {0}")]
    TimeParseError(String),

    #[error("batch {0} re-entry blocked by deliver_condition=ABORT")]
    BatchNotGo(String),

    #[error("stage {class} reported an error: {description}")]
    StageError { class: String, description: String },
}

pub type Result<T> = std::result::Result<T, RouterError>;

impl From<serde_json::Error> for RouterError {
    fn from(e: serde_json::Error) -> Self {
        // Both encode and decode go through serde_json; callers that need to
        // distinguish direction wrap this themselves via `map_err`.
        RouterError::JsonDecodeError(e.to_string())
    }
}
