use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::BrokerPort;
use crate::error::{Result, RouterError};
use crate::external::Clock;

/// Wraps a payload destined for `target_exchange`/`target_route` once its
/// fire epoch arrives. The per-minute delay queue it's published to is
/// expected to be provisioned with a dead-letter exchange pointing back at
/// the router's own ingress topology (broker administration beyond
/// declare/bind is a stated Non-goal, §1) — this scheduler only computes the
/// bucket and publishes into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayEnvelope {
    pub fire_epoch: i64,
    pub target_exchange: String,
    pub target_route: String,
    #[serde(with = "payload_as_string")]
    pub payload: Vec<u8>,
}

mod payload_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        Ok(s.into_bytes())
    }
}

/// Publishes a message that re-enters `target_exchange`/`target_route` at or
/// after a wall-clock epoch (§4.4). Delay epochs are rounded up to minute
/// granularity to bound the number of distinct delay buckets created.
pub struct DelayScheduler {
    broker: Arc<dyn BrokerPort>,
    clock: Arc<dyn Clock>,
    delay_exchange: String,
}

/// How far in the future a delay must reach before it's worth scheduling at
/// all, versus just publishing immediately.
pub enum DelayRequest {
    AtEpoch(i64),
    AfterSeconds(i64),
}

impl DelayScheduler {
    pub fn new(broker: Arc<dyn BrokerPort>, clock: Arc<dyn Clock>, delay_exchange: impl Into<String>) -> Self {
        Self { broker, clock, delay_exchange: delay_exchange.into() }
    }

    fn round_up_to_minute(epoch: i64) -> i64 {
        const MINUTE: i64 = 60;
        ((epoch + MINUTE - 1) / MINUTE) * MINUTE
    }

    /// Schedules `payload` for re-delivery. If the requested delay is below
    /// `min_delay` seconds (a class-local threshold, §4.4), publishes
    /// immediately on `target_exchange`/`target_route` instead of bucketing.
    pub async fn schedule(
        &self,
        request: DelayRequest,
        target_exchange: &str,
        target_route: &str,
        payload: Vec<u8>,
        min_delay: Option<i64>,
    ) -> Result<()> {
        let now = self.clock.now_epoch();
        let target_epoch = match request {
            DelayRequest::AtEpoch(e) => e,
            DelayRequest::AfterSeconds(d) => now + d,
        };
        let delay_secs = target_epoch - now;

        if let Some(min) = min_delay {
            if delay_secs < min {
                log::debug!(
                    "delay: {}s below min_delay={}s, publishing {}/{} immediately",
                    delay_secs, min, target_exchange, target_route
                );
                return self
                    .broker
                    .publish(target_exchange, target_route, &payload)
                    .await
                    .map_err(RouterError::from);
            }
        }

        let fire_epoch = Self::round_up_to_minute(target_epoch);
        let envelope = DelayEnvelope {
            fire_epoch,
            target_exchange: target_exchange.to_string(),
            target_route: target_route.to_string(),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| RouterError::JsonEncodeError(e.to_string()))?;
        let routing_key = format!("delay.{}", fire_epoch);

        log::info!(
            "delay: scheduling {}/{} for epoch {} (bucket {})",
            target_exchange, target_route, fire_epoch, routing_key
        );

        self.broker
            .publish(&self.delay_exchange, &routing_key, &bytes)
            .await
            .map_err(RouterError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_next_minute_boundary() {
        assert_eq!(DelayScheduler::round_up_to_minute(0), 0);
        assert_eq!(DelayScheduler::round_up_to_minute(1), 60);
        assert_eq!(DelayScheduler::round_up_to_minute(60), 60);
        assert_eq!(DelayScheduler::round_up_to_minute(61), 120);
        assert_eq!(DelayScheduler::round_up_to_minute(119), 120);
    }
}
