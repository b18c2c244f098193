use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::broker::BrokerPort;
use crate::class::{ClassRegistry, ABORT_SENTINEL, RETRY_SENTINEL};
use crate::db_publisher::DbUpdatePublisher;
use crate::delay::{DelayRequest, DelayScheduler};
use crate::error::{Result, RouterError};
use crate::external::Clock;
use crate::packet::{MessagePacket, PublishArgs, RetryState, SitoReturn};

/// Outcome of locating the next class to dispatch against `history`/
/// `process_route` (§4.3 `getNextClass`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextClass {
    At(usize, String),
    Terminal,
}

/// `getNextClass` (§4.3): given the trace so far and the (possibly
/// retry/abort-spliced) route, returns the next class to dispatch to, or
/// `Terminal` once the route is exhausted. Counts are taken over the full
/// `history`/`route` arrays, as written in the spec — this only resolves
/// correctly because `publishAbort`'s splice always keeps the already-
/// consumed class in the route alongside its retry, so `history` and
/// `route` stay in lockstep (see `locate_class_in_route`).
pub fn replay_history(history: &[String], route: &[String]) -> Result<NextClass> {
    if history.is_empty() {
        return Ok(match route.first() {
            Some(c) => NextClass::At(0, c.clone()),
            None => NextClass::Terminal,
        });
    }

    let last = history.last().unwrap();
    let n_h = history.iter().filter(|c| c == last).count();
    let n_r = route.iter().filter(|c| c == last).count();

    if n_h == 1 {
        let pos = route
            .iter()
            .position(|c| c == last)
            .ok_or_else(|| RouterError::MissingLastInRoute(last.clone()))?;
        return Ok(if pos + 1 >= route.len() {
            NextClass::Terminal
        } else {
            NextClass::At(pos + 1, route[pos + 1].clone())
        });
    }

    if n_r >= n_h {
        let pos = history.len();
        return Ok(if pos >= route.len() {
            NextClass::Terminal
        } else {
            NextClass::At(pos, route[pos].clone())
        });
    }

    Err(RouterError::HistoryDriftedPastRoute {
        class: last.clone(),
        history_count: n_h,
        route_count: n_r,
    })
}

/// Finds where `class_name` — always the class that was just dispatched and
/// is now failing, i.e. `history.last()` — currently sits in `route`. Mirrors
/// `replay_history`'s own classification so the two never disagree: a class
/// seen once so far is at its first (and only) route occurrence; a class
/// seen more than once sits at `history.len() - 1`, the slot the most recent
/// dispatch just filled.
fn locate_class_in_route(route: &[String], history: &[String], class_name: &str) -> Result<usize> {
    let n_h = history.iter().filter(|c| c.as_str() == class_name).count();
    let n_r = route.iter().filter(|c| c.as_str() == class_name).count();

    if n_h <= 1 {
        return route
            .iter()
            .position(|c| c.as_str() == class_name)
            .ok_or_else(|| RouterError::MissingLastInRoute(class_name.to_string()));
    }

    if n_r >= n_h {
        let pos = history.len() - 1;
        if route.get(pos).map(String::as_str) == Some(class_name) {
            return Ok(pos);
        }
    }

    Err(RouterError::HistoryDriftedPastRoute {
        class: class_name.to_string(),
        history_count: n_h,
        route_count: n_r,
    })
}

/// `%%ident%%` substitution (§4.3.1) against the packet's own settings
/// fields plus `cargo`. Non-scalar fields serialize to JSON; an unresolved
/// token is logged and left literal. Deliberately hand-rolled rather than
/// pulled in via a regex dependency — the grammar is a single fixed
/// delimiter pair, not worth a new crate.
pub fn expand_macros(source: &str, packet: &MessagePacket) -> String {
    let mut fields = match serde_json::to_value(&packet.settings) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    fields.insert("cargo".to_string(), packet.cargo.clone());

    let mut result = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("%%") {
        result.push_str(&rest[..start]);
        let after_start = &rest[start + 2..];
        let Some(end) = after_start.find("%%") else {
            result.push_str("%%");
            rest = after_start;
            break;
        };
        let ident = &after_start[..end];
        let replacement = match fields.get(ident) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => serde_json::to_string(other).ok(),
            None => None,
        };
        match replacement {
            Some(text) => result.push_str(&text),
            None => {
                log::warn!("router: macro %%{}%% did not resolve, leaving literal", ident);
                result.push_str("%%");
                result.push_str(ident);
                result.push_str("%%");
            }
        }
        rest = &after_start[end + 2..];
    }
    result.push_str(rest);
    result
}

/// What triggered a `publishAbort` call, in priority order for composing
/// `request_status_detail` (§4.3): an explicit `sito_return`, literal text
/// (itself macro-expanded), or a lookup by name against the out-of-scope
/// `MessageTextSource` collaborator.
pub enum AbortReason {
    SitoReturn(SitoReturn),
    MessageText(String),
    MessageName(String),
}

/// The router's own operations (§4.3), holding handles to every other
/// component as `Arc`s so cloning a `RouterCore` into a stage callback is
/// cheap (§9 "inheritance of stage libraries" → composition, not a base
/// class). Stateless between calls: the in-flight packet is always passed
/// in, never held internally.
#[derive(Clone)]
pub struct RouterCore {
    classes: Arc<ClassRegistry>,
    broker: Arc<dyn BrokerPort>,
    delay: Arc<DelayScheduler>,
    db: Arc<DbUpdatePublisher>,
    clock: Arc<dyn Clock>,
    cargo_key: String,
    settings_key: String,
}

impl RouterCore {
    pub fn new(
        classes: Arc<ClassRegistry>,
        broker: Arc<dyn BrokerPort>,
        delay: Arc<DelayScheduler>,
        db: Arc<DbUpdatePublisher>,
        clock: Arc<dyn Clock>,
        cargo_key: impl Into<String>,
        settings_key: impl Into<String>,
    ) -> Self {
        Self {
            classes,
            broker,
            delay,
            db,
            clock,
            cargo_key: cargo_key.into(),
            settings_key: settings_key.into(),
        }
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn cargo_key(&self) -> &str {
        &self.cargo_key
    }

    pub fn settings_key(&self) -> &str {
        &self.settings_key
    }

    /// Begins a flow on a `work`-kind class (§4.3 `publishStart`).
    pub async fn publish_start(
        &self,
        class_name: &str,
        cargo: Value,
        initial_settings: Option<crate::packet::Settings>,
    ) -> Result<MessagePacket> {
        if cargo.is_null() {
            return Err(RouterError::MissingInput("cargo".to_string()));
        }
        let class = self.classes.work_class(class_name)?;
        let route = class
            .process_route
            .clone()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| RouterError::NoProcessRoute(class_name.to_string()))?;

        let mut settings = initial_settings.unwrap_or_default();
        settings.process_route = route;
        settings.history = Vec::new();
        settings.retry_ready = false;
        if settings.record_id.is_none() {
            settings.record_id = Some(uuid::Uuid::new_v4().to_string());
        }
        if settings.task_start.is_none() {
            settings.task_start = Some(self.clock.now_epoch());
        }

        let mut packet = MessagePacket::new(cargo, settings);
        self.publish_next(&mut packet, None).await?;
        Ok(packet)
    }

    async fn dispatch(&self, packet: &mut MessagePacket, class_name: &str, args: PublishArgs, delay: Option<i64>) -> Result<()> {
        let exchange = expand_macros(&args.exchange, packet);
        let routing_key = expand_macros(&args.routing_key, packet);

        packet.settings.history.push(class_name.to_string());
        let payload = packet.encode(&self.cargo_key, &self.settings_key)?;

        match delay {
            Some(seconds) => {
                let min_delay = self.classes.get(class_name).and_then(|c| c.min_delay);
                self.delay
                    .schedule(DelayRequest::AfterSeconds(seconds), &exchange, &routing_key, payload, min_delay)
                    .await?;
                log::info!("router: scheduled {} to {}/{} in {:?}s", class_name, exchange, routing_key, delay);
            }
            None => {
                self.broker.publish(&exchange, &routing_key, &payload).await.map_err(RouterError::from)?;
                log::info!("router: published {} to {}/{}", class_name, exchange, routing_key);
            }
        }
        Ok(())
    }

    /// Advances one stage (§4.3 `publishNext`). `delay` schedules the hop
    /// through the delay scheduler instead of publishing immediately.
    pub async fn publish_next(&self, packet: &mut MessagePacket, delay: Option<i64>) -> Result<()> {
        let next = replay_history(&packet.settings.history, &packet.settings.process_route)?;
        let class_name = match next {
            NextClass::Terminal => {
                log::info!("router: normal end for record {:?}", packet.settings.record_id);
                return Ok(());
            }
            NextClass::At(_, name) => name,
        };

        let args = packet.settings.route_args.get(&class_name).cloned().unwrap_or_else(|| {
            self.classes
                .get(&class_name)
                .map(|c| c.default_publish_args())
                .unwrap_or_else(|| PublishArgs { exchange: String::new(), routing_key: class_name.clone() })
        });

        self.dispatch(packet, &class_name, args, delay).await
    }

    /// Sidebar publish to a `notify`-kind class (§4.3 `publishNotify`).
    /// Splices `class_name` into the route at the current position first so
    /// the history/route prefix invariant still holds after this hop.
    pub async fn publish_notify(&self, packet: &mut MessagePacket, class_name: &str, route_key: Option<String>) -> Result<()> {
        let class = self.classes.notify_class(class_name)?.clone();
        let next = replay_history(&packet.settings.history, &packet.settings.process_route)?;
        let insert_pos = match next {
            NextClass::Terminal => packet.settings.process_route.len(),
            NextClass::At(pos, _) => pos,
        };
        packet.settings.process_route.insert(insert_pos, class_name.to_string());

        let args = PublishArgs {
            exchange: class.exchange.clone(),
            routing_key: route_key.unwrap_or_else(|| class.queue.clone().unwrap_or_default()),
        };
        self.dispatch(packet, class_name, args, None).await
    }

    /// Inserts `class_name` immediately before the next class in the route
    /// (§4.3 `setBranchClass`). Purely a route edit; the next `publishNext`
    /// call is what actually dispatches to it.
    pub fn set_branch_class(&self, packet: &mut MessagePacket, class_name: &str, publish_args: Option<PublishArgs>) -> Result<()> {
        let next = replay_history(&packet.settings.history, &packet.settings.process_route)?;
        let insert_pos = match next {
            NextClass::Terminal => packet.settings.process_route.len(),
            NextClass::At(pos, _) => pos,
        };
        packet.settings.process_route.insert(insert_pos, class_name.to_string());
        if let Some(args) = publish_args {
            packet.settings.route_args.insert(class_name.to_string(), args);
        }
        Ok(())
    }

    /// Diverts to retry or abort (§4.3 `publishAbort`). Retries while the
    /// class's `retry_max` allows it and the stage marked `retry_ready`;
    /// otherwise splices in the class's abort route.
    pub async fn publish_abort(
        &self,
        packet: &mut MessagePacket,
        class_name: &str,
        reason: AbortReason,
        request_status: Option<String>,
        expires: Option<i64>,
    ) -> Result<()> {
        let class = self
            .classes
            .get(class_name)
            .cloned()
            .ok_or_else(|| RouterError::UnknownWorkClass(class_name.to_string()))?;

        let retry_state = packet.settings.retry_state.get(class_name).cloned().unwrap_or_default();
        let retry_max = class.retry_max.unwrap_or(0);
        let will_retry = retry_max > 0 && packet.settings.retry_ready && retry_state.retry_count < retry_max;

        let pos = locate_class_in_route(&packet.settings.process_route, &packet.settings.history, class_name)?;

        // `a` keeps the failing class itself (`..=pos`): the route must still
        // record that it was consumed, or history stops being a prefix of
        // route (§3.1) the moment the sentinel is spliced in. `b` still
        // starts at `pos` (§4.3): the failing class reappears right after
        // the sentinel so the next dispatch retries it.
        let a: Vec<String> = packet.settings.process_route[..=pos].to_vec();
        let b: Vec<String> = packet.settings.process_route[pos..]
            .iter()
            .filter(|c| c.as_str() != RETRY_SENTINEL)
            .cloned()
            .collect();

        let delay_seconds;
        let sentinel;
        let mut new_route = a;
        if will_retry {
            sentinel = RETRY_SENTINEL;
            new_route.push(sentinel.to_string());
            new_route.extend(b);

            let mut state = retry_state;
            state.retry_count += 1;
            state.retry_history.push(class_name.to_string());
            packet.settings.retry_state.insert(class_name.to_string(), state);
            delay_seconds = class.retry_seconds.map(|s| s as i64);
        } else {
            sentinel = ABORT_SENTINEL;
            new_route.push(sentinel.to_string());
            new_route.extend(class.abort_route_or_default());
            delay_seconds = None;
        }

        packet.settings.process_route = new_route;
        packet.settings.history.push(sentinel.to_string());

        let message_text = match &reason {
            AbortReason::SitoReturn(sr) => sr.description.clone(),
            AbortReason::MessageText(text) => expand_macros(text, packet),
            AbortReason::MessageName(name) => {
                log::warn!("router: message_name lookup for {} has no MessageTextSource configured", name);
                format!("stage {} aborted", class_name)
            }
        };
        packet.settings.request_status_detail = Some(message_text);

        if let AbortReason::SitoReturn(sr) = &reason {
            packet.settings.sito_return = Some(sr.clone());
        }

        let mut status = request_status
            .or_else(|| packet.settings.abort_status.clone())
            .unwrap_or_else(|| "ABORTED".to_string());
        if will_retry {
            status.push_str("_RETRY");
        }
        packet.settings.request_status = Some(status);

        self.db
            .publish_db_with_request(packet, &[], Some(class_name), false, None, expires)
            .await?;

        self.publish_next(packet, delay_seconds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use crate::class::{ClassConfig, ClassKind};
    use crate::external::FixedClock;
    use crate::packet::Settings;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBroker {
        published: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl BrokerPort for FakeBroker {
        async fn declare_topology(&self, _classes: &ClassRegistry) -> std::result::Result<(), BrokerError> {
            Ok(())
        }

        async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> std::result::Result<(), BrokerError> {
            self.published.lock().unwrap().push((exchange.to_string(), routing_key.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn make_core(broker: Arc<FakeBroker>) -> RouterCore {
        let classes = ClassRegistry::new(vec![
            ClassConfig {
                name: "W".into(),
                kind: Some(ClassKind::Work),
                exchange: "work_exchange".into(),
                process_route: Some(vec!["A".into(), "B".into(), "C".into()]),
                retry_max: Some(0),
                ..Default::default()
            },
            ClassConfig {
                name: "A".into(),
                kind: Some(ClassKind::Exchange),
                exchange: "ex_a".into(),
                queue: Some("q_a".into()),
                ..Default::default()
            },
            ClassConfig {
                name: "B".into(),
                kind: Some(ClassKind::Exchange),
                exchange: "ex_b".into(),
                queue: Some("q_b".into()),
                retry_max: Some(2),
                retry_seconds: Some(10),
                ..Default::default()
            },
            ClassConfig {
                name: "C".into(),
                kind: Some(ClassKind::Exchange),
                exchange: "ex_c".into(),
                queue: Some("q_c".into()),
                ..Default::default()
            },
            ClassConfig {
                name: "X".into(),
                kind: Some(ClassKind::Exchange),
                exchange: "ex_x".into(),
                queue: Some("q_x".into()),
                ..Default::default()
            },
            ClassConfig {
                name: "RequestResults".into(),
                kind: Some(ClassKind::Exchange),
                exchange: "ex_results".into(),
                queue: Some("q_results".into()),
                ..Default::default()
            },
        ]);

        let broker_port: Arc<dyn BrokerPort> = broker;
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(1_000));
        let delay = Arc::new(DelayScheduler::new(broker_port.clone(), clock.clone(), "delay_exchange"));
        let db = Arc::new(DbUpdatePublisher::new(broker_port.clone(), "db_updates", "db_updates_q", 4));
        RouterCore::new(Arc::new(classes), broker_port, delay, db, clock, "cargo", "settings")
    }

    #[tokio::test]
    async fn s1_happy_path_three_stage_route() {
        let broker = Arc::new(FakeBroker::default());
        let core = make_core(broker.clone());

        let mut packet = core.publish_start("W", Value::String("hello".into()), None).await.unwrap();
        assert!(packet.history_matches_route());
        core.publish_next(&mut packet, None).await.unwrap();
        assert!(packet.history_matches_route());
        core.publish_next(&mut packet, None).await.unwrap();
        assert!(packet.history_matches_route());
        core.publish_next(&mut packet, None).await.unwrap();

        assert_eq!(packet.settings.history, vec!["A", "B", "C"]);
        let published = broker.published.lock().unwrap();
        assert_eq!(published.len(), 3);
        assert_eq!(published[0].0, "ex_a");
        assert_eq!(published[1].0, "ex_b");
        assert_eq!(published[2].0, "ex_c");
    }

    #[tokio::test]
    async fn s2_branch_inserts_class_before_next_hop() {
        let broker = Arc::new(FakeBroker::default());
        let core = make_core(broker.clone());

        let mut packet = core.publish_start("W", Value::String("hello".into()), None).await.unwrap();
        assert_eq!(packet.settings.history, vec!["A"]);

        core.set_branch_class(&mut packet, "X", None).unwrap();
        core.publish_next(&mut packet, None).await.unwrap();
        assert_eq!(packet.settings.history, vec!["A", "X"]);

        core.publish_next(&mut packet, None).await.unwrap();
        core.publish_next(&mut packet, None).await.unwrap();

        assert_eq!(packet.settings.history, vec!["A", "X", "B", "C"]);
        assert!(packet.history_matches_route());
    }

    #[tokio::test]
    async fn s3_retry_then_success_preserves_no_abort() {
        let broker = Arc::new(FakeBroker::default());
        let core = make_core(broker.clone());

        let mut packet = core.publish_start("W", Value::String("hello".into()), None).await.unwrap();
        assert_eq!(packet.settings.history, vec!["A"]);

        core.publish_next(&mut packet, None).await.unwrap();
        assert_eq!(packet.settings.history, vec!["A", "B"]);

        packet.settings.retry_ready = true;
        core.publish_abort(
            &mut packet,
            "B",
            AbortReason::SitoReturn(SitoReturn { code: "E1".into(), description: "transient".into() }),
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(packet.settings.history, vec!["A", "B", "Retry", "B"]);
        assert!(packet.history_matches_route());
        assert_eq!(packet.settings.retry_state.get("B").unwrap().retry_count, 1);

        core.publish_next(&mut packet, None).await.unwrap();
        assert_eq!(packet.settings.history, vec!["A", "B", "Retry", "B", "C"]);
        assert!(!packet.settings.history.contains(&"Abort".to_string()));
        assert!(packet.history_matches_route());
    }

    #[tokio::test]
    async fn s4_retry_exhausted_transitions_to_abort() {
        let broker = Arc::new(FakeBroker::default());
        let core = make_core(broker.clone());

        let mut packet = core.publish_start("W", Value::String("hello".into()), None).await.unwrap();
        core.publish_next(&mut packet, None).await.unwrap();
        packet.settings.retry_ready = true;

        for _ in 0..2 {
            core.publish_abort(
                &mut packet,
                "B",
                AbortReason::SitoReturn(SitoReturn { code: "E1".into(), description: "transient".into() }),
                None,
                None,
            )
            .await
            .unwrap();
            assert!(packet.history_matches_route());
        }
        assert_eq!(packet.settings.retry_state.get("B").unwrap().retry_count, 2);

        core.publish_abort(
            &mut packet,
            "B",
            AbortReason::SitoReturn(SitoReturn { code: "E1".into(), description: "permanent".into() }),
            None,
            None,
        )
        .await
        .unwrap();

        assert!(packet.settings.history.contains(&"Abort".to_string()));
        assert_eq!(packet.settings.request_status.as_deref(), Some("ABORTED"));
        assert!(packet.history_matches_route());

        let retry_count_in_history = packet.settings.history.iter().filter(|c| c.as_str() == "Retry").count();
        assert_eq!(retry_count_in_history, 2);
    }

    #[test]
    fn macro_expansion_substitutes_known_field_and_leaves_unknown_literal() {
        let mut settings = Settings::default();
        settings.record_id = Some("req-42".into());
        let packet = MessagePacket::new(Value::Null, settings);

        let out = expand_macros("id=%%record_id%% unknown=%%nope%%", &packet);
        assert_eq!(out, "id=req-42 unknown=%%nope%%");
    }

    #[test]
    fn macro_expansion_serializes_non_scalar_field() {
        let mut settings = Settings::default();
        settings.extras.insert("x".into(), serde_json::json!({"a": 1}));
        let packet = MessagePacket::new(Value::Null, settings);

        let out = expand_macros("%%x%%", &packet);
        assert_eq!(out, "{\"a\":1}");
    }
}
