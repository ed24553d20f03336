//! Decision policy port.
//!
//! A policy proposes what a participant would like to do this tick. The
//! proposal is advisory: the matching engine checks physical feasibility on its
//! own, and any fault (timeout, malformed reply, nonsense price) turns into
//! [`Action::Hold`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{Participant, SimTime, TickContext};

/// Proposed action for one participant and tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    #[default]
    Hold,
    /// Sell surplus at `price` per unit.
    OfferSell { price: f64 },
    /// Buy deficit, paying at most `max_price` per unit delivered.
    RequestBuy { max_price: f64 },
}

impl Action {
    /// Checks that any price carried by the action is a usable number.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyFault::Malformed`] for negative or non-finite prices.
    pub fn validate(self) -> Result<Self, PolicyFault> {
        let price = match self {
            Action::Hold => return Ok(self),
            Action::OfferSell { price } => price,
            Action::RequestBuy { max_price } => max_price,
        };
        if price.is_finite() && price >= 0.0 {
            Ok(self)
        } else {
            Err(PolicyFault::Malformed(format!("unusable price {price}")))
        }
    }

    /// Wire label of the action.
    pub fn label(&self) -> &'static str {
        match self {
            Action::Hold => "HOLD",
            Action::OfferSell { .. } => "OFFER_SELL",
            Action::RequestBuy { .. } => "REQUEST_BUY",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Hold => f.write_str("HOLD"),
            Action::OfferSell { price } => write!(f, "OFFER_SELL {price:.2}"),
            Action::RequestBuy { max_price } => write!(f, "REQUEST_BUY {max_price:.2}"),
        }
    }
}

/// Snapshot handed to a policy. Owned so it can cross thread boundaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyRequest {
    pub participant_id: String,
    pub battery_stored: f64,
    pub battery_capacity: f64,
    pub wallet_balance: f64,
    /// Signed net position this tick (kWh).
    pub net_position: f64,
    pub grid_price: f64,
    pub grid_available: bool,
    pub timestamp: SimTime,
}

/// Why a policy call produced no usable action.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyFault {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// A participant whose policy call fell back to hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyFallback {
    pub participant: String,
    pub reason: String,
}

/// Pluggable decision policy.
///
/// Implementations must be shareable across threads: the engine calls every
/// participant's decision in parallel within a tick.
pub trait DecisionPolicy: Send + Sync {
    /// Proposes an action for one participant.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyFault`] when no action could be produced. The engine
    /// treats every fault as hold.
    fn decide(&self, request: &PolicyRequest) -> Result<Action, PolicyFault>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

impl<P: DecisionPolicy + ?Sized> DecisionPolicy for Arc<P> {
    fn decide(&self, request: &PolicyRequest) -> Result<Action, PolicyFault> {
        (**self).decide(request)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

impl<P: DecisionPolicy + ?Sized> DecisionPolicy for Box<P> {
    fn decide(&self, request: &PolicyRequest) -> Result<Action, PolicyFault> {
        (**self).decide(request)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Turns a raw policy reply into the action the engine will use.
pub fn resolve(
    participant: &str,
    reply: Result<Action, PolicyFault>,
) -> (Action, Option<PolicyFallback>) {
    match reply.and_then(Action::validate) {
        Ok(action) => (action, None),
        Err(fault) => (
            Action::Hold,
            Some(PolicyFallback {
                participant: participant.to_string(),
                reason: fault.to_string(),
            }),
        ),
    }
}

/// Parses a textual `"ACTION | reasoning"` reply.
///
/// Accepted actions are `HOLD`, `OFFER_SELL <price>` and
/// `REQUEST_BUY <max_price>`. The older `OFFER_P2P` and `BUY_P2P` keywords are
/// read as their modern equivalents. Matching is case-insensitive and the
/// reasoning part is ignored.
///
/// # Errors
///
/// Returns [`PolicyFault::Malformed`] for anything else.
///
/// # Examples
///
/// ```
/// use microgrid_market::sim::policy::{Action, parse_reply};
///
/// let action = parse_reply("OFFER_SELL 30 | surplus after sunset").unwrap();
/// assert_eq!(action, Action::OfferSell { price: 30.0 });
/// assert_eq!(parse_reply("hold").unwrap(), Action::Hold);
/// assert!(parse_reply("DONATE_MASJID | charity").is_err());
/// ```
pub fn parse_reply(reply: &str) -> Result<Action, PolicyFault> {
    let malformed = || PolicyFault::Malformed(reply.trim().to_string());
    let head = reply.split('|').next().unwrap_or_default().trim();
    let mut words = head.split_whitespace();
    let keyword = words.next().ok_or_else(malformed)?.to_ascii_uppercase();
    let price = words.next().map(str::parse::<f64>);
    if words.next().is_some() {
        return Err(malformed());
    }

    let action = match (keyword.as_str(), price) {
        ("HOLD", None) => Action::Hold,
        ("OFFER_SELL" | "OFFER_P2P", Some(Ok(price))) => Action::OfferSell { price },
        ("REQUEST_BUY" | "BUY_P2P", Some(Ok(max_price))) => Action::RequestBuy { max_price },
        _ => return Err(malformed()),
    };
    action.validate()
}

/// Always holds. Every deficit then falls through to battery and grid.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct HoldPolicy;

impl DecisionPolicy for HoldPolicy {
    fn decide(&self, _request: &PolicyRequest) -> Result<Action, PolicyFault> {
        Ok(Action::Hold)
    }

    fn name(&self) -> &'static str {
        "hold"
    }
}

/// Rule-based trader.
///
/// Producers undercut the grid tariff by `sell_spread`; consumers accept
/// anything up to the grid tariff. During a blackout the grid tariff says
/// nothing, so producers ask `blackout_price` and consumers accept up to
/// `blackout_price + sell_spread`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeuristicPolicy {
    pub sell_spread: f64,
    pub blackout_price: f64,
}

impl Default for HeuristicPolicy {
    fn default() -> Self {
        Self {
            sell_spread: 8.0,
            blackout_price: 35.0,
        }
    }
}

impl HeuristicPolicy {
    fn ask(&self, request: &PolicyRequest) -> f64 {
        if request.grid_available {
            (request.grid_price - self.sell_spread).max(0.0)
        } else {
            self.blackout_price
        }
    }

    fn ceiling(&self, request: &PolicyRequest) -> f64 {
        if request.grid_available {
            request.grid_price
        } else {
            self.blackout_price + self.sell_spread
        }
    }
}

impl DecisionPolicy for HeuristicPolicy {
    fn decide(&self, request: &PolicyRequest) -> Result<Action, PolicyFault> {
        let action = if request.net_position > 0.0 {
            Action::OfferSell {
                price: self.ask(request),
            }
        } else if request.net_position < 0.0 {
            Action::RequestBuy {
                max_price: self.ceiling(request),
            }
        } else {
            Action::Hold
        };
        Ok(action)
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

/// Policies selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BuiltinPolicy {
    Hold(HoldPolicy),
    Heuristic(HeuristicPolicy),
}

impl DecisionPolicy for BuiltinPolicy {
    fn decide(&self, request: &PolicyRequest) -> Result<Action, PolicyFault> {
        match self {
            BuiltinPolicy::Hold(p) => p.decide(request),
            BuiltinPolicy::Heuristic(p) => p.decide(request),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            BuiltinPolicy::Hold(p) => p.name(),
            BuiltinPolicy::Heuristic(p) => p.name(),
        }
    }
}

/// Bounds every call to `inner` by a deadline.
///
/// Each call runs on its own worker thread; if no reply arrives in time the
/// call fails with [`PolicyFault::Timeout`] and the late reply is discarded.
/// A participant whose previous worker has not returned yet is not consulted
/// again: the call times out immediately, so a stuck policy holds at most one
/// worker per participant.
#[derive(Debug)]
pub struct TimedPolicy<P> {
    inner: Arc<P>,
    deadline: Duration,
    in_flight: Arc<Mutex<BTreeSet<String>>>,
}

impl<P> TimedPolicy<P> {
    pub fn new(inner: P, deadline: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            deadline,
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Number of workers still running past their deadline.
    pub fn stalled_workers(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<P: DecisionPolicy + 'static> DecisionPolicy for TimedPolicy<P> {
    fn decide(&self, request: &PolicyRequest) -> Result<Action, PolicyFault> {
        let id = request.participant_id.clone();
        let claimed = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        if !claimed {
            return Err(PolicyFault::Timeout(self.deadline));
        }

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let in_flight = Arc::clone(&self.in_flight);
        let request = request.clone();
        thread::spawn(move || {
            let reply = inner.decide(&request);
            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request.participant_id);
            let _ = tx.send(reply);
        });
        match rx.recv_timeout(self.deadline) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(PolicyFault::Timeout(self.deadline)),
            Err(RecvTimeoutError::Disconnected) => {
                self.in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                Err(PolicyFault::Malformed("policy worker exited without reply".into()))
            }
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Builds the request for one participant from the tick context.
pub(crate) fn request_for(
    ctx: &TickContext,
    participant: &Participant,
    net_position: f64,
) -> PolicyRequest {
    PolicyRequest {
        participant_id: participant.id.clone(),
        battery_stored: participant.battery_stored,
        battery_capacity: participant.battery_capacity,
        wallet_balance: participant.wallet_balance,
        net_position,
        grid_price: ctx.grid_price,
        grid_available: ctx.grid_available,
        timestamp: ctx.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use super::*;

    fn request(net: f64, grid_available: bool) -> PolicyRequest {
        PolicyRequest {
            participant_id: "house_a".into(),
            battery_stored: 8.5,
            battery_capacity: 10.0,
            wallet_balance: 5000.0,
            net_position: net,
            grid_price: 46.0,
            grid_available,
            timestamp: SimTime::hm(18, 0),
        }
    }

    struct SlowPolicy(Duration);

    impl DecisionPolicy for SlowPolicy {
        fn decide(&self, _request: &PolicyRequest) -> Result<Action, PolicyFault> {
            thread::sleep(self.0);
            Ok(Action::OfferSell { price: 1.0 })
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[test]
    fn parses_modern_and_legacy_replies() {
        assert_eq!(
            parse_reply("REQUEST_BUY 40 | evening peak"),
            Ok(Action::RequestBuy { max_price: 40.0 })
        );
        assert_eq!(
            parse_reply("offer_p2p 35"),
            Ok(Action::OfferSell { price: 35.0 })
        );
        assert_eq!(
            parse_reply("BUY_P2P 35 | blackout"),
            Ok(Action::RequestBuy { max_price: 35.0 })
        );
        assert_eq!(parse_reply("  HOLD | nothing to do"), Ok(Action::Hold));
    }

    #[test]
    fn rejects_malformed_replies() {
        for bad in [
            "",
            "OFFER_SELL",
            "OFFER_SELL abc",
            "OFFER_SELL -5",
            "HOLD 3",
            "REQUEST_BUY 3 4",
            "SELL_EVERYTHING | yolo",
        ] {
            assert!(parse_reply(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn resolve_downgrades_faults_to_hold() {
        let (action, fallback) = resolve("b", Err(PolicyFault::Timeout(Duration::from_millis(5))));
        assert_eq!(action, Action::Hold);
        assert_eq!(fallback.map(|f| f.participant), Some("b".to_string()));

        let (action, fallback) = resolve("b", Ok(Action::OfferSell { price: f64::NAN }));
        assert_eq!(action, Action::Hold);
        assert!(fallback.is_some());

        let (action, fallback) = resolve("b", Ok(Action::RequestBuy { max_price: 40.0 }));
        assert_eq!(action, Action::RequestBuy { max_price: 40.0 });
        assert!(fallback.is_none());
    }

    #[test]
    fn heuristic_follows_net_position() {
        let policy = HeuristicPolicy::default();
        assert_eq!(
            policy.decide(&request(2.0, true)),
            Ok(Action::OfferSell { price: 38.0 })
        );
        assert_eq!(
            policy.decide(&request(-1.0, true)),
            Ok(Action::RequestBuy { max_price: 46.0 })
        );
        assert_eq!(policy.decide(&request(0.0, true)), Ok(Action::Hold));
    }

    #[test]
    fn heuristic_uses_blackout_prices_when_grid_down() {
        let policy = HeuristicPolicy::default();
        assert_eq!(
            policy.decide(&request(2.0, false)),
            Ok(Action::OfferSell { price: 35.0 })
        );
        assert_eq!(
            policy.decide(&request(-2.0, false)),
            Ok(Action::RequestBuy { max_price: 43.0 })
        );
    }

    #[test]
    fn timed_policy_times_out_to_fault() {
        let policy = TimedPolicy::new(SlowPolicy(Duration::from_millis(500)), Duration::from_millis(10));
        assert_eq!(
            policy.decide(&request(1.0, true)),
            Err(PolicyFault::Timeout(Duration::from_millis(10)))
        );
    }

    #[test]
    fn stuck_participant_holds_one_worker() {
        struct Counting(Arc<AtomicUsize>);

        impl DecisionPolicy for Counting {
            fn decide(&self, _request: &PolicyRequest) -> Result<Action, PolicyFault> {
                self.0.fetch_add(1, AtomicOrdering::SeqCst);
                thread::sleep(Duration::from_millis(300));
                Ok(Action::Hold)
            }

            fn name(&self) -> &'static str {
                "counting"
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let policy = TimedPolicy::new(Counting(Arc::clone(&calls)), Duration::from_millis(10));
        let timeout = Err(PolicyFault::Timeout(Duration::from_millis(10)));

        for _ in 0..3 {
            assert_eq!(policy.decide(&request(1.0, true)), timeout);
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(policy.stalled_workers(), 1);

        // Once the worker returns the participant is consulted again.
        thread::sleep(Duration::from_millis(600));
        assert_eq!(policy.stalled_workers(), 0);
        assert_eq!(policy.decide(&request(1.0, true)), timeout);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn timed_policy_passes_fast_replies() {
        let policy = TimedPolicy::new(HoldPolicy, Duration::from_secs(5));
        assert_eq!(policy.decide(&request(1.0, true)), Ok(Action::Hold));
        assert_eq!(policy.name(), "hold");
    }

    #[test]
    fn action_serializes_with_tag() {
        let json = serde_json::to_string(&Action::OfferSell { price: 30.0 }).unwrap();
        assert_eq!(json, r#"{"action":"OFFER_SELL","price":30.0}"#);
    }
}
