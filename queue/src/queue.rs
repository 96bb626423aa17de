//! The per-event admission sets and the hysteresis gate.

use crate::pass::{PassClaims, PassError, PassSigner};
use booking_rush_core::{Clock, EventId, UserId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Lifetime of an issued pass.
    pub pass_ttl: Duration,
    /// Arrivals per window at which admission control activates.
    pub threshold_on: usize,
    /// Arrivals per window below which admission control deactivates.
    pub threshold_off: usize,
    /// Users admitted per release.
    pub batch_size: usize,
    /// Width of the arrival-rate window.
    pub arrival_window: Duration,
    /// Expected cadence of the release worker; input to the ETA estimate.
    pub release_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pass_ttl: Duration::from_secs(300),
            threshold_on: 1000,
            threshold_off: 200,
            batch_size: 100,
            arrival_window: Duration::from_secs(1),
            release_interval: Duration::from_secs(5),
        }
    }
}

/// A user's place in the queue, returned on join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTicket {
    /// Event joined.
    pub event_id: EventId,
    /// Who joined.
    pub user_id: UserId,
    /// When they joined; the FIFO sort key.
    pub joined_at: DateTime<Utc>,
    /// 1-based rank in the queue.
    pub position: usize,
    /// Rough wait estimate given the release cadence.
    pub eta: Duration,
    /// Signed membership receipt.
    pub token: String,
}

/// A short-lived admission pass handed to a released user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedPass {
    /// Pass holder.
    pub user_id: UserId,
    /// The signed token to present in `X-Queue-Pass`.
    pub token: String,
    /// When the pass stops admitting.
    pub expires_at: DateTime<Utc>,
}

/// Answer to a position query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionInfo {
    /// 1-based rank while waiting; 0 once a pass is issued.
    pub position: usize,
    /// Users currently waiting.
    pub total_in_queue: usize,
    /// The pass, once issued and not yet consumed.
    pub pass: Option<IssuedPass>,
}

/// Why a join was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// The user already has an active ticket for this event.
    #[error("user already queued for this event")]
    AlreadyQueued,
}

/// Snapshot of the admission gate after recording an arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionState {
    /// Whether queue passes are currently required.
    pub active: bool,
    /// Arrivals observed inside the current window.
    pub arrivals_in_window: usize,
}

#[derive(Debug, Clone)]
struct PassState {
    nonce: String,
    expires_at: DateTime<Utc>,
    consumed: bool,
}

#[derive(Default)]
struct EventQueue {
    /// FIFO by join time, ties broken by user id.
    waiting: BTreeMap<(DateTime<Utc>, UserId), ()>,
    members: HashMap<UserId, DateTime<Utc>>,
    passes: HashMap<UserId, PassState>,
    arrivals: VecDeque<DateTime<Utc>>,
    active: bool,
}

impl EventQueue {
    fn rank(&self, joined_at: DateTime<Utc>, user_id: UserId) -> usize {
        self.waiting
            .range(..=(joined_at, user_id))
            .count()
    }

    fn prune_arrivals(&mut self, now: DateTime<Utc>, window: Duration) {
        let Ok(window) = chrono::Duration::from_std(window) else {
            return;
        };
        let cutoff = now - window;
        while self.arrivals.front().is_some_and(|t| *t < cutoff) {
            self.arrivals.pop_front();
        }
    }
}

/// The virtual queue over all events.
///
/// One mutex guards the whole structure; every operation is a short
/// lock-compute-unlock with no suspension points inside.
pub struct VirtualQueue {
    config: QueueConfig,
    signer: PassSigner,
    clock: Arc<dyn Clock>,
    events: Mutex<HashMap<EventId, EventQueue>>,
}

impl VirtualQueue {
    /// Creates a queue signing passes with `secret`.
    #[must_use]
    pub fn new(config: QueueConfig, secret: impl Into<Vec<u8>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            signer: PassSigner::new(secret),
            clock,
            events: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventId, EventQueue>> {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Joins the queue for `event_id`.
    ///
    /// # Errors
    ///
    /// [`JoinError::AlreadyQueued`] if the user already holds a ticket or
    /// an unconsumed pass for this event.
    pub fn join(&self, event_id: EventId, user_id: UserId) -> Result<QueueTicket, JoinError> {
        let now = self.clock.now();
        let mut events = self.lock();
        let queue = events.entry(event_id).or_default();

        if queue.members.contains_key(&user_id)
            || queue
                .passes
                .get(&user_id)
                .is_some_and(|p| !p.consumed && p.expires_at > now)
        {
            return Err(JoinError::AlreadyQueued);
        }

        queue.waiting.insert((now, user_id), ());
        queue.members.insert(user_id, now);
        let position = queue.rank(now, user_id);

        // Membership receipt; its nonce is never registered as a pass, so
        // it cannot be replayed into the reservation path.
        let token = self
            .signer
            .sign(&PassClaims {
                event_id,
                user_id,
                nonce: PassSigner::nonce(),
                expires_at: now + chrono::Duration::hours(24),
            })
            .unwrap_or_default();

        let batches_ahead = position.div_ceil(self.config.batch_size.max(1));
        let eta = self
            .config
            .release_interval
            .saturating_mul(u32::try_from(batches_ahead).unwrap_or(u32::MAX));

        tracing::debug!(%event_id, %user_id, position, "user joined queue");
        Ok(QueueTicket {
            event_id,
            user_id,
            joined_at: now,
            position,
            eta,
            token,
        })
    }

    /// The user's current position, or `None` if they are not queued.
    #[must_use]
    pub fn position(&self, event_id: EventId, user_id: UserId) -> Option<PositionInfo> {
        let now = self.clock.now();
        let mut events = self.lock();
        let queue = events.get_mut(&event_id)?;

        if let Some(pass) = queue.passes.get(&user_id) {
            if !pass.consumed && pass.expires_at > now {
                let token = self
                    .signer
                    .sign(&PassClaims {
                        event_id,
                        user_id,
                        nonce: pass.nonce.clone(),
                        expires_at: pass.expires_at,
                    })
                    .ok()?;
                return Some(PositionInfo {
                    position: 0,
                    total_in_queue: queue.waiting.len(),
                    pass: Some(IssuedPass {
                        user_id,
                        token,
                        expires_at: pass.expires_at,
                    }),
                });
            }
        }

        let joined_at = *queue.members.get(&user_id)?;
        if !queue.waiting.contains_key(&(joined_at, user_id)) {
            return None;
        }
        Some(PositionInfo {
            position: queue.rank(joined_at, user_id),
            total_in_queue: queue.waiting.len(),
            pass: None,
        })
    }

    /// Removes a waiting user. Returns whether anything was removed.
    pub fn leave(&self, event_id: EventId, user_id: UserId) -> bool {
        let mut events = self.lock();
        let Some(queue) = events.get_mut(&event_id) else {
            return false;
        };
        let Some(joined_at) = queue.members.remove(&user_id) else {
            return false;
        };
        queue.waiting.remove(&(joined_at, user_id)).is_some()
    }

    /// Pops the head of the queue and issues each released user a pass.
    pub fn release_batch(&self, event_id: EventId) -> Vec<IssuedPass> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.config.pass_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let mut events = self.lock();
        let Some(queue) = events.get_mut(&event_id) else {
            return Vec::new();
        };

        let head: Vec<(DateTime<Utc>, UserId)> = queue
            .waiting
            .keys()
            .take(self.config.batch_size.max(1))
            .copied()
            .collect();

        let mut issued = Vec::with_capacity(head.len());
        for key in head {
            queue.waiting.remove(&key);
            let (_, user_id) = key;
            let nonce = PassSigner::nonce();
            let expires_at = now + ttl;
            let Ok(token) = self.signer.sign(&PassClaims {
                event_id,
                user_id,
                nonce: nonce.clone(),
                expires_at,
            }) else {
                continue;
            };
            queue.passes.insert(
                user_id,
                PassState {
                    nonce,
                    expires_at,
                    consumed: false,
                },
            );
            issued.push(IssuedPass {
                user_id,
                token,
                expires_at,
            });
        }

        if !issued.is_empty() {
            tracing::info!(%event_id, released = issued.len(), "released queue batch");
            metrics::counter!("queue.passes.issued").increment(issued.len() as u64);
        }
        issued
    }

    /// Validates and consumes a pass presented on the reservation path.
    ///
    /// # Errors
    ///
    /// Any [`PassError`]: bad structure or signature, expiry, wrong
    /// subject, unknown to this queue, or already consumed.
    pub fn validate_pass(
        &self,
        event_id: EventId,
        user_id: UserId,
        token: &str,
    ) -> Result<(), PassError> {
        let now = self.clock.now();
        let claims = self.signer.verify(token, now)?;
        if claims.event_id != event_id || claims.user_id != user_id {
            return Err(PassError::WrongSubject);
        }

        let mut events = self.lock();
        let queue = events.get_mut(&event_id).ok_or(PassError::Unknown)?;
        let pass = queue.passes.get_mut(&user_id).ok_or(PassError::Unknown)?;
        if pass.nonce != claims.nonce {
            return Err(PassError::Unknown);
        }
        if pass.consumed {
            return Err(PassError::Consumed);
        }
        if pass.expires_at <= now {
            return Err(PassError::Expired);
        }
        pass.consumed = true;
        queue.members.remove(&user_id);
        Ok(())
    }

    /// Records an arrival for the event and returns the admission state,
    /// applying on/off hysteresis.
    pub fn record_arrival(&self, event_id: EventId) -> AdmissionState {
        let now = self.clock.now();
        let mut events = self.lock();
        let queue = events.entry(event_id).or_default();

        queue.arrivals.push_back(now);
        queue.prune_arrivals(now, self.config.arrival_window);
        let arrivals = queue.arrivals.len();

        if !queue.active && arrivals >= self.config.threshold_on {
            queue.active = true;
            tracing::info!(%event_id, arrivals, "admission control activated");
        } else if queue.active && arrivals < self.config.threshold_off {
            queue.active = false;
            tracing::info!(%event_id, arrivals, "admission control deactivated");
        }

        AdmissionState {
            active: queue.active,
            arrivals_in_window: arrivals,
        }
    }

    /// Whether admission control is currently active for the event.
    #[must_use]
    pub fn is_active(&self, event_id: EventId) -> bool {
        self.lock().get(&event_id).is_some_and(|q| q.active)
    }

    /// Users currently waiting for the event.
    #[must_use]
    pub fn depth(&self, event_id: EventId) -> usize {
        self.lock().get(&event_id).map_or(0, |q| q.waiting.len())
    }

    /// Events with at least one waiting user; the release worker's
    /// iteration set.
    #[must_use]
    pub fn events_with_waiting(&self) -> Vec<EventId> {
        self.lock()
            .iter()
            .filter(|(_, q)| !q.waiting.is_empty())
            .map(|(event_id, _)| *event_id)
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use booking_rush_testing::test_clock;

    fn queue_with(config: QueueConfig) -> (VirtualQueue, Arc<booking_rush_testing::MockClock>) {
        let clock = Arc::new(test_clock());
        (
            VirtualQueue::new(config, "queue-secret", clock.clone()),
            clock,
        )
    }

    fn small_config() -> QueueConfig {
        QueueConfig {
            pass_ttl: Duration::from_secs(300),
            threshold_on: 3,
            threshold_off: 2,
            batch_size: 2,
            arrival_window: Duration::from_secs(1),
            release_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn join_is_fifo_with_user_id_tiebreak() {
        let (queue, clock) = queue_with(small_config());
        let event = EventId::new();

        let first = queue.join(event, UserId::new()).unwrap();
        assert_eq!(first.position, 1);

        clock.advance(chrono::Duration::milliseconds(1));
        let second = queue.join(event, UserId::new()).unwrap();
        assert_eq!(second.position, 2);

        // Same instant: ordered by user id.
        let low = UserId::from_uuid(uuid::Uuid::nil());
        let ticket = queue.join(event, low).unwrap();
        assert_eq!(ticket.position, 3);
    }

    #[test]
    fn double_join_is_rejected() {
        let (queue, _clock) = queue_with(small_config());
        let event = EventId::new();
        let user = UserId::new();

        queue.join(event, user).unwrap();
        assert_eq!(queue.join(event, user), Err(JoinError::AlreadyQueued));
    }

    #[test]
    fn release_pops_head_in_order_and_position_reports_pass() {
        let (queue, clock) = queue_with(small_config());
        let event = EventId::new();

        let users: Vec<UserId> = (0..4)
            .map(|_| {
                let user = UserId::new();
                queue.join(event, user).unwrap();
                clock.advance(chrono::Duration::milliseconds(1));
                user
            })
            .collect();

        let released = queue.release_batch(event);
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].user_id, users[0]);
        assert_eq!(released[1].user_id, users[1]);

        // Released users report position 0 with a pass attached.
        let info = queue.position(event, users[0]).unwrap();
        assert_eq!(info.position, 0);
        assert!(info.pass.is_some());

        // The remaining head moved up.
        let info = queue.position(event, users[2]).unwrap();
        assert_eq!(info.position, 1);
        assert_eq!(info.total_in_queue, 2);
    }

    #[test]
    fn pass_is_single_use() {
        let (queue, _clock) = queue_with(small_config());
        let event = EventId::new();
        let user = UserId::new();
        queue.join(event, user).unwrap();

        let pass = queue.release_batch(event).pop().unwrap();
        queue.validate_pass(event, user, &pass.token).unwrap();
        assert_eq!(
            queue.validate_pass(event, user, &pass.token),
            Err(PassError::Consumed)
        );
    }

    #[test]
    fn pass_expires_by_clock() {
        let (queue, clock) = queue_with(small_config());
        let event = EventId::new();
        let user = UserId::new();
        queue.join(event, user).unwrap();

        let pass = queue.release_batch(event).pop().unwrap();
        clock.advance(chrono::Duration::seconds(301));
        assert_eq!(
            queue.validate_pass(event, user, &pass.token),
            Err(PassError::Expired)
        );
    }

    #[test]
    fn pass_for_another_user_is_rejected() {
        let (queue, _clock) = queue_with(small_config());
        let event = EventId::new();
        let user = UserId::new();
        queue.join(event, user).unwrap();

        let pass = queue.release_batch(event).pop().unwrap();
        assert_eq!(
            queue.validate_pass(event, UserId::new(), &pass.token),
            Err(PassError::WrongSubject)
        );
    }

    #[test]
    fn join_receipt_is_not_a_pass() {
        let (queue, _clock) = queue_with(small_config());
        let event = EventId::new();
        let user = UserId::new();

        let ticket = queue.join(event, user).unwrap();
        assert_eq!(
            queue.validate_pass(event, user, &ticket.token),
            Err(PassError::Unknown)
        );
    }

    #[test]
    fn leave_removes_from_queue() {
        let (queue, _clock) = queue_with(small_config());
        let event = EventId::new();
        let user = UserId::new();
        queue.join(event, user).unwrap();

        assert!(queue.leave(event, user));
        assert!(queue.position(event, user).is_none());
        assert!(!queue.leave(event, user));
    }

    #[test]
    fn admission_hysteresis_activates_and_deactivates() {
        let (queue, clock) = queue_with(small_config());
        let event = EventId::new();

        assert!(!queue.record_arrival(event).active);
        assert!(!queue.record_arrival(event).active);
        // Third arrival inside the window crosses threshold_on = 3.
        assert!(queue.record_arrival(event).active);

        // Stays active between the thresholds.
        assert!(queue.record_arrival(event).active);

        // A quiet window drops below threshold_off = 2.
        clock.advance(chrono::Duration::seconds(5));
        assert!(!queue.record_arrival(event).active);
    }
}
