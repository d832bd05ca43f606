//! Lease table: in-flight message leases keyed by message id.
//!
//! Pure state, no I/O and no async. Every operation is one short critical
//! section over a single guarded map; callers that need backend I/O reserve a
//! transition here, release the lock, do the I/O, then come back to finalize
//! or roll back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use leasebus_core::{LeaseError, MessageId};

/// Stand-in for "never" when a deadline would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + duration`, saturating at [`FAR_FUTURE`] from `now`.
pub(crate) fn deadline_after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration.min(FAR_FUTURE))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Lifecycle state of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Delivered, waiting for ack.
    Pending,
    /// Deadline passed; waiting for the backend to redeliver.
    Expired,
    /// Ack reserved. Never visible through [`LeaseTable::snapshot`].
    Acked,
}

/// Point-in-time view of a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub message_id: MessageId,
    pub state: LeaseState,
    pub deadline: Instant,
    pub delivery_count: u32,
}

#[derive(Debug, Clone)]
struct Lease {
    payload: Arc<[u8]>,
    deadline: Instant,
    delivery_count: u32,
    state: LeaseState,
}

/// Outcome of offering a received message to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A fresh Pending lease was created.
    Leased {
        payload: Arc<[u8]>,
        delivery_count: u32,
    },
    /// A lease for this id is already outstanding.
    Duplicate,
    /// The id was dropped as poison earlier.
    Poisoned,
}

/// Proof of a reserved ack; hand it back to finalize or roll back.
#[derive(Debug)]
#[must_use = "a reserved ack must be finalized or rolled back"]
pub struct AckReservation {
    message_id: MessageId,
    prior: LeaseState,
}

impl AckReservation {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

/// Outcome of a deadline extension request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// The requested deadline was not later than the current one.
    Unchanged,
    /// The deadline moved from `previous` to `installed`.
    Extended { previous: Instant, installed: Instant },
}

/// A lease the sweep found past its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// Marked Expired; the backend should make the message visible again.
    Redeliver {
        message_id: MessageId,
        delivery_count: u32,
    },
    /// Removed and tombstoned; redelivery budget exhausted.
    Poison {
        message_id: MessageId,
        payload: Arc<[u8]>,
        delivery_count: u32,
    },
    /// Removed; expired and never came back within the grace period.
    Abandoned {
        message_id: MessageId,
        delivery_count: u32,
    },
}

#[derive(Debug, Default)]
struct Inner {
    leases: HashMap<MessageId, Lease>,
    poisoned: HashSet<MessageId>,
}

/// Concurrent lease store.
#[derive(Debug, Default)]
pub struct LeaseTable {
    inner: Mutex<Inner>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the guard cannot leave a half-applied transition:
    // every mutation below is a single assignment or map operation.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a received message.
    ///
    /// New ids get a lease with `delivery_count = 1`. An id whose previous
    /// lease expired is re-leased with `delivery_count + 1` and the payload of
    /// this receipt.
    pub fn admit(
        &self,
        id: &MessageId,
        payload: Vec<u8>,
        now: Instant,
        ack_window: Duration,
    ) -> Admission {
        let mut inner = self.lock();

        if inner.poisoned.contains(id) {
            return Admission::Poisoned;
        }

        let delivery_count = match inner.leases.get(id) {
            None => 1,
            Some(lease) if lease.state == LeaseState::Expired => lease.delivery_count + 1,
            Some(_) => return Admission::Duplicate,
        };

        let payload: Arc<[u8]> = payload.into();
        inner.leases.insert(
            id.clone(),
            Lease {
                payload: payload.clone(),
                deadline: deadline_after(now, ack_window),
                delivery_count,
                state: LeaseState::Pending,
            },
        );

        Admission::Leased {
            payload,
            delivery_count,
        }
    }

    /// Undo an admission whose handle never reached a consumer.
    pub fn retract(&self, id: &MessageId, delivery_count: u32) {
        let mut inner = self.lock();
        let matches = inner
            .leases
            .get(id)
            .is_some_and(|l| l.state == LeaseState::Pending && l.delivery_count == delivery_count);
        if matches {
            inner.leases.remove(id);
        }
    }

    /// Reserve an ack: Pending or Expired → Acked.
    pub fn reserve_ack(&self, id: &MessageId) -> Result<AckReservation, LeaseError> {
        let mut inner = self.lock();
        match inner.leases.get_mut(id) {
            Some(lease) if lease.state != LeaseState::Acked => {
                let prior = lease.state;
                lease.state = LeaseState::Acked;
                Ok(AckReservation {
                    message_id: id.clone(),
                    prior,
                })
            }
            _ => Err(LeaseError::NotFound(id.clone())),
        }
    }

    /// The backend accepted the ack: drop the lease.
    pub fn finalize_ack(&self, reservation: AckReservation) {
        let mut inner = self.lock();
        let reserved = inner
            .leases
            .get(&reservation.message_id)
            .is_some_and(|l| l.state == LeaseState::Acked);
        if reserved {
            inner.leases.remove(&reservation.message_id);
        }
    }

    /// The backend call failed: restore the state the lease had before.
    pub fn rollback_ack(&self, reservation: AckReservation) {
        let mut inner = self.lock();
        if let Some(lease) = inner.leases.get_mut(&reservation.message_id) {
            if lease.state == LeaseState::Acked {
                lease.state = reservation.prior;
            }
        }
    }

    /// Push a Pending lease's deadline to `max(current, now + duration)`.
    pub fn extend(
        &self,
        id: &MessageId,
        now: Instant,
        duration: Duration,
    ) -> Result<Extension, LeaseError> {
        let mut inner = self.lock();
        let lease = match inner.leases.get_mut(id) {
            Some(lease) if lease.state == LeaseState::Pending => lease,
            _ => return Err(LeaseError::NotFound(id.clone())),
        };

        let requested = deadline_after(now, duration);
        if requested <= lease.deadline {
            return Ok(Extension::Unchanged);
        }

        let previous = lease.deadline;
        lease.deadline = requested;
        Ok(Extension::Extended {
            previous,
            installed: requested,
        })
    }

    /// Restore `previous` if the lease still carries the deadline this
    /// extension installed. A later, larger extension is left alone.
    pub fn rollback_extend(&self, id: &MessageId, previous: Instant, installed: Instant) {
        let mut inner = self.lock();
        // Applies in any state: a concurrent ack may hold the lease and
        // later roll back to Pending.
        if let Some(lease) = inner.leases.get_mut(id) {
            if lease.deadline == installed {
                lease.deadline = previous;
            }
        }
    }

    /// Expire every Pending lease whose deadline is at or before `now`.
    ///
    /// Leases with `delivery_count >= max_retries` are removed and their id
    /// tombstoned so later appearances are ignored. Expired leases whose
    /// message has not come back `grace` after the deadline are removed.
    pub fn sweep(&self, now: Instant, max_retries: u32, grace: Duration) -> Vec<Expiry> {
        let mut inner = self.lock();
        let Inner { leases, poisoned } = &mut *inner;

        let mut expired = Vec::new();
        for (id, lease) in leases.iter_mut() {
            match lease.state {
                LeaseState::Pending if lease.deadline <= now => {}
                LeaseState::Expired if deadline_after(lease.deadline, grace) <= now => {
                    expired.push(Expiry::Abandoned {
                        message_id: id.clone(),
                        delivery_count: lease.delivery_count,
                    });
                    continue;
                }
                _ => continue,
            }

            lease.state = LeaseState::Expired;
            if lease.delivery_count >= max_retries {
                expired.push(Expiry::Poison {
                    message_id: id.clone(),
                    payload: lease.payload.clone(),
                    delivery_count: lease.delivery_count,
                });
            } else {
                expired.push(Expiry::Redeliver {
                    message_id: id.clone(),
                    delivery_count: lease.delivery_count,
                });
            }
        }

        for e in &expired {
            match e {
                Expiry::Poison { message_id, .. } => {
                    leases.remove(message_id);
                    poisoned.insert(message_id.clone());
                }
                Expiry::Abandoned { message_id, .. } => {
                    leases.remove(message_id);
                }
                Expiry::Redeliver { .. } => {}
            }
        }

        expired
    }

    pub fn snapshot(&self, id: &MessageId) -> Option<LeaseSnapshot> {
        let inner = self.lock();
        inner
            .leases
            .get(id)
            .filter(|l| l.state != LeaseState::Acked)
            .map(|l| LeaseSnapshot {
                message_id: id.clone(),
                state: l.state,
                deadline: l.deadline,
                delivery_count: l.delivery_count,
            })
    }

    /// Number of leases not yet acked (Pending or Expired).
    pub fn outstanding(&self) -> usize {
        let inner = self.lock();
        inner
            .leases
            .values()
            .filter(|l| l.state != LeaseState::Acked)
            .count()
    }

    pub fn is_poisoned(&self, id: &MessageId) -> bool {
        self.lock().poisoned.contains(id)
    }

    /// Forget everything (subscription teardown).
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.leases.clear();
        inner.poisoned.clear();
    }
}
