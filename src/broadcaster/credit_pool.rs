use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{trace, warn};

/// Bounds the number of transmit units that were handed to the transport but not yet reported
///  as sent, independently of the buffer pool.
///
/// A credit goes through three stages: it is acquired (a [Credit] handle owned by the sender),
///  committed when the payload is handed to the transport (the credit is now 'in flight' and
///  identified by a [CreditToken]), and released when the transport reports the send as
///  completed, passing the token back. A [Credit] that is dropped without being committed goes
///  straight back to the pool.
pub struct BufferCreditPool {
    capacity: usize,
    credits: Arc<Semaphore>,
    /// one slot per credit, holding the generation of the token currently in flight there
    slots: Mutex<Vec<Option<u64>>>,
    next_generation: AtomicU64,
    in_flight: AtomicUsize,
}

/// An acquired but not yet committed credit
#[derive(Debug)]
pub struct Credit {
    permit: OwnedSemaphorePermit,
}

/// Identifies one in-flight credit. Releasing a token a second time has no effect.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CreditToken {
    slot: usize,
    generation: u64,
}

impl BufferCreditPool {
    pub fn new(capacity: usize) -> BufferCreditPool {
        BufferCreditPool {
            capacity,
            credits: Arc::new(Semaphore::new(capacity)),
            slots: Mutex::new(vec![None; capacity]),
            next_generation: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_available(&self) -> usize {
        self.credits.available_permits()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits up to `max_wait` for a credit, returning `None` on timeout
    pub async fn acquire(&self, max_wait: Duration) -> Option<Credit> {
        match timeout(max_wait, self.credits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Some(Credit { permit }),
            _ => None,
        }
    }

    /// Marks the credit as in flight: it stays taken until its token is passed to
    ///  [BufferCreditPool::release]
    pub fn commit(&self, credit: Credit) -> CreditToken {
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // a held permit guarantees a free slot
        let slot = slots.iter().position(Option::is_none).unwrap_or(0);
        slots[slot] = Some(generation);
        drop(slots);

        credit.permit.forget();
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("credit committed in slot {}, {} in flight", slot, in_flight);
        CreditToken { slot, generation }
    }

    /// Returns an in-flight credit to the pool. This is called from the transport's send
    ///  completion callback; a token that is not in flight (e.g. a duplicate completion) is
    ///  ignored, so the number of outstanding sends never exceeds the capacity.
    pub fn release(&self, token: CreditToken) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get_mut(token.slot) {
            Some(slot) if *slot == Some(token.generation) => {
                *slot = None;
                drop(slots);
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.credits.add_permits(1);
            }
            _ => {
                warn!("send completion for credit {:?} which is not in flight - ignoring", token);
            }
        }
    }
}
