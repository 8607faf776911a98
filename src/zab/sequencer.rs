//! FIFO admission of client writes by timestamp
//!
//! Each write takes a ticket keyed by its timestamp (ties broken by arrival)
//! and waits until its ticket is the smallest one queued. The ticket is
//! released when the returned [`Admission`] is dropped, including when the
//! handler holding it is cancelled.

use crate::zab::messages::Timestamp;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Safety net against a missed wakeup
const RECHECK_INTERVAL: Duration = Duration::from_millis(100);

type Ticket = (Timestamp, u64);

#[derive(Default)]
pub struct Sequencer {
    queue: Mutex<BTreeSet<Ticket>>,
    arrivals: AtomicU64,
    notify: Notify,
}

/// Proof that a write is at the head of the queue
pub struct Admission<'a> {
    sequencer: &'a Sequencer,
    ticket: Ticket,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.sequencer.release(&self.ticket);
    }
}

impl Admission<'_> {
    pub fn timestamp(&self) -> &Timestamp {
        &self.ticket.0
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, BTreeSet<Ticket>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, ticket: &Ticket) {
        self.queue().remove(ticket);
        self.notify.notify_waiters();
    }

    fn is_head(&self, ticket: &Ticket) -> bool {
        self.queue().first() == Some(ticket)
    }

    /// Number of writes queued or admitted
    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a write and wait for its turn
    pub async fn admit(&self, timestamp: Timestamp) -> Admission<'_> {
        let ticket = (timestamp, self.arrivals.fetch_add(1, Ordering::Relaxed));
        self.queue().insert(ticket.clone());
        let admission = Admission {
            sequencer: self,
            ticket,
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_head(&admission.ticket) {
                tracing::debug!(timestamp = %admission.ticket.0, "Write admitted");
                return admission;
            }
            let _ = tokio::time::timeout(RECHECK_INTERVAL, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_single_write_is_admitted() {
        let seq = Sequencer::new();
        let admission = seq.admit(Timestamp::from(5)).await;
        assert_eq!(admission.timestamp(), &Timestamp::from(5));
        assert_eq!(seq.len(), 1);
        drop(admission);
        assert!(seq.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_admission() {
        let seq = Arc::new(Sequencer::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // hold the head so every later write has to queue
        let gate = seq.admit(Timestamp::from(0)).await;

        let mut handles = Vec::new();
        for ts in [30u64, 10, 20] {
            let seq = seq.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _admission = seq.admit(Timestamp::from(ts)).await;
                order.lock().unwrap().push(ts);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }

        // let all three tickets reach the queue
        while seq.len() < 4 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        drop(gate);

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_ticket() {
        let seq = Arc::new(Sequencer::new());
        let gate = seq.admit(Timestamp::from(1)).await;

        let waiter = {
            let seq = seq.clone();
            tokio::spawn(async move {
                let _admission = seq.admit(Timestamp::from(2)).await;
            })
        };
        while seq.len() < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(seq.len(), 1);

        drop(gate);
        let next = tokio::time::timeout(Duration::from_secs(1), seq.admit(Timestamp::from(3)))
            .await
            .unwrap();
        assert_eq!(next.timestamp(), &Timestamp::from(3));
    }

    #[tokio::test]
    async fn test_fifo_admission_of_nanosecond_timestamps() {
        let seq = Arc::new(Sequencer::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = seq.admit(Timestamp::from(0)).await;

        // the later timestamp queues first
        let mut handles = Vec::new();
        for ts in [1_700_000_000_000_000_002u64, 1_700_000_000_000_000_001] {
            let seq = seq.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _admission = seq.admit(Timestamp::from(ts)).await;
                order.lock().unwrap().push(ts);
            }));
            while seq.len() < handles.len() + 1 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
        drop(gate);

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec![1_700_000_000_000_000_001, 1_700_000_000_000_000_002]
        );
    }
}
