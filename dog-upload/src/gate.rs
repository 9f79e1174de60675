use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Counting admission gate bounding how many pipelines transfer at once.
///
/// This is the only state shared between pipelines.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held by a pipeline for as long as it is admitted
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot. Returns `None` if `cancel` fires first or the gate
    /// was closed.
    pub async fn admit(&self, cancel: &CancellationToken) -> Option<Admission> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => {
                permit.ok().map(|permit| Admission { _permit: permit })
            }
        }
    }

    /// Refuse all further admissions; pipelines already admitted keep running
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get available slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn admissions_are_bounded() {
        let gate = AdmissionGate::new(2);
        let cancel = CancellationToken::new();

        let a = gate.admit(&cancel).await.unwrap();
        let _b = gate.admit(&cancel).await.unwrap();
        assert_eq!(gate.available(), 0);
        assert_eq!(gate.in_use(), 2);

        let mut waiting = task::spawn(gate.admit(&cancel));
        assert_pending!(waiting.poll());

        drop(a);
        assert!(waiting.is_woken());
        assert!(assert_ready!(waiting.poll()).is_some());
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let gate = AdmissionGate::new(1);
        let holder = CancellationToken::new();
        let _held = gate.admit(&holder).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.admit(&cancel).await.is_none() })
        };
        cancel.cancel();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn closed_gate_admits_nobody() {
        let gate = AdmissionGate::new(3);
        gate.close();
        assert!(gate.admit(&CancellationToken::new()).await.is_none());
    }
}
