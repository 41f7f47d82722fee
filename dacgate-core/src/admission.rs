//! Admission control for the listener
//!
//! A semaphore with one permit per allowed concurrent session. A session
//! holds its permit for its whole life; releasing it wakes the next waiting
//! connection immediately.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Occupancy of one session slot. The slot frees when this is dropped.
#[derive(Debug)]
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Bounded session admission
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    slots: Arc<Semaphore>,
    max_sessions: usize,
    wait: Duration,
}

impl AdmissionGate {
    /// `max_sessions` concurrent sessions; a pending connection waits at
    /// most `wait` for a slot
    pub fn new(max_sessions: usize, wait: Duration) -> Result<Self> {
        if max_sessions == 0 || max_sessions > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_sessions must be between 1 and {}",
                u32::MAX
            )));
        }
        Ok(Self {
            slots: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
            wait,
        })
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn active_sessions(&self) -> usize {
        self.max_sessions - self.slots.available_permits()
    }

    /// Take a slot only if one is free right now
    pub fn try_admit(&self) -> Option<SessionPermit> {
        self.slots
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| SessionPermit { _permit: permit })
    }

    /// Wait up to the admission window for a slot
    pub async fn admit(&self) -> Result<SessionPermit> {
        match tokio::time::timeout(self.wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(SessionPermit { _permit: permit }),
            Ok(Err(_)) => Err(Error::AdmissionRejected),
            Err(_) => Err(Error::AdmissionRejected),
        }
    }

    /// Wait until every session has released its slot, then stop admitting
    pub async fn drain(&self, budget: Duration) -> Result<()> {
        let all = self.max_sessions as u32;
        let permits = tokio::time::timeout(budget, self.slots.acquire_many(all))
            .await
            .map_err(|_| Error::Timeout("waiting for sessions to finish".to_string()))?
            .map_err(|_| Error::AdmissionRejected)?;
        permits.forget();
        self.slots.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_slot_rejects_second_admission() {
        let gate = AdmissionGate::new(1, Duration::from_millis(30)).unwrap();
        let first = gate.admit().await.unwrap();
        assert_eq!(gate.active_sessions(), 1);

        assert!(gate.try_admit().is_none());
        assert!(matches!(gate.admit().await, Err(Error::AdmissionRejected)));

        drop(first);
        assert_eq!(gate.active_sessions(), 0);
        assert!(gate.try_admit().is_some());
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let gate = AdmissionGate::new(1, Duration::from_secs(2)).unwrap();
        let first = gate.admit().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.admit().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_configurable_bound() {
        let gate = AdmissionGate::new(2, Duration::from_millis(10)).unwrap();
        let _a = gate.admit().await.unwrap();
        let _b = gate.admit().await.unwrap();
        assert!(gate.admit().await.is_err());
        assert!(AdmissionGate::new(0, Duration::from_millis(10)).is_err());
    }

    #[tokio::test]
    async fn test_drain_waits_for_sessions() {
        let gate = AdmissionGate::new(1, Duration::from_millis(10)).unwrap();
        let permit = gate.admit().await.unwrap();
        assert!(gate.drain(Duration::from_millis(20)).await.is_err());

        drop(permit);
        gate.drain(Duration::from_millis(200)).await.unwrap();
        assert!(gate.admit().await.is_err());
    }
}
