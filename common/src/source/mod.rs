// Document source adapter: the external court-records lookup

pub mod http;
pub mod rate_limit;

pub use http::{HttpDocumentSource, HttpDocumentSourceFactory};
pub use rate_limit::{RateLimitedSourceFactory, RedisRateLimiter};

use crate::errors::AdapterError;
use crate::models::{CaseFields, SearchCriterion};
use async_trait::async_trait;
use tokio::sync::watch;

/// What a lookup returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(CaseFields),
    NotFound,
}

/// A session with the external source
///
/// One worker slot owns one session at a time and never shares it.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Look the criterion up.
    ///
    /// Once `wind_down` fires the source should release what it holds and
    /// return as soon as it can; it may still finish a lookup in progress.
    async fn fetch(
        &self,
        criterion: &SearchCriterion,
        wind_down: &WindDown,
    ) -> Result<FetchOutcome, AdapterError>;

    /// Release session resources before the slot recycles or stops
    async fn close(&self) {}
}

/// Opens fresh sessions for worker slots
#[async_trait]
pub trait DocumentSourceFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn DocumentSource>, AdapterError>;
}

/// Read side of the soft time limit signal
#[derive(Debug, Clone)]
pub struct WindDown {
    rx: watch::Receiver<bool>,
}

/// Write side of the soft time limit signal
#[derive(Debug)]
pub struct WindDownTrigger {
    tx: watch::Sender<bool>,
}

impl WindDown {
    pub fn channel() -> (WindDownTrigger, WindDown) {
        let (tx, rx) = watch::channel(false);
        (WindDownTrigger { tx }, WindDown { rx })
    }

    /// A signal that never fires
    pub fn never() -> WindDown {
        let (_, wind_down) = Self::channel();
        wind_down
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once wind-down has been requested
    pub async fn requested(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Trigger dropped without firing
                std::future::pending::<()>().await;
            }
        }
    }
}

impl WindDownTrigger {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wind_down_fires() {
        let (trigger, wind_down) = WindDown::channel();
        assert!(!wind_down.is_requested());

        let waiter = {
            let wind_down = wind_down.clone();
            tokio::spawn(async move { wind_down.requested().await })
        };
        trigger.fire();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wind-down should resolve")
            .unwrap();
        assert!(wind_down.is_requested());
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let wind_down = WindDown::never();
        let waited = tokio::time::timeout(Duration::from_millis(20), wind_down.requested()).await;
        assert!(waited.is_err());
        assert!(!wind_down.is_requested());
    }
}
