//! Control loop that keeps an owner converged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::cancel::CancelToken;
use crate::config::ControllerConfig;
use crate::engine::{Engine, ReconcileResult};
use crate::error::ReconcileError;
use crate::object::OwnerRef;

/// Exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Delay before the next attempt; counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Runs reconciliation passes for one owner until cancelled.
pub struct Controller {
    engine: Arc<Engine>,
    config: ControllerConfig,
    trigger: Notify,
}

impl Controller {
    pub fn new(engine: Arc<Engine>, config: ControllerConfig) -> Self {
        Self {
            engine,
            config,
            trigger: Notify::new(),
        }
    }

    /// Start the next pass without waiting for the current delay. A trigger
    /// during a pass starts another pass right after it.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn run_once(
        &self,
        owner: &OwnerRef,
        cancel: &CancelToken,
    ) -> Result<ReconcileResult, ReconcileError> {
        self.engine.reconcile(owner, cancel).await
    }

    /// Loop until `cancel` fires.
    ///
    /// Converged passes wait `resync_interval`, partially ready passes wait
    /// their requeue delay and failed passes back off exponentially.
    pub async fn run(&self, owner: &OwnerRef, cancel: CancelToken) {
        let mut backoff = Backoff::new(
            self.config.error_backoff_base,
            self.config.error_backoff_max,
        );
        info!("Starting control loop for {}", owner);

        while !cancel.is_cancelled() {
            let wait = match self.run_once(owner, &cancel).await {
                Ok(ReconcileResult::Converged) => {
                    backoff.reset();
                    self.config.resync_interval
                }
                Ok(result) => {
                    backoff.reset();
                    result.requeue_after()
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!(
                        "Reconcile of {} failed: {:#}. Retrying in {:?}",
                        owner, e, delay
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.trigger.notified() => debug!("Pass triggered"),
                _ = cancel.cancelled() => break,
            }
        }

        info!("Control loop for {} stopped", owner);
    }
}
