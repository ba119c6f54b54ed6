//! Sync driver.
//!
//! Repeatedly long-polls the homeserver and feeds each batch into a shared
//! machine. The long poll runs without holding the machine lock so the
//! application can send while a sync is pending; applying the batch takes
//! the lock.
//!
//! Transient transport failures back off exponentially through the
//! [`Environment`], so simulation runs the loop against a virtual clock.

use std::sync::Arc;

use keyward_crypto::CipherSuite;

use crate::{
    config::SyncConfig,
    env::Environment,
    error::MachineError,
    machine::SharedMachine,
    pipeline::SyncReport,
    store::Storage,
    transport::Transport,
};

/// Drives `/sync` for one machine.
pub struct SyncLoop<C: CipherSuite, T: Transport, S: Storage, E: Environment> {
    machine: SharedMachine<C, T, S, E>,
    transport: Arc<T>,
    env: E,
    config: SyncConfig,
    consecutive_failures: u32,
}

impl<C: CipherSuite, T: Transport, S: Storage, E: Environment> SyncLoop<C, T, S, E> {
    /// Driver for `machine`, sharing its transport and environment.
    pub async fn new(machine: SharedMachine<C, T, S, E>, config: SyncConfig) -> Self {
        let (transport, env) = {
            let guard = machine.lock().await;
            (Arc::clone(guard.transport()), guard.env().clone())
        };
        Self { machine, transport, env, config, consecutive_failures: 0 }
    }

    /// Failures since the last successful batch.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Fetch and apply one batch.
    pub async fn sync_once(&mut self) -> Result<SyncReport, MachineError> {
        let since = self.machine.lock().await.sync_token().map(str::to_owned);

        let started = self.env.now();
        let response = self.transport.sync(since.as_deref(), self.config.timeout).await?;
        tracing::trace!(elapsed = ?self.env.since(started), "Sync response received");

        self.machine.lock().await.process_sync(response).await
    }

    /// Publish keys, then sync until a non-transient error or until
    /// `max_consecutive_failures` transient ones in a row.
    pub async fn run(&mut self) -> Result<(), MachineError> {
        self.machine.lock().await.publish_keys().await?;

        loop {
            match self.sync_once().await {
                Ok(report) => {
                    self.consecutive_failures = 0;
                    let failed = report.failures().count();
                    if failed > 0 {
                        tracing::debug!(
                            next_batch = %report.next_batch,
                            failed,
                            "Batch had failures"
                        );
                    }
                },
                Err(error) if error.is_transient() => {
                    self.consecutive_failures += 1;
                    if self
                        .config
                        .max_consecutive_failures
                        .is_some_and(|max| self.consecutive_failures >= max)
                    {
                        let failures = self.consecutive_failures;
                        tracing::error!(failures, %error, "Giving up sync");
                        return Err(error);
                    }
                    let delay = self.config.backoff(self.consecutive_failures);
                    tracing::warn!(
                        failures = self.consecutive_failures,
                        ?delay,
                        %error,
                        "Sync failed, backing off"
                    );
                    self.env.sleep(delay).await;
                },
                Err(error) => {
                    tracing::error!(%error, class = ?error.class(), "Sync stopped");
                    return Err(error);
                },
            }
        }
    }
}
