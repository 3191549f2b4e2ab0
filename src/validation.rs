//! Validation of trust anchors.
//!
//! Each trust anchor is validated independently by a [`ValidationWorker`].
//! A validation run first has the certificate extracted for the anchor and
//! then fetches the route origins validated under it. Every step is
//! committed to the shared state so its progress can be observed. Only the
//! final commit touches the route origins and is published.
//!
//! The [`ValidationScheduler`] periodically looks for anchors that are due
//! and spawns a worker for each of them.

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use crate::collector::{
    AnchorFetchError, CertificateExtractor, StatementFetcher
};
use crate::config::Config;
use crate::engine::Publisher;
use crate::process::Shutdown;
use crate::state::{
    AnchorKey, AnchorOutcome, AnchorStatus, ValidationStep, VersionedState
};


//------------ Configuration Constants ---------------------------------------

/// The longest delay between validation runs we accept.
const MAX_DELAY_DAYS: i64 = 365;

/// The failure reason recorded for a validation that didn’t finish.
const ABORTED_REASON: &str = "validation aborted";


//------------ RetryPolicy ---------------------------------------------------

/// When to validate an anchor again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// The delay after a successful run.
    success: chrono::Duration,

    /// The delay after a failed run.
    failure: chrono::Duration,
}

impl RetryPolicy {
    pub fn new(success: Duration, failure: Duration) -> Self {
        RetryPolicy {
            success: Self::convert(success),
            failure: Self::convert(failure),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.validation_interval,
            config.validation_retry_interval(),
        )
    }

    /// Returns the time of the next update after a run ending at `now`.
    pub fn next_update(
        &self, now: DateTime<Utc>, success: bool
    ) -> DateTime<Utc> {
        let delay = if success { self.success } else { self.failure };
        now.checked_add_signed(delay).unwrap_or(now)
    }

    fn convert(duration: Duration) -> chrono::Duration {
        chrono::Duration::from_std(duration).unwrap_or_else(|_| {
            chrono::Duration::days(MAX_DELAY_DAYS)
        })
    }
}


//------------ WorkerOutcome -------------------------------------------------

/// What happened when a worker ran.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WorkerOutcome {
    /// The anchor wasn’t due or is being validated already.
    Skipped,

    /// New route origins were committed with the given version.
    Success { version: u64 },

    /// Validation failed.
    Failure(AnchorFetchError),
}


//------------ ValidationWorker ----------------------------------------------

/// Validates a single trust anchor.
pub struct ValidationWorker {
    state: VersionedState,
    extractor: Arc<dyn CertificateExtractor>,
    fetcher: Arc<dyn StatementFetcher>,
    policy: RetryPolicy,
    publisher: Publisher,
}

impl ValidationWorker {
    pub fn new(
        state: VersionedState,
        extractor: Arc<dyn CertificateExtractor>,
        fetcher: Arc<dyn StatementFetcher>,
        policy: RetryPolicy,
        publisher: Publisher,
    ) -> Self {
        ValidationWorker { state, extractor, fetcher, policy, publisher }
    }

    /// Validates the anchor identified by `key` if it is due at `now`.
    ///
    /// The anchor is claimed by committing its status as validating. If
    /// that isn’t possible because it isn’t idle or not yet due, nothing
    /// happens.
    pub async fn run(
        &self, key: &AnchorKey, now: DateTime<Utc>
    ) -> WorkerOutcome {
        let claimed = match self.state.try_update(|snapshot| {
            snapshot.start_validation(key, now)
        }) {
            Some(snapshot) => snapshot,
            None => {
                debug!("Trust anchor {}: not due, skipping.", key);
                return WorkerOutcome::Skipped
            }
        };
        let claim = Claim { worker: self, key, now, released: false };
        let locator = match claimed.trust_anchors().get(key) {
            Some(anchor) => anchor.locator().clone(),
            None => {
                claim.release();
                return WorkerOutcome::Skipped
            }
        };
        info!("Trust anchor {}: starting validation.", key);

        let certificate = match self.extractor.extract_certificate(
            &locator
        ).await {
            Ok(certificate) => certificate,
            Err(err) => return claim.fail(err),
        };
        debug!("Trust anchor {}: certificate {}.", key, certificate);
        self.state.update(|snapshot| {
            snapshot.with_anchor_status(
                key,
                AnchorStatus::Validating {
                    step: ValidationStep::UpdatingRoas
                }
            )
        });

        let origins = match self.fetcher.fetch_statements(
            &locator, &certificate
        ).await {
            Ok(origins) => origins,
            Err(err) => return claim.fail(err),
        };
        let count = origins.len();
        let status = AnchorStatus::Idle {
            next_update: self.policy.next_update(Utc::now().max(now), true),
            last_outcome: Some(AnchorOutcome::Success { certificate }),
        };
        let committed = self.state.update(|snapshot| {
            snapshot.with_route_origins(key, origins.clone(), status.clone())
        });
        claim.release();
        info!(
            "Trust anchor {}: {} route origins, version {}.",
            key, count, committed.version()
        );
        self.publisher.publish().await;
        WorkerOutcome::Success { version: committed.version() }
    }

    fn fail(
        &self, key: &AnchorKey, now: DateTime<Utc>, err: AnchorFetchError
    ) -> WorkerOutcome {
        let next_update = self.set_failed(key, now, err.reason());
        warn!(
            "Trust anchor {}: {}. Trying again at {}.",
            key, err, next_update
        );
        WorkerOutcome::Failure(err)
    }

    /// Commits the anchor as idle after a failure.
    ///
    /// Returns the time of the next attempt.
    fn set_failed(
        &self, key: &AnchorKey, now: DateTime<Utc>, reason: &str
    ) -> DateTime<Utc> {
        let next_update = self.policy.next_update(Utc::now().max(now), false);
        let status = AnchorStatus::Idle {
            next_update,
            last_outcome: Some(AnchorOutcome::Failure {
                reason: reason.into()
            }),
        };
        self.state.update(|snapshot| {
            snapshot.with_anchor_status(key, status.clone())
        });
        next_update
    }
}


//------------ Claim ---------------------------------------------------------

/// A trust anchor claimed by a worker.
///
/// If the claim is dropped without having been released, the worker
/// didn’t get to finish, most likely because it panicked. The anchor is
/// then set back to idle with a failure so it will be retried.
struct Claim<'a> {
    worker: &'a ValidationWorker,
    key: &'a AnchorKey,
    now: DateTime<Utc>,
    released: bool,
}

impl Claim<'_> {
    /// Releases the claim after the final status has been committed.
    fn release(mut self) {
        self.released = true;
    }

    /// Releases the claim by committing a failure.
    fn fail(mut self, err: AnchorFetchError) -> WorkerOutcome {
        self.released = true;
        self.worker.fail(self.key, self.now, err)
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.released {
            return
        }
        let next_update = self.worker.set_failed(
            self.key, self.now, ABORTED_REASON
        );
        error!(
            "Trust anchor {}: validation aborted. Trying again at {}.",
            self.key, next_update
        );
    }
}


//------------ ValidationScheduler -------------------------------------------

/// Starts validation for all anchors that are due.
pub struct ValidationScheduler {
    worker: Arc<ValidationWorker>,
    tick: Duration,
}

impl ValidationScheduler {
    pub fn new(worker: ValidationWorker, tick: Duration) -> Self {
        ValidationScheduler { worker: Arc::new(worker), tick }
    }

    /// Spawns a worker for every anchor due at `now`.
    ///
    /// Returns the handles of the spawned tasks. The scheduler itself never
    /// waits for them.
    pub fn spawn_due(
        &self, now: DateTime<Utc>
    ) -> Vec<JoinHandle<WorkerOutcome>> {
        self.worker.state.get().trust_anchors().due(now).into_iter().map(
            |key| {
                let worker = self.worker.clone();
                tokio::spawn(async move { worker.run(&key, now).await })
            }
        ).collect()
    }

    /// Runs the scheduler until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _ = self.spawn_due(Utc::now());
                }
                _ = shutdown.wait() => {
                    debug!("Validation scheduler: shutting down.");
                    return
                }
            }
        }
    }
}


//============ Tests =========================================================
