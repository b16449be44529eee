//! Throttled write-back of edits to the document store.
//!
//! Every accepted edit asks the gate whether to persist. The decision comes
//! from an injectable [`PersistPolicy`]; production uses an independent
//! Bernoulli draw per edit, tests force one outcome. A persisted edit is a
//! single atomic `append_version` on the store. Failures are reported once,
//! never retried.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::model::{DocumentVersion, UserId};
use crate::storage::{DocumentStore, StoreError};

/// Probability that an edit is persisted under the default policy.
pub const DEFAULT_PERSIST_PROBABILITY: f64 = 0.8;

/// What the policy sees when deciding.
#[derive(Debug, Clone, Copy)]
pub struct PersistAttempt<'a> {
    pub document_id: &'a str,
    pub content: &'a str,
    pub user_id: &'a str,
}

/// Decides whether an edit is written to durable storage.
pub trait PersistPolicy: Send + Sync {
    fn should_persist(&self, attempt: &PersistAttempt<'_>) -> bool;
}

/// Fresh Bernoulli draw per edit.
#[derive(Debug, Clone, Copy)]
pub struct BernoulliPolicy {
    probability: f64,
}

impl BernoulliPolicy {
    /// `probability` is clamped to `[0, 1]`; NaN means never.
    pub fn new(probability: f64) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        Self { probability }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }
}

impl Default for BernoulliPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_PERSIST_PROBABILITY)
    }
}

impl PersistPolicy for BernoulliPolicy {
    fn should_persist(&self, _attempt: &PersistAttempt<'_>) -> bool {
        rand::thread_rng().gen_bool(self.probability)
    }
}

/// Persist every edit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPersist;

impl PersistPolicy for AlwaysPersist {
    fn should_persist(&self, _attempt: &PersistAttempt<'_>) -> bool {
        true
    }
}

/// Never persist.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverPersist;

impl PersistPolicy for NeverPersist {
    fn should_persist(&self, _attempt: &PersistAttempt<'_>) -> bool {
        false
    }
}

/// Adapts a closure into a policy.
pub struct FnPolicy<F>(pub F);

impl<F> PersistPolicy for FnPolicy<F>
where
    F: Fn(&PersistAttempt<'_>) -> bool + Send + Sync,
{
    fn should_persist(&self, attempt: &PersistAttempt<'_>) -> bool {
        (self.0)(attempt)
    }
}

/// A persist that the store rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to persist document {document_id}: {source}")]
pub struct PersistenceFailure {
    pub document_id: String,
    #[source]
    pub source: StoreError,
}

/// Snapshot of gate counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub attempts: u64,
    pub persisted: u64,
    pub skipped: u64,
    pub failures: u64,
}

#[derive(Default)]
struct AtomicPersistStats {
    attempts: AtomicU64,
    persisted: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
}

/// Decides and performs durable writes for accepted edits.
pub struct PersistenceGate {
    store: Arc<dyn DocumentStore>,
    policy: Box<dyn PersistPolicy>,
    stats: AtomicPersistStats,
}

impl PersistenceGate {
    pub fn new(store: Arc<dyn DocumentStore>, policy: impl PersistPolicy + 'static) -> Self {
        Self {
            store,
            policy: Box::new(policy),
            stats: AtomicPersistStats::default(),
        }
    }

    /// Gate with the default Bernoulli policy.
    pub fn with_probability(store: Arc<dyn DocumentStore>, probability: f64) -> Self {
        Self::new(store, BernoulliPolicy::new(probability))
    }

    /// Possibly append a version for this edit.
    ///
    /// Returns `Ok(true)` when a version was appended, `Ok(false)` when the
    /// policy skipped it.
    pub fn maybe_persist(
        &self,
        document_id: &str,
        content: &str,
        user_id: &str,
    ) -> Result<bool, PersistenceFailure> {
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);

        let attempt = PersistAttempt {
            document_id,
            content,
            user_id,
        };
        if !self.policy.should_persist(&attempt) {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            log::trace!("Skipped persist for document {document_id}");
            return Ok(false);
        }

        let version = DocumentVersion::new(content, UserId::from(user_id));
        match self.store.append_version(document_id, version) {
            Ok(index) => {
                self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                log::debug!("Persisted document {document_id} as version {index}");
                Ok(true)
            }
            Err(source) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                Err(PersistenceFailure {
                    document_id: document_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Lock-free snapshot of the counters.
    pub fn stats(&self) -> PersistStats {
        PersistStats {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            persisted: self.stats.persisted.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }
}
