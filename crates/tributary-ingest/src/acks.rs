//! The downstream acknowledgement boundary.
//!
//! An acknowledgement set is a handle over one delivered batch: the
//! producer adds records and seals the set with [`AckSet::complete`], and
//! the downstream pipeline later reports — asynchronously, at most once —
//! whether the whole batch was durably accepted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::record::ChangeRecord;

/// Callback invoked with the batch outcome: `true` for durably accepted,
/// `false` for rejected. Invoked at most once.
pub type AckOutcomeCallback = Box<dyn FnOnce(bool) + Send>;

/// Producer-side handle over one in-flight batch.
pub trait AckSet: Send + Sync {
    /// Adds a delivered record to the set.
    fn add(&self, record: &ChangeRecord);

    /// Seals the set: no further records will be added. An empty set is
    /// acknowledged positively as soon as it is sealed.
    fn complete(&self);
}

impl fmt::Debug for dyn AckSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn AckSet")
    }
}

/// Creates acknowledgement sets wired to the downstream pipeline.
pub trait AckSetFactory: Send + Sync {
    /// Creates a set whose `on_outcome` callback fires when the batch is
    /// accepted or rejected, or not at all if the pipeline loses it — the
    /// caller treats silence past `timeout` as rejection.
    fn create(&self, on_outcome: AckOutcomeCallback, timeout: Duration) -> Arc<dyn AckSet>;
}

/// An [`AckSet`] resolved by hand. See [`ManualAckFactory`].
pub struct ManualAckSet {
    records: Mutex<Vec<ChangeRecord>>,
    sealed: Mutex<bool>,
    on_outcome: Mutex<Option<AckOutcomeCallback>>,
}

impl ManualAckSet {
    fn new(on_outcome: AckOutcomeCallback) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            sealed: Mutex::new(false),
            on_outcome: Mutex::new(Some(on_outcome)),
        }
    }

    /// Resolves the set with the given outcome. Later calls are ignored —
    /// the outcome callback fires at most once.
    pub fn resolve(&self, accepted: bool) {
        if let Some(on_outcome) = self.on_outcome.lock().take() {
            on_outcome(accepted);
        }
    }

    /// Whether [`AckSet::complete`] has been called.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        *self.sealed.lock()
    }

    /// Sequence numbers of the records added so far.
    #[must_use]
    pub fn sequence_numbers(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|r| r.sequence_number.clone())
            .collect()
    }
}

impl AckSet for ManualAckSet {
    fn add(&self, record: &ChangeRecord) {
        self.records.lock().push(record.clone());
    }

    fn complete(&self) {
        let mut sealed = self.sealed.lock();
        if *sealed {
            return;
        }
        *sealed = true;
        if self.records.lock().is_empty() {
            drop(sealed);
            self.resolve(true);
        }
    }
}

/// An [`AckSetFactory`] whose sets are resolved by the test driving it.
///
/// Every created set is retained so a test can inspect and resolve them in
/// whatever order the scenario calls for.
#[derive(Default)]
pub struct ManualAckFactory {
    sets: Mutex<Vec<Arc<ManualAckSet>>>,
}

impl ManualAckFactory {
    /// Creates a factory with no outstanding sets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All sets created so far, in creation order.
    #[must_use]
    pub fn sets(&self) -> Vec<Arc<ManualAckSet>> {
        self.sets.lock().clone()
    }

    /// Number of sets created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.lock().len()
    }

    /// Whether no sets have been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.lock().is_empty()
    }
}

impl AckSetFactory for ManualAckFactory {
    fn create(&self, on_outcome: AckOutcomeCallback, _timeout: Duration) -> Arc<dyn AckSet> {
        let set = Arc::new(ManualAckSet::new(on_outcome));
        self.sets.lock().push(set.clone());
        set
    }
}
