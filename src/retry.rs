//! Failure classification and retry decisions for rejected flushes.
//!
//! A store reports a failed flush as a [`FailureReport`] with one facet per
//! failure kind. [`classify`] folds the report into a single
//! [`Classification`], and [`RetryController::decide`] turns that into an
//! action: abort on fatal failures, resubmit transient ones on a fresh
//! channel until the [`RetryPolicy`] is exhausted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::batch::{FailedFlush, FlushResult, MutationBatcher};
use crate::config::RetryPolicy;
use crate::data::Mutation;
use crate::error::{Error, FatalWriteError, Result, TransientWriteError};

/// Reason a store refused a write on authorization grounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthorizationCode {
    BadCredentials,
    PermissionDenied,
    TableDoesNotExist,
    BadAuthorizations,
    Other,
}

/// A mutation rejected by a store-side data constraint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstraintViolation {
    pub constraint: String,
    pub code: u16,
    pub description: String,
    pub violations: u64,
}

impl ConstraintViolation {
    pub fn new(constraint: impl Into<String>, code: u16, description: impl Into<String>) -> Self {
        Self {
            constraint: constraint.into(),
            code,
            description: description.into(),
            violations: 1,
        }
    }
}

impl std::fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} code {} ({}) x{}",
            self.constraint, self.code, self.description, self.violations
        )
    }
}

/// Everything a store said about one failed flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureReport {
    pub authorization_failures: BTreeMap<String, BTreeSet<AuthorizationCode>>,
    pub constraint_violations: Vec<ConstraintViolation>,
    pub faulting_endpoints: BTreeSet<String>,
    pub unknown_failures: usize,
    pub timed_out: Option<Duration>,
}

impl FailureReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authorization(mut self, target: impl Into<String>, code: AuthorizationCode) -> Self {
        self.authorization_failures
            .entry(target.into())
            .or_default()
            .insert(code);
        self
    }

    pub fn constraint(mut self, violation: ConstraintViolation) -> Self {
        self.constraint_violations.push(violation);
        self.constraint_violations.sort();
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.faulting_endpoints.insert(endpoint.into());
        self
    }

    pub fn unknown(mut self, count: usize) -> Self {
        self.unknown_failures += count;
        self
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            timed_out: Some(timeout),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.authorization_failures.is_empty()
            && self.constraint_violations.is_empty()
            && self.faulting_endpoints.is_empty()
            && self.unknown_failures == 0
            && self.timed_out.is_none()
    }

    /// Folds `other` into this report. Timeouts keep the longest wait.
    pub fn merge(&mut self, other: FailureReport) {
        for (target, codes) in other.authorization_failures {
            self.authorization_failures
                .entry(target)
                .or_default()
                .extend(codes);
        }
        // Kept sorted so reports compare equal whatever order they were merged in
        self.constraint_violations
            .extend(other.constraint_violations);
        self.constraint_violations.sort();
        self.faulting_endpoints.extend(other.faulting_endpoints);
        self.unknown_failures += other.unknown_failures;
        self.timed_out = self.timed_out.max(other.timed_out);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    Fatal(FatalWriteError),
    Transient(TransientWriteError),
}

/// Classifies a report. Fatal facets take precedence over transient ones,
/// and authorization takes precedence over constraint violations.
pub fn classify(report: &FailureReport) -> Classification {
    if !report.authorization_failures.is_empty() {
        return Classification::Fatal(FatalWriteError::AuthorizationDenied(
            report.authorization_failures.clone(),
        ));
    }
    if !report.constraint_violations.is_empty() {
        let mut violations = report.constraint_violations.clone();
        violations.sort();
        return Classification::Fatal(FatalWriteError::ConstraintViolation { violations });
    }
    if let Some(timeout) = report.timed_out {
        return Classification::Transient(TransientWriteError::Timeout(timeout));
    }
    if !report.faulting_endpoints.is_empty() {
        return Classification::Transient(TransientWriteError::EndpointUnreachable(
            report.faulting_endpoints.clone(),
        ));
    }
    if report.unknown_failures > 0 {
        return Classification::Transient(TransientWriteError::UnknownServerFault(
            report.unknown_failures,
        ));
    }
    Classification::Success
}

/// Sink for batches that could not be written.
pub trait Diagnostics: Send + Sync {
    fn dump_batch(&self, cause: &FatalWriteError, batch: &[Mutation]);
}

/// Logs every update of a dumped batch at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn dump_batch(&self, cause: &FatalWriteError, batch: &[Mutation]) {
        error!(cause = %cause, mutations = batch.len(), "Dumping rejected batch");
        for mutation in batch {
            for update in mutation.updates() {
                let column = update.column();
                error!(
                    row = %String::from_utf8_lossy(mutation.row()),
                    family = %String::from_utf8_lossy(&column.family),
                    qualifier = %String::from_utf8_lossy(&column.qualifier),
                    delete = update.is_delete(),
                    "Rejected update"
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Stop; the batch cannot be written as is.
    Abort(FatalWriteError),
    /// Resubmit the identical batch on a fresh channel after waiting.
    Retry { after: Duration },
    /// Transient failure, but the retry budget is spent.
    GiveUp(TransientWriteError),
}

pub struct RetryController {
    policy: RetryPolicy,
    diagnostics: Arc<dyn Diagnostics>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decides what to do about `failed`, which has already been retried
    /// `attempt` times.
    pub fn decide(&self, failed: &FailedFlush, attempt: usize) -> Result<Decision> {
        match classify(&failed.report) {
            Classification::Success => Err(Error::InvalidState(
                "rejected flush carried an empty failure report".to_string(),
            )),
            Classification::Fatal(cause) => {
                error!(
                    cause = %cause,
                    mutations = failed.mutations.len(),
                    "Fatal write failure"
                );
                self.diagnostics.dump_batch(&cause, &failed.mutations);
                Ok(Decision::Abort(cause))
            }
            Classification::Transient(cause) => {
                for endpoint in &failed.report.faulting_endpoints {
                    warn!(endpoint = %endpoint, "Endpoint failed during flush");
                }
                if failed.report.unknown_failures > 0 {
                    warn!(
                        count = failed.report.unknown_failures,
                        "Unknown failures during flush"
                    );
                }
                if attempt >= self.policy.max_retries {
                    warn!(
                        attempt,
                        max_retries = self.policy.max_retries,
                        cause = %cause,
                        "Retries exhausted"
                    );
                    return Ok(Decision::GiveUp(cause));
                }
                let after = self.policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = self.policy.max_retries,
                    backoff_ms = after.as_millis() as u64,
                    cause = %cause,
                    "Transient write failure, retrying"
                );
                Ok(Decision::Retry { after })
            }
        }
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// Drives a stream of records through a batcher, flushing every
/// `max_batch_size` records and handling failed flushes.
pub struct Ingestor {
    batcher: Arc<MutationBatcher>,
    controller: RetryController,
}

impl Ingestor {
    pub fn new(batcher: Arc<MutationBatcher>, controller: RetryController) -> Self {
        Self {
            batcher,
            controller,
        }
    }

    /// Writes every record and returns the number durably applied.
    ///
    /// A fatal failure, or a transient one that outlives the retry budget,
    /// stops the run with [`Error::Aborted`] carrying the unflushed batch.
    pub async fn run<I>(&self, records: I) -> Result<u64>
    where
        I: IntoIterator<Item = Mutation>,
    {
        let batch_size = self.batcher.config().max_batch_size;
        let mut since_flush = 0usize;
        let mut records_read = 0u64;

        for mutation in records {
            if self.batcher.has_failures()? {
                self.flush_with_retry().await?;
                since_flush = 0;
            }
            self.batcher.add(mutation)?;
            records_read += 1;
            since_flush += 1;

            if since_flush >= batch_size {
                self.flush_with_retry().await?;
                since_flush = 0;
                debug!(records_read, "Flushed batch");
            }
        }
        self.flush_with_retry().await?;

        let written = self.batcher.applied_total();
        info!(records_read, written, "Ingestion complete");
        Ok(written)
    }

    async fn flush_with_retry(&self) -> Result<()> {
        let mut result = self.batcher.flush().await?;
        let mut attempt = 0;
        loop {
            let failed = match result {
                FlushResult::Applied(_) => return Ok(()),
                FlushResult::Rejected(failed) => failed,
            };
            match self.controller.decide(&failed, attempt)? {
                Decision::Retry { after } => {
                    tokio::time::sleep(after).await;
                    result = self.batcher.resubmit(failed.mutations).await?;
                    attempt += 1;
                }
                Decision::Abort(cause) => {
                    return Err(self.aborted(Error::Fatal(cause), failed));
                }
                Decision::GiveUp(cause) => {
                    return Err(self.aborted(Error::Transient(cause), failed));
                }
            }
        }
    }

    fn aborted(&self, cause: Error, failed: FailedFlush) -> Error {
        Error::Aborted {
            cause: Box::new(cause),
            written: self.batcher.applied_total(),
            unflushed: failed.mutations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::KeyValueStore;
    use std::sync::Mutex;

    fn fatal_auth() -> FailureReport {
        FailureReport::new().authorization("t", AuthorizationCode::PermissionDenied)
    }

    fn constraint() -> FailureReport {
        FailureReport::new().constraint(ConstraintViolation::new("NumericValue", 1, "not a number"))
    }

    fn failed(report: FailureReport) -> FailedFlush {
        FailedFlush {
            report,
            mutations: vec![Mutation::new("r").put("f", "q", "v")],
            applied: 0,
        }
    }

    #[derive(Default)]
    struct RecordingDiagnostics {
        dumped: Mutex<Vec<usize>>,
    }

    impl Diagnostics for RecordingDiagnostics {
        fn dump_batch(&self, _cause: &FatalWriteError, batch: &[Mutation]) {
            self.dumped.lock().unwrap().push(batch.len());
        }
    }

    #[test]
    fn test_classify_empty_is_success() {
        assert_eq!(classify(&FailureReport::new()), Classification::Success);
    }

    #[test]
    fn test_classify_fatal_beats_transient() {
        let report = fatal_auth().endpoint("tserver-1:9997").unknown(3);
        assert!(matches!(
            classify(&report),
            Classification::Fatal(FatalWriteError::AuthorizationDenied(_))
        ));

        let report = constraint().unknown(1);
        assert!(matches!(
            classify(&report),
            Classification::Fatal(FatalWriteError::ConstraintViolation { .. })
        ));
    }

    #[test]
    fn test_classify_authorization_wins_over_constraint() {
        let mut report = constraint();
        report.merge(fatal_auth());
        assert!(matches!(
            classify(&report),
            Classification::Fatal(FatalWriteError::AuthorizationDenied(_))
        ));
    }

    #[test]
    fn test_classify_transient_kinds() {
        let report = FailureReport::new().unknown(2);
        assert_eq!(
            classify(&report),
            Classification::Transient(TransientWriteError::UnknownServerFault(2))
        );

        let report = FailureReport::new().endpoint("a").unknown(2);
        assert!(matches!(
            classify(&report),
            Classification::Transient(TransientWriteError::EndpointUnreachable(_))
        ));

        let mut report = FailureReport::new().endpoint("a");
        report.merge(FailureReport::timed_out(Duration::from_secs(1)));
        assert_eq!(
            classify(&report),
            Classification::Transient(TransientWriteError::Timeout(Duration::from_secs(1)))
        );
    }

    #[test]
    fn test_classify_with_several_violations_is_order_independent() {
        let not_numeric = ConstraintViolation::new("NumericValue", 1, "not a number");
        let too_long = ConstraintViolation::new("MaxLength", 2, "value too long");

        let mut a = FailureReport::new().constraint(not_numeric.clone());
        a.merge(FailureReport::new().constraint(too_long.clone()));
        let mut b = FailureReport::new().constraint(too_long);
        b.merge(FailureReport::new().constraint(not_numeric));

        assert_eq!(a, b);
        assert_eq!(classify(&a), classify(&b));
        assert!(matches!(
            classify(&a),
            Classification::Fatal(FatalWriteError::ConstraintViolation { ref violations })
                if violations.len() == 2
        ));
    }

    #[test]
    fn test_classify_is_order_independent() {
        let mut a = FailureReport::new().endpoint("x").endpoint("y");
        a.merge(constraint());
        let mut b = constraint();
        b.merge(FailureReport::new().endpoint("y").endpoint("x"));
        assert_eq!(classify(&a), classify(&b));
    }

    #[test]
    fn test_decide_fatal_dumps_batch() -> Result<()> {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let controller =
            RetryController::new(RetryPolicy::default()).with_diagnostics(diagnostics.clone());

        let decision = controller.decide(&failed(constraint()), 0)?;
        assert!(matches!(decision, Decision::Abort(_)));
        assert_eq!(*diagnostics.dumped.lock().unwrap(), vec![1]);
        Ok(())
    }

    #[test]
    fn test_decide_transient_is_bounded() -> Result<()> {
        let controller = RetryController::new(RetryPolicy::new().max_retries(2));
        let batch = failed(FailureReport::new().endpoint("a"));

        assert_eq!(
            controller.decide(&batch, 0)?,
            Decision::Retry {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(
            controller.decide(&batch, 1)?,
            Decision::Retry {
                after: Duration::from_millis(200)
            }
        );
        assert!(matches!(
            controller.decide(&batch, 2)?,
            Decision::GiveUp(TransientWriteError::EndpointUnreachable(_))
        ));
        Ok(())
    }

    #[test]
    fn test_decide_empty_report_is_invalid_state() {
        let controller = RetryController::default();
        assert!(matches!(
            controller.decide(&failed(FailureReport::new()), 0),
            Err(Error::InvalidState(_))
        ));
    }

    fn records(count: usize) -> Vec<Mutation> {
        (0..count)
            .map(|i| Mutation::new(format!("row{:04}", i)).put("f", "q", i.to_string()))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ingestor_retries_transient_failures() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.create_table_if_absent("data").await?;
        store.inject_failure(FailureReport::new().endpoint("tserver-1:9997"));

        let config = WriterConfig::new()
            .max_batch_size(10)
            .max_latency(Duration::from_secs(60));
        let batcher = Arc::new(MutationBatcher::open(store.clone(), "data", config)?);
        let controller =
            RetryController::new(RetryPolicy::new().initial_backoff(Duration::from_millis(1)));

        let written = Ingestor::new(batcher, controller).run(records(25)).await?;
        assert_eq!(written, 25);
        assert_eq!(store.probe().mutations_applied(), 25);
        assert!(store.probe().writers_opened() >= 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ingestor_aborts_on_fatal_failure() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.create_table_if_absent("data").await?;

        let config = WriterConfig::new()
            .max_batch_size(10)
            .max_latency(Duration::from_secs(60));
        let batcher = Arc::new(MutationBatcher::open(store.clone(), "data", config)?);
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let controller = RetryController::default().with_diagnostics(diagnostics.clone());

        // First batch lands, the second is refused
        store.skip_then_fail(1, constraint());
        let err = Ingestor::new(batcher, controller)
            .run(records(25))
            .await
            .unwrap_err();

        match err {
            Error::Aborted {
                cause,
                written,
                unflushed,
            } => {
                assert!(cause.is_fatal());
                assert_eq!(written, 10);
                assert_eq!(unflushed.len(), 10);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(*diagnostics.dumped.lock().unwrap(), vec![10]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ingestor_gives_up_after_budget() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.create_table_if_absent("data").await?;
        for _ in 0..3 {
            store.inject_failure(FailureReport::new().unknown(1));
        }

        let config = WriterConfig::new().max_latency(Duration::from_secs(60));
        let batcher = Arc::new(MutationBatcher::open(store.clone(), "data", config)?);
        let controller = RetryController::new(
            RetryPolicy::new()
                .max_retries(2)
                .initial_backoff(Duration::from_millis(1)),
        );

        let err = Ingestor::new(batcher, controller)
            .run(records(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Aborted { ref cause, written: 0, ref unflushed }
                if cause.is_transient() && unflushed.len() == 5
        ));
        Ok(())
    }
}
