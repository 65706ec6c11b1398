use std::sync::Arc;

use anyhow::Result;

use crate::configuration::{BackendKind, WorkloadConfig};
use crate::retry::RetryPolicy;

/// Result of a single point lookup that reached the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Found,
    NotFound,
}

/// What a seeding pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedSummary {
    /// Records the adapter tried to write.
    pub attempted: u64,
    /// Records whose write failed (and were skipped).
    pub failed: u64,
}

impl SeedSummary {
    pub fn written(&self) -> u64 {
        self.attempted - self.failed
    }
}

/// Issues point lookups on behalf of a single worker.
///
/// A reader is owned by exactly one worker for the whole workload, so it
/// may hold per-worker state such as a dedicated connection or a prepared
/// statement.
#[async_trait]
pub trait PointReader: Send {
    /// Looks up the record with the given id.
    ///
    /// `Ok(ReadOutcome::NotFound)` and `Err(_)` are both counted as failed
    /// reads; the distinction only matters for logging.
    async fn read(&mut self, id: i64) -> Result<ReadOutcome>;
}

/// A live, backend-bound handle: the capability every backend adapter
/// provides to the harness.
///
/// A tester owns exactly one underlying connection, session, pool or
/// client. It is created by a [`TesterFactory`] and destroyed exactly once
/// by [`Tester::close`].
#[async_trait]
pub trait Tester: Send + Sync {
    /// The backend this tester is bound to; used as the metrics label.
    fn backend(&self) -> BackendKind;

    /// Populates the destination with records `1..=record_count`, creating
    /// the table/collection first if needed.
    ///
    /// Re-running must not duplicate identifiers. Failures of individual
    /// records are logged and skipped; an error is returned only when the
    /// destination itself cannot be created.
    async fn seed(&self) -> Result<SeedSummary>;

    /// Creates the reader for one worker of the read workload.
    ///
    /// Fails only when no connection can be had for the worker. Problems
    /// of the destination itself, such as a table that was never seeded,
    /// must surface as failed reads.
    async fn create_reader(&self) -> Result<Box<dyn PointReader>>;

    /// Releases the underlying connection. Must not block indefinitely.
    async fn close(self: Box<Self>);
}

/// Parameters handed to a [`TesterFactory`].
#[derive(Clone)]
pub struct ConnectContext {
    pub config: Arc<WorkloadConfig>,
}

/// Constructs testers of one backend.
///
/// Construction connects and verifies that the backend is reachable.
/// If it fails midway, whatever was acquired is released before the
/// error is returned; the caller never receives a half-built tester.
#[async_trait]
pub trait TesterFactory: Send + Sync {
    /// Policy for repeating failed connection attempts. Every attempt is
    /// bounded by the configured connect timeout.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::single_attempt()
    }

    /// Makes a single connection attempt.
    async fn connect(&self, ctx: &ConnectContext) -> Result<Box<dyn Tester>>;
}
