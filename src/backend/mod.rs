//! Adapters binding the [`Tester`](crate::tester::Tester) capability to
//! concrete storage technologies.

pub mod cassandra;
pub mod etcd;
pub mod mongo;
pub mod mysql;
pub mod postgres;
#[cfg(feature = "ydb")]
pub mod ydb;

use anyhow::Result;

use crate::configuration::BackendKind;
use crate::record::should_log_progress;
use crate::tester::{PointReader, ReadOutcome, SeedSummary};

/// A point lookup that runs through a statement prepared on the server.
#[async_trait]
pub(crate) trait PreparedLookup: Send {
    type Statement: Send + Sync;

    async fn prepare(&mut self) -> Result<Self::Statement>;

    async fn execute(&mut self, statement: &Self::Statement, id: i64) -> Result<ReadOutcome>;
}

/// Reader that prepares its statement on first use.
///
/// Preparing fails while the table does not exist yet. Such a reader
/// reports every lookup as an error and keeps trying to prepare, so an
/// unseeded backend shows up as failed reads instead of a failed run.
pub(crate) struct LazyReader<L: PreparedLookup> {
    lookup: L,
    statement: Option<L::Statement>,
}

impl<L: PreparedLookup> LazyReader<L> {
    pub async fn new(backend: BackendKind, mut lookup: L) -> Self {
        let statement = match lookup.prepare().await {
            Ok(statement) => Some(statement),
            Err(err) => {
                tracing::debug!("{}: cannot prepare the point read yet: {:#}", backend, err);
                None
            }
        };
        Self { lookup, statement }
    }
}

#[async_trait]
impl<L: PreparedLookup> PointReader for LazyReader<L> {
    async fn read(&mut self, id: i64) -> Result<ReadOutcome> {
        let statement = match &mut self.statement {
            Some(statement) => statement,
            empty => empty.insert(self.lookup.prepare().await?),
        };
        self.lookup.execute(statement, id).await
    }
}

/// Accounts the writes of a seeding pass and logs its progress.
pub(crate) struct SeedProgress {
    backend: BackendKind,
    record_count: u64,
    summary: SeedSummary,
}

impl SeedProgress {
    pub fn start(backend: BackendKind, record_count: u64) -> Self {
        tracing::info!("{}: writing {} records...", backend, record_count);
        Self {
            backend,
            record_count,
            summary: SeedSummary::default(),
        }
    }

    /// Accounts the write of a single record.
    pub fn record_written(&mut self, id: i64, result: anyhow::Result<()>) {
        self.summary.attempted += 1;
        if let Err(err) = result {
            self.summary.failed += 1;
            tracing::warn!("{}: write of record {} failed: {:#}", self.backend, id, err);
        }
        if should_log_progress(id as u64, self.record_count) {
            tracing::info!("{}: {} records written...", self.backend, id);
        }
    }

    /// Accounts a batch of `len` records ending with `last_id`, of which
    /// `failed` could not be written.
    pub fn batch_written(&mut self, last_id: i64, len: u64, failed: u64) {
        self.summary.attempted += len;
        self.summary.failed += failed;
        tracing::info!("{}: {} records written...", self.backend, last_id);
    }

    pub fn finish(self) -> SeedSummary {
        self.summary
    }
}
