use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::{join_all, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::configuration::WorkloadConfig;
use crate::metrics::MetricsSink;
use crate::tester::{PointReader, ReadOutcome, Tester};
use crate::workload::KeyGenerator;

/// Lets the owner of a running read workload stop it.
pub struct RunController {
    token: CancellationToken,
    abort_handles: Vec<AbortHandle>,
}

impl RunController {
    /// Prevents workers from issuing more lookups. Lookups in flight are
    /// abandoned and not accounted.
    pub fn ask_to_stop(&self) {
        self.token.cancel();
    }

    /// Forcibly cancels every worker task.
    ///
    /// Needed only when a reader does not yield to the runtime, which
    /// makes [`RunController::ask_to_stop`] ineffective.
    pub fn abort(&self) {
        self.ask_to_stop();
        for handle in &self.abort_handles {
            handle.abort();
        }
    }
}

/// Totals of a finished read workload.
///
/// Workers that were aborted do not report their totals here, though
/// the samples they recorded are still in the metrics sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadSummary {
    pub workers: u64,
    pub successes: u64,
    pub failures: u64,
    pub aborted_workers: u64,
}

impl WorkloadSummary {
    pub fn reads(&self) -> u64 {
        self.successes + self.failures
    }
}

#[derive(Default)]
struct WorkerReport {
    successes: u64,
    failures: u64,
}

struct Worker {
    index: u64,
    backend: &'static str,
    reader: Box<dyn PointReader>,
    keys: KeyGenerator,
    sink: Arc<dyn MetricsSink>,
    token: CancellationToken,
}

impl Worker {
    // Issues lookups of random ids until the token is cancelled.
    async fn run(mut self) -> WorkerReport {
        let mut report = WorkerReport::default();

        while !self.token.is_cancelled() {
            let id = self.keys.next_id();
            let start = Instant::now();

            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                result = self.reader.read(id) => result,
            };

            self.sink.observe_latency(self.backend, start.elapsed());
            match result {
                Ok(ReadOutcome::Found) => {
                    self.sink.read_succeeded(self.backend);
                    report.successes += 1;
                }
                Ok(ReadOutcome::NotFound) => {
                    tracing::debug!("worker {}: record {} not found", self.index, id);
                    self.sink.read_failed(self.backend);
                    report.failures += 1;
                }
                Err(err) => {
                    tracing::warn!("worker {}: read of record {} failed: {:#}", self.index, id, err);
                    self.sink.read_failed(self.backend);
                    report.failures += 1;
                }
            }
        }

        report
    }
}

/// Starts the point-read workload against `tester`.
///
/// Creates one reader per worker, spawns the workers and returns right
/// away. The returned future resolves once every worker has exited,
/// which happens when `token` is cancelled, when the controller asks
/// to stop or when `config.test_duration` elapses, whichever comes first.
/// No sample reaches `sink` after it resolves.
///
/// Workers whose reader cannot be created are skipped; the call fails
/// only if no worker can be started at all.
pub async fn start_read_workload(
    tester: &dyn Tester,
    config: &WorkloadConfig,
    sink: Arc<dyn MetricsSink>,
    token: CancellationToken,
) -> Result<(RunController, impl Future<Output = WorkloadSummary> + Send + 'static)> {
    let backend = tester.backend().name();

    let readers = join_all((0..config.worker_count).map(|_| tester.create_reader())).await;
    let mut workers = Vec::with_capacity(readers.len());
    for (index, reader) in readers.into_iter().enumerate() {
        match reader {
            Ok(reader) => workers.push(Worker {
                index: index as u64,
                backend,
                reader,
                keys: KeyGenerator::new(config.record_count),
                sink: Arc::clone(&sink),
                token: token.clone(),
            }),
            Err(err) => tracing::error!("worker {}: cannot create reader: {:#}", index, err),
        }
    }
    if workers.is_empty() {
        anyhow::bail!("none of the {} workers could create a reader", config.worker_count);
    }

    let started = workers.len() as u64;
    if started < config.worker_count {
        tracing::warn!("only {} of {} workers started", started, config.worker_count);
    }

    let start_time = Instant::now();
    let join_handles: Vec<_> = workers
        .into_iter()
        .map(|worker| tokio::task::spawn(worker.run()))
        .collect();
    let abort_handles = join_handles.iter().map(|h| h.abort_handle()).collect();

    // Stops the workers once the test period has elapsed. Dropped, and
    // thus cancelled, together with the join future.
    let stopper_handle = stopper(token.clone(), start_time + config.test_duration);

    let controller = RunController {
        token,
        abort_handles,
    };

    let join = async move {
        let _stopper_handle = stopper_handle;
        let mut summary = WorkloadSummary {
            workers: started,
            ..Default::default()
        };

        let mut worker_handles = join_handles.into_iter().collect::<FuturesUnordered<_>>();
        while let Some(worker_result) = worker_handles.next().await {
            match worker_result {
                Ok(report) => {
                    summary.successes += report.successes;
                    summary.failures += report.failures;
                }
                Err(err) => {
                    if err.is_panic() {
                        tracing::error!("worker panicked: {}", err);
                    }
                    summary.aborted_workers += 1;
                }
            }
        }

        tracing::debug!(
            "all {} workers exited after {:?}",
            started,
            start_time.elapsed()
        );
        summary
    };

    Ok((controller, join))
}

fn stopper(token: CancellationToken, deadline: Instant) -> futures::future::RemoteHandle<()> {
    let (fut, handle) = async move {
        tokio::time::sleep_until(deadline).await;
        tracing::debug!("test duration elapsed, stopping workers");
        token.cancel();
    }
    .remote_handle();
    tokio::task::spawn(fut);
    handle
}

/// Sleeps for `period` unless `token` is cancelled first. Returns whether
/// the whole period has elapsed.
pub async fn sleep_or_cancelled(period: Duration, token: &CancellationToken) -> bool {
    if period.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::configuration::BackendKind;
    use crate::test_util::{FakeBehavior, FakeTester, RecordingSink};

    fn make_test_cfg(workers: u64, duration: Duration) -> WorkloadConfig {
        let mut cfg = WorkloadConfig::with_defaults(BackendKind::Postgres);
        cfg.worker_count = workers;
        cfg.record_count = 10;
        cfg.test_duration = duration;
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_performs_no_lookups() {
        let (tester, state) = FakeTester::new(BackendKind::Postgres, FakeBehavior::default());
        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();
        token.cancel();

        let cfg = make_test_cfg(8, Duration::from_secs(60));
        let (_ctrl, join) = start_read_workload(&tester, &cfg, sink.clone(), token)
            .await
            .unwrap();
        let summary = join.await;

        assert_eq!(summary.workers, 8);
        assert_eq!(summary.reads(), 0);
        assert_eq!(state.reads.load(Ordering::SeqCst), 0);
        assert_eq!(sink.totals("postgres"), Default::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_to_test_duration() {
        let (tester, state) = FakeTester::new(BackendKind::Postgres, FakeBehavior::default());
        let sink = Arc::new(RecordingSink::default());

        let started = Instant::now();
        let cfg = make_test_cfg(10, Duration::from_millis(100));
        let (_ctrl, join) = start_read_workload(&tester, &cfg, sink.clone(), CancellationToken::new())
            .await
            .unwrap();
        let summary = join.await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(105), "{:?}", elapsed);

        // Every completed lookup produced exactly one latency sample and
        // exactly one outcome
        let totals = sink.totals("postgres");
        assert!(summary.reads() > 0);
        assert_eq!(totals.successes, summary.successes);
        assert_eq!(totals.failures, 0);
        assert_eq!(totals.latency_samples, summary.reads());
        assert_eq!(state.reads.load(Ordering::SeqCst), summary.reads());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_records_and_errors_are_failures() {
        let behavior = FakeBehavior {
            respond: Arc::new(|id| match id {
                1..=5 => Ok(ReadOutcome::Found),
                6..=8 => Ok(ReadOutcome::NotFound),
                _ => Err(anyhow::anyhow!("connection reset")),
            }),
            ..Default::default()
        };
        let (tester, _state) = FakeTester::new(BackendKind::Mysql, behavior);
        let sink = Arc::new(RecordingSink::default());

        let cfg = make_test_cfg(4, Duration::from_millis(500));
        let (_ctrl, join) = start_read_workload(&tester, &cfg, sink.clone(), CancellationToken::new())
            .await
            .unwrap();
        let summary = join.await;

        let totals = sink.totals("mysql");
        assert!(totals.successes > 0);
        assert!(totals.failures > 0);
        assert_eq!(totals.successes, summary.successes);
        assert_eq!(totals.failures, summary.failures);
        assert_eq!(totals.latency_samples, totals.successes + totals.failures);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ask_to_stop_ends_the_run_early() {
        let (tester, _state) = FakeTester::new(BackendKind::Etcd, FakeBehavior::default());
        let sink = Arc::new(RecordingSink::default());

        let started = Instant::now();
        let cfg = make_test_cfg(3, Duration::from_secs(3600));
        let (ctrl, join) = start_read_workload(&tester, &cfg, sink, CancellationToken::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        ctrl.ask_to_stop();
        join.await;

        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_hanging_workers() {
        let behavior = FakeBehavior {
            read_delay: Duration::from_secs(24 * 3600),
            ..Default::default()
        };
        let (tester, state) = FakeTester::new(BackendKind::Mongo, behavior);
        let sink = Arc::new(RecordingSink::default());

        let cfg = make_test_cfg(5, Duration::from_secs(3600));
        let (ctrl, join) = start_read_workload(&tester, &cfg, sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctrl.abort();
        let summary = join.await;

        assert_eq!(summary.workers, 5);
        assert_eq!(summary.aborted_workers, 5);
        assert_eq!(state.reads.load(Ordering::SeqCst), 0);
        assert_eq!(sink.totals("mongo"), Default::default());
    }

    #[tokio::test]
    async fn test_fails_when_no_reader_can_be_created() {
        let behavior = FakeBehavior {
            reader_error: true,
            ..Default::default()
        };
        let (tester, _state) = FakeTester::new(BackendKind::Cassandra, behavior);
        let sink = Arc::new(RecordingSink::default());

        let cfg = make_test_cfg(2, Duration::from_secs(1));
        let result = start_read_workload(&tester, &cfg, sink, CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancelled() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancelled(Duration::from_millis(10), &token).await);
        assert!(sleep_or_cancelled(Duration::ZERO, &token).await);

        token.cancel();
        let started = Instant::now();
        assert!(!sleep_or_cancelled(Duration::from_secs(60), &token).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!sleep_or_cancelled(Duration::ZERO, &token).await);
    }
}
