use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::Future;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend;
use crate::configuration::{BackendKind, WorkloadConfig};
use crate::duration::format_duration;
use crate::metrics::MetricsSink;
use crate::run::{sleep_or_cancelled, start_read_workload, RunController, WorkloadSummary};
use crate::sharded_stats::{ReadStats, ShardedStats, StatsPrinter};
use crate::tester::{ConnectContext, SeedSummary, Tester, TesterFactory};

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Mode {
    Seed,
    Test,
}

/// Lifecycle of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum RunPhase {
    Unstarted,
    Connecting,
    Seeding,
    Testing,
    Closing,
    Done,
    Failed,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid configuration")]
    Config(#[source] anyhow::Error),

    #[error("unknown backend '{name}', expected one of: {known}")]
    UnknownBackend { name: String, known: String },

    #[error("cannot connect to {backend}")]
    Connect {
        backend: BackendKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("connecting to {backend} did not complete within {}", format_duration(*.timeout))]
    ConnectTimeout {
        backend: BackendKind,
        timeout: Duration,
    },

    #[error("seeding {backend} failed")]
    Seed {
        backend: BackendKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("read workload against {backend} could not be started")]
    Workload {
        backend: BackendKind,
        #[source]
        source: anyhow::Error,
    },
}

/// What a successful run did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunReport {
    Seeded(SeedSummary),
    Tested {
        summary: WorkloadSummary,
        elapsed: Duration,
    },
}

/// Maps backend names to the factories that connect to them.
#[derive(Default)]
pub struct Registry {
    factories: BTreeMap<BackendKind, Box<dyn TesterFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in adapter.
    pub fn with_default_backends() -> Self {
        let mut registry = Self::new();
        registry.register(BackendKind::Postgres, backend::postgres::PostgresFactory);
        registry.register(BackendKind::Mysql, backend::mysql::MysqlFactory);
        registry.register(BackendKind::Mongo, backend::mongo::MongoFactory);
        registry.register(BackendKind::Cassandra, backend::cassandra::CassandraFactory);
        registry.register(BackendKind::Etcd, backend::etcd::EtcdFactory);
        #[cfg(feature = "ydb")]
        registry.register(BackendKind::Ydb, backend::ydb::YdbFactory);
        registry
    }

    pub fn register(&mut self, backend: BackendKind, factory: impl TesterFactory + 'static) {
        self.factories.insert(backend, Box::new(factory));
    }

    /// Resolves a backend name given on the command line.
    pub fn resolve(&self, name: &str) -> Result<BackendKind, HarnessError> {
        BackendKind::from_str(name)
            .ok()
            .filter(|kind| self.factories.contains_key(kind))
            .ok_or_else(|| self.unknown(name))
    }

    fn get(&self, backend: BackendKind) -> Result<&dyn TesterFactory, HarnessError> {
        self.factories
            .get(&backend)
            .map(|f| f.as_ref())
            .ok_or_else(|| self.unknown(backend.name()))
    }

    fn unknown(&self, name: &str) -> HarnessError {
        let known = BackendKind::iter()
            .filter(|kind| self.factories.contains_key(kind))
            .map(|kind| kind.name())
            .collect::<Vec<_>>()
            .join(", ");
        HarnessError::UnknownBackend {
            name: name.to_string(),
            known,
        }
    }
}

// Logs transitions of the run state machine.
struct PhaseLog {
    backend: BackendKind,
    phase: RunPhase,
}

impl PhaseLog {
    fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            phase: RunPhase::Unstarted,
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::debug!("{}: {} -> {}", self.backend, self.phase, phase);
        self.phase = phase;
    }
}

/// Orchestrates one seed or test run against one backend.
pub struct Harness {
    registry: Registry,
    sink: Arc<dyn MetricsSink>,
    stats: Option<Arc<ShardedStats>>,
    shutdown: CancellationToken,
    handle_signals: bool,
}

impl Harness {
    /// `sink` receives the outcome of every lookup of the test phase.
    pub fn new(registry: Registry, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            registry,
            sink,
            stats: None,
            shutdown: CancellationToken::new(),
            handle_signals: false,
        }
    }

    /// Prints a progress line from `stats` every reporting interval of
    /// the test phase, and a summary at its end. `stats` must also be
    /// fed by the sink.
    pub fn with_stats(mut self, stats: Arc<ShardedStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Stops the test phase on the first Ctrl-C and aborts its workers on
    /// the second one.
    pub fn with_signal_handling(mut self) -> Self {
        self.handle_signals = true;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Cancelling this token interrupts the warm-up, the workload and the
    /// linger period.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self, mode: Mode, config: WorkloadConfig) -> Result<RunReport, HarnessError> {
        let backend = config.backend;
        let mut phase = PhaseLog::new(backend);

        let factory = self.registry.get(backend)?;
        config.validate().map_err(HarnessError::Config)?;
        let config = Arc::new(config);

        phase.enter(RunPhase::Connecting);
        let tester = match self.connect(factory, &config).await {
            Ok(tester) => tester,
            Err(err) => {
                phase.enter(RunPhase::Failed);
                return Err(err);
            }
        };

        let result = match mode {
            Mode::Seed => {
                phase.enter(RunPhase::Seeding);
                self.seed(tester.as_ref()).await.map(RunReport::Seeded)
            }
            Mode::Test => {
                phase.enter(RunPhase::Testing);
                self.test(tester.as_ref(), &config).await
            }
        };

        phase.enter(RunPhase::Closing);
        close(tester, config.connect_timeout).await;

        phase.enter(match result {
            Ok(_) => RunPhase::Done,
            Err(_) => RunPhase::Failed,
        });
        result
    }

    // Every attempt is bounded by the connect timeout, and the whole
    // construction by the retry budget of the factory.
    async fn connect(
        &self,
        factory: &dyn TesterFactory,
        config: &Arc<WorkloadConfig>,
    ) -> Result<Box<dyn Tester>, HarnessError> {
        let backend = config.backend;
        let policy = factory.retry_policy();
        let budget = policy.budget(config.connect_timeout);
        let ctx = ConnectContext {
            config: Arc::clone(config),
        };

        tracing::info!("connecting to {} at {}", backend, config.uri);
        let what = format!("connecting to {}", backend);
        let attempts = policy.run(&what, config.connect_timeout, || factory.connect(&ctx));

        match tokio::time::timeout(budget, attempts).await {
            Ok(Ok(tester)) => {
                tracing::info!("connected to {}", backend);
                Ok(tester)
            }
            Ok(Err(source)) => Err(HarnessError::Connect { backend, source }),
            Err(_) => Err(HarnessError::ConnectTimeout {
                backend,
                timeout: budget,
            }),
        }
    }

    async fn seed(&self, tester: &dyn Tester) -> Result<SeedSummary, HarnessError> {
        let backend = tester.backend();
        let started = Instant::now();

        let summary = tester
            .seed()
            .await
            .map_err(|source| HarnessError::Seed { backend, source })?;

        if summary.failed > 0 {
            tracing::warn!(
                "{}: {} of {} records could not be written",
                backend,
                summary.failed,
                summary.attempted
            );
        }
        tracing::info!(
            "{}: seeding completed, {} records written in {}",
            backend,
            summary.written(),
            format_duration(started.elapsed())
        );
        Ok(summary)
    }

    async fn test(&self, tester: &dyn Tester, config: &WorkloadConfig) -> Result<RunReport, HarnessError> {
        let backend = tester.backend();

        if !config.warmup.is_zero() {
            tracing::info!("waiting {} before starting workers", format_duration(config.warmup));
            if !sleep_or_cancelled(config.warmup, &self.shutdown).await {
                tracing::info!("interrupted during warm-up");
                return Ok(RunReport::Tested {
                    summary: WorkloadSummary::default(),
                    elapsed: Duration::ZERO,
                });
            }
        }

        let started = Instant::now();
        let (ctrl, run_finished) =
            start_read_workload(tester, config, Arc::clone(&self.sink), self.shutdown.child_token())
                .await
                .map_err(|source| HarnessError::Workload { backend, source })?;
        tracing::info!(
            "{}: {} workers reading for {}",
            backend,
            config.worker_count,
            format_duration(config.test_duration)
        );

        if self.handle_signals {
            // The task may outlive the run; it only touches the tokens.
            tokio::task::spawn(stop_on_signal(self.shutdown.clone(), Arc::new(ctrl)));
        }

        let summary = match &self.stats {
            Some(stats) => report_progress(stats, config.report_interval, run_finished).await,
            None => run_finished.await,
        };
        let elapsed = started.elapsed();

        tracing::info!(
            "{}: test completed in {}: {} reads, {} failed",
            backend,
            format_duration(elapsed),
            summary.reads(),
            summary.failures
        );
        if summary.aborted_workers > 0 {
            tracing::warn!("{}: {} workers were aborted", backend, summary.aborted_workers);
        }

        if !config.linger.is_zero() {
            tracing::info!("keeping metrics available for {}", format_duration(config.linger));
            sleep_or_cancelled(config.linger, &self.shutdown).await;
        }

        Ok(RunReport::Tested { summary, elapsed })
    }
}

// Waits for the workload, printing periodic and final statistics.
async fn report_progress(
    stats: &ShardedStats,
    interval: Duration,
    run_finished: impl Future<Output = WorkloadSummary>,
) -> WorkloadSummary {
    let mut printer = StatsPrinter::new();
    let mut combined = ReadStats::new();
    let mut ticker = tokio::time::interval(interval);
    futures::pin_mut!(run_finished);

    // Skip the first tick, which is immediate
    ticker.tick().await;

    let mut out = std::io::stdout();
    print_or_warn(printer.print_header(&mut out));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let partial = stats.get_combined_and_clear();
                print_or_warn(printer.print_partial(&partial, &mut out));
                combined.combine(&partial);
            }
            summary = &mut run_finished => {
                combined.combine(&stats.get_combined_and_clear());
                print_or_warn(printer.print_final(&combined, &mut out));
                return summary;
            }
        }
    }
}

fn print_or_warn(result: Result<()>) {
    if let Err(err) = result {
        tracing::warn!("cannot print statistics: {:#}", err);
    }
}

async fn stop_on_signal(shutdown: CancellationToken, ctrl: Arc<RunController>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::info!("interrupted, stopping workers (press Ctrl-C again to abort them)");
    shutdown.cancel();

    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::warn!("interrupted again, aborting workers");
    ctrl.abort();
}

async fn close(tester: Box<dyn Tester>, timeout: Duration) {
    let backend = tester.backend();
    if tokio::time::timeout(timeout, tester.close()).await.is_err() {
        tracing::warn!("{}: closing did not complete within {}", backend, format_duration(timeout));
    }
}
