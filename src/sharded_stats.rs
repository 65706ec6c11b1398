use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hdrhistogram::Histogram;
use parking_lot::{Mutex, MutexGuard};
use thread_local::ThreadLocal;
use tokio::time::Instant;

use crate::duration::format_duration;
use crate::metrics::MetricsSink;

// Latencies are recorded in microseconds, with 3 significant figures.
const LATENCY_SIG_FIG: u8 = 3;
const LATENCY_RESOLUTION_NANOS: u64 = 1_000;

/// Counters and latency histogram of the reads performed in some period.
pub struct ReadStats {
    pub successes: u64,
    pub failures: u64,
    pub latency: Histogram<u64>,
}

impl ReadStats {
    pub fn new() -> Self {
        Self {
            successes: 0,
            failures: 0,
            latency: Histogram::new(LATENCY_SIG_FIG)
                .expect("3 significant figures is a valid histogram precision"),
        }
    }

    pub fn operations(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn clear(&mut self) {
        self.successes = 0;
        self.failures = 0;
        self.latency.reset();
    }

    pub fn combine(&mut self, other: &Self) {
        self.successes += other.successes;
        self.failures += other.failures;
        // Both histograms are auto-resizing, so adding cannot overflow
        let _ = self.latency.add(&other.latency);
    }

    fn record_latency(&mut self, latency: Duration) {
        let value = (latency.as_nanos() as u64 / LATENCY_RESOLUTION_NANOS).max(1);
        let _ = self.latency.record(value);
    }

    fn latency_at(&self, quantile: f64) -> Duration {
        Duration::from_micros(self.latency.value_at_quantile(quantile))
    }
}

impl Default for ReadStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Read statistics sharded per thread.
///
/// Every thread accounts its reads in its own shard, protected by its own
/// parking_lot::Mutex. Shards are only contended when the reporter
/// collects them, once per reporting interval: it locks them one at a
/// time, combines them into one object and clears them.
pub struct ShardedStats {
    shards: ThreadLocal<Arc<Mutex<ReadStats>>>,
    all: Mutex<Vec<Arc<Mutex<ReadStats>>>>,
}

impl ShardedStats {
    pub fn new() -> Self {
        Self {
            shards: ThreadLocal::new(),
            all: Mutex::new(Vec::new()),
        }
    }

    /// Gets and locks access to this thread's shard.
    fn shard_mut(&self) -> MutexGuard<'_, ReadStats> {
        self.shards
            .get_or(|| {
                let shard = Arc::new(Mutex::new(ReadStats::new()));
                self.all.lock().push(shard.clone());
                shard
            })
            .lock()
    }

    /// Combines statistics from all threads and clears all threads' shards.
    pub fn get_combined_and_clear(&self) -> ReadStats {
        let mut combined = ReadStats::new();
        for shard in self.all.lock().iter() {
            let shard = &mut shard.lock();
            combined.combine(shard);
            shard.clear();
        }
        combined
    }
}

impl Default for ShardedStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for ShardedStats {
    fn read_succeeded(&self, _backend: &str) {
        self.shard_mut().successes += 1;
    }

    fn read_failed(&self, _backend: &str) {
        self.shard_mut().failures += 1;
    }

    fn observe_latency(&self, _backend: &str, latency: Duration) {
        self.shard_mut().record_latency(latency);
    }
}

/// Prints periodic progress lines and the final summary of a read workload.
pub struct StatsPrinter {
    start_time: Instant,
    previous_time: Instant,
}

impl StatsPrinter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            previous_time: now,
        }
    }

    pub fn print_header(&self, out: &mut impl Write) -> Result<()> {
        writeln!(
            out,
            "{:9} {:>8} {:>7} {:>8} {:>8} {:>8} {:>8}",
            "time", "ops/s", "errors", "max", "99th", "median", "mean",
        )?;
        Ok(())
    }

    pub fn print_partial(&mut self, stats: &ReadStats, out: &mut impl Write) -> Result<()> {
        let now = Instant::now();
        let period = (now - self.previous_time).as_secs_f64();
        let ops_per_second = if period > 0.0 {
            stats.operations() as f64 / period
        } else {
            0.0
        };

        writeln!(
            out,
            "{:9} {:>8.0} {:>7} {:>8} {:>8} {:>8} {:>8}",
            format_duration(now - self.start_time),
            ops_per_second,
            stats.failures,
            format_duration(Duration::from_micros(stats.latency.max())),
            format_duration(stats.latency_at(0.99)),
            format_duration(stats.latency_at(0.5)),
            format_duration(Duration::from_micros(stats.latency.mean() as u64)),
        )?;

        self.previous_time = now;
        Ok(())
    }

    pub fn print_final(&self, stats: &ReadStats, out: &mut impl Write) -> Result<()> {
        let time = Instant::now() - self.start_time;
        writeln!(out)?;
        writeln!(out, "Results:")?;
        writeln!(out, "Time:\t\t{}", format_duration(time))?;
        writeln!(out, "Total reads:\t{}", stats.operations())?;
        writeln!(out, "Successful:\t{}", stats.successes)?;
        writeln!(out, "Failed:\t\t{}", stats.failures)?;

        let secs = time.as_secs_f64();
        if secs > 0.0 {
            writeln!(out, "Reads/s:\t{:.1}", stats.operations() as f64 / secs)?;
        }

        if !stats.latency.is_empty() {
            writeln!(out, "Latency:")?;
            writeln!(out, "  max:\t\t{}", format_duration(Duration::from_micros(stats.latency.max())))?;
            writeln!(out, "  99.9th:\t{}", format_duration(stats.latency_at(0.999)))?;
            writeln!(out, "  99th:\t\t{}", format_duration(stats.latency_at(0.99)))?;
            writeln!(out, "  95th:\t\t{}", format_duration(stats.latency_at(0.95)))?;
            writeln!(out, "  median:\t{}", format_duration(stats.latency_at(0.5)))?;
            writeln!(
                out,
                "  mean:\t\t{}",
                format_duration(Duration::from_micros(stats.latency.mean() as u64))
            )?;
        }

        Ok(())
    }
}

impl Default for StatsPrinter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_stats_are_cleared() {
        let stats = ShardedStats::new();
        stats.read_succeeded("postgres");
        stats.read_succeeded("postgres");
        stats.read_failed("postgres");
        stats.observe_latency("postgres", Duration::from_millis(2));
        stats.observe_latency("postgres", Duration::from_millis(4));

        let combined = stats.get_combined_and_clear();
        assert_eq!(combined.successes, 2);
        assert_eq!(combined.failures, 1);
        assert_eq!(combined.operations(), 3);
        assert_eq!(combined.latency.len(), 2);

        let empty = stats.get_combined_and_clear();
        assert_eq!(empty.operations(), 0);
        assert!(empty.latency.is_empty());
    }

    #[test]
    fn test_shards_from_many_threads_are_combined() {
        let stats = Arc::new(ShardedStats::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        stats.read_succeeded("mysql");
                        stats.observe_latency("mysql", Duration::from_micros(100));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let combined = stats.get_combined_and_clear();
        assert_eq!(combined.successes, 1000);
        assert_eq!(combined.latency.len(), 1000);
    }

    #[test]
    fn test_printer_output() {
        let stats = ShardedStats::new();
        stats.read_succeeded("etcd");
        stats.read_failed("etcd");
        stats.observe_latency("etcd", Duration::from_micros(1500));
        let combined = stats.get_combined_and_clear();

        let mut printer = StatsPrinter::new();
        let mut out = Vec::new();
        printer.print_header(&mut out).unwrap();
        printer.print_partial(&combined, &mut out).unwrap();
        printer.print_final(&combined, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ops/s"));
        assert!(text.contains("Total reads:\t2"));
        assert!(text.contains("Failed:\t\t1"));
        assert!(text.contains("median:"));
    }
}
