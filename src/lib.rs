#[macro_use]
extern crate async_trait;

#[cfg(test)]
pub(crate) mod test_util;

pub mod backend;
pub mod config_file;
pub mod configuration;
pub mod driver;
pub mod duration;
pub mod exporter;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod run;
pub mod sharded_stats;
pub mod tester;
pub mod workload;
