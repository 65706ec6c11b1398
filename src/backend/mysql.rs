use std::sync::Arc;

use anyhow::{Context, Result};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Statement};

use crate::backend::{LazyReader, PreparedLookup, SeedProgress};
use crate::configuration::{BackendKind, WorkloadConfig};
use crate::record::records;
use crate::tester::{ConnectContext, PointReader, ReadOutcome, SeedSummary, Tester, TesterFactory};

// Connections kept on top of one per worker, for seeding and probes.
const SPARE_CONNECTIONS: usize = 10;

pub struct MysqlFactory;

#[async_trait]
impl TesterFactory for MysqlFactory {
    async fn connect(&self, ctx: &ConnectContext) -> Result<Box<dyn Tester>> {
        let config = Arc::clone(&ctx.config);

        let opts = Opts::from_url(&config.uri).context("invalid MySQL URI")?;
        let max_connections = config.worker_count as usize + SPARE_CONNECTIONS;
        let constraints = PoolConstraints::new(0, max_connections)
            .context("invalid MySQL pool constraints")?;
        let opts = OptsBuilder::from_opts(opts)
            .pool_opts(PoolOpts::default().with_constraints(constraints));
        let pool = Pool::new(opts);

        let probe = async {
            let mut conn = pool.get_conn().await?;
            conn.ping().await
        }
        .await;
        if let Err(err) = probe {
            let _ = pool.disconnect().await;
            return Err(err).context("MySQL did not answer the reachability probe");
        }

        Ok(Box::new(MysqlTester { pool, config }))
    }
}

struct MysqlTester {
    pool: Pool,
    config: Arc<WorkloadConfig>,
}

#[async_trait]
impl Tester for MysqlTester {
    fn backend(&self) -> BackendKind {
        BackendKind::Mysql
    }

    async fn seed(&self) -> Result<SeedSummary> {
        let table = &self.config.table_name;
        let mut conn = self.pool.get_conn().await?;

        conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {} (\
            id BIGINT PRIMARY KEY, \
            experiment_name TEXT, \
            targeting_rules JSON)",
            table,
        ))
        .await
        .with_context(|| format!("cannot create table {}", table))?;

        let insert = conn
            .prep(format!(
                "INSERT IGNORE INTO {} (id, experiment_name, targeting_rules) VALUES (?, ?, ?)",
                table,
            ))
            .await
            .context("cannot prepare the insert statement")?;

        let mut progress = SeedProgress::start(BackendKind::Mysql, self.config.record_count);
        for record in records(self.config.record_count) {
            let id = record.id;
            let result = conn
                .exec_drop(
                    &insert,
                    (record.id, record.experiment_name, record.targeting_rules),
                )
                .await;
            progress.record_written(id, result.map_err(Into::into));
        }
        Ok(progress.finish())
    }

    // Each worker gets its own pooled connection and prepared statement.
    async fn create_reader(&self) -> Result<Box<dyn PointReader>> {
        let conn = self
            .pool
            .get_conn()
            .await
            .context("cannot take a connection from the pool")?;
        let lookup = MysqlLookup {
            conn,
            query: format!("SELECT id FROM {} WHERE id = ?", self.config.table_name),
        };
        Ok(Box::new(LazyReader::new(BackendKind::Mysql, lookup).await))
    }

    async fn close(self: Box<Self>) {
        if let Err(err) = self.pool.disconnect().await {
            tracing::warn!("cannot disconnect the MySQL pool: {}", err);
        }
    }
}

struct MysqlLookup {
    conn: Conn,
    query: String,
}

#[async_trait]
impl PreparedLookup for MysqlLookup {
    type Statement = Statement;

    async fn prepare(&mut self) -> Result<Statement> {
        self.conn
            .prep(self.query.as_str())
            .await
            .context("cannot prepare the select statement")
    }

    async fn execute(&mut self, statement: &Statement, id: i64) -> Result<ReadOutcome> {
        let row: Option<i64> = self.conn.exec_first(statement, (id,)).await?;
        Ok(match row {
            Some(_) => ReadOutcome::Found,
            None => ReadOutcome::NotFound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::exercise_live_backend;

    #[tokio::test]
    #[ignore = "needs a MySQL server, see MYSQL_URI"]
    async fn test_seed_and_read() {
        exercise_live_backend(&MysqlFactory, BackendKind::Mysql).await;
    }
}
