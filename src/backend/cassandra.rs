use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::statement::prepared::PreparedStatement;
use scylla::statement::Consistency;

use crate::backend::{LazyReader, PreparedLookup, SeedProgress};
use crate::configuration::{BackendKind, WorkloadConfig};
use crate::record::records;
use crate::retry::RetryPolicy;
use crate::tester::{ConnectContext, PointReader, ReadOutcome, SeedSummary, Tester, TesterFactory};

/// Freshly started clusters often refuse connections for a while.
const CONNECT_RETRY: RetryPolicy = RetryPolicy::new(5, Duration::from_secs(5));

pub struct CassandraFactory;

#[async_trait]
impl TesterFactory for CassandraFactory {
    fn retry_policy(&self) -> RetryPolicy {
        CONNECT_RETRY
    }

    async fn connect(&self, ctx: &ConnectContext) -> Result<Box<dyn Tester>> {
        let config = Arc::clone(&ctx.config);
        let session = SessionBuilder::new()
            .known_node(&config.uri)
            .connection_timeout(config.connect_timeout)
            .build()
            .await
            .context("cannot connect to Cassandra")?;

        create_keyspace(&session, &keyspace_name(&config.db_name)).await?;

        Ok(Box::new(CassandraTester {
            session: Arc::new(session),
            config,
        }))
    }
}

// Unquoted CQL identifiers are case-insensitive and stored in lower case.
fn keyspace_name(db_name: &str) -> String {
    db_name.to_ascii_lowercase()
}

async fn create_keyspace(session: &Session, keyspace: &str) -> Result<()> {
    let create_keyspace_query_str = format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
        {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
        keyspace,
    );
    session
        .query_unpaged(create_keyspace_query_str, ())
        .await
        .with_context(|| format!("cannot create keyspace {}", keyspace))?;
    session.use_keyspace(keyspace, false).await?;
    session.await_schema_agreement().await?;
    Ok(())
}

struct CassandraTester {
    session: Arc<Session>,
    config: Arc<WorkloadConfig>,
}

#[async_trait]
impl Tester for CassandraTester {
    fn backend(&self) -> BackendKind {
        BackendKind::Cassandra
    }

    async fn seed(&self) -> Result<SeedSummary> {
        let table = &self.config.table_name;
        let create_table_query_str = format!(
            "CREATE TABLE IF NOT EXISTS {} \
            (id bigint PRIMARY KEY, experiment_name text, targeting_rules text)",
            table,
        );
        self.session
            .query_unpaged(create_table_query_str, ())
            .await
            .with_context(|| format!("cannot create table {}", table))?;
        self.session.await_schema_agreement().await?;

        let insert = self
            .session
            .prepare(format!(
                "INSERT INTO {} (id, experiment_name, targeting_rules) VALUES (?, ?, ?)",
                table,
            ))
            .await
            .context("cannot prepare the insert statement")?;

        // Inserts are upserts, so seeding again does not duplicate rows
        let mut progress = SeedProgress::start(BackendKind::Cassandra, self.config.record_count);
        for record in records(self.config.record_count) {
            let result = self
                .session
                .execute_unpaged(
                    &insert,
                    (record.id, &record.experiment_name, &record.targeting_rules),
                )
                .await;
            progress.record_written(record.id, result.map(|_| ()).map_err(Into::into));
        }
        Ok(progress.finish())
    }

    async fn create_reader(&self) -> Result<Box<dyn PointReader>> {
        let lookup = CassandraLookup {
            session: Arc::clone(&self.session),
            query: format!("SELECT id FROM {} WHERE id = ?", self.config.table_name),
        };
        Ok(Box::new(LazyReader::new(BackendKind::Cassandra, lookup).await))
    }

    async fn close(self: Box<Self>) {
        // The session closes its connections when dropped
        drop(self.session);
    }
}

struct CassandraLookup {
    session: Arc<Session>,
    query: String,
}

#[async_trait]
impl PreparedLookup for CassandraLookup {
    type Statement = PreparedStatement;

    async fn prepare(&mut self) -> Result<PreparedStatement> {
        let mut statement = self
            .session
            .prepare(self.query.as_str())
            .await
            .context("cannot prepare the select statement")?;
        statement.set_consistency(Consistency::One);
        Ok(statement)
    }

    async fn execute(&mut self, statement: &PreparedStatement, id: i64) -> Result<ReadOutcome> {
        let row = self
            .session
            .execute_unpaged(statement, (id,))
            .await?
            .into_rows_result()?
            .maybe_first_row::<(i64,)>()?;
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

    #[test]
    fn test_connect_is_retried() {
        let policy = CassandraFactory.retry_policy();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(5));
    }

    #[test]
    fn test_keyspace_name_is_folded_to_lower_case() {
        assert_eq!(keyspace_name("AbTests"), "abtests");
        assert_eq!(keyspace_name("ab_tests"), "ab_tests");
    }

    #[tokio::test]
    #[ignore = "needs a Cassandra or Scylla node, see CASSANDRA_URI"]
    async fn test_seed_and_read() {
        exercise_live_backend(&CassandraFactory, BackendKind::Cassandra).await;
    }
}
