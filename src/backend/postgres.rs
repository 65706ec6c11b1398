use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Statement};

use crate::backend::{LazyReader, PreparedLookup, SeedProgress};
use crate::configuration::{BackendKind, WorkloadConfig};
use crate::record::records;
use crate::tester::{ConnectContext, PointReader, ReadOutcome, SeedSummary, Tester, TesterFactory};

pub struct PostgresFactory;

#[async_trait]
impl TesterFactory for PostgresFactory {
    async fn connect(&self, ctx: &ConnectContext) -> Result<Box<dyn Tester>> {
        let config = Arc::clone(&ctx.config);
        let (client, connection) = tokio_postgres::connect(&config.uri, NoTls)
            .await
            .context("cannot connect to PostgreSQL")?;

        // The connection object performs the actual communication with the
        // database; it finishes once the client is dropped
        let connection = tokio::task::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", err);
            }
        });

        if let Err(err) = client.simple_query("SELECT 1").await {
            connection.abort();
            return Err(err).context("PostgreSQL did not answer the reachability probe");
        }

        Ok(Box::new(PostgresTester {
            client: Arc::new(client),
            connection,
            config,
        }))
    }
}

struct PostgresTester {
    client: Arc<Client>,
    connection: JoinHandle<()>,
    config: Arc<WorkloadConfig>,
}

#[async_trait]
impl Tester for PostgresTester {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn seed(&self) -> Result<SeedSummary> {
        let table = &self.config.table_name;
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
            id BIGINT PRIMARY KEY, \
            experiment_name TEXT, \
            targeting_rules JSONB)",
            table,
        );
        self.client
            .batch_execute(&create_table)
            .await
            .with_context(|| format!("cannot create table {}", table))?;

        let insert = self
            .client
            .prepare(&format!(
                "INSERT INTO {} (id, experiment_name, targeting_rules) \
                VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
                table,
            ))
            .await
            .context("cannot prepare the insert statement")?;

        let mut progress = SeedProgress::start(BackendKind::Postgres, self.config.record_count);
        for record in records(self.config.record_count) {
            let rules = record.targeting_rules_json();
            let result = self
                .client
                .execute(&insert, &[&record.id, &record.experiment_name, &rules])
                .await;
            progress.record_written(record.id, result.map(|_| ()).map_err(Into::into));
        }
        Ok(progress.finish())
    }

    async fn create_reader(&self) -> Result<Box<dyn PointReader>> {
        let lookup = PostgresLookup {
            client: Arc::clone(&self.client),
            query: format!("SELECT id FROM {} WHERE id = $1", self.config.table_name),
        };
        Ok(Box::new(LazyReader::new(BackendKind::Postgres, lookup).await))
    }

    async fn close(self: Box<Self>) {
        let PostgresTester {
            client, connection, ..
        } = *self;
        drop(client);
        // Finishes once the last client handle is gone
        if let Err(err) = connection.await {
            tracing::debug!("PostgreSQL connection task ended abnormally: {}", err);
        }
    }
}

struct PostgresLookup {
    client: Arc<Client>,
    query: String,
}

#[async_trait]
impl PreparedLookup for PostgresLookup {
    type Statement = Statement;

    async fn prepare(&mut self) -> Result<Statement> {
        self.client
            .prepare(&self.query)
            .await
            .context("cannot prepare the select statement")
    }

    async fn execute(&mut self, statement: &Statement, id: i64) -> Result<ReadOutcome> {
        let row = self.client.query_opt(statement, &[&id]).await?;
        Ok(match row {
            Some(_) => ReadOutcome::Found,
            None => ReadOutcome::NotFound,
        })
    }
}
