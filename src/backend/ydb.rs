//! YDB adapter. Rows live under `{dbName}/{tableName}` inside the
//! database named by the connection string, e.g.
//! `grpc://localhost:2136?database=/local`.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use ydb::{ydb_params, ydb_struct, Client, ClientBuilder, Query, TableClient, Value};

use crate::backend::SeedProgress;
use crate::configuration::{BackendKind, WorkloadConfig};
use crate::record::{batches, SyntheticRecord};
use crate::tester::{ConnectContext, PointReader, ReadOutcome, SeedSummary, Tester, TesterFactory};

const BATCH_SIZE: usize = 1_000;

fn ydb_error<E: Debug>(what: &'static str) -> impl FnOnce(E) -> anyhow::Error {
    move |err| anyhow::anyhow!("{}: {:?}", what, err)
}

fn table_path(db_name: &str, table: &str) -> String {
    format!("{}/{}", db_name, table)
}

fn create_table_query(path: &str) -> String {
    format!(
        "CREATE TABLE `{}` (\
        id Int64, \
        experiment_name Utf8, \
        targeting_rules Json, \
        PRIMARY KEY (id))",
        path,
    )
}

fn upsert_query(path: &str) -> String {
    format!(
        "DECLARE $rows AS List<Struct<id: Int64, experiment_name: Utf8, targeting_rules: Json>>;\n\
        UPSERT INTO `{}` SELECT * FROM AS_TABLE($rows);",
        path,
    )
}

fn select_query(path: &str) -> String {
    format!(
        "DECLARE $id AS Int64;\n\
        SELECT id FROM `{}` WHERE id = $id;",
        path,
    )
}

fn row_value(record: &SyntheticRecord) -> Value {
    ydb_struct!(
        "id" => record.id,
        "experiment_name" => record.experiment_name.clone(),
        "targeting_rules" => Value::Json(record.targeting_rules.clone())
    )
}

pub struct YdbFactory;

#[async_trait]
impl TesterFactory for YdbFactory {
    async fn connect(&self, ctx: &ConnectContext) -> Result<Box<dyn Tester>> {
        let config = Arc::clone(&ctx.config);
        let client = ClientBuilder::new_from_connection_string(config.uri.as_str())
            .map_err(ydb_error("invalid YDB connection string"))?
            .client()
            .map_err(ydb_error("cannot create the YDB client"))?;

        // Discovery doubles as the reachability probe
        client
            .wait()
            .await
            .map_err(ydb_error("YDB did not answer the discovery request"))?;

        let table = client.table_client();
        Ok(Box::new(YdbTester {
            client,
            table,
            config,
        }))
    }
}

struct YdbTester {
    client: Client,
    table: TableClient,
    config: Arc<WorkloadConfig>,
}

impl YdbTester {
    fn path(&self) -> String {
        table_path(&self.config.db_name, &self.config.table_name)
    }

    async fn write_batch(&self, upsert: &str, rows: Vec<Value>) -> Result<()> {
        let example = ydb_struct!(
            "id" => 0_i64,
            "experiment_name" => String::new(),
            "targeting_rules" => Value::Json(String::new())
        );
        let rows = Value::list_from(example, rows).map_err(ydb_error("malformed batch"))?;

        self.table
            .retry_transaction(|mut t| {
                let query = Query::new(upsert.to_owned()).with_params(ydb_params!("$rows" => rows.clone()));
                async move {
                    t.query(query).await?;
                    t.commit().await?;
                    Ok(())
                }
            })
            .await
            .map_err(ydb_error("bulk upsert failed"))
    }
}

#[async_trait]
impl Tester for YdbTester {
    fn backend(&self) -> BackendKind {
        BackendKind::Ydb
    }

    // YDB has no CREATE TABLE IF NOT EXISTS on older servers; a failing
    // create is treated as an existing table. Upserts make re-seeding safe.
    async fn seed(&self) -> Result<SeedSummary> {
        let path = self.path();
        if let Err(err) = self
            .table
            .retry_execute_scheme_query(create_table_query(&path))
            .await
        {
            tracing::warn!("ydb: cannot create table {} (may already exist): {:?}", path, err);
        }

        let upsert = upsert_query(&path);
        let mut progress = SeedProgress::start(BackendKind::Ydb, self.config.record_count);
        for batch in batches(self.config.record_count, BATCH_SIZE) {
            let len = batch.len() as u64;
            let last_id = batch.last().map_or(0, |r| r.id);
            let rows = batch.iter().map(row_value).collect();

            let failed = match self.write_batch(&upsert, rows).await {
                Ok(()) => 0,
                Err(err) => {
                    tracing::warn!("ydb: batch up to record {} failed: {:#}", last_id, err);
                    len
                }
            };
            progress.batch_written(last_id, len, failed);
        }
        Ok(progress.finish())
    }

    async fn create_reader(&self) -> Result<Box<dyn PointReader>> {
        Ok(Box::new(YdbReader {
            table: self.table.clone(),
            query: select_query(&self.path()),
        }))
    }

    async fn close(self: Box<Self>) {
        // Sessions and channels go away with the client
        drop(self.table);
        drop(self.client);
    }
}

struct YdbReader {
    table: TableClient,
    query: String,
}

#[async_trait]
impl PointReader for YdbReader {
    async fn read(&mut self, id: i64) -> Result<ReadOutcome> {
        let text = &self.query;
        let found = self
            .table
            .retry_transaction(|mut t| {
                let query = Query::new(text.clone()).with_params(ydb_params!("$id" => id));
                async move {
                    let result = t.query(query).await?;
                    Ok(result.into_only_result()?.rows().next().is_some())
                }
            })
            .await
            .map_err(ydb_error("point read failed"))?;

        Ok(if found {
            ReadOutcome::Found
        } else {
            ReadOutcome::NotFound
        })
    }
}
