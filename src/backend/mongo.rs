use std::sync::Arc;

use anyhow::{Context, Result};
use mongodb::bson::{doc, Document};
use mongodb::error::ErrorKind;
use mongodb::{Client, Collection};

use crate::backend::SeedProgress;
use crate::configuration::{BackendKind, WorkloadConfig};
use crate::record::{batches, SyntheticRecord};
use crate::tester::{ConnectContext, PointReader, ReadOutcome, SeedSummary, Tester, TesterFactory};

const BATCH_SIZE: usize = 10_000;
const DUPLICATE_KEY: i32 = 11000;

pub struct MongoFactory;

#[async_trait]
impl TesterFactory for MongoFactory {
    async fn connect(&self, ctx: &ConnectContext) -> Result<Box<dyn Tester>> {
        let config = Arc::clone(&ctx.config);
        let client = Client::with_uri_str(&config.uri)
            .await
            .context("invalid MongoDB URI")?;

        let probe = client.database("admin").run_command(doc! { "ping": 1 }).await;
        if let Err(err) = probe {
            client.shutdown().await;
            return Err(err).context("MongoDB did not answer the reachability probe");
        }

        Ok(Box::new(MongoTester { client, config }))
    }
}

struct MongoTester {
    client: Client,
    config: Arc<WorkloadConfig>,
}

impl MongoTester {
    fn collection<T: Send + Sync>(&self) -> Collection<T> {
        self.client
            .database(&self.config.db_name)
            .collection(&self.config.table_name)
    }
}

// Number of records of a batch that were not written. Records that already
// exist from an earlier seeding pass do not count as failures.
fn failed_in_batch(err: &mongodb::error::Error, batch_len: u64) -> u64 {
    match err.kind.as_ref() {
        ErrorKind::InsertMany(failure) => match &failure.write_errors {
            Some(errors) => errors.iter().filter(|e| e.code != DUPLICATE_KEY).count() as u64,
            None => batch_len,
        },
        _ => batch_len,
    }
}

#[async_trait]
impl Tester for MongoTester {
    fn backend(&self) -> BackendKind {
        BackendKind::Mongo
    }

    async fn seed(&self) -> Result<SeedSummary> {
        let collection = self.collection::<SyntheticRecord>();
        let mut progress = SeedProgress::start(BackendKind::Mongo, self.config.record_count);

        for batch in batches(self.config.record_count, BATCH_SIZE) {
            let len = batch.len() as u64;
            let last_id = batch.last().map_or(0, |r| r.id);

            // Unordered, so that a duplicate does not stop the rest of the batch
            let failed = match collection.insert_many(batch).ordered(false).await {
                Ok(_) => 0,
                Err(err) => {
                    let failed = failed_in_batch(&err, len);
                    if failed > 0 {
                        tracing::warn!("mongo: bulk write up to record {} failed: {}", last_id, err);
                    }
                    failed
                }
            };
            progress.batch_written(last_id, len, failed);
        }
        Ok(progress.finish())
    }

    async fn create_reader(&self) -> Result<Box<dyn PointReader>> {
        Ok(Box::new(MongoReader {
            collection: self.collection::<Document>(),
        }))
    }

    async fn close(self: Box<Self>) {
        self.client.shutdown().await;
    }
}

struct MongoReader {
    collection: Collection<Document>,
}

#[async_trait]
impl PointReader for MongoReader {
    async fn read(&mut self, id: i64) -> Result<ReadOutcome> {
        let found = self
            .collection
            .find_one(doc! { "_id": id })
            .projection(doc! { "_id": 1 })
            .await?;
        Ok(match found {
            Some(_) => ReadOutcome::Found,
            None => ReadOutcome::NotFound,
        })
    }
}

#[cfg(test)]
mod tests {
    use mongodb::error::InsertManyError;

    use super::*;
    use crate::test_util::exercise_live_backend;

    fn insert_many_error(codes: &[i32]) -> mongodb::error::Error {
        let write_errors: Vec<Document> = codes
            .iter()
            .enumerate()
            .map(|(index, code)| doc! { "index": index as i32, "code": *code, "errmsg": "write failed" })
            .collect();
        let failure: InsertManyError =
            mongodb::bson::from_document(doc! { "writeErrors": write_errors }).unwrap();
        ErrorKind::InsertMany(failure).into()
    }

    #[test]
    fn test_duplicates_of_earlier_seeding_are_not_failures() {
        let err = insert_many_error(&[DUPLICATE_KEY, DUPLICATE_KEY, DUPLICATE_KEY]);
        assert_eq!(failed_in_batch(&err, 10), 0);
    }

    #[test]
    fn test_other_write_errors_are_failures() {
        // 121: document failed validation
        let err = insert_many_error(&[DUPLICATE_KEY, 121, DUPLICATE_KEY, 121]);
        assert_eq!(failed_in_batch(&err, 10), 2);
    }

    #[test]
    fn test_errors_without_write_details_fail_the_whole_batch() {
        let err = mongodb::error::Error::custom("connection reset");
        assert_eq!(failed_in_batch(&err, 10), 10);
    }

    #[tokio::test]
    #[ignore = "needs a MongoDB server, see MONGO_URI"]
    async fn test_seed_and_read() {
        exercise_live_backend(&MongoFactory, BackendKind::Mongo).await;
    }
}
