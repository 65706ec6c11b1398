//! etcd adapter speaking to the v3 JSON gateway (`/v3/kv/*`), where keys
//! and values travel base64-encoded.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::SeedProgress;
use crate::configuration::{BackendKind, WorkloadConfig};
use crate::record::records;
use crate::retry::RetryPolicy;
use crate::tester::{ConnectContext, PointReader, ReadOutcome, SeedSummary, Tester, TesterFactory};

const CONNECT_RETRY: RetryPolicy = RetryPolicy::new(5, Duration::from_secs(5));

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: String,
}

fn base_url(uri: &str) -> String {
    let uri = uri.trim_end_matches('/');
    if uri.contains("://") {
        uri.to_string()
    } else {
        format!("http://{}", uri)
    }
}

fn record_key(table: &str, id: i64) -> String {
    base64::encode(format!("/{}/{}", table, id))
}

// Decodes the first value of a range response; a value that is not a JSON
// document is an error.
fn parse_range(response: RangeResponse) -> Result<ReadOutcome> {
    let kv = match response.kvs.into_iter().next() {
        Some(kv) => kv,
        None => return Ok(ReadOutcome::NotFound),
    };
    let value = base64::decode(&kv.value).context("value is not valid base64")?;
    serde_json::from_slice::<serde_json::Value>(&value).context("value is not a JSON document")?;
    Ok(ReadOutcome::Found)
}

/// Thin client of the gateway endpoints used by the tester.
#[derive(Clone)]
struct Gateway {
    client: reqwest::Client,
    base_url: String,
}

impl Gateway {
    fn new(uri: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("cannot build the HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url(uri),
        })
    }

    async fn call<Req: Serialize + ?Sized>(&self, path: &str, request: &Req) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/v3/{}", self.base_url, path))
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }

    async fn status(&self) -> Result<()> {
        self.call("maintenance/status", &serde_json::json!({})).await?;
        Ok(())
    }

    async fn put(&self, key: String, value: String) -> Result<()> {
        self.call("kv/put", &PutRequest { key, value }).await?;
        Ok(())
    }

    async fn range(&self, key: String) -> Result<RangeResponse> {
        let response = self.call("kv/range", &RangeRequest { key }).await?;
        Ok(response.json().await?)
    }
}

pub struct EtcdFactory;

#[async_trait]
impl TesterFactory for EtcdFactory {
    fn retry_policy(&self) -> RetryPolicy {
        CONNECT_RETRY
    }

    async fn connect(&self, ctx: &ConnectContext) -> Result<Box<dyn Tester>> {
        let config = Arc::clone(&ctx.config);
        let gateway = Gateway::new(&config.uri, config.connect_timeout)?;
        gateway
            .status()
            .await
            .context("etcd did not answer the status probe")?;

        Ok(Box::new(EtcdTester { gateway, config }))
    }
}

struct EtcdTester {
    gateway: Gateway,
    config: Arc<WorkloadConfig>,
}

#[async_trait]
impl Tester for EtcdTester {
    fn backend(&self) -> BackendKind {
        BackendKind::Etcd
    }

    // Keys need no schema; puts overwrite, so seeding again is harmless.
    async fn seed(&self) -> Result<SeedSummary> {
        let table = &self.config.table_name;
        let mut progress = SeedProgress::start(BackendKind::Etcd, self.config.record_count);
        for record in records(self.config.record_count) {
            let value = base64::encode(record.to_json().to_string());
            let result = self.gateway.put(record_key(table, record.id), value).await;
            progress.record_written(record.id, result);
        }
        Ok(progress.finish())
    }

    async fn create_reader(&self) -> Result<Box<dyn PointReader>> {
        Ok(Box::new(EtcdReader {
            gateway: self.gateway.clone(),
            table: self.config.table_name.clone(),
        }))
    }

    async fn close(self: Box<Self>) {}
}

struct EtcdReader {
    gateway: Gateway,
    table: String,
}

#[async_trait]
impl PointReader for EtcdReader {
    async fn read(&mut self, id: i64) -> Result<ReadOutcome> {
        let response = self.gateway.range(record_key(&self.table, id)).await?;
        parse_range(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SyntheticRecord;
    use crate::test_util::exercise_live_backend;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("http://localhost:2379/"), "http://localhost:2379");
        assert_eq!(base_url("localhost:2379"), "http://localhost:2379");
        assert_eq!(base_url("https://etcd:2379"), "https://etcd:2379");
    }

    #[test]
    fn test_record_key() {
        let key = base64::decode(record_key("experiment_rules", 42)).unwrap();
        assert_eq!(key, b"/experiment_rules/42");
    }

    #[test]
    fn test_parse_range() {
        let empty: RangeResponse = serde_json::from_str(r#"{"header":{},"count":"0"}"#).unwrap();
        assert_eq!(parse_range(empty).unwrap(), ReadOutcome::NotFound);

        let value = base64::encode(SyntheticRecord::new(3).to_json().to_string());
        let found: RangeResponse = serde_json::from_str(&format!(
            r#"{{"kvs":[{{"key":"{}","value":"{}"}}],"count":"1"}}"#,
            record_key("t", 3),
            value
        ))
        .unwrap();
        assert_eq!(parse_range(found).unwrap(), ReadOutcome::Found);

        let garbage = RangeResponse {
            kvs: vec![KeyValue {
                value: base64::encode("not json"),
            }],
        };
        assert!(parse_range(garbage).is_err());
    }

    #[tokio::test]
    #[ignore = "needs an etcd server with the JSON gateway, see ETCD_URI"]
    async fn test_seed_and_read() {
        exercise_live_backend(&EtcdFactory, BackendKind::Etcd).await;
    }
}
