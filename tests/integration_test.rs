//! Integration tests for flurry

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use flate2::Compression;
use flate2::write::GzEncoder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use flurry::checkpoint::{CheckpointStore, MemoryCheckpointStore, encode_row_key};
use flurry::config::{CompressionFormat, RetryConfig};
use flurry::delivery::{DeliveryClient, RetryPolicy, StaticTokenProvider, TokenCache};
use flurry::metrics::server::MetricsController;
use flurry::source::{ObjectStoreSource, SourceRegistry};
use flurry::{BatchSettings, CycleReport, Forwarder, ForwarderContext, WorkItem};

const ACCOUNT: &str = "acct";
const CONTAINER: &str = "logs";
const CUSTOMER: &str = "cust-1";
const LOG_TYPE: &str = "AZURE_AD";

/// A recorded ingestion request.
#[derive(Debug, Clone)]
struct Request {
    authorization: Option<String>,
    size: usize,
    body: Value,
}

struct IngestState {
    requests: Mutex<Vec<Request>>,
    statuses: Mutex<VecDeque<u16>>,
    /// Requests wait here while the value is `false`.
    open: watch::Sender<bool>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for IngestState {
    fn default() -> Self {
        Self {
            requests: Mutex::default(),
            statuses: Mutex::default(),
            open: watch::Sender::new(true),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

/// In-process ingestion endpoint. Answers with queued statuses, then 200.
#[derive(Clone)]
struct IngestServer {
    url: String,
    state: Arc<IngestState>,
}

impl IngestServer {
    async fn start() -> Self {
        let state = Arc::new(IngestState::default());
        let app = Router::new()
            .route("/ingest", post(ingest))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        Self {
            url: format!("http://{addr}/ingest"),
            state,
        }
    }

    fn respond_with(&self, statuses: &[u16]) {
        self.state
            .statuses
            .lock()
            .unwrap()
            .extend(statuses.iter().copied());
    }

    /// Park incoming requests until [`release`](Self::release).
    fn hold(&self) {
        self.state.open.send_replace(false);
    }

    fn release(&self) {
        self.state.open.send_replace(true);
    }

    fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// Wait until exactly `n` requests are parked.
    async fn wait_for_in_flight(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.in_flight() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("requests never arrived");
    }

    fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Entries of every accepted request, in arrival order.
    fn delivered_entries(&self) -> Vec<Value> {
        self.requests()
            .into_iter()
            .flat_map(|r| r.body["entries"].as_array().cloned().unwrap_or_default())
            .collect()
    }
}

async fn ingest(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, Json<Value>) {
    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak.fetch_max(current, Ordering::SeqCst);
    let mut open = state.open.subscribe();
    let _ = open.wait_for(|open| *open).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    let status = state.statuses.lock().unwrap().pop_front().unwrap_or(200);
    let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.requests.lock().unwrap().push(Request {
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        size: body.len(),
        body: parsed,
    });
    (
        StatusCode::from_u16(status).unwrap(),
        Json(json!({ "status": status })),
    )
}

struct Harness {
    store: Arc<InMemory>,
    checkpoints: Arc<MemoryCheckpointStore>,
    server: IngestServer,
    shutdown: CancellationToken,
    forwarder: Forwarder,
}

struct HarnessOptions {
    items: Vec<WorkItem>,
    max_bytes: usize,
    max_entries: Option<usize>,
    concurrency: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            items: vec![work_item(CONTAINER, &[])],
            max_bytes: 1_000_000,
            max_entries: None,
            concurrency: 4,
        }
    }
}

fn work_item(container: &str, prefixes: &[&str]) -> WorkItem {
    WorkItem {
        tenant: "contoso".into(),
        account: ACCOUNT.into(),
        container: container.into(),
        prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        log_type: LOG_TYPE.into(),
        compression: CompressionFormat::Auto,
    }
}

impl Harness {
    async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    async fn with_options(options: HarnessOptions) -> Self {
        let store = Arc::new(InMemory::new());
        let containers: Vec<(String, Arc<dyn ObjectStore>)> = options
            .items
            .iter()
            .map(|item| (item.container.clone(), store.clone() as Arc<dyn ObjectStore>))
            .collect();

        let mut sources = SourceRegistry::new();
        sources.insert(ACCOUNT, Arc::new(ObjectStoreSource::from_stores(ACCOUNT, containers)));

        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let server = IngestServer::start().await;

        let retry = RetryPolicy::from(&RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10,
        });
        let delivery = DeliveryClient::new(
            reqwest::Client::new(),
            server.url.clone(),
            CUSTOMER,
            TokenCache::new(Arc::new(StaticTokenProvider::new("test-token"))),
            retry,
        );

        let context = Arc::new(ForwarderContext::new(
            sources,
            checkpoints.clone(),
            Arc::new(delivery),
            BatchSettings {
                max_bytes: options.max_bytes,
                max_entries: options.max_entries,
            },
        ));

        let shutdown = CancellationToken::new();
        let forwarder = Forwarder::new(
            context,
            options.items,
            options.concurrency,
            shutdown.clone(),
        );

        Self {
            store,
            checkpoints,
            server,
            shutdown,
            forwarder,
        }
    }

    async fn put(&self, name: &str, body: impl Into<PutPayload>) {
        self.store.put(&Path::from(name), body.into()).await.unwrap();
    }

    async fn cycle(&self) -> CycleReport {
        self.forwarder.run_cycle().await
    }
}

fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

mod delivery_tests {
    use super::*;

    #[tokio::test]
    async fn test_mixed_object_delivers_one_batch_and_checkpoints() {
        let harness = Harness::new().await;
        harness
            .put("logs/2024-01-01.json", "{\"a\":1}\nnot-json\n{\"b\":2}")
            .await;

        let report = harness.cycle().await;
        assert_eq!(report.discovered, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.records, 2);
        assert_eq!(report.batches, 1);

        let requests = harness.server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].body,
            json!({
                "customer_id": CUSTOMER,
                "log_type": LOG_TYPE,
                "entries": [{"a": 1}, {"b": 2}]
            })
        );
        assert_eq!(
            requests[0].authorization.as_deref(),
            Some("Bearer test-token")
        );

        let records = harness.checkpoints.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].partition_key, CONTAINER);
        assert_eq!(records[0].row_key, encode_row_key("logs/2024-01-01.json"));
        assert_eq!(records[0].fingerprint.size, 24);
    }

    #[tokio::test]
    async fn test_gzip_objects_are_decompressed() {
        let harness = Harness::new().await;
        harness
            .put("logs/a.json.gz", gzip("{\"a\":1}\n{\"a\":2}\n"))
            .await;

        let report = harness.cycle().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(
            harness.server.delivered_entries(),
            vec![json!({"a": 1}), json!({"a": 2})]
        );
    }

    #[tokio::test]
    async fn test_empty_object_is_checkpointed_without_delivery() {
        let harness = Harness::new().await;
        harness.put("logs/empty.json", "\n\n").await;

        let report = harness.cycle().await;
        assert_eq!(report.delivered, 1);
        assert!(harness.server.requests().is_empty());
        assert_eq!(harness.checkpoints.len().await, 1);
    }

    #[tokio::test]
    async fn test_batches_respect_budget_and_order() {
        let harness = Harness::with_options(HarnessOptions {
            max_bytes: 200,
            ..HarnessOptions::default()
        })
        .await;

        let records: Vec<Value> = (0..40)
            .map(|i| json!({"seq": i, "msg": "payload"}))
            .collect();
        let body: String = records.iter().map(|r| format!("{r}\n")).collect();
        harness.put("logs/big.json", body).await;

        let report = harness.cycle().await;
        assert_eq!(report.delivered, 1);
        assert!(report.batches > 1);

        let requests = harness.server.requests();
        assert_eq!(requests.len() as u64, report.batches);
        for request in &requests {
            assert!(request.size <= 200, "batch of {} bytes", request.size);
        }
        assert_eq!(harness.server.delivered_entries(), records);
    }

    #[tokio::test]
    async fn test_max_entries_caps_batches() {
        let harness = Harness::with_options(HarnessOptions {
            max_entries: Some(2),
            ..HarnessOptions::default()
        })
        .await;
        harness
            .put("logs/a.json", "{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n{\"n\":4}\n{\"n\":5}\n")
            .await;

        let report = harness.cycle().await;
        assert_eq!(report.batches, 3);
        assert_eq!(harness.server.delivered_entries().len(), 5);
    }

    #[tokio::test]
    async fn test_oversized_record_fails_object_without_checkpoint() {
        let harness = Harness::with_options(HarnessOptions {
            max_bytes: 120,
            ..HarnessOptions::default()
        })
        .await;
        let huge = json!({"blob": "x".repeat(500)});
        harness
            .put("logs/a.json", format!("{{\"a\":1}}\n{huge}\n{{\"b\":2}}\n"))
            .await;

        let report = harness.cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 0);
        assert!(harness.checkpoints.is_empty().await);

        // Never marked done, so the next cycle tries the object again.
        let report = harness.cycle().await;
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failed, 1);
        assert!(harness.checkpoints.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_lines_counted_when_delivery_fails() {
        flurry::metrics::init_test();
        let harness = Harness::with_options(HarnessOptions {
            items: vec![work_item("malformed-on-failure", &[])],
            ..HarnessOptions::default()
        })
        .await;
        harness.server.respond_with(&[400]);
        harness.put("x.json", "oops\n{\"a\":1}\nnope\n").await;

        let report = harness.cycle().await;
        assert_eq!(report.failed, 1);

        let output = MetricsController::get().unwrap().render();
        assert!(
            output.contains(
                "flurry_log_entries_skipped_total{container=\"malformed-on-failure\"} 2"
            ),
            "{output}"
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let harness = Harness::new().await;
        harness.server.respond_with(&[503, 429]);
        harness.put("logs/a.json", "{\"a\":1}\n").await;

        let report = harness.cycle().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(harness.server.requests().len(), 3);
        assert_eq!(harness.checkpoints.len().await, 1);
    }
}

mod checkpoint_tests {
    use super::*;

    #[tokio::test]
    async fn test_second_cycle_is_idempotent() {
        let harness = Harness::new().await;
        harness.put("logs/a.json", "{\"a\":1}\n").await;
        harness.put("logs/b.json", "{\"b\":1}\n").await;

        let first = harness.cycle().await;
        assert_eq!(first.delivered, 2);
        let sent = harness.server.requests().len();

        let second = harness.cycle().await;
        assert_eq!(second.discovered, 2);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.delivered, 0);
        assert_eq!(harness.server.requests().len(), sent);
    }

    #[tokio::test]
    async fn test_permanent_failure_writes_no_checkpoint() {
        let harness = Harness::new().await;
        harness.server.respond_with(&[400]);
        harness.put("logs/a.json", "{\"a\":1}\n").await;

        let report = harness.cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(harness.server.requests().len(), 1);
        assert!(harness.checkpoints.is_empty().await);

        // Next cycle starts the object over.
        let report = harness.cycle().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(harness.server.requests().len(), 2);
        assert_eq!(harness.checkpoints.len().await, 1);
    }

    #[tokio::test]
    async fn test_failure_on_later_batch_restarts_object() {
        let harness = Harness::with_options(HarnessOptions {
            max_entries: Some(1),
            ..HarnessOptions::default()
        })
        .await;
        harness.server.respond_with(&[200, 400]);
        harness
            .put("logs/a.json", "{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n")
            .await;

        let report = harness.cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(harness.server.requests().len(), 2);
        assert!(harness.checkpoints.is_empty().await);

        let report = harness.cycle().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(harness.checkpoints.len().await, 1);

        let resent: Vec<Value> = harness.server.requests()[2..]
            .iter()
            .flat_map(|r| r.body["entries"].as_array().cloned().unwrap_or_default())
            .collect();
        assert_eq!(resent, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_write_no_checkpoint() {
        let harness = Harness::new().await;
        harness.server.respond_with(&[503, 503, 503]);
        harness.put("logs/a.json", "{\"a\":1}\n").await;

        let report = harness.cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(harness.server.requests().len(), 3);
        assert!(harness.checkpoints.is_empty().await);
    }

    #[tokio::test]
    async fn test_changed_fingerprint_is_reprocessed() {
        let harness = Harness::new().await;
        harness.put("logs/a.json", "{\"v\":1}\n").await;
        harness.cycle().await;
        let before = harness.checkpoints.records().await[0].fingerprint.clone();

        harness.put("logs/a.json", "{\"v\":2}\n{\"v\":3}\n").await;
        let report = harness.cycle().await;
        assert_eq!(report.delivered, 1);

        let records = harness.checkpoints.records().await;
        assert_eq!(records.len(), 1);
        assert_ne!(records[0].fingerprint, before);
        assert_eq!(
            harness.server.delivered_entries(),
            vec![json!({"v": 1}), json!({"v": 2}), json!({"v": 3})]
        );
        assert_eq!(harness.checkpoints.write_count(), 2);
    }

    #[tokio::test]
    async fn test_lookup_failure_skips_without_delivery() {
        let harness = Harness::new().await;
        harness.put("logs/a.json", "{\"a\":1}\n").await;
        harness.checkpoints.set_fail_reads(true);

        let report = harness.cycle().await;
        assert_eq!(report.failed, 1);
        assert!(harness.server.requests().is_empty());

        harness.checkpoints.set_fail_reads(false);
        let report = harness.cycle().await;
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_mark_failure_redelivers_next_cycle() {
        let harness = Harness::new().await;
        harness.put("logs/a.json", "{\"a\":1}\n").await;
        harness.checkpoints.set_fail_writes(true);

        let report = harness.cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(harness.server.requests().len(), 1);

        harness.checkpoints.set_fail_writes(false);
        let report = harness.cycle().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(harness.server.requests().len(), 2);
        assert!(
            harness
                .checkpoints
                .is_processed(
                    CONTAINER,
                    "logs/a.json",
                    &harness.checkpoints.records().await[0].fingerprint
                )
                .await
                .unwrap()
        );
    }
}

mod orchestration_tests {
    use super::*;

    #[tokio::test]
    async fn test_prefixes_scope_listing() {
        let harness = Harness::with_options(HarnessOptions {
            items: vec![work_item(CONTAINER, &["in/2024-01", "in/2024-03"])],
            ..HarnessOptions::default()
        })
        .await;
        harness.put("in/2024-01-01.json", "{\"m\":1}\n").await;
        harness.put("in/2024-02-01.json", "{\"m\":2}\n").await;
        harness.put("in/2024-03-01.json", "{\"m\":3}\n").await;

        let report = harness.cycle().await;
        assert_eq!(report.discovered, 2);
        assert_eq!(
            harness.server.delivered_entries(),
            vec![json!({"m": 1}), json!({"m": 3})]
        );
    }

    #[tokio::test]
    async fn test_all_containers_are_processed() {
        let items = vec![
            work_item("c1", &["c1/"]),
            work_item("c2", &["c2/"]),
            work_item("c3", &["c3/"]),
        ];
        let harness = Harness::with_options(HarnessOptions {
            items,
            concurrency: 2,
            ..HarnessOptions::default()
        })
        .await;
        for c in ["c1", "c2", "c3"] {
            harness.put(&format!("{c}/x.json"), "{\"x\":1}\n").await;
        }

        let report = harness.cycle().await;
        assert_eq!(report.units, 3);
        assert_eq!(report.delivered, 3);
        assert_eq!(harness.checkpoints.len().await, 3);
    }

    #[tokio::test]
    async fn test_concurrency_bounds_running_units() {
        let items: Vec<WorkItem> = ["c1", "c2", "c3", "c4"]
            .iter()
            .map(|c| work_item(c, &[format!("{c}/").as_str()]))
            .collect();
        let harness = Harness::with_options(HarnessOptions {
            items,
            concurrency: 2,
            ..HarnessOptions::default()
        })
        .await;
        for c in ["c1", "c2", "c3", "c4"] {
            harness.put(&format!("{c}/x.json"), "{\"x\":1}\n").await;
        }
        harness.server.hold();

        let (report, ()) = tokio::join!(harness.cycle(), async {
            harness.server.wait_for_in_flight(2).await;
            // Give a third unit the chance to show up if it were allowed to.
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(harness.server.in_flight(), 2);
            harness.server.release();
        });

        assert_eq!(harness.server.peak(), 2);
        assert_eq!(report.units, 4);
        assert_eq!(report.delivered, 4);
    }

    #[tokio::test]
    async fn test_cancel_mid_cycle_finishes_current_object() {
        let harness = Harness::new().await;
        harness.put("logs/a.json", "{\"a\":1}\n").await;
        harness.put("logs/b.json", "{\"b\":1}\n").await;
        harness.server.hold();

        let (report, ()) = tokio::join!(harness.cycle(), async {
            harness.server.wait_for_in_flight(1).await;
            harness.shutdown.cancel();
            harness.server.release();
        });

        assert_eq!(report.delivered, 1);
        assert_eq!(harness.server.delivered_entries(), vec![json!({"a": 1})]);

        let records = harness.checkpoints.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].row_key, encode_row_key("logs/a.json"));
    }

    #[tokio::test]
    async fn test_unknown_account_fails_only_its_unit() {
        let mut orphan = work_item("other", &[]);
        orphan.account = "missing".into();
        let harness = Harness::with_options(HarnessOptions {
            items: vec![work_item(CONTAINER, &[]), orphan],
            ..HarnessOptions::default()
        })
        .await;
        harness.put("logs/a.json", "{\"a\":1}\n").await;

        let report = harness.cycle().await;
        assert_eq!(report.unit_errors, 1);
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_starts_nothing() {
        let harness = Harness::new().await;
        harness.put("logs/a.json", "{\"a\":1}\n").await;
        harness.shutdown.cancel();

        let report = harness.cycle().await;
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.delivered, 0);
        assert!(harness.server.requests().is_empty());
        assert!(harness.checkpoints.is_empty().await);
    }
}
