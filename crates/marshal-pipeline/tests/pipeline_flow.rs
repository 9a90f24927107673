//! End-to-end pass flows over the in-memory store and stub
//! collaborators: no live approval surface, categorizer, or upstream
//! API involved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use marshal_core::{
    CanonicalMarket, CategoryLabel, Decision, DecisionSignal, LifecycleState, Stage,
};
use marshal_ingest::{FetchError, RawMarket, RecordFetcher, RetryPolicy};
use marshal_pipeline::{
    ApprovalSurface, Categorizer, DeployTarget, ImageGenerator, Pipeline, PipelineConfig,
};
use marshal_store::{MarketStore, MemoryStore};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Stub collaborators
// ---------------------------------------------------------------------------

struct StubFetcher {
    batch: Vec<RawMarket>,
}

#[async_trait]
impl RecordFetcher for StubFetcher {
    async fn fetch_batch(&self) -> Result<Vec<RawMarket>, FetchError> {
        Ok(self.batch.clone())
    }

    async fn fetch_by_id(&self, _canonical_id: &str) -> Result<Option<RawMarket>, FetchError> {
        Ok(None)
    }
}

#[derive(Default)]
struct StubSurface {
    counter: AtomicUsize,
    posted: Mutex<Vec<(String, Stage, String)>>,
    decisions: Mutex<HashMap<String, Vec<DecisionSignal>>>,
}

impl StubSurface {
    async fn handle_for(&self, market_id: &str, stage: Stage) -> Option<String> {
        self.posted
            .lock()
            .await
            .iter()
            .find(|(id, s, _)| id == market_id && *s == stage)
            .map(|(_, _, handle)| handle.clone())
    }

    async fn push_decision(&self, handle: &str, decision: Decision, actor: &str) {
        self.decisions
            .lock()
            .await
            .entry(handle.to_string())
            .or_default()
            .push(DecisionSignal {
                decision,
                actor: Some(actor.to_string()),
                at: Utc::now(),
            });
    }
}

#[async_trait]
impl ApprovalSurface for StubSurface {
    async fn post(&self, market: &CanonicalMarket, stage: Stage) -> Result<String> {
        let handle = format!("msg-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.posted
            .lock()
            .await
            .push((market.id.clone(), stage, handle.clone()));
        Ok(handle)
    }

    async fn poll_decisions(&self, handle: &str) -> Result<Vec<DecisionSignal>> {
        Ok(self
            .decisions
            .lock()
            .await
            .get(handle)
            .cloned()
            .unwrap_or_default())
    }
}

struct StubCategorizer {
    label: CategoryLabel,
    fail: bool,
}

#[async_trait]
impl Categorizer for StubCategorizer {
    async fn categorize(
        &self,
        _question: &str,
        _description: Option<&str>,
    ) -> Result<CategoryLabel> {
        if self.fail {
            return Err(anyhow!("categorizer unavailable"));
        }
        Ok(self.label)
    }
}

struct StubImageGenerator {
    fail: bool,
}

#[async_trait]
impl ImageGenerator for StubImageGenerator {
    async fn generate(&self, market: &CanonicalMarket) -> Result<String> {
        if self.fail {
            return Err(anyhow!("image backend unavailable"));
        }
        Ok(format!("https://img.example.com/generated/{}.png", market.id))
    }
}

struct StubDeployTarget {
    counter: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl DeployTarget for StubDeployTarget {
    async fn deploy(&self, _market: &CanonicalMarket) -> Result<String> {
        if self.fail {
            return Err(anyhow!("deployment endpoint unavailable"));
        }
        Ok(format!("ext-{}", self.counter.fetch_add(1, Ordering::SeqCst)))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn test_config() -> PipelineConfig {
    PipelineConfig {
        database_url: String::new(),
        gamma_base_url: "https://gamma.test".to_string(),
        slack_token: String::new(),
        slack_channel: String::new(),
        slack_bot_user: None,
        openai_api_key: String::new(),
        openai_api_base: None,
        categorizer_model: "test-model".to_string(),
        image_model: "test-image-model".to_string(),
        deploy_endpoint: String::new(),
        approval_window_hours: 72,
        max_markets_per_run: 10,
        image_host_allowlist: Vec::new(),
        scheduler_enabled: false,
        ingest_cron: "0 0 6 * * *".to_string(),
        decisions_cron: "0 */30 * * * *".to_string(),
        sweep_cron: "0 15 * * * *".to_string(),
        http_timeout_secs: 5,
        user_agent: "marshal-test/0".to_string(),
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    surface: Arc<StubSurface>,
    pipeline: Pipeline,
}

struct HarnessOptions {
    categorizer_fails: bool,
    image_generator_fails: bool,
    deploy_fails: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            categorizer_fails: false,
            image_generator_fails: false,
            deploy_fails: false,
        }
    }
}

fn build_harness(batch: Vec<RawMarket>, options: HarnessOptions) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let surface = Arc::new(StubSurface::default());
    let pipeline = attach_pipeline(store.clone(), surface.clone(), batch, options);
    Harness {
        store,
        surface,
        pipeline,
    }
}

/// Build a pipeline over an existing store and surface, the way a
/// second process would attach to the same database.
fn attach_pipeline(
    store: Arc<MemoryStore>,
    surface: Arc<StubSurface>,
    batch: Vec<RawMarket>,
    options: HarnessOptions,
) -> Pipeline {
    Pipeline::new(
        test_config(),
        store,
        Arc::new(StubFetcher { batch }),
        surface,
        Arc::new(StubCategorizer {
            label: CategoryLabel::Sports,
            fail: options.categorizer_fails,
        }),
        Arc::new(StubImageGenerator {
            fail: options.image_generator_fails,
        }),
        Arc::new(StubDeployTarget {
            counter: AtomicUsize::new(1),
            fail: options.deploy_fails,
        }),
    )
    .with_retry(fast_retry())
}

fn raw(value: serde_json::Value) -> RawMarket {
    serde_json::from_value(value).expect("raw market parses")
}

fn binary_market() -> RawMarket {
    raw(serde_json::json!({
        "id": "517281",
        "conditionId": "0xabc123",
        "question": "Will BTC close above $100k this year?",
        "outcomes": "[\"Yes\", \"No\"]",
        "image": "https://img.example.com/btc-banner.png",
        "endDate": "2099-12-31T23:59:59Z",
        "active": true,
        "closed": false
    }))
}

fn event_market() -> RawMarket {
    raw(serde_json::json!({
        "id": "12672",
        "question": "Will Real Madrid win La Liga?",
        "image": "https://img.example.com/parent-wrong.png",
        "endDate": "2099-06-01T00:00:00Z",
        "events": [{
            "id": "12672",
            "title": "La Liga Winner",
            "image": "https://img.example.com/laliga-banner.png",
            "icon": "https://img.example.com/laliga-icon.png",
            "active": true,
            "closed": false,
            "outcomes": [
                {"id": "real-madrid", "title": "Real Madrid", "active": true},
                {"id": "barcelona", "title": "Barcelona", "active": true}
            ]
        }]
    }))
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ingest_creates_each_upstream_record_exactly_once() {
    let harness = build_harness(
        vec![binary_market(), binary_market(), event_market()],
        HarnessOptions::default(),
    );

    let first = harness.pipeline.run_ingest().await.unwrap();
    assert_eq!(first.fetched, 3);
    assert_eq!(first.ingested, 2);
    assert_eq!(first.duplicates, 1);

    // The upstream API re-returns everything on the next sweep.
    let second = harness.pipeline.run_ingest().await.unwrap();
    assert_eq!(second.ingested, 0);
    assert_eq!(second.duplicates, 3);

    let pending = harness
        .store
        .list_in_state(LifecycleState::Pending)
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|m| m.approval_ref.is_some()));
    assert!(pending.iter().all(|m| m.banner_resolved));
}

#[tokio::test]
async fn full_approval_flow_reaches_deployed() {
    let harness = build_harness(vec![binary_market()], HarnessOptions::default());
    harness.pipeline.run_ingest().await.unwrap();

    let stage1 = harness
        .surface
        .handle_for("0xabc123", Stage::Market)
        .await
        .expect("stage-1 posted");
    harness
        .surface
        .push_decision(&stage1, Decision::Approve, "U_REVIEWER")
        .await;

    let summary = harness.pipeline.run_market_decisions().await.unwrap();
    assert_eq!(summary.approved, 1);

    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::PendingImage);
    assert_eq!(market.category, Some(CategoryLabel::Sports));
    assert!(market.image_ref.is_some());
    assert!(market.image_approval_ref.is_some());

    let stage2 = harness
        .surface
        .handle_for("0xabc123", Stage::Image)
        .await
        .expect("stage-2 posted");
    harness
        .surface
        .push_decision(&stage2, Decision::Approve, "U_REVIEWER")
        .await;

    let summary = harness.pipeline.run_image_decisions().await.unwrap();
    assert_eq!(summary.approved, 1);
    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::Approved);

    let summary = harness.pipeline.run_deploy().await.unwrap();
    assert_eq!(summary.deployed, 1);
    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::Deployed);
    assert_eq!(market.external_id.as_deref(), Some("ext-1"));

    let events = harness.store.approval_events("0xabc123").await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].stage, Stage::Market);
    assert_eq!(events[0].decision, Decision::Approve);
    assert_eq!(events[1].stage, Stage::Image);
}

#[tokio::test]
async fn duplicate_decisions_after_deployment_change_nothing() {
    let harness = build_harness(vec![binary_market()], HarnessOptions::default());
    harness.pipeline.run_ingest().await.unwrap();

    let stage1 = harness
        .surface
        .handle_for("0xabc123", Stage::Market)
        .await
        .unwrap();
    harness
        .surface
        .push_decision(&stage1, Decision::Approve, "U1")
        .await;
    harness.pipeline.run_market_decisions().await.unwrap();
    let stage2 = harness
        .surface
        .handle_for("0xabc123", Stage::Image)
        .await
        .unwrap();
    harness
        .surface
        .push_decision(&stage2, Decision::Approve, "U1")
        .await;
    harness.pipeline.run_image_decisions().await.unwrap();
    harness.pipeline.run_deploy().await.unwrap();

    // A duplicate rejection is re-delivered long after deployment.
    harness
        .surface
        .push_decision(&stage1, Decision::Reject, "U2")
        .await;
    harness.pipeline.run_market_decisions().await.unwrap();
    harness.pipeline.run_image_decisions().await.unwrap();

    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::Deployed);
    assert_eq!(market.external_id.as_deref(), Some("ext-1"));
    assert_eq!(
        harness
            .store
            .approval_events("0xabc123")
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn rejection_is_terminal_and_audited() {
    let harness = build_harness(vec![binary_market()], HarnessOptions::default());
    harness.pipeline.run_ingest().await.unwrap();

    let stage1 = harness
        .surface
        .handle_for("0xabc123", Stage::Market)
        .await
        .unwrap();
    // An approval and a rejection both arrive; rejection wins.
    harness
        .surface
        .push_decision(&stage1, Decision::Approve, "U1")
        .await;
    harness
        .surface
        .push_decision(&stage1, Decision::Reject, "U2")
        .await;

    let summary = harness.pipeline.run_market_decisions().await.unwrap();
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.approved, 0);

    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::Rejected);

    let events = harness.store.approval_events("0xabc123").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision, Decision::Reject);
    assert_eq!(events[0].actor.as_deref(), Some("U2"));
}

#[tokio::test]
async fn categorizer_failure_assigns_the_fallback_label() {
    let harness = build_harness(
        vec![binary_market()],
        HarnessOptions {
            categorizer_fails: true,
            ..HarnessOptions::default()
        },
    );
    harness.pipeline.run_ingest().await.unwrap();

    let stage1 = harness
        .surface
        .handle_for("0xabc123", Stage::Market)
        .await
        .unwrap();
    harness
        .surface
        .push_decision(&stage1, Decision::Approve, "U1")
        .await;

    let summary = harness.pipeline.run_market_decisions().await.unwrap();
    assert_eq!(summary.approved, 1);

    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::PendingImage);
    assert_eq!(market.category, Some(CategoryLabel::News));
}

#[tokio::test]
async fn stale_posts_are_swept_into_timeout() {
    let harness = build_harness(vec![binary_market()], HarnessOptions::default());
    harness.pipeline.run_ingest().await.unwrap();

    // Age the stage-1 post past the 72h window.
    let posted_long_ago = Utc::now() - chrono::Duration::days(5);
    let stage1 = harness
        .surface
        .handle_for("0xabc123", Stage::Market)
        .await
        .unwrap();
    harness
        .store
        .attach_approval_handle("0xabc123", Stage::Market, &stage1, posted_long_ago)
        .await
        .unwrap();

    let summary = harness.pipeline.run_timeout_sweep().await.unwrap();
    assert_eq!(summary.timed_out, 1);

    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::TimedOut);

    let events = harness.store.approval_events("0xabc123").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision, Decision::Timeout);
    assert_eq!(events[0].actor, None);

    // Sweeping again finds nothing to do.
    let summary = harness.pipeline.run_timeout_sweep().await.unwrap();
    assert_eq!(summary.timed_out, 0);
}

#[tokio::test]
async fn deploy_failure_keeps_the_record_approved_for_retry() {
    let harness = build_harness(
        vec![binary_market()],
        HarnessOptions {
            deploy_fails: true,
            ..HarnessOptions::default()
        },
    );
    harness.pipeline.run_ingest().await.unwrap();

    let stage1 = harness
        .surface
        .handle_for("0xabc123", Stage::Market)
        .await
        .unwrap();
    harness
        .surface
        .push_decision(&stage1, Decision::Approve, "U1")
        .await;
    harness.pipeline.run_market_decisions().await.unwrap();
    let stage2 = harness
        .surface
        .handle_for("0xabc123", Stage::Image)
        .await
        .unwrap();
    harness
        .surface
        .push_decision(&stage2, Decision::Approve, "U1")
        .await;
    harness.pipeline.run_image_decisions().await.unwrap();

    let summary = harness.pipeline.run_deploy().await.unwrap();
    assert_eq!(summary.deployed, 0);
    assert_eq!(summary.failed, 1);
    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::Approved);
    assert_eq!(market.external_id, None);

    // A later pass, from a process whose deploy target works, retries.
    let retry_pipeline = attach_pipeline(
        harness.store.clone(),
        harness.surface.clone(),
        Vec::new(),
        HarnessOptions::default(),
    );
    let summary = retry_pipeline.run_deploy().await.unwrap();
    assert_eq!(summary.deployed, 1);
    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::Deployed);
}

#[tokio::test]
async fn image_generation_failure_defers_the_banner_review() {
    let harness = build_harness(
        vec![binary_market()],
        HarnessOptions {
            image_generator_fails: true,
            ..HarnessOptions::default()
        },
    );
    harness.pipeline.run_ingest().await.unwrap();

    let stage1 = harness
        .surface
        .handle_for("0xabc123", Stage::Market)
        .await
        .unwrap();
    harness
        .surface
        .push_decision(&stage1, Decision::Approve, "U1")
        .await;
    harness.pipeline.run_market_decisions().await.unwrap();

    // Stage-1 approval stands even though the banner never generated.
    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::PendingImage);
    assert_eq!(market.image_ref, None);
    assert_eq!(market.image_approval_ref, None);

    // The next stage-2 pass, with the backend recovered, retries both
    // the generation and the post.
    let recovered = attach_pipeline(
        harness.store.clone(),
        harness.surface.clone(),
        Vec::new(),
        HarnessOptions::default(),
    );
    let summary = recovered.run_image_decisions().await.unwrap();
    assert_eq!(summary.still_pending, 1);

    let market = harness.store.get("0xabc123").await.unwrap().unwrap();
    assert_eq!(market.lifecycle_state, LifecycleState::PendingImage);
    assert!(market.image_ref.is_some());
    assert!(market.image_approval_ref.is_some());
}
