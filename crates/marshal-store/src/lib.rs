//! Persistence for Market Marshal: the idempotency ledger, canonical
//! market lifecycle rows, and the append-only approval audit log.
//!
//! All lifecycle mutations are conditional on the expected current
//! state so that concurrent decision passes cannot apply conflicting
//! transitions: the second writer sees zero affected rows and treats
//! its transition as a no-op.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marshal_core::{ApprovalEvent, CanonicalMarket, CategoryLabel, Decision, LifecycleState, MarketKind, Stage};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::info;

pub const CRATE_NAME: &str = "marshal-store";

/// Store contract shared by the Postgres implementation and the
/// in-memory one used by tests and dry runs.
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// True when the upstream id was already ingested.
    async fn ledger_contains(&self, upstream_id: &str) -> Result<bool>;

    /// Atomic insert-if-absent. Returns true when this call created
    /// the entry - the winning call is the gate into the pipeline.
    async fn ledger_insert(&self, upstream_id: &str, first_seen_at: DateTime<Utc>) -> Result<bool>;

    async fn insert_pending(&self, market: &CanonicalMarket) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<CanonicalMarket>>;

    async fn list_in_state(&self, state: LifecycleState) -> Result<Vec<CanonicalMarket>>;

    /// Markets still in `state` whose approval handle for that stage
    /// was posted before `horizon`.
    async fn due_for_timeout(
        &self,
        state: LifecycleState,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<CanonicalMarket>>;

    async fn attach_approval_handle(
        &self,
        id: &str,
        stage: Stage,
        handle: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_category(&self, id: &str, category: CategoryLabel) -> Result<()>;

    /// Store a resolved banner and mark resolution done.
    async fn set_banner(&self, id: &str, banner_url: Option<&str>) -> Result<()>;

    async fn set_image_ref(&self, id: &str, image_ref: &str) -> Result<()>;

    /// Conditional read-modify-write keyed by (id, expected state).
    /// Returns false when the state already moved.
    async fn transition(&self, id: &str, from: LifecycleState, to: LifecycleState) -> Result<bool>;

    /// Conditionally move an approved market to deployed, recording the
    /// deployment receipt. A deployed record is never re-submitted.
    async fn mark_deployed(&self, id: &str, external_id: &str) -> Result<bool>;

    async fn append_approval_event(&self, event: &ApprovalEvent) -> Result<()>;

    async fn approval_events(&self, market_id: &str) -> Result<Vec<ApprovalEvent>>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_ledger (
                upstream_id TEXT PRIMARY KEY,
                first_seen_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS markets (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                question TEXT NOT NULL,
                category TEXT,
                banner_url TEXT,
                banner_resolved BOOLEAN NOT NULL DEFAULT FALSE,
                event_icon_url TEXT,
                options JSONB NOT NULL,
                expiry TIMESTAMPTZ,
                lifecycle_state TEXT NOT NULL,
                approval_ref TEXT,
                approval_posted_at TIMESTAMPTZ,
                image_approval_ref TEXT,
                image_approval_posted_at TIMESTAMPTZ,
                image_ref TEXT,
                external_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS approval_events (
                id BIGSERIAL PRIMARY KEY,
                market_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                decision TEXT NOT NULL,
                actor TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("store schema initialized");
        Ok(())
    }
}

fn row_to_market(row: &sqlx::postgres::PgRow) -> Result<CanonicalMarket> {
    let kind_raw: String = row.get("kind");
    let kind = MarketKind::parse(&kind_raw).ok_or_else(|| anyhow!("unknown kind {kind_raw}"))?;
    let state_raw: String = row.get("lifecycle_state");
    let lifecycle_state = LifecycleState::parse(&state_raw)
        .ok_or_else(|| anyhow!("unknown lifecycle state {state_raw}"))?;
    let category = row
        .get::<Option<String>, _>("category")
        .as_deref()
        .and_then(CategoryLabel::parse);
    let options_json: serde_json::Value = row.get("options");
    let options = serde_json::from_value(options_json).context("decoding market options")?;

    Ok(CanonicalMarket {
        id: row.get("id"),
        kind,
        question: row.get("question"),
        category,
        banner_url: row.get("banner_url"),
        banner_resolved: row.get("banner_resolved"),
        event_icon_url: row.get("event_icon_url"),
        options,
        expiry: row.get("expiry"),
        lifecycle_state,
        approval_ref: row.get("approval_ref"),
        approval_posted_at: row.get("approval_posted_at"),
        image_approval_ref: row.get("image_approval_ref"),
        image_approval_posted_at: row.get("image_approval_posted_at"),
        image_ref: row.get("image_ref"),
        external_id: row.get("external_id"),
        created_at: row.get("created_at"),
    })
}

const MARKET_COLUMNS: &str = "id, kind, question, category, banner_url, banner_resolved, \
     event_icon_url, options, expiry, lifecycle_state, approval_ref, approval_posted_at, \
     image_approval_ref, image_approval_posted_at, image_ref, external_id, created_at";

#[async_trait]
impl MarketStore for PgStore {
    async fn ledger_contains(&self, upstream_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM ingest_ledger WHERE upstream_id = $1")
            .bind(upstream_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn ledger_insert(&self, upstream_id: &str, first_seen_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO ingest_ledger (upstream_id, first_seen_at)
            VALUES ($1, $2)
            ON CONFLICT (upstream_id) DO NOTHING
            "#,
        )
        .bind(upstream_id)
        .bind(first_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_pending(&self, market: &CanonicalMarket) -> Result<()> {
        let options = serde_json::to_value(&market.options)?;
        sqlx::query(
            r#"
            INSERT INTO markets (id, kind, question, category, banner_url, banner_resolved,
                                 event_icon_url, options, expiry, lifecycle_state, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&market.id)
        .bind(market.kind.as_str())
        .bind(&market.question)
        .bind(market.category.map(|c| c.as_str()))
        .bind(&market.banner_url)
        .bind(market.banner_resolved)
        .bind(&market.event_icon_url)
        .bind(options)
        .bind(market.expiry)
        .bind(market.lifecycle_state.as_str())
        .bind(market.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CanonicalMarket>> {
        let row = sqlx::query(&format!("SELECT {MARKET_COLUMNS} FROM markets WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_market).transpose()
    }

    async fn list_in_state(&self, state: LifecycleState) -> Result<Vec<CanonicalMarket>> {
        let rows = sqlx::query(&format!(
            "SELECT {MARKET_COLUMNS} FROM markets WHERE lifecycle_state = $1 ORDER BY created_at"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_market).collect()
    }

    async fn due_for_timeout(
        &self,
        state: LifecycleState,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<CanonicalMarket>> {
        let posted_column = match state {
            LifecycleState::PendingImage => "image_approval_posted_at",
            _ => "approval_posted_at",
        };
        let rows = sqlx::query(&format!(
            "SELECT {MARKET_COLUMNS} FROM markets \
             WHERE lifecycle_state = $1 AND {posted_column} IS NOT NULL AND {posted_column} < $2 \
             ORDER BY created_at"
        ))
        .bind(state.as_str())
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_market).collect()
    }

    async fn attach_approval_handle(
        &self,
        id: &str,
        stage: Stage,
        handle: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<()> {
        let (handle_column, posted_column) = match stage {
            Stage::Market => ("approval_ref", "approval_posted_at"),
            Stage::Image => ("image_approval_ref", "image_approval_posted_at"),
        };
        sqlx::query(&format!(
            "UPDATE markets SET {handle_column} = $2, {posted_column} = $3, \
             updated_at = CURRENT_TIMESTAMP WHERE id = $1"
        ))
        .bind(id)
        .bind(handle)
        .bind(posted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_category(&self, id: &str, category: CategoryLabel) -> Result<()> {
        sqlx::query(
            "UPDATE markets SET category = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(id)
        .bind(category.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_banner(&self, id: &str, banner_url: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE markets SET banner_url = $2, banner_resolved = TRUE, \
             updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(id)
        .bind(banner_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_image_ref(&self, id: &str, image_ref: &str) -> Result<()> {
        sqlx::query(
            "UPDATE markets SET image_ref = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(id)
        .bind(image_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition(&self, id: &str, from: LifecycleState, to: LifecycleState) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE markets SET lifecycle_state = $3, updated_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND lifecycle_state = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_deployed(&self, id: &str, external_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE markets SET lifecycle_state = $3, external_id = $2,
                               updated_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND lifecycle_state = $4 AND external_id IS NULL
            "#,
        )
        .bind(id)
        .bind(external_id)
        .bind(LifecycleState::Deployed.as_str())
        .bind(LifecycleState::Approved.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_approval_event(&self, event: &ApprovalEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO approval_events (market_id, stage, decision, actor, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&event.market_id)
        .bind(event.stage.as_str())
        .bind(event.decision.as_str())
        .bind(&event.actor)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn approval_events(&self, market_id: &str) -> Result<Vec<ApprovalEvent>> {
        let rows = sqlx::query(
            "SELECT market_id, stage, decision, actor, created_at \
             FROM approval_events WHERE market_id = $1 ORDER BY id",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let stage_raw: String = row.get("stage");
                let decision_raw: String = row.get("decision");
                Ok(ApprovalEvent {
                    market_id: row.get("market_id"),
                    stage: Stage::parse(&stage_raw)
                        .ok_or_else(|| anyhow!("unknown stage {stage_raw}"))?,
                    decision: Decision::parse(&decision_raw)
                        .ok_or_else(|| anyhow!("unknown decision {decision_raw}"))?,
                    actor: row.get("actor"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    ledger: HashMap<String, DateTime<Utc>>,
    markets: HashMap<String, CanonicalMarket>,
    events: Vec<ApprovalEvent>,
}

/// Mutex-guarded store with the same conditional-update semantics as
/// the Postgres implementation. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn ledger_contains(&self, upstream_id: &str) -> Result<bool> {
        Ok(self.inner.lock().await.ledger.contains_key(upstream_id))
    }

    async fn ledger_insert(&self, upstream_id: &str, first_seen_at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.ledger.contains_key(upstream_id) {
            return Ok(false);
        }
        inner.ledger.insert(upstream_id.to_string(), first_seen_at);
        Ok(true)
    }

    async fn insert_pending(&self, market: &CanonicalMarket) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.markets.contains_key(&market.id) {
            return Err(anyhow!("market {} already stored", market.id));
        }
        inner.markets.insert(market.id.clone(), market.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CanonicalMarket>> {
        Ok(self.inner.lock().await.markets.get(id).cloned())
    }

    async fn list_in_state(&self, state: LifecycleState) -> Result<Vec<CanonicalMarket>> {
        let inner = self.inner.lock().await;
        let mut markets: Vec<CanonicalMarket> = inner
            .markets
            .values()
            .filter(|m| m.lifecycle_state == state)
            .cloned()
            .collect();
        markets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(markets)
    }

    async fn due_for_timeout(
        &self,
        state: LifecycleState,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<CanonicalMarket>> {
        let stage = match state {
            LifecycleState::PendingImage => Stage::Image,
            _ => Stage::Market,
        };
        let mut due: Vec<CanonicalMarket> = self
            .list_in_state(state)
            .await?
            .into_iter()
            .filter(|m| {
                m.approval_posted_at(stage)
                    .map(|posted| posted < horizon)
                    .unwrap_or(false)
            })
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn attach_approval_handle(
        &self,
        id: &str,
        stage: Stage,
        handle: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let market = inner
            .markets
            .get_mut(id)
            .ok_or_else(|| anyhow!("market {id} not found"))?;
        match stage {
            Stage::Market => {
                market.approval_ref = Some(handle.to_string());
                market.approval_posted_at = Some(posted_at);
            }
            Stage::Image => {
                market.image_approval_ref = Some(handle.to_string());
                market.image_approval_posted_at = Some(posted_at);
            }
        }
        Ok(())
    }

    async fn set_category(&self, id: &str, category: CategoryLabel) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let market = inner
            .markets
            .get_mut(id)
            .ok_or_else(|| anyhow!("market {id} not found"))?;
        market.category = Some(category);
        Ok(())
    }

    async fn set_banner(&self, id: &str, banner_url: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let market = inner
            .markets
            .get_mut(id)
            .ok_or_else(|| anyhow!("market {id} not found"))?;
        market.banner_url = banner_url.map(str::to_string);
        market.banner_resolved = true;
        Ok(())
    }

    async fn set_image_ref(&self, id: &str, image_ref: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let market = inner
            .markets
            .get_mut(id)
            .ok_or_else(|| anyhow!("market {id} not found"))?;
        market.image_ref = Some(image_ref.to_string());
        Ok(())
    }

    async fn transition(&self, id: &str, from: LifecycleState, to: LifecycleState) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(market) = inner.markets.get_mut(id) else {
            return Ok(false);
        };
        if market.lifecycle_state != from {
            return Ok(false);
        }
        market.lifecycle_state = to;
        Ok(true)
    }

    async fn mark_deployed(&self, id: &str, external_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(market) = inner.markets.get_mut(id) else {
            return Ok(false);
        };
        if market.lifecycle_state != LifecycleState::Approved || market.external_id.is_some() {
            return Ok(false);
        }
        market.lifecycle_state = LifecycleState::Deployed;
        market.external_id = Some(external_id.to_string());
        Ok(true)
    }

    async fn append_approval_event(&self, event: &ApprovalEvent) -> Result<()> {
        self.inner.lock().await.events.push(event.clone());
        Ok(())
    }

    async fn approval_events(&self, market_id: &str) -> Result<Vec<ApprovalEvent>> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.market_id == market_id)
            .cloned()
            .collect())
    }
}
