//! Upstream payload parsing, canonicalization, image resolution, and
//! entity deduplication for Market Marshal.
//!
//! The raw Gamma payload shapes live here and nowhere else: everything
//! downstream of [`canonicalize`] operates on
//! [`marshal_core::CanonicalMarket`] only.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marshal_core::{CanonicalMarket, MarketKind, MarketOption};
use regex::Regex;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "marshal-ingest";

// ---------------------------------------------------------------------------
// Raw upstream payloads
// ---------------------------------------------------------------------------

/// One untyped market payload as returned by the Gamma-style listing
/// endpoint. Field names drift between API versions; everything is
/// optional and `outcomes` may be a JSON array or a JSON-encoded string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMarket {
    pub id: Option<String>,
    pub condition_id: Option<String>,
    pub question: Option<String>,
    pub description: Option<String>,
    pub outcomes: Option<JsonValue>,
    pub image: Option<String>,
    pub icon: Option<String>,
    pub end_date: Option<String>,
    pub active: Option<bool>,
    pub closed: Option<bool>,
    pub is_multiple_choice: Option<bool>,
    pub is_event: Option<bool>,
    #[serde(default)]
    pub events: Vec<RawEventContainer>,
    #[serde(default)]
    pub option_markets: Vec<RawOptionMarket>,
}

/// A child event container grouping related option entries.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventContainer {
    pub id: Option<String>,
    pub title: Option<String>,
    pub image: Option<String>,
    pub icon: Option<String>,
    pub active: Option<bool>,
    pub closed: Option<bool>,
    #[serde(default)]
    pub outcomes: Vec<RawEventOutcome>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventOutcome {
    pub id: Option<String>,
    pub name: Option<String>,
    pub title: Option<String>,
    pub icon: Option<String>,
    pub image: Option<String>,
    pub active: Option<bool>,
    pub closed: Option<bool>,
}

/// Entry of the parallel option-market list: the secondary source of
/// option icons, keyed by the same logical entities as the container
/// children.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOptionMarket {
    pub id: Option<String>,
    pub question: Option<String>,
    pub group_item_title: Option<String>,
    pub image: Option<String>,
    pub icon: Option<String>,
}

/// Why a raw record was dropped instead of canonicalized. Discards are
/// deterministic: the same payload is re-evaluated and re-dropped on
/// every fetch, and never enters the idempotency ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Discard {
    #[error("record matches no known market shape")]
    Unclassifiable,
    #[error("record has no upstream identifier")]
    MissingId,
    #[error("record has no question text")]
    MissingQuestion,
    #[error("record is inactive or closed upstream")]
    Inactive,
    #[error("record expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("event has {0} live options, need at least 2")]
    TooFewOptions(usize),
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Closed tagged union produced by [`classify`] and consumed only by
/// the canonicalization pipeline in this crate.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Binary(RawBinary),
    Event(RawEventGroup),
}

impl RawRecord {
    /// Upstream-stable canonical id, the idempotency-ledger key.
    pub fn id(&self) -> &str {
        match self {
            RawRecord::Binary(binary) => &binary.id,
            RawRecord::Event(group) => &group.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawBinary {
    pub id: String,
    pub question: String,
    pub image: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawEventGroup {
    pub id: String,
    pub title: String,
    /// First child container's image. The parent record's own image is
    /// deliberately not carried: it must never become the banner.
    pub banner: Option<String>,
    pub icon: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub children: Vec<OptionDraft>,
    pub option_markets: Vec<OptionDraft>,
}

/// Pre-dedup option surface form from either icon source.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionDraft {
    pub display_name: String,
    pub icon: Option<String>,
    pub image: Option<String>,
    pub source_id: String,
}

fn outcome_names(raw: &RawMarket) -> Option<Vec<String>> {
    match raw.outcomes.as_ref()? {
        JsonValue::String(encoded) => serde_json::from_str::<Vec<String>>(encoded).ok(),
        JsonValue::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

fn is_yes_no(outcomes: &[String]) -> bool {
    outcomes.len() == 2
        && outcomes.iter().any(|o| o.eq_ignore_ascii_case("yes"))
        && outcomes.iter().any(|o| o.eq_ignore_ascii_case("no"))
}

fn parse_expiry(value: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = value?.trim();
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn derive_group_id(title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("group_{}", &digest[..40])
}

/// Detect the upstream shape of one raw payload. First match wins:
/// explicit flag, then the exact Yes/No outcome set, then the presence
/// of event children.
pub fn classify(raw: &RawMarket, now: DateTime<Utc>) -> Result<RawRecord, Discard> {
    match raw.is_multiple_choice {
        Some(true) => return classify_event(raw, now),
        Some(false) => return classify_binary(raw, now),
        None => {}
    }

    if let Some(outcomes) = outcome_names(raw) {
        if is_yes_no(&outcomes) {
            return classify_binary(raw, now);
        }
    }

    if raw.is_event == Some(true) || !raw.events.is_empty() {
        return classify_event(raw, now);
    }

    Err(Discard::Unclassifiable)
}

fn classify_binary(raw: &RawMarket, now: DateTime<Utc>) -> Result<RawRecord, Discard> {
    let id = raw
        .condition_id
        .clone()
        .or_else(|| raw.id.clone())
        .ok_or(Discard::MissingId)?;
    let question = raw
        .question
        .clone()
        .filter(|q| !q.trim().is_empty())
        .ok_or(Discard::MissingQuestion)?;

    if raw.active == Some(false) || raw.closed == Some(true) {
        return Err(Discard::Inactive);
    }

    let expiry = parse_expiry(raw.end_date.as_deref());
    if let Some(expiry) = expiry {
        if expiry <= now {
            return Err(Discard::Expired(expiry));
        }
    }

    Ok(RawRecord::Binary(RawBinary {
        id,
        question,
        image: raw.image.clone(),
        expiry,
    }))
}

fn classify_event(raw: &RawMarket, now: DateTime<Utc>) -> Result<RawRecord, Discard> {
    let container = raw.events.first().ok_or(Discard::Unclassifiable)?;

    // Containers must be explicitly live; an absent flag means the
    // upstream never activated the event.
    if !container.active.unwrap_or(false) || container.closed.unwrap_or(false) {
        return Err(Discard::Inactive);
    }

    let title = container
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or(Discard::MissingQuestion)?;

    let expiry = parse_expiry(raw.end_date.as_deref());
    if let Some(expiry) = expiry {
        if expiry <= now {
            return Err(Discard::Expired(expiry));
        }
    }

    let mut children = Vec::new();
    for (index, outcome) in container.outcomes.iter().enumerate() {
        if outcome.active == Some(false) || outcome.closed == Some(true) {
            debug!(option = ?outcome.title, "dropping inactive event option");
            continue;
        }
        let Some(display_name) = outcome
            .title
            .clone()
            .or_else(|| outcome.name.clone())
            .filter(|n| !n.trim().is_empty())
        else {
            continue;
        };
        children.push(OptionDraft {
            display_name,
            icon: outcome.icon.clone(),
            image: outcome.image.clone(),
            source_id: outcome
                .id
                .clone()
                .unwrap_or_else(|| format!("option_{index}")),
        });
    }

    if children.len() < 2 {
        return Err(Discard::TooFewOptions(children.len()));
    }

    let option_markets = raw
        .option_markets
        .iter()
        .filter_map(|om| {
            let display_name = om
                .group_item_title
                .clone()
                .or_else(|| om.question.clone())
                .filter(|n| !n.trim().is_empty())?;
            Some(OptionDraft {
                display_name,
                icon: om.icon.clone(),
                image: om.image.clone(),
                source_id: om.id.clone().unwrap_or_default(),
            })
        })
        .collect();

    let id = match &container.id {
        Some(container_id) => format!("group_{container_id}"),
        None => derive_group_id(&title),
    };

    Ok(RawRecord::Event(RawEventGroup {
        id,
        title,
        banner: container.image.clone(),
        icon: container.icon.clone(),
        expiry,
        children,
        option_markets,
    }))
}

// ---------------------------------------------------------------------------
// Image resolution
// ---------------------------------------------------------------------------

/// Host allow-list and URL hygiene for everything the approval surface
/// will try to render. An empty allow-list accepts any host.
#[derive(Debug, Clone, Default)]
pub struct ImagePolicy {
    pub allowed_hosts: Vec<String>,
}

impl ImagePolicy {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self { allowed_hosts }
    }

    /// Accept a candidate URL or resolve it to absent. Never an error:
    /// a bad image is a missing image.
    pub fn validate(&self, candidate: Option<&str>) -> Option<String> {
        let raw = candidate?.trim();
        if raw.is_empty() || raw.to_ascii_lowercase().contains("undefined") {
            return None;
        }

        let url = reqwest::Url::parse(raw).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let host = url.host_str()?;

        if let Some(segments) = url.path_segments() {
            for segment in segments {
                let stem = segment
                    .split('.')
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                if stem == "null" || stem == "undefined" {
                    return None;
                }
            }
        }

        if !self.allowed_hosts.is_empty() {
            let allowed = self
                .allowed_hosts
                .iter()
                .any(|h| host == h || host.ends_with(&format!(".{h}")));
            if !allowed {
                return None;
            }
        }

        Some(raw.to_string())
    }
}

/// Select the banner and event icon for a canonical market.
///
/// Binary kind: banner is the market-level image; the market-level icon
/// is never used and option icons stay empty. Event kind: banner is the
/// first child container's image - never the parent record's own image
/// field. A market whose banner was already resolved is left untouched,
/// so re-running over the same raw input is a no-op.
pub fn resolve_images(market: &mut CanonicalMarket, record: &RawRecord, policy: &ImagePolicy) {
    if market.banner_resolved {
        return;
    }

    match record {
        RawRecord::Binary(binary) => {
            market.banner_url = policy.validate(binary.image.as_deref());
            market.event_icon_url = None;
            for option in &mut market.options {
                option.icon_url = None;
            }
        }
        RawRecord::Event(group) => {
            market.banner_url = policy.validate(group.banner.as_deref());
            market.event_icon_url = policy.validate(group.icon.as_deref());
        }
    }
    market.banner_resolved = true;
}

// ---------------------------------------------------------------------------
// Entity deduplication
// ---------------------------------------------------------------------------

static WILL_WIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*will\s+(.+?)\s+(?:be|win)\b").expect("static pattern compiles")
});
static WILL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*will\s+(.+?)(?:\s+(?:in|by|at|on)\s|\?|$)").expect("static pattern compiles")
});

/// Normalized entity key for an option surface form.
///
/// "Will Real Madrid win La Liga?" and "Real Madrid" both key to
/// `real madrid`. The interrogative patterns are heuristic and can
/// misfire on multi-clause phrasing; that precision limit is accepted.
pub fn entity_key(text: &str) -> String {
    for re in [&*WILL_WIN_RE, &*WILL_RE] {
        if let Some(caps) = re.captures(text) {
            if let Some(entity) = caps.get(1) {
                let entity = entity.as_str().trim();
                if !entity.is_empty() {
                    return entity.to_lowercase();
                }
            }
        }
    }
    text.trim().to_lowercase()
}

fn is_numeric_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
}

/// Collapse options denoting the same real-world entity, preserving
/// first-seen group order. Within a group the representative is the
/// first option with a non-numeric source id (those come from the
/// cleaner event-children source); if every id is numeric, the
/// shortest display name wins, first-seen breaking ties. The group's
/// icon is the first non-null icon, preferring the representative's.
pub fn dedupe_options(options: Vec<MarketOption>) -> Vec<MarketOption> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<MarketOption>> = HashMap::new();

    for option in options {
        let key = entity_key(&option.display_name);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(option);
    }

    order
        .into_iter()
        .map(|key| {
            let members = groups.remove(&key).expect("group recorded for key");
            pick_representative(members)
        })
        .collect()
}

fn pick_representative(members: Vec<MarketOption>) -> MarketOption {
    let best = members
        .iter()
        .position(|m| !is_numeric_id(&m.source_market_id))
        .unwrap_or_else(|| {
            let mut shortest = 0;
            for (index, member) in members.iter().enumerate() {
                if member.display_name.len() < members[shortest].display_name.len() {
                    shortest = index;
                }
            }
            shortest
        });

    let icon_url = members[best]
        .icon_url
        .clone()
        .or_else(|| members.iter().find_map(|m| m.icon_url.clone()));

    MarketOption {
        display_name: members[best].display_name.clone(),
        icon_url,
        source_market_id: members[best].source_market_id.clone(),
    }
}

// ---------------------------------------------------------------------------
// Canonicalization
// ---------------------------------------------------------------------------

/// Convert one raw payload into a canonical market, or decide to
/// discard it. Pure in its inputs and safe to re-execute.
pub fn canonicalize(
    raw: &RawMarket,
    now: DateTime<Utc>,
    policy: &ImagePolicy,
) -> Result<CanonicalMarket, Discard> {
    let record = classify(raw, now)?;
    Ok(canonicalize_record(&record, policy))
}

/// Build the canonical market for an already-classified record.
pub fn canonicalize_record(record: &RawRecord, policy: &ImagePolicy) -> CanonicalMarket {
    let mut market = match record {
        RawRecord::Binary(binary) => {
            let mut market = CanonicalMarket::new(&binary.id, MarketKind::Binary, &binary.question);
            market.expiry = binary.expiry;
            market.options = vec![
                MarketOption {
                    display_name: "Yes".to_string(),
                    icon_url: None,
                    source_market_id: binary.id.clone(),
                },
                MarketOption {
                    display_name: "No".to_string(),
                    icon_url: None,
                    source_market_id: binary.id.clone(),
                },
            ];
            market
        }
        RawRecord::Event(group) => {
            let mut market = CanonicalMarket::new(&group.id, MarketKind::Event, &group.title);
            market.expiry = group.expiry;
            market.options = event_options(group, policy);
            market
        }
    };

    resolve_images(&mut market, record, policy);
    market
}

/// Build the deduplicated option list for an event group. Both icon
/// sources contribute surface forms: the container children and the
/// parallel option-market list, merged by entity key.
fn event_options(group: &RawEventGroup, policy: &ImagePolicy) -> Vec<MarketOption> {
    let secondary: HashMap<String, &OptionDraft> = group
        .option_markets
        .iter()
        .map(|draft| (entity_key(&draft.display_name), draft))
        .collect();

    let resolved = group
        .children
        .iter()
        .chain(group.option_markets.iter())
        .map(|draft| {
            let key = entity_key(&draft.display_name);
            let icon_url = policy.validate(draft.icon.as_deref()).or_else(|| {
                secondary
                    .get(&key)
                    .and_then(|source| policy.validate(source.image.as_deref()))
            });
            MarketOption {
                display_name: draft.display_name.trim().to_string(),
                icon_url,
                source_market_id: draft.source_id.clone(),
            }
        })
        .collect();

    dedupe_options(resolved)
}

// ---------------------------------------------------------------------------
// Gamma client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff shared by every outbound HTTP caller.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Upstream record source. The production implementation talks to the
/// Gamma API; tests substitute a stub.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    /// One listing sweep. No ordering guarantee; already-seen records
    /// may reappear.
    async fn fetch_batch(&self) -> Result<Vec<RawMarket>, FetchError>;

    /// Re-fetch a single record by canonical id, used when banner
    /// resolution has to be re-run synchronously.
    async fn fetch_by_id(&self, canonical_id: &str) -> Result<Option<RawMarket>, FetchError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketPage {
    #[serde(default)]
    pub data: Vec<RawMarket>,
    pub next_cursor: Option<String>,
}

/// Cursor value the listing endpoint returns when there is no next page.
pub const END_CURSOR: &str = "LTE=";

pub struct GammaClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    max_pages: usize,
}

impl GammaClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("building gamma http client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
            max_pages: 2,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// GET one JSON document with retry on transient failures. A 404
    /// resolves to `None`.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.retry.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() {
                        return Ok(Some(resp.json::<T>().await?));
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries
                    {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_request_error(&err) == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

#[async_trait]
impl RecordFetcher for GammaClient {
    async fn fetch_batch(&self) -> Result<Vec<RawMarket>, FetchError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 1..=self.max_pages {
            let url = match &cursor {
                Some(cursor) => format!("{}/markets?next_cursor={cursor}", self.base_url),
                None => format!("{}/markets", self.base_url),
            };
            debug!(page, %url, "fetching gamma listing page");

            let Some(body) = self.get_json::<MarketPage>(&url).await? else {
                break;
            };
            let fetched = body.data.len();
            all.extend(body.data);

            match body.next_cursor {
                Some(next) if next != END_CURSOR && !next.is_empty() => cursor = Some(next),
                _ => break,
            }
            if fetched == 0 {
                break;
            }
        }

        info!(markets = all.len(), "gamma listing sweep complete");
        Ok(all)
    }

    async fn fetch_by_id(&self, canonical_id: &str) -> Result<Option<RawMarket>, FetchError> {
        if let Some(container_id) = canonical_id.strip_prefix("group_") {
            // Derived group ids (no upstream container id) cannot be
            // re-fetched.
            if container_id.len() == 40 && container_id.chars().all(|c| c.is_ascii_hexdigit()) {
                warn!(canonical_id, "derived group id is not re-fetchable");
                return Ok(None);
            }
            let url = format!("{}/events/{container_id}", self.base_url);
            let container = self.get_json::<RawEventContainer>(&url).await?;
            return Ok(container.map(|container| RawMarket {
                is_multiple_choice: Some(true),
                question: container.title.clone(),
                events: vec![container],
                ..RawMarket::default()
            }));
        }

        let url = format!("{}/markets/{canonical_id}", self.base_url);
        self.get_json::<RawMarket>(&url).await
    }
}
