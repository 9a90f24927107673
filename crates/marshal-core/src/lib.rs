//! Core domain model and approval state machine for Market Marshal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "marshal-core";

/// Upstream shape a canonical market was normalized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Binary,
    Event,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Binary => "binary",
            MarketKind::Event => "event",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "binary" => Some(MarketKind::Binary),
            "event" => Some(MarketKind::Event),
            _ => None,
        }
    }
}

/// Lifecycle of a canonical market inside the approval pipeline.
///
/// `TimedOut` is terminal and audited with its own decision tag, but is
/// otherwise equivalent to `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    PendingImage,
    Approved,
    Rejected,
    Deployed,
    TimedOut,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::PendingImage => "pending_image",
            LifecycleState::Approved => "approved",
            LifecycleState::Rejected => "rejected",
            LifecycleState::Deployed => "deployed",
            LifecycleState::TimedOut => "timed_out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(LifecycleState::Pending),
            "pending_image" => Some(LifecycleState::PendingImage),
            "approved" => Some(LifecycleState::Approved),
            "rejected" => Some(LifecycleState::Rejected),
            "deployed" => Some(LifecycleState::Deployed),
            "timed_out" => Some(LifecycleState::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Rejected | LifecycleState::Deployed | LifecycleState::TimedOut
        )
    }
}

/// Human-approval stage a decision applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Stage 1: the market itself.
    Market,
    /// Stage 2: the generated banner image.
    Image,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Market => "market",
            Stage::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "market" => Some(Stage::Market),
            "image" => Some(Stage::Image),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
    Timeout,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approve" => Some(Decision::Approve),
            "reject" => Some(Decision::Reject),
            "timeout" => Some(Decision::Timeout),
            _ => None,
        }
    }
}

/// Closed category set assigned by the categorizer adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryLabel {
    Politics,
    Crypto,
    Sports,
    Business,
    Culture,
    News,
    Tech,
}

impl CategoryLabel {
    /// Label assigned when categorization fails or returns garbage.
    pub const FALLBACK: CategoryLabel = CategoryLabel::News;

    pub const ALL: [CategoryLabel; 7] = [
        CategoryLabel::Politics,
        CategoryLabel::Crypto,
        CategoryLabel::Sports,
        CategoryLabel::Business,
        CategoryLabel::Culture,
        CategoryLabel::News,
        CategoryLabel::Tech,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryLabel::Politics => "politics",
            CategoryLabel::Crypto => "crypto",
            CategoryLabel::Sports => "sports",
            CategoryLabel::Business => "business",
            CategoryLabel::Culture => "culture",
            CategoryLabel::News => "news",
            CategoryLabel::Tech => "tech",
        }
    }

    /// Lenient parse of a model-produced label. Anything outside the
    /// closed set maps to `None`; callers coerce to [`Self::FALLBACK`].
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|l| l.as_str() == trimmed)
    }
}

/// One selectable outcome of a canonical market, deduplicated by entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketOption {
    pub display_name: String,
    pub icon_url: Option<String>,
    pub source_market_id: String,
}

/// The normalized, pipeline-internal representation of a market,
/// regardless of upstream shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMarket {
    pub id: String,
    pub kind: MarketKind,
    pub question: String,
    pub category: Option<CategoryLabel>,
    pub banner_url: Option<String>,
    pub banner_resolved: bool,
    pub event_icon_url: Option<String>,
    pub options: Vec<MarketOption>,
    pub expiry: Option<DateTime<Utc>>,
    pub lifecycle_state: LifecycleState,
    pub approval_ref: Option<String>,
    pub approval_posted_at: Option<DateTime<Utc>>,
    pub image_approval_ref: Option<String>,
    pub image_approval_posted_at: Option<DateTime<Utc>>,
    pub image_ref: Option<String>,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CanonicalMarket {
    pub fn new(id: impl Into<String>, kind: MarketKind, question: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            question: question.into(),
            category: None,
            banner_url: None,
            banner_resolved: false,
            event_icon_url: None,
            options: Vec::new(),
            expiry: None,
            lifecycle_state: LifecycleState::Pending,
            approval_ref: None,
            approval_posted_at: None,
            image_approval_ref: None,
            image_approval_posted_at: None,
            image_ref: None,
            external_id: None,
            created_at: Utc::now(),
        }
    }

    /// Handle attached to the given approval stage, if posted.
    pub fn approval_handle(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Market => self.approval_ref.as_deref(),
            Stage::Image => self.image_approval_ref.as_deref(),
        }
    }

    pub fn approval_posted_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Market => self.approval_posted_at,
            Stage::Image => self.image_approval_posted_at,
        }
    }
}

/// Append-only audit row: one per applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub market_id: String,
    pub stage: Stage,
    pub decision: Decision,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A raw decision observed on the approval surface for one handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSignal {
    pub decision: Decision,
    pub actor: Option<String>,
    pub at: DateTime<Utc>,
}

/// Outcome of feeding a decision event into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The market advances to the contained state.
    Advance(LifecycleState),
    /// The decision targets a terminal state or the wrong stage; the
    /// caller logs a warning and applies nothing.
    Stale,
}

/// Pure approval state machine.
///
/// ```text
/// Pending      --(market approve)--> PendingImage
/// Pending      --(market reject)---> Rejected
/// Pending      --(market timeout)--> TimedOut
/// PendingImage --(image approve)---> Approved
/// PendingImage --(image reject)----> Rejected
/// PendingImage --(image timeout)---> TimedOut
/// ```
///
/// Everything else - duplicate deliveries, decisions for an earlier
/// stage, decisions on terminal records - is `Stale`.
pub fn transition(current: LifecycleState, stage: Stage, decision: Decision) -> Transition {
    match (current, stage, decision) {
        (LifecycleState::Pending, Stage::Market, Decision::Approve) => {
            Transition::Advance(LifecycleState::PendingImage)
        }
        (LifecycleState::Pending, Stage::Market, Decision::Reject) => {
            Transition::Advance(LifecycleState::Rejected)
        }
        (LifecycleState::Pending, Stage::Market, Decision::Timeout) => {
            Transition::Advance(LifecycleState::TimedOut)
        }
        (LifecycleState::PendingImage, Stage::Image, Decision::Approve) => {
            Transition::Advance(LifecycleState::Approved)
        }
        (LifecycleState::PendingImage, Stage::Image, Decision::Reject) => {
            Transition::Advance(LifecycleState::Rejected)
        }
        (LifecycleState::PendingImage, Stage::Image, Decision::Timeout) => {
            Transition::Advance(LifecycleState::TimedOut)
        }
        _ => Transition::Stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_advances_only_through_market_stage() {
        assert_eq!(
            transition(LifecycleState::Pending, Stage::Market, Decision::Approve),
            Transition::Advance(LifecycleState::PendingImage)
        );
        assert_eq!(
            transition(LifecycleState::Pending, Stage::Market, Decision::Reject),
            Transition::Advance(LifecycleState::Rejected)
        );
        assert_eq!(
            transition(LifecycleState::Pending, Stage::Market, Decision::Timeout),
            Transition::Advance(LifecycleState::TimedOut)
        );
        // An image-stage decision cannot touch a stage-1 record.
        assert_eq!(
            transition(LifecycleState::Pending, Stage::Image, Decision::Approve),
            Transition::Stale
        );
    }

    #[test]
    fn pending_image_advances_only_through_image_stage() {
        assert_eq!(
            transition(LifecycleState::PendingImage, Stage::Image, Decision::Approve),
            Transition::Advance(LifecycleState::Approved)
        );
        assert_eq!(
            transition(LifecycleState::PendingImage, Stage::Image, Decision::Reject),
            Transition::Advance(LifecycleState::Rejected)
        );
        assert_eq!(
            transition(LifecycleState::PendingImage, Stage::Market, Decision::Approve),
            Transition::Stale
        );
    }

    #[test]
    fn terminal_states_reject_every_decision() {
        for state in [
            LifecycleState::Rejected,
            LifecycleState::Deployed,
            LifecycleState::TimedOut,
        ] {
            for stage in [Stage::Market, Stage::Image] {
                for decision in [Decision::Approve, Decision::Reject, Decision::Timeout] {
                    assert_eq!(transition(state, stage, decision), Transition::Stale);
                }
            }
        }
    }

    #[test]
    fn approved_only_moves_via_deployment() {
        // Approved is not decision-driven; only the deploy pass may
        // conditionally mark it Deployed.
        for stage in [Stage::Market, Stage::Image] {
            for decision in [Decision::Approve, Decision::Reject, Decision::Timeout] {
                assert_eq!(
                    transition(LifecycleState::Approved, stage, decision),
                    Transition::Stale
                );
            }
        }
    }

    #[test]
    fn category_parse_is_lenient_but_closed() {
        assert_eq!(CategoryLabel::parse("Sports"), Some(CategoryLabel::Sports));
        assert_eq!(CategoryLabel::parse("  crypto "), Some(CategoryLabel::Crypto));
        assert_eq!(CategoryLabel::parse("finance"), None);
        assert_eq!(CategoryLabel::parse(""), None);
    }

    #[test]
    fn lifecycle_round_trips_through_strings() {
        for state in [
            LifecycleState::Pending,
            LifecycleState::PendingImage,
            LifecycleState::Approved,
            LifecycleState::Rejected,
            LifecycleState::Deployed,
            LifecycleState::TimedOut,
        ] {
            assert_eq!(LifecycleState::parse(state.as_str()), Some(state));
        }
        assert_eq!(LifecycleState::parse("limbo"), None);
    }

    #[test]
    fn only_rejected_deployed_and_timed_out_are_terminal() {
        assert!(!LifecycleState::Pending.is_terminal());
        assert!(!LifecycleState::PendingImage.is_terminal());
        assert!(!LifecycleState::Approved.is_terminal());
        assert!(LifecycleState::Rejected.is_terminal());
        assert!(LifecycleState::Deployed.is_terminal());
        assert!(LifecycleState::TimedOut.is_terminal());
    }
}
