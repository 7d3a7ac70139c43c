use serde::{Deserialize, Serialize};

use crate::domain::dose::DoseId;
use crate::domain::issue::{CancelPolicy, Issue, ResolutionChoice};
use crate::domain::product::InventorySource;

/// An issue waiting for its turn, keyed by the staging position of its dose.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIssue {
    pub staged_seq: u64,
    pub dose_id: DoseId,
    pub issue: Issue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", content = "value", rename_all = "snake_case")]
pub enum ServerRequest {
    CopayCheck,
    StockChange(InventorySource),
}

impl ServerRequest {
    pub fn for_choice(choice: &ResolutionChoice) -> Option<Self> {
        match choice {
            ResolutionChoice::RunCopayCheck => Some(Self::CopayCheck),
            ResolutionChoice::ChangeStock(source) => Some(Self::StockChange(*source)),
            _ => None,
        }
    }

    pub fn choice(self) -> ResolutionChoice {
        match self {
            Self::CopayCheck => ResolutionChoice::RunCopayCheck,
            Self::StockChange(source) => ResolutionChoice::ChangeStock(source),
        }
    }

    pub fn action(self) -> QueueAction {
        match self {
            Self::CopayCheck => QueueAction::RunCopayCheck,
            Self::StockChange(source) => QueueAction::RequestStockChange(source),
        }
    }

    pub fn cancel_action(self) -> PendingProductAction {
        match self {
            Self::CopayCheck => PendingProductAction::CopayCheckCancel,
            Self::StockChange(_) => PendingProductAction::SetStockCancel,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::CopayCheck => "copay check",
            Self::StockChange(_) => "stock change",
        }
    }
}

/// Terminal outcome of a server-bound step the clinician abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingProductAction {
    SetStockCancel,
    CopayCheckCancel,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    Applied(ResolutionChoice),
    Cancelled(CancelPolicy),
    ServerAborted(PendingProductAction),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueueState {
    Idle,
    IssuePending {
        dose_id: DoseId,
        issue: Issue,
    },
    AwaitingUserInput {
        dose_id: DoseId,
        issue: Issue,
    },
    AwaitingServer {
        dose_id: DoseId,
        issue: Issue,
        request: ServerRequest,
        attempts: u32,
    },
    ServerFailed {
        dose_id: DoseId,
        issue: Issue,
        request: ServerRequest,
        attempts: u32,
        retry_allowed: bool,
    },
    Resolved {
        dose_id: DoseId,
        issue: Issue,
        resolution: Resolution,
    },
}

impl QueueState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::IssuePending { .. } => "issue_pending",
            Self::AwaitingUserInput { .. } => "awaiting_user_input",
            Self::AwaitingServer { .. } => "awaiting_server",
            Self::ServerFailed { .. } => "server_failed",
            Self::Resolved { .. } => "resolved",
        }
    }

    /// The dose and issue currently held by the queue, if any.
    pub fn in_flight(&self) -> Option<(&DoseId, &Issue)> {
        match self {
            Self::Idle => None,
            Self::IssuePending { dose_id, issue }
            | Self::AwaitingUserInput { dose_id, issue }
            | Self::AwaitingServer { dose_id, issue, .. }
            | Self::ServerFailed { dose_id, issue, .. }
            | Self::Resolved { dose_id, issue, .. } => Some((dose_id, issue)),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "value", rename_all = "snake_case")]
pub enum QueueEvent {
    IssueDetected(PendingIssue),
    Present,
    ChoiceMade(ResolutionChoice),
    ServerSlow,
    ServerSucceeded,
    ServerErrored,
    Retry,
    Abort,
    Cancelled,
    Advance,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum QueueAction {
    PresentIssue,
    ApplyChoice(ResolutionChoice),
    RemoveDose,
    RollBackDose,
    KeepDose,
    RunCopayCheck,
    RequestStockChange(InventorySource),
    ShowTakingLonger,
    OfferRetry,
    OfferAbort,
    PendingProductAction(PendingProductAction),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueContext {
    pub max_user_retries: u32,
    /// Head of the pending queue, consulted when a resolved issue advances.
    pub next: Option<PendingIssue>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: QueueState,
    pub to: QueueState,
    pub event: QueueEvent,
    pub actions: Vec<QueueAction>,
}
