use thiserror::Error;

use crate::domain::dose::{DoseId, DoseState};
use crate::domain::visit::VisitId;
use crate::reconciliation::ReasonContext;
use crate::resolution::{QueueTransitionError, ServerRequest};
use crate::session::SideFlow;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid dose transition from {from:?} to {to:?}")]
    InvalidDoseTransition { from: DoseState, to: DoseState },
    #[error(transparent)]
    QueueTransition(#[from] QueueTransitionError),
    #[error("dose `{0}` is not staged in this checkout")]
    UnknownDose(DoseId),
    #[error("dose `{0}` has an issue in front of the clinician")]
    DoseBusy(DoseId),
    #[error("dose `{0}` is not active in this checkout")]
    DoseNotActive(DoseId),
    #[error("dose `{0}` has no payment flip to revert")]
    NothingToRevert(DoseId),
    #[error("server reply does not match the pending request {expected:?}")]
    UnexpectedServerReply { expected: Option<ServerRequest> },
    #[error("snapshot for visit `{received:?}` cannot refresh checkout of visit `{expected:?}`")]
    VisitMismatch { expected: VisitId, received: VisitId },
    #[error("checkout session is closed")]
    SessionClosed,
    #[error(
        "checkout is not ready for summary: {pending_issues} pending issue(s), \
         missing reasons {missing_reasons:?}, open side flow {open_side_flow:?}, \
         doses without payment mode {unpaid_doses:?}"
    )]
    NotReadyForSummary {
        pending_issues: usize,
        missing_reasons: Vec<ReasonContext>,
        open_side_flow: Option<SideFlow>,
        unpaid_doses: Vec<DoseId>,
    },
    #[error("reason for {0:?} must not be blank")]
    BlankReason(ReasonContext),
    #[error("no side flow is open")]
    NoOpenSideFlow,
    #[error("side flow result for {received:?} does not match open side flow {expected:?}")]
    SideFlowMismatch { expected: Option<SideFlow>, received: SideFlow },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    /// Invariant violations are programming errors; the session must not submit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("{operation} timed out after {after_secs}s")]
    Timeout { operation: String, after_secs: u64 },
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "That action is not available right now. Resolve the current step and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The server is taking longer than expected. Try again or cancel this step."
            }
            Self::Internal { .. } => "Checkout cannot be completed. Contact support.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(DomainError::InvariantViolation(message)) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Domain(_) => Self::BadRequest {
                message: "checkout validation failed".to_owned(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Timeout { operation, after_secs } => Self::ServiceUnavailable {
                message: format!("{operation} timed out after {after_secs}s"),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}
