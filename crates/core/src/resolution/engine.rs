use std::collections::BTreeMap;

use thiserror::Error;

use crate::domain::dose::DoseId;
use crate::domain::issue::{CancelPolicy, IssueKind, ResolutionChoice};
use crate::resolution::states::{
    PendingIssue, QueueAction, QueueContext, QueueEvent, QueueState, Resolution, ServerRequest,
    TransitionOutcome,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueueTransitionError {
    #[error("invalid queue transition from {state:?} using event {event:?}")]
    InvalidTransition { state: QueueState, event: QueueEvent },
    #[error("{choice:?} is not an available choice for {issue:?}")]
    ChoiceNotAllowed { issue: IssueKind, choice: ResolutionChoice },
    #[error("{request:?} already attempted {attempts} time(s); only abort is available")]
    RetriesExhausted { request: ServerRequest, attempts: u32 },
}

/// Pure transition function of the issue resolution queue.
pub fn transition(
    current: &QueueState,
    event: &QueueEvent,
    context: &QueueContext,
) -> Result<TransitionOutcome, QueueTransitionError> {
    use QueueAction as A;
    use QueueEvent as E;
    use QueueState::{
        AwaitingServer, AwaitingUserInput, Idle, IssuePending, Resolved, ServerFailed,
    };

    let (to, actions) = match (current, event) {
        (Idle, E::IssueDetected(pending)) => (
            IssuePending { dose_id: pending.dose_id.clone(), issue: pending.issue.clone() },
            vec![A::PresentIssue],
        ),
        (IssuePending { dose_id, issue }, E::Present) => {
            (AwaitingUserInput { dose_id: dose_id.clone(), issue: issue.clone() }, Vec::new())
        }
        (AwaitingUserInput { dose_id, issue }, E::ChoiceMade(choice)) => {
            if !issue.allows(choice) {
                return Err(QueueTransitionError::ChoiceNotAllowed {
                    issue: issue.kind(),
                    choice: choice.clone(),
                });
            }

            let (dose_id, issue) = (dose_id.clone(), issue.clone());
            match ServerRequest::for_choice(choice) {
                Some(request) => {
                    let action = request.action();
                    (AwaitingServer { dose_id, issue, request, attempts: 1 }, vec![action])
                }
                None => {
                    let action = if choice.removes_dose() {
                        A::RemoveDose
                    } else {
                        A::ApplyChoice(choice.clone())
                    };
                    let resolution = Resolution::Applied(choice.clone());
                    (Resolved { dose_id, issue, resolution }, vec![action])
                }
            }
        }
        (IssuePending { dose_id, issue } | AwaitingUserInput { dose_id, issue }, E::Cancelled) => {
            let policy = issue.cancel_policy();
            let action = match policy {
                CancelPolicy::RollBack => A::RollBackDose,
                CancelPolicy::KeepDose => A::KeepDose,
            };
            let resolution = Resolution::Cancelled(policy);
            (Resolved { dose_id: dose_id.clone(), issue: issue.clone(), resolution }, vec![action])
        }
        (AwaitingServer { .. }, E::ServerSlow) => (current.clone(), vec![A::ShowTakingLonger]),
        (AwaitingServer { dose_id, issue, request, .. }, E::ServerSucceeded) => {
            let choice = request.choice();
            (
                Resolved {
                    dose_id: dose_id.clone(),
                    issue: issue.clone(),
                    resolution: Resolution::Applied(choice.clone()),
                },
                vec![A::ApplyChoice(choice)],
            )
        }
        (AwaitingServer { dose_id, issue, request, attempts }, E::ServerErrored) => {
            let retry_allowed = *attempts <= context.max_user_retries;
            let offer = if retry_allowed { A::OfferRetry } else { A::OfferAbort };
            (
                ServerFailed {
                    dose_id: dose_id.clone(),
                    issue: issue.clone(),
                    request: *request,
                    attempts: *attempts,
                    retry_allowed,
                },
                vec![offer],
            )
        }
        (ServerFailed { dose_id, issue, request, attempts, retry_allowed }, E::Retry) => {
            if !retry_allowed {
                return Err(QueueTransitionError::RetriesExhausted {
                    request: *request,
                    attempts: *attempts,
                });
            }
            (
                AwaitingServer {
                    dose_id: dose_id.clone(),
                    issue: issue.clone(),
                    request: *request,
                    attempts: attempts.saturating_add(1),
                },
                vec![request.action()],
            )
        }
        (
            AwaitingServer { dose_id, issue, request, .. }
            | ServerFailed { dose_id, issue, request, .. },
            E::Abort | E::Cancelled,
        ) => {
            let pending_action = request.cancel_action();
            (
                Resolved {
                    dose_id: dose_id.clone(),
                    issue: issue.clone(),
                    resolution: Resolution::ServerAborted(pending_action),
                },
                vec![A::PendingProductAction(pending_action), A::RollBackDose],
            )
        }
        (Resolved { .. }, E::Advance) => match &context.next {
            Some(next) => (
                IssuePending { dose_id: next.dose_id.clone(), issue: next.issue.clone() },
                vec![A::PresentIssue],
            ),
            None => (Idle, Vec::new()),
        },
        _ => {
            return Err(QueueTransitionError::InvalidTransition {
                state: current.clone(),
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: current.clone(), to, event: event.clone(), actions })
}

/// Holds the in-flight issue in its state and every other detected issue in
/// staging order. Only one issue is ever in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssueQueue {
    state: QueueState,
    pending: BTreeMap<u64, PendingIssue>,
    max_user_retries: u32,
}

impl IssueQueue {
    pub fn new(max_user_retries: u32) -> Self {
        Self { state: QueueState::Idle, pending: BTreeMap::new(), max_user_retries }
    }

    pub fn state(&self) -> &QueueState {
        &self.state
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingIssue> {
        self.pending.values()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Idle with nothing queued.
    pub fn is_settled(&self) -> bool {
        self.state.is_idle() && self.pending.is_empty()
    }

    pub fn is_in_flight(&self, dose_id: &DoseId) -> bool {
        self.state.in_flight().is_some_and(|(in_flight, _)| in_flight == dose_id)
    }

    pub fn queued_for(&self, dose_id: &DoseId) -> Option<&PendingIssue> {
        self.pending.values().find(|pending| &pending.dose_id == dose_id)
    }

    /// Queues an issue. A dose has at most one queued issue; a newer detection
    /// replaces the older one.
    pub fn enqueue(&mut self, pending: PendingIssue) {
        self.withdraw(&pending.dose_id);
        self.pending.insert(pending.staged_seq, pending);
    }

    /// Drops a queued issue that was not yet presented.
    pub fn withdraw(&mut self, dose_id: &DoseId) -> Option<PendingIssue> {
        let seq = self.queued_for(dose_id).map(|pending| pending.staged_seq)?;
        self.pending.remove(&seq)
    }

    /// Pulls the head of the queue in when idle, or advances past a resolved
    /// issue. Returns `None` when there is nothing to do.
    pub fn pull_next(&mut self) -> Result<Option<TransitionOutcome>, QueueTransitionError> {
        match &self.state {
            QueueState::Idle => match self.pending.first_key_value() {
                Some((_, head)) => {
                    let event = QueueEvent::IssueDetected(head.clone());
                    self.apply(event).map(Some)
                }
                None => Ok(None),
            },
            QueueState::Resolved { .. } => self.apply(QueueEvent::Advance).map(Some),
            _ => Ok(None),
        }
    }

    pub fn apply(&mut self, event: QueueEvent) -> Result<TransitionOutcome, QueueTransitionError> {
        let context = QueueContext {
            max_user_retries: self.max_user_retries,
            next: self.pending.first_key_value().map(|(_, head)| head.clone()),
        };
        let outcome = transition(&self.state, &event, &context)?;

        if let QueueState::IssuePending { dose_id, .. } = &outcome.to {
            self.withdraw(dose_id);
        }
        self.state = outcome.to.clone();
        Ok(outcome)
    }
}
