//! The staged checkout aggregate: one owned session per visit, driven through
//! `apply(event)` and observed through `state()`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditContext, AuditOutcome, AuditSink};
use crate::config::FeatureFlags;
use crate::domain::copay::{CopayInfo, CopayStatus, MedDIdentifier};
use crate::domain::dose::{CandidateDose, Dose, DoseId, DoseState};
use crate::domain::issue::{Issue, IssueKind, ResolutionChoice};
use crate::domain::order::OrderNumber;
use crate::domain::payment::{PaymentMethod, PaymentMode, PaymentModeReason};
use crate::domain::product::{InventorySource, LotInfo};
use crate::domain::visit::{Payer, VisitId, VisitSnapshot};
use crate::eligibility::RuleInput;
use crate::errors::DomainError;
use crate::payment::{self, PaymentContext, SubmissionPlan, VisitUpdates};
use crate::reconciliation::{self, DoseReason, ReasonCollection, ReasonContext};
use crate::resolution::{
    IssueQueue, PendingIssue, PendingProductAction, QueueAction, QueueEvent, QueueState,
    ServerRequest, TransitionOutcome,
};
use crate::verification::{
    DeterministicProductVerifier, ProductVerifier, RuleVerdict, Verification, VerificationInput,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideFlow {
    PhoneCollection,
    InsuranceCard,
    MedDIdentifier,
    PayerInfo,
}

/// Typed resume value for a suspended side flow.
#[derive(Clone, Debug)]
pub enum SideFlowResult {
    PhoneCollected(String),
    PhoneDeclined,
    InsuranceCaptured(Payer),
    InsuranceDeclined,
    MedDIdentifierCollected(MedDIdentifier),
    PayerInfo(Payer),
    /// The clinician navigated back out of whichever side flow is open.
    BackedOut,
}

impl SideFlowResult {
    pub fn flow(&self) -> Option<SideFlow> {
        match self {
            Self::PhoneCollected(_) | Self::PhoneDeclined => Some(SideFlow::PhoneCollection),
            Self::InsuranceCaptured(_) | Self::InsuranceDeclined => Some(SideFlow::InsuranceCard),
            Self::MedDIdentifierCollected(_) => Some(SideFlow::MedDIdentifier),
            Self::PayerInfo(_) => Some(SideFlow::PayerInfo),
            Self::BackedOut => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipTarget {
    SelfPay,
    PartnerBill,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlipRequest {
    pub dose_ids: Vec<DoseId>,
    pub target: FlipTarget,
    pub reason: PaymentModeReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "value", rename_all = "snake_case")]
pub enum ServerReply {
    CopayChecked(CopayInfo),
    StockChanged,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    StageProduct(CandidateDose),
    /// A dose already given on a visit being edited.
    StageAdministered(CandidateDose),
    /// An open order shown as a not-yet-added dose.
    SurfaceOrder(CandidateDose),
    AddOrderedDose {
        dose_id: DoseId,
        lot: Option<LotInfo>,
    },
    RemoveDose(DoseId),
    RestoreDose(DoseId),
    Resolve(ResolutionChoice),
    CancelIssue,
    ServerSlow,
    ServerSucceeded(ServerReply),
    ServerFailed,
    Retry,
    Abort,
    FlipPayment(FlipRequest),
    RevertPaymentFlip(DoseId),
    OpenSideFlow {
        flow: SideFlow,
        flip: Option<FlipRequest>,
    },
    SideFlowResumed(SideFlowResult),
    CollectReason(DoseReason),
    RefreshSnapshot(Box<VisitSnapshot>),
    RerunCopayCheck,
    CompleteCheckout,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StageProduct(_) => "stage_product",
            Self::StageAdministered(_) => "stage_administered",
            Self::SurfaceOrder(_) => "surface_order",
            Self::AddOrderedDose { .. } => "add_ordered_dose",
            Self::RemoveDose(_) => "remove_dose",
            Self::RestoreDose(_) => "restore_dose",
            Self::Resolve(_) => "resolve",
            Self::CancelIssue => "cancel_issue",
            Self::ServerSlow => "server_slow",
            Self::ServerSucceeded(_) => "server_succeeded",
            Self::ServerFailed => "server_failed",
            Self::Retry => "retry",
            Self::Abort => "abort",
            Self::FlipPayment(_) => "flip_payment",
            Self::RevertPaymentFlip(_) => "revert_payment_flip",
            Self::OpenSideFlow { .. } => "open_side_flow",
            Self::SideFlowResumed(_) => "side_flow_resumed",
            Self::CollectReason(_) => "collect_reason",
            Self::RefreshSnapshot(_) => "refresh_snapshot",
            Self::RerunCopayCheck => "rerun_copay_check",
            Self::CompleteCheckout => "complete_checkout",
        }
    }
}

/// Work the caller must carry out or show as a result of an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SessionEffect {
    CallServer { dose_id: DoseId, request: ServerRequest, attempt: u32 },
    TakingLonger { dose_id: DoseId },
    OfferRetry { dose_id: DoseId },
    OfferAbort { dose_id: DoseId },
    PendingProductAction { dose_id: DoseId, action: PendingProductAction },
    Banner { dose_id: DoseId, issue: Issue },
    DoseRolledBack { dose_id: DoseId },
    Submit { plan: SubmissionPlan },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshDiff {
    pub withdrawn_ordered: Vec<DoseId>,
    /// Open orders no dose represents yet; the caller surfaces them.
    pub new_orders: Vec<OrderNumber>,
    pub flagged: Vec<DoseId>,
    pub cleared: Vec<DoseId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub transitions: Vec<TransitionOutcome>,
    pub effects: Vec<SessionEffect>,
    pub refresh: Option<RefreshDiff>,
}

/// Demographic and payer changes captured by side flows, submitted with the
/// checkout.
#[derive(Clone, Debug, Default)]
pub struct SideFlowDeltas {
    pub phone: Option<String>,
    pub payer: Option<Payer>,
    pub medd_identifier: Option<MedDIdentifier>,
    pub stock_source: Option<InventorySource>,
}

impl SideFlowDeltas {
    pub fn updates(&self) -> VisitUpdates {
        VisitUpdates {
            phone: self.phone.clone(),
            payer: self.payer.clone(),
            stock_source: self.stock_source,
            medd_identifier: self.medd_identifier.as_ref().map(MedDIdentifier::masked),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct OpenSideFlow {
    flow: SideFlow,
    /// Doses flipped when the flow opened; backing out reverts them.
    flipped: Vec<DoseId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentIssue {
    pub dose_id: DoseId,
    pub issue: Issue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub visit_id: VisitId,
    pub closed: bool,
    pub queue: QueueState,
    pub current_issue: Option<CurrentIssue>,
    pub pending: Vec<PendingIssue>,
    pub doses: Vec<Dose>,
    pub reason_contexts: BTreeSet<ReasonContext>,
    pub missing_reasons: Vec<ReasonContext>,
    pub open_side_flow: Option<SideFlow>,
    pub ready_for_summary: bool,
}

/// Mutable, checkpointable part of the session. An event that fails restores
/// the checkpoint, so nothing is ever half applied.
#[derive(Clone, Debug)]
struct Aggregate {
    snapshot: VisitSnapshot,
    flags: FeatureFlags,
    doses: Vec<Dose>,
    queue: IssueQueue,
    reasons: ReasonCollection,
    deltas: SideFlowDeltas,
    side_flow: Option<OpenSideFlow>,
    /// Copy of each dose taken before its addition started; `None` means the dose
    /// did not exist. Dropped once the dose has no issue left.
    rollback: BTreeMap<DoseId, Option<Dose>>,
    banners: BTreeMap<DoseId, Vec<Issue>>,
    copay_checked: bool,
    next_seq: u64,
    closed: bool,
}

#[derive(Default)]
struct Step {
    transitions: Vec<TransitionOutcome>,
    effects: Vec<SessionEffect>,
    refresh: Option<RefreshDiff>,
}

pub struct CheckoutSession<V = DeterministicProductVerifier> {
    verifier: V,
    aggregate: Aggregate,
}

impl<V> CheckoutSession<V>
where
    V: ProductVerifier,
{
    pub fn new(
        snapshot: VisitSnapshot,
        flags: FeatureFlags,
        max_user_retries: u32,
        verifier: V,
    ) -> Self {
        info!(
            event_name = "checkout.session.opened",
            visit_id = %snapshot.visit_id.0,
            "checkout session opened"
        );

        Self {
            verifier,
            aggregate: Aggregate {
                snapshot,
                flags,
                doses: Vec::new(),
                queue: IssueQueue::new(max_user_retries),
                reasons: ReasonCollection::default(),
                deltas: SideFlowDeltas::default(),
                side_flow: None,
                rollback: BTreeMap::new(),
                banners: BTreeMap::new(),
                copay_checked: false,
                next_seq: 1,
                closed: false,
            },
        }
    }

    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionOutcome, DomainError> {
        if self.aggregate.closed {
            return Err(DomainError::SessionClosed);
        }

        let name = event.name();
        let checkpoint = self.aggregate.clone();
        let mut step = Step::default();
        let result = self
            .aggregate
            .dispatch(&self.verifier, event, &mut step)
            .and_then(|()| self.aggregate.pump(&mut step));

        match result {
            Ok(()) => {
                debug!(
                    event_name = "checkout.session.event_applied",
                    visit_id = %self.aggregate.snapshot.visit_id.0,
                    event = name,
                    queue = self.aggregate.queue.state().name(),
                    effects = step.effects.len(),
                    "checkout event applied"
                );
                Ok(SessionOutcome {
                    transitions: step.transitions,
                    effects: step.effects,
                    refresh: step.refresh,
                })
            }
            Err(error) => {
                self.aggregate = checkpoint;
                debug!(
                    event_name = "checkout.session.event_rejected",
                    visit_id = %self.aggregate.snapshot.visit_id.0,
                    event = name,
                    error = %error,
                    "checkout event rejected"
                );
                Err(error)
            }
        }
    }

    pub fn apply_with_audit<S>(
        &mut self,
        event: SessionEvent,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<SessionOutcome, DomainError>
    where
        S: AuditSink + ?Sized,
    {
        let name = event.name();
        let result = self.apply(event);
        match &result {
            Ok(outcome) => {
                let mut applied = audit
                    .record(name, AuditOutcome::Applied)
                    .with_detail("queue", self.aggregate.queue.state().name())
                    .with_detail("effects", outcome.effects.len().to_string());

                let submitted = outcome.effects.iter().find_map(|effect| match effect {
                    SessionEffect::Submit { plan } => Some(plan),
                    _ => None,
                });
                if let Some(encoded) = submitted.and_then(|plan| serde_json::to_string(plan).ok()) {
                    applied = applied.with_detail("submission_plan", encoded);
                }
                sink.emit(applied);
            }
            Err(error) => {
                let outcome =
                    if error.is_fatal() { AuditOutcome::Fatal } else { AuditOutcome::Rejected };
                sink.emit(audit.record(name, outcome).with_detail("error", error.to_string()));
            }
        }
        result
    }

    pub fn state(&self) -> SessionState {
        let aggregate = &self.aggregate;
        let reason_contexts = aggregate.required_reasons();
        let missing_reasons = aggregate.reasons.missing(&reason_contexts);

        SessionState {
            visit_id: aggregate.snapshot.visit_id.clone(),
            closed: aggregate.closed,
            queue: aggregate.queue.state().clone(),
            current_issue: self.current_issue(),
            pending: aggregate.queue.pending().cloned().collect(),
            doses: aggregate.doses.clone(),
            ready_for_summary: aggregate.ready_for_summary(),
            reason_contexts,
            missing_reasons,
            open_side_flow: aggregate.side_flow.as_ref().map(|open| open.flow),
        }
    }

    /// Queue idle with nothing pending and no side flow open; every active dose
    /// has a payment mode and every required reason is collected.
    pub fn ready_for_summary(&self) -> bool {
        self.aggregate.ready_for_summary()
    }

    pub fn current_issue(&self) -> Option<CurrentIssue> {
        self.aggregate
            .queue
            .state()
            .in_flight()
            .map(|(dose_id, issue)| CurrentIssue { dose_id: dose_id.clone(), issue: issue.clone() })
    }

    pub fn queue_state(&self) -> &QueueState {
        self.aggregate.queue.state()
    }

    pub fn doses(&self) -> &[Dose] {
        &self.aggregate.doses
    }

    pub fn dose(&self, dose_id: &DoseId) -> Option<&Dose> {
        self.aggregate.doses.iter().find(|dose| &dose.id == dose_id)
    }

    pub fn banners(&self, dose_id: &DoseId) -> &[Issue] {
        self.aggregate.banners.get(dose_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn snapshot(&self) -> &VisitSnapshot {
        &self.aggregate.snapshot
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.aggregate.flags
    }

    pub fn reasons(&self) -> &ReasonCollection {
        &self.aggregate.reasons
    }

    pub fn deltas(&self) -> &SideFlowDeltas {
        &self.aggregate.deltas
    }

    pub fn copay_checked(&self) -> bool {
        self.aggregate.copay_checked
    }

    pub fn is_closed(&self) -> bool {
        self.aggregate.closed
    }

    /// Ends the session without submitting. Unresolved issues and their doses
    /// are dropped with it.
    pub fn abandon(self) {
        let aggregate = self.aggregate;
        if aggregate.queue.is_settled() {
            info!(
                event_name = "checkout.session.abandoned",
                visit_id = %aggregate.snapshot.visit_id.0,
                "checkout session abandoned"
            );
        } else {
            warn!(
                event_name = "checkout.session.abandoned",
                visit_id = %aggregate.snapshot.visit_id.0,
                queue = aggregate.queue.state().name(),
                pending = aggregate.queue.pending_len(),
                "checkout session abandoned with unresolved issues"
            );
        }
    }
}

impl Aggregate {
    fn dispatch<V: ProductVerifier>(
        &mut self,
        verifier: &V,
        event: SessionEvent,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        match event {
            SessionEvent::StageProduct(candidate) => {
                let dose_id = self.stage(candidate, DoseState::Added);
                self.verify_dose(verifier, &dose_id, step)
            }
            SessionEvent::StageAdministered(candidate) => {
                let dose_id = self.stage(candidate, DoseState::Administered);
                self.verify_dose(verifier, &dose_id, step)
            }
            SessionEvent::SurfaceOrder(candidate) => {
                let already_shown = candidate.order_number.as_ref().is_some_and(|number| {
                    self.doses.iter().any(|dose| dose.order_number.as_ref() == Some(number))
                });
                if !already_shown {
                    self.stage(candidate, DoseState::Ordered);
                }
                Ok(())
            }
            SessionEvent::AddOrderedDose { dose_id, lot } => {
                let index = self.index_of(&dose_id)?;
                let previous = self.doses[index].clone();
                let dose = &mut self.doses[index];
                dose.transition_to(DoseState::Added)?;
                if lot.is_some() {
                    dose.lot = lot;
                }
                self.rollback.insert(dose_id.clone(), Some(previous));
                self.verify_dose(verifier, &dose_id, step)
            }
            SessionEvent::RemoveDose(dose_id) => self.remove_dose(verifier, &dose_id, step),
            SessionEvent::RestoreDose(dose_id) => self.restore_dose(verifier, &dose_id, step),
            SessionEvent::Resolve(choice) => {
                let outcome = self.queue.apply(QueueEvent::ChoiceMade(choice))?;
                self.run_actions(verifier, outcome, None, step)
            }
            SessionEvent::CancelIssue => self.queue_event(verifier, QueueEvent::Cancelled, step),
            SessionEvent::ServerSlow => self.queue_event(verifier, QueueEvent::ServerSlow, step),
            SessionEvent::ServerFailed => {
                self.queue_event(verifier, QueueEvent::ServerErrored, step)
            }
            SessionEvent::Retry => self.queue_event(verifier, QueueEvent::Retry, step),
            SessionEvent::Abort => self.queue_event(verifier, QueueEvent::Abort, step),
            SessionEvent::ServerSucceeded(reply) => {
                let expected = match self.queue.state() {
                    QueueState::AwaitingServer { request, .. } => Some(*request),
                    _ => None,
                };
                let matches = matches!(
                    (expected, &reply),
                    (Some(ServerRequest::CopayCheck), ServerReply::CopayChecked(_))
                        | (Some(ServerRequest::StockChange(_)), ServerReply::StockChanged)
                );
                if !matches {
                    return Err(DomainError::UnexpectedServerReply { expected });
                }
                if let ServerReply::CopayChecked(results) = &reply {
                    if self.copay_incomplete_after(results) {
                        warn!(
                            event_name = "checkout.copay.incomplete",
                            visit_id = %self.snapshot.visit_id.0,
                            "copay check returned no result for the dose's antigen"
                        );
                        return self.queue_event(verifier, QueueEvent::ServerErrored, step);
                    }
                }
                let outcome = self.queue.apply(QueueEvent::ServerSucceeded)?;
                self.run_actions(verifier, outcome, Some(reply), step)
            }
            SessionEvent::FlipPayment(request) => self.flip(&request).map(|_| ()),
            SessionEvent::RevertPaymentFlip(dose_id) => {
                let index = self.index_of(&dose_id)?;
                payment::revert_flip(&mut self.doses[index])
                    .map(|_| ())
                    .ok_or(DomainError::NothingToRevert(dose_id))
            }
            SessionEvent::OpenSideFlow { flow, flip } => {
                if let Some(open) = &self.side_flow {
                    return Err(DomainError::SideFlowMismatch {
                        expected: Some(open.flow),
                        received: flow,
                    });
                }
                let flipped = match flip {
                    Some(request) => self.flip(&request)?,
                    None => Vec::new(),
                };
                self.side_flow = Some(OpenSideFlow { flow, flipped });
                Ok(())
            }
            SessionEvent::SideFlowResumed(result) => self.resume_side_flow(result),
            SessionEvent::CollectReason(reason) => self.reasons.record(reason),
            SessionEvent::RefreshSnapshot(snapshot) => self.refresh(verifier, *snapshot, step),
            SessionEvent::RerunCopayCheck => {
                self.copay_checked = false;
                if let Some(copay) = self.snapshot.copay.as_mut() {
                    for line in &mut copay.lines {
                        line.status = CopayStatus::Unchecked;
                        line.copay = None;
                    }
                }
                for dose in &mut self.doses {
                    dose.acknowledged.remove(&IssueKind::CopayRequired);
                }
                self.reverify_all(verifier, step)
            }
            SessionEvent::CompleteCheckout => self.complete(step),
        }
    }

    fn index_of(&self, dose_id: &DoseId) -> Result<usize, DomainError> {
        self.doses
            .iter()
            .position(|dose| &dose.id == dose_id)
            .ok_or_else(|| DomainError::UnknownDose(dose_id.clone()))
    }

    fn stage(&mut self, candidate: CandidateDose, state: DoseState) -> DoseId {
        let staged_seq = self.next_seq;
        self.next_seq += 1;

        let dose = Dose::from_candidate(candidate, state, staged_seq);
        let dose_id = dose.id.clone();
        if state == DoseState::Added {
            self.rollback.insert(dose_id.clone(), None);
        }

        info!(
            event_name = "checkout.dose.staged",
            visit_id = %self.snapshot.visit_id.0,
            dose_id = %dose_id,
            product_id = %dose.product.id.0,
            state = ?state,
            "dose staged"
        );
        self.doses.push(dose);
        dose_id
    }

    /// Runs the verifier over one staged dose, queues its primary issue or, when
    /// it has none, settles it: the rollback copy is dropped and the default
    /// payment is applied.
    fn verify_dose<V: ProductVerifier>(
        &mut self,
        verifier: &V,
        dose_id: &DoseId,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        let index = self.index_of(dose_id)?;
        if !self.doses[index].state.is_active() {
            self.queue.withdraw(dose_id);
            self.banners.remove(dose_id);
            return Ok(());
        }

        let Verification { primary_issue, mut banners, derived, trace } = {
            let dose = &self.doses[index];
            let candidate = dose.as_candidate();
            let facts = RuleInput {
                candidate: &candidate,
                snapshot: &self.snapshot,
                staged: &self.doses,
                flags: &self.flags,
                own: Some(dose),
            };
            verifier.evaluate(&VerificationInput { facts, acknowledged: &dose.acknowledged })
        };

        // An uncovered product kept on the visit's payment mode carries the
        // uncovered banner from then on.
        let kept_uncovered = trace.iter().any(|entry| {
            entry.verdict == RuleVerdict::Acknowledged
                && entry.issue == Some(IssueKind::ProductNotCovered)
        });
        if kept_uncovered {
            banners.push(Issue::ProductNotCovered { self_pay_offered: false });
        }

        let context = PaymentContext::from_snapshot(&self.snapshot, &self.flags);
        let dose = &mut self.doses[index];
        // Administered doses were already given; only their derived fields and
        // banners are refreshed.
        let primary_issue =
            if dose.state == DoseState::Administered { None } else { primary_issue };
        // A dose billed through a Part D line nobody has checked yet cannot
        // settle, administered or not.
        let primary_issue = primary_issue.or_else(|| {
            payment::resolve(dose, &context)
                .is_none()
                .then(|| Issue::CopayRequired { antigen: dose.antigen().clone() })
        });

        dose.dose_series = derived.dose_series;
        if dose.route.is_none() {
            dose.route = derived.route;
        }
        if dose.order_number.is_none() {
            dose.order_number = derived.order_number;
        }
        dose.issues = primary_issue.iter().chain(banners.iter()).map(Issue::kind).collect();

        for banner in &banners {
            step.effects
                .push(SessionEffect::Banner { dose_id: dose_id.clone(), issue: banner.clone() });
        }
        if banners.is_empty() {
            self.banners.remove(dose_id);
        } else {
            self.banners.insert(dose_id.clone(), banners);
        }

        match primary_issue {
            Some(issue) => {
                debug!(
                    event_name = "checkout.resolution.issue_queued",
                    dose_id = %dose_id,
                    issue = ?issue.kind(),
                    "issue queued for dose"
                );
                self.queue.enqueue(PendingIssue {
                    staged_seq: dose.staged_seq,
                    dose_id: dose_id.clone(),
                    issue,
                });
            }
            None => {
                self.queue.withdraw(dose_id);
                self.rollback.remove(dose_id);
                payment::apply_default(dose, &context);
            }
        }
        Ok(())
    }

    /// Re-verifies every active dose except one whose issue is in front of the
    /// clinician.
    fn reverify_all<V: ProductVerifier>(
        &mut self,
        verifier: &V,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        let locked = match self.queue.state() {
            QueueState::Idle | QueueState::Resolved { .. } => None,
            state => state.in_flight().map(|(dose_id, _)| dose_id.clone()),
        };
        let dose_ids: Vec<DoseId> = self
            .doses
            .iter()
            .filter(|dose| dose.state.is_active() && Some(&dose.id) != locked.as_ref())
            .map(|dose| dose.id.clone())
            .collect();

        for dose_id in &dose_ids {
            self.verify_dose(verifier, dose_id, step)?;
        }
        Ok(())
    }

    fn queue_event<V: ProductVerifier>(
        &mut self,
        verifier: &V,
        event: QueueEvent,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        let outcome = self.queue.apply(event)?;
        self.run_actions(verifier, outcome, None, step)
    }

    fn run_actions<V: ProductVerifier>(
        &mut self,
        verifier: &V,
        outcome: TransitionOutcome,
        reply: Option<ServerReply>,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        let Some((dose_id, issue)) =
            outcome.to.in_flight().map(|(dose_id, issue)| (dose_id.clone(), issue.clone()))
        else {
            step.transitions.push(outcome);
            return Ok(());
        };
        let attempt = match &outcome.to {
            QueueState::AwaitingServer { attempts, .. } => *attempts,
            _ => 0,
        };
        let actions = outcome.actions.clone();
        step.transitions.push(outcome);

        for action in actions {
            match action {
                QueueAction::ApplyChoice(choice) => {
                    self.apply_choice(verifier, &dose_id, &issue, &choice, reply.as_ref(), step)?;
                }
                QueueAction::RemoveDose => {
                    let index = self.index_of(&dose_id)?;
                    self.doses[index].remove()?;
                    self.rollback.remove(&dose_id);
                    self.reverify_all(verifier, step)?;
                }
                QueueAction::RollBackDose => self.roll_back(verifier, &dose_id, step)?,
                QueueAction::KeepDose => {
                    self.acknowledge(&dose_id, issue.kind())?;
                    self.verify_dose(verifier, &dose_id, step)?;
                }
                QueueAction::RunCopayCheck
                    if self.copay_checked && !self.copay_unchecked_for(&dose_id) =>
                {
                    debug!(
                        event_name = "checkout.copay.cached",
                        dose_id = %dose_id,
                        "copay check already ran for this visit, reusing result"
                    );
                    let cached = self.queue.apply(QueueEvent::ServerSucceeded)?;
                    self.run_actions(verifier, cached, None, step)?;
                }
                QueueAction::RunCopayCheck => step.effects.push(SessionEffect::CallServer {
                    dose_id: dose_id.clone(),
                    request: ServerRequest::CopayCheck,
                    attempt,
                }),
                QueueAction::RequestStockChange(source) => {
                    step.effects.push(SessionEffect::CallServer {
                        dose_id: dose_id.clone(),
                        request: ServerRequest::StockChange(source),
                        attempt,
                    })
                }
                QueueAction::ShowTakingLonger => {
                    step.effects.push(SessionEffect::TakingLonger { dose_id: dose_id.clone() })
                }
                QueueAction::OfferRetry => {
                    step.effects.push(SessionEffect::OfferRetry { dose_id: dose_id.clone() })
                }
                QueueAction::OfferAbort => {
                    step.effects.push(SessionEffect::OfferAbort { dose_id: dose_id.clone() })
                }
                QueueAction::PendingProductAction(action) => {
                    info!(
                        event_name = "checkout.resolution.server_step_cancelled",
                        dose_id = %dose_id,
                        action = ?action,
                        "server-bound step cancelled"
                    );
                    step.effects.push(SessionEffect::PendingProductAction {
                        dose_id: dose_id.clone(),
                        action,
                    });
                }
                QueueAction::PresentIssue => {}
            }
        }
        Ok(())
    }

    fn apply_choice<V: ProductVerifier>(
        &mut self,
        verifier: &V,
        dose_id: &DoseId,
        issue: &Issue,
        choice: &ResolutionChoice,
        reply: Option<&ServerReply>,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        let index = self.index_of(dose_id)?;
        let mut visit_changed = false;

        match choice {
            ResolutionChoice::Keep | ResolutionChoice::Override => {}
            ResolutionChoice::Remove => {
                self.doses[index].remove()?;
                self.rollback.remove(dose_id);
            }
            ResolutionChoice::AcceptSelfPay => {
                let reason = match issue {
                    Issue::ProductNotCovered { .. } => PaymentModeReason::SelfPayOptOut,
                    _ => PaymentModeReason::OutOfAgeIndication,
                };
                let context = PaymentContext::from_snapshot(&self.snapshot, &self.flags);
                payment::flip_to_self_pay(&mut self.doses[index], reason, &context);
            }
            ResolutionChoice::SelectRoute(route) => self.doses[index].route = Some(*route),
            ResolutionChoice::SupplyLot(lot) => self.doses[index].lot = Some(lot.clone()),
            ResolutionChoice::AnswerPrompt(answer) => {
                self.doses[index].prompt_answer = Some(answer.clone());
            }
            ResolutionChoice::ChangeStock(source) => {
                if !matches!(reply, Some(ServerReply::StockChanged)) {
                    return Err(DomainError::UnexpectedServerReply {
                        expected: Some(ServerRequest::StockChange(*source)),
                    });
                }
                info!(
                    event_name = "checkout.stock.changed",
                    visit_id = %self.snapshot.visit_id.0,
                    from = ?self.snapshot.inventory_source,
                    to = ?source,
                    "visit inventory source changed"
                );
                self.snapshot.inventory_source = *source;
                self.deltas.stock_source = Some(*source);
                visit_changed = true;
            }
            ResolutionChoice::RunCopayCheck => {
                if let Some(ServerReply::CopayChecked(results)) = reply {
                    match self.snapshot.copay.as_mut() {
                        Some(copay) => copay.apply_results(results),
                        None => self.snapshot.copay = Some(results.clone()),
                    }
                    info!(
                        event_name = "checkout.copay.checked",
                        visit_id = %self.snapshot.visit_id.0,
                        lines = results.lines.len(),
                        "copay check results applied"
                    );
                }
                self.copay_checked = true;
                visit_changed = true;
            }
        }

        // SupplyLot clears the missing lot by changing the dose itself; every
        // other non-removing choice is an explicit acceptance of the issue.
        if !matches!(choice, ResolutionChoice::Remove | ResolutionChoice::SupplyLot(_)) {
            self.acknowledge(dose_id, issue.kind())?;
        }

        if visit_changed || choice.removes_dose() {
            self.reverify_all(verifier, step)?;
        } else {
            self.verify_dose(verifier, dose_id, step)?;
        }
        Ok(())
    }

    fn copay_unchecked_for(&self, dose_id: &DoseId) -> bool {
        let Some(dose) = self.doses.iter().find(|dose| &dose.id == dose_id) else {
            return false;
        };
        self.snapshot.copay.as_ref().is_some_and(|copay| copay.requires_check(dose.antigen()))
    }

    /// Whether the in-flight dose would still have an unchecked Part D line once
    /// `results` are applied.
    fn copay_incomplete_after(&self, results: &CopayInfo) -> bool {
        let Some(dose_id) = self.queue.state().in_flight().map(|(dose_id, _)| dose_id) else {
            return false;
        };
        let Some(dose) = self.doses.iter().find(|dose| &dose.id == dose_id) else {
            return false;
        };
        let mut merged = self.snapshot.copay.clone().unwrap_or_else(|| results.clone());
        merged.apply_results(results);
        merged.requires_check(dose.antigen())
    }

    fn acknowledge(&mut self, dose_id: &DoseId, kind: IssueKind) -> Result<(), DomainError> {
        let index = self.index_of(dose_id)?;
        self.doses[index].acknowledged.insert(kind);
        Ok(())
    }

    fn roll_back<V: ProductVerifier>(
        &mut self,
        verifier: &V,
        dose_id: &DoseId,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        let index = self.index_of(dose_id)?;
        match self.rollback.remove(dose_id) {
            Some(None) => {
                self.doses.remove(index);
            }
            Some(Some(previous)) => self.doses[index] = previous,
            None => self.doses[index].remove()?,
        }
        self.queue.withdraw(dose_id);
        self.banners.remove(dose_id);

        info!(
            event_name = "checkout.dose.rolled_back",
            visit_id = %self.snapshot.visit_id.0,
            dose_id = %dose_id,
            "dose rolled back to its state before addition"
        );
        step.effects.push(SessionEffect::DoseRolledBack { dose_id: dose_id.clone() });
        self.reverify_all(verifier, step)
    }

    fn remove_dose<V: ProductVerifier>(
        &mut self,
        verifier: &V,
        dose_id: &DoseId,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        if self.queue.is_in_flight(dose_id) {
            return Err(DomainError::DoseBusy(dose_id.clone()));
        }

        let index = self.index_of(dose_id)?;
        if self.doses[index].state == DoseState::Ordered {
            self.doses.remove(index);
        } else {
            self.doses[index].remove()?;
        }
        self.queue.withdraw(dose_id);
        self.rollback.remove(dose_id);
        self.banners.remove(dose_id);

        info!(
            event_name = "checkout.dose.removed",
            visit_id = %self.snapshot.visit_id.0,
            dose_id = %dose_id,
            "dose removed"
        );
        self.reverify_all(verifier, step)
    }

    fn restore_dose<V: ProductVerifier>(
        &mut self,
        verifier: &V,
        dose_id: &DoseId,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        let index = self.index_of(dose_id)?;
        let previous = self.doses[index].clone();
        let dose = &mut self.doses[index];
        match dose.state {
            DoseState::AdministeredRemoved => dose.transition_to(DoseState::Administered)?,
            _ => {
                dose.transition_to(DoseState::Added)?;
                dose.acknowledged.clear();
                self.rollback.insert(dose_id.clone(), Some(previous));
            }
        }
        self.verify_dose(verifier, dose_id, step)
    }

    fn flip(&mut self, request: &FlipRequest) -> Result<Vec<DoseId>, DomainError> {
        let context = PaymentContext::from_snapshot(&self.snapshot, &self.flags);
        for dose_id in &request.dose_ids {
            let index = self
                .doses
                .iter()
                .position(|dose| &dose.id == dose_id)
                .ok_or_else(|| DomainError::UnknownDose(dose_id.clone()))?;
            let dose = &mut self.doses[index];
            if !dose.state.is_active() {
                return Err(DomainError::DoseNotActive(dose_id.clone()));
            }
            match request.target {
                FlipTarget::SelfPay => payment::flip_to_self_pay(dose, request.reason, &context),
                FlipTarget::PartnerBill => {
                    payment::flip_to_partner_bill(dose, request.reason, &context)
                }
            };
        }
        Ok(request.dose_ids.clone())
    }

    fn partner_bill_where(&mut self, include: impl Fn(Option<PaymentMode>) -> bool) -> Vec<DoseId> {
        let dose_ids: Vec<DoseId> = self
            .doses
            .iter()
            .filter(|dose| dose.state.is_active() && include(dose.payment_mode))
            .map(|dose| dose.id.clone())
            .collect();

        let context = PaymentContext::from_snapshot(&self.snapshot, &self.flags);
        for dose in self.doses.iter_mut().filter(|dose| dose_ids.contains(&dose.id)) {
            payment::flip_to_partner_bill(
                dose,
                PaymentModeReason::RequestedMediaNotProvided,
                &context,
            );
        }
        dose_ids
    }

    fn resume_side_flow(&mut self, result: SideFlowResult) -> Result<(), DomainError> {
        let open = self.side_flow.take().ok_or(DomainError::NoOpenSideFlow)?;
        if let Some(flow) = result.flow() {
            if flow != open.flow {
                return Err(DomainError::SideFlowMismatch {
                    expected: Some(open.flow),
                    received: flow,
                });
            }
        }

        let visit_insured = self.snapshot.payment_method == PaymentMethod::InsurancePay;
        match result {
            SideFlowResult::PhoneCollected(phone) => self.deltas.phone = Some(phone),
            SideFlowResult::PhoneDeclined => {
                let flipped = self.partner_bill_where(|mode| match mode {
                    Some(mode) => matches!(mode, PaymentMode::SelfPay | PaymentMode::InsurancePay),
                    None => true,
                });
                info!(
                    event_name = "checkout.side_flow.phone_declined",
                    visit_id = %self.snapshot.visit_id.0,
                    doses = flipped.len(),
                    "phone declined, doses partner billed"
                );
            }
            SideFlowResult::InsuranceCaptured(payer) | SideFlowResult::PayerInfo(payer) => {
                self.deltas.payer = Some(payer)
            }
            SideFlowResult::InsuranceDeclined => {
                let flipped = self.partner_bill_where(|mode| match mode {
                    Some(mode) => mode == PaymentMode::InsurancePay,
                    None => visit_insured,
                });
                info!(
                    event_name = "checkout.side_flow.insurance_declined",
                    visit_id = %self.snapshot.visit_id.0,
                    doses = flipped.len(),
                    "insurance declined, insurance doses partner billed"
                );
            }
            SideFlowResult::MedDIdentifierCollected(identifier) => {
                debug!(
                    event_name = "checkout.side_flow.medd_identifier",
                    kind = ?identifier.kind,
                    identifier = %identifier.masked(),
                    "Part D identifier collected"
                );
                self.deltas.medd_identifier = Some(identifier);
            }
            SideFlowResult::BackedOut => {
                for dose_id in &open.flipped {
                    if let Some(dose) = self.doses.iter_mut().find(|dose| &dose.id == dose_id) {
                        payment::revert_flip(dose);
                    }
                }
            }
        }
        Ok(())
    }

    fn refresh<V: ProductVerifier>(
        &mut self,
        verifier: &V,
        mut snapshot: VisitSnapshot,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        if snapshot.visit_id != self.snapshot.visit_id {
            return Err(DomainError::VisitMismatch {
                expected: self.snapshot.visit_id.clone(),
                received: snapshot.visit_id,
            });
        }

        // Results of a copay check already run this session outlive the refresh.
        if self.copay_checked {
            if let (Some(fresh), Some(previous)) = (snapshot.copay.as_mut(), &self.snapshot.copay)
            {
                let checked = CopayInfo {
                    visit_id: previous.visit_id.clone(),
                    lines: previous
                        .lines
                        .iter()
                        .filter(|line| line.status != CopayStatus::Unchecked)
                        .cloned()
                        .collect(),
                };
                fresh.apply_results(&checked);
            }
        }
        self.snapshot = snapshot;

        let open_orders: BTreeSet<OrderNumber> =
            self.snapshot.active_orders().map(|order| order.order_number.clone()).collect();

        let mut withdrawn_ordered = Vec::new();
        self.doses.retain(|dose| {
            let stale = dose.state == DoseState::Ordered
                && !dose.order_number.as_ref().is_some_and(|number| open_orders.contains(number));
            if stale {
                withdrawn_ordered.push(dose.id.clone());
            }
            !stale
        });

        let new_orders = open_orders
            .iter()
            .filter(|number| {
                !self.doses.iter().any(|dose| dose.order_number.as_ref() == Some(*number))
            })
            .cloned()
            .collect();

        let before: BTreeSet<DoseId> =
            self.queue.pending().map(|pending| pending.dose_id.clone()).collect();
        self.reverify_all(verifier, step)?;
        let after: BTreeSet<DoseId> =
            self.queue.pending().map(|pending| pending.dose_id.clone()).collect();

        let diff = RefreshDiff {
            withdrawn_ordered,
            new_orders,
            flagged: after.difference(&before).cloned().collect(),
            cleared: before.difference(&after).cloned().collect(),
        };
        info!(
            event_name = "checkout.session.refreshed",
            visit_id = %self.snapshot.visit_id.0,
            withdrawn = diff.withdrawn_ordered.len(),
            new_orders = diff.new_orders.len(),
            flagged = diff.flagged.len(),
            cleared = diff.cleared.len(),
            "visit snapshot refreshed"
        );
        step.refresh = Some(diff);
        Ok(())
    }

    /// Reason contexts the staged set currently requires. Doses without an order
    /// only need a reason when right-patient-right-dose mode is on.
    fn required_reasons(&self) -> BTreeSet<ReasonContext> {
        let mut required = reconciliation::reconcile(
            &self.doses,
            self.snapshot.active_orders(),
            self.snapshot.fetched_at,
        );
        if !self.flags.right_patient_right_dose {
            required.remove(&ReasonContext::DosesNotOrdered);
        }
        required
    }

    fn in_flight_count(&self) -> usize {
        usize::from(self.queue.state().in_flight().is_some())
    }

    fn unpaid_doses(&self) -> Vec<DoseId> {
        self.doses
            .iter()
            .filter(|dose| dose.state.is_active() && dose.payment_mode.is_none())
            .map(|dose| dose.id.clone())
            .collect()
    }

    fn ready_for_summary(&self) -> bool {
        !self.closed
            && self.queue.is_settled()
            && self.side_flow.is_none()
            && self.unpaid_doses().is_empty()
            && self.reasons.is_satisfied(&self.required_reasons())
    }

    fn complete(&mut self, step: &mut Step) -> Result<(), DomainError> {
        if !self.ready_for_summary() {
            return Err(DomainError::NotReadyForSummary {
                pending_issues: self.queue.pending_len() + self.in_flight_count(),
                missing_reasons: self.reasons.missing(&self.required_reasons()),
                open_side_flow: self.side_flow.as_ref().map(|open| open.flow),
                unpaid_doses: self.unpaid_doses(),
            });
        }

        let required = self.required_reasons();
        let mut plan = payment::partition(&self.snapshot, &self.doses)?;
        plan.reasons = self.reasons.applicable(&required).cloned().collect();
        plan.updates = self.deltas.updates();
        self.closed = true;
        info!(
            event_name = "checkout.session.completed",
            visit_id = %self.snapshot.visit_id.0,
            groups = plan.groups.len(),
            split = plan.is_split(),
            reasons = plan.reasons.len(),
            "checkout completed"
        );
        step.effects.push(SessionEffect::Submit { plan });
        Ok(())
    }

    /// Brings the next queued issue in front of the clinician once the current
    /// one is resolved or the queue is idle.
    fn pump(&mut self, step: &mut Step) -> Result<(), DomainError> {
        if let Some(outcome) = self.queue.pull_next()? {
            let presented = matches!(outcome.to, QueueState::IssuePending { .. });
            step.transitions.push(outcome);
            if presented {
                step.transitions.push(self.queue.apply(QueueEvent::Present)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{
        CheckoutSession, FlipRequest, FlipTarget, ServerReply, SessionEffect, SessionEvent,
        SideFlow, SideFlowResult,
    };
    use crate::audit::{AuditContext, AuditOutcome, InMemoryAuditSink};
    use crate::config::FeatureFlags;
    use crate::domain::copay::{CopayInfo, CopayLine, CopayStatus};
    use crate::domain::dose::{CandidateDose, DoseState};
    use crate::domain::issue::{Issue, ResolutionChoice};
    use crate::domain::order::{OpenOrder, OrderNumber};
    use crate::domain::payment::{PaymentMethod, PaymentMode, PaymentModeReason};
    use crate::domain::product::{
        Antigen, InventorySource, LotInfo, LotNumber, Product, ProductCategory, ProductId,
        RouteCode,
    };
    use crate::domain::visit::{Eligibility, Patient, PatientId, Payer, VisitId, VisitSnapshot};
    use crate::errors::DomainError;
    use crate::reconciliation::{DoseReason, ReasonContext};
    use crate::resolution::{PendingProductAction, ServerRequest};
    use crate::verification::DeterministicProductVerifier;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn snapshot() -> VisitSnapshot {
        VisitSnapshot {
            visit_id: VisitId("V-500".to_owned()),
            patient: Patient {
                id: PatientId("P-500".to_owned()),
                date_of_birth: date(1970, 6, 1),
                phone: None,
                payer: None,
            },
            date_of_service: date(2026, 10, 19),
            payment_method: PaymentMethod::InsurancePay,
            eligibility: Eligibility::default(),
            inventory_source: InventorySource::Private,
            open_orders: Vec::new(),
            copay: None,
            history: Vec::new(),
            fetched_at: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).single().expect("valid time"),
        }
    }

    fn candidate(id: &str, antigen: &str, source: InventorySource) -> CandidateDose {
        CandidateDose {
            product: Product {
                id: ProductId(id.to_owned()),
                antigen: Antigen(antigen.to_owned()),
                name: id.to_owned(),
                category: ProductCategory::Vaccine,
                routes: vec![RouteCode::Intramuscular],
                age_indication: None,
                restricted: false,
            },
            lot: Some(LotInfo {
                lot_number: LotNumber(format!("{id}-LOT")),
                product_id: ProductId(id.to_owned()),
                expiration: date(2027, 3, 1),
                source,
            }),
            route: None,
            site: None,
            order_number: None,
        }
    }

    fn session(flags: FeatureFlags) -> CheckoutSession {
        CheckoutSession::new(snapshot(), flags, 1, DeterministicProductVerifier::default())
    }

    fn walk_in_flags() -> FeatureFlags {
        FeatureFlags { right_patient_right_dose: false, ..FeatureFlags::default() }
    }

    fn copay_line(antigen: &str, status: CopayStatus) -> CopayInfo {
        CopayInfo {
            visit_id: VisitId("V-500".to_owned()),
            lines: vec![CopayLine { antigen: Antigen(antigen.to_owned()), status, copay: None }],
        }
    }

    fn session_with_copay(copay: CopayInfo) -> CheckoutSession {
        let mut snapshot = snapshot();
        snapshot.copay = Some(copay);
        CheckoutSession::new(snapshot, walk_in_flags(), 1, DeterministicProductVerifier::default())
    }

    #[test]
    fn clean_dose_settles_with_visit_payment() {
        let mut session = session(walk_in_flags());
        session
            .apply(
                SessionEvent::StageProduct(candidate("flu", "Influenza", InventorySource::Private)),
            )
            .expect("stage flu");

        let dose = &session.doses()[0];
        assert_eq!(dose.state, DoseState::Added);
        assert_eq!(dose.payment_mode, Some(PaymentMode::InsurancePay));
        assert!(session.queue_state().is_idle());
        assert!(session.ready_for_summary());
    }

    #[test]
    fn cancel_rolls_a_new_dose_out_of_the_staged_list() {
        let mut session = session(FeatureFlags::default());
        session
            .apply(SessionEvent::StageProduct(candidate("tdap", "Tdap", InventorySource::Private)))
            .expect("stage tdap");
        assert_eq!(
            session.current_issue().map(|current| current.issue),
            Some(Issue::Unordered)
        );

        let outcome = session.apply(SessionEvent::CancelIssue).expect("cancel");
        assert!(outcome
            .effects
            .iter()
            .any(|effect| matches!(effect, SessionEffect::DoseRolledBack { .. })));
        assert!(session.doses().is_empty());
        assert!(session.queue_state().is_idle());
    }

    #[test]
    fn second_issue_on_same_dose_comes_before_later_doses() {
        let mut session = session(FeatureFlags::default());
        session
            .apply(SessionEvent::StageProduct(candidate("mmr", "MMR", InventorySource::Vfc)))
            .expect("stage mmr");
        session
            .apply(
                SessionEvent::StageProduct(candidate("flu", "Influenza", InventorySource::Private)),
            )
            .expect("stage flu");
        let mmr_id = session.doses()[0].id.clone();

        assert!(matches!(
            session.current_issue(),
            Some(ref current) if current.dose_id == mmr_id
                && matches!(current.issue, Issue::WrongStock { .. })
        ));

        session.apply(SessionEvent::Resolve(ResolutionChoice::Keep)).expect("keep stock");
        let current = session.current_issue().expect("next issue");
        assert_eq!(current.dose_id, mmr_id);
        assert_eq!(current.issue, Issue::Unordered);
    }

    #[test]
    fn failed_stock_change_abort_rolls_back_with_set_stock_cancel() {
        let mut session = session(walk_in_flags());
        session
            .apply(SessionEvent::StageProduct(candidate("mmr", "MMR", InventorySource::Vfc)))
            .expect("stage mmr");

        let outcome = session
            .apply(SessionEvent::Resolve(ResolutionChoice::ChangeStock(InventorySource::Vfc)))
            .expect("request stock change");
        assert!(outcome.effects.contains(&SessionEffect::CallServer {
            dose_id: session.doses()[0].id.clone(),
            request: ServerRequest::StockChange(InventorySource::Vfc),
            attempt: 1,
        }));

        session.apply(SessionEvent::ServerFailed).expect("stock change failed");
        let outcome = session.apply(SessionEvent::Abort).expect("abort");
        assert!(outcome.effects.iter().any(|effect| matches!(
            effect,
            SessionEffect::PendingProductAction {
                action: PendingProductAction::SetStockCancel,
                ..
            }
        )));
        assert!(session.doses().is_empty());
        assert_eq!(session.snapshot().inventory_source, InventorySource::Private);
    }

    #[test]
    fn successful_stock_change_updates_the_visit_and_settles_the_dose() {
        let mut session = session(walk_in_flags());
        session
            .apply(SessionEvent::StageProduct(candidate("mmr", "MMR", InventorySource::Vfc)))
            .expect("stage mmr");
        session
            .apply(SessionEvent::Resolve(ResolutionChoice::ChangeStock(InventorySource::Vfc)))
            .expect("request stock change");

        let error = session
            .apply(SessionEvent::ServerSucceeded(ServerReply::CopayChecked(CopayInfo {
                visit_id: VisitId("V-500".to_owned()),
                lines: Vec::new(),
            })))
            .expect_err("wrong reply kind");
        assert!(matches!(error, DomainError::UnexpectedServerReply { .. }));

        session
            .apply(SessionEvent::ServerSucceeded(ServerReply::StockChanged))
            .expect("stock changed");
        assert_eq!(session.snapshot().inventory_source, InventorySource::Vfc);
        assert_eq!(session.deltas().stock_source, Some(InventorySource::Vfc));
        assert_eq!(session.doses()[0].payment_mode, Some(PaymentMode::InsurancePay));
        assert!(session.ready_for_summary());
    }

    #[test]
    fn administered_dose_on_unchecked_part_d_line_waits_for_the_copay_check() {
        let mut session = session_with_copay(copay_line("Zoster", CopayStatus::Unchecked));
        session
            .apply(SessionEvent::StageAdministered(candidate(
                "shingrix",
                "Zoster",
                InventorySource::Private,
            )))
            .expect("stage administered shingrix");
        let dose_id = session.doses()[0].id.clone();

        assert!(matches!(
            session.current_issue(),
            Some(ref current) if current.dose_id == dose_id
                && matches!(current.issue, Issue::CopayRequired { .. })
        ));
        assert_eq!(session.doses()[0].payment_mode, None);
        assert!(!session.ready_for_summary());

        let error = session.apply(SessionEvent::CompleteCheckout).expect_err("not ready");
        assert!(matches!(error, DomainError::NotReadyForSummary { .. }));
        assert!(!error.is_fatal());

        session
            .apply(SessionEvent::Resolve(ResolutionChoice::RunCopayCheck))
            .expect("request copay check");
        session
            .apply(SessionEvent::ServerSucceeded(ServerReply::CopayChecked(copay_line(
                "Zoster",
                CopayStatus::Covered,
            ))))
            .expect("copay checked");

        let dose = &session.doses()[0];
        assert_eq!(dose.state, DoseState::Administered);
        assert_eq!(dose.payment_mode, Some(PaymentMode::InsurancePay));
        assert!(session.ready_for_summary());
        session.apply(SessionEvent::CompleteCheckout).expect("complete");
    }

    #[test]
    fn copay_reply_missing_the_dose_line_fails_the_server_step() {
        let mut session = session_with_copay(copay_line("Zoster", CopayStatus::Unchecked));
        session
            .apply(
                SessionEvent::StageProduct(candidate(
                    "shingrix",
                    "Zoster",
                    InventorySource::Private,
                )),
            )
            .expect("stage shingrix");
        session
            .apply(SessionEvent::Resolve(ResolutionChoice::RunCopayCheck))
            .expect("request copay check");

        session
            .apply(SessionEvent::ServerSucceeded(ServerReply::CopayChecked(copay_line(
                "Influenza",
                CopayStatus::Covered,
            ))))
            .expect("incomplete reply is handled");

        assert_eq!(session.queue_state().name(), "server_failed");
        assert!(!session.copay_checked());
        assert_eq!(session.doses()[0].payment_mode, None);
        assert!(!session.ready_for_summary());
    }

    #[test]
    fn rerun_copay_check_raises_the_copay_issue_again() {
        let mut session = session_with_copay(copay_line("Zoster", CopayStatus::Unchecked));
        session
            .apply(
                SessionEvent::StageProduct(candidate(
                    "shingrix",
                    "Zoster",
                    InventorySource::Private,
                )),
            )
            .expect("stage shingrix");
        session
            .apply(SessionEvent::Resolve(ResolutionChoice::RunCopayCheck))
            .expect("request copay check");
        session
            .apply(SessionEvent::ServerSucceeded(ServerReply::CopayChecked(copay_line(
                "Zoster",
                CopayStatus::Covered,
            ))))
            .expect("copay checked");
        assert!(session.ready_for_summary());

        // A rerun resets every line; the dose keeps the selection it settled with.
        session.apply(SessionEvent::RerunCopayCheck).expect("rerun copay check");
        assert!(matches!(
            session.current_issue().map(|current| current.issue),
            Some(Issue::CopayRequired { .. })
        ));
        assert!(!session.ready_for_summary());
    }

    #[test]
    fn uncovered_product_cancel_keeps_dose_with_banner() {
        let mut snapshot = snapshot();
        snapshot.patient.payer = Some(Payer {
            name: "Acme".to_owned(),
            uncovered_antigens: BTreeSet::from([Antigen("HepA".to_owned())]),
        });
        let mut session = CheckoutSession::new(
            snapshot,
            walk_in_flags(),
            1,
            DeterministicProductVerifier::default(),
        );
        session
            .apply(
                SessionEvent::StageProduct(candidate("havrix", "HepA", InventorySource::Private)),
            )
            .expect("stage hepa");
        assert_eq!(
            session.current_issue().map(|current| current.issue),
            Some(Issue::ProductNotCovered { self_pay_offered: true })
        );

        let outcome = session.apply(SessionEvent::CancelIssue).expect("cancel keeps dose");
        let dose_id = session.doses()[0].id.clone();
        assert!(outcome.effects.contains(&SessionEffect::Banner {
            dose_id: dose_id.clone(),
            issue: Issue::ProductNotCovered { self_pay_offered: false },
        }));
        assert_eq!(session.doses()[0].payment_mode, Some(PaymentMode::InsurancePay));
        assert_eq!(session.banners(&dose_id).len(), 1);
    }

    #[test]
    fn phone_side_flow_back_out_reverts_flips_and_decline_partner_bills() {
        let mut session = session(walk_in_flags());
        session
            .apply(
                SessionEvent::StageProduct(candidate("flu", "Influenza", InventorySource::Private)),
            )
            .expect("stage flu");
        let dose_id = session.doses()[0].id.clone();
        let original = session.doses()[0].payment_selection();

        let flip = FlipRequest {
            dose_ids: vec![dose_id.clone()],
            target: FlipTarget::SelfPay,
            reason: PaymentModeReason::SelfPayOptOut,
        };
        session
            .apply(SessionEvent::OpenSideFlow {
                flow: SideFlow::PhoneCollection,
                flip: Some(flip.clone()),
            })
            .expect("open phone collection");
        assert!(!session.ready_for_summary());
        assert_eq!(session.doses()[0].payment_mode, Some(PaymentMode::SelfPay));

        session
            .apply(SessionEvent::SideFlowResumed(SideFlowResult::BackedOut))
            .expect("back out");
        assert_eq!(session.doses()[0].payment_selection(), original);

        session
            .apply(SessionEvent::OpenSideFlow { flow: SideFlow::PhoneCollection, flip: Some(flip) })
            .expect("reopen phone collection");
        let error = session
            .apply(SessionEvent::SideFlowResumed(SideFlowResult::InsuranceDeclined))
            .expect_err("insurance result does not resume phone collection");
        assert!(matches!(error, DomainError::SideFlowMismatch { .. }));

        session
            .apply(SessionEvent::SideFlowResumed(SideFlowResult::PhoneDeclined))
            .expect("phone declined");
        let dose = &session.doses()[0];
        assert_eq!(dose.payment_mode, Some(PaymentMode::PartnerBill));
        assert_eq!(dose.payment_mode_reason, Some(PaymentModeReason::RequestedMediaNotProvided));
    }

    #[test]
    fn reasons_survive_a_payer_info_interruption() {
        let mut snapshot = snapshot();
        snapshot.open_orders.push(OpenOrder {
            order_number: OrderNumber("ORD-1".to_owned()),
            description: "HepB series".to_owned(),
            satisfying_product_ids: BTreeSet::from([ProductId("engerix".to_owned())]),
            expires_at: Utc.with_ymd_and_hms(2026, 12, 31, 0, 0, 0).single().expect("valid time"),
            patient_visit_id: None,
        });
        let mut session = CheckoutSession::new(
            snapshot,
            FeatureFlags::default(),
            1,
            DeterministicProductVerifier::default(),
        );
        session
            .apply(
                SessionEvent::StageProduct(candidate("flu", "Influenza", InventorySource::Private)),
            )
            .expect("stage flu");
        session.apply(SessionEvent::Resolve(ResolutionChoice::Keep)).expect("keep unordered");

        let state = session.state();
        assert_eq!(
            state.reason_contexts,
            BTreeSet::from([ReasonContext::OrderUnfilled, ReasonContext::DosesNotOrdered])
        );

        session
            .apply(SessionEvent::CollectReason(DoseReason {
                context: ReasonContext::DosesNotOrdered,
                reason_code: "patient_request".to_owned(),
                note: None,
            }))
            .expect("first reason");
        session
            .apply(SessionEvent::OpenSideFlow { flow: SideFlow::PayerInfo, flip: None })
            .expect("open payer info");
        session
            .apply(SessionEvent::SideFlowResumed(SideFlowResult::PayerInfo(Payer {
                name: "New Payer".to_owned(),
                uncovered_antigens: BTreeSet::new(),
            })))
            .expect("payer info captured");

        assert_eq!(session.state().missing_reasons, vec![ReasonContext::OrderUnfilled]);
        session
            .apply(SessionEvent::CollectReason(DoseReason {
                context: ReasonContext::OrderUnfilled,
                reason_code: "out_of_stock".to_owned(),
                note: None,
            }))
            .expect("second reason");
        assert!(session.ready_for_summary());
    }

    #[test]
    fn failed_event_leaves_the_session_untouched() {
        let mut session = session(walk_in_flags());
        session
            .apply(
                SessionEvent::StageProduct(candidate("flu", "Influenza", InventorySource::Private)),
            )
            .expect("stage flu");
        let before = session.state();

        let error = session.apply(SessionEvent::Retry).expect_err("nothing to retry");
        assert!(matches!(error, DomainError::QueueTransition(_)));
        assert_eq!(session.state(), before);
    }

    #[test]
    fn completed_session_rejects_further_events() {
        let mut session = session(walk_in_flags());
        session
            .apply(
                SessionEvent::StageProduct(candidate("flu", "Influenza", InventorySource::Private)),
            )
            .expect("stage flu");
        let outcome = session.apply(SessionEvent::CompleteCheckout).expect("complete");
        assert!(matches!(outcome.effects.as_slice(), [SessionEffect::Submit { .. }]));
        assert!(session.is_closed());

        let error = session.apply(SessionEvent::CompleteCheckout).expect_err("closed");
        assert_eq!(error, DomainError::SessionClosed);
    }

    #[test]
    fn audit_records_applied_and_rejected_events() {
        let mut session = session(walk_in_flags());
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(VisitId("V-500".to_owned()), "req-9", "clinician-3");

        session
            .apply_with_audit(
                SessionEvent::StageProduct(candidate("flu", "Influenza", InventorySource::Private)),
                &sink,
                &audit,
            )
            .expect("stage flu");
        let _ = session.apply_with_audit(SessionEvent::Abort, &sink, &audit);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, AuditOutcome::Applied);
        assert_eq!(events[0].session_event, "stage_product");
        assert_eq!(events[1].outcome, AuditOutcome::Rejected);
        assert_eq!(events[1].correlation_id, "req-9");
        assert!(events[1].detail("error").is_some());
    }

    #[test]
    fn audited_completion_records_the_submission_plan() {
        let mut session = session(walk_in_flags());
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(VisitId("V-500".to_owned()), "req-10", "clinician-3");

        session
            .apply(
                SessionEvent::StageProduct(candidate("flu", "Influenza", InventorySource::Private)),
            )
            .expect("stage flu");
        session.apply_with_audit(SessionEvent::CompleteCheckout, &sink, &audit).expect("complete");

        let events = sink.events();
        let plan = events[0].detail("submission_plan").expect("plan detail");
        let decoded: crate::payment::SubmissionPlan =
            serde_json::from_str(plan).expect("plan should decode");
        assert_eq!(decoded.groups.len(), 1);
        assert_eq!(decoded.visit_id, VisitId("V-500".to_owned()));
    }
}
