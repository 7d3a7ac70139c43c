//! `dosecheck replay`: drives one checkout session through a scripted scenario
//! against in-memory collaborators and prints a JSON transcript.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use dosecheck_core::audit::{AuditContext, AuditEvent, InMemoryAuditSink};
use dosecheck_core::collaborators::{
    CatalogEntry, InMemoryOrders, ProductCatalog, RecordingSubmitter, ScriptedCopayService,
    ScriptedReply, ScriptedStockService, SubmissionReceipt,
};
use dosecheck_core::config::{AppConfig, FeatureFlags, LoadOptions};
use dosecheck_core::domain::copay::{CopayInfo, CopayLine, MedDIdentifier, MedDIdentifierKind};
use dosecheck_core::domain::dose::DoseId;
use dosecheck_core::domain::issue::ResolutionChoice;
use dosecheck_core::domain::order::{OpenOrder, OrderNumber};
use dosecheck_core::domain::payment::PaymentModeReason;
use dosecheck_core::domain::product::{LotNumber, ProductId};
use dosecheck_core::domain::visit::{Payer, VisitSnapshot};
use dosecheck_core::errors::ApplicationError;
use dosecheck_core::payment::SubmissionPlan;
use dosecheck_core::reconciliation::DoseReason;
use dosecheck_core::runtime::{CheckoutRuntime, Collaborators, RuntimeStep, ServerCallPolicy};
use dosecheck_core::session::{
    CheckoutSession, FlipRequest, FlipTarget, RefreshDiff, SessionEffect, SessionEvent,
    SessionState, SideFlow, SideFlowResult,
};
use dosecheck_core::verification::DeterministicProductVerifier;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::CommandResult;

#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub snapshot: VisitSnapshot,
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,
    #[serde(default)]
    pub flags: Option<FeatureFlags>,
    /// Overrides the configured server-call timings, in milliseconds.
    #[serde(default)]
    pub timing: Option<ScenarioTiming>,
    #[serde(default)]
    pub services: ScenarioServices,
    pub steps: Vec<ScenarioStep>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ScenarioTiming {
    pub slow_notice_ms: u64,
    pub hard_timeout_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScenarioServices {
    #[serde(default)]
    pub stock: Vec<ScriptedReply>,
    #[serde(default)]
    pub copay: Vec<ScriptedReply>,
    #[serde(default)]
    pub copay_results: Vec<CopayLine>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FlipStep {
    pub dose_indices: Vec<usize>,
    pub target: FlipTarget,
    pub reason: PaymentModeReason,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideFlowStep {
    PhoneCollected { phone: String },
    PhoneDeclined,
    InsuranceCaptured { payer: Payer },
    InsuranceDeclined,
    MedDIdentifierCollected { value: String },
    PayerInfo { payer: Payer },
    BackedOut,
}

/// One operator action. Doses are addressed by their position in the
/// session's dose list at the time the step runs.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScenarioStep {
    Scan {
        product_id: ProductId,
        #[serde(default)]
        lot_number: Option<LotNumber>,
    },
    StageAdministered {
        product_id: ProductId,
        #[serde(default)]
        lot_number: Option<LotNumber>,
    },
    /// Replaces the open orders the orders source returns, then refreshes.
    RefreshOrders {
        #[serde(default)]
        orders: Option<Vec<OpenOrder>>,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    AddOrderedDose {
        order_number: OrderNumber,
        #[serde(default)]
        lot_number: Option<LotNumber>,
    },
    RemoveDose {
        dose_index: usize,
    },
    RestoreDose {
        dose_index: usize,
    },
    Resolve {
        choice: ResolutionChoice,
    },
    Cancel,
    Retry,
    Abort,
    FlipPayment {
        dose_indices: Vec<usize>,
        target: FlipTarget,
        reason: PaymentModeReason,
    },
    RevertPaymentFlip {
        dose_index: usize,
    },
    OpenSideFlow {
        flow: SideFlow,
        #[serde(default)]
        flip: Option<FlipStep>,
    },
    ResumeSideFlow {
        result: SideFlowStep,
    },
    CollectReason {
        reason: DoseReason,
    },
    RerunCopayCheck,
    Complete,
}

impl ScenarioStep {
    fn name(&self) -> &'static str {
        match self {
            Self::Scan { .. } => "scan",
            Self::StageAdministered { .. } => "stage_administered",
            Self::RefreshOrders { .. } => "refresh_orders",
            Self::AddOrderedDose { .. } => "add_ordered_dose",
            Self::RemoveDose { .. } => "remove_dose",
            Self::RestoreDose { .. } => "restore_dose",
            Self::Resolve { .. } => "resolve",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
            Self::Abort => "abort",
            Self::FlipPayment { .. } => "flip_payment",
            Self::RevertPaymentFlip { .. } => "revert_payment_flip",
            Self::OpenSideFlow { .. } => "open_side_flow",
            Self::ResumeSideFlow { .. } => "resume_side_flow",
            Self::CollectReason { .. } => "collect_reason",
            Self::RerunCopayCheck => "rerun_copay_check",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Serialize)]
struct StepRecord {
    index: usize,
    step: &'static str,
    status: &'static str,
    queue: &'static str,
    effects: Vec<SessionEffect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh: Option<RefreshDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReplayTranscript {
    command: &'static str,
    status: &'static str,
    correlation_id: String,
    visit_id: String,
    steps: Vec<StepRecord>,
    final_state: SessionState,
    submission: Option<SubmissionPlan>,
    receipt: Option<SubmissionReceipt>,
    audit_events: Vec<AuditEvent>,
}

/// Replay failures that stop the run, as opposed to rejected steps.
enum ReplayFailure {
    Scenario(anyhow::Error),
    Fatal(ApplicationError),
}

pub fn run(path: &Path, correlation_id: Option<&str>) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "replay",
                "configuration",
                format!("config validation failed: {error}"),
                2,
            )
        }
    };

    let scenario = match load_scenario(path) {
        Ok(scenario) => scenario,
        Err(error) => return CommandResult::failure("replay", "scenario", format!("{error:#}"), 3),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "replay",
                "runtime",
                format!("failed to initialize async runtime: {error}"),
                1,
            )
        }
    };

    let correlation_id = correlation_id
        .map(str::to_string)
        .unwrap_or_else(|| format!("replay-{}", scenario.snapshot.visit_id.0));

    match runtime.block_on(replay(scenario, &config, &correlation_id)) {
        Ok(transcript) => match serde_json::to_string_pretty(&transcript) {
            Ok(output) => CommandResult::raw(0, output),
            Err(error) => CommandResult::failure("replay", "serialization", error.to_string(), 1),
        },
        Err(ReplayFailure::Scenario(error)) => {
            CommandResult::failure("replay", "scenario", format!("{error:#}"), 3)
        }
        Err(ReplayFailure::Fatal(error)) => {
            CommandResult::failure("replay", "invariant_violation", error.to_string(), 3)
        }
    }
}

pub fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("could not read scenario `{}`", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("could not parse scenario `{}`", path.display()))
}

struct Harness {
    catalog: Arc<ProductCatalog>,
    orders: Arc<InMemoryOrders>,
    submitter: Arc<RecordingSubmitter>,
    audit: Arc<InMemoryAuditSink>,
    runtime: CheckoutRuntime,
    medd_identifier: MedDIdentifierKind,
}

async fn replay(
    scenario: Scenario,
    config: &AppConfig,
    correlation_id: &str,
) -> Result<ReplayTranscript, ReplayFailure> {
    let Scenario { snapshot, catalog, flags, timing, services, steps } = scenario;
    let visit_id = snapshot.visit_id.clone();

    let policy = match timing {
        Some(timing) => ServerCallPolicy::new(
            Duration::from_millis(timing.slow_notice_ms),
            Duration::from_millis(timing.hard_timeout_ms),
        ),
        None => ServerCallPolicy::from(&config.server_calls),
    };

    let catalog = Arc::new(ProductCatalog::new(catalog));
    let orders =
        Arc::new(InMemoryOrders::with_orders(visit_id.clone(), snapshot.open_orders.clone()));
    let submitter = Arc::new(RecordingSubmitter::default());
    let audit = Arc::new(InMemoryAuditSink::default());
    let copay_results = CopayInfo { visit_id: visit_id.clone(), lines: services.copay_results };
    let collaborators = Collaborators {
        catalog: catalog.clone(),
        orders: orders.clone(),
        copay: Arc::new(ScriptedCopayService::new(copay_results, services.copay)),
        stock: Arc::new(ScriptedStockService::new(services.stock)),
        submitter: submitter.clone(),
    };
    let runtime = CheckoutRuntime::new(collaborators, policy).with_audit(
        audit.clone(),
        AuditContext::new(visit_id.clone(), correlation_id, "replay"),
    );
    let harness = Harness {
        catalog,
        orders,
        submitter,
        audit,
        runtime,
        medd_identifier: config.copay.medd_identifier,
    };

    let verifier = DeterministicProductVerifier::new(harness.catalog.doses_in_series());
    let mut session = CheckoutSession::new(
        snapshot,
        flags.unwrap_or_else(|| config.features.clone()),
        config.server_calls.max_user_retries,
        verifier,
    );

    info!(
        event_name = "checkout.replay.started",
        visit_id = %visit_id.0,
        correlation_id = %correlation_id,
        steps = steps.len(),
        "replay started"
    );

    let mut records = Vec::with_capacity(steps.len());
    let mut receipt = None;
    for (index, step) in steps.into_iter().enumerate() {
        let name = step.name();
        let result = run_step(&harness, &mut session, step).await?;
        let queue = session.queue_state().name();
        let record = match result {
            Ok(step_result) => {
                if step_result.receipt.is_some() {
                    receipt = step_result.receipt.clone();
                }
                StepRecord {
                    index,
                    step: name,
                    status: "applied",
                    queue,
                    refresh: step_result
                        .outcomes
                        .iter()
                        .find_map(|outcome| outcome.refresh.clone()),
                    effects: step_result.effects().cloned().collect(),
                    error: None,
                }
            }
            Err(error) => {
                warn!(
                    event_name = "checkout.replay.step_rejected",
                    visit_id = %visit_id.0,
                    step = name,
                    index,
                    error = %error,
                    "replay step rejected"
                );
                StepRecord {
                    index,
                    step: name,
                    status: "rejected",
                    queue,
                    effects: Vec::new(),
                    refresh: None,
                    error: Some(error.to_string()),
                }
            }
        };
        records.push(record);
    }

    let submission = harness.submitter.submitted().pop();

    info!(
        event_name = "checkout.replay.finished",
        visit_id = %visit_id.0,
        correlation_id = %correlation_id,
        submitted = submission.is_some(),
        "replay finished"
    );

    Ok(ReplayTranscript {
        command: "replay",
        status: "ok",
        correlation_id: correlation_id.to_string(),
        visit_id: visit_id.0.clone(),
        steps: records,
        final_state: session.state(),
        submission,
        receipt,
        audit_events: harness.audit.events(),
    })
}

/// Outer error stops the replay; inner error is a rejected step.
async fn run_step(
    harness: &Harness,
    session: &mut CheckoutSession,
    step: ScenarioStep,
) -> Result<Result<RuntimeStep, ApplicationError>, ReplayFailure> {
    let runtime = &harness.runtime;
    let result = match step {
        ScenarioStep::Scan { product_id, lot_number } => {
            runtime.stage_scanned(session, &product_id, lot_number.as_ref()).await
        }
        ScenarioStep::StageAdministered { product_id, lot_number } => {
            let found = harness
                .catalog
                .resolve(&product_id, lot_number.as_ref())
                .ok_or_else(|| anyhow!("product `{}` is not in the catalog", product_id.0))
                .map_err(ReplayFailure::Scenario)?;
            let candidate = found.into_candidate(None);
            runtime.apply(session, SessionEvent::StageAdministered(candidate)).await
        }
        ScenarioStep::RefreshOrders { orders, at } => {
            let visit_id = session.snapshot().visit_id.clone();
            if let Some(orders) = orders {
                harness.orders.replace(visit_id, orders);
            }
            let now = at.unwrap_or(session.snapshot().fetched_at);
            runtime.refresh_orders(session, now).await
        }
        ScenarioStep::AddOrderedDose { order_number, lot_number } => {
            let dose = session
                .doses()
                .iter()
                .find(|dose| dose.order_number.as_ref() == Some(&order_number))
                .ok_or_else(|| anyhow!("no dose represents order `{}`", order_number.0))
                .map_err(ReplayFailure::Scenario)?;
            let dose_id = dose.id.clone();
            let lot = match lot_number {
                Some(number) => Some(
                    harness
                        .catalog
                        .lot(&dose.product.id, &number)
                        .cloned()
                        .ok_or_else(|| anyhow!("lot `{}` is not in the catalog", number.0))
                        .map_err(ReplayFailure::Scenario)?,
                ),
                None => None,
            };
            runtime.apply(session, SessionEvent::AddOrderedDose { dose_id, lot }).await
        }
        ScenarioStep::RemoveDose { dose_index } => {
            let dose_id = dose_at(session, dose_index)?;
            runtime.apply(session, SessionEvent::RemoveDose(dose_id)).await
        }
        ScenarioStep::RestoreDose { dose_index } => {
            let dose_id = dose_at(session, dose_index)?;
            runtime.apply(session, SessionEvent::RestoreDose(dose_id)).await
        }
        ScenarioStep::Resolve { choice } => {
            runtime.apply(session, SessionEvent::Resolve(choice)).await
        }
        ScenarioStep::Cancel => runtime.apply(session, SessionEvent::CancelIssue).await,
        ScenarioStep::Retry => runtime.apply(session, SessionEvent::Retry).await,
        ScenarioStep::Abort => runtime.apply(session, SessionEvent::Abort).await,
        ScenarioStep::FlipPayment { dose_indices, target, reason } => {
            let request = flip_request(session, FlipStep { dose_indices, target, reason })?;
            runtime.apply(session, SessionEvent::FlipPayment(request)).await
        }
        ScenarioStep::RevertPaymentFlip { dose_index } => {
            let dose_id = dose_at(session, dose_index)?;
            runtime.apply(session, SessionEvent::RevertPaymentFlip(dose_id)).await
        }
        ScenarioStep::OpenSideFlow { flow, flip } => {
            let flip = flip.map(|flip| flip_request(session, flip)).transpose()?;
            runtime.apply(session, SessionEvent::OpenSideFlow { flow, flip }).await
        }
        ScenarioStep::ResumeSideFlow { result } => {
            let result = side_flow_result(result, harness.medd_identifier);
            runtime.apply(session, SessionEvent::SideFlowResumed(result)).await
        }
        ScenarioStep::CollectReason { reason } => {
            runtime.apply(session, SessionEvent::CollectReason(reason)).await
        }
        ScenarioStep::RerunCopayCheck => {
            runtime.apply(session, SessionEvent::RerunCopayCheck).await
        }
        ScenarioStep::Complete => runtime.apply(session, SessionEvent::CompleteCheckout).await,
    };

    match result {
        Err(ApplicationError::Domain(error)) if error.is_fatal() => {
            Err(ReplayFailure::Fatal(ApplicationError::Domain(error)))
        }
        other => Ok(other),
    }
}

fn dose_at(session: &CheckoutSession, index: usize) -> Result<DoseId, ReplayFailure> {
    session.doses().get(index).map(|dose| dose.id.clone()).ok_or_else(|| {
        ReplayFailure::Scenario(anyhow!(
            "dose index {index} is out of range ({} doses staged)",
            session.doses().len()
        ))
    })
}

fn flip_request(session: &CheckoutSession, flip: FlipStep) -> Result<FlipRequest, ReplayFailure> {
    if flip.dose_indices.is_empty() {
        return Err(ReplayFailure::Scenario(anyhow!("payment flip names no doses")));
    }
    let dose_ids = flip
        .dose_indices
        .iter()
        .map(|index| dose_at(session, *index))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FlipRequest { dose_ids, target: flip.target, reason: flip.reason })
}

fn side_flow_result(step: SideFlowStep, kind: MedDIdentifierKind) -> SideFlowResult {
    match step {
        SideFlowStep::PhoneCollected { phone } => SideFlowResult::PhoneCollected(phone),
        SideFlowStep::PhoneDeclined => SideFlowResult::PhoneDeclined,
        SideFlowStep::InsuranceCaptured { payer } => SideFlowResult::InsuranceCaptured(payer),
        SideFlowStep::InsuranceDeclined => SideFlowResult::InsuranceDeclined,
        SideFlowStep::MedDIdentifierCollected { value } => {
            SideFlowResult::MedDIdentifierCollected(MedDIdentifier::new(kind, value))
        }
        SideFlowStep::PayerInfo { payer } => SideFlowResult::PayerInfo(payer),
        SideFlowStep::BackedOut => SideFlowResult::BackedOut,
    }
}
