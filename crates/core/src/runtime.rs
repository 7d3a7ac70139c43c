//! Async driver around a [`CheckoutSession`]: runs the server calls the session
//! asks for under the slow-notice and hard-timeout policy, feeds the replies
//! back as events and hands completed checkouts to the submitter.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::audit::{AuditContext, AuditSink};
use crate::collaborators::{
    CatalogLookup, CheckoutSubmitter, CopayCheckService, OrdersSource, StockService,
    SubmissionReceipt,
};
use crate::config::ServerCallConfig;
use crate::domain::product::{LotNumber, ProductId};
use crate::errors::{ApplicationError, DomainError};
use crate::resolution::ServerRequest;
use crate::session::{CheckoutSession, ServerReply, SessionEffect, SessionEvent, SessionOutcome};
use crate::verification::ProductVerifier;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerCallPolicy {
    pub slow_notice: Duration,
    pub hard_timeout: Duration,
}

impl ServerCallPolicy {
    pub fn new(slow_notice: Duration, hard_timeout: Duration) -> Self {
        Self { slow_notice, hard_timeout: hard_timeout.max(slow_notice) }
    }
}

impl From<&ServerCallConfig> for ServerCallPolicy {
    fn from(config: &ServerCallConfig) -> Self {
        Self::new(config.slow_notice(), config.hard_timeout())
    }
}

pub struct Collaborators {
    pub catalog: Arc<dyn CatalogLookup>,
    pub orders: Arc<dyn OrdersSource>,
    pub copay: Arc<dyn CopayCheckService>,
    pub stock: Arc<dyn StockService>,
    pub submitter: Arc<dyn CheckoutSubmitter>,
}

/// Everything one operator action produced, follow-up server replies included.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStep {
    pub outcomes: Vec<SessionOutcome>,
    pub receipt: Option<SubmissionReceipt>,
}

impl RuntimeStep {
    pub fn effects(&self) -> impl Iterator<Item = &SessionEffect> {
        self.outcomes.iter().flat_map(|outcome| outcome.effects.iter())
    }

    fn merge(&mut self, other: RuntimeStep) {
        self.outcomes.extend(other.outcomes);
        if other.receipt.is_some() {
            self.receipt = other.receipt;
        }
    }
}

pub struct CheckoutRuntime {
    services: Collaborators,
    policy: ServerCallPolicy,
    audit: Option<(Arc<dyn AuditSink>, AuditContext)>,
}

impl CheckoutRuntime {
    pub fn new(services: Collaborators, policy: ServerCallPolicy) -> Self {
        Self { services, policy, audit: None }
    }

    /// Every event this runtime applies, server replies included, is audited.
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>, context: AuditContext) -> Self {
        self.audit = Some((sink, context));
        self
    }

    pub fn policy(&self) -> ServerCallPolicy {
        self.policy
    }

    /// Applies an operator event, then carries out every server call and
    /// submission it leads to.
    pub async fn apply<V>(
        &self,
        session: &mut CheckoutSession<V>,
        event: SessionEvent,
    ) -> Result<RuntimeStep, ApplicationError>
    where
        V: ProductVerifier,
    {
        let outcome = self.apply_event(session, event)?;
        self.settle(session, outcome).await
    }

    fn apply_event<V>(
        &self,
        session: &mut CheckoutSession<V>,
        event: SessionEvent,
    ) -> Result<SessionOutcome, DomainError>
    where
        V: ProductVerifier,
    {
        match &self.audit {
            Some((sink, context)) => session.apply_with_audit(event, sink.as_ref(), context),
            None => session.apply(event),
        }
    }

    /// Resolves a scanned product against the catalog and stages it.
    pub async fn stage_scanned<V>(
        &self,
        session: &mut CheckoutSession<V>,
        product_id: &ProductId,
        lot_number: Option<&LotNumber>,
    ) -> Result<RuntimeStep, ApplicationError>
    where
        V: ProductVerifier,
    {
        let found = self.services.catalog.lookup(product_id, lot_number).await?.ok_or_else(|| {
            let message = format!("product `{}` is not in the catalog", product_id.0);
            ApplicationError::Integration(message)
        })?;
        self.apply(session, SessionEvent::StageProduct(found.into_candidate(None))).await
    }

    /// Re-reads the open orders, refreshes the session against them and shows
    /// every new order as a not-yet-added dose.
    pub async fn refresh_orders<V>(
        &self,
        session: &mut CheckoutSession<V>,
        now: DateTime<Utc>,
    ) -> Result<RuntimeStep, ApplicationError>
    where
        V: ProductVerifier,
    {
        let visit_id = session.snapshot().visit_id.clone();
        let orders = timeout(self.policy.hard_timeout, self.services.orders.open_orders(&visit_id))
            .await
            .map_err(|_| ApplicationError::Timeout {
                operation: "order refresh".to_owned(),
                after_secs: self.policy.hard_timeout.as_secs(),
            })??;

        let mut snapshot = session.snapshot().clone();
        snapshot.open_orders = orders;
        snapshot.fetched_at = now;

        let outcome = self.apply_event(session, SessionEvent::RefreshSnapshot(Box::new(snapshot)))?;
        let new_orders =
            outcome.refresh.as_ref().map(|diff| diff.new_orders.clone()).unwrap_or_default();
        let mut step = self.settle(session, outcome).await?;

        for order_number in new_orders {
            let Some(order) = session
                .snapshot()
                .open_orders
                .iter()
                .find(|order| order.order_number == order_number)
                .cloned()
            else {
                continue;
            };

            match self.services.catalog.candidate_for_order(&order).await? {
                Some(candidate) => {
                    let surfaced =
                        self.apply(session, SessionEvent::SurfaceOrder(candidate)).await?;
                    step.merge(surfaced);
                }
                None => warn!(
                    event_name = "checkout.runtime.order_unmapped",
                    visit_id = %visit_id.0,
                    order_number = %order.order_number.0,
                    "no catalog product satisfies open order"
                ),
            }
        }
        Ok(step)
    }

    async fn settle<V>(
        &self,
        session: &mut CheckoutSession<V>,
        outcome: SessionOutcome,
    ) -> Result<RuntimeStep, ApplicationError>
    where
        V: ProductVerifier,
    {
        let mut step = RuntimeStep::default();
        let mut work: VecDeque<SessionEffect> = outcome.effects.iter().cloned().collect();
        step.outcomes.push(outcome);

        while let Some(effect) = work.pop_front() {
            match effect {
                SessionEffect::CallServer { request, attempt, .. } => {
                    for follow_up in self.call_server(session, request, attempt).await? {
                        work.extend(follow_up.effects.iter().cloned());
                        step.outcomes.push(follow_up);
                    }
                }
                SessionEffect::Submit { plan } => {
                    let receipt = self.services.submitter.submit(&plan).await?;
                    info!(
                        event_name = "checkout.runtime.submitted",
                        visit_id = %plan.visit_id.0,
                        confirmations = receipt.confirmations.len(),
                        "checkout submitted"
                    );
                    step.receipt = Some(receipt);
                }
                _ => {}
            }
        }
        Ok(step)
    }

    async fn call_server<V>(
        &self,
        session: &mut CheckoutSession<V>,
        request: ServerRequest,
        attempt: u32,
    ) -> Result<Vec<SessionOutcome>, ApplicationError>
    where
        V: ProductVerifier,
    {
        let visit_id = session.snapshot().visit_id.clone();
        let identifier = session.deltas().medd_identifier.clone();
        let mut outcomes = Vec::new();

        let reply = match request {
            ServerRequest::CopayCheck => match identifier {
                Some(identifier) => self
                    .within_deadline(
                        session,
                        request.label(),
                        self.services.copay.check(&visit_id, &identifier),
                        &mut outcomes,
                    )
                    .await
                    .map(ServerReply::CopayChecked),
                None => Err(ApplicationError::Integration(
                    "copay check needs a Part D identifier".to_owned(),
                )),
            },
            ServerRequest::StockChange(source) => self
                .within_deadline(
                    session,
                    request.label(),
                    self.services.stock.change_stock(&visit_id, source),
                    &mut outcomes,
                )
                .await
                .map(|()| ServerReply::StockChanged),
        };

        let event = match reply {
            Ok(reply) => SessionEvent::ServerSucceeded(reply),
            Err(error) => {
                warn!(
                    event_name = "checkout.runtime.server_call_failed",
                    visit_id = %visit_id.0,
                    request = request.label(),
                    attempt,
                    error = %error,
                    "server call failed"
                );
                SessionEvent::ServerFailed
            }
        };
        outcomes.push(self.apply_event(session, event)?);
        Ok(outcomes)
    }

    /// Awaits `call`; past the slow-notice threshold the session is told the
    /// server is slow, past the hard timeout the call is abandoned.
    async fn within_deadline<V, T, F>(
        &self,
        session: &mut CheckoutSession<V>,
        operation: &str,
        call: F,
        outcomes: &mut Vec<SessionOutcome>,
    ) -> Result<T, ApplicationError>
    where
        V: ProductVerifier,
        F: Future<Output = Result<T, ApplicationError>>,
    {
        let mut call = pin!(call);
        if let Ok(result) = timeout(self.policy.slow_notice, &mut call).await {
            return result;
        }

        outcomes.push(self.apply_event(session, SessionEvent::ServerSlow)?);
        let remaining = self.policy.hard_timeout.saturating_sub(self.policy.slow_notice);
        match timeout(remaining, &mut call).await {
            Ok(result) => result,
            Err(_) => Err(ApplicationError::Timeout {
                operation: operation.to_owned(),
                after_secs: self.policy.hard_timeout.as_secs(),
            }),
        }
    }
}
