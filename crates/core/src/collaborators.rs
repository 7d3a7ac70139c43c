//! Services the checkout engine consumes but does not own: catalog and
//! inventory lookup, open orders, the Part D copay check, stock changes and
//! checkout submission. Each has an in-memory implementation for replays and
//! tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::copay::{CopayInfo, MedDIdentifier};
use crate::domain::dose::CandidateDose;
use crate::domain::order::{OpenOrder, OrderNumber};
use crate::domain::product::{InventorySource, LotInfo, LotNumber, Product, ProductId};
use crate::domain::visit::VisitId;
use crate::errors::ApplicationError;
use crate::payment::SubmissionPlan;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub product: Product,
    /// Missing when the catalog has no series mapping for the product.
    #[serde(default)]
    pub doses_in_series: Option<u32>,
    #[serde(default)]
    pub lots: Vec<LotInfo>,
}

/// A scanned product resolved against the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogMatch {
    pub product: Product,
    pub lot: Option<LotInfo>,
    pub doses_in_series: Option<u32>,
}

impl CatalogMatch {
    pub fn into_candidate(self, order_number: Option<OrderNumber>) -> CandidateDose {
        CandidateDose {
            product: self.product,
            lot: self.lot,
            route: None,
            site: None,
            order_number,
        }
    }
}

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// `Ok(None)` when the product is unknown. A lot number the catalog does not
    /// carry resolves to a match without a lot.
    async fn lookup(
        &self,
        product_id: &ProductId,
        lot_number: Option<&LotNumber>,
    ) -> Result<Option<CatalogMatch>, ApplicationError>;

    /// Candidate for an open order: the first satisfying product the catalog
    /// knows, without a lot until one is scanned.
    async fn candidate_for_order(
        &self,
        order: &OpenOrder,
    ) -> Result<Option<CandidateDose>, ApplicationError> {
        for product_id in &order.satisfying_product_ids {
            if let Some(found) = self.lookup(product_id, None).await? {
                return Ok(Some(found.into_candidate(Some(order.order_number.clone()))));
            }
        }
        Ok(None)
    }
}

#[async_trait]
pub trait OrdersSource: Send + Sync {
    async fn open_orders(&self, visit_id: &VisitId) -> Result<Vec<OpenOrder>, ApplicationError>;
}

#[async_trait]
pub trait CopayCheckService: Send + Sync {
    async fn check(
        &self,
        visit_id: &VisitId,
        identifier: &MedDIdentifier,
    ) -> Result<CopayInfo, ApplicationError>;
}

#[async_trait]
pub trait StockService: Send + Sync {
    async fn change_stock(
        &self,
        visit_id: &VisitId,
        source: InventorySource,
    ) -> Result<(), ApplicationError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub visit_id: VisitId,
    /// One confirmation per payment group; two or more mean a split checkout.
    pub confirmations: Vec<String>,
}

#[async_trait]
pub trait CheckoutSubmitter: Send + Sync {
    async fn submit(&self, plan: &SubmissionPlan) -> Result<SubmissionReceipt, ApplicationError>;
}

#[derive(Clone, Debug, Default)]
pub struct ProductCatalog {
    entries: Vec<CatalogEntry>,
}

impl ProductCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn find(&self, product_id: &ProductId) -> Option<&CatalogEntry> {
        self.entries.iter().find(|entry| &entry.product.id == product_id)
    }

    pub fn lot(&self, product_id: &ProductId, lot_number: &LotNumber) -> Option<&LotInfo> {
        self.find(product_id)?.lots.iter().find(|lot| &lot.lot_number == lot_number)
    }

    /// Series mapping for the verifier; products without one are left out.
    pub fn doses_in_series(&self) -> BTreeMap<ProductId, u32> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry.doses_in_series.map(|doses| (entry.product.id.clone(), doses))
            })
            .collect()
    }

    pub fn resolve(
        &self,
        product_id: &ProductId,
        lot_number: Option<&LotNumber>,
    ) -> Option<CatalogMatch> {
        let entry = self.find(product_id)?;
        let lot = lot_number.and_then(|number| self.lot(product_id, number)).cloned();
        Some(CatalogMatch {
            product: entry.product.clone(),
            lot,
            doses_in_series: entry.doses_in_series,
        })
    }
}

#[async_trait]
impl CatalogLookup for ProductCatalog {
    async fn lookup(
        &self,
        product_id: &ProductId,
        lot_number: Option<&LotNumber>,
    ) -> Result<Option<CatalogMatch>, ApplicationError> {
        Ok(self.resolve(product_id, lot_number))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOrders {
    orders: Mutex<BTreeMap<VisitId, Vec<OpenOrder>>>,
}

impl InMemoryOrders {
    pub fn with_orders(visit_id: VisitId, orders: Vec<OpenOrder>) -> Self {
        Self { orders: Mutex::new(BTreeMap::from([(visit_id, orders)])) }
    }

    pub fn replace(&self, visit_id: VisitId, orders: Vec<OpenOrder>) {
        match self.orders.lock() {
            Ok(mut guard) => guard.insert(visit_id, orders),
            Err(poisoned) => poisoned.into_inner().insert(visit_id, orders),
        };
    }
}

#[async_trait]
impl OrdersSource for InMemoryOrders {
    async fn open_orders(&self, visit_id: &VisitId) -> Result<Vec<OpenOrder>, ApplicationError> {
        let guard = self
            .orders
            .lock()
            .map_err(|_| ApplicationError::Integration("orders source lock poisoned".to_owned()))?;
        Ok(guard.get(visit_id).cloned().unwrap_or_default())
    }
}

/// Scripted reply for a server-bound fake: how long it takes and whether it
/// fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedReply {
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub fail: bool,
}

#[derive(Debug, Default)]
struct Script {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<u32>,
}

impl Script {
    fn new(replies: Vec<ScriptedReply>) -> Self {
        Self { replies: Mutex::new(replies.into()), calls: Mutex::new(0) }
    }

    /// Next scripted reply; once the script runs out every call succeeds at once.
    async fn play(&self, operation: &str) -> Result<(), ApplicationError> {
        let reply = {
            let mut calls = self.calls.lock().map_err(|_| poisoned(operation))?;
            *calls += 1;
            let mut replies = self.replies.lock().map_err(|_| poisoned(operation))?;
            replies.pop_front().unwrap_or_default()
        };

        if reply.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(reply.delay_ms)).await;
        }
        if reply.fail {
            return Err(ApplicationError::Integration(format!("{operation} rejected")));
        }
        Ok(())
    }

    fn calls(&self) -> u32 {
        self.calls.lock().map(|calls| *calls).unwrap_or_default()
    }
}

fn poisoned(operation: &str) -> ApplicationError {
    ApplicationError::Integration(format!("{operation} fake lock poisoned"))
}

/// Copay check fake returning fixed results after its scripted replies.
#[derive(Debug)]
pub struct ScriptedCopayService {
    results: CopayInfo,
    script: Script,
}

impl ScriptedCopayService {
    pub fn new(results: CopayInfo, replies: Vec<ScriptedReply>) -> Self {
        Self { results, script: Script::new(replies) }
    }

    pub fn calls(&self) -> u32 {
        self.script.calls()
    }
}

#[async_trait]
impl CopayCheckService for ScriptedCopayService {
    async fn check(
        &self,
        visit_id: &VisitId,
        identifier: &MedDIdentifier,
    ) -> Result<CopayInfo, ApplicationError> {
        debug!(
            event_name = "checkout.copay.check_requested",
            visit_id = %visit_id.0,
            identifier = %identifier.masked(),
            "copay check requested"
        );
        self.script.play("copay check").await?;
        Ok(CopayInfo { visit_id: visit_id.clone(), lines: self.results.lines.clone() })
    }
}

#[derive(Debug, Default)]
pub struct ScriptedStockService {
    script: Script,
}

impl ScriptedStockService {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self { script: Script::new(replies) }
    }

    pub fn calls(&self) -> u32 {
        self.script.calls()
    }
}

#[async_trait]
impl StockService for ScriptedStockService {
    async fn change_stock(
        &self,
        visit_id: &VisitId,
        source: InventorySource,
    ) -> Result<(), ApplicationError> {
        debug!(
            event_name = "checkout.stock.change_requested",
            visit_id = %visit_id.0,
            to = ?source,
            "stock change requested"
        );
        self.script.play("stock change").await
    }
}

#[derive(Debug, Default)]
pub struct RecordingSubmitter {
    submitted: Mutex<Vec<SubmissionPlan>>,
}

impl RecordingSubmitter {
    pub fn submitted(&self) -> Vec<SubmissionPlan> {
        match self.submitted.lock() {
            Ok(plans) => plans.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl CheckoutSubmitter for RecordingSubmitter {
    async fn submit(&self, plan: &SubmissionPlan) -> Result<SubmissionReceipt, ApplicationError> {
        let mut submitted = self
            .submitted
            .lock()
            .map_err(|_| ApplicationError::Integration("submitter lock poisoned".to_owned()))?;
        submitted.push(plan.clone());

        let confirmations = plan
            .groups
            .iter()
            .enumerate()
            .map(|(index, group)| format!("{}-{}-{:?}", plan.visit_id.0, index + 1, group.mode))
            .collect();
        Ok(SubmissionReceipt { visit_id: plan.visit_id.clone(), confirmations })
    }
}
