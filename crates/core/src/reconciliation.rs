use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::dose::{Dose, DoseId};
use crate::domain::order::{OpenOrder, OrderNumber};
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonContext {
    OrderUnfilled,
    DosesNotOrdered,
}

/// Which orders and doses produced each reason context.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderProductWrapper {
    pub unfilled_orders: Vec<OrderNumber>,
    pub unordered_doses: Vec<DoseId>,
}

impl OrderProductWrapper {
    pub fn contexts(&self) -> BTreeSet<ReasonContext> {
        let mut contexts = BTreeSet::new();
        if !self.unfilled_orders.is_empty() {
            contexts.insert(ReasonContext::OrderUnfilled);
        }
        if !self.unordered_doses.is_empty() {
            contexts.insert(ReasonContext::DosesNotOrdered);
        }
        contexts
    }
}

/// Cross-references active doses with the orders still open at `now`. Pure:
/// the same inputs always give the same wrapper.
pub fn reconcile_detail<'a>(
    staged: &[Dose],
    orders: impl IntoIterator<Item = &'a OpenOrder>,
    now: DateTime<Utc>,
) -> OrderProductWrapper {
    let open: Vec<&OpenOrder> =
        orders.into_iter().filter(|order| !order.is_expired_at(now)).collect();
    let active: Vec<&Dose> = staged.iter().filter(|dose| dose.state.is_active()).collect();

    let unfilled_orders = open
        .iter()
        .filter(|order| !active.iter().any(|dose| order.is_satisfied_by(&dose.product.id)))
        .map(|order| order.order_number.clone())
        .collect();
    let unordered_doses = active
        .iter()
        .filter(|dose| !open.iter().any(|order| order.is_satisfied_by(&dose.product.id)))
        .map(|dose| dose.id.clone())
        .collect();

    OrderProductWrapper { unfilled_orders, unordered_doses }
}

pub fn reconcile<'a>(
    staged: &[Dose],
    orders: impl IntoIterator<Item = &'a OpenOrder>,
    now: DateTime<Utc>,
) -> BTreeSet<ReasonContext> {
    reconcile_detail(staged, orders, now).contexts()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoseReason {
    pub context: ReasonContext,
    pub reason_code: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// Reasons the operator has supplied so far. Survives interruptions by side
/// flows; a later reason for the same context replaces the earlier one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCollection {
    collected: BTreeMap<ReasonContext, DoseReason>,
}

impl ReasonCollection {
    pub fn record(&mut self, reason: DoseReason) -> Result<(), DomainError> {
        if reason.reason_code.trim().is_empty() {
            return Err(DomainError::BlankReason(reason.context));
        }
        self.collected.insert(reason.context, reason);
        Ok(())
    }

    pub fn get(&self, context: ReasonContext) -> Option<&DoseReason> {
        self.collected.get(&context)
    }

    pub fn missing(&self, required: &BTreeSet<ReasonContext>) -> Vec<ReasonContext> {
        required.iter().filter(|context| !self.collected.contains_key(context)).copied().collect()
    }

    pub fn is_satisfied(&self, required: &BTreeSet<ReasonContext>) -> bool {
        self.missing(required).is_empty()
    }

    /// Collected reasons for contexts that still apply; stale ones are kept in
    /// case the context comes back but are not submitted.
    pub fn applicable<'a>(
        &'a self,
        required: &'a BTreeSet<ReasonContext>,
    ) -> impl Iterator<Item = &'a DoseReason> + 'a {
        self.collected.values().filter(move |reason| required.contains(&reason.context))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{TimeZone, Utc};

    use super::{reconcile, reconcile_detail, DoseReason, ReasonCollection, ReasonContext};
    use crate::domain::dose::{CandidateDose, Dose, DoseState};
    use crate::domain::order::{OpenOrder, OrderNumber};
    use crate::domain::product::{Antigen, Product, ProductCategory, ProductId, RouteCode};
    use crate::errors::DomainError;

    fn dose(product_id: &str, state: DoseState, seq: u64) -> Dose {
        Dose::from_candidate(
            CandidateDose {
                product: Product {
                    id: ProductId(product_id.to_owned()),
                    antigen: Antigen(product_id.to_uppercase()),
                    name: product_id.to_owned(),
                    category: ProductCategory::Vaccine,
                    routes: vec![RouteCode::Intramuscular],
                    age_indication: None,
                    restricted: false,
                },
                lot: None,
                route: None,
                site: None,
                order_number: None,
            },
            state,
            seq,
        )
    }

    fn order(number: &str, product_id: &str, expires_day: u32) -> OpenOrder {
        OpenOrder {
            order_number: OrderNumber(number.to_owned()),
            description: product_id.to_owned(),
            satisfying_product_ids: BTreeSet::from([ProductId(product_id.to_owned())]),
            expires_at: Utc
                .with_ymd_and_hms(2026, 10, expires_day, 0, 0, 0)
                .single()
                .expect("valid time"),
            patient_visit_id: None,
        }
    }

    #[test]
    fn unfilled_and_unordered_can_co_occur() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).single().expect("valid time");
        let staged = vec![dose("flu", DoseState::Added, 1)];
        let orders = vec![order("ORD-1", "mmr", 30)];

        let detail = reconcile_detail(&staged, &orders, now);
        assert_eq!(detail.unfilled_orders, vec![OrderNumber("ORD-1".to_owned())]);
        assert_eq!(detail.unordered_doses, vec![staged[0].id.clone()]);
        assert_eq!(
            detail.contexts(),
            BTreeSet::from([ReasonContext::OrderUnfilled, ReasonContext::DosesNotOrdered])
        );
    }

    #[test]
    fn expired_orders_and_inactive_doses_are_ignored() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).single().expect("valid time");
        let staged = vec![dose("flu", DoseState::Removed, 1), dose("mmr", DoseState::Ordered, 2)];
        let orders = vec![order("ORD-OLD", "tdap", 18)];

        assert!(reconcile(&staged, &orders, now).is_empty());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).single().expect("valid time");
        let staged = vec![dose("flu", DoseState::Added, 1), dose("mmr", DoseState::Added, 2)];
        let orders = vec![order("ORD-1", "mmr", 30), order("ORD-2", "hepb", 30)];
        let before = (staged.clone(), orders.clone());

        let first = reconcile(&staged, &orders, now);
        let second = reconcile(&staged, &orders, now);
        assert_eq!(first, second);
        assert_eq!((staged, orders), before);
    }

    #[test]
    fn reason_collection_is_reentrant_and_rejects_blank_codes() {
        let required =
            BTreeSet::from([ReasonContext::OrderUnfilled, ReasonContext::DosesNotOrdered]);
        let mut reasons = ReasonCollection::default();

        reasons
            .record(DoseReason {
                context: ReasonContext::DosesNotOrdered,
                reason_code: "walk_in_request".to_owned(),
                note: None,
            })
            .expect("reason recorded");
        assert_eq!(reasons.missing(&required), vec![ReasonContext::OrderUnfilled]);

        let error = reasons
            .record(DoseReason {
                context: ReasonContext::OrderUnfilled,
                reason_code: "  ".to_owned(),
                note: None,
            })
            .expect_err("blank reason rejected");
        assert_eq!(error, DomainError::BlankReason(ReasonContext::OrderUnfilled));

        reasons
            .record(DoseReason {
                context: ReasonContext::OrderUnfilled,
                reason_code: "patient_declined".to_owned(),
                note: Some("will return next week".to_owned()),
            })
            .expect("reason recorded");
        assert!(reasons.is_satisfied(&required));
        assert_eq!(reasons.applicable(&required).count(), 2);
    }
}
