use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::product::ProductId;
use crate::domain::visit::VisitId;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderNumber(pub String);

/// Open clinical order for the patient. Read-only to the checkout engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_number: OrderNumber,
    pub description: String,
    pub satisfying_product_ids: BTreeSet<ProductId>,
    pub expires_at: DateTime<Utc>,
    pub patient_visit_id: Option<VisitId>,
}

impl OpenOrder {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_satisfied_by(&self, product_id: &ProductId) -> bool {
        self.satisfying_product_ids.contains(product_id)
    }

    /// Orders without a visit binding apply to any visit of the patient.
    pub fn applies_to(&self, visit_id: &VisitId) -> bool {
        self.patient_visit_id.as_ref().map_or(true, |bound| bound == visit_id)
    }
}
