use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::copay::CopayInfo;
use crate::domain::order::OpenOrder;
use crate::domain::payment::PaymentMethod;
use crate::domain::product::{Antigen, InventorySource};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VisitId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatientId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    RiskFree,
    /// Eligible once outstanding demographic or payer data is supplied.
    SoftRiskFree,
    AtRisk,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub risk: RiskLevel,
    pub data_collected_before_checkout: bool,
    pub vfc_eligible: bool,
}

impl Eligibility {
    pub fn is_data_missing(&self) -> bool {
        self.risk != RiskLevel::RiskFree && !self.data_collected_before_checkout
    }
}

impl Default for Eligibility {
    fn default() -> Self {
        Self {
            risk: RiskLevel::RiskFree,
            data_collected_before_checkout: true,
            vfc_eligible: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    pub name: String,
    #[serde(default)]
    pub uncovered_antigens: BTreeSet<Antigen>,
}

impl Payer {
    pub fn covers(&self, antigen: &Antigen) -> bool {
        !self.uncovered_antigens.iter().any(|uncovered| uncovered.matches(antigen))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    pub date_of_birth: NaiveDate,
    pub phone: Option<String>,
    pub payer: Option<Payer>,
}

impl Patient {
    /// `None` when the date of service precedes the date of birth.
    pub fn age_in_days_on(&self, date: NaiveDate) -> Option<u32> {
        let days = date.signed_duration_since(self.date_of_birth).num_days();
        u32::try_from(days).ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalDose {
    pub antigen: Antigen,
    pub given_on: NaiveDate,
}

/// Immutable view of the appointment at the time it was last fetched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitSnapshot {
    pub visit_id: VisitId,
    pub patient: Patient,
    pub date_of_service: NaiveDate,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub eligibility: Eligibility,
    pub inventory_source: InventorySource,
    #[serde(default)]
    pub open_orders: Vec<OpenOrder>,
    pub copay: Option<CopayInfo>,
    #[serde(default)]
    pub history: Vec<HistoricalDose>,
    pub fetched_at: DateTime<Utc>,
}

impl VisitSnapshot {
    pub fn patient_age_days(&self) -> Option<u32> {
        self.patient.age_in_days_on(self.date_of_service)
    }

    pub fn given_same_day(&self, antigen: &Antigen) -> bool {
        self.history
            .iter()
            .any(|dose| dose.given_on == self.date_of_service && dose.antigen.matches(antigen))
    }

    pub fn prior_doses_of(&self, antigen: &Antigen) -> u32 {
        let count = self
            .history
            .iter()
            .filter(|dose| dose.given_on < self.date_of_service && dose.antigen.matches(antigen))
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Orders that are bound to this visit (or unbound) and still open.
    pub fn active_orders(&self) -> impl Iterator<Item = &OpenOrder> {
        self.open_orders.iter().filter(move |order| {
            order.applies_to(&self.visit_id) && !order.is_expired_at(self.fetched_at)
        })
    }
}
