use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::issue::IssueKind;
use crate::domain::order::OrderNumber;
use crate::domain::payment::{PaymentMode, PaymentModeReason, PaymentSelection};
use crate::domain::product::{Antigen, LotInfo, Product, PromptAnswer, RouteCode};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DoseId(pub String);

impl DoseId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for DoseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseState {
    Ordered,
    Added,
    Administered,
    Removed,
    AdministeredRemoved,
}

impl DoseState {
    /// Doses in these states are billed at checkout.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Added | Self::Administered)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionSite {
    LeftDeltoid,
    RightDeltoid,
    LeftThigh,
    RightThigh,
    Mouth,
    Nose,
}

/// A product the clinician scanned or selected, before it is staged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDose {
    pub product: Product,
    pub lot: Option<LotInfo>,
    #[serde(default)]
    pub route: Option<RouteCode>,
    #[serde(default)]
    pub site: Option<InjectionSite>,
    #[serde(default)]
    pub order_number: Option<OrderNumber>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dose {
    pub id: DoseId,
    pub product: Product,
    pub lot: Option<LotInfo>,
    pub route: Option<RouteCode>,
    pub site: Option<InjectionSite>,
    pub dose_series: u32,
    pub order_number: Option<OrderNumber>,
    pub payment_mode: Option<PaymentMode>,
    pub payment_mode_reason: Option<PaymentModeReason>,
    pub original_payment: Option<PaymentSelection>,
    /// Selections replaced by flips, most recent last.
    pub payment_history: Vec<PaymentSelection>,
    pub issues: BTreeSet<IssueKind>,
    pub acknowledged: BTreeSet<IssueKind>,
    pub prompt_answer: Option<PromptAnswer>,
    pub state: DoseState,
    pub staged_seq: u64,
}

impl Dose {
    pub fn from_candidate(candidate: CandidateDose, state: DoseState, staged_seq: u64) -> Self {
        Self {
            id: DoseId::generate(),
            product: candidate.product,
            lot: candidate.lot,
            route: candidate.route,
            site: candidate.site,
            dose_series: 1,
            order_number: candidate.order_number,
            payment_mode: None,
            payment_mode_reason: None,
            original_payment: None,
            payment_history: Vec::new(),
            issues: BTreeSet::new(),
            acknowledged: BTreeSet::new(),
            prompt_answer: None,
            state,
            staged_seq,
        }
    }

    pub fn as_candidate(&self) -> CandidateDose {
        CandidateDose {
            product: self.product.clone(),
            lot: self.lot.clone(),
            route: self.route,
            site: self.site,
            order_number: self.order_number.clone(),
        }
    }

    pub fn antigen(&self) -> &Antigen {
        &self.product.antigen
    }

    pub fn payment_selection(&self) -> Option<PaymentSelection> {
        self.payment_mode.map(|mode| PaymentSelection::new(mode, self.payment_mode_reason))
    }

    pub fn set_payment_selection(&mut self, selection: Option<PaymentSelection>) {
        self.payment_mode = selection.map(|selection| selection.mode);
        self.payment_mode_reason = selection.and_then(|selection| selection.reason);
    }

    pub fn clear_payment(&mut self) {
        self.set_payment_selection(None);
        self.original_payment = None;
        self.payment_history.clear();
    }

    pub fn can_transition_to(&self, next: DoseState) -> bool {
        matches!(
            (self.state, next),
            (DoseState::Ordered, DoseState::Added)
                | (DoseState::Added, DoseState::Removed)
                | (DoseState::Removed, DoseState::Added)
                | (DoseState::Administered, DoseState::AdministeredRemoved)
                | (DoseState::AdministeredRemoved, DoseState::Administered)
        )
    }

    pub fn transition_to(&mut self, next: DoseState) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            self.state = next;
            return Ok(());
        }

        Err(DomainError::InvalidDoseTransition { from: self.state, to: next })
    }

    /// Removal is the same operator action for new and administered doses; only
    /// the resulting state differs.
    pub fn remove(&mut self) -> Result<(), DomainError> {
        let next = match self.state {
            DoseState::Administered => DoseState::AdministeredRemoved,
            _ => DoseState::Removed,
        };
        self.transition_to(next)?;
        self.clear_payment();
        self.issues.clear();
        Ok(())
    }
}
