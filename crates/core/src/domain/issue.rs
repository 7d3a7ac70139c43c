use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::dose::DoseId;
use crate::domain::product::{
    Antigen, InventorySource, LotInfo, OutOfAgePrompt, PromptAnswer, RouteCode,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    LarcAdded,
    DuplicateProductException,
    Duplicate,
    MissingLotNumber,
    Expired,
    RestrictedProduct,
    OutOfAgeIndication,
    OutOfAgeWarning,
    WrongStock,
    RouteSelectionRequired,
    Unordered,
    CopayRequired,
    ProductNotCovered,
}

/// Condition detected on a dose. At most one is primary (queued) for a dose at
/// any time; `Duplicate` and an uncovered product without a self-pay offer only
/// ever appear as banners.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Issue {
    LarcAdded,
    DuplicateProductException { antigen: Antigen },
    Duplicate { existing: DoseId },
    MissingLotNumber,
    Expired { expiration: NaiveDate },
    RestrictedProduct,
    OutOfAgeIndication { self_pay_offered: bool },
    OutOfAgeWarning { prompt: OutOfAgePrompt, self_pay_offered: bool },
    WrongStock { dose_source: InventorySource, visit_source: InventorySource },
    RouteSelectionRequired { options: Vec<RouteCode> },
    Unordered,
    CopayRequired { antigen: Antigen },
    ProductNotCovered { self_pay_offered: bool },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "value", rename_all = "snake_case")]
pub enum ResolutionChoice {
    Keep,
    Remove,
    Override,
    AcceptSelfPay,
    SelectRoute(RouteCode),
    SupplyLot(LotInfo),
    ChangeStock(InventorySource),
    RunCopayCheck,
    AnswerPrompt(PromptAnswer),
}

impl ResolutionChoice {
    pub fn removes_dose(&self) -> bool {
        matches!(self, Self::Remove)
    }
}

/// What backing out of an issue dialog means for the triggering dose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    RollBack,
    KeepDose,
}

impl Issue {
    pub fn kind(&self) -> IssueKind {
        match self {
            Self::LarcAdded => IssueKind::LarcAdded,
            Self::DuplicateProductException { .. } => IssueKind::DuplicateProductException,
            Self::Duplicate { .. } => IssueKind::Duplicate,
            Self::MissingLotNumber => IssueKind::MissingLotNumber,
            Self::Expired { .. } => IssueKind::Expired,
            Self::RestrictedProduct => IssueKind::RestrictedProduct,
            Self::OutOfAgeIndication { .. } => IssueKind::OutOfAgeIndication,
            Self::OutOfAgeWarning { .. } => IssueKind::OutOfAgeWarning,
            Self::WrongStock { .. } => IssueKind::WrongStock,
            Self::RouteSelectionRequired { .. } => IssueKind::RouteSelectionRequired,
            Self::Unordered => IssueKind::Unordered,
            Self::CopayRequired { .. } => IssueKind::CopayRequired,
            Self::ProductNotCovered { .. } => IssueKind::ProductNotCovered,
        }
    }

    pub fn is_banner_only(&self) -> bool {
        matches!(
            self,
            Self::Duplicate { .. } | Self::ProductNotCovered { self_pay_offered: false }
        )
    }

    pub fn cancel_policy(&self) -> CancelPolicy {
        match self {
            Self::ProductNotCovered { .. } => CancelPolicy::KeepDose,
            _ => CancelPolicy::RollBack,
        }
    }

    pub fn allows(&self, choice: &ResolutionChoice) -> bool {
        use ResolutionChoice as C;

        match (self, choice) {
            (_, C::Remove) => !self.is_banner_only(),
            (Self::DuplicateProductException { .. }, C::Override) => true,
            (Self::MissingLotNumber, C::SupplyLot(lot)) => !lot.lot_number.is_blank(),
            (Self::OutOfAgeIndication { self_pay_offered }, C::AcceptSelfPay)
            | (Self::OutOfAgeWarning { self_pay_offered, .. }, C::AcceptSelfPay) => {
                *self_pay_offered
            }
            (Self::OutOfAgeWarning { prompt, .. }, C::AnswerPrompt(answer)) => {
                prompt.accepts(answer)
            }
            (Self::WrongStock { .. }, C::Keep) => true,
            (Self::WrongStock { visit_source, .. }, C::ChangeStock(source)) => {
                source != visit_source
            }
            (Self::RouteSelectionRequired { options }, C::SelectRoute(route)) => {
                options.contains(route)
            }
            (Self::Unordered, C::Keep) => true,
            (Self::CopayRequired { .. }, C::RunCopayCheck) => true,
            (Self::ProductNotCovered { self_pay_offered: true }, C::AcceptSelfPay | C::Keep) => {
                true
            }
            _ => false,
        }
    }
}
