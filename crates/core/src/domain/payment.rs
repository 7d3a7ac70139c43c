use serde::{Deserialize, Serialize};

/// Visit-level billing arrangement chosen at check-in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    InsurancePay,
    SelfPay,
    PartnerBill,
    NoPay,
}

/// Per-dose billing classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    InsurancePay,
    SelfPay,
    PartnerBill,
    NoPay,
}

impl From<PaymentMethod> for PaymentMode {
    fn from(value: PaymentMethod) -> Self {
        match value {
            PaymentMethod::InsurancePay => Self::InsurancePay,
            PaymentMethod::SelfPay => Self::SelfPay,
            PaymentMethod::PartnerBill => Self::PartnerBill,
            PaymentMethod::NoPay => Self::NoPay,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentModeReason {
    OutOfAgeIndication,
    SelfPayOptOut,
    RequestedMediaNotProvided,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PaymentSelection {
    pub mode: PaymentMode,
    pub reason: Option<PaymentModeReason>,
}

impl PaymentSelection {
    pub fn new(mode: PaymentMode, reason: Option<PaymentModeReason>) -> Self {
        Self { mode, reason }
    }

    pub fn mirroring(method: PaymentMethod) -> Self {
        Self { mode: method.into(), reason: None }
    }
}
