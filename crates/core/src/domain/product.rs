use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Antigen(pub String);

impl Antigen {
    pub fn matches(&self, other: &Antigen) -> bool {
        self.0.trim().eq_ignore_ascii_case(other.0.trim())
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.0.trim().eq_ignore_ascii_case(name.trim())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LotNumber(pub String);

impl LotNumber {
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    Vaccine,
    /// Long-acting reversible contraceptive; never administrable through checkout.
    Larc,
    Supply,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteCode {
    Intramuscular,
    Subcutaneous,
    Intradermal,
    Intranasal,
    Oral,
}

/// Funding pool a lot was purchased from. A dose drawn from one pool cannot be
/// billed against a visit running on another without a stock change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventorySource {
    Private,
    Vfc,
    State,
    Section317,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutOfAgePrompt {
    Confirm { message: String },
    SingleSelect { question: String, options: Vec<String> },
}

impl OutOfAgePrompt {
    pub fn accepts(&self, answer: &PromptAnswer) -> bool {
        match (self, answer) {
            (Self::Confirm { .. }, PromptAnswer::Confirmed(_)) => true,
            (Self::SingleSelect { options, .. }, PromptAnswer::Selected(choice)) => {
                options.iter().any(|option| option == choice)
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PromptAnswer {
    Confirmed(bool),
    Selected(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeIndication {
    pub min_age_days: Option<u32>,
    pub max_age_days: Option<u32>,
    /// Products that may still be given outside the indication after the
    /// clinician answers a question (e.g. weeks pregnant) carry the prompt here.
    pub prompt: Option<OutOfAgePrompt>,
}

impl AgeIndication {
    pub fn admits(&self, age_days: u32) -> bool {
        let above_min = self.min_age_days.map_or(true, |min| age_days >= min);
        let below_max = self.max_age_days.map_or(true, |max| age_days <= max);
        above_min && below_max
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub antigen: Antigen,
    pub name: String,
    pub category: ProductCategory,
    pub routes: Vec<RouteCode>,
    pub age_indication: Option<AgeIndication>,
    pub restricted: bool,
}

impl Product {
    pub fn default_route(&self) -> Option<RouteCode> {
        match self.routes.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    pub fn has_ambiguous_route(&self) -> bool {
        self.routes.len() > 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotInfo {
    pub lot_number: LotNumber,
    pub product_id: ProductId,
    pub expiration: NaiveDate,
    pub source: InventorySource,
}

impl LotInfo {
    /// A lot is usable through the end of its expiration date.
    pub fn is_expired_on(&self, date: NaiveDate) -> bool {
        self.expiration < date
    }
}
