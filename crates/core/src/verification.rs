//! Product verification: an ordered ladder of eligibility checks that yields at
//! most one primary issue per dose.
//!
//! The ladder order is the dialog order the clinician sees. Rules are evaluated
//! top-down and the first rule that raises a primary issue wins; banners never
//! stop evaluation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::issue::{Issue, IssueKind};
use crate::domain::order::OrderNumber;
use crate::domain::product::{InventorySource, ProductId, RouteCode};
use crate::eligibility::{
    copay_required, duplicate_exception_antigen, duplicate_staged, is_larc, is_not_covered,
    is_out_of_age, is_restricted, is_unordered, lot_expiration_passed, lot_missing,
    matching_order, out_of_age_prompt, payment_flip_allowed, route_options_when_ambiguous,
    wrong_stock, RuleInput,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    LarcRestriction,
    DuplicateException,
    DuplicateStaged,
    LotAndRestriction,
    OutOfAge,
    WrongStock,
    RouteSelection,
    Unordered,
    CopayRequired,
    ProductNotCovered,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleOutcome {
    Pass,
    Issue(Issue),
    Banner(Issue),
}

#[derive(Clone, Copy)]
pub struct Rule {
    pub id: RuleId,
    pub check: fn(&RuleInput<'_>) -> RuleOutcome,
}

pub const RULE_LADDER: [Rule; 10] = [
    Rule { id: RuleId::LarcRestriction, check: larc_restriction },
    Rule { id: RuleId::DuplicateException, check: duplicate_exception },
    Rule { id: RuleId::DuplicateStaged, check: duplicate_already_staged },
    Rule { id: RuleId::LotAndRestriction, check: lot_and_restriction },
    Rule { id: RuleId::OutOfAge, check: out_of_age },
    Rule { id: RuleId::WrongStock, check: stock_source_mismatch },
    Rule { id: RuleId::RouteSelection, check: route_selection },
    Rule { id: RuleId::Unordered, check: unordered },
    Rule { id: RuleId::CopayRequired, check: copay },
    Rule { id: RuleId::ProductNotCovered, check: product_not_covered },
];

fn larc_restriction(input: &RuleInput<'_>) -> RuleOutcome {
    if is_larc(input.candidate) {
        return RuleOutcome::Issue(Issue::LarcAdded);
    }
    RuleOutcome::Pass
}

fn duplicate_exception(input: &RuleInput<'_>) -> RuleOutcome {
    match duplicate_exception_antigen(input) {
        Some(antigen) => RuleOutcome::Issue(Issue::DuplicateProductException { antigen }),
        None => RuleOutcome::Pass,
    }
}

fn duplicate_already_staged(input: &RuleInput<'_>) -> RuleOutcome {
    match duplicate_staged(input) {
        Some(existing) => RuleOutcome::Banner(Issue::Duplicate { existing }),
        None => RuleOutcome::Pass,
    }
}

fn lot_and_restriction(input: &RuleInput<'_>) -> RuleOutcome {
    let blocking = if lot_missing(input.candidate) {
        Issue::MissingLotNumber
    } else if let Some(expiration) =
        lot_expiration_passed(input.candidate, input.snapshot.date_of_service)
    {
        Issue::Expired { expiration }
    } else if is_restricted(input.candidate) {
        Issue::RestrictedProduct
    } else {
        return RuleOutcome::Pass;
    };

    // An out-of-age product on a visit that can flip to self-pay is offered
    // self-pay instead of being hard blocked.
    if is_out_of_age(input) && payment_flip_allowed(input.snapshot, input.flags) {
        return RuleOutcome::Issue(Issue::OutOfAgeIndication { self_pay_offered: true });
    }

    RuleOutcome::Issue(blocking)
}

fn out_of_age(input: &RuleInput<'_>) -> RuleOutcome {
    if !is_out_of_age(input) {
        return RuleOutcome::Pass;
    }

    let self_pay_offered = payment_flip_allowed(input.snapshot, input.flags);
    let issue = match out_of_age_prompt(input.candidate) {
        Some(prompt) => Issue::OutOfAgeWarning { prompt: prompt.clone(), self_pay_offered },
        None => Issue::OutOfAgeIndication { self_pay_offered },
    };
    RuleOutcome::Issue(issue)
}

fn stock_source_mismatch(input: &RuleInput<'_>) -> RuleOutcome {
    match wrong_stock(input) {
        Some((dose_source, visit_source)) => {
            RuleOutcome::Issue(Issue::WrongStock { dose_source, visit_source })
        }
        None => RuleOutcome::Pass,
    }
}

fn route_selection(input: &RuleInput<'_>) -> RuleOutcome {
    match route_options_when_ambiguous(input.candidate) {
        Some(options) => RuleOutcome::Issue(Issue::RouteSelectionRequired { options }),
        None => RuleOutcome::Pass,
    }
}

fn unordered(input: &RuleInput<'_>) -> RuleOutcome {
    if is_unordered(input) {
        return RuleOutcome::Issue(Issue::Unordered);
    }
    RuleOutcome::Pass
}

fn copay(input: &RuleInput<'_>) -> RuleOutcome {
    if copay_required(input) {
        let antigen = input.candidate.product.antigen.clone();
        return RuleOutcome::Issue(Issue::CopayRequired { antigen });
    }
    RuleOutcome::Pass
}

fn product_not_covered(input: &RuleInput<'_>) -> RuleOutcome {
    if !is_not_covered(input) {
        return RuleOutcome::Pass;
    }

    if payment_flip_allowed(input.snapshot, input.flags) {
        RuleOutcome::Issue(Issue::ProductNotCovered { self_pay_offered: true })
    } else {
        RuleOutcome::Banner(Issue::ProductNotCovered { self_pay_offered: false })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleVerdict {
    Passed,
    Banner,
    Raised,
    /// The rule matched an issue kind the clinician already resolved for this dose.
    Acknowledged,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTraceStep {
    pub rule: RuleId,
    pub verdict: RuleVerdict,
    pub issue: Option<IssueKind>,
}

/// Fields the verifier fills in on the dose alongside the issue check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFields {
    pub dose_series: u32,
    /// True when the catalog had no series mapping and the index fell back to 1.
    pub series_defaulted: bool,
    pub route: Option<RouteCode>,
    pub stock_source: Option<InventorySource>,
    pub order_number: Option<OrderNumber>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub primary_issue: Option<Issue>,
    pub banners: Vec<Issue>,
    pub derived: DerivedFields,
    pub trace: Vec<RuleTraceStep>,
}

#[derive(Clone, Copy, Debug)]
pub struct VerificationInput<'a> {
    pub facts: RuleInput<'a>,
    pub acknowledged: &'a BTreeSet<IssueKind>,
}

pub trait ProductVerifier: Send + Sync {
    fn evaluate(&self, input: &VerificationInput<'_>) -> Verification;
}

/// Runs the ladder. Rules whose issue kind is acknowledged are skipped so the
/// next applicable issue surfaces; evaluation stops at the first primary issue.
pub fn run_ladder(
    input: &VerificationInput<'_>,
) -> (Option<Issue>, Vec<Issue>, Vec<RuleTraceStep>) {
    let mut banners = Vec::new();
    let mut trace = Vec::with_capacity(RULE_LADDER.len());

    for rule in RULE_LADDER.iter() {
        match (rule.check)(&input.facts) {
            RuleOutcome::Pass => {
                trace.push(RuleTraceStep {
                    rule: rule.id,
                    verdict: RuleVerdict::Passed,
                    issue: None,
                })
            }
            RuleOutcome::Banner(issue) => {
                trace.push(RuleTraceStep {
                    rule: rule.id,
                    verdict: RuleVerdict::Banner,
                    issue: Some(issue.kind()),
                });
                banners.push(issue);
            }
            RuleOutcome::Issue(issue) if input.acknowledged.contains(&issue.kind()) => {
                trace.push(RuleTraceStep {
                    rule: rule.id,
                    verdict: RuleVerdict::Acknowledged,
                    issue: Some(issue.kind()),
                });
            }
            RuleOutcome::Issue(issue) => {
                trace.push(RuleTraceStep {
                    rule: rule.id,
                    verdict: RuleVerdict::Raised,
                    issue: Some(issue.kind()),
                });
                return (Some(issue), banners, trace);
            }
        }
    }

    (None, banners, trace)
}

/// Verifier backed by a doses-in-series mapping taken from the catalog.
#[derive(Clone, Debug, Default)]
pub struct DeterministicProductVerifier {
    doses_in_series: BTreeMap<ProductId, u32>,
}

impl DeterministicProductVerifier {
    pub fn new(doses_in_series: BTreeMap<ProductId, u32>) -> Self {
        Self { doses_in_series }
    }

    fn dose_series(&self, facts: &RuleInput<'_>) -> (u32, bool) {
        let product = &facts.candidate.product;
        match self.doses_in_series.get(&product.id).copied().filter(|doses| *doses > 0) {
            Some(doses) => {
                let next = facts.snapshot.prior_doses_of(&product.antigen).saturating_add(1);
                (next.min(doses), false)
            }
            None => {
                warn!(
                    event_name = "checkout.verification.series_defaulted",
                    visit_id = %facts.snapshot.visit_id.0,
                    product_id = %product.id.0,
                    "no doses-in-series mapping for product, defaulting series to 1"
                );
                (1, true)
            }
        }
    }

    fn derive(&self, facts: &RuleInput<'_>) -> DerivedFields {
        let (dose_series, series_defaulted) = self.dose_series(facts);
        let candidate = facts.candidate;

        DerivedFields {
            dose_series,
            series_defaulted,
            route: candidate.route.or_else(|| candidate.product.default_route()),
            stock_source: candidate.lot.as_ref().map(|lot| lot.source),
            order_number: matching_order(facts).map(|order| order.order_number.clone()),
        }
    }
}

impl ProductVerifier for DeterministicProductVerifier {
    fn evaluate(&self, input: &VerificationInput<'_>) -> Verification {
        let (primary_issue, banners, trace) = run_ladder(input);
        let derived = self.derive(&input.facts);

        debug!(
            event_name = "checkout.verification.evaluated",
            visit_id = %input.facts.snapshot.visit_id.0,
            product_id = %input.facts.candidate.product.id.0,
            issue = ?primary_issue.as_ref().map(Issue::kind),
            banners = banners.len(),
            "candidate dose verified"
        );

        Verification { primary_issue, banners, derived, trace }
    }
}
