//! Pure predicates over a single candidate dose and the facts of its visit.
//!
//! Nothing here orders or combines the checks; the verifier's rule ladder does.

use chrono::NaiveDate;

use crate::config::FeatureFlags;
use crate::domain::dose::{CandidateDose, Dose, DoseId};
use crate::domain::order::OpenOrder;
use crate::domain::payment::{PaymentMethod, PaymentMode};
use crate::domain::product::{
    Antigen, InventorySource, OutOfAgePrompt, ProductCategory, RouteCode,
};
use crate::domain::visit::VisitSnapshot;

#[derive(Clone, Copy, Debug)]
pub struct RuleInput<'a> {
    pub candidate: &'a CandidateDose,
    pub snapshot: &'a VisitSnapshot,
    pub staged: &'a [Dose],
    pub flags: &'a FeatureFlags,
    /// The staged dose being re-evaluated, if any. It is never compared against
    /// itself.
    pub own: Option<&'a Dose>,
}

impl<'a> RuleInput<'a> {
    pub fn own_id(&self) -> Option<&'a DoseId> {
        self.own.map(|dose| &dose.id)
    }

    pub fn other_active_doses(&self) -> impl Iterator<Item = &'a Dose> + 'a {
        let own_id = self.own_id();
        self.staged.iter().filter(move |dose| dose.state.is_active() && Some(&dose.id) != own_id)
    }

    /// Active doses staged before this one. A fresh candidate comes after every
    /// staged dose.
    pub fn earlier_active_doses(&self) -> impl Iterator<Item = &'a Dose> + 'a {
        let own_seq = self.own.map(|dose| dose.staged_seq);
        self.other_active_doses()
            .filter(move |dose| own_seq.map_or(true, |own_seq| dose.staged_seq < own_seq))
    }

    /// Doses already moved off insurance no longer need coverage or copay checks.
    pub fn billed_off_insurance(&self) -> bool {
        self.own
            .and_then(|dose| dose.payment_mode)
            .is_some_and(|mode| mode != PaymentMode::InsurancePay)
    }
}

pub fn is_larc(candidate: &CandidateDose) -> bool {
    candidate.product.category == ProductCategory::Larc
}

pub fn is_restricted_duplicate_antigen(antigen: &Antigen, flags: &FeatureFlags) -> bool {
    flags.duplicate_rsv_restriction
        && flags.restricted_duplicate_antigens.iter().any(|name| antigen.matches_name(name))
}

/// Antigen already given today (or staged earlier under a different product)
/// for which a second dose needs a documented medical exception.
pub fn duplicate_exception_antigen(input: &RuleInput<'_>) -> Option<Antigen> {
    let antigen = &input.candidate.product.antigen;
    if !is_restricted_duplicate_antigen(antigen, input.flags) {
        return None;
    }

    let staged_elsewhere = input.earlier_active_doses().any(|dose| {
        dose.antigen().matches(antigen) && dose.product.id != input.candidate.product.id
    });

    (input.snapshot.given_same_day(antigen) || staged_elsewhere).then(|| antigen.clone())
}

pub fn duplicate_staged(input: &RuleInput<'_>) -> Option<DoseId> {
    input
        .other_active_doses()
        .find(|dose| dose.product.id == input.candidate.product.id)
        .map(|dose| dose.id.clone())
}

pub fn lot_missing(candidate: &CandidateDose) -> bool {
    candidate.lot.as_ref().map_or(true, |lot| lot.lot_number.is_blank())
}

pub fn lot_expiration_passed(
    candidate: &CandidateDose,
    date_of_service: NaiveDate,
) -> Option<NaiveDate> {
    candidate
        .lot
        .as_ref()
        .filter(|lot| lot.is_expired_on(date_of_service))
        .map(|lot| lot.expiration)
}

pub fn is_restricted(candidate: &CandidateDose) -> bool {
    candidate.product.restricted
}

/// Unknown age (date of service before date of birth) is treated as within
/// indication; the snapshot is the thing that is wrong.
pub fn is_out_of_age(input: &RuleInput<'_>) -> bool {
    let Some(indication) = input.candidate.product.age_indication.as_ref() else {
        return false;
    };

    input.snapshot.patient_age_days().is_some_and(|age_days| !indication.admits(age_days))
}

pub fn out_of_age_prompt(candidate: &CandidateDose) -> Option<&OutOfAgePrompt> {
    candidate.product.age_indication.as_ref().and_then(|indication| indication.prompt.as_ref())
}

/// Whether the visit lets the operator move a dose off insurance onto self-pay.
pub fn payment_flip_allowed(snapshot: &VisitSnapshot, flags: &FeatureFlags) -> bool {
    !flags.payment_mode_selection_disabled && snapshot.payment_method == PaymentMethod::InsurancePay
}

pub fn wrong_stock(input: &RuleInput<'_>) -> Option<(InventorySource, InventorySource)> {
    let dose_source = input.candidate.lot.as_ref()?.source;
    let visit_source = input.snapshot.inventory_source;
    (dose_source != visit_source).then_some((dose_source, visit_source))
}

pub fn route_options_when_ambiguous(candidate: &CandidateDose) -> Option<Vec<RouteCode>> {
    (candidate.route.is_none() && candidate.product.has_ambiguous_route())
        .then(|| candidate.product.routes.clone())
}

/// The active order this candidate fulfils, preferring the order it was linked to.
pub fn matching_order<'a>(input: &RuleInput<'a>) -> Option<&'a OpenOrder> {
    let snapshot: &'a VisitSnapshot = input.snapshot;
    let product_id = &input.candidate.product.id;
    let mut satisfying = snapshot.active_orders().filter(|order| order.is_satisfied_by(product_id));

    match input.candidate.order_number.as_ref() {
        Some(linked) => snapshot
            .active_orders()
            .find(|order| &order.order_number == linked && order.is_satisfied_by(product_id))
            .or_else(|| satisfying.next()),
        None => satisfying.next(),
    }
}

pub fn is_unordered(input: &RuleInput<'_>) -> bool {
    input.flags.right_patient_right_dose && matching_order(input).is_none()
}

pub fn copay_required(input: &RuleInput<'_>) -> bool {
    if input.billed_off_insurance() {
        return false;
    }

    input
        .snapshot
        .copay
        .as_ref()
        .is_some_and(|copay| copay.requires_check(&input.candidate.product.antigen))
}

pub fn is_not_covered(input: &RuleInput<'_>) -> bool {
    if input.snapshot.payment_method != PaymentMethod::InsurancePay || input.billed_off_insurance()
    {
        return false;
    }

    input
        .snapshot
        .patient
        .payer
        .as_ref()
        .is_some_and(|payer| !payer.covers(&input.candidate.product.antigen))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{
        duplicate_exception_antigen, duplicate_staged, is_not_covered, is_out_of_age,
        is_unordered, lot_expiration_passed, lot_missing, matching_order, payment_flip_allowed,
        route_options_when_ambiguous, wrong_stock, RuleInput,
    };
    use crate::config::FeatureFlags;
    use crate::domain::dose::{CandidateDose, Dose, DoseState};
    use crate::domain::order::{OpenOrder, OrderNumber};
    use crate::domain::payment::{PaymentMethod, PaymentMode};
    use crate::domain::product::{
        AgeIndication, Antigen, InventorySource, LotInfo, LotNumber, Product, ProductCategory,
        ProductId, RouteCode,
    };
    use crate::domain::visit::{
        Eligibility, HistoricalDose, Patient, PatientId, Payer, VisitId, VisitSnapshot,
    };

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn product(id: &str, antigen: &str) -> Product {
        Product {
            id: ProductId(id.to_owned()),
            antigen: Antigen(antigen.to_owned()),
            name: id.to_owned(),
            category: ProductCategory::Vaccine,
            routes: vec![RouteCode::Intramuscular],
            age_indication: None,
            restricted: false,
        }
    }

    fn candidate(product: Product, source: InventorySource) -> CandidateDose {
        CandidateDose {
            lot: Some(LotInfo {
                lot_number: LotNumber("LOT-1".to_owned()),
                product_id: product.id.clone(),
                expiration: date(2027, 1, 1),
                source,
            }),
            product,
            route: None,
            site: None,
            order_number: None,
        }
    }

    fn snapshot() -> VisitSnapshot {
        VisitSnapshot {
            visit_id: VisitId("V-1".to_owned()),
            patient: Patient {
                id: PatientId("P-1".to_owned()),
                date_of_birth: date(1990, 5, 1),
                phone: None,
                payer: None,
            },
            date_of_service: date(2026, 10, 19),
            payment_method: PaymentMethod::InsurancePay,
            eligibility: Eligibility::default(),
            inventory_source: InventorySource::Private,
            open_orders: Vec::new(),
            copay: None,
            history: Vec::new(),
            fetched_at: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).single().expect("valid time"),
        }
    }

    fn rule_input<'a>(
        candidate: &'a CandidateDose,
        snapshot: &'a VisitSnapshot,
        staged: &'a [Dose],
        flags: &'a FeatureFlags,
    ) -> RuleInput<'a> {
        RuleInput { candidate, snapshot, staged, flags, own: None }
    }

    #[test]
    fn missing_and_expired_lots_are_detected() {
        let mut candidate = candidate(product("flu", "Influenza"), InventorySource::Private);
        assert!(!lot_missing(&candidate));
        assert_eq!(lot_expiration_passed(&candidate, date(2026, 10, 19)), None);

        if let Some(lot) = candidate.lot.as_mut() {
            lot.expiration = date(2026, 10, 18);
        }
        assert_eq!(
            lot_expiration_passed(&candidate, date(2026, 10, 19)),
            Some(date(2026, 10, 18))
        );

        candidate.lot = None;
        assert!(lot_missing(&candidate));
    }

    #[test]
    fn out_of_age_uses_the_date_of_service() {
        let mut infant_only = product("rsv-mab", "RSV");
        infant_only.age_indication =
            Some(AgeIndication { min_age_days: None, max_age_days: Some(240), prompt: None });
        let candidate = candidate(infant_only, InventorySource::Private);
        let snapshot = snapshot();
        let flags = FeatureFlags::default();

        let input = rule_input(&candidate, &snapshot, &[], &flags);
        assert!(is_out_of_age(&input));
    }

    #[test]
    fn duplicate_exception_requires_restricted_antigen_and_same_day_dose() {
        let mut snapshot = snapshot();
        snapshot.history.push(HistoricalDose {
            antigen: Antigen("RSV".to_owned()),
            given_on: date(2026, 10, 19),
        });
        let flags = FeatureFlags::default();

        let rsv = candidate(product("abrysvo", "RSV"), InventorySource::Private);
        let input = rule_input(&rsv, &snapshot, &[], &flags);
        assert_eq!(duplicate_exception_antigen(&input), Some(Antigen("RSV".to_owned())));

        let relaxed = FeatureFlags { duplicate_rsv_restriction: false, ..FeatureFlags::default() };
        let input = rule_input(&rsv, &snapshot, &[], &relaxed);
        assert_eq!(duplicate_exception_antigen(&input), None);
    }

    #[test]
    fn duplicate_exception_only_looks_at_earlier_staged_doses() {
        let snapshot = snapshot();
        let flags = FeatureFlags::default();
        let first = Dose::from_candidate(
            candidate(product("abrysvo", "RSV"), InventorySource::Private),
            DoseState::Added,
            1,
        );
        let second = Dose::from_candidate(
            candidate(product("arexvy", "RSV"), InventorySource::Private),
            DoseState::Added,
            2,
        );
        let staged = vec![first.clone(), second.clone()];

        let later = second.as_candidate();
        let input =
            RuleInput { own: Some(&second), ..rule_input(&later, &snapshot, &staged, &flags) };
        assert_eq!(duplicate_exception_antigen(&input), Some(Antigen("RSV".to_owned())));

        let earlier = first.as_candidate();
        let input =
            RuleInput { own: Some(&first), ..rule_input(&earlier, &snapshot, &staged, &flags) };
        assert_eq!(duplicate_exception_antigen(&input), None);
    }

    #[test]
    fn duplicate_staged_ignores_removed_doses_and_itself() {
        let snapshot = snapshot();
        let flags = FeatureFlags::default();
        let flu = candidate(product("flu", "Influenza"), InventorySource::Private);

        let mut staged = Dose::from_candidate(flu.clone(), DoseState::Added, 1);
        let staged_id = staged.id.clone();
        let listed = std::slice::from_ref(&staged);
        let found = duplicate_staged(&rule_input(&flu, &snapshot, listed, &flags));
        assert_eq!(found, Some(staged_id.clone()));

        let itself =
            RuleInput { own: Some(&staged), ..rule_input(&flu, &snapshot, listed, &flags) };
        assert_eq!(duplicate_staged(&itself), None);

        staged.state = DoseState::Removed;
        let listed = std::slice::from_ref(&staged);
        assert_eq!(duplicate_staged(&rule_input(&flu, &snapshot, listed, &flags)), None);
    }

    #[test]
    fn stock_route_order_and_coverage_predicates() {
        let mut snapshot = snapshot();
        let flags = FeatureFlags::default();
        let mut mmr = product("mmr", "MMR");
        mmr.routes = vec![RouteCode::Subcutaneous, RouteCode::Intramuscular];
        let vfc = candidate(mmr, InventorySource::Vfc);
        let input = rule_input(&vfc, &snapshot, &[], &flags);

        assert_eq!(wrong_stock(&input), Some((InventorySource::Vfc, InventorySource::Private)));
        assert_eq!(
            route_options_when_ambiguous(&vfc),
            Some(vec![RouteCode::Subcutaneous, RouteCode::Intramuscular])
        );
        assert!(is_unordered(&input));

        snapshot.open_orders.push(OpenOrder {
            order_number: OrderNumber("ORD-1".to_owned()),
            description: "MMR".to_owned(),
            satisfying_product_ids: BTreeSet::from([ProductId("mmr".to_owned())]),
            expires_at: Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).single().expect("valid time"),
            patient_visit_id: None,
        });
        snapshot.patient.payer = Some(Payer {
            name: "Acme Health".to_owned(),
            uncovered_antigens: BTreeSet::from([Antigen("MMR".to_owned())]),
        });
        let input = rule_input(&vfc, &snapshot, &[], &flags);
        assert!(matching_order(&input).is_some());
        assert!(!is_unordered(&input));
        assert!(is_not_covered(&input));
        assert!(payment_flip_allowed(&snapshot, &flags));

        let mut flipped = Dose::from_candidate(vfc.clone(), DoseState::Added, 1);
        flipped.payment_mode = Some(PaymentMode::SelfPay);
        let self_pay = RuleInput { own: Some(&flipped), ..input };
        assert!(!is_not_covered(&self_pay));

        let disabled =
            FeatureFlags { payment_mode_selection_disabled: true, ..FeatureFlags::default() };
        assert!(!payment_flip_allowed(&snapshot, &disabled));
    }
}
