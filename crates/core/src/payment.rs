//! Payment mode resolution, flips with exact reversion, and the split partition
//! used at checkout submission.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::FeatureFlags;
use crate::domain::copay::{CopayInfo, CopayStatus};
use crate::domain::dose::{Dose, DoseId};
use crate::domain::payment::{PaymentMethod, PaymentMode, PaymentModeReason, PaymentSelection};
use crate::domain::product::InventorySource;
use crate::domain::visit::{Eligibility, PatientId, Payer, VisitId, VisitSnapshot};
use crate::errors::DomainError;
use crate::reconciliation::DoseReason;

#[derive(Clone, Copy, Debug)]
pub struct PaymentContext<'a> {
    pub method: PaymentMethod,
    pub eligibility: &'a Eligibility,
    pub copay: Option<&'a CopayInfo>,
    pub flags: &'a FeatureFlags,
}

impl<'a> PaymentContext<'a> {
    pub fn from_snapshot(snapshot: &'a VisitSnapshot, flags: &'a FeatureFlags) -> Self {
        Self {
            method: snapshot.payment_method,
            eligibility: &snapshot.eligibility,
            copay: snapshot.copay.as_ref(),
            flags,
        }
    }
}

/// Reason recorded on a default insurance selection when the patient is not
/// risk-free and demographic data was not collected before checkout. Kept as its
/// own branch so the rule can be dropped without touching the resolver.
pub fn data_missing_reason(eligibility: &Eligibility) -> Option<PaymentModeReason> {
    eligibility.is_data_missing().then_some(PaymentModeReason::RequestedMediaNotProvided)
}

/// The visit's payment method as a per-dose selection.
pub fn default_selection(context: &PaymentContext<'_>) -> PaymentSelection {
    let mut selection = PaymentSelection::mirroring(context.method);
    if selection.mode == PaymentMode::InsurancePay {
        selection.reason = data_missing_reason(context.eligibility);
    }
    selection
}

/// Current selection for a dose, or the visit default. An insurance-billed dose
/// whose antigen still has an unchecked Part D copay line stays unresolved.
pub fn resolve(dose: &Dose, context: &PaymentContext<'_>) -> Option<PaymentSelection> {
    if let Some(current) = dose.payment_selection() {
        return Some(current);
    }

    let selection = default_selection(context);
    let copay_pending = selection.mode == PaymentMode::InsurancePay
        && context.copay.is_some_and(|copay| copay.requires_check(dose.antigen()));
    (!copay_pending).then_some(selection)
}

/// Sets the default selection on a dose that has none and records it as the
/// dose's original selection. Returns the selection now in effect.
pub fn apply_default(dose: &mut Dose, context: &PaymentContext<'_>) -> Option<PaymentSelection> {
    let resolved = resolve(dose, context)?;
    if dose.payment_selection().is_none() {
        dose.set_payment_selection(Some(resolved));
    }
    dose.original_payment.get_or_insert(resolved);
    Some(resolved)
}

fn apply_flip(dose: &mut Dose, next: PaymentSelection, context: &PaymentContext<'_>) {
    let current = dose.payment_selection().unwrap_or_else(|| default_selection(context));
    dose.original_payment.get_or_insert(current);
    dose.payment_history.push(current);
    dose.set_payment_selection(Some(next));

    info!(
        event_name = "checkout.payment.flipped",
        dose_id = %dose.id,
        from = ?current.mode,
        to = ?next.mode,
        reason = ?next.reason,
        "dose payment mode flipped"
    );
}

/// Moves a dose to self-pay. When credit-card capture is disabled self-pay is not
/// collectable, so the dose is partner-billed with the same reason instead.
pub fn flip_to_self_pay(
    dose: &mut Dose,
    reason: PaymentModeReason,
    context: &PaymentContext<'_>,
) -> PaymentSelection {
    let mode = if context.flags.credit_card_capture_disabled {
        PaymentMode::PartnerBill
    } else {
        PaymentMode::SelfPay
    };
    let next = PaymentSelection::new(mode, Some(reason));
    apply_flip(dose, next, context);
    next
}

/// Partner-bill overrides whatever selection the dose has, including a prior
/// self-pay flip; one revert restores that self-pay selection.
pub fn flip_to_partner_bill(
    dose: &mut Dose,
    reason: PaymentModeReason,
    context: &PaymentContext<'_>,
) -> PaymentSelection {
    let next = PaymentSelection::new(PaymentMode::PartnerBill, Some(reason));
    apply_flip(dose, next, context);
    next
}

/// Restores the selection that was in effect before the most recent flip.
pub fn revert_flip(dose: &mut Dose) -> Option<PaymentSelection> {
    let restored = dose.payment_history.pop()?;
    let replaced = dose.payment_selection();
    dose.set_payment_selection(Some(restored));

    info!(
        event_name = "checkout.payment.reverted",
        dose_id = %dose.id,
        from = ?replaced.map(|selection| selection.mode),
        to = ?restored.mode,
        "dose payment flip reverted"
    );
    Some(restored)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentGroup {
    pub mode: PaymentMode,
    pub dose_ids: Vec<DoseId>,
    /// Patient responsibility from covered Part D lines; only insurance groups
    /// carry one.
    pub copay_total: Decimal,
}

/// Demographic, payer and stock changes made during checkout. The Part D
/// identifier only travels masked.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitUpdates {
    pub phone: Option<String>,
    pub payer: Option<Payer>,
    pub stock_source: Option<InventorySource>,
    pub medd_identifier: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionPlan {
    pub visit_id: VisitId,
    pub patient_id: PatientId,
    pub date_of_service: NaiveDate,
    pub groups: Vec<PaymentGroup>,
    /// Reasons collected for order mismatches that still apply.
    #[serde(default)]
    pub reasons: Vec<DoseReason>,
    #[serde(default)]
    pub updates: VisitUpdates,
}

impl SubmissionPlan {
    /// Two or more payment modes are submitted as separate sub-visits.
    pub fn is_split(&self) -> bool {
        self.groups.len() > 1
    }

    pub fn dose_count(&self) -> usize {
        self.groups.iter().map(|group| group.dose_ids.len()).sum()
    }
}

fn copay_total(doses: &[&Dose], copay: Option<&CopayInfo>) -> Decimal {
    let Some(copay) = copay else {
        return Decimal::ZERO;
    };

    doses
        .iter()
        .filter_map(|dose| copay.line_for(dose.antigen()))
        .filter(|line| line.status == CopayStatus::Covered)
        .filter_map(|line| line.copay)
        .sum()
}

/// Partitions every active dose by payment mode. Any dose without a mode, or a
/// partition that is not exhaustive and disjoint, is an invariant violation and
/// nothing may be submitted.
pub fn partition(snapshot: &VisitSnapshot, doses: &[Dose]) -> Result<SubmissionPlan, DomainError> {
    let active: Vec<&Dose> = doses.iter().filter(|dose| dose.state.is_active()).collect();

    let mut by_mode: BTreeMap<PaymentMode, Vec<&Dose>> = BTreeMap::new();
    for &dose in &active {
        let mode = dose.payment_mode.ok_or_else(|| {
            DomainError::InvariantViolation(format!("dose {} has no payment mode", dose.id))
        })?;
        by_mode.entry(mode).or_default().push(dose);
    }

    let groups: Vec<PaymentGroup> = by_mode
        .into_iter()
        .map(|(mode, members)| PaymentGroup {
            mode,
            dose_ids: members.iter().map(|dose| dose.id.clone()).collect(),
            copay_total: if mode == PaymentMode::InsurancePay {
                copay_total(&members, snapshot.copay.as_ref())
            } else {
                Decimal::ZERO
            },
        })
        .collect();

    let mut seen = BTreeSet::new();
    for dose_id in groups.iter().flat_map(|group| group.dose_ids.iter()) {
        if !seen.insert(dose_id) {
            return Err(DomainError::InvariantViolation(format!(
                "dose {dose_id} appears in more than one payment group"
            )));
        }
    }
    if seen.len() != active.len() {
        return Err(DomainError::InvariantViolation(format!(
            "{} active dose(s) but {} partitioned",
            active.len(),
            seen.len()
        )));
    }

    info!(
        event_name = "checkout.payment.partitioned",
        visit_id = %snapshot.visit_id.0,
        groups = groups.len(),
        doses = seen.len(),
        "staged doses partitioned by payment mode"
    );

    Ok(SubmissionPlan {
        visit_id: snapshot.visit_id.clone(),
        patient_id: snapshot.patient.id.clone(),
        date_of_service: snapshot.date_of_service,
        groups,
        reasons: Vec::new(),
        updates: VisitUpdates::default(),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{
        apply_default, data_missing_reason, flip_to_partner_bill, flip_to_self_pay, partition,
        resolve, revert_flip, PaymentContext,
    };
    use crate::config::FeatureFlags;
    use crate::domain::copay::{CopayInfo, CopayLine, CopayStatus};
    use crate::domain::dose::{CandidateDose, Dose, DoseId, DoseState};
    use crate::domain::payment::{PaymentMethod, PaymentMode, PaymentModeReason, PaymentSelection};
    use crate::domain::product::{Antigen, InventorySource, Product, ProductCategory, ProductId};
    use crate::domain::visit::{
        Eligibility, Patient, PatientId, RiskLevel, VisitId, VisitSnapshot,
    };
    use crate::errors::DomainError;

    fn dose(id: &str, antigen: &str, seq: u64) -> Dose {
        let mut dose = Dose::from_candidate(
            CandidateDose {
                product: Product {
                    id: ProductId(id.to_owned()),
                    antigen: Antigen(antigen.to_owned()),
                    name: id.to_owned(),
                    category: ProductCategory::Vaccine,
                    routes: Vec::new(),
                    age_indication: None,
                    restricted: false,
                },
                lot: None,
                route: None,
                site: None,
                order_number: None,
            },
            DoseState::Added,
            seq,
        );
        dose.id = DoseId(format!("D-{id}"));
        dose
    }

    fn snapshot() -> VisitSnapshot {
        VisitSnapshot {
            visit_id: VisitId("V-7".to_owned()),
            patient: Patient {
                id: PatientId("P-7".to_owned()),
                date_of_birth: NaiveDate::from_ymd_opt(1950, 1, 1).expect("valid date"),
                phone: None,
                payer: None,
            },
            date_of_service: NaiveDate::from_ymd_opt(2026, 10, 19).expect("valid date"),
            payment_method: PaymentMethod::InsurancePay,
            eligibility: Eligibility::default(),
            inventory_source: InventorySource::Private,
            open_orders: Vec::new(),
            copay: None,
            history: Vec::new(),
            fetched_at: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).single().expect("valid time"),
        }
    }

    #[test]
    fn default_mirrors_the_visit_and_is_recorded_as_original() {
        let snapshot = snapshot();
        let flags = FeatureFlags::default();
        let context = PaymentContext::from_snapshot(&snapshot, &flags);
        let mut flu = dose("flu", "Influenza", 1);

        let applied = apply_default(&mut flu, &context).expect("resolved");
        assert_eq!(applied, PaymentSelection::new(PaymentMode::InsurancePay, None));
        assert_eq!(flu.original_payment, Some(applied));
    }

    #[test]
    fn unchecked_copay_line_leaves_insurance_dose_unresolved() {
        let mut snapshot = snapshot();
        snapshot.copay = Some(CopayInfo {
            visit_id: snapshot.visit_id.clone(),
            lines: vec![CopayLine {
                antigen: Antigen("Zoster".to_owned()),
                status: CopayStatus::Unchecked,
                copay: None,
            }],
        });
        let flags = FeatureFlags::default();
        let context = PaymentContext::from_snapshot(&snapshot, &flags);

        assert_eq!(resolve(&dose("shingrix", "Zoster", 1), &context), None);
        assert!(resolve(&dose("flu", "Influenza", 2), &context).is_some());
    }

    #[test]
    fn data_missing_branch_only_applies_to_incomplete_non_risk_free_visits() {
        let missing = Eligibility {
            risk: RiskLevel::SoftRiskFree,
            data_collected_before_checkout: false,
            vfc_eligible: false,
        };
        assert_eq!(
            data_missing_reason(&missing),
            Some(PaymentModeReason::RequestedMediaNotProvided)
        );

        let collected = Eligibility { data_collected_before_checkout: true, ..missing.clone() };
        assert_eq!(data_missing_reason(&collected), None);
        assert_eq!(data_missing_reason(&Eligibility::default()), None);
    }

    #[test]
    fn flip_then_revert_restores_the_exact_pair() {
        let mut snapshot = snapshot();
        snapshot.eligibility = Eligibility {
            risk: RiskLevel::AtRisk,
            data_collected_before_checkout: false,
            vfc_eligible: false,
        };
        let flags = FeatureFlags::default();
        let context = PaymentContext::from_snapshot(&snapshot, &flags);
        let mut flu = dose("flu", "Influenza", 1);
        let before = apply_default(&mut flu, &context).expect("resolved");

        flip_to_self_pay(&mut flu, PaymentModeReason::OutOfAgeIndication, &context);
        flip_to_partner_bill(&mut flu, PaymentModeReason::RequestedMediaNotProvided, &context);
        assert_eq!(flu.payment_mode, Some(PaymentMode::PartnerBill));

        let restored = revert_flip(&mut flu).expect("self-pay restored");
        assert_eq!(
            restored,
            PaymentSelection::new(PaymentMode::SelfPay, Some(PaymentModeReason::OutOfAgeIndication))
        );
        assert_eq!(revert_flip(&mut flu), Some(before));
        assert_eq!(flu.payment_selection(), Some(before));
        assert_eq!(revert_flip(&mut flu), None);
    }

    #[test]
    fn self_pay_becomes_partner_bill_without_card_capture() {
        let snapshot = snapshot();
        let flags = FeatureFlags { credit_card_capture_disabled: true, ..FeatureFlags::default() };
        let context = PaymentContext::from_snapshot(&snapshot, &flags);
        let mut flu = dose("flu", "Influenza", 1);

        let flipped = flip_to_self_pay(&mut flu, PaymentModeReason::SelfPayOptOut, &context);
        assert_eq!(flipped.mode, PaymentMode::PartnerBill);
        assert_eq!(flipped.reason, Some(PaymentModeReason::SelfPayOptOut));
    }

    #[test]
    fn partition_splits_by_mode_and_skips_removed_doses() {
        let mut snapshot = snapshot();
        snapshot.copay = Some(CopayInfo {
            visit_id: snapshot.visit_id.clone(),
            lines: vec![CopayLine {
                antigen: Antigen("Influenza".to_owned()),
                status: CopayStatus::Covered,
                copay: Some(Decimal::new(1_500, 2)),
            }],
        });
        let flags = FeatureFlags::default();
        let context = PaymentContext::from_snapshot(&snapshot, &flags);

        let mut flu = dose("flu", "Influenza", 1);
        let mut tdap = dose("tdap", "Tdap", 2);
        let mut removed = dose("hepb", "HepB", 3);
        apply_default(&mut flu, &context);
        flip_to_self_pay(&mut tdap, PaymentModeReason::SelfPayOptOut, &context);
        removed.state = DoseState::Removed;

        let plan = partition(&snapshot, &[flu, tdap, removed]).expect("partition");
        assert!(plan.is_split());
        assert_eq!(plan.dose_count(), 2);
        assert_eq!(plan.groups[0].mode, PaymentMode::InsurancePay);
        assert_eq!(plan.groups[0].copay_total, Decimal::new(1_500, 2));
        assert_eq!(plan.groups[1].mode, PaymentMode::SelfPay);
    }

    #[test]
    fn unresolved_or_duplicated_doses_block_submission() {
        let snapshot = snapshot();
        let unresolved = dose("flu", "Influenza", 1);
        let error = partition(&snapshot, &[unresolved]).expect_err("no payment mode");
        assert!(error.is_fatal());

        let flags = FeatureFlags::default();
        let context = PaymentContext::from_snapshot(&snapshot, &flags);
        let mut flu = dose("flu", "Influenza", 1);
        apply_default(&mut flu, &context);
        let error = partition(&snapshot, &[flu.clone(), flu]).expect_err("same dose twice");
        assert!(matches!(
            error,
            DomainError::InvariantViolation(ref message) if message.contains("more than one")
        ));
    }
}
