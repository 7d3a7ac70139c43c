use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::domain::product::Antigen;
use crate::domain::visit::VisitId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopayStatus {
    Unchecked,
    Covered,
    NotCovered,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopayLine {
    pub antigen: Antigen,
    pub status: CopayStatus,
    pub copay: Option<Decimal>,
}

/// Part D copay lines for a visit. A line in `Unchecked` status means the
/// antigen is billed through Part D and the patient's responsibility is unknown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopayInfo {
    pub visit_id: VisitId,
    pub lines: Vec<CopayLine>,
}

impl CopayInfo {
    pub fn line_for(&self, antigen: &Antigen) -> Option<&CopayLine> {
        self.lines.iter().find(|line| line.antigen.matches(antigen))
    }

    pub fn requires_check(&self, antigen: &Antigen) -> bool {
        self.line_for(antigen).is_some_and(|line| line.status == CopayStatus::Unchecked)
    }

    /// Applies check results line by line; antigens the check did not mention keep
    /// their current status.
    pub fn apply_results(&mut self, results: &CopayInfo) {
        for result in &results.lines {
            match self.lines.iter_mut().find(|line| line.antigen.matches(&result.antigen)) {
                Some(line) => {
                    line.status = result.status;
                    line.copay = result.copay;
                }
                None => self.lines.push(result.clone()),
            }
        }
    }

    pub fn total_copay(&self) -> Decimal {
        self.lines
            .iter()
            .filter(|line| line.status == CopayStatus::Covered)
            .filter_map(|line| line.copay)
            .sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MedDIdentifierKind {
    Mbi,
    Ssn,
}

/// Identifier the Part D check runs against. The value never appears in `Debug`
/// output.
#[derive(Clone, Debug)]
pub struct MedDIdentifier {
    pub kind: MedDIdentifierKind,
    value: SecretString,
}

impl MedDIdentifier {
    pub fn new(kind: MedDIdentifierKind, value: impl Into<String>) -> Self {
        Self { kind, value: SecretString::from(value.into()) }
    }

    pub fn is_blank(&self) -> bool {
        self.value.expose_secret().trim().is_empty()
    }

    /// Last four characters, for operator confirmation screens.
    pub fn masked(&self) -> String {
        let raw = self.value.expose_secret().trim();
        let visible: String =
            raw.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        format!("***{visible}")
    }

    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{CopayInfo, CopayLine, CopayStatus, MedDIdentifier, MedDIdentifierKind};
    use crate::domain::{product::Antigen, visit::VisitId};

    fn info(status: CopayStatus) -> CopayInfo {
        CopayInfo {
            visit_id: VisitId("V-1".to_owned()),
            lines: vec![CopayLine {
                antigen: Antigen("Zoster".to_owned()),
                status,
                copay: None,
            }],
        }
    }

    #[test]
    fn unchecked_line_requires_check_until_results_arrive() {
        let mut current = info(CopayStatus::Unchecked);
        assert!(current.requires_check(&Antigen("zoster".to_owned())));

        let mut results = info(CopayStatus::Covered);
        results.lines[0].copay = Some(Decimal::new(4_500, 2));
        current.apply_results(&results);

        assert!(!current.requires_check(&Antigen("Zoster".to_owned())));
        assert_eq!(current.total_copay(), Decimal::new(4_500, 2));
    }

    #[test]
    fn identifier_is_redacted_in_debug_output() {
        let identifier = MedDIdentifier::new(MedDIdentifierKind::Mbi, "1EG4TE5MK73");
        let debug = format!("{identifier:?}");

        assert!(!debug.contains("1EG4TE5MK73"));
        assert_eq!(identifier.masked(), "***MK73");
    }
}
