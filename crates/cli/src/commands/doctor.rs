use dosecheck_core::collaborators::{ScriptedStockService, StockService};
use dosecheck_core::config::{AppConfig, LoadOptions};
use dosecheck_core::domain::product::InventorySource;
use dosecheck_core::domain::visit::VisitId;
use dosecheck_core::ServerCallPolicy;
use serde::Serialize;

use super::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = exit_code(&report);

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return CommandResult::raw(exit_code, output);
    }

    CommandResult::raw(exit_code, render_human(&report))
}

fn exit_code(report: &DoctorReport) -> u8 {
    let config_failed = report
        .checks
        .iter()
        .any(|check| check.name == "config_validation" && check.status == CheckStatus::Fail);
    match report.overall_status {
        CheckStatus::Pass => 0,
        _ if config_failed => 2,
        _ => 1,
    }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_feature_flags(&config));
            checks.push(check_server_call_policy(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.push(DoctorCheck {
                name: "feature_flag_coherence",
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            });
            checks.push(DoctorCheck {
                name: "server_call_policy",
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            });
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_feature_flags(config: &AppConfig) -> DoctorCheck {
    let features = &config.features;
    let restricts_rsv = features
        .restricted_duplicate_antigens
        .iter()
        .any(|antigen| antigen.trim().eq_ignore_ascii_case("rsv"));

    if features.duplicate_rsv_restriction && !restricts_rsv {
        return DoctorCheck {
            name: "feature_flag_coherence",
            status: CheckStatus::Fail,
            details: "features.duplicate_rsv_restriction is on but RSV is not in features.restricted_duplicate_antigens"
                .to_string(),
        };
    }

    let mut notes = Vec::new();
    if !features.right_patient_right_dose {
        notes.push("reason collection skips doses not ordered");
    }
    if features.payment_mode_selection_disabled {
        notes.push("every dose checks out as partner bill");
    }
    if features.credit_card_capture_disabled {
        notes.push("self-pay groups carry no card capture");
    }
    let details = if notes.is_empty() {
        "feature flags are coherent".to_string()
    } else {
        format!("feature flags are coherent; {}", notes.join("; "))
    };

    DoctorCheck { name: "feature_flag_coherence", status: CheckStatus::Pass, details }
}

fn check_server_call_policy(config: &AppConfig) -> DoctorCheck {
    let policy = ServerCallPolicy::from(&config.server_calls);
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "server_call_policy",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    // An immediate stock change must land well inside the slow-notice window.
    let stock = ScriptedStockService::default();
    let visit_id = VisitId("doctor-check".to_string());
    let result = runtime.block_on(async {
        tokio::time::timeout(
            policy.slow_notice,
            stock.change_stock(&visit_id, InventorySource::Private),
        )
        .await
    });

    match result {
        Ok(Ok(())) => DoctorCheck {
            name: "server_call_policy",
            status: CheckStatus::Pass,
            details: format!(
                "slow notice after {}s, hard timeout after {}s, {} user retr{} per dose",
                policy.slow_notice.as_secs(),
                policy.hard_timeout.as_secs(),
                config.server_calls.max_user_retries,
                if config.server_calls.max_user_retries == 1 { "y" } else { "ies" }
            ),
        },
        Ok(Err(error)) => DoctorCheck {
            name: "server_call_policy",
            status: CheckStatus::Fail,
            details: format!("stock call failed: {error}"),
        },
        Err(_) => DoctorCheck {
            name: "server_call_policy",
            status: CheckStatus::Fail,
            details: "stock call did not finish inside the slow-notice window".to_string(),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
