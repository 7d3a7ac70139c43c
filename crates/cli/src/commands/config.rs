use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dosecheck_core::config::{AppConfig, LoadOptions};
use dosecheck_core::domain::copay::MedDIdentifierKind;
use toml::Value;

use super::CommandResult;

struct Field {
    key: &'static str,
    env_key: &'static str,
    value: String,
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "configuration",
                format!("config validation failed: {error}"),
                2,
            )
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    CommandResult::raw(0, lines.join("\n"))
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let features = &config.features;
    let server_calls = &config.server_calls;
    let medd_identifier = match config.copay.medd_identifier {
        MedDIdentifierKind::Mbi => "mbi",
        MedDIdentifierKind::Ssn => "ssn",
    };

    vec![
        Field {
            key: "features.right_patient_right_dose",
            env_key: "DOSECHECK_FEATURES_RIGHT_PATIENT_RIGHT_DOSE",
            value: features.right_patient_right_dose.to_string(),
        },
        Field {
            key: "features.duplicate_rsv_restriction",
            env_key: "DOSECHECK_FEATURES_DUPLICATE_RSV_RESTRICTION",
            value: features.duplicate_rsv_restriction.to_string(),
        },
        Field {
            key: "features.payment_mode_selection_disabled",
            env_key: "DOSECHECK_FEATURES_PAYMENT_MODE_SELECTION_DISABLED",
            value: features.payment_mode_selection_disabled.to_string(),
        },
        Field {
            key: "features.credit_card_capture_disabled",
            env_key: "DOSECHECK_FEATURES_CREDIT_CARD_CAPTURE_DISABLED",
            value: features.credit_card_capture_disabled.to_string(),
        },
        Field {
            key: "features.restricted_duplicate_antigens",
            env_key: "DOSECHECK_FEATURES_RESTRICTED_DUPLICATE_ANTIGENS",
            value: features.restricted_duplicate_antigens.join(","),
        },
        Field {
            key: "server_calls.slow_notice_secs",
            env_key: "DOSECHECK_SERVER_CALLS_SLOW_NOTICE_SECS",
            value: server_calls.slow_notice_secs.to_string(),
        },
        Field {
            key: "server_calls.hard_timeout_secs",
            env_key: "DOSECHECK_SERVER_CALLS_HARD_TIMEOUT_SECS",
            value: server_calls.hard_timeout_secs.to_string(),
        },
        Field {
            key: "server_calls.max_user_retries",
            env_key: "DOSECHECK_SERVER_CALLS_MAX_USER_RETRIES",
            value: server_calls.max_user_retries.to_string(),
        },
        Field {
            key: "copay.medd_identifier",
            env_key: "DOSECHECK_COPAY_MEDD_IDENTIFIER",
            value: medd_identifier.to_string(),
        },
        Field {
            key: "logging.level",
            env_key: "DOSECHECK_LOGGING_LEVEL",
            value: config.logging.level.clone(),
        },
        Field {
            key: "logging.format",
            env_key: "DOSECHECK_LOGGING_FORMAT",
            value: format!("{:?}", config.logging.format),
        },
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("dosecheck.toml"), PathBuf::from("config/dosecheck.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var(env_key).is_ok_and(|value| !value.trim().is_empty()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
