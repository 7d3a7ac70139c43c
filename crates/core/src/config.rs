use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::copay::MedDIdentifierKind;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub features: FeatureFlags,
    pub server_calls: ServerCallConfig,
    pub copay: CopayConfig,
    pub logging: LoggingConfig,
}

/// Toggles that gate verification and payment rules. Read once per session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub right_patient_right_dose: bool,
    pub duplicate_rsv_restriction: bool,
    pub payment_mode_selection_disabled: bool,
    pub credit_card_capture_disabled: bool,
    pub restricted_duplicate_antigens: Vec<String>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            right_patient_right_dose: true,
            duplicate_rsv_restriction: true,
            payment_mode_selection_disabled: false,
            credit_card_capture_disabled: false,
            restricted_duplicate_antigens: vec!["RSV".to_string()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerCallConfig {
    pub slow_notice_secs: u64,
    pub hard_timeout_secs: u64,
    pub max_user_retries: u32,
}

impl ServerCallConfig {
    pub fn slow_notice(&self) -> Duration {
        Duration::from_secs(self.slow_notice_secs)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }
}

#[derive(Clone, Debug)]
pub struct CopayConfig {
    pub medd_identifier: MedDIdentifierKind,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub right_patient_right_dose: Option<bool>,
    pub payment_mode_selection_disabled: Option<bool>,
    pub credit_card_capture_disabled: Option<bool>,
    pub hard_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            features: FeatureFlags::default(),
            server_calls: ServerCallConfig {
                slow_notice_secs: 5,
                hard_timeout_secs: 10,
                max_user_retries: 1,
            },
            copay: CopayConfig { medd_identifier: MedDIdentifierKind::Mbi },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl std::str::FromStr for MedDIdentifierKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mbi" => Ok(Self::Mbi),
            "ssn" => Ok(Self::Ssn),
            other => Err(ConfigError::Validation(format!(
                "unsupported copay.medd_identifier `{other}` (expected mbi|ssn)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("dosecheck.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(features) = patch.features {
            if let Some(value) = features.right_patient_right_dose {
                self.features.right_patient_right_dose = value;
            }
            if let Some(value) = features.duplicate_rsv_restriction {
                self.features.duplicate_rsv_restriction = value;
            }
            if let Some(value) = features.payment_mode_selection_disabled {
                self.features.payment_mode_selection_disabled = value;
            }
            if let Some(value) = features.credit_card_capture_disabled {
                self.features.credit_card_capture_disabled = value;
            }
            if let Some(antigens) = features.restricted_duplicate_antigens {
                self.features.restricted_duplicate_antigens = antigens;
            }
        }

        if let Some(server_calls) = patch.server_calls {
            if let Some(slow_notice_secs) = server_calls.slow_notice_secs {
                self.server_calls.slow_notice_secs = slow_notice_secs;
            }
            if let Some(hard_timeout_secs) = server_calls.hard_timeout_secs {
                self.server_calls.hard_timeout_secs = hard_timeout_secs;
            }
            if let Some(max_user_retries) = server_calls.max_user_retries {
                self.server_calls.max_user_retries = max_user_retries;
            }
        }

        if let Some(copay) = patch.copay {
            if let Some(medd_identifier) = copay.medd_identifier {
                self.copay.medd_identifier = medd_identifier;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DOSECHECK_FEATURES_RIGHT_PATIENT_RIGHT_DOSE") {
            self.features.right_patient_right_dose =
                parse_bool("DOSECHECK_FEATURES_RIGHT_PATIENT_RIGHT_DOSE", &value)?;
        }
        if let Some(value) = read_env("DOSECHECK_FEATURES_DUPLICATE_RSV_RESTRICTION") {
            self.features.duplicate_rsv_restriction =
                parse_bool("DOSECHECK_FEATURES_DUPLICATE_RSV_RESTRICTION", &value)?;
        }
        if let Some(value) = read_env("DOSECHECK_FEATURES_PAYMENT_MODE_SELECTION_DISABLED") {
            self.features.payment_mode_selection_disabled =
                parse_bool("DOSECHECK_FEATURES_PAYMENT_MODE_SELECTION_DISABLED", &value)?;
        }
        if let Some(value) = read_env("DOSECHECK_FEATURES_CREDIT_CARD_CAPTURE_DISABLED") {
            self.features.credit_card_capture_disabled =
                parse_bool("DOSECHECK_FEATURES_CREDIT_CARD_CAPTURE_DISABLED", &value)?;
        }
        if let Some(value) = read_env("DOSECHECK_FEATURES_RESTRICTED_DUPLICATE_ANTIGENS") {
            self.features.restricted_duplicate_antigens = value
                .split(',')
                .map(str::trim)
                .filter(|antigen| !antigen.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(value) = read_env("DOSECHECK_SERVER_CALLS_SLOW_NOTICE_SECS") {
            self.server_calls.slow_notice_secs =
                parse_u64("DOSECHECK_SERVER_CALLS_SLOW_NOTICE_SECS", &value)?;
        }
        if let Some(value) = read_env("DOSECHECK_SERVER_CALLS_HARD_TIMEOUT_SECS") {
            self.server_calls.hard_timeout_secs =
                parse_u64("DOSECHECK_SERVER_CALLS_HARD_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DOSECHECK_SERVER_CALLS_MAX_USER_RETRIES") {
            self.server_calls.max_user_retries =
                parse_u32("DOSECHECK_SERVER_CALLS_MAX_USER_RETRIES", &value)?;
        }

        if let Some(value) = read_env("DOSECHECK_COPAY_MEDD_IDENTIFIER") {
            self.copay.medd_identifier = value.parse()?;
        }

        let log_level =
            read_env("DOSECHECK_LOGGING_LEVEL").or_else(|| read_env("DOSECHECK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DOSECHECK_LOGGING_FORMAT").or_else(|| read_env("DOSECHECK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(value) = overrides.right_patient_right_dose {
            self.features.right_patient_right_dose = value;
        }
        if let Some(value) = overrides.payment_mode_selection_disabled {
            self.features.payment_mode_selection_disabled = value;
        }
        if let Some(value) = overrides.credit_card_capture_disabled {
            self.features.credit_card_capture_disabled = value;
        }
        if let Some(hard_timeout_secs) = overrides.hard_timeout_secs {
            self.server_calls.hard_timeout_secs = hard_timeout_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_features(&self.features)?;
        validate_server_calls(&self.server_calls)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("dosecheck.toml"), PathBuf::from("config/dosecheck.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_features(features: &FeatureFlags) -> Result<(), ConfigError> {
    if features.duplicate_rsv_restriction && features.restricted_duplicate_antigens.is_empty() {
        return Err(ConfigError::Validation(
            "features.duplicate_rsv_restriction is enabled but features.restricted_duplicate_antigens is empty"
                .to_string(),
        ));
    }

    if features.restricted_duplicate_antigens.iter().any(|antigen| antigen.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "features.restricted_duplicate_antigens must not contain blank entries".to_string(),
        ));
    }

    Ok(())
}

fn validate_server_calls(server_calls: &ServerCallConfig) -> Result<(), ConfigError> {
    if server_calls.slow_notice_secs == 0 {
        return Err(ConfigError::Validation(
            "server_calls.slow_notice_secs must be greater than zero".to_string(),
        ));
    }

    if server_calls.hard_timeout_secs <= server_calls.slow_notice_secs
        || server_calls.hard_timeout_secs > 120
    {
        return Err(ConfigError::Validation(format!(
            "server_calls.hard_timeout_secs must be in range {}..=120 (above slow_notice_secs)",
            server_calls.slow_notice_secs + 1
        )));
    }

    if server_calls.max_user_retries > 3 {
        return Err(ConfigError::Validation(
            "server_calls.max_user_retries must be in range 0..=3".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    features: Option<FeaturesPatch>,
    server_calls: Option<ServerCallsPatch>,
    copay: Option<CopayPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct FeaturesPatch {
    right_patient_right_dose: Option<bool>,
    duplicate_rsv_restriction: Option<bool>,
    payment_mode_selection_disabled: Option<bool>,
    credit_card_capture_disabled: Option<bool>,
    restricted_duplicate_antigens: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerCallsPatch {
    slow_notice_secs: Option<u64>,
    hard_timeout_secs: Option<u64>,
    max_user_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CopayPatch {
    medd_identifier: Option<MedDIdentifierKind>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
    use crate::domain::copay::MedDIdentifierKind;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_observed_server_thresholds() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.server_calls.slow_notice_secs == 5, "slow notice should default to 5s")?;
        ensure(config.server_calls.hard_timeout_secs == 10, "hard timeout should default to 10s")?;
        ensure(config.server_calls.max_user_retries == 1, "one user retry by default")?;
        ensure(config.features.right_patient_right_dose, "rprd should default on")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_DOSECHECK_LEVEL", "debug");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("dosecheck.toml");
            fs::write(
                &path,
                r#"
[logging]
level = "${TEST_DOSECHECK_LEVEL}"

[features]
restricted_duplicate_antigens = ["RSV", "COVID-19"]
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "debug", "level should be interpolated from env")?;
            ensure(
                config.features.restricted_duplicate_antigens.len() == 2,
                "antigen list should come from the file",
            )
        })();

        clear_vars(&["TEST_DOSECHECK_LEVEL"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DOSECHECK_FEATURES_PAYMENT_MODE_SELECTION_DISABLED", "true");
        env::set_var("DOSECHECK_SERVER_CALLS_HARD_TIMEOUT_SECS", "20");
        env::set_var("DOSECHECK_COPAY_MEDD_IDENTIFIER", "ssn");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("dosecheck.toml");
            fs::write(
                &path,
                r#"
[features]
payment_mode_selection_disabled = false
right_patient_right_dose = false

[server_calls]
hard_timeout_secs = 15

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    log_level: Some("debug".to_string()),
                    hard_timeout_secs: Some(30),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(!config.features.right_patient_right_dose, "file value should beat default")?;
            ensure(
                config.features.payment_mode_selection_disabled,
                "env value should beat file value",
            )?;
            ensure(config.server_calls.hard_timeout_secs == 30, "override should win over env")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.copay.medd_identifier == MedDIdentifierKind::Ssn,
                "identifier kind should come from env",
            )
        })();

        clear_vars(&[
            "DOSECHECK_FEATURES_PAYMENT_MODE_SELECTION_DISABLED",
            "DOSECHECK_SERVER_CALLS_HARD_TIMEOUT_SECS",
            "DOSECHECK_COPAY_MEDD_IDENTIFIER",
        ]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DOSECHECK_LOG_LEVEL", "warn");
        env::set_var("DOSECHECK_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )
        })();

        clear_vars(&["DOSECHECK_LOG_LEVEL", "DOSECHECK_LOG_FORMAT"]);
        result
    }

    #[test]
    fn hard_timeout_must_exceed_slow_notice() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DOSECHECK_SERVER_CALLS_HARD_TIMEOUT_SECS", "5");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message)
                    if message.contains("server_calls.hard_timeout_secs")
            );
            ensure(has_message, "validation failure should mention server_calls.hard_timeout_secs")
        })();

        clear_vars(&["DOSECHECK_SERVER_CALLS_HARD_TIMEOUT_SECS"]);
        result
    }

    #[test]
    fn malformed_boolean_env_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DOSECHECK_FEATURES_RIGHT_PATIENT_RIGHT_DOSE", "sometimes");

        let result = (|| -> Result<(), String> {
            let rejected = matches!(
                AppConfig::load(LoadOptions::default()),
                Err(ConfigError::InvalidEnvOverride { ref key, .. })
                    if key == "DOSECHECK_FEATURES_RIGHT_PATIENT_RIGHT_DOSE"
            );
            ensure(rejected, "non-boolean flag value should be rejected")
        })();

        clear_vars(&["DOSECHECK_FEATURES_RIGHT_PATIENT_RIGHT_DOSE"]);
        result
    }
}
