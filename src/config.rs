use std::env;
use std::path::PathBuf;
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_PCT_DIGITS: usize = 1;
const MAX_PCT_DIGITS: usize = 6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    telemetry: TelemetrySettings,
    workspace: Option<PathBuf>,
    pct_digits: usize,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let log_level = get("GRADEBOOKD_LOG").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        let json = get("GRADEBOOKD_LOG_JSON")
            .map(|value| parse_bool(&value))
            .unwrap_or(false);
        let workspace = get("GRADEBOOKD_WORKSPACE").map(PathBuf::from);
        let pct_digits = match get("GRADEBOOKD_PCT_DIGITS") {
            None => DEFAULT_PCT_DIGITS,
            Some(value) => parse_digits("GRADEBOOKD_PCT_DIGITS", value)?,
        };

        Ok(Self {
            telemetry: TelemetrySettings { log_level, json },
            workspace,
            pct_digits,
        })
    }

    pub fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub fn workspace(&self) -> Option<&PathBuf> {
        self.workspace.as_ref()
    }

    pub fn pct_digits(&self) -> usize {
        self.pct_digits
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            telemetry: TelemetrySettings {
                log_level: DEFAULT_LOG_LEVEL.to_string(),
                json: false,
            },
            workspace: None,
            pct_digits: DEFAULT_PCT_DIGITS,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn parse_digits(field: &'static str, value: String) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(n) if n <= MAX_PCT_DIGITS => Ok(n),
        _ => Err(ConfigError::InvalidValue { field, value }),
    }
}
