//! Settings for the recalculation service
//!
//! Stored as JSON; a missing file yields [`Settings::default`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::cashflow::default_min_date;
use crate::currency::FixedRates;
use crate::error::{CoreError, CoreResult};

const APP_DIR: &str = "portfolio-tracker";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub base_currency: String,
    /// currency -> units of base currency, used when no stored rate exists
    pub fallback_rates: HashMap<String, f64>,
    /// Cash-flow rows on or before this date are ignored
    pub min_flow_date: NaiveDate,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: app_data_dir().join("portfolio.db"),
            base_currency: "KWD".to_string(),
            fallback_rates: HashMap::from([("USD".to_string(), 0.307)]),
            min_flow_date: default_min_date(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> CoreResult<()> {
        let currency = self.base_currency.trim();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CoreError::InvalidSettings(format!(
                "base currency must be a 3-letter code, got {:?}",
                self.base_currency
            )));
        }

        let invalid_rate = self.fallback_rates.iter().find(|(_, r)| !r.is_finite() || **r <= 0.0);
        if let Some((code, rate)) = invalid_rate {
            return Err(CoreError::InvalidSettings(format!(
                "fallback rate for {} must be positive, got {}",
                code, rate
            )));
        }

        Ok(())
    }

    pub fn fallback_rates(&self) -> FixedRates {
        self.fallback_rates
            .iter()
            .fold(FixedRates::new(&self.base_currency), |rates, (code, rate)| {
                rates.with_rate(code, *rate)
            })
    }
}

fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// `<data dir>/portfolio-tracker/settings.json`
pub fn default_path() -> PathBuf {
    app_data_dir().join(SETTINGS_FILE)
}

/// Load settings from `path`, or from [`default_path`] when `None`
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_path);

    if !path.exists() {
        log::info!("No settings at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read settings: {}", path.display()))?;
    let settings: Settings = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse settings: {}", path.display()))?;
    settings.validate()?;

    Ok(settings)
}

pub fn save(settings: &Settings, path: &Path) -> Result<()> {
    settings.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;

    Ok(())
}
