use crate::access::PaymentSettings;
use crate::detector::DetectorSettings;
use crate::error::ConfigError;
use crate::normalize::{
    Layout, PlateGrammar, DEFAULT_REGION_CODES, NATIONAL_SERIES_LAYOUT, STATE_SERIES_LAYOUT,
};
use crate::selector::SelectorSettings;
use std::collections::HashSet;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Everything read from the environment at startup. There is no reload.
#[derive(Clone, Debug)]
pub struct Config {
    pub backend_url: Url,
    pub payment: PaymentSettings,
    pub grammar: PlateGrammar,
    pub selector: SelectorSettings,
    pub http_timeout: Duration,
    pub drain_timeout: Duration,
    pub detector: DetectorSettings,
    pub device_name: String,
    pub ocr_url: Url,
    pub listen_port: u16,
    pub journal_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let backend_url = url(&lookup, "BACKEND_URL", "http://localhost:4000/")?;
        let ocr_url = url(&lookup, "OCR_URL", "http://localhost:8500/recognize")?;

        let fee: f64 = parsed(&lookup, "PAYMENT_FEE", 50.0)?;
        if !(fee.is_finite() && fee > 0.0) {
            return Err(ConfigError::invalid("PAYMENT_FEE", &fee.to_string(), "must be positive"));
        }
        let poll_secs: u64 = parsed(&lookup, "POLL_INTERVAL_SECS", 5)?;
        let max_poll_attempts: u32 = parsed(&lookup, "MAX_POLL_ATTEMPTS", 60)?;
        if poll_secs == 0 || max_poll_attempts == 0 {
            return Err(ConfigError::invalid(
                "POLL_INTERVAL_SECS/MAX_POLL_ATTEMPTS",
                &format!("{}/{}", poll_secs, max_poll_attempts),
                "must both be at least 1",
            ));
        }

        let length: usize = parsed(&lookup, "PLATE_LENGTH", 10)?;
        let min_raw_length: usize = parsed(&lookup, "PLATE_MIN_RAW_LENGTH", 8)?;
        let layouts = get(
            "PLATE_LAYOUTS",
            &format!("{},{}", STATE_SERIES_LAYOUT, NATIONAL_SERIES_LAYOUT),
        )
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(Layout::parse)
        .collect::<Result<Vec<_>, _>>()?;
        let region_codes: HashSet<String> = get("PLATE_REGIONS", &DEFAULT_REGION_CODES.join(","))
            .split(',')
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();
        if let Some(code) = region_codes
            .iter()
            .find(|c| c.len() != 2 || !c.bytes().all(|b| b.is_ascii_uppercase()))
        {
            return Err(ConfigError::invalid(
                "PLATE_REGIONS",
                code,
                "region codes are two letters",
            ));
        }
        let grammar = PlateGrammar::new(length, min_raw_length, layouts, region_codes)?;

        let min_confidence: f32 = parsed(&lookup, "MIN_CONFIDENCE", 0.3)?;
        let high_confidence: f32 = parsed(&lookup, "HIGH_CONFIDENCE", 0.99)?;
        if !(0.0..=1.0).contains(&min_confidence)
            || !(0.0..=1.0).contains(&high_confidence)
            || min_confidence > high_confidence
        {
            return Err(ConfigError::invalid(
                "MIN_CONFIDENCE/HIGH_CONFIDENCE",
                &format!("{}/{}", min_confidence, high_confidence),
                "need 0 <= min <= high <= 1",
            ));
        }

        let action_confidence: f32 = parsed(&lookup, "ACTION_CONFIDENCE", high_confidence)?;
        if !(min_confidence..=1.0).contains(&action_confidence) {
            return Err(ConfigError::invalid(
                "ACTION_CONFIDENCE",
                &action_confidence.to_string(),
                "need MIN_CONFIDENCE <= action <= 1",
            ));
        }

        let frame_stride: u32 = parsed(&lookup, "FRAME_STRIDE", 5)?;
        if frame_stride == 0 {
            return Err(ConfigError::invalid("FRAME_STRIDE", "0", "must be at least 1"));
        }

        let http_secs: u64 = parsed(&lookup, "HTTP_TIMEOUT_SECS", 5)?;
        if http_secs == 0 {
            return Err(ConfigError::invalid("HTTP_TIMEOUT_SECS", "0", "must be at least 1"));
        }
        let drain_secs: u64 = parsed(&lookup, "DRAIN_TIMEOUT_SECS", 2)?;
        if drain_secs == 0 {
            return Err(ConfigError::invalid("DRAIN_TIMEOUT_SECS", "0", "must be at least 1"));
        }

        Ok(Config {
            backend_url,
            payment: PaymentSettings {
                fee,
                poll_interval: Duration::from_secs(poll_secs),
                max_poll_attempts,
            },
            grammar,
            selector: SelectorSettings {
                min_confidence,
                high_confidence,
            },
            http_timeout: Duration::from_secs(http_secs),
            drain_timeout: Duration::from_secs(drain_secs),
            detector: DetectorSettings {
                frame_stride,
                action_confidence,
            },
            device_name: get("DEVICE_NAME", "gate-camera"),
            ocr_url,
            listen_port: parsed(&lookup, "LISTEN_PORT", 8402)?,
            journal_path: get("JOURNAL_PATH", "/data/gate.db"),
        })
    }
}

fn parsed<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| ConfigError::invalid(name, &value, e)),
        None => Ok(default),
    }
}

fn url<F>(lookup: &F, name: &'static str, default: &str) -> Result<Url, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(name).unwrap_or_else(|| default.to_string());
    let parsed = Url::parse(&value).map_err(|e| ConfigError::invalid(name, &value, e))?;
    if parsed.cannot_be_a_base() {
        return Err(ConfigError::invalid(name, &value, "not a base URL"));
    }
    Ok(parsed)
}
