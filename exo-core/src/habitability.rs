//! Habitability narrative: prompt construction and score extraction.
//!
//! The score is scraped out of free text. The preferred form is
//! `HABITABILITY SCORE: X%`; failing that, the first percentage on the first
//! line, then the first percentage anywhere.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::ChatBackend;

fn score_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)HABITABILITY SCORE:\s*([0-9]+(?:\.[0-9]+)?)\s*%\s*").ok())
        .as_ref()
}

fn percent_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*%").ok())
        .as_ref()
}

/// Result of a habitability analysis, serialized straight into API responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HabitabilityReport {
    pub habitability_score: Option<f64>,
    pub explanation: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HabitabilityReport {
    pub fn unavailable() -> Self {
        Self {
            habitability_score: None,
            explanation: "Habitability analysis requires an OpenRouter API key".to_string(),
            success: false,
            error: Some("LLM not available".to_string()),
        }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            habitability_score: None,
            explanation: format!("Error analyzing habitability: {}", error),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Split model output into `(score, explanation)`.
pub fn parse_response(text: &str) -> (Option<f64>, String) {
    if let Some(re) = score_pattern() {
        if let Some(caps) = re.captures(text) {
            let score = caps[1].parse::<f64>().ok().map(clamp_score);
            let explanation = re.replace_all(text, "").trim().to_string();
            return (score, explanation);
        }
    }

    let first_line = text.split('\n').next().unwrap_or_default();
    let score = first_percentage(first_line).or_else(|| first_percentage(text));
    (score, text.to_string())
}

fn first_percentage(text: &str) -> Option<f64> {
    percent_pattern()?
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(clamp_score)
}

fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

fn display_value(data: &Map<String, Value>, key: &str) -> String {
    match data.get(key) {
        None | Some(Value::Null) => "N/A".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Build the comparison prompt against Earth reference values.
pub fn build_prompt(data: &Map<String, Value>) -> String {
    let v = |key: &str| display_value(data, key);
    format!(
        "You are an exoplanet habitability expert. Analyze the following exoplanet and compare it to Earth.

EARTH REFERENCE VALUES:
- Orbital Period: 365.256 days
- Planet Radius: 1.0 R_earth
- Insolation Flux: 1.0 Earth flux
- Equilibrium Temperature: 255 K
- Stellar Effective Temperature: 5772 K
- Stellar Radius: 1.0 R_sun
- Stellar Surface Gravity: 4.44 dex

EXOPLANET DATA:
- Orbital Period: {} days
- Planet Radius: {} R_earth
- Insolation Flux: {} Earth flux
- Equilibrium Temperature: {} K
- Stellar Effective Temperature: {} K
- Stellar Radius: {} R_sun
- Stellar Surface Gravity: {} dex

REQUIRED OUTPUT FORMAT:
Start your response with: \"HABITABILITY SCORE: X%\" where X is a number between 0-100.
Then provide a brief explanation (2-3 sentences) about why you gave this score, considering:
- Temperature compatibility with liquid water
- Planet size and potential for being rocky
- Radiation levels from the star
- Orbital characteristics

Be realistic - most exoplanets are NOT habitable. Only planets very similar to Earth should score above 60%.",
        v("pl_orbper"),
        v("pl_rade"),
        v("pl_insol"),
        v("pl_eqt"),
        v("st_teff"),
        v("st_rad"),
        v("st_logg"),
    )
}

/// Runs habitability analysis against an optional chat backend.
#[derive(Clone)]
pub struct HabitabilityAnalyzer {
    backend: Option<Arc<dyn ChatBackend>>,
}

impl HabitabilityAnalyzer {
    pub fn new(backend: Option<Arc<dyn ChatBackend>>) -> Self {
        Self { backend }
    }

    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Never fails: errors are folded into the report.
    pub async fn analyze(&self, data: &Map<String, Value>) -> HabitabilityReport {
        let Some(backend) = &self.backend else {
            return HabitabilityReport::unavailable();
        };

        tracing::info!(backend = backend.name(), "Analyzing habitability");
        match backend.complete(&build_prompt(data)).await {
            Ok(text) => {
                let (score, explanation) = parse_response(&text);
                if score.is_none() {
                    tracing::warn!("No habitability score found in model output");
                }
                HabitabilityReport {
                    habitability_score: score,
                    explanation,
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Habitability analysis failed");
                HabitabilityReport::failed(e)
            }
        }
    }
}
