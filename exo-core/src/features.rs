//! Feature catalogue and request validation.
//!
//! The classifier expects a fixed, ordered list of numeric measurements. The order
//! comes from the persisted feature-name artifact; this module only knows how to
//! label them and how to pull them out of a JSON request body.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),

    #[error("Missing features: {}", .0.join(", "))]
    Missing(Vec<String>),
}

/// Display metadata for a single feature.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FeatureMeta {
    pub name: String,
    pub label: String,
    pub group: String,
}

const METADATA: &[(&str, &str, &str)] = &[
    ("ra", "Right Ascension (deg)", "Position"),
    ("dec", "Declination (deg)", "Position"),
    ("st_pmra", "Proper Motion RA (mas/yr)", "Stellar Motion"),
    ("st_pmraerr1", "PM RA Error +", "Stellar Motion"),
    ("st_pmraerr2", "PM RA Error -", "Stellar Motion"),
    ("st_pmdec", "Proper Motion Dec (mas/yr)", "Stellar Motion"),
    ("st_pmdecerr1", "PM Dec Error +", "Stellar Motion"),
    ("st_pmdecerr2", "PM Dec Error -", "Stellar Motion"),
    ("pl_tranmid", "Transit Midpoint (BJD)", "Transit Properties"),
    ("pl_tranmiderr1", "Transit Mid Error +", "Transit Properties"),
    ("pl_tranmiderr2", "Transit Mid Error -", "Transit Properties"),
    ("pl_orbper", "Orbital Period (days)", "Orbital Properties"),
    ("pl_orbpererr1", "Orbital Period Error +", "Orbital Properties"),
    ("pl_orbpererr2", "Orbital Period Error -", "Orbital Properties"),
    ("pl_trandurh", "Transit Duration (hours)", "Transit Properties"),
    ("pl_trandurherr1", "Transit Duration Error +", "Transit Properties"),
    ("pl_trandurherr2", "Transit Duration Error -", "Transit Properties"),
    ("pl_trandep", "Transit Depth (ppm)", "Transit Properties"),
    ("pl_trandeperr1", "Transit Depth Error +", "Transit Properties"),
    ("pl_trandeperr2", "Transit Depth Error -", "Transit Properties"),
    ("pl_rade", "Planet Radius (Earth radii)", "Planet Properties"),
    ("pl_radeerr1", "Planet Radius Error +", "Planet Properties"),
    ("pl_radeerr2", "Planet Radius Error -", "Planet Properties"),
    ("pl_insol", "Insolation Flux (Earth flux)", "Planet Properties"),
    ("pl_eqt", "Equilibrium Temperature (K)", "Planet Properties"),
    ("st_tmag", "TESS Magnitude", "Stellar Properties"),
    ("st_tmagerr1", "TESS Mag Error +", "Stellar Properties"),
    ("st_tmagerr2", "TESS Mag Error -", "Stellar Properties"),
    ("st_dist", "Distance (pc)", "Stellar Properties"),
    ("st_disterr1", "Distance Error +", "Stellar Properties"),
    ("st_disterr2", "Distance Error -", "Stellar Properties"),
    ("st_teff", "Effective Temperature (K)", "Stellar Properties"),
    ("st_tefferr1", "Eff. Temp Error +", "Stellar Properties"),
    ("st_tefferr2", "Eff. Temp Error -", "Stellar Properties"),
    ("st_logg", "Surface Gravity (log g)", "Stellar Properties"),
    ("st_loggerr1", "Surface Gravity Error +", "Stellar Properties"),
    ("st_loggerr2", "Surface Gravity Error -", "Stellar Properties"),
    ("st_rad", "Stellar Radius (Solar radii)", "Stellar Properties"),
    ("st_raderr1", "Stellar Radius Error +", "Stellar Properties"),
    ("st_raderr2", "Stellar Radius Error -", "Stellar Properties"),
];

/// Look up the label and group for `name`. Unknown features land in "Other".
pub fn feature_metadata(name: &str) -> FeatureMeta {
    match METADATA.iter().find(|(n, _, _)| *n == name) {
        Some((_, label, group)) => FeatureMeta {
            name: name.to_string(),
            label: label.to_string(),
            group: group.to_string(),
        },
        None => FeatureMeta {
            name: name.to_string(),
            label: name.to_string(),
            group: "Other".to_string(),
        },
    }
}

/// Coerce a JSON value to `f64`: numbers, numeric strings and booleans.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Extract the feature vector for `names` from a request body.
///
/// The first present-but-invalid value aborts immediately. Otherwise every
/// missing name is collected and reported together, in feature order.
pub fn extract_features(names: &[String], data: &Map<String, Value>) -> Result<Vec<f64>, FeatureError> {
    let mut values = Vec::with_capacity(names.len());
    let mut missing = Vec::new();

    for name in names {
        match data.get(name) {
            Some(raw) => match coerce_f64(raw) {
                Some(v) => values.push(v),
                None => return Err(FeatureError::InvalidValue(name.clone())),
            },
            None => missing.push(name.clone()),
        }
    }

    if !missing.is_empty() {
        return Err(FeatureError::Missing(missing));
    }

    Ok(values)
}
