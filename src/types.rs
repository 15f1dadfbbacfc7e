use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::model::REQUIRED_KEYS;

// ---------- Request/Response types ----------

/// Raw /predict body. Every field is kept optional so that validation can
/// report the full list of missing keys instead of failing on the first,
/// and values arrive as raw JSON so numeric strings can be coerced the
/// same way the keys-present check runs.
#[derive(Debug, Default, Deserialize)]
pub struct PredictionRequest {
    pub qualifying_time: Option<Value>,
    pub rain_probability: Option<Value>,
    pub temperature: Option<Value>,
    pub team_performance: Option<Value>,
    pub clean_air_pace: Option<Value>,
    pub position_change: Option<Value>,
    pub sector_time: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    pub predicted_lap_time: f64,
    pub confidence: f64,
}

#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    pub features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importances: Option<Vec<f64>>,
}

/// The validated, unit-normalized inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFeatures {
    pub qualifying_time: f64,
    pub rain_probability: f64,
    pub temperature: f64,
    pub team_performance: f64,
    pub clean_air_pace: f64,
    pub position_change: f64,
    pub sector_time: f64,
}

impl RawFeatures {
    /// Value for a feature by its artifact name.
    pub fn get(&self, key: &str) -> Option<f64> {
        match key {
            "qualifying_time" => Some(self.qualifying_time),
            "rain_probability" => Some(self.rain_probability),
            "temperature" => Some(self.temperature),
            "team_performance" => Some(self.team_performance),
            "clean_air_pace" => Some(self.clean_air_pace),
            "position_change" => Some(self.position_change),
            "sector_time" => Some(self.sector_time),
            _ => None,
        }
    }

    /// Assemble the feature row in the column order the model was fitted
    /// against. Returns None if `features` names a key we do not carry
    /// (ruled out at artifact load time).
    pub fn ordered_row(&self, features: &[String]) -> Option<Vec<f64>> {
        features.iter().map(|f| self.get(f)).collect()
    }
}

// ---------- Validation ----------

fn coerce(key: &str, v: &Value) -> Result<f64, ApiError> {
    let parsed = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ApiError::BadValue {
        key: key.to_string(),
        detail: format!("{v} is not numeric"),
    })
}

impl PredictionRequest {
    fn field(&self, key: &str) -> Option<&Value> {
        match key {
            "qualifying_time" => self.qualifying_time.as_ref(),
            "rain_probability" => self.rain_probability.as_ref(),
            "temperature" => self.temperature.as_ref(),
            "team_performance" => self.team_performance.as_ref(),
            "clean_air_pace" => self.clean_air_pace.as_ref(),
            "position_change" => self.position_change.as_ref(),
            "sector_time" => self.sector_time.as_ref(),
            _ => None,
        }
    }

    /// Check all seven keys are present and numeric-coercible. Missing
    /// keys are reported together, in canonical order, to preserve the
    /// `Missing keys: a, b` error contract.
    pub fn validate(&self) -> Result<RawFeatures, ApiError> {
        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|k| self.field(k).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ApiError::MissingKeys(missing.join(", ")));
        }

        let get = |key: &str| -> Result<f64, ApiError> {
            // Presence was just checked.
            match self.field(key) {
                Some(v) => coerce(key, v),
                None => Err(ApiError::MissingKeys(key.to_string())),
            }
        };

        Ok(RawFeatures {
            qualifying_time: get("qualifying_time")?,
            // Clients send rain probability as a percentage (0-100); the
            // scaler was fitted on unit fractions, so convert here. Keep
            // this in sync with the training pipeline.
            rain_probability: get("rain_probability")? / 100.0,
            temperature: get("temperature")?,
            team_performance: get("team_performance")?,
            clean_air_pace: get("clean_air_pace")?,
            position_change: get("position_change")?,
            sector_time: get("sector_time")?,
        })
    }
}
