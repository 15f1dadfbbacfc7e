use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use thiserror::Error;

/// Request keys, in canonical order. The artifact's `features` list must be
/// a permutation of exactly these names.
pub const REQUIRED_KEYS: [&str; 7] = [
    "qualifying_time",
    "rain_probability",
    "temperature",
    "team_performance",
    "clean_air_pace",
    "position_change",
    "sector_time",
];

const SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read model artifact at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported artifact schema_version {0} (expected {SCHEMA_VERSION})")]
    Version(u32),
    #[error("malformed model artifact: {0}")]
    Shape(String),
}

// ---------- Fitted stages ----------

/// Median imputer: fills non-finite inputs with the per-column median
/// learned at training time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Imputer {
    pub medians: Vec<f64>,
}

impl Imputer {
    fn transform(&self, row: &mut [f64]) {
        for (x, m) in row.iter_mut().zip(&self.medians) {
            if !x.is_finite() {
                *x = *m;
            }
        }
    }
}

/// Standard scaler: (x - mean) / std, per column, with parameters learned
/// at training time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl Scaler {
    fn transform(&self, row: &mut [f64]) {
        for (i, x) in row.iter_mut().enumerate() {
            *x = (*x - self.means[i]) / self.stds[i];
        }
    }
}

// ---------- Regressor ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn eval(&self, row: &[f64]) -> Result<f64> {
        let mut node = self;
        loop {
            match node {
                TreeNode::Leaf { value } => return Ok(*value),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let Some(&x) = row.get(*feature) else {
                        bail!(
                            "tree references feature index {} but row has {} columns",
                            feature,
                            row.len()
                        );
                    };
                    node = if x <= *threshold { left } else { right };
                }
            }
        }
    }
}

/// Gradient-boosted regression trees: init + lr * sum of tree outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbmRegressor {
    pub init: f64,
    pub learning_rate: f64,
    pub trees: Vec<TreeNode>,
}

impl GbmRegressor {
    fn predict(&self, row: &[f64]) -> Result<f64> {
        let mut y = self.init;
        for tree in &self.trees {
            y += self.learning_rate * tree.eval(row)?;
        }
        Ok(y)
    }
}

// ---------- Bundle ----------

#[derive(Debug, Deserialize)]
struct ArtifactJson {
    schema_version: u32,
    features: Vec<String>,
    imputer: Imputer,
    scaler: Scaler,
    regressor: GbmRegressor,
    feature_importances: Option<Vec<f64>>,
    avg_lap_time: Option<f64>,
}

/// Everything the service needs at inference time, loaded once at startup
/// and immutable afterwards.
#[derive(Debug)]
pub struct ModelBundle {
    pub features: Vec<String>,
    imputer: Imputer,
    scaler: Scaler,
    regressor: GbmRegressor,
    pub feature_importances: Option<Vec<f64>>,
    pub avg_lap_time: Option<f64>,
}

impl ModelBundle {
    pub fn load(path: &str) -> std::result::Result<Self, LoadError> {
        let txt = fs::read_to_string(Path::new(path)).map_err(|source| LoadError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_json(&txt)
    }

    pub fn from_json(txt: &str) -> std::result::Result<Self, LoadError> {
        let art: ArtifactJson = serde_json::from_str(txt)?;

        if art.schema_version != SCHEMA_VERSION {
            return Err(LoadError::Version(art.schema_version));
        }

        // The feature list pins the column order every fitted stage was
        // trained against; a silent mismatch would produce garbage
        // predictions, so reject anything that is not a permutation of
        // the request keys.
        if art.features.len() != REQUIRED_KEYS.len() {
            return Err(LoadError::Shape(format!(
                "expected {} features, artifact has {}",
                REQUIRED_KEYS.len(),
                art.features.len()
            )));
        }
        for key in REQUIRED_KEYS {
            if !art.features.iter().any(|f| f == key) {
                return Err(LoadError::Shape(format!(
                    "artifact feature list is missing '{key}'"
                )));
            }
        }

        let n = art.features.len();
        if art.imputer.medians.len() != n {
            return Err(LoadError::Shape(format!(
                "imputer has {} medians for {} features",
                art.imputer.medians.len(),
                n
            )));
        }
        if art.scaler.means.len() != n || art.scaler.stds.len() != n {
            return Err(LoadError::Shape(format!(
                "scaler has {} means / {} stds for {} features",
                art.scaler.means.len(),
                art.scaler.stds.len(),
                n
            )));
        }
        if let Some(imp) = &art.feature_importances {
            if imp.len() != n {
                return Err(LoadError::Shape(format!(
                    "{} importances for {} features",
                    imp.len(),
                    n
                )));
            }
        }

        let mut scaler = art.scaler;
        // A constant training column stores std=0; dividing by it would
        // poison the whole row with NaN/inf.
        for s in &mut scaler.stds {
            if *s == 0.0 {
                *s = 1.0;
            }
        }

        Ok(Self {
            features: art.features,
            imputer: art.imputer,
            scaler,
            regressor: art.regressor,
            feature_importances: art.feature_importances,
            avg_lap_time: art.avg_lap_time,
        })
    }

    /// Run the full inference pipeline on a feature row already assembled
    /// in `self.features` order: impute, scale, then evaluate the ensemble.
    pub fn predict_lap_time(&self, row: &[f64]) -> Result<f64> {
        if row.len() != self.features.len() {
            bail!(
                "feature length mismatch: got {}, expected {}",
                row.len(),
                self.features.len()
            );
        }
        let mut row = row.to_vec();
        self.imputer.transform(&mut row);
        self.scaler.transform(&mut row);
        self.regressor.predict(&row)
    }

    /// A row of training medians, in feature order. Used for the startup
    /// warmup prediction.
    pub fn median_row(&self) -> Vec<f64> {
        self.imputer.medians.clone()
    }

    /// Confidence heuristic: how far the prediction sits from the
    /// training-set mean lap time, clamped to [85, 100]. This is a
    /// placeholder score, not a calibrated interval; without a stored
    /// mean it degrades to a constant 85.0.
    pub fn confidence(&self, predicted: f64) -> f64 {
        match self.avg_lap_time {
            Some(avg) => (100.0 - (predicted - avg).abs()).clamp(85.0, 100.0),
            None => 85.0,
        }
    }
}

/// Round to `digits` decimal places, matching the response contract
/// (3 for lap time, 1 for confidence).
pub fn round_to(x: f64, digits: u32) -> f64 {
    let f = 10f64.powi(digits as i32);
    (x * f).round() / f
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact_json(avg_lap_time: Option<f64>) -> String {
        let avg = match avg_lap_time {
            Some(v) => format!(r#","avg_lap_time": {v}"#),
            None => String::new(),
        };
        format!(
            r#"{{
                "schema_version": 1,
                "features": ["qualifying_time", "rain_probability", "temperature",
                             "team_performance", "clean_air_pace", "position_change",
                             "sector_time"],
                "imputer": {{"medians": [70.0, 0.1, 22.0, 0.5, 93.0, 0.0, 280.0]}},
                "scaler": {{"means": [70.0, 0.1, 22.0, 0.5, 93.0, 0.0, 280.0],
                            "stds":  [1.0, 0.05, 3.0, 0.2, 1.0, 0.8, 5.0]}},
                "regressor": {{
                    "init": 74.0,
                    "learning_rate": 0.5,
                    "trees": [
                        {{"feature": 0, "threshold": 0.0,
                          "left": {{"value": -2.0}}, "right": {{"value": 2.0}}}}
                    ]
                }},
                "feature_importances": [0.4, 0.05, 0.05, 0.1, 0.25, 0.05, 0.1]
                {avg}
            }}"#
        )
    }

    #[test]
    fn load_accepts_well_formed_artifact() {
        let b = ModelBundle::from_json(&artifact_json(Some(74.5))).unwrap();
        assert_eq!(b.features.len(), 7);
        assert_eq!(b.avg_lap_time, Some(74.5));
        assert_eq!(b.feature_importances.as_ref().unwrap().len(), 7);
    }

    #[test]
    fn load_rejects_wrong_schema_version() {
        let txt = artifact_json(None).replace(r#""schema_version": 1"#, r#""schema_version": 2"#);
        match ModelBundle::from_json(&txt) {
            Err(LoadError::Version(2)) => {}
            other => panic!("expected Version(2), got {other:?}"),
        }
    }

    #[test]
    fn load_rejects_unknown_feature_name() {
        let txt = artifact_json(None).replace("sector_time", "lap_count");
        assert!(matches!(
            ModelBundle::from_json(&txt),
            Err(LoadError::Shape(_))
        ));
    }

    #[test]
    fn load_rejects_short_median_list() {
        let mut v: serde_json::Value = serde_json::from_str(&artifact_json(None)).unwrap();
        v["imputer"]["medians"] = serde_json::json!([70.0, 0.1, 22.0]);
        assert!(matches!(
            ModelBundle::from_json(&v.to_string()),
            Err(LoadError::Shape(_))
        ));
    }

    #[test]
    fn load_rejects_missing_file() {
        assert!(matches!(
            ModelBundle::load("/nonexistent/model.json"),
            Err(LoadError::Read { .. })
        ));
    }

    #[test]
    fn load_rejects_bad_json() {
        assert!(matches!(
            ModelBundle::from_json("{not json"),
            Err(LoadError::Parse(_))
        ));
    }

    #[test]
    fn pipeline_imputes_scales_and_evaluates() {
        let b = ModelBundle::from_json(&artifact_json(Some(74.5))).unwrap();
        // qualifying_time 71.0 scales to (71-70)/1 = 1.0 > threshold 0.0,
        // so the single tree returns 2.0: 74 + 0.5*2 = 75.
        let row = [71.0, 0.1, 22.0, 0.5, 93.0, 0.0, 280.0];
        let y = b.predict_lap_time(&row).unwrap();
        assert!((y - 75.0).abs() < 1e-9);

        // NaN in the first column falls back to the median 70.0, which
        // scales to 0.0 <= threshold, left branch: 74 - 0.5*2 = 73.
        let row = [f64::NAN, 0.1, 22.0, 0.5, 93.0, 0.0, 280.0];
        let y = b.predict_lap_time(&row).unwrap();
        assert!((y - 73.0).abs() < 1e-9);
    }

    #[test]
    fn pipeline_is_deterministic() {
        let b = ModelBundle::from_json(&artifact_json(Some(74.5))).unwrap();
        let row = [70.669, 0.2, 22.0, 1.0, 93.19, -1.0, 280.5];
        let a = b.predict_lap_time(&row).unwrap();
        let c = b.predict_lap_time(&row).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn predict_rejects_wrong_row_length() {
        let b = ModelBundle::from_json(&artifact_json(None)).unwrap();
        assert!(b.predict_lap_time(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn bad_tree_feature_index_is_an_error() {
        let txt = artifact_json(None).replace(r#""feature": 0"#, r#""feature": 99"#);
        let b = ModelBundle::from_json(&txt).unwrap();
        let row = [70.0, 0.1, 22.0, 0.5, 93.0, 0.0, 280.0];
        assert!(b.predict_lap_time(&row).is_err());
    }

    #[test]
    fn empty_ensemble_predicts_init() {
        let mut v: serde_json::Value = serde_json::from_str(&artifact_json(None)).unwrap();
        v["regressor"]["trees"] = serde_json::json!([]);
        let b = ModelBundle::from_json(&v.to_string()).unwrap();
        let row = [70.0, 0.1, 22.0, 0.5, 93.0, 0.0, 280.0];
        assert!((b.predict_lap_time(&row).unwrap() - 74.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_clamps_and_defaults() {
        let with_avg = ModelBundle::from_json(&artifact_json(Some(74.0))).unwrap();
        assert!((with_avg.confidence(74.0) - 100.0).abs() < 1e-9);
        assert!((with_avg.confidence(76.5) - 97.5).abs() < 1e-9);
        assert!((with_avg.confidence(200.0) - 85.0).abs() < 1e-9);

        let without = ModelBundle::from_json(&artifact_json(None)).unwrap();
        assert!((without.confidence(50.0) - 85.0).abs() < 1e-9);
    }

    #[test]
    fn zero_std_is_neutralized_at_load() {
        let txt = artifact_json(None).replace(
            r#""stds":  [1.0, 0.05, 3.0, 0.2, 1.0, 0.8, 5.0]"#,
            r#""stds":  [1.0, 0.0, 3.0, 0.2, 1.0, 0.8, 5.0]"#,
        );
        let b = ModelBundle::from_json(&txt).unwrap();
        let row = [70.0, 0.1, 22.0, 0.5, 93.0, 0.0, 280.0];
        assert!(b.predict_lap_time(&row).unwrap().is_finite());
    }

    #[test]
    fn rounding_matches_response_contract() {
        assert_eq!(round_to(75.12349, 3), 75.123);
        assert_eq!(round_to(75.1236, 3), 75.124);
        assert_eq!(round_to(97.46, 1), 97.5);
        assert_eq!(round_to(85.0, 1), 85.0);
    }
}
