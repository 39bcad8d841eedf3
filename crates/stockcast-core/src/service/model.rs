use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::PredictionError;

pub const STOCK_MODEL: &str = "stock_price_predictor_model";

/// Precomputed linear regression artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub features: Vec<String>,
    pub coefficients: Vec<f64>,
    #[serde(default)]
    pub intercept: f64,
}

impl LinearModel {
    fn validate(&self) -> Result<(), String> {
        if self.features.is_empty() {
            return Err("model has no features".to_string());
        }
        if self.features.len() != self.coefficients.len() {
            return Err(format!(
                "{} features but {} coefficients",
                self.features.len(),
                self.coefficients.len()
            ));
        }
        Ok(())
    }

    /// Evaluate against named inputs. Every model feature must be supplied.
    pub fn predict(&self, inputs: &[(&str, f64)]) -> Result<f64, PredictionError> {
        let mut total = self.intercept;
        for (feature, coef) in self.features.iter().zip(&self.coefficients) {
            let value = inputs
                .iter()
                .find(|(name, _)| name == feature)
                .map(|(_, v)| *v)
                .ok_or_else(|| PredictionError::Evaluation(format!("missing feature {feature}")))?;
            total += coef * value;
        }
        if total.is_finite() {
            Ok(total)
        } else {
            Err(PredictionError::Evaluation("non-finite result".to_string()))
        }
    }
}

/// Loads `{dir}/{name}.json` model files, once each.
pub struct ModelStore {
    dir: PathBuf,
    cache: DashMap<String, Arc<LinearModel>>,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, name: &str) -> Result<Arc<LinearModel>, PredictionError> {
        if let Some(model) = self.cache.get(name) {
            return Ok(model.clone());
        }

        let path = self.dir.join(format!("{name}.json"));
        let model = read_model(&path).map_err(|e| {
            error!("Error loading model {}: {}", path.display(), e);
            PredictionError::ModelLoad(e)
        })?;
        info!("Loaded model {} ({} features)", name, model.features.len());

        let model = Arc::new(model);
        self.cache.insert(name.to_string(), model.clone());
        Ok(model)
    }
}

fn read_model(path: &Path) -> Result<LinearModel, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let model: LinearModel = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    model.validate()?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) {
        std::fs::write(dir.path().join(format!("{name}.json")), body).unwrap();
    }

    #[test]
    fn test_predict() {
        let model = LinearModel {
            features: vec!["Close".into(), "Volume".into()],
            coefficients: vec![2.0, 0.5],
            intercept: 1.0,
        };
        let y = model.predict(&[("Volume", 4.0), ("Close", 3.0)]).unwrap();
        assert_eq!(y, 9.0);
        assert!(model.predict(&[("Close", 3.0)]).is_err());
    }

    #[test]
    fn test_load_and_cache() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "m",
            r#"{"features": ["a"], "coefficients": [1.5], "intercept": 0.5}"#,
        );
        let store = ModelStore::new(dir.path());
        let first = store.load("m").unwrap();
        assert_eq!(first.predict(&[("a", 2.0)]).unwrap(), 3.5);

        std::fs::remove_file(dir.path().join("m.json")).unwrap();
        let second = store.load("m").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_load_failures() {
        let dir = TempDir::new().unwrap();
        write(&dir, "bad", r#"{"features": ["a", "b"], "coefficients": [1.0]}"#);
        write(&dir, "garbage", "not json");
        let store = ModelStore::new(dir.path());

        for name in ["bad", "garbage", "absent"] {
            let err = store.load(name).unwrap_err();
            assert!(matches!(err, PredictionError::ModelLoad(_)));
            assert_eq!(err.to_string(), "Model loading failed.");
        }
    }
}
