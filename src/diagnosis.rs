//! Diagnosis Mapping Module
//!
//! Turns raw classifier output into a structured diagnosis using the disease
//! taxonomy. Mapping is a pure function of its inputs.

use crate::error::ScanError;
use crate::taxonomy::{Severity, Taxonomy, TaxonomyEntry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

type Result<T> = std::result::Result<T, ScanError>;

/// Classifier output ordered by descending score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawClassification {
    predictions: Vec<(String, f32)>,
}

impl RawClassification {
    /// Build from (label, score) pairs. Scores must be finite and within
    /// [0, 1]; equal scores keep the backend's order.
    pub fn new(mut predictions: Vec<(String, f32)>) -> Result<Self> {
        if let Some((label, score)) = predictions
            .iter()
            .find(|(_, score)| !score.is_finite() || !(0.0..=1.0).contains(score))
        {
            return Err(ScanError::InferenceExecution(format!(
                "score {} for label '{}' is outside [0, 1]",
                score, label
            )));
        }

        predictions.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(Self { predictions })
    }

    /// Pair a label list with a score vector of the same length
    pub fn from_scores(labels: &[String], scores: &[f32]) -> Result<Self> {
        if labels.len() != scores.len() {
            return Err(ScanError::InferenceExecution(format!(
                "classifier produced {} scores for {} labels",
                scores.len(),
                labels.len()
            )));
        }
        Self::new(labels.iter().cloned().zip(scores.iter().copied()).collect())
    }

    pub fn top(&self) -> Option<(&str, f32)> {
        self.predictions.first().map(|(label, score)| (label.as_str(), *score))
    }

    pub fn predictions(&self) -> &[(String, f32)] {
        &self.predictions
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    /// Taxonomy key the record was built from
    pub key: String,
    pub disease_name: String,
    /// Percentage in [0, 100]
    pub confidence: u8,
    pub severity: Severity,
    pub symptoms: Vec<String>,
    pub treatment: Vec<String>,
    pub prevention: Vec<String>,
    /// Produced by the fallback policy after an infrastructure fault
    pub degraded: bool,
}

impl DiagnosisRecord {
    fn from_entry(entry: &TaxonomyEntry, confidence: u8, degraded: bool) -> Self {
        Self {
            key: entry.key.clone(),
            disease_name: entry.disease_name.clone(),
            confidence,
            severity: entry.severity,
            symptoms: entry.symptoms.clone(),
            treatment: entry.treatment.clone(),
            prevention: entry.prevention.clone(),
            degraded,
        }
    }
}

/// `round(score * 100)` clamped to a percentage. The product is taken in
/// `f32`, the precision scores arrive in, and halves round away from zero.
pub fn confidence_percent(score: f32) -> u8 {
    let clamped = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
    (clamped * 100.0).round() as u8
}

#[derive(Debug, Clone)]
pub struct DiagnosisMapper {
    taxonomy: Arc<Taxonomy>,
    threshold: f32,
}

impl DiagnosisMapper {
    pub fn new(taxonomy: Arc<Taxonomy>, threshold: f32) -> Self {
        Self { taxonomy, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Map using the configured threshold
    pub fn map(&self, raw: &RawClassification) -> DiagnosisRecord {
        self.map_with_threshold(raw, self.threshold)
    }

    /// Top label at or above `tau` with a taxonomy entry yields that entry;
    /// anything else yields the fallback entry. Neither path is degraded.
    pub fn map_with_threshold(&self, raw: &RawClassification, tau: f32) -> DiagnosisRecord {
        let Some((label, score)) = raw.top() else {
            return DiagnosisRecord::from_entry(self.taxonomy.fallback(), 0, false);
        };

        let confidence = confidence_percent(score);
        let entry = if score >= tau {
            self.taxonomy.lookup(label).unwrap_or_else(|| self.taxonomy.fallback())
        } else {
            self.taxonomy.fallback()
        };

        DiagnosisRecord::from_entry(entry, confidence, false)
    }

    /// Fallback record used when the backend or inference failed
    pub fn degraded(&self) -> DiagnosisRecord {
        DiagnosisRecord::from_entry(self.taxonomy.fallback(), 0, true)
    }
}
