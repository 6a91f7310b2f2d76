//! Disease Taxonomy Module
//!
//! Static table mapping classifier labels to disease profiles. The table is
//! read-only after load: either the built-in profiles or a JSON document
//! supplied through configuration.

use crate::error::ScanError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

type Result<T> = std::result::Result<T, ScanError>;

/// Key of the conservative record used when no confident match exists
pub const FALLBACK_KEY: &str = "inconclusive";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaxonomyEntry {
    pub key: String,
    pub disease_name: String,
    pub severity: Severity,
    pub symptoms: Vec<String>,
    pub treatment: Vec<String>,
    pub prevention: Vec<String>,
}

/// On-disk taxonomy document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyDocument {
    #[serde(default = "default_fallback_key")]
    pub fallback: String,
    pub entries: Vec<TaxonomyEntry>,
}

fn default_fallback_key() -> String {
    FALLBACK_KEY.to_string()
}

/// Separator between crop and disease in PlantVillage-style labels
const CROP_SEPARATOR: &str = "___";

fn normalize_segment(segment: &str) -> String {
    let mut normalized = String::with_capacity(segment.len());
    for ch in segment.chars() {
        let mapped = match ch {
            ' ' | '-' | '.' | '/' | ',' => '_',
            '(' | ')' => continue,
            other => other,
        };
        if mapped == '_' && normalized.ends_with('_') {
            continue;
        }
        normalized.push(mapped);
    }
    normalized.trim_matches('_').to_string()
}

/// Normalize a classifier label into taxonomy key form, keeping the crop.
///
/// `Tomato___Early_blight` becomes `tomato___early_blight`; `Late Blight`
/// becomes `late_blight`.
pub fn normalize_label(label: &str) -> String {
    let lowered = label.trim().to_lowercase();
    match lowered.rsplit_once(CROP_SEPARATOR) {
        Some((crop, disease)) => {
            let (crop, disease) = (normalize_segment(crop), normalize_segment(disease));
            match (crop.is_empty(), disease.is_empty()) {
                (false, false) => format!("{}{}{}", crop, CROP_SEPARATOR, disease),
                (true, _) => disease,
                (_, true) => crop,
            }
        }
        None => normalize_segment(&lowered),
    }
}

/// Disease part of a normalized label; the label itself when it has no crop.
pub fn disease_part(normalized: &str) -> &str {
    normalized
        .rsplit_once(CROP_SEPARATOR)
        .map(|(_, disease)| disease)
        .unwrap_or(normalized)
}

#[derive(Debug, Clone)]
pub struct Taxonomy {
    entries: HashMap<String, TaxonomyEntry>,
    fallback: TaxonomyEntry,
}

impl Taxonomy {
    /// Build a taxonomy; the fallback key must name one of the entries.
    pub fn new(entries: Vec<TaxonomyEntry>, fallback_key: &str) -> Result<Self> {
        let mut table = HashMap::with_capacity(entries.len());
        for mut entry in entries {
            let key = normalize_label(&entry.key);
            if key.is_empty() {
                return Err(ScanError::Taxonomy(format!(
                    "entry '{}' has an empty key",
                    entry.disease_name
                )));
            }
            if entry.disease_name.trim().is_empty() {
                return Err(ScanError::Taxonomy(format!("entry '{}' has no disease name", key)));
            }
            entry.key = key.clone();
            if table.insert(key.clone(), entry).is_some() {
                return Err(ScanError::Taxonomy(format!("duplicate taxonomy key '{}'", key)));
            }
        }

        let fallback_key = normalize_label(fallback_key);
        let fallback = table.remove(&fallback_key).ok_or_else(|| {
            ScanError::Taxonomy(format!("fallback entry '{}' is missing", fallback_key))
        })?;

        Ok(Self {
            entries: table,
            fallback,
        })
    }

    pub fn from_document(document: TaxonomyDocument) -> Result<Self> {
        Self::new(document.entries, &document.fallback)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let document: TaxonomyDocument = serde_json::from_str(json)
            .map_err(|e| ScanError::Taxonomy(format!("invalid taxonomy document: {}", e)))?;
        Self::from_document(document)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ScanError::Taxonomy(format!("failed to read {}: {}", path.display(), e))
        })?;
        let taxonomy = Self::from_json(&json)?;
        info!(path = %path.display(), entries = taxonomy.len(), "Loaded disease taxonomy");
        Ok(taxonomy)
    }

    /// Shared handle to the built-in profiles
    pub fn builtin() -> Arc<Taxonomy> {
        Arc::clone(&BUILTIN)
    }

    /// Resolve a classifier label: the full label (crop included) first, then
    /// its disease part, then the longest key that is a `_`-bounded suffix of
    /// the disease part (label family match).
    pub fn lookup(&self, label: &str) -> Option<&TaxonomyEntry> {
        let normalized = normalize_label(label);
        if let Some(entry) = self.entries.get(&normalized) {
            return Some(entry);
        }

        let disease = disease_part(&normalized);
        if let Some(entry) = self.entries.get(disease) {
            return Some(entry);
        }

        self.entries
            .iter()
            .filter(|(key, _)| {
                disease.len() > key.len()
                    && disease.ends_with(key.as_str())
                    && disease.as_bytes()[disease.len() - key.len() - 1] == b'_'
            })
            .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
            .map(|(_, entry)| entry)
    }

    pub fn fallback(&self) -> &TaxonomyEntry {
        &self.fallback
    }

    /// Number of disease entries, excluding the fallback
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn entry(
    key: &str,
    disease_name: &str,
    severity: Severity,
    symptoms: &[&str],
    treatment: &[&str],
    prevention: &[&str],
) -> TaxonomyEntry {
    let owned = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
    TaxonomyEntry {
        key: key.to_string(),
        disease_name: disease_name.to_string(),
        severity,
        symptoms: owned(symptoms),
        treatment: owned(treatment),
        prevention: owned(prevention),
    }
}

fn builtin_entries() -> Vec<TaxonomyEntry> {
    vec![
        entry(
            FALLBACK_KEY,
            "Inconclusive / Healthy",
            Severity::Low,
            &["No distinctive disease symptoms were recognized in the photo"],
            &[
                "No treatment recommended yet",
                "Retake the photo in daylight with a single leaf filling the frame if symptoms persist",
            ],
            &[
                "Keep monitoring the crop weekly",
                "Maintain balanced irrigation and fertilization",
            ],
        ),
        entry(
            "healthy",
            "Healthy",
            Severity::Low,
            &["Uniform green foliage without lesions or discoloration"],
            &["No treatment needed"],
            &["Continue regular scouting", "Rotate crops each season"],
        ),
        entry(
            "early_blight",
            "Early Blight",
            Severity::Medium,
            &[
                "Dark brown spots with concentric rings on older leaves",
                "Yellowing tissue around lesions",
                "Lower leaves dropping early",
            ],
            &[
                "Remove and destroy infected leaves",
                "Apply a chlorothalonil or copper-based fungicide",
                "Repeat fungicide application every 7-10 days in wet weather",
            ],
            &[
                "Rotate away from solanaceous crops for two seasons",
                "Mulch to keep soil off the foliage",
                "Water at the base of plants in the morning",
            ],
        ),
        entry(
            "late_blight",
            "Late Blight",
            Severity::High,
            &[
                "Large water-soaked grey-green lesions on leaves",
                "White mould on leaf undersides in humid conditions",
                "Brown firm rot on fruit or tubers",
            ],
            &[
                "Remove and bag infected plants immediately",
                "Apply a systemic fungicide such as mefenoxam or cymoxanil",
                "Alert neighbouring growers, the disease spreads quickly",
            ],
            &[
                "Plant certified disease-free seed",
                "Space plants for good air circulation",
                "Avoid overhead irrigation",
            ],
        ),
        entry(
            "leaf_mold",
            "Leaf Mold",
            Severity::Medium,
            &[
                "Pale yellow spots on upper leaf surfaces",
                "Olive-green velvety growth beneath the spots",
            ],
            &[
                "Improve ventilation and lower humidity",
                "Apply a labelled fungicide at first sign of infection",
            ],
            &["Use resistant varieties", "Avoid wetting leaves when watering"],
        ),
        entry(
            "septoria_leaf_spot",
            "Septoria Leaf Spot",
            Severity::Medium,
            &[
                "Small circular spots with dark margins and grey centres",
                "Tiny black specks inside the spots",
            ],
            &[
                "Remove infected lower leaves",
                "Apply a copper or chlorothalonil fungicide",
            ],
            &["Clear plant debris after harvest", "Rotate crops for at least one season"],
        ),
        entry(
            "bacterial_spot",
            "Bacterial Spot",
            Severity::Medium,
            &[
                "Small dark water-soaked spots on leaves and fruit",
                "Spots merge and leaves turn yellow",
            ],
            &[
                "Apply copper-based bactericide combined with mancozeb",
                "Remove heavily infected plants",
            ],
            &["Use pathogen-free seed and transplants", "Avoid working with wet plants"],
        ),
        entry(
            "target_spot",
            "Target Spot",
            Severity::Medium,
            &["Brown lesions with light centres and concentric rings", "Premature leaf drop"],
            &["Apply a broad-spectrum fungicide", "Prune to improve air flow"],
            &["Remove crop residue", "Avoid dense planting"],
        ),
        entry(
            "two_spotted_spider_mite",
            "Spider Mite Damage",
            Severity::Medium,
            &["Fine yellow stippling on leaves", "Webbing on leaf undersides"],
            &["Spray leaves with water or insecticidal soap", "Apply a miticide if severe"],
            &["Keep plants well watered", "Encourage predatory mites"],
        ),
        entry(
            "yellow_leaf_curl_virus",
            "Yellow Leaf Curl Virus",
            Severity::High,
            &[
                "Upward curling and yellowing of young leaves",
                "Stunted growth and flower drop",
            ],
            &[
                "Remove and destroy infected plants",
                "Control whitefly vectors with approved insecticides",
            ],
            &["Use resistant varieties", "Install insect-proof netting on nurseries"],
        ),
        entry(
            "mosaic_virus",
            "Mosaic Virus",
            Severity::High,
            &["Mottled light and dark green patterns on leaves", "Distorted or stunted leaves"],
            &[
                "Remove infected plants, there is no chemical cure",
                "Disinfect tools between plants",
            ],
            &["Control aphid vectors", "Wash hands before handling plants"],
        ),
        entry(
            "powdery_mildew",
            "Powdery Mildew",
            Severity::Low,
            &["White powdery patches on leaves and stems"],
            &["Apply sulfur or potassium bicarbonate spray", "Remove badly affected leaves"],
            &["Plant in full sun", "Avoid excess nitrogen fertilizer"],
        ),
        entry(
            "common_rust",
            "Common Rust",
            Severity::Medium,
            &["Reddish-brown powdery pustules on both leaf surfaces"],
            &["Apply a triazole or strobilurin fungicide when pustules first appear"],
            &["Plant resistant hybrids", "Plant early to avoid peak spore periods"],
        ),
        entry(
            "northern_leaf_blight",
            "Northern Leaf Blight",
            Severity::Medium,
            &["Long cigar-shaped grey-green lesions on leaves"],
            &["Apply a foliar fungicide at tasseling if lesions spread"],
            &["Rotate with non-host crops", "Till residue where erosion allows"],
        ),
        entry(
            "black_rot",
            "Black Rot",
            Severity::High,
            &["Brown circular leaf spots with purple margins", "Shrivelled black mummified fruit"],
            &["Prune out infected wood and mummies", "Apply captan or myclobutanil fungicide"],
            &["Keep the canopy open", "Remove mummified fruit during dormancy"],
        ),
        entry(
            "apple_scab",
            "Apple Scab",
            Severity::Medium,
            &["Olive-green to black velvety spots on leaves and fruit", "Cracked corky fruit skin"],
            &["Apply protective fungicide from bud break", "Remove fallen infected leaves"],
            &["Plant scab-resistant cultivars", "Shred leaf litter in autumn"],
        ),
        entry(
            "cercospora_leaf_spot",
            "Cercospora Leaf Spot",
            Severity::Medium,
            &["Small grey lesions with dark borders", "Rectangular lesions limited by leaf veins"],
            &["Apply a labelled fungicide", "Remove infected debris"],
            &["Rotate crops", "Use tolerant varieties"],
        ),
    ]
}

static BUILTIN: Lazy<Arc<Taxonomy>> = Lazy::new(|| {
    // The built-in table is a compile-time constant that always contains the fallback.
    Arc::new(Taxonomy::new(builtin_entries(), FALLBACK_KEY).expect("built-in taxonomy is valid"))
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("Tomato___Early_blight"), "tomato___early_blight");
        assert_eq!(normalize_label("Late Blight"), "late_blight");
        assert_eq!(normalize_label("Corn_(maize)___Common_rust_"), "corn_maize___common_rust");
        assert_eq!(
            normalize_label("Tomato___Spider_mites Two-spotted_spider_mite"),
            "tomato___spider_mites_two_spotted_spider_mite"
        );
        assert_eq!(normalize_label("  leaf.mold  "), "leaf_mold");
        assert_eq!(normalize_label("___Leaf Mold"), "leaf_mold");
        assert_eq!(disease_part("tomato___early_blight"), "early_blight");
        assert_eq!(disease_part("early_blight"), "early_blight");
    }

    #[test]
    fn test_per_crop_entries_resolve_by_full_label() {
        let json = r#"{
            "entries": [
                {"key": "inconclusive", "disease_name": "Inconclusive", "severity": "Low",
                 "symptoms": [], "treatment": [], "prevention": []},
                {"key": "Tomato___Early_blight", "disease_name": "Tomato Early Blight",
                 "severity": "Medium", "symptoms": [], "treatment": [], "prevention": []},
                {"key": "Potato___Early_blight", "disease_name": "Potato Early Blight",
                 "severity": "High", "symptoms": [], "treatment": [], "prevention": []},
                {"key": "early_blight", "disease_name": "Early Blight",
                 "severity": "Medium", "symptoms": [], "treatment": [], "prevention": []}
            ]
        }"#;
        let taxonomy = Taxonomy::from_json(json).unwrap();
        assert_eq!(taxonomy.len(), 3);

        let potato = taxonomy.lookup("Potato___Early_blight").unwrap();
        assert_eq!(potato.key, "potato___early_blight");
        assert_eq!(potato.severity, Severity::High);
        assert_eq!(
            taxonomy.lookup("Tomato___Early_blight").unwrap().disease_name,
            "Tomato Early Blight"
        );

        // crops without their own entry fall back to the disease part
        assert_eq!(taxonomy.lookup("Pepper___Early_blight").unwrap().key, "early_blight");
    }

    #[test]
    fn test_builtin_lookup() {
        let taxonomy = Taxonomy::builtin();
        let entry = taxonomy.lookup("early_blight").unwrap();
        assert_eq!(entry.disease_name, "Early Blight");
        assert_eq!(entry.severity, Severity::Medium);

        let entry = taxonomy.lookup("Potato___Late_blight").unwrap();
        assert_eq!(entry.key, "late_blight");
        assert!(taxonomy.lookup("unknown_label").is_none());
        assert_eq!(taxonomy.fallback().key, FALLBACK_KEY);
    }

    #[test]
    fn test_family_match_prefers_longest_key() {
        let taxonomy = Taxonomy::builtin();

        // crop-prefixed label without the PlantVillage separator
        let entry = taxonomy.lookup("tomato_yellow_leaf_curl_virus").unwrap();
        assert_eq!(entry.key, "yellow_leaf_curl_virus");

        let entry = taxonomy.lookup("Tomato___Spider_mites Two-spotted_spider_mite").unwrap();
        assert_eq!(entry.disease_name, "Spider Mite Damage");

        let entry = taxonomy.lookup("Corn_Northern_Leaf_Blight").unwrap();
        assert_eq!(entry.key, "northern_leaf_blight");

        // suffix must start on a word boundary
        assert!(taxonomy.lookup("xhealthy").is_none());
    }

    #[test]
    fn test_from_json_requires_fallback() {
        let json = r#"{
            "entries": [
                {"key": "rust", "disease_name": "Rust", "severity": "Medium",
                 "symptoms": [], "treatment": [], "prevention": []}
            ]
        }"#;
        let result = Taxonomy::from_json(json);
        assert!(matches!(result, Err(ScanError::Taxonomy(_))));
    }

    #[test]
    fn test_from_json_rejects_duplicates() {
        let json = r#"{
            "fallback": "unknown",
            "entries": [
                {"key": "unknown", "disease_name": "Unknown", "severity": "Low",
                 "symptoms": [], "treatment": [], "prevention": []},
                {"key": "Rust", "disease_name": "Rust", "severity": "Medium",
                 "symptoms": [], "treatment": [], "prevention": []},
                {"key": "rust", "disease_name": "Rust again", "severity": "High",
                 "symptoms": [], "treatment": [], "prevention": []}
            ]
        }"#;
        assert!(matches!(Taxonomy::from_json(json), Err(ScanError::Taxonomy(_))));
    }

    #[test]
    fn test_builtin_entries_are_complete() {
        for entry in builtin_entries() {
            assert!(!entry.symptoms.is_empty(), "{} has no symptoms", entry.key);
            assert!(!entry.treatment.is_empty(), "{} has no treatment", entry.key);
            assert!(!entry.prevention.is_empty(), "{} has no prevention", entry.key);
        }
    }
}
