//! Feature vocabulary, values and merge-patch semantics for profiles
//!
//! Profiles and candidates both describe themselves with an attribute map
//! (`feature key -> value`). Profiles are validated against a fixed
//! vocabulary so that edits cannot drift the schema; candidate attributes
//! come from external collaborators and are taken as-is.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::models::SubjectType;
use crate::error::RecommendError;

/// Attribute map, ordered so serialization is canonical
pub type Attributes = BTreeMap<String, FeatureValue>;

/// Merge-patch input: `None` (JSON `null`) removes the key
pub type AttributePatch = BTreeMap<String, Option<FeatureValue>>;

/// A single attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Flag(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

/// How two attribute values relate for scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMatch {
    Exact,
    Partial,
    Disjoint,
}

impl FeatureValue {
    /// Normalized set of comparable tokens
    pub fn tokens(&self) -> BTreeSet<String> {
        match self {
            FeatureValue::Flag(b) => BTreeSet::from([b.to_string()]),
            FeatureValue::Number(n) => BTreeSet::from([n.to_string()]),
            FeatureValue::Text(t) => BTreeSet::from([t.trim().to_lowercase()]),
            FeatureValue::List(items) => items.iter().map(|s| s.trim().to_lowercase()).collect(),
        }
    }

    /// Compare two values: equal token sets are exact, overlapping ones partial
    pub fn compare(&self, other: &FeatureValue) -> ValueMatch {
        let left = self.tokens();
        let right = other.tokens();
        if left.is_empty() || right.is_empty() {
            return ValueMatch::Disjoint;
        }
        if left == right {
            ValueMatch::Exact
        } else if !left.is_disjoint(&right) {
            ValueMatch::Partial
        } else {
            ValueMatch::Disjoint
        }
    }

    /// True when the two values share at least one token
    pub fn shares_value(&self, other: &FeatureValue) -> bool {
        self.compare(other) != ValueMatch::Disjoint
    }
}

/// Shape a feature key accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    List,
    Number,
    Text,
}

/// Known profile feature keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKey {
    Skills,
    Majors,
    Degree,
    Location,
    PreferredLocations,
    Industry,
    PreferredIndustries,
    JobType,
    ExpectedSalary,
    GraduationYear,
    ExperienceYears,
    Languages,
    Certifications,
}

impl FeatureKey {
    pub const ALL: [FeatureKey; 13] = [
        FeatureKey::Skills,
        FeatureKey::Majors,
        FeatureKey::Degree,
        FeatureKey::Location,
        FeatureKey::PreferredLocations,
        FeatureKey::Industry,
        FeatureKey::PreferredIndustries,
        FeatureKey::JobType,
        FeatureKey::ExpectedSalary,
        FeatureKey::GraduationYear,
        FeatureKey::ExperienceYears,
        FeatureKey::Languages,
        FeatureKey::Certifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKey::Skills => "skills",
            FeatureKey::Majors => "majors",
            FeatureKey::Degree => "degree",
            FeatureKey::Location => "location",
            FeatureKey::PreferredLocations => "preferred_locations",
            FeatureKey::Industry => "industry",
            FeatureKey::PreferredIndustries => "preferred_industries",
            FeatureKey::JobType => "job_type",
            FeatureKey::ExpectedSalary => "expected_salary",
            FeatureKey::GraduationYear => "graduation_year",
            FeatureKey::ExperienceYears => "experience_years",
            FeatureKey::Languages => "languages",
            FeatureKey::Certifications => "certifications",
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            FeatureKey::Skills
            | FeatureKey::Majors
            | FeatureKey::PreferredLocations
            | FeatureKey::PreferredIndustries
            | FeatureKey::Languages
            | FeatureKey::Certifications => ValueKind::List,
            FeatureKey::ExpectedSalary
            | FeatureKey::GraduationYear
            | FeatureKey::ExperienceYears => ValueKind::Number,
            FeatureKey::Degree
            | FeatureKey::Location
            | FeatureKey::Industry
            | FeatureKey::JobType => ValueKind::Text,
        }
    }

    /// Whether a profile of this subject type may carry the key
    pub fn allowed_for(&self, subject_type: SubjectType) -> bool {
        match subject_type {
            SubjectType::Student => !matches!(self, FeatureKey::Industry),
            SubjectType::Organization => !matches!(
                self,
                FeatureKey::ExpectedSalary
                    | FeatureKey::PreferredLocations
                    | FeatureKey::PreferredIndustries
            ),
        }
    }

    /// Coerce a value into the shape this key stores
    pub fn normalize(&self, value: FeatureValue) -> Result<FeatureValue, RecommendError> {
        let invalid = |reason: &str| RecommendError::InvalidFeatureValue {
            key: self.as_str().to_string(),
            reason: reason.to_string(),
        };

        match (self.kind(), value) {
            (ValueKind::List, FeatureValue::List(items)) => Ok(FeatureValue::List(clean_list(items))),
            (ValueKind::List, FeatureValue::Text(t)) => Ok(FeatureValue::List(clean_list(vec![t]))),
            (ValueKind::List, _) => Err(invalid("expected a list of strings")),
            (ValueKind::Number, FeatureValue::Number(n)) if n.is_finite() => Ok(FeatureValue::Number(n)),
            (ValueKind::Number, _) => Err(invalid("expected a finite number")),
            (ValueKind::Text, FeatureValue::Text(t)) => {
                let t = t.trim();
                if t.is_empty() {
                    Err(invalid("expected a non-empty string"))
                } else {
                    Ok(FeatureValue::Text(t.to_string()))
                }
            }
            (ValueKind::Text, _) => Err(invalid("expected a string")),
        }
    }
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
        .collect()
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureKey {
    type Err = RecommendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RecommendError::UnknownFeatureKey(s.to_string()))
    }
}

/// Apply a merge-patch to an attribute map
///
/// The whole patch is validated before anything is merged, so a rejected
/// key leaves the profile untouched.
pub fn apply_patch(
    subject_type: SubjectType,
    current: &Attributes,
    patch: AttributePatch,
) -> Result<Attributes, RecommendError> {
    let mut validated = Vec::with_capacity(patch.len());
    for (name, value) in patch {
        let key: FeatureKey = name.parse()?;
        if !key.allowed_for(subject_type) {
            return Err(RecommendError::UnknownFeatureKey(format!(
                "{} (not a {} feature)",
                name, subject_type
            )));
        }
        let value = value.map(|v| key.normalize(v)).transpose()?;
        validated.push((key, value));
    }

    let mut merged = current.clone();
    for (key, value) in validated {
        match value {
            Some(v) => {
                merged.insert(key.as_str().to_string(), v);
            }
            None => {
                merged.remove(key.as_str());
            }
        }
    }
    Ok(merged)
}

/// Hex SHA-256 of the canonical JSON form of an attribute map
pub fn fingerprint(attributes: &Attributes) -> String {
    let canonical = serde_json::to_string(attributes).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> FeatureValue {
        FeatureValue::List(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_compare_lists() {
        assert_eq!(list(&["java"]).compare(&list(&["Java"])), ValueMatch::Exact);
        assert_eq!(list(&["java"]).compare(&list(&["java", "go"])), ValueMatch::Partial);
        assert_eq!(list(&["java"]).compare(&list(&["python"])), ValueMatch::Disjoint);
        assert_eq!(
            FeatureValue::Text("Beijing".into()).compare(&list(&["beijing", "shanghai"])),
            ValueMatch::Partial
        );
        assert_eq!(list(&[]).compare(&list(&[])), ValueMatch::Disjoint);
    }

    #[test]
    fn test_untagged_deserialization() {
        let patch: AttributePatch = serde_json::from_str(
            r#"{"skills": ["rust", "sql"], "expected_salary": 12000, "degree": "bachelor", "location": null}"#,
        )
        .unwrap();

        assert_eq!(patch["skills"], Some(list(&["rust", "sql"])));
        assert_eq!(patch["expected_salary"], Some(FeatureValue::Number(12000.0)));
        assert_eq!(patch["degree"], Some(FeatureValue::Text("bachelor".into())));
        assert_eq!(patch["location"], None);
    }

    #[test]
    fn test_apply_patch_merges_and_removes() {
        let mut current = Attributes::new();
        current.insert("skills".into(), list(&["java"]));
        current.insert("location".into(), FeatureValue::Text("Wuhan".into()));

        let mut patch = AttributePatch::new();
        patch.insert("degree".into(), Some(FeatureValue::Text(" master ".into())));
        patch.insert("location".into(), None);

        let merged = apply_patch(SubjectType::Student, &current, patch).unwrap();
        assert_eq!(merged["skills"], list(&["java"]));
        assert_eq!(merged["degree"], FeatureValue::Text("master".into()));
        assert!(!merged.contains_key("location"));
    }

    #[test]
    fn test_apply_patch_rejects_unknown_key_atomically() {
        let current = Attributes::new();
        let mut patch = AttributePatch::new();
        patch.insert("skills".into(), Some(list(&["go"])));
        patch.insert("shoe_size".into(), Some(FeatureValue::Number(42.0)));

        let err = apply_patch(SubjectType::Student, &current, patch).unwrap_err();
        assert!(matches!(err, RecommendError::UnknownFeatureKey(k) if k == "shoe_size"));
    }

    #[test]
    fn test_apply_patch_rejects_key_of_other_subject_type() {
        let mut patch = AttributePatch::new();
        patch.insert("expected_salary".into(), Some(FeatureValue::Number(9000.0)));

        let err = apply_patch(SubjectType::Organization, &Attributes::new(), patch).unwrap_err();
        assert!(matches!(err, RecommendError::UnknownFeatureKey(_)));
    }

    #[test]
    fn test_apply_patch_rejects_wrong_shape() {
        let mut patch = AttributePatch::new();
        patch.insert("skills".into(), Some(FeatureValue::Number(3.0)));

        let err = apply_patch(SubjectType::Student, &Attributes::new(), patch).unwrap_err();
        assert!(matches!(err, RecommendError::InvalidFeatureValue { .. }));
    }

    #[test]
    fn test_text_coerced_to_list_and_deduplicated() {
        let normalized = FeatureKey::Skills
            .normalize(list(&["Rust", "rust ", "", "SQL"]))
            .unwrap();
        assert_eq!(normalized, list(&["Rust", "SQL"]));

        let single = FeatureKey::Languages.normalize(FeatureValue::Text("English".into())).unwrap();
        assert_eq!(single, list(&["English"]));
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let mut a = Attributes::new();
        a.insert("skills".into(), list(&["java"]));
        a.insert("degree".into(), FeatureValue::Text("bachelor".into()));

        let mut b = Attributes::new();
        b.insert("degree".into(), FeatureValue::Text("bachelor".into()));
        b.insert("skills".into(), list(&["java"]));

        assert_eq!(fingerprint(&a), fingerprint(&b));
        b.insert("location".into(), FeatureValue::Text("Hangzhou".into()));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
