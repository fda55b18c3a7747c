//! Which fingerprint families take part in a feature-set comparison.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Known fingerprint families, in report order.
pub const FEATURE_SETS: [&str; 19] = [
    "autocorrelation",
    "atom_pair",
    "avalon",
    "extended_connectivity",
    "functional_groups",
    "ghose_crippen",
    "laggner",
    "layered",
    "lingo",
    "maccs",
    "minhashed",
    "minhashed_atom_pair",
    "molecular_quantum_numbers",
    "pattern",
    "pubchem",
    "rdkit",
    "smiles_extended_connectivity",
    "topological_torsion",
    "van_der_waals_surface_area",
];

#[derive(Debug, thiserror::Error)]
pub enum FeatureSettingsError {
    #[error("unknown feature set '{0}'")]
    UnknownFeature(String),
    #[error("failed to read feature settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse feature settings: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn is_known_feature_set(name: &str) -> bool {
    FEATURE_SETS.contains(&name)
}

/// Include flags over [`FEATURE_SETS`]. Everything starts excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSettings {
    included: BTreeSet<&'static str>,
}

impl FeatureSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layered and MACCS fingerprints.
    pub fn standard() -> Self {
        Self {
            included: ["layered", "maccs"].into_iter().collect(),
        }
    }

    pub fn include(mut self, name: &str) -> Result<Self, FeatureSettingsError> {
        let known = FEATURE_SETS
            .iter()
            .find(|known| **known == name)
            .ok_or_else(|| FeatureSettingsError::UnknownFeature(name.to_string()))?;
        self.included.insert(*known);
        Ok(self)
    }

    pub fn include_all(mut self) -> Self {
        self.included.extend(FEATURE_SETS);
        self
    }

    pub fn is_included(&self, name: &str) -> bool {
        self.included.contains(name)
    }

    pub fn includes_features(&self) -> bool {
        !self.included.is_empty()
    }

    pub fn number_of_features(&self) -> usize {
        self.included.len()
    }

    /// Included families in catalog order.
    pub fn iter_included(&self) -> impl Iterator<Item = &'static str> + '_ {
        FEATURE_SETS
            .into_iter()
            .filter(move |name| self.included.contains(name))
    }

    /// Entries set to `false` are accepted but change nothing.
    pub fn from_map(map: &BTreeMap<String, bool>) -> Result<Self, FeatureSettingsError> {
        map.iter()
            .filter(|(_, included)| **included)
            .try_fold(Self::new(), |settings, (name, _)| settings.include(name))
    }

    /// Every catalog family with its flag.
    pub fn to_map(&self) -> BTreeMap<String, bool> {
        FEATURE_SETS
            .iter()
            .map(|name| (name.to_string(), self.included.contains(name)))
            .collect()
    }
}

pub fn load_feature_settings_from_path(
    path: impl AsRef<Path>,
) -> Result<FeatureSettings, FeatureSettingsError> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let map: BTreeMap<String, bool> = serde_json::from_str(&raw)?;
    FeatureSettings::from_map(&map)
}
