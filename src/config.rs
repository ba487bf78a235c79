//! Pipeline configuration.
//!
//! Everything has a default matching the diabetes readmission extract, so an empty TOML file (or
//! no file at all) gives the standard behaviour.
use crate::ArcStr;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub cleaning: CleaningConfig,
    pub features: FeatureConfig,
}

impl PipelineConfig {
    /// Load config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<PipelineConfig> {
            let text = fs::read_to_string(path)?;
            PipelineConfig::from_toml(&text)
        }
        let path = path.as_ref();
        inner(path).with_context(|| format!("loading config from \"{}\"", path.display()))
    }

    /// Use the file if one was given, otherwise the defaults.
    pub fn load_or_default(path: Option<impl AsRef<Path>>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(Into::into)
    }
}

/// What the cleaning stage removes or rewrites before feature derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleaningConfig {
    /// Cell values that mean "no data".
    pub missing_markers: Vec<ArcStr>,
    /// Identifier and mostly-empty columns.
    pub drop_columns: Vec<ArcStr>,
    /// Rows holding one of these values in the given column are dropped.
    pub invalid_values: BTreeMap<ArcStr, Vec<ArcStr>>,
    /// Outcome column, replaced by 1 where it equals `outcome_positive` and 0 elsewhere.
    pub outcome_field: ArcStr,
    pub outcome_positive: ArcStr,
    /// Columns known to hold a single value across the extract.
    pub constant_columns: Vec<ArcStr>,
    /// Also drop any other column with at most one distinct non-missing value.
    pub drop_all_constant: bool,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            missing_markers: vec!["?".into()],
            drop_columns: [
                "weight",
                "payer_code",
                "medical_specialty",
                "encounter_id",
                "patient_nbr",
            ]
            .into_iter()
            .map(Into::into)
            .collect(),
            invalid_values: BTreeMap::from([("gender".into(), vec!["Unknown/Invalid".into()])]),
            outcome_field: "readmitted".into(),
            outcome_positive: "<30".into(),
            constant_columns: vec!["examide".into(), "citoglipton".into()],
            drop_all_constant: false,
        }
    }
}

/// Feature derivation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureConfig {
    /// What to do when a utilization counter is missing.
    pub missing_utilization: MissingPolicy,
}

/// How `service_utilization` is computed when one of its counters is missing.
///
/// In every case the row is reported as a `MissingRequiredNumeric` issue.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    /// The sum is missing for that record.
    #[default]
    Propagate,
    /// Missing counters are imputed as zero.
    Zero,
    /// The whole run fails.
    Reject,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        assert_eq!(PipelineConfig::from_toml("").unwrap(), PipelineConfig::default());
    }

    #[test]
    fn partial_override() {
        let config = PipelineConfig::from_toml(
            r#"
            [cleaning]
            missing_markers = ["?", "NULL"]

            [features]
            missing_utilization = "zero"
            "#,
        )
        .unwrap();
        assert_eq!(config.cleaning.missing_markers.len(), 2);
        assert_eq!(config.cleaning.outcome_field.as_ref(), "readmitted");
        assert_eq!(config.cleaning.drop_columns.len(), 5);
        assert_eq!(config.features.missing_utilization, MissingPolicy::Zero);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(PipelineConfig::from_toml("[features]\nparallel = true\n").is_err());
    }

    #[test]
    fn defaults() {
        let config = CleaningConfig::default();
        assert_eq!(config.outcome_positive.as_ref(), "<30");
        assert_eq!(
            config.invalid_values.get("gender").map(Vec::len),
            Some(1)
        );
        assert_eq!(
            FeatureConfig::default().missing_utilization,
            MissingPolicy::Propagate
        );
    }
}
