//! One-hot ("dummy") encoding of categorical fields against a frozen reference schema.
//!
//! The schema is captured once from the training records. Every field that holds text in at least
//! one record is categorical, and its observed values are stored sorted. The first value is the
//! baseline: it gets no indicator of its own, so a field with `k` values becomes `k - 1`
//! indicator fields named `<field>_<value>`. A record with the baseline value has all its
//! indicators set to 0.
//!
//! Encoding the same schema against new data always gives the same columns in the same order,
//! whatever values the new data contains. Values the schema hasn't seen are encoded like the
//! baseline and reported as drift.
use crate::{
    pipeline::{Issue, Stage},
    util, ArcStr, Record, Records, Value,
};
use itertools::Itertools;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};
use term_data_table::{Cell, Row, Table};

/// A categorical field and the values it took in the training data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalField {
    pub name: ArcStr,
    /// Sorted and deduplicated. The first value is the baseline.
    pub values: Vec<ArcStr>,
}

impl CategoricalField {
    pub fn baseline(&self) -> Option<&ArcStr> {
        self.values.first()
    }

    /// The names of the indicator fields this field expands into, in output order.
    pub fn indicator_names(&self) -> impl Iterator<Item = String> + '_ {
        self.values
            .iter()
            .skip(1)
            .map(move |value| format!("{}_{}", self.name, value))
    }

    /// Position of `value` in the sorted value list.
    pub fn position(&self, value: &str) -> Option<usize> {
        self.values.binary_search_by(|v| (**v).cmp(value)).ok()
    }
}

/// The categorical fields of the training data, in column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSchema {
    fields: Vec<CategoricalField>,
}

impl ReferenceSchema {
    pub fn new(fields: Vec<CategoricalField>) -> Result<Self> {
        let schema = Self { fields };
        schema.check_consistent()?;
        Ok(schema)
    }

    /// Capture the schema from (derived) training records.
    ///
    /// A field is categorical if any record holds text for it. Numbers in a categorical field are
    /// treated as their text rendering.
    pub fn fit(records: &Records) -> Self {
        let mut values: BTreeMap<ArcStr, BTreeSet<ArcStr>> = BTreeMap::new();
        for record in records {
            for (name, value) in record.iter() {
                if let Value::Text(text) = value {
                    values
                        .entry(name.clone())
                        .or_default()
                        .insert(text.clone());
                }
            }
        }
        // numbers only count once we know the field is categorical.
        for record in records {
            for (name, value) in record.iter() {
                if let (Value::Numeric(_), Some(set)) = (value, values.get_mut(name)) {
                    set.insert(value.to_string().into());
                }
            }
        }

        // keep column order, with any fields not present in the first record at the end.
        let mut order = records.columns();
        for name in values.keys() {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        let fields: Vec<_> = order
            .into_iter()
            .filter_map(|name| {
                let values = values.remove(&name)?;
                Some(CategoricalField {
                    name,
                    values: values.into_iter().collect(),
                })
            })
            .collect();
        let schema = Self { fields };
        event!(
            Level::INFO,
            "fitted reference schema: {} categorical fields, {} indicators",
            schema.fields.len(),
            schema.indicator_count()
        );
        schema
    }

    pub fn fields(&self) -> &[CategoricalField] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&CategoricalField> {
        self.fields.iter().find(|field| &*field.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The total number of indicator fields the schema produces.
    pub fn indicator_count(&self) -> usize {
        self.fields
            .iter()
            .map(|field| field.values.len().saturating_sub(1))
            .sum()
    }

    /// All indicator field names, in output order.
    pub fn indicator_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .flat_map(CategoricalField::indicator_names)
            .collect()
    }

    /// Check the schema can be used for encoding: unique field names, non-empty sorted value
    /// lists, and no clashes between indicator names.
    fn check_consistent(&self) -> Result {
        let duplicates: Vec<_> = self.fields.iter().map(|f| &f.name).duplicates().collect();
        ensure!(
            duplicates.is_empty(),
            "duplicate fields in schema: {}",
            duplicates.iter().join(", ")
        );
        for field in &self.fields {
            ensure!(
                !field.values.is_empty(),
                "categorical field \"{}\" has no values",
                field.name
            );
            ensure!(
                field.values.windows(2).all(|pair| pair[0] < pair[1]),
                "values of categorical field \"{}\" are not sorted and unique",
                field.name
            );
        }
        let names = self.indicator_names();
        let clashes: Vec<_> = names.iter().duplicates().collect();
        ensure!(
            clashes.is_empty(),
            "indicator names clash: {}",
            clashes.iter().join(", ")
        );
        Ok(())
    }

    /// Check the records line up with the schema.
    ///
    /// Every schema field must be a column of the records, and every column holding text must be in
    /// the schema. Either mismatch would make the output columns differ from the training output.
    /// A column that is kept as-is must not share its name with an indicator.
    pub fn check_compatible(&self, records: &Records) -> Result {
        if records.is_empty() {
            return Ok(());
        }
        let columns = records.columns();
        let absent: Vec<_> = self
            .fields
            .iter()
            .filter(|field| !columns.contains(&field.name))
            .map(|field| &field.name)
            .collect();
        ensure!(
            absent.is_empty(),
            "schema fields missing from the input: {}",
            absent.iter().join(", ")
        );

        let unknown: BTreeSet<&ArcStr> = records
            .iter()
            .flat_map(|record| record.iter())
            .filter(|(name, value)| value.is_text() && !self.contains(name))
            .map(|(name, _)| name)
            .collect();
        ensure!(
            unknown.is_empty(),
            "text fields not in the schema: {}",
            unknown.iter().join(", ")
        );

        let indicators: BTreeSet<String> = self.indicator_names().into_iter().collect();
        let clashes: BTreeSet<&ArcStr> = records
            .iter()
            .flat_map(|record| record.names())
            .filter(|name| !self.contains(name) && indicators.contains(&***name))
            .collect();
        ensure!(
            clashes.is_empty(),
            "input columns clash with indicator names: {}",
            clashes.iter().join(", ")
        );
        Ok(())
    }

    /// The categorical fields with their baseline and indicator values.
    pub fn table(&self) -> Table {
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("Field"))
                .with_cell(Cell::from("Baseline"))
                .with_cell(Cell::from("Indicators")),
        );
        for field in &self.fields {
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(field.name.to_string()))
                    .with_cell(Cell::from(
                        field.baseline().map(|b| b.to_string()).unwrap_or_default(),
                    ))
                    .with_cell(Cell::from(field.values.iter().skip(1).join(", "))),
            );
        }
        table
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let schema: ReferenceSchema = serde_json::from_str(text)?;
        schema.check_consistent()?;
        Ok(schema)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing reference schema")
    }

    /// Load a schema saved with [`ReferenceSchema::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<ReferenceSchema> {
            let text = fs::read_to_string(path)?;
            ReferenceSchema::from_json(&text)
        }
        let path = path.as_ref();
        inner(path).with_context(|| format!("loading reference schema \"{}\"", path.display()))
    }

    /// Save the schema as JSON. Refuses to replace an existing file unless `overwrite` is set.
    pub fn save(&self, path: impl AsRef<Path>, overwrite: bool) -> Result {
        fn inner(this: &ReferenceSchema, path: &Path, overwrite: bool) -> Result {
            let exists = util::path_exists(path)?;
            ensure!(overwrite || !exists, "file already exists");
            if exists {
                event!(Level::WARN, "overwriting \"{}\"", path.display());
            }
            fs::write(path, this.to_json()?)?;
            Ok(())
        }
        let path = path.as_ref();
        inner(self, path, overwrite)
            .with_context(|| format!("saving reference schema to \"{}\"", path.display()))
    }
}

/// Replaces categorical fields with their indicators.
///
/// Non-categorical fields keep their relative order and come first; the indicators follow in
/// schema order.
pub struct CategoricalEncoder<'a> {
    schema: &'a ReferenceSchema,
    /// Indicator names per schema field, built once rather than per record.
    names: Vec<Vec<ArcStr>>,
}

impl<'a> CategoricalEncoder<'a> {
    pub fn new(schema: &'a ReferenceSchema) -> Self {
        let names: Vec<Vec<ArcStr>> = schema
            .fields
            .iter()
            .map(|field| field.indicator_names().map(ArcStr::from).collect())
            .collect();
        Self { schema, names }
    }

    pub fn schema(&self) -> &ReferenceSchema {
        self.schema
    }

    /// See [`ReferenceSchema::check_compatible`].
    pub fn check(&self, records: &Records) -> Result {
        self.schema.check_compatible(records)
    }

    /// Encode a single record.
    pub fn encode(&self, record: Record, issues: &mut Vec<Issue>) -> Record {
        let mut out = Record::with_capacity(record.len() + self.schema.indicator_count());
        let mut categorical: Vec<Option<Value>> = vec![None; self.schema.fields.len()];
        for (name, value) in record {
            match self.schema.fields.iter().position(|f| f.name == name) {
                Some(idx) => categorical[idx] = Some(value),
                None => out.push(name, value),
            }
        }

        for ((field, names), value) in self.schema.fields.iter().zip(&self.names).zip(categorical) {
            let hot = match value.unwrap_or(Value::Missing) {
                Value::Missing => {
                    issues.push(Issue::MissingCategorical {
                        field: field.name.clone(),
                    });
                    None
                }
                value => {
                    let text: ArcStr = match value {
                        Value::Text(text) => text,
                        other => other.to_string().into(),
                    };
                    let position = field.position(&text);
                    if position.is_none() {
                        issues.push(Issue::SchemaDrift {
                            field: field.name.clone(),
                            value: text,
                        });
                    }
                    position
                }
            };
            // indicator `i` stands for value `i + 1`; the baseline has none.
            for (idx, name) in names.iter().enumerate() {
                out.push(name.clone(), Value::from(hot == Some(idx + 1)));
            }
        }
        out
    }
}

impl Stage for CategoricalEncoder<'_> {
    fn name(&self) -> &'static str {
        "categorical encoding"
    }

    fn apply(&self, record: &mut Record, issues: &mut Vec<Issue>) {
        let input = std::mem::take(record);
        *record = self.encode(input, issues);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rec(fields: &[(&str, Value)]) -> Record {
        fields.iter().cloned().collect()
    }

    fn training() -> Records {
        Records::new(vec![
            rec(&[
                ("race", Value::text("Caucasian")),
                ("age", Value::num(55.)),
                ("insulin", Value::text("No")),
            ]),
            rec(&[
                ("race", Value::text("AfricanAmerican")),
                ("age", Value::num(65.)),
                ("insulin", Value::text("Up")),
            ]),
            rec(&[
                ("race", Value::text("Asian")),
                ("age", Value::num(75.)),
                ("insulin", Value::text("Steady")),
            ]),
            rec(&[
                ("race", Value::Missing),
                ("age", Value::num(85.)),
                ("insulin", Value::text("Down")),
            ]),
        ])
    }

    fn encode(schema: &ReferenceSchema, record: Record) -> (Record, Vec<Issue>) {
        let mut issues = vec![];
        let out = CategoricalEncoder::new(schema).encode(record, &mut issues);
        (out, issues)
    }

    #[test]
    fn fit_captures_sorted_values() {
        let schema = ReferenceSchema::fit(&training());
        let names: Vec<_> = schema.fields().iter().map(|f| f.name.to_string()).collect();
        assert_eq!(names, ["race", "insulin"]);
        let race = schema.get("race").unwrap();
        let values: Vec<_> = race.values.iter().map(|v| v.to_string()).collect();
        assert_eq!(values, ["AfricanAmerican", "Asian", "Caucasian"]);
        assert_eq!(schema.indicator_count(), 2 + 3);
        assert_eq!(
            schema.indicator_names(),
            [
                "race_Asian",
                "race_Caucasian",
                "insulin_No",
                "insulin_Steady",
                "insulin_Up"
            ]
        );
    }

    #[test]
    fn at_most_one_indicator_set() {
        let records = training();
        let schema = ReferenceSchema::fit(&records);
        for record in records {
            let (out, _) = encode(&schema, record);
            for field in schema.fields() {
                let set = field
                    .indicator_names()
                    .filter(|name| out.get(name) == Some(&Value::num(1.)))
                    .count();
                assert!(set <= 1);
            }
        }
    }

    #[test]
    fn baseline_is_all_zeros() {
        let schema = ReferenceSchema::fit(&training());
        let (out, issues) = encode(
            &schema,
            rec(&[
                ("race", Value::text("AfricanAmerican")),
                ("age", Value::num(30.)),
                ("insulin", Value::text("Up")),
            ]),
        );
        assert!(issues.is_empty());
        assert_eq!(out.get("race_Asian"), Some(&Value::num(0.)));
        assert_eq!(out.get("race_Caucasian"), Some(&Value::num(0.)));
        assert_eq!(out.get("insulin_Up"), Some(&Value::num(1.)));
        assert!(!out.contains("race"));
    }

    #[test]
    fn output_order() {
        let schema = ReferenceSchema::fit(&training());
        let (out, _) = encode(&schema, training()[0].clone());
        let names: Vec<_> = out.names().map(|n| n.to_string()).collect();
        assert_eq!(
            names,
            [
                "age",
                "race_Asian",
                "race_Caucasian",
                "insulin_No",
                "insulin_Steady",
                "insulin_Up"
            ]
        );
    }

    #[test]
    fn unseen_value_is_drift() {
        let schema = ReferenceSchema::fit(&training());
        let (out, issues) = encode(
            &schema,
            rec(&[
                ("race", Value::text("Hispanic")),
                ("age", Value::num(30.)),
                ("insulin", Value::text("No")),
            ]),
        );
        assert_eq!(out.len(), 1 + schema.indicator_count());
        assert_eq!(out.get("race_Asian"), Some(&Value::num(0.)));
        assert_eq!(out.get("race_Caucasian"), Some(&Value::num(0.)));
        assert_eq!(
            issues,
            vec![Issue::SchemaDrift {
                field: "race".into(),
                value: "Hispanic".into()
            }]
        );
    }

    #[test]
    fn missing_value_reported() {
        let schema = ReferenceSchema::fit(&training());
        let (out, issues) = encode(&schema, training()[3].clone());
        assert_eq!(out.get("race_Asian"), Some(&Value::num(0.)));
        assert_eq!(
            issues,
            vec![Issue::MissingCategorical {
                field: "race".into()
            }]
        );
    }

    #[test]
    fn numbers_in_categorical_field() {
        let records = Records::new(vec![
            rec(&[("admission_type", Value::text("Emergency"))]),
            rec(&[("admission_type", Value::num(3.))]),
        ]);
        let schema = ReferenceSchema::fit(&records);
        let values: Vec<_> = schema.fields()[0].values.iter().map(|v| v.to_string()).collect();
        assert_eq!(values, ["3", "Emergency"]);
        let (out, issues) = encode(&schema, rec(&[("admission_type", Value::num(3.))]));
        assert!(issues.is_empty());
        assert_eq!(out.get("admission_type_Emergency"), Some(&Value::num(0.)));
    }

    #[test]
    fn incompatible_input_rejected() {
        let schema = ReferenceSchema::fit(&training());
        let missing_field = Records::new(vec![rec(&[
            ("race", Value::text("Asian")),
            ("age", Value::num(30.)),
        ])]);
        assert!(schema.check_compatible(&missing_field).is_err());

        let extra_text = Records::new(vec![rec(&[
            ("race", Value::text("Asian")),
            ("age", Value::num(30.)),
            ("insulin", Value::text("No")),
            ("gender", Value::text("Male")),
        ])]);
        assert!(schema.check_compatible(&extra_text).is_err());

        let extra_numeric = Records::new(vec![rec(&[
            ("race", Value::text("Asian")),
            ("age", Value::num(30.)),
            ("insulin", Value::text("No")),
            ("num_lab_procedures", Value::num(41.)),
        ])]);
        assert!(schema.check_compatible(&extra_numeric).is_ok());
    }

    #[test]
    fn indicator_clashing_with_column_rejected() {
        let records = Records::new(vec![
            rec(&[("race", Value::text("A")), ("race_B", Value::num(1.))]),
            rec(&[("race", Value::text("B")), ("race_B", Value::num(2.))]),
        ]);
        let schema = ReferenceSchema::fit(&records);
        assert_eq!(schema.indicator_names(), ["race_B"]);
        let err = schema.check_compatible(&records).unwrap_err();
        assert!(err.to_string().contains("race_B"));

        let fine = Records::new(vec![rec(&[
            ("race", Value::text("A")),
            ("race_C", Value::num(1.)),
        ])]);
        assert!(schema.check_compatible(&fine).is_ok());
    }

    #[test]
    fn schema_table() {
        let table = ReferenceSchema::fit(&training()).table().to_string();
        assert!(table.contains("Baseline"));
        assert!(table.contains("AfricanAmerican"));
        assert!(table.contains("Asian, Caucasian"));
        assert!(table.contains("No, Steady, Up"));
    }

    #[test]
    fn inconsistent_json_rejected() {
        let unsorted = r#"{"fields":[{"name":"race","values":["Caucasian","Asian"]}]}"#;
        assert!(ReferenceSchema::from_json(unsorted).is_err());
        let empty = r#"{"fields":[{"name":"race","values":[]}]}"#;
        assert!(ReferenceSchema::from_json(empty).is_err());
        let ok = r#"{"fields":[{"name":"race","values":["Asian","Caucasian"]}]}"#;
        assert_eq!(ReferenceSchema::from_json(ok).unwrap().indicator_count(), 1);
    }

    #[test]
    fn save_and_load() {
        let schema = ReferenceSchema::fit(&training());
        let path = std::env::temp_dir().join(format!(
            "readmission-schema-test-{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        schema.save(&path, false).unwrap();
        assert_eq!(ReferenceSchema::load(&path).unwrap(), schema);
        // existing files are only replaced when asked.
        assert!(schema.save(&path, false).is_err());
        ReferenceSchema::default().save(&path, true).unwrap();
        assert_eq!(ReferenceSchema::load(&path).unwrap(), ReferenceSchema::default());

        fs::remove_file(&path).unwrap();
    }
}
