mod age;
pub mod clean;
pub mod config;
pub mod diagnosis;
pub mod encoder;
mod medications;
pub mod pipeline;
mod range;
mod util;
mod utilization;

pub use anyhow::{Context, Error};
use itertools::Itertools;
use noisy_float::prelude::*;
use qu::ick_use::*;
use std::{
    collections::BTreeSet,
    fmt, fs, io,
    ops::{Deref, DerefMut},
    path::Path,
    sync::Arc,
};
use term_data_table::{Cell, Row, Table};

pub use crate::{
    age::{AgeBinMapper, AGE_BRACKETS},
    clean::{CleanReport, Cleaner},
    config::{CleaningConfig, FeatureConfig, MissingPolicy, PipelineConfig},
    diagnosis::{classify, DiagnosisCategory, DiagnosisCodeClassifier},
    encoder::{CategoricalEncoder, CategoricalField, ReferenceSchema},
    medications::{MedicationChangeCounter, MEDICATIONS},
    pipeline::{Issue, IssueKind, Pipeline, Report, Stage},
    range::{Range, RangeSet, RangeSetCountsWithMissing},
    util::header,
    utilization::{
        ServiceUtilizationAggregator, Utilization, UTILIZATION_COUNTERS, UTILIZATION_FIELD,
    },
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;

/// A single cell of an encounter record.
///
/// Numbers are stored as `R64`, so a numeric cell can never hold NaN. Anything that isn't a finite
/// number is either text or missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Numeric(R64),
    Text(ArcStr),
    Missing,
}

impl Value {
    pub fn text(s: impl Into<ArcStr>) -> Self {
        Value::Text(s.into())
    }

    /// Non-finite input becomes `Missing`.
    pub fn num(v: f64) -> Self {
        R64::try_new(v).map(Value::Numeric).unwrap_or(Value::Missing)
    }

    /// Interpret a raw CSV cell: the empty string is missing, everything else is text.
    pub fn from_cell(cell: &str) -> Self {
        if cell.is_empty() {
            Value::Missing
        } else {
            Value::Text(cell.into())
        }
    }

    pub fn as_numeric(&self) -> Option<R64> {
        match self {
            Value::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Value::Text(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Numeric(v) => fmt::Display::fmt(&v.raw(), f),
            Value::Text(s) => f.write_str(s),
            Value::Missing => f.write_str("NA"),
        }
    }
}

impl From<f64> for Value {
    fn from(from: f64) -> Self {
        Value::num(from)
    }
}

impl From<R64> for Value {
    fn from(from: R64) -> Self {
        Value::Numeric(from)
    }
}

impl From<bool> for Value {
    fn from(from: bool) -> Self {
        Value::Numeric(if from { r64(1.) } else { r64(0.) })
    }
}

impl<'a> From<&'a str> for Value {
    fn from(from: &'a str) -> Self {
        Value::text(from)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(from: Option<T>) -> Self {
        from.map(Into::into).unwrap_or(Value::Missing)
    }
}

/// One encounter: an ordered mapping from field name to value.
///
/// Field names are unique. Stages replace fields in place where they keep the name, and append
/// new derived fields at the end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(ArcStr, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.position(name).map(|idx| &self.fields[idx].1)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        let idx = self.position(name)?;
        Some(&mut self.fields[idx].1)
    }

    /// Replace the value of `name` in place, or append it if the field doesn't exist yet.
    pub fn set(&mut self, name: &str, value: Value) {
        match self.get_mut(name) {
            Some(slot) => *slot = value,
            None => self.fields.push((name.into(), value)),
        }
    }

    /// Append a field the caller knows isn't present yet.
    pub fn push(&mut self, name: impl Into<ArcStr>, value: Value) {
        let name = name.into();
        debug_assert!(!self.contains(&name), "duplicate field \"{}\"", name);
        self.fields.push((name, value));
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.position(name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn retain(&mut self, mut f: impl FnMut(&str, &Value) -> bool) {
        self.fields.retain(|(name, value)| f(name, value))
    }

    pub fn names(&self) -> impl Iterator<Item = &ArcStr> + '_ {
        self.fields.iter().map(|(name, _)| name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArcStr, &Value)> + '_ {
        self.fields.iter().map(|(name, value)| (name, value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ArcStr, &mut Value)> + '_ {
        self.fields.iter_mut().map(|(name, value)| (&*name, value))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> + '_ {
        self.fields.iter_mut().map(|(_, value)| value)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| &**n == name)
    }
}

impl<K> FromIterator<(K, Value)> for Record
where
    K: Into<ArcStr>,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (K, Value)>,
    {
        let mut record = Record::new();
        for (name, value) in iter {
            let name = name.into();
            record.set(&name, value);
        }
        record
    }
}

impl IntoIterator for Record {
    type Item = (ArcStr, Value);
    type IntoIter = std::vec::IntoIter<(ArcStr, Value)>;
    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// An ordered collection of encounter records.
///
/// Row order is meaningful: no stage adds, drops or reorders rows apart from the cleaning stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Records {
    els: Vec<Record>,
}

impl Records {
    pub fn new(els: Vec<Record>) -> Self {
        Self { els }
    }

    /// Load encounters from a headed CSV file.
    ///
    /// Every non-empty cell is read as text. Numeric columns are recognised later, by the
    /// cleaning stage.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<Records> {
            let file = fs::File::open(path)?;
            Records::from_reader(io::BufReader::new(file))
        }
        let path = path.as_ref();
        inner(path).with_context(|| format!("while loading \"{}\"", path.display()))
    }

    pub fn from_reader(reader: impl io::Read) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers: Vec<ArcStr> = reader.headers()?.iter().map(ArcStr::from).collect();
        let unique = headers.iter().collect::<BTreeSet<_>>();
        ensure!(
            unique.len() == headers.len(),
            "duplicate column names in header: {}",
            headers.iter().duplicates().join(", ")
        );

        let els = reader
            .into_records()
            .map(|row| -> Result<Record> {
                let row = row?;
                Ok(headers
                    .iter()
                    .cloned()
                    .zip_eq(row.iter().map(Value::from_cell))
                    .collect())
            })
            .collect::<Result<Vec<Record>>>()?;
        event!(
            Level::INFO,
            "loaded {} records with {} columns",
            els.len(),
            headers.len()
        );
        Ok(Self::new(els))
    }

    /// The field names of the collection, taken from the first record.
    ///
    /// All records share the same fields, so this is the column list of the whole collection.
    pub fn columns(&self) -> Vec<ArcStr> {
        self.els
            .first()
            .map(|rec| rec.names().cloned().collect())
            .unwrap_or_default()
    }

    /// Iterate over the values of one column. `None` where a record lacks the field.
    pub fn column<'a>(&'a self, name: &'a str) -> impl Iterator<Item = Option<&'a Value>> + 'a {
        self.els.iter().map(move |rec| rec.get(name))
    }

    /// Iterate over the records.
    pub fn iter(&self) -> impl Iterator<Item = &Record> + '_ {
        self.els.iter()
    }

    pub fn retain(&mut self, f: impl FnMut(&Record) -> bool) {
        self.els.retain(f)
    }

    /// Apply `f` to every record.
    pub fn for_each_mut(&mut self, f: impl FnMut(&mut Record)) {
        self.els.iter_mut().for_each(f)
    }

    pub fn into_vec(self) -> Vec<Record> {
        self.els
    }

    /// The column names and the first `rows` records as a table.
    pub fn head_table(&self, rows: usize) -> Table {
        let header = self
            .columns()
            .iter()
            .fold(Row::new(), |row, column| row.with_cell(Cell::from(column.to_string())));
        let mut table = Table::new().with_row(header);
        for record in self.els.iter().take(rows) {
            table.add_row(
                record
                    .iter()
                    .fold(Row::new(), |row, (_, value)| row.with_cell(Cell::from(value.to_string()))),
            );
        }
        table
    }
}

impl Deref for Records {
    type Target = [Record];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl DerefMut for Records {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.els
    }
}

impl<'a> IntoIterator for &'a Records {
    type IntoIter = <&'a [Record] as IntoIterator>::IntoIter;
    type Item = &'a Record;
    fn into_iter(self) -> Self::IntoIter {
        self.els.iter()
    }
}

impl IntoIterator for Records {
    type IntoIter = std::vec::IntoIter<Record>;
    type Item = Record;
    fn into_iter(self) -> Self::IntoIter {
        self.els.into_iter()
    }
}

impl FromIterator<Record> for Records {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Record>,
    {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::{Record, Records, Value};

    #[test]
    fn record_set_replaces_in_place() {
        let mut record: Record = [("a", Value::num(1.)), ("b", Value::text("x"))]
            .into_iter()
            .collect();
        record.set("a", Value::num(2.));
        record.set("c", Value::Missing);
        let names: Vec<_> = record.names().map(|n| n.to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(record.get("a"), Some(&Value::num(2.)));
        assert_eq!(record.remove("b"), Some(Value::text("x")));
        assert!(!record.contains("b"));
    }

    #[test]
    fn non_finite_numbers_are_missing() {
        assert_eq!(Value::num(f64::NAN), Value::Missing);
        assert_eq!(Value::num(f64::INFINITY), Value::Missing);
        assert_eq!(Value::num(f64::NEG_INFINITY), Value::Missing);
        assert_eq!(Value::num(1e308), Value::Numeric(noisy_float::prelude::r64(1e308)));
        assert_eq!(Value::from(true), Value::num(1.));
    }

    #[test]
    fn load_from_csv() {
        let input = "age,gender,diag_1\n[50-60), Female ,250.83\n[70-80),Male,\n";
        let records = Records::from_reader(input.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        let columns: Vec<_> = records.columns().iter().map(|c| c.to_string()).collect();
        assert_eq!(columns, ["age", "gender", "diag_1"]);
        assert_eq!(records[0].get("gender"), Some(&Value::text("Female")));
        assert_eq!(records[1].get("diag_1"), Some(&Value::Missing));
    }

    #[test]
    fn head_table_shows_first_rows() {
        let input = "age,gender\n[50-60),Female\n[70-80),Male\n[20-30),Other\n";
        let records = Records::from_reader(input.as_bytes()).unwrap();
        let table = records.head_table(2).to_string();
        assert!(table.contains("gender"));
        assert!(table.contains("[70-80)"));
        assert!(!table.contains("[20-30)"));
    }

    #[test]
    fn duplicate_headers_rejected() {
        let input = "a,a\n1,2\n";
        assert!(Records::from_reader(input.as_bytes()).is_err());
    }
}
