//! Turning the raw extract into something the feature pipeline can use.
//!
//! Steps, in order:
//!
//!  1. Sentinel values (`?` by default) become missing.
//!  2. Rows holding an invalid category value (`gender == "Unknown/Invalid"`) are dropped.
//!  3. Identifier and mostly-empty columns are dropped.
//!  4. The outcome is binarized: `readmitted == "<30"` is 1, anything else is 0.
//!  5. Zero-variance columns are dropped.
//!  6. Column types are inferred: if every non-missing value of a column parses as a finite number
//!     the column becomes numeric, otherwise it stays text.
//!
//! This is the only place rows are removed.
use crate::{config::CleaningConfig, ArcStr, Records, Value};
use itertools::Itertools;
use qu::ick_use::*;
use std::collections::{BTreeSet, HashSet};
use term_data_table::{Cell, Row, Table};

/// What cleaning did to the extract.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanReport {
    pub rows_in: usize,
    pub rows_out: usize,
    /// Sentinel cells replaced with missing.
    pub markers_replaced: usize,
    /// Rows dropped for holding an invalid value, per column.
    pub invalid_rows: Vec<(ArcStr, usize)>,
    pub dropped_columns: Vec<ArcStr>,
    pub constant_columns: Vec<ArcStr>,
    /// Records with a positive outcome after binarization.
    pub positive_outcomes: usize,
    pub numeric_columns: Vec<ArcStr>,
}

impl CleanReport {
    /// What cleaning did, one step per row.
    pub fn table(&self) -> Table {
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("Step"))
                .with_cell(Cell::from("Result")),
        );
        let mut add = |step: String, result: String| {
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(step))
                    .with_cell(Cell::from(result)),
            );
        };
        add("rows".into(), format!("{} -> {}", self.rows_in, self.rows_out));
        add("missing markers replaced".into(), self.markers_replaced.to_string());
        for (column, count) in &self.invalid_rows {
            add(format!("rows dropped for invalid {}", column), count.to_string());
        }
        add("dropped columns".into(), self.dropped_columns.iter().join(", "));
        add("constant columns".into(), self.constant_columns.iter().join(", "));
        add("positive outcomes".into(), self.positive_outcomes.to_string());
        add("numeric columns".into(), self.numeric_columns.iter().join(", "));
        table
    }

    pub fn print(&self) {
        println!("{}", self.table());
    }
}

pub struct Cleaner {
    config: CleaningConfig,
}

impl Cleaner {
    pub fn new(config: CleaningConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CleaningConfig {
        &self.config
    }

    pub fn clean(&self, mut records: Records) -> Result<(Records, CleanReport)> {
        let mut report = CleanReport {
            rows_in: records.len(),
            ..CleanReport::default()
        };

        report.markers_replaced = self.replace_markers(&mut records);
        report.invalid_rows = self.drop_invalid_rows(&mut records);

        let columns = records.columns();
        report.dropped_columns = self
            .config
            .drop_columns
            .iter()
            .filter(|name| columns.contains(name))
            .cloned()
            .collect();
        drop_columns(&mut records, &report.dropped_columns);

        report.positive_outcomes = self.binarize_outcome(&mut records)?;

        report.constant_columns = self.constant_columns(&records);
        drop_columns(&mut records, &report.constant_columns);

        report.numeric_columns = infer_numeric_columns(&mut records);
        report.rows_out = records.len();

        event!(
            Level::INFO,
            "cleaned {} rows into {} rows, {} columns ({} numeric)",
            report.rows_in,
            report.rows_out,
            records.columns().len(),
            report.numeric_columns.len()
        );
        Ok((records, report))
    }

    fn replace_markers(&self, records: &mut Records) -> usize {
        let markers = &self.config.missing_markers;
        let mut replaced = 0;
        records.for_each_mut(|record| {
            record.values_mut().for_each(|value| {
                if matches!(value.as_text(), Some(text) if markers.iter().any(|m| &**m == text)) {
                    *value = Value::Missing;
                    replaced += 1;
                }
            })
        });
        replaced
    }

    fn drop_invalid_rows(&self, records: &mut Records) -> Vec<(ArcStr, usize)> {
        let invalid = &self.config.invalid_values;
        let mut counts = vec![0; invalid.len()];
        records.retain(|record| {
            for ((column, values), count) in invalid.iter().zip(counts.iter_mut()) {
                if let Some(text) = record.get(column).and_then(Value::as_text) {
                    if values.iter().any(|v| &**v == text) {
                        *count += 1;
                        return false;
                    }
                }
            }
            true
        });
        let counts: Vec<(ArcStr, usize)> = invalid.keys().cloned().zip(counts).collect();
        for (column, count) in &counts {
            if *count > 0 {
                event!(
                    Level::INFO,
                    "dropped {} rows with an invalid value for {}",
                    count,
                    column
                );
            }
        }
        counts
    }

    /// Returns the number of positive outcomes.
    ///
    /// Values that are already numeric are taken to be binarized already.
    fn binarize_outcome(&self, records: &mut Records) -> Result<usize> {
        let field = &*self.config.outcome_field;
        if records.is_empty() {
            return Ok(0);
        }
        if !records.columns().iter().any(|name| &**name == field) {
            event!(
                Level::WARN,
                "outcome field \"{}\" not present, leaving records unlabelled",
                field
            );
            return Ok(0);
        }
        let positive = &*self.config.outcome_positive;
        let mut count = 0;
        for record in records.iter_mut() {
            let Some(value) = record.get_mut(field) else {
                bail!("outcome field \"{}\" missing from some records", field);
            };
            let is_positive = match value {
                Value::Numeric(v) => {
                    ensure!(
                        *v == 0. || *v == 1.,
                        "outcome field \"{}\" holds non-binary number {}",
                        field,
                        v
                    );
                    *v == 1.
                }
                Value::Text(text) => &**text == positive,
                Value::Missing => false,
            };
            *value = Value::from(is_positive);
            if is_positive {
                count += 1;
            }
        }
        Ok(count)
    }

    /// The configured constant columns that are present, plus (if enabled) every other column
    /// with at most one distinct non-missing value. The outcome is never included.
    fn constant_columns(&self, records: &Records) -> Vec<ArcStr> {
        let columns = records.columns();
        let configured: Vec<ArcStr> = self
            .config
            .constant_columns
            .iter()
            .filter(|name| columns.contains(name))
            .cloned()
            .collect();
        if !self.config.drop_all_constant {
            return configured;
        }
        columns
            .into_iter()
            .filter(|name| {
                *name != self.config.outcome_field
                    && (configured.contains(name) || distinct_values(records, name) <= 1)
            })
            .collect()
    }
}

impl Default for Cleaner {
    fn default() -> Self {
        Self::new(CleaningConfig::default())
    }
}

fn drop_columns(records: &mut Records, columns: &[ArcStr]) {
    if columns.is_empty() {
        return;
    }
    records.for_each_mut(|record| record.retain(|name, _| !columns.iter().any(|c| &**c == name)));
}

fn distinct_values(records: &Records, column: &str) -> usize {
    records
        .column(column)
        .flatten()
        .filter(|value| !value.is_missing())
        .map(|value| value.to_string())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Convert every column whose non-missing values all parse as finite numbers to numeric.
///
/// Columns with no non-missing values are left alone. Returns the names of the numeric columns,
/// in column order.
pub fn infer_numeric_columns(records: &mut Records) -> Vec<ArcStr> {
    let numeric: Vec<ArcStr> = records
        .columns()
        .into_iter()
        .filter(|name| {
            let mut any = false;
            let all = records.column(name).flatten().all(|value| match value {
                Value::Missing => true,
                Value::Numeric(_) => {
                    any = true;
                    true
                }
                Value::Text(text) => {
                    any = true;
                    parse_finite(text).is_some()
                }
            });
            all && any
        })
        .collect();

    let lookup: HashSet<&str> = numeric.iter().map(|name| &**name).collect();
    records.for_each_mut(|record| {
        for (name, value) in record.iter_mut() {
            if !lookup.contains(&**name) {
                continue;
            }
            if let Value::Text(text) = value {
                // every text value in the column parsed above.
                let parsed = parse_finite(text).map(Value::num).unwrap_or(Value::Missing);
                *value = parsed;
            }
        }
    });
    numeric
}

fn parse_finite(text: &str) -> Option<f64> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}
