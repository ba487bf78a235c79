//! Sequencing of the feature stages, and the end-of-run report.
//!
//! The derivation stages (diagnosis categories, age, medication changes, service utilization)
//! only look at one record at a time, so they run over the collection in parallel. Categorical
//! encoding needs the reference schema first, which either comes from a previous fitting run or
//! is fitted here from the derived records, and then also runs record by record.
//!
//! Nothing in here adds, drops or reorders rows.
use crate::{
    config::{FeatureConfig, MissingPolicy},
    encoder::{CategoricalEncoder, ReferenceSchema},
    AgeBinMapper, ArcStr, DiagnosisCodeClassifier, MedicationChangeCounter, Record, Records,
    ServiceUtilizationAggregator,
};
use itertools::Itertools;
use qu::ick_use::*;
use rayon::prelude::*;
use std::{collections::BTreeMap, fmt};
use term_data_table::{Cell, Row, Table};

/// A per-record transformation.
///
/// Stages must not depend on other records, so they can be applied to the collection in
/// parallel. Recoverable problems are pushed onto `issues` rather than returned as errors.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, record: &mut Record, issues: &mut Vec<Issue>);
}

/// A recoverable problem with one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// A diagnosis code that isn't an (optionally `E`/`V` prefixed) integer. Classified `Other`.
    UnparseableCode { field: ArcStr, code: ArcStr },
    /// A diagnosis code outside every range. Classified `Other`.
    UnmappedCode { field: ArcStr, code: i32 },
    /// An age label that isn't one of the ten brackets. Mapped to missing.
    UnmappedBracket { label: ArcStr },
    /// Utilization counters that were missing when computing `service_utilization`.
    MissingRequiredNumeric { fields: Vec<ArcStr> },
    /// Utilization counters whose sum is too large to represent. `service_utilization` is missing.
    UtilizationOverflow,
    /// A categorical value not in the reference schema. Encoded as the baseline.
    SchemaDrift { field: ArcStr, value: ArcStr },
    /// A missing categorical value. Encoded as the baseline.
    MissingCategorical { field: ArcStr },
}

impl Issue {
    pub fn kind(&self) -> IssueKind {
        match self {
            Issue::UnparseableCode { .. } => IssueKind::UnparseableCode,
            Issue::UnmappedCode { .. } => IssueKind::UnmappedCode,
            Issue::UnmappedBracket { .. } => IssueKind::UnmappedBracket,
            Issue::MissingRequiredNumeric { .. } => IssueKind::MissingRequiredNumeric,
            Issue::UtilizationOverflow => IssueKind::UtilizationOverflow,
            Issue::SchemaDrift { .. } => IssueKind::SchemaDrift,
            Issue::MissingCategorical { .. } => IssueKind::MissingCategorical,
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Issue::UnparseableCode { field, code } => {
                write!(f, "{}: unparseable diagnosis code \"{}\"", field, code)
            }
            Issue::UnmappedCode { field, code } => {
                write!(f, "{}: diagnosis code {} not in any category", field, code)
            }
            Issue::UnmappedBracket { label } => write!(f, "unknown age bracket \"{}\"", label),
            Issue::MissingRequiredNumeric { fields } => {
                write!(f, "missing utilization counters: {}", fields.iter().join(", "))
            }
            Issue::UtilizationOverflow => f.write_str("utilization counters sum to infinity"),
            Issue::SchemaDrift { field, value } => {
                write!(f, "{}: value \"{}\" not in reference schema", field, value)
            }
            Issue::MissingCategorical { field } => write!(f, "{}: missing value", field),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum IssueKind {
    UnparseableCode,
    UnmappedCode,
    UnmappedBracket,
    MissingRequiredNumeric,
    UtilizationOverflow,
    SchemaDrift,
    MissingCategorical,
}

impl IssueKind {
    pub const ALL: [IssueKind; 7] = [
        IssueKind::UnparseableCode,
        IssueKind::UnmappedCode,
        IssueKind::UnmappedBracket,
        IssueKind::MissingRequiredNumeric,
        IssueKind::UtilizationOverflow,
        IssueKind::SchemaDrift,
        IssueKind::MissingCategorical,
    ];
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            IssueKind::UnparseableCode => "unparseable diagnosis code",
            IssueKind::UnmappedCode => "unmapped diagnosis code",
            IssueKind::UnmappedBracket => "unmapped age bracket",
            IssueKind::MissingRequiredNumeric => "missing utilization counter",
            IssueKind::UtilizationOverflow => "utilization overflow",
            IssueKind::SchemaDrift => "schema drift",
            IssueKind::MissingCategorical => "missing categorical value",
        })
    }
}

/// Everything that went wrong (recoverably) during a run, by row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    rows: Vec<Vec<Issue>>,
}

impl Report {
    pub fn new(rows: Vec<Vec<Issue>>) -> Self {
        Self { rows }
    }

    /// The number of records the run covered.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Issues for the record at `row`.
    pub fn row(&self, row: usize) -> &[Issue] {
        self.rows.get(row).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All issues with their row index, in row order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Issue)> + '_ {
        self.rows
            .iter()
            .enumerate()
            .flat_map(|(row, issues)| issues.iter().map(move |issue| (row, issue)))
    }

    pub fn is_clean(&self) -> bool {
        self.rows.iter().all(Vec::is_empty)
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.iter().filter(|(_, issue)| issue.kind() == kind).count()
    }

    /// Issue counts by kind. Every kind is present, even with a zero count.
    pub fn counts(&self) -> BTreeMap<IssueKind, usize> {
        // B Tree so we get a predictable ordering.
        let mut map: BTreeMap<_, _> = IssueKind::ALL.into_iter().map(|k| (k, 0)).collect();
        for (_, issue) in self.iter() {
            *map.entry(issue.kind()).or_insert(0) += 1;
        }
        map
    }

    /// Rows with at least one issue of the given kind.
    pub fn rows_with(&self, kind: IssueKind) -> Vec<usize> {
        self.iter()
            .filter(|(_, issue)| issue.kind() == kind)
            .map(|(row, _)| row)
            .dedup()
            .collect()
    }

    /// How often each unseen (field, value) pair turned up.
    pub fn drift(&self) -> BTreeMap<(ArcStr, ArcStr), usize> {
        let mut map = BTreeMap::new();
        for (_, issue) in self.iter() {
            if let Issue::SchemaDrift { field, value } = issue {
                *map.entry((field.clone(), value.clone())).or_insert(0) += 1;
            }
        }
        map
    }

    /// Add the issues of a later pass over the same records.
    pub fn merge(&mut self, other: Report) {
        if self.rows.len() < other.rows.len() {
            self.rows.resize_with(other.rows.len(), Vec::new);
        }
        for (row, issues) in self.rows.iter_mut().zip(other.rows) {
            row.extend(issues);
        }
    }

    /// Emit the summary as tracing events.
    ///
    /// Schema drift is logged per (field, value) pair: unseen values silently collapse onto the
    /// baseline otherwise.
    pub fn log(&self) {
        for (kind, count) in self.counts() {
            if count > 0 {
                event!(Level::WARN, "{} record issue(s): {}", count, kind);
            }
        }
        for ((field, value), count) in self.drift() {
            event!(
                Level::WARN,
                "{}: value \"{}\" not in reference schema, encoded as baseline in {} record(s)",
                field,
                value,
                count
            );
        }
        if self.is_clean() {
            event!(Level::INFO, "{} records processed without issues", self.row_count());
        }
    }

    /// Issue counts by kind, with the share of records affected.
    pub fn counts_table(&self) -> Table {
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("Issue"))
                .with_cell(Cell::from("Count"))
                .with_cell(Cell::from("Records affected")),
        );
        let total = self.row_count().max(1) as f64;
        for (kind, count) in self.counts() {
            let rows = self.rows_with(kind).len();
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(kind.to_string()))
                    .with_cell(Cell::from(count.to_string()))
                    .with_cell(Cell::from(format!(
                        "{} ({:.1}%)",
                        rows,
                        rows as f64 * 100. / total
                    ))),
            );
        }
        table
    }

    /// Unseen categorical values and how often each turned up.
    pub fn drift_table(&self) -> Table {
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("Field"))
                .with_cell(Cell::from("Unseen value"))
                .with_cell(Cell::from("Records")),
        );
        for ((field, value), count) in self.drift() {
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(field.to_string()))
                    .with_cell(Cell::from(format!("{:?}", value)))
                    .with_cell(Cell::from(count.to_string())),
            );
        }
        table
    }

    /// Print the summary for humans.
    pub fn print(&self) {
        println!("records: {}", self.row_count());
        println!("{}", self.counts_table());
        if !self.drift().is_empty() {
            println!("unseen categorical values:");
            println!("{}", self.drift_table());
        }
    }
}

/// Run every stage over every record, returning the issues per row.
fn apply_stages(records: &mut Records, stages: &[&dyn Stage]) -> Report {
    let rows = records
        .par_iter_mut()
        .map(|record| {
            let mut issues = vec![];
            for stage in stages {
                stage.apply(record, &mut issues);
            }
            issues
        })
        .collect();
    Report::new(rows)
}

/// The feature pipeline.
///
/// Stage order is fixed: diagnosis categories, age, medication changes, service utilization, then
/// categorical encoding. Encoding has to come last so it sees the derived category fields.
pub struct Pipeline {
    diagnosis: DiagnosisCodeClassifier,
    age: AgeBinMapper,
    medications: MedicationChangeCounter,
    utilization: ServiceUtilizationAggregator,
}

impl Pipeline {
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            diagnosis: DiagnosisCodeClassifier,
            age: AgeBinMapper,
            medications: MedicationChangeCounter,
            utilization: ServiceUtilizationAggregator::new(config.missing_utilization),
        }
    }

    /// The derivation stages, in the order they run.
    pub fn stages(&self) -> [&dyn Stage; 4] {
        [
            &self.diagnosis,
            &self.age,
            &self.medications,
            &self.utilization,
        ]
    }

    /// Run the derivation stages (everything apart from encoding).
    ///
    /// Fails only if utilization counters are missing and the policy is `Reject`.
    pub fn derive(&self, mut records: Records) -> Result<(Records, Report)> {
        let report = apply_stages(&mut records, &self.stages());
        event!(
            Level::INFO,
            "derived features for {} records ({})",
            records.len(),
            self.stages().iter().map(|s| s.name()).join(", ")
        );
        if self.utilization.policy == MissingPolicy::Reject {
            let rows = report.rows_with(IssueKind::MissingRequiredNumeric);
            ensure!(
                rows.is_empty(),
                "{} record(s) are missing utilization counters (rows {})",
                rows.len(),
                rows.iter().take(20).join(", ")
            );
        }
        Ok((records, report))
    }

    /// Derive features and capture the reference schema from the result.
    pub fn fit(&self, records: Records) -> Result<(ReferenceSchema, Report)> {
        let (records, report) = self.derive(records)?;
        let schema = ReferenceSchema::fit(&records);
        Ok((schema, report))
    }

    /// Derive features and encode them against a previously fitted schema.
    pub fn transform(
        &self,
        records: Records,
        schema: &ReferenceSchema,
    ) -> Result<(Records, Report)> {
        let (records, mut report) = self.derive(records)?;
        let (records, encode_report) = encode(records, schema)?;
        report.merge(encode_report);
        report.log();
        Ok((records, report))
    }

    /// Derive features, fit a schema on them and encode, all on the same records.
    pub fn fit_transform(&self, records: Records) -> Result<(Records, ReferenceSchema, Report)> {
        let (records, mut report) = self.derive(records)?;
        let schema = ReferenceSchema::fit(&records);
        let (records, encode_report) = encode(records, &schema)?;
        report.merge(encode_report);
        report.log();
        Ok((records, schema, report))
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(&FeatureConfig::default())
    }
}

fn encode(mut records: Records, schema: &ReferenceSchema) -> Result<(Records, Report)> {
    let encoder = CategoricalEncoder::new(schema);
    encoder.check(&records)?;
    let stages: [&dyn Stage; 1] = [&encoder];
    let report = apply_stages(&mut records, &stages);
    event!(
        Level::INFO,
        "encoded {} categorical fields into {} indicators",
        schema.fields().len(),
        schema.indicator_count()
    );
    Ok((records, report))
}
