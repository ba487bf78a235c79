use clap::Parser;
use itertools::Itertools;
use noisy_float::prelude::*;
use qu::ick_use::*;
use readmission_features::{
    header, Cleaner, Pipeline, PipelineConfig, Range, RangeSet, Records, ReferenceSchema, Value,
    UTILIZATION_FIELD,
};
use std::path::PathBuf;
use term_data_table::{Cell, Row, Table};

/// Clean an extract and turn it into numeric features.
#[derive(Parser)]
struct Opt {
    /// The raw encounter extract (headed CSV).
    #[clap(short, long)]
    input: PathBuf,
    /// A reference schema saved by `fit_schema`. If not given, one is fitted on the input.
    #[clap(short, long)]
    schema: Option<PathBuf>,
    /// Pipeline configuration (TOML). The defaults are used if not given.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// How many records to print.
    #[clap(long, default_value = "5")]
    head: usize,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = PipelineConfig::load_or_default(opt.config.as_ref())?;
    let records = Records::load_csv(&opt.input)?;

    header("Cleaning");
    let (records, clean_report) = Cleaner::new(config.cleaning).clean(records)?;
    clean_report.print();

    let pipeline = Pipeline::new(&config.features);
    let (features, report) = match &opt.schema {
        Some(path) => {
            let schema = ReferenceSchema::load(path)?;
            pipeline.transform(records, &schema)?
        }
        None => {
            event!(Level::INFO, "no schema given, fitting one on the input");
            let (features, _, report) = pipeline.fit_transform(records)?;
            (features, report)
        }
    };

    header("Features");
    let columns = features.columns();
    println!("shape: {} rows x {} columns", features.len(), columns.len());
    println!("columns: {}", columns.iter().join(", "));
    println!("{}", features.head_table(opt.head));

    header("Service utilization");
    let buckets = RangeSet::new(vec![
        Range::new(r64(0.), Some(r64(1.))),
        Range::new(r64(1.), Some(r64(2.))),
        Range::new(r64(2.), Some(r64(5.))),
        Range::new(r64(5.), Some(r64(10.))),
        Range::new(r64(10.), None),
    ]);
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from("Visits"))
            .with_cell(Cell::from("Count"))
            .with_cell(Cell::from("Percentage")),
    );
    let total = features.len().max(1);
    let utilization = features
        .column(UTILIZATION_FIELD)
        .map(|value| value.and_then(Value::as_numeric));
    for (label, count) in buckets
        .bucket_values_with_missing(utilization)
        .for_display()
    {
        table.add_row(
            Row::new()
                .with_cell(Cell::from(label.to_string()))
                .with_cell(Cell::from(count.to_string()))
                .with_cell(Cell::from(format!(
                    "{:.1}%",
                    count as f64 / total as f64 * 100.
                ))),
        );
    }
    println!("{}", table);

    header("Issues");
    report.print();
    Ok(())
}
