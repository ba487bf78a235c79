use clap::Parser;
use qu::ick_use::*;
use readmission_features::{header, Cleaner, Pipeline, PipelineConfig, Records};
use std::path::PathBuf;

/// Fit the reference schema on a training extract and save it.
#[derive(Parser)]
struct Opt {
    /// The raw encounter extract (headed CSV).
    #[clap(short, long)]
    input: PathBuf,
    /// Where to save the reference schema (JSON).
    #[clap(short, long)]
    output: PathBuf,
    /// Pipeline configuration (TOML). The defaults are used if not given.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// If set, allow overwriting an existing file at the save location
    #[clap(long)]
    overwrite: bool,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = PipelineConfig::load_or_default(opt.config.as_ref())?;
    let records = Records::load_csv(&opt.input)?;

    header("Cleaning");
    let (records, clean_report) = Cleaner::new(config.cleaning).clean(records)?;
    clean_report.print();

    header("Derived features");
    let (schema, report) = Pipeline::new(&config.features).fit(records)?;
    report.log();
    report.print();

    schema.save(&opt.output, opt.overwrite)?;

    header("Reference schema");
    println!("{}", schema.table());
    println!(
        "{} categorical fields, {} indicators, saved to \"{}\"",
        schema.fields().len(),
        schema.indicator_count(),
        opt.output.display()
    );
    Ok(())
}
