//! Latent space illumination driver.
//!
//! Runs MAP-Elites or CMA-ES against an external evaluator command and saves
//! the resulting archive as JSON. The evaluator receives the latent vector
//! as a JSON file argument and must print `Label: value` pairs.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: log filter (default: `fastlsi=info,lsi=info`)

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use fastlsi::{
    illuminate, CommandEvaluator, IdentityGenerator, IlluminationConfig, IlluminationOptions,
    JsonLinesSink, NullSink, QdAlgorithm,
};

#[derive(Parser)]
#[command(name = "lsi")]
#[command(version, about = "Quality-diversity latent space illumination", long_about = None)]
struct Cli {
    /// JSON run configuration; defaults apply to missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Evaluator program
    #[arg(long)]
    evaluator: String,

    /// Argument passed to the evaluator before the artifact path (repeatable)
    #[arg(long = "evaluator-arg", allow_hyphen_values = true)]
    evaluator_args: Vec<String>,

    /// Label of the fitness value in the evaluator output
    #[arg(long, default_value = "Score")]
    fitness_label: String,

    /// Labels of the behavior characteristics, in feature map order
    #[arg(long = "feature-label", default_values_t = [String::from("Enemies"), String::from("AvgHeight")])]
    feature_labels: Vec<String>,

    /// Temporary file the artifact is written to
    #[arg(long, default_value = "lsi_artifact.json")]
    artifact: PathBuf,

    /// Output file for the archive
    #[arg(short, long, default_value = "archive.json")]
    out_archive: PathBuf,

    /// Optional JSON-lines file for record rows and elite snapshots
    #[arg(long)]
    records: Option<PathBuf>,

    /// Evaluator failures tolerated before aborting
    #[arg(long, default_value = "0")]
    max_failures: usize,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "fastlsi=info,lsi=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run(Cli::parse()) {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> fastlsi::Result<()> {
    let config = match &cli.config {
        Some(path) => IlluminationConfig::from_path(path)?,
        None => IlluminationConfig::default(),
    };
    config.validate()?;
    if cli.feature_labels.len() != config.resolutions.len() {
        return Err(fastlsi::Error::InvalidConfig(format!(
            "{} feature labels for a {}-dimensional feature map",
            cli.feature_labels.len(),
            config.resolutions.len()
        )));
    }

    let feature_map = config.feature_map()?;
    let mut algorithm = match &cli.records {
        Some(path) => {
            let sink = JsonLinesSink::new(BufWriter::new(File::create(path)?));
            config.build_algorithm(feature_map, sink)?
        }
        None => config.build_algorithm(feature_map, NullSink)?,
    };

    let mut evaluator = CommandEvaluator::new(cli.evaluator, cli.fitness_label);
    evaluator.args = cli.evaluator_args;
    evaluator.feature_labels = cli.feature_labels;
    evaluator.artifact_path = cli.artifact;

    tracing::info!(
        method = algorithm.method(),
        evaluations = config.num_to_evaluate,
        latent_dim = config.latent_dim,
        "launching latent space illumination"
    );

    let options = IlluminationOptions {
        max_evaluation_failures: cli.max_failures,
        archive_path: Some(cli.out_archive.clone()),
    };
    let summary = illuminate(&mut algorithm, &mut IdentityGenerator, &mut evaluator, &options)?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    tracing::info!(archive = %cli.out_archive.display(), "illumination complete");
    Ok(())
}
