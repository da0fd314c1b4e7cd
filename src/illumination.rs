//! The generate → materialize → evaluate → archive loop and its collaborators.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use serde::Serialize;

use crate::algorithm::QdAlgorithm;
use crate::error::{Error, Result};
use crate::feature_map::ArchiveStats;
use crate::individual::Evaluation;

/// Turns a parameter vector into an artifact, e.g. by running a generative model.
///
/// Must be deterministic for a given model and input. Errors end the run.
pub trait Generator {
    type Artifact;

    fn materialize(&mut self, parameters: &[f64]) -> Result<Self::Artifact>;
}

/// Scores an artifact and extracts its behavior characteristics.
///
/// Return [`Error::EvaluatorProtocol`] for output that cannot be used; the
/// loop then drops that individual instead of aborting.
pub trait Evaluator<A> {
    fn evaluate(&mut self, artifact: &A) -> Result<Evaluation>;
}

impl<A, F> Evaluator<A> for F
where
    F: FnMut(&A) -> Result<Evaluation>,
{
    fn evaluate(&mut self, artifact: &A) -> Result<Evaluation> {
        self(artifact)
    }
}

/// Uses the parameter vector itself as the artifact.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityGenerator;

impl Generator for IdentityGenerator {
    type Artifact = Vec<f64>;

    fn materialize(&mut self, parameters: &[f64]) -> Result<Vec<f64>> {
        Ok(parameters.to_vec())
    }
}

/// Read the number following `label:` in an evaluator's text output.
///
/// Only the first occurrence of the label counts.
pub fn parse_labeled_value(output: &str, label: &str) -> Result<f64> {
    let marker = format!("{label}:");
    let (_, rest) = output
        .split_once(marker.as_str())
        .ok_or_else(|| Error::EvaluatorProtocol(format!("missing field `{label}`")))?;
    let token = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::EvaluatorProtocol(format!("field `{label}` has no value")))?;
    token.parse::<f64>().map_err(|_| {
        Error::EvaluatorProtocol(format!("field `{label}` is not a number: {token:?}"))
    })
}

/// Runs an external program on every artifact.
///
/// The artifact is written as JSON to `artifact_path`, which is passed as the
/// last argument. The program must print `Label: value` pairs for the fitness
/// and each feature on stdout.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    pub program: String,
    pub args: Vec<String>,
    pub artifact_path: PathBuf,
    pub fitness_label: String,
    pub feature_labels: Vec<String>,
    /// Extra values kept in the records. The fitness alone when empty.
    pub stats_labels: Vec<String>,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<String>, fitness_label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            artifact_path: std::env::temp_dir().join("lsi_artifact.json"),
            fitness_label: fitness_label.into(),
            feature_labels: Vec::new(),
            stats_labels: Vec::new(),
        }
    }

    pub fn parse(&self, stdout: &str) -> Result<Evaluation> {
        let fitness = parse_labeled_value(stdout, &self.fitness_label)?;
        let features = self
            .feature_labels
            .iter()
            .map(|label| parse_labeled_value(stdout, label))
            .collect::<Result<Vec<_>>>()?;
        let stats = if self.stats_labels.is_empty() {
            vec![fitness]
        } else {
            self.stats_labels
                .iter()
                .map(|label| parse_labeled_value(stdout, label))
                .collect::<Result<Vec<_>>>()?
        };
        let evaluation = Evaluation::new(fitness, features).with_stats(stats);
        evaluation.check_finite()?;
        Ok(evaluation)
    }
}

impl<A: Serialize> Evaluator<A> for CommandEvaluator {
    fn evaluate(&mut self, artifact: &A) -> Result<Evaluation> {
        fs::write(&self.artifact_path, serde_json::to_vec(artifact)?)?;
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&self.artifact_path)
            .output()?;
        if !output.status.success() {
            return Err(Error::EvaluatorProtocol(format!(
                "`{}` exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        self.parse(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Debug, Clone, Default)]
pub struct IlluminationOptions {
    /// Evaluator protocol failures tolerated before the run aborts.
    pub max_evaluation_failures: usize,
    /// Where to save the archive once the budget is spent.
    pub archive_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IlluminationSummary {
    pub method: &'static str,
    pub evaluated: usize,
    /// Individuals dropped because the evaluator failed on them.
    pub failures: usize,
    pub archive: ArchiveStats,
}

/// Drive `algorithm` until its evaluation budget is spent.
///
/// Individuals are generated, materialized, evaluated and returned one at a
/// time, in order. Evaluator protocol errors, including non-finite fitness or
/// features rejected on return, drop the individual and count as a failure.
/// Any other error, or more failures than allowed, ends the run with the
/// archive and algorithm state as they were.
pub fn illuminate<Q, G, E>(
    algorithm: &mut Q,
    generator: &mut G,
    evaluator: &mut E,
    options: &IlluminationOptions,
) -> Result<IlluminationSummary>
where
    Q: QdAlgorithm + ?Sized,
    G: Generator,
    E: Evaluator<G::Artifact>,
{
    let method = algorithm.method();
    tracing::info!(method, "starting illumination");

    let mut failures = 0;
    while algorithm.is_running() {
        let individual = algorithm.generate_individual();
        let artifact = generator.materialize(individual.parameters())?;
        let outcome = evaluator.evaluate(&artifact).and_then(|evaluation| {
            algorithm.return_evaluated_individual(individual.with_evaluation(evaluation))
        });
        match outcome {
            Ok(_) => {}
            Err(err) if err.is_per_individual() => {
                failures += 1;
                tracing::warn!(method, failures, error = %err, "evaluation failed, individual dropped");
                if failures > options.max_evaluation_failures {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }

    let archive = algorithm.feature_map().read();
    if let Some(path) = &options.archive_path {
        archive.save(path)?;
        tracing::info!(path = %path.display(), elites = archive.len(), "archive saved");
    }
    let summary = IlluminationSummary {
        method,
        evaluated: algorithm.evaluated(),
        failures,
        archive: archive.stats(),
    };
    tracing::info!(
        method,
        evaluated = summary.evaluated,
        failures,
        coverage = summary.archive.coverage,
        qd_score = summary.archive.qd_score,
        "illumination finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_map::FeatureMap;
    use crate::map_elites::{MapElitesAlgorithm, MapElitesConfig};

    fn small_map_elites(budget: usize) -> MapElitesAlgorithm {
        let map = FeatureMap::new(vec![(-3.0, 3.0)], vec![6]).unwrap().into_shared();
        let config = MapElitesConfig {
            latent_dim: 2,
            mutation_power: 0.2,
            initial_population: 4,
            num_to_evaluate: budget,
            record_frequency: 0,
        };
        MapElitesAlgorithm::new(config, map).unwrap().with_seed(3)
    }

    #[test]
    fn parses_labeled_output() {
        let out = "Game Status: WIN\nEnemies: 12 AvgHeight: 4.5\nScore: 1320.0\n";
        assert_eq!(parse_labeled_value(out, "Enemies").unwrap(), 12.0);
        assert_eq!(parse_labeled_value(out, "AvgHeight").unwrap(), 4.5);
        assert_eq!(parse_labeled_value(out, "Score").unwrap(), 1320.0);
    }

    #[test]
    fn malformed_output_is_a_protocol_error() {
        assert!(matches!(
            parse_labeled_value("Score: n/a", "Score"),
            Err(Error::EvaluatorProtocol(_))
        ));
        assert!(matches!(
            parse_labeled_value("Enemies: 3", "Score"),
            Err(Error::EvaluatorProtocol(_))
        ));
        assert!(matches!(
            parse_labeled_value("Score:", "Score"),
            Err(Error::EvaluatorProtocol(_))
        ));
    }

    #[test]
    fn command_evaluator_parses_features_and_stats() {
        let mut eval = CommandEvaluator::new("unused", "Score");
        eval.feature_labels = vec!["Enemies".into(), "AvgHeight".into()];
        let parsed = eval.parse("Enemies: 7 AvgHeight: 2.25 Score: 99").unwrap();
        assert_eq!(parsed.fitness, 99.0);
        assert_eq!(parsed.features, vec![7.0, 2.25]);
        assert_eq!(parsed.stats, vec![99.0]);
    }

    #[test]
    fn non_finite_output_is_a_protocol_error() {
        let mut eval = CommandEvaluator::new("unused", "Score");
        eval.feature_labels = vec!["Enemies".into()];
        assert!(matches!(
            eval.parse("Enemies: 3 Score: NaN"),
            Err(Error::EvaluatorProtocol(_))
        ));
        assert!(matches!(
            eval.parse("Enemies: inf Score: 10"),
            Err(Error::EvaluatorProtocol(_))
        ));
    }

    #[test]
    fn nan_fitness_is_dropped_and_cells_keep_improving() {
        let mut algo = small_map_elites(12);
        let mut calls = 0;
        // every individual lands in the same cell
        let mut evaluator = |_: &Vec<f64>| -> Result<Evaluation> {
            calls += 1;
            let fitness = if calls == 1 { f64::NAN } else { calls as f64 };
            Ok(Evaluation::new(fitness, vec![0.0]))
        };
        let options = IlluminationOptions {
            max_evaluation_failures: 1,
            archive_path: None,
        };
        let summary = illuminate(&mut algo, &mut IdentityGenerator, &mut evaluator, &options).unwrap();

        assert_eq!(summary.failures, 1);
        assert_eq!(summary.evaluated, 12);
        assert_eq!(summary.archive.occupied, 1);
        assert_eq!(summary.archive.max_fitness, 13.0);
        assert_eq!(summary.archive.qd_score, 13.0);
    }

    struct FailingGenerator {
        remaining: usize,
    }

    impl Generator for FailingGenerator {
        type Artifact = Vec<f64>;

        fn materialize(&mut self, parameters: &[f64]) -> Result<Vec<f64>> {
            if self.remaining == 0 {
                return Err(Error::Generator("model weights not loaded".into()));
            }
            self.remaining -= 1;
            Ok(parameters.to_vec())
        }
    }

    #[test]
    fn generator_failure_ends_the_run() {
        let mut algo = small_map_elites(10);
        let mut generator = FailingGenerator { remaining: 2 };
        let mut evaluator =
            |a: &Vec<f64>| -> Result<Evaluation> { Ok(Evaluation::new(a[0], vec![a[0]])) };
        let options = IlluminationOptions {
            max_evaluation_failures: 100,
            archive_path: None,
        };
        let err = illuminate(&mut algo, &mut generator, &mut evaluator, &options).unwrap_err();
        assert!(matches!(err, Error::Generator(_)));
        assert_eq!(algo.evaluated(), 2);
    }

    #[test]
    fn loop_spends_the_budget() {
        let mut algo = small_map_elites(25);
        let mut evaluator =
            |a: &Vec<f64>| -> Result<Evaluation> { Ok(Evaluation::new(-a[1].abs(), vec![a[0]])) };
        let summary = illuminate(
            &mut algo,
            &mut IdentityGenerator,
            &mut evaluator,
            &IlluminationOptions::default(),
        )
        .unwrap();
        assert_eq!(summary.evaluated, 25);
        assert_eq!(summary.failures, 0);
        assert!(summary.archive.occupied > 0);
    }

    #[test]
    fn tolerated_failures_skip_individuals() {
        let mut algo = small_map_elites(10);
        let mut calls = 0;
        let mut evaluator = |a: &Vec<f64>| -> Result<Evaluation> {
            calls += 1;
            if calls % 3 == 0 {
                Err(Error::EvaluatorProtocol("garbled".into()))
            } else {
                Ok(Evaluation::new(a[0], vec![a[0]]))
            }
        };
        let options = IlluminationOptions {
            max_evaluation_failures: 100,
            archive_path: None,
        };
        let summary = illuminate(&mut algo, &mut IdentityGenerator, &mut evaluator, &options).unwrap();
        assert_eq!(summary.evaluated, 10);
        assert_eq!(summary.failures, 4);
    }

    #[test]
    fn failure_beyond_tolerance_aborts_with_state_intact() {
        let mut algo = small_map_elites(10);
        let mut calls = 0;
        let mut evaluator = |a: &Vec<f64>| -> Result<Evaluation> {
            calls += 1;
            if calls == 4 {
                Err(Error::EvaluatorProtocol("no Score field".into()))
            } else {
                Ok(Evaluation::new(a[0], vec![a[0]]))
            }
        };
        let err = illuminate(
            &mut algo,
            &mut IdentityGenerator,
            &mut evaluator,
            &IlluminationOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::EvaluatorProtocol(_)));
        assert_eq!(algo.evaluated(), 3);
        assert!(!algo.feature_map().read().is_empty());
    }

    #[test]
    fn wrong_feature_count_is_fatal() {
        let mut algo = small_map_elites(10);
        let mut evaluator =
            |a: &Vec<f64>| -> Result<Evaluation> { Ok(Evaluation::new(a[0], vec![a[0], a[1]])) };
        let err = illuminate(
            &mut algo,
            &mut IdentityGenerator,
            &mut evaluator,
            &IlluminationOptions {
                max_evaluation_failures: 100,
                archive_path: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn archive_is_saved_on_exit() {
        let path = std::env::temp_dir().join(format!("fastlsi-archive-{}.json", std::process::id()));
        let mut algo = small_map_elites(12);
        let mut evaluator =
            |a: &Vec<f64>| -> Result<Evaluation> { Ok(Evaluation::new(a[1], vec![a[0]])) };
        let options = IlluminationOptions {
            max_evaluation_failures: 0,
            archive_path: Some(path.clone()),
        };
        illuminate(&mut algo, &mut IdentityGenerator, &mut evaluator, &options).unwrap();

        let loaded = FeatureMap::open(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(loaded.len(), algo.feature_map().read().len());
    }
}
