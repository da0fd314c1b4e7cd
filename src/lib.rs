//! Quality-diversity search over a generative model's latent space.
//!
//! A [`FeatureMap`] archive keeps the fittest individual per behavior cell.
//! Either [`MapElitesAlgorithm`] or [`CmaEsAlgorithm`] proposes candidates,
//! and [`illuminate`] runs them through an external [`Generator`] and
//! [`Evaluator`] until the evaluation budget is spent.

pub mod algorithm;
pub mod cma_es;
pub mod config;
pub mod decomp;
pub mod error;
pub mod feature_map;
pub mod illumination;
pub mod individual;
pub mod map_elites;
pub mod records;

pub use algorithm::{Algorithm, QdAlgorithm};
pub use cma_es::{CmaEsAlgorithm, CmaEsConfig, RestartReason, StrategyParameters};
pub use config::{AlgorithmKind, IlluminationConfig};
pub use decomp::DecompMatrix;
pub use error::{Error, Result};
pub use feature_map::{ArchiveStats, FeatureMap, SharedFeatureMap};
pub use illumination::{
    illuminate, CommandEvaluator, Evaluator, Generator, IdentityGenerator, IlluminationOptions,
    IlluminationSummary,
};
pub use individual::{Delta, Evaluation, Individual};
pub use map_elites::{MapElitesAlgorithm, MapElitesConfig};
pub use records::{JsonLinesSink, MemorySink, NullSink, RecordSink};

/// Test-only helpers to run seeded searches from integration tests.
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils {
    use super::{
        CmaEsAlgorithm, CmaEsConfig, Evaluation, FeatureMap, MapElitesAlgorithm, MapElitesConfig,
        QdAlgorithm,
    };

    /// `-||x||²`, maximal at the origin.
    pub fn neg_sphere(x: &[f64]) -> f64 {
        -x.iter().map(|v| v * v).sum::<f64>()
    }

    pub fn distance_to_origin(x: &[f64]) -> f64 {
        x.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// Run MAP-Elites with a fixed seed until its budget is spent.
    pub fn run_map_elites_seeded(
        config: MapElitesConfig,
        feature_map: FeatureMap,
        seed: u64,
        mut objective: impl FnMut(&[f64]) -> Evaluation,
    ) -> MapElitesAlgorithm {
        let mut algo = MapElitesAlgorithm::new(config, feature_map.into_shared())
            .expect("valid MAP-Elites configuration")
            .with_seed(seed);
        while algo.is_running() {
            let ind = algo.generate_individual();
            let eval = objective(ind.parameters());
            algo.return_evaluated_individual(ind.with_evaluation(eval))
                .expect("evaluation accepted");
        }
        algo
    }

    /// Seeded CMA-ES starting from `x0`.
    pub fn cma_es_seeded(
        x0: Vec<f64>,
        sigma: f64,
        population_size: usize,
        num_to_evaluate: usize,
        seed: u64,
    ) -> CmaEsAlgorithm {
        let map = FeatureMap::new(vec![(-10.0, 10.0)], vec![20]).expect("valid feature map");
        let config = CmaEsConfig {
            latent_dim: x0.len(),
            mutation_power: sigma,
            population_size,
            num_to_evaluate,
            record_frequency: 0,
        };
        CmaEsAlgorithm::new(config, map.into_shared())
            .expect("valid CMA-ES configuration")
            .with_seed(seed)
            .with_initial_mean(x0)
            .expect("start point matches dimension")
    }

    /// Feed `generations` complete generations through `algo`.
    ///
    /// The single behavior feature is the first parameter.
    pub fn run_generations(
        algo: &mut CmaEsAlgorithm,
        generations: usize,
        objective: impl Fn(&[f64]) -> f64,
    ) {
        for _ in 0..generations * algo.parameters().lam {
            let ind = algo.generate_individual();
            let f = objective(ind.parameters());
            let features = vec![ind.parameters()[0]];
            algo.return_evaluated_individual(ind.with_evaluation(Evaluation::new(f, features)))
                .expect("evaluation accepted");
        }
    }
}
