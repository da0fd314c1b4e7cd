//! Elitist mutation search over the shared archive.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::algorithm::{EvaluationLedger, QdAlgorithm};
use crate::error::{Error, Result};
use crate::feature_map::SharedFeatureMap;
use crate::individual::Individual;
use crate::records::{RecordSink, DEFAULT_RECORD_FREQUENCY};

pub const METHOD: &str = "MAP-Elites";

#[derive(Debug, Clone)]
pub struct MapElitesConfig {
    /// Length of every parameter vector.
    pub latent_dim: usize,
    /// Standard deviation of the Gaussian perturbation applied to elites.
    pub mutation_power: f64,
    /// Number of purely random candidates dispatched before mutating elites.
    pub initial_population: usize,
    /// Evaluation budget.
    pub num_to_evaluate: usize,
    /// Emit an elite snapshot every this many evaluations (0 disables).
    pub record_frequency: usize,
}

impl Default for MapElitesConfig {
    fn default() -> Self {
        Self {
            latent_dim: 32,
            mutation_power: 0.5,
            initial_population: 100,
            num_to_evaluate: 1000,
            record_frequency: DEFAULT_RECORD_FREQUENCY,
        }
    }
}

/// MAP-Elites: random exploration first, then mutation of random elites.
pub struct MapElitesAlgorithm {
    config: MapElitesConfig,
    feature_map: SharedFeatureMap,
    rng: StdRng,
    dispatched: usize,
    ledger: EvaluationLedger,
}

impl MapElitesAlgorithm {
    pub fn new(config: MapElitesConfig, feature_map: SharedFeatureMap) -> Result<Self> {
        if config.latent_dim == 0 {
            return Err(Error::InvalidConfig("latent_dim must be positive".into()));
        }
        if !(config.mutation_power > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "mutation_power must be positive, got {}",
                config.mutation_power
            )));
        }
        let ledger = EvaluationLedger::new(METHOD, config.latent_dim, config.record_frequency);
        Ok(Self {
            config,
            feature_map,
            rng: StdRng::from_entropy(),
            dispatched: 0,
            ledger,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_sink(mut self, sink: impl RecordSink + 'static) -> Self {
        self.ledger.set_sink(Box::new(sink));
        self
    }

    pub fn config(&self) -> &MapElitesConfig {
        &self.config
    }

    /// Number of candidates handed out so far.
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    fn gaussian(&mut self, center: Option<&[f64]>, std_dev: f64) -> Vec<f64> {
        (0..self.config.latent_dim)
            .map(|i| {
                let s: f64 = self.rng.sample(StandardNormal);
                center.map_or(0.0, |c| c[i]) + std_dev * s
            })
            .collect()
    }
}

impl QdAlgorithm for MapElitesAlgorithm {
    fn method(&self) -> &'static str {
        METHOD
    }

    fn is_running(&self) -> bool {
        self.ledger.evaluated() < self.config.num_to_evaluate
    }

    fn generate_individual(&mut self) -> Individual {
        let parent = if self.dispatched < self.config.initial_population {
            None
        } else {
            let archive = self.feature_map.read();
            match archive.sample_random_elite(&mut self.rng) {
                Ok(elite) => Some(elite.parameters().to_vec()),
                // nothing to mutate yet, keep exploring
                Err(_) => None,
            }
        };
        self.dispatched += 1;

        let parameters = match parent {
            None => self.gaussian(None, 1.0),
            Some(p) => self.gaussian(Some(&p), self.config.mutation_power),
        };
        Individual::new(parameters)
    }

    fn return_evaluated_individual(&mut self, individual: Individual) -> Result<bool> {
        let (_, changed) = self.ledger.commit(&self.feature_map, individual)?;
        Ok(changed)
    }

    fn evaluated(&self) -> usize {
        self.ledger.evaluated()
    }

    fn feature_map(&self) -> &SharedFeatureMap {
        &self.feature_map
    }
}
