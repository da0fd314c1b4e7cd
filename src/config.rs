//! Run configuration, loadable from JSON.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::algorithm::Algorithm;
use crate::cma_es::{CmaEsAlgorithm, CmaEsConfig};
use crate::error::{Error, Result};
use crate::feature_map::{FeatureMap, SharedFeatureMap};
use crate::map_elites::{MapElitesAlgorithm, MapElitesConfig};
use crate::records::{RecordSink, DEFAULT_RECORD_FREQUENCY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    #[default]
    MapElites,
    CmaEs,
}

/// Everything needed to build the archive and the search strategy.
///
/// Missing fields take the defaults of a Mario level search: a 32-dimensional
/// latent space and a 151x26 grid over enemy count and average height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IlluminationConfig {
    pub algorithm: AlgorithmKind,
    pub mutation_power: f64,
    /// Exploration-phase size for MAP-Elites.
    pub initial_population: usize,
    /// Generation size for CMA-ES.
    pub population_size: usize,
    pub num_to_evaluate: usize,
    pub feature_ranges: Vec<(f64, f64)>,
    pub resolutions: Vec<usize>,
    pub latent_dim: usize,
    pub record_frequency: usize,
    /// Fixed RNG seed; fresh entropy when absent.
    pub seed: Option<u64>,
}

impl Default for IlluminationConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmKind::MapElites,
            mutation_power: 0.5,
            initial_population: 100,
            population_size: 20,
            num_to_evaluate: 1000,
            feature_ranges: vec![(0.0, 150.0), (0.0, 25.0)],
            resolutions: vec![151, 26],
            latent_dim: 32,
            record_frequency: DEFAULT_RECORD_FREQUENCY,
            seed: None,
        }
    }
}

impl IlluminationConfig {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Check the options the algorithms cannot recover from.
    pub fn validate(&self) -> Result<()> {
        if self.latent_dim == 0 {
            return Err(Error::InvalidConfig("latent_dim must be positive".into()));
        }
        if !(self.mutation_power > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "mutation_power must be positive, got {}",
                self.mutation_power
            )));
        }
        if self.algorithm == AlgorithmKind::CmaEs && self.population_size < 2 {
            return Err(Error::InvalidConfig(format!(
                "population_size must be at least 2, got {}",
                self.population_size
            )));
        }
        // surfaces range/resolution problems before any work is done
        FeatureMap::new(self.feature_ranges.clone(), self.resolutions.clone())?;
        Ok(())
    }

    pub fn feature_map(&self) -> Result<SharedFeatureMap> {
        Ok(FeatureMap::new(self.feature_ranges.clone(), self.resolutions.clone())?.into_shared())
    }

    /// Build the configured strategy around `feature_map`.
    pub fn build_algorithm(
        &self,
        feature_map: SharedFeatureMap,
        sink: impl RecordSink + 'static,
    ) -> Result<Algorithm> {
        self.validate()?;
        let algorithm = match self.algorithm {
            AlgorithmKind::MapElites => {
                let config = MapElitesConfig {
                    latent_dim: self.latent_dim,
                    mutation_power: self.mutation_power,
                    initial_population: self.initial_population,
                    num_to_evaluate: self.num_to_evaluate,
                    record_frequency: self.record_frequency,
                };
                let mut algo = MapElitesAlgorithm::new(config, feature_map)?.with_sink(sink);
                if let Some(seed) = self.seed {
                    algo = algo.with_seed(seed);
                }
                Algorithm::MapElites(algo)
            }
            AlgorithmKind::CmaEs => {
                let config = CmaEsConfig {
                    latent_dim: self.latent_dim,
                    mutation_power: self.mutation_power,
                    population_size: self.population_size,
                    num_to_evaluate: self.num_to_evaluate,
                    record_frequency: self.record_frequency,
                };
                let mut algo = CmaEsAlgorithm::new(config, feature_map)?.with_sink(sink);
                if let Some(seed) = self.seed {
                    algo = algo.with_seed(seed);
                }
                Algorithm::CmaEs(algo)
            }
        };
        Ok(algorithm)
    }
}
