//! CMA-ES with restarts, archiving every evaluated individual.
//!
//! The strategy only looks at the archive through the individuals it
//! generated itself: selection works on the current generation buffer, and
//! the best individual ever seen reseeds the mean after a restart.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::algorithm::{EvaluationLedger, QdAlgorithm};
use crate::decomp::DecompMatrix;
use crate::error::{Error, Result};
use crate::feature_map::SharedFeatureMap;
use crate::individual::Individual;
use crate::records::{RecordSink, DEFAULT_RECORD_FREQUENCY};

pub const METHOD: &str = "CMA-ES";

/// Restart once the covariance condition number exceeds this.
pub const MAX_CONDITION_NUMBER: f64 = 1e14;

/// Restart once the largest standard deviation `sigma * sqrt(max λ)` drops below this.
pub const MIN_STEP_SIZE: f64 = 1e-11;

#[derive(Debug, Clone)]
pub struct CmaEsConfig {
    /// Length of every parameter vector.
    pub latent_dim: usize,
    /// Initial step size, restored on every restart.
    pub mutation_power: f64,
    /// Offspring per generation (λ). Must be at least 2.
    pub population_size: usize,
    /// Evaluation budget across all restarts.
    pub num_to_evaluate: usize,
    /// Emit an elite snapshot every this many evaluations (0 disables).
    pub record_frequency: usize,
}

impl Default for CmaEsConfig {
    fn default() -> Self {
        Self {
            latent_dim: 32,
            mutation_power: 0.5,
            population_size: 20,
            num_to_evaluate: 1000,
            record_frequency: DEFAULT_RECORD_FREQUENCY,
        }
    }
}

/// Recombination weights and adaptation constants, fixed at construction.
#[derive(Debug, Clone)]
pub struct StrategyParameters {
    pub dimension: usize,
    pub lam: usize,
    pub mu: usize,
    /// Positive, decreasing, summing to one.
    pub weights: Vec<f64>,
    pub mueff: f64,
    pub cc: f64,
    pub cs: f64,
    pub c1: f64,
    pub cmu: f64,
    pub damps: f64,
    /// Expected norm of a `dimension`-variate standard normal vector.
    pub chi_n: f64,
}

impl StrategyParameters {
    /// Parameters for `n` dimensions and `lam` offspring per generation.
    ///
    /// # Panics
    /// Panics if `n == 0` or `lam < 2`.
    pub fn new(n: usize, lam: usize) -> Self {
        assert!(n > 0, "dimension must be positive");
        assert!(lam >= 2, "population size must be at least 2");
        let n_f = n as f64;
        let mu = lam / 2;
        let mut weights: Vec<f64> = (0..mu)
            .map(|i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln())
            .collect();
        let w_sum: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= w_sum;
        }
        let mueff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let cc = (4.0 + mueff / n_f) / (n_f + 4.0 + 2.0 * mueff / n_f);
        let cs = (mueff + 2.0) / (n_f + mueff + 5.0);
        let c1 = 2.0 / ((n_f + 1.3).powi(2) + mueff);
        let cmu = {
            let up = 2.0 * (mueff - 2.0 + 1.0 / mueff);
            let down = (n_f + 2.0).powi(2) + mueff;
            (up / down).min(1.0 - c1)
        };
        let damps = 1.0 + 2.0 * (((mueff - 1.0) / (n_f + 1.0)).sqrt() - 1.0).max(0.0) + cs;
        let chi_n = n_f.sqrt() * (1.0 - 1.0 / (4.0 * n_f) + 1.0 / (21.0 * n_f * n_f));
        Self {
            dimension: n,
            lam,
            mu,
            weights,
            mueff,
            cc,
            cs,
            c1,
            cmu,
            damps,
            chi_n,
        }
    }
}

/// Why the adaptive state was thrown away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestartReason {
    Condition(f64),
    StepSize(f64),
    /// The eigen update had to clamp this many eigenvalues.
    Indefinite(usize),
}

/// Indices of `fitness` from best to worst.
///
/// The sort is stable, so equal fitness keeps evaluation order. NaN ranks last.
pub(crate) fn selection_order(fitness: &[f64]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..fitness.len()).collect();
    idx.sort_by(|&i, &j| {
        let (a, b) = (fitness[i], fitness[j]);
        match (a.is_nan(), b.is_nan()) {
            (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (true, true) => Ordering::Equal,
        }
    });
    idx
}

pub struct CmaEsAlgorithm {
    config: CmaEsConfig,
    params: StrategyParameters,
    feature_map: SharedFeatureMap,
    rng: StdRng,
    ledger: EvaluationLedger,
    mean: Vec<f64>,
    sigma: f64,
    ps: Vec<f64>,
    pc: Vec<f64>,
    cov: DecompMatrix,
    buffer: Vec<Individual>,
    best: Option<Individual>,
    /// Evaluations since the last restart.
    epoch_evaluated: usize,
    generation: usize,
    restarts: usize,
    last_restart: Option<RestartReason>,
}

impl CmaEsAlgorithm {
    /// Start at the origin with the identity covariance.
    pub fn new(config: CmaEsConfig, feature_map: SharedFeatureMap) -> Result<Self> {
        let n = config.latent_dim;
        if n == 0 {
            return Err(Error::InvalidConfig("latent_dim must be positive".into()));
        }
        if config.population_size < 2 {
            return Err(Error::InvalidConfig(format!(
                "population_size must be at least 2, got {}",
                config.population_size
            )));
        }
        if !(config.mutation_power > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "mutation_power must be positive, got {}",
                config.mutation_power
            )));
        }
        let params = StrategyParameters::new(n, config.population_size);
        let ledger = EvaluationLedger::new(METHOD, n, config.record_frequency);
        Ok(Self {
            sigma: config.mutation_power,
            params,
            feature_map,
            rng: StdRng::from_entropy(),
            ledger,
            mean: vec![0.0; n],
            ps: vec![0.0; n],
            pc: vec![0.0; n],
            cov: DecompMatrix::identity(n),
            buffer: Vec::with_capacity(config.population_size),
            best: None,
            epoch_evaluated: 0,
            generation: 0,
            restarts: 0,
            last_restart: None,
            config,
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

    /// Start the search around `mean` instead of the origin.
    pub fn with_initial_mean(mut self, mean: Vec<f64>) -> Result<Self> {
        if mean.len() != self.params.dimension {
            return Err(Error::DimensionMismatch {
                what: "initial mean",
                expected: self.params.dimension,
                actual: mean.len(),
            });
        }
        self.mean = mean;
        Ok(self)
    }

    pub fn config(&self) -> &CmaEsConfig {
        &self.config
    }

    pub fn parameters(&self) -> &StrategyParameters {
        &self.params
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Override the step size, e.g. to provoke a restart.
    pub fn set_sigma(&mut self, sigma: f64) {
        self.sigma = sigma;
    }

    pub fn ps(&self) -> &[f64] {
        &self.ps
    }

    pub fn pc(&self) -> &[f64] {
        &self.pc
    }

    pub fn covariance(&self) -> &DecompMatrix {
        &self.cov
    }

    /// Fittest individual evaluated by this instance, across restarts.
    pub fn best(&self) -> Option<&Individual> {
        self.best.as_ref()
    }

    /// Completed generation updates.
    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    pub fn last_restart(&self) -> Option<RestartReason> {
        self.last_restart
    }

    /// Individuals waiting for the current generation to fill up.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn update_best(&mut self, individual: &Individual) {
        let fitness = match individual.fitness() {
            Some(f) if !f.is_nan() => f,
            _ => return,
        };
        let improves = match self.best.as_ref().and_then(Individual::fitness) {
            Some(best) => fitness > best,
            None => true,
        };
        if improves {
            self.best = Some(individual.clone());
        }
    }

    /// One mean/path/covariance/step-size update from a full buffer.
    fn tell(&mut self) {
        let n = self.params.dimension;
        let buffer = std::mem::take(&mut self.buffer);
        let fitvals: Vec<f64> = buffer
            .iter()
            .map(|ind| ind.fitness().unwrap_or(f64::NAN))
            .collect();
        let order = selection_order(&fitvals);
        let parents: Vec<&[f64]> = order[..self.params.mu]
            .iter()
            .map(|&i| buffer[i].parameters())
            .collect();

        let params = &self.params;
        let xold = self.mean.clone();

        let mut new_mean = vec![0.0; n];
        for (wk, xk) in params.weights.iter().zip(parents.iter()) {
            for i in 0..n {
                new_mean[i] += wk * xk[i];
            }
        }
        self.mean = new_mean;

        let y: Vec<f64> = self.mean.iter().zip(xold.iter()).map(|(m, o)| m - o).collect();
        let z = self.cov.invsqrt_mul(&y);

        let csn = (params.cs * (2.0 - params.cs) * params.mueff).sqrt() / self.sigma;
        for i in 0..n {
            self.ps[i] = (1.0 - params.cs) * self.ps[i] + csn * z[i];
        }

        let n_f = n as f64;
        let sum_ps_sq: f64 = self.ps.iter().map(|v| v * v).sum();
        let factor = 1.0
            - (1.0 - params.cs)
                .powf(2.0 * self.epoch_evaluated as f64 / params.lam as f64);
        let hsig = if factor <= 0.0 {
            0.0
        } else if sum_ps_sq / n_f / factor < 2.0 + 4.0 / (n_f + 1.0) {
            1.0
        } else {
            0.0
        };

        let ccn = (params.cc * (2.0 - params.cc) * params.mueff).sqrt();
        for i in 0..n {
            self.pc[i] = (1.0 - params.cc) * self.pc[i] + hsig * ccn * y[i];
        }

        let c1a = params.c1 * (1.0 - (1.0 - hsig * hsig) * params.cc * (2.0 - params.cc));
        self.cov.scale(1.0 - c1a - params.cmu);
        self.cov.add_outer(&self.pc, params.c1);
        let sigma_sq = self.sigma * self.sigma;
        for (wk, xk) in params.weights.iter().zip(parents.iter()) {
            let dx: Vec<f64> = xk.iter().zip(xold.iter()).map(|(a, b)| a - b).collect();
            self.cov.add_outer(&dx, wk * params.cmu / sigma_sq);
        }

        let clamped = self.cov.update_eigensystem();

        let exponent = (params.cs / params.damps) * (sum_ps_sq / n_f - 1.0) / 2.0;
        self.sigma *= exponent.min(1.0).exp();
        self.generation += 1;

        tracing::debug!(
            generation = self.generation,
            sigma = self.sigma,
            condition = self.cov.condition_number(),
            hsig,
            best = fitvals[order[0]],
            "CMA-ES generation update"
        );

        if let Some(reason) = self.restart_reason(clamped) {
            self.restart(reason);
        }
    }

    fn restart_reason(&self, clamped: usize) -> Option<RestartReason> {
        let condition = self.cov.condition_number();
        let step = self.sigma * self.cov.max_eigenvalue().sqrt();
        if clamped > 0 {
            Some(RestartReason::Indefinite(clamped))
        } else if condition > MAX_CONDITION_NUMBER {
            Some(RestartReason::Condition(condition))
        } else if step < MIN_STEP_SIZE || step.is_nan() {
            Some(RestartReason::StepSize(step))
        } else {
            None
        }
    }

    fn restart(&mut self, reason: RestartReason) {
        let n = self.params.dimension;
        self.mean = match &self.best {
            Some(best) => best.parameters().to_vec(),
            None => vec![0.0; n],
        };
        self.ps = vec![0.0; n];
        self.pc = vec![0.0; n];
        self.cov.reset();
        self.sigma = self.config.mutation_power;
        self.epoch_evaluated = 0;
        self.restarts += 1;
        self.last_restart = Some(reason);
        tracing::info!(
            restarts = self.restarts,
            ?reason,
            evaluated = self.ledger.evaluated(),
            best = self.best.as_ref().and_then(Individual::fitness),
            "CMA-ES restart"
        );
    }
}

impl QdAlgorithm for CmaEsAlgorithm {
    fn method(&self) -> &'static str {
        METHOD
    }

    fn is_running(&self) -> bool {
        self.ledger.evaluated() < self.config.num_to_evaluate
    }

    fn generate_individual(&mut self) -> Individual {
        let n = self.params.dimension;
        let z: Vec<f64> = (0..n).map(|_| self.rng.sample(StandardNormal)).collect();
        let step = self.cov.sample_step(&z);
        let parameters = self
            .mean
            .iter()
            .zip(step.iter())
            .map(|(m, s)| m + self.sigma * s)
            .collect();
        Individual::new(parameters)
    }

    fn return_evaluated_individual(&mut self, individual: Individual) -> Result<bool> {
        let (individual, changed) = self.ledger.commit(&self.feature_map, individual)?;
        self.epoch_evaluated += 1;
        self.update_best(&individual);
        self.buffer.push(individual);
        if self.buffer.len() >= self.params.lam {
            self.tell();
        }
        Ok(changed)
    }

    fn evaluated(&self) -> usize {
        self.ledger.evaluated()
    }

    fn feature_map(&self) -> &SharedFeatureMap {
        &self.feature_map
    }
}
