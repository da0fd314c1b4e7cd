//! Candidate records passed between the algorithms, the evaluator and the archive.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What the evaluator reports for one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Higher is better.
    pub fitness: f64,
    /// Behavior characteristics, one per feature map dimension.
    pub features: Vec<f64>,
    /// Auxiliary values kept for the records only.
    #[serde(default)]
    pub stats: Vec<f64>,
}

impl Evaluation {
    pub fn new(fitness: f64, features: Vec<f64>) -> Self {
        Self {
            fitness,
            features,
            stats: Vec::new(),
        }
    }

    pub fn with_stats(mut self, stats: Vec<f64>) -> Self {
        self.stats = stats;
        self
    }

    /// Fitness and every feature must be finite.
    ///
    /// A NaN incumbent would never be replaced, since no fitness compares
    /// greater than it.
    pub fn check_finite(&self) -> Result<()> {
        if !self.fitness.is_finite() {
            return Err(Error::EvaluatorProtocol(format!(
                "fitness is not finite: {}",
                self.fitness
            )));
        }
        if let Some((dim, v)) = self
            .features
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite())
        {
            return Err(Error::EvaluatorProtocol(format!(
                "feature {dim} is not finite: {v}"
            )));
        }
        Ok(())
    }
}

/// Outcome of a successful archive insertion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    /// The individual occupied a previously empty cell.
    NewCell { fitness: f64 },
    /// The individual beat the incumbent by `gain`.
    Improved { gain: f64 },
}

/// One candidate point in the latent space.
#[derive(Debug, Clone, PartialEq)]
pub struct Individual {
    id: Option<usize>,
    parameters: Vec<f64>,
    evaluation: Option<Evaluation>,
    delta: Option<Delta>,
}

impl Individual {
    /// A pending candidate with no id and no evaluation.
    pub fn new(parameters: Vec<f64>) -> Self {
        Self {
            id: None,
            parameters,
            evaluation: None,
            delta: None,
        }
    }

    /// Attach the evaluator's result. Any earlier evaluation is replaced.
    pub fn with_evaluation(mut self, evaluation: Evaluation) -> Self {
        self.evaluation = Some(evaluation);
        self
    }

    pub fn id(&self) -> Option<usize> {
        self.id
    }

    pub(crate) fn assign_id(&mut self, id: usize) {
        self.id = Some(id);
    }

    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    pub fn evaluation(&self) -> Option<&Evaluation> {
        self.evaluation.as_ref()
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluation.is_some()
    }

    pub fn fitness(&self) -> Option<f64> {
        self.evaluation.as_ref().map(|e| e.fitness)
    }

    pub fn features(&self) -> Option<&[f64]> {
        self.evaluation.as_ref().map(|e| e.features.as_slice())
    }

    pub fn stats(&self) -> &[f64] {
        self.evaluation
            .as_ref()
            .map(|e| e.stats.as_slice())
            .unwrap_or(&[])
    }

    pub fn delta(&self) -> Option<Delta> {
        self.delta
    }

    pub(crate) fn set_delta(&mut self, delta: Delta) {
        self.delta = Some(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_individual_has_no_evaluation() {
        let ind = Individual::new(vec![0.1, 0.2]);
        assert_eq!(ind.id(), None);
        assert!(!ind.is_evaluated());
        assert_eq!(ind.fitness(), None);
        assert_eq!(ind.features(), None);
        assert!(ind.stats().is_empty());
        assert_eq!(ind.delta(), None);
    }

    #[test]
    fn evaluation_is_attached() {
        let ind = Individual::new(vec![1.0])
            .with_evaluation(Evaluation::new(3.5, vec![2.0, 4.0]).with_stats(vec![3.5]));
        assert_eq!(ind.fitness(), Some(3.5));
        assert_eq!(ind.features(), Some(&[2.0, 4.0][..]));
        assert_eq!(ind.stats(), &[3.5]);
        assert_eq!(ind.parameters(), &[1.0]);
    }

    #[test]
    fn non_finite_values_are_rejected() {
        assert!(Evaluation::new(1.0, vec![0.0, -2.5]).check_finite().is_ok());
        for eval in [
            Evaluation::new(f64::NAN, vec![0.0]),
            Evaluation::new(f64::INFINITY, vec![0.0]),
            Evaluation::new(1.0, vec![0.0, f64::NAN]),
            Evaluation::new(1.0, vec![f64::NEG_INFINITY]),
        ] {
            assert!(matches!(
                eval.check_finite(),
                Err(Error::EvaluatorProtocol(_))
            ));
        }
    }
}
