//! The contract shared by both search strategies, and the variant chosen at startup.

use crate::cma_es::CmaEsAlgorithm;
use crate::error::{Error, Result};
use crate::feature_map::SharedFeatureMap;
use crate::individual::Individual;
use crate::map_elites::MapElitesAlgorithm;
use crate::records::{EliteSnapshot, NullSink, RecordSink, RunRecord};

/// A quality-diversity search strategy driven one individual at a time.
pub trait QdAlgorithm {
    /// Name written into the record rows.
    fn method(&self) -> &'static str;

    /// Whether the evaluation budget has room left.
    fn is_running(&self) -> bool;

    /// Propose the next candidate. Its evaluation is left empty.
    fn generate_individual(&mut self) -> Individual;

    /// Hand back an individual carrying its evaluation.
    ///
    /// Returns whether the shared archive changed.
    fn return_evaluated_individual(&mut self, individual: Individual) -> Result<bool>;

    /// Number of individuals accepted so far.
    fn evaluated(&self) -> usize;

    fn feature_map(&self) -> &SharedFeatureMap;
}

/// Startup choice between the two strategies.
pub enum Algorithm {
    MapElites(MapElitesAlgorithm),
    CmaEs(CmaEsAlgorithm),
}

impl QdAlgorithm for Algorithm {
    fn method(&self) -> &'static str {
        match self {
            Algorithm::MapElites(a) => a.method(),
            Algorithm::CmaEs(a) => a.method(),
        }
    }

    fn is_running(&self) -> bool {
        match self {
            Algorithm::MapElites(a) => a.is_running(),
            Algorithm::CmaEs(a) => a.is_running(),
        }
    }

    fn generate_individual(&mut self) -> Individual {
        match self {
            Algorithm::MapElites(a) => a.generate_individual(),
            Algorithm::CmaEs(a) => a.generate_individual(),
        }
    }

    fn return_evaluated_individual(&mut self, individual: Individual) -> Result<bool> {
        match self {
            Algorithm::MapElites(a) => a.return_evaluated_individual(individual),
            Algorithm::CmaEs(a) => a.return_evaluated_individual(individual),
        }
    }

    fn evaluated(&self) -> usize {
        match self {
            Algorithm::MapElites(a) => a.evaluated(),
            Algorithm::CmaEs(a) => a.evaluated(),
        }
    }

    fn feature_map(&self) -> &SharedFeatureMap {
        match self {
            Algorithm::MapElites(a) => a.feature_map(),
            Algorithm::CmaEs(a) => a.feature_map(),
        }
    }
}

impl From<MapElitesAlgorithm> for Algorithm {
    fn from(a: MapElitesAlgorithm) -> Self {
        Algorithm::MapElites(a)
    }
}

impl From<CmaEsAlgorithm> for Algorithm {
    fn from(a: CmaEsAlgorithm) -> Self {
        Algorithm::CmaEs(a)
    }
}

/// Id assignment, archive insertion and record emission common to both strategies.
pub(crate) struct EvaluationLedger {
    method: &'static str,
    dimension: usize,
    evaluated: usize,
    record_frequency: usize,
    sink: Box<dyn RecordSink>,
}

impl EvaluationLedger {
    pub(crate) fn new(method: &'static str, dimension: usize, record_frequency: usize) -> Self {
        Self {
            method,
            dimension,
            evaluated: 0,
            record_frequency,
            sink: Box::new(NullSink),
        }
    }

    pub(crate) fn set_sink(&mut self, sink: Box<dyn RecordSink>) {
        self.sink = sink;
    }

    pub(crate) fn evaluated(&self) -> usize {
        self.evaluated
    }

    /// Validate, number, archive and record one evaluated individual.
    ///
    /// Nothing is changed when validation fails. Sink output happens after
    /// the archive lock is released, so a sink error leaves the individual
    /// archived and counted. On success returns the numbered individual (as
    /// offered, before the archive sets its delta) and whether the archive
    /// changed.
    pub(crate) fn commit(
        &mut self,
        map: &SharedFeatureMap,
        mut individual: Individual,
    ) -> Result<(Individual, bool)> {
        if individual.parameters().len() != self.dimension {
            return Err(Error::DimensionMismatch {
                what: "parameter vector",
                expected: self.dimension,
                actual: individual.parameters().len(),
            });
        }
        individual
            .evaluation()
            .ok_or(Error::NotEvaluated)?
            .check_finite()?;

        let (numbered, changed, snapshot) = {
            let mut archive = map.write();
            archive.index_of(&individual)?;

            individual.assign_id(self.evaluated);
            self.evaluated += 1;
            let numbered = individual.clone();
            let changed = archive.insert(individual)?;

            let due = self.record_frequency > 0 && self.evaluated % self.record_frequency == 0;
            let snapshot = due.then(|| {
                let coverage = archive.coverage();
                (EliteSnapshot::capture(self.evaluated, &archive), coverage)
            });
            (numbered, changed, snapshot)
        };
        tracing::debug!(
            method = self.method,
            id = self.evaluated - 1,
            fitness = numbered.fitness(),
            changed,
            "evaluated individual"
        );

        self.sink.record(&RunRecord::new(self.method, &numbered))?;
        if let Some((snapshot, coverage)) = snapshot {
            tracing::info!(
                method = self.method,
                evaluated = self.evaluated,
                elites = snapshot.elites.len(),
                coverage,
                "archive snapshot"
            );
            self.sink.snapshot(&snapshot)?;
        }
        Ok((numbered, changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_map::FeatureMap;
    use crate::individual::Evaluation;

    struct BrokenSink;

    impl RecordSink for BrokenSink {
        fn record(&mut self, _row: &RunRecord) -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "records closed").into())
        }

        fn snapshot(&mut self, _snapshot: &EliteSnapshot) -> Result<()> {
            Ok(())
        }
    }

    fn shared_map() -> SharedFeatureMap {
        FeatureMap::new(vec![(0.0, 10.0)], vec![10]).unwrap().into_shared()
    }

    fn evaluated(fitness: f64, feature: f64) -> Individual {
        Individual::new(vec![0.0, 1.0]).with_evaluation(Evaluation::new(fitness, vec![feature]))
    }

    #[test]
    fn sink_failure_after_archiving_keeps_state_consistent() {
        let map = shared_map();
        let mut ledger = EvaluationLedger::new("MAP-Elites", 2, 1);
        ledger.set_sink(Box::new(BrokenSink));

        let err = ledger.commit(&map, evaluated(2.0, 4.0)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(ledger.evaluated(), 1);

        // lock released: both readers and writers get through
        let archive = map.try_read().expect("archive lock released");
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.elites()[0].1.id(), Some(0));
        drop(archive);
        assert!(map.try_write().is_some());
    }

    #[test]
    fn non_finite_evaluation_is_rejected_before_numbering() {
        let map = shared_map();
        let mut ledger = EvaluationLedger::new("CMA-ES", 2, 0);
        for bad in [evaluated(f64::NAN, 5.0), evaluated(1.0, f64::INFINITY)] {
            assert!(matches!(
                ledger.commit(&map, bad),
                Err(Error::EvaluatorProtocol(_))
            ));
        }
        assert_eq!(ledger.evaluated(), 0);
        assert!(map.read().is_empty());

        let (numbered, changed) = ledger.commit(&map, evaluated(3.0, 5.0)).unwrap();
        assert!(changed);
        assert_eq!(numbered.id(), Some(0));
    }
}
