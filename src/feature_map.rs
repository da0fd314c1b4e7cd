//! MAP-Elites archive over a discretized behavior space.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::individual::{Delta, Evaluation, Individual};

/// Coordinates of one archive cell, one bin index per behavior dimension.
pub type Cell = Vec<usize>;

/// Handle to the single archive shared by whichever algorithm is running.
///
/// Writers go through the write lock, which makes the compare-then-replace
/// of [`FeatureMap::insert`] atomic.
pub type SharedFeatureMap = Arc<RwLock<FeatureMap>>;

/// Grid archive keeping the best individual seen in each cell.
#[derive(Debug, Clone)]
pub struct FeatureMap {
    feature_ranges: Vec<(f64, f64)>,
    resolutions: Vec<usize>,
    cells: HashMap<Cell, Individual>,
    /// Occupied cells in first-occupation order, for uniform sampling.
    occupied: Vec<Cell>,
}

impl FeatureMap {
    /// Create an empty archive.
    ///
    /// `feature_ranges` and `resolutions` must have the same length, every
    /// resolution must be positive and every range must satisfy `min < max`.
    pub fn new(feature_ranges: Vec<(f64, f64)>, resolutions: Vec<usize>) -> Result<Self> {
        if feature_ranges.len() != resolutions.len() {
            return Err(Error::InvalidConfig(format!(
                "{} feature ranges but {} resolutions",
                feature_ranges.len(),
                resolutions.len()
            )));
        }
        if feature_ranges.is_empty() {
            return Err(Error::InvalidConfig(
                "feature map needs at least one dimension".into(),
            ));
        }
        for (dim, (&(lo, hi), &res)) in feature_ranges.iter().zip(resolutions.iter()).enumerate() {
            if res == 0 {
                return Err(Error::InvalidConfig(format!(
                    "resolution of dimension {dim} must be positive"
                )));
            }
            if !(lo < hi) {
                return Err(Error::InvalidConfig(format!(
                    "range of dimension {dim} is empty: ({lo}, {hi})"
                )));
            }
        }
        Ok(Self {
            feature_ranges,
            resolutions,
            cells: HashMap::new(),
            occupied: Vec::new(),
        })
    }

    /// Wrap the archive in a shareable handle.
    pub fn into_shared(self) -> SharedFeatureMap {
        Arc::new(RwLock::new(self))
    }

    pub fn feature_ranges(&self) -> &[(f64, f64)] {
        &self.feature_ranges
    }

    pub fn resolutions(&self) -> &[usize] {
        &self.resolutions
    }

    /// Number of behavior dimensions.
    pub fn dimensions(&self) -> usize {
        self.resolutions.len()
    }

    /// Number of occupied cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Total number of cells in the grid.
    pub fn capacity(&self) -> usize {
        self.resolutions.iter().product()
    }

    /// Fraction of the grid that is occupied.
    pub fn coverage(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }

    /// Bin of `value` along dimension `dim`.
    ///
    /// Values at or below the minimum land in bin 0, values at or above the
    /// maximum in the last bin; NaN lands in bin 0.
    ///
    /// # Panics
    /// Panics if `dim` is not a dimension of this map.
    pub fn cell_index(&self, dim: usize, value: f64) -> usize {
        let (lo, hi) = self.feature_ranges[dim];
        let res = self.resolutions[dim];
        if value.is_nan() || value <= lo {
            return 0;
        }
        if value >= hi {
            return res - 1;
        }
        let pos = (value - lo) / (hi - lo);
        ((pos * (res - 1) as f64).floor() as usize).min(res - 1)
    }

    /// Cell of an evaluated individual.
    pub fn index_of(&self, individual: &Individual) -> Result<Cell> {
        let features = individual.features().ok_or(Error::NotEvaluated)?;
        self.cell_of(features)
    }

    fn cell_of(&self, features: &[f64]) -> Result<Cell> {
        if features.len() != self.dimensions() {
            return Err(Error::DimensionMismatch {
                what: "feature vector",
                expected: self.dimensions(),
                actual: features.len(),
            });
        }
        Ok(features
            .iter()
            .enumerate()
            .map(|(dim, &v)| self.cell_index(dim, v))
            .collect())
    }

    /// Offer an evaluated individual to its cell.
    ///
    /// An empty cell is always taken. An occupied cell changes hands only when
    /// the newcomer is strictly fitter, so ties keep the incumbent. Returns
    /// whether the archive changed; on success the individual's delta records
    /// how. Non-finite fitness or features are rejected and leave the archive
    /// untouched.
    pub fn insert(&mut self, mut individual: Individual) -> Result<bool> {
        let evaluation = individual.evaluation().ok_or(Error::NotEvaluated)?;
        evaluation.check_finite()?;
        let fitness = evaluation.fitness;
        let cell = self.index_of(&individual)?;
        match self.cells.get(&cell) {
            None => {
                individual.set_delta(Delta::NewCell { fitness });
                self.occupied.push(cell.clone());
                self.cells.insert(cell, individual);
                Ok(true)
            }
            Some(current) => {
                let incumbent = current.fitness().unwrap_or(f64::NEG_INFINITY);
                if fitness > incumbent {
                    individual.set_delta(Delta::Improved {
                        gain: fitness - incumbent,
                    });
                    self.cells.insert(cell, individual);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    pub fn get(&self, cell: &[usize]) -> Option<&Individual> {
        self.cells.get(cell)
    }

    /// Elite of a uniformly chosen occupied cell.
    pub fn sample_random_elite<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<&Individual> {
        if self.occupied.is_empty() {
            return Err(Error::EmptyArchive);
        }
        let cell = &self.occupied[rng.gen_range(0..self.occupied.len())];
        self.cells.get(cell).ok_or(Error::EmptyArchive)
    }

    /// All elites ordered by cell coordinates.
    pub fn elites(&self) -> Vec<(&Cell, &Individual)> {
        let mut elites: Vec<_> = self.cells.iter().collect();
        elites.sort_by(|a, b| a.0.cmp(b.0));
        elites
    }

    /// Fittest elite. Ties go to the lowest cell.
    pub fn best(&self) -> Option<&Individual> {
        self.elites()
            .into_iter()
            .map(|(_, ind)| ind)
            .fold(None, |best: Option<&Individual>, ind| match best {
                Some(b) if b.fitness() >= ind.fitness() => Some(b),
                _ => Some(ind),
            })
    }

    pub fn stats(&self) -> ArchiveStats {
        let fitnesses: Vec<f64> = self.cells.values().filter_map(|i| i.fitness()).collect();
        let qd_score: f64 = fitnesses.iter().sum();
        ArchiveStats {
            occupied: fitnesses.len(),
            capacity: self.capacity(),
            coverage: self.coverage(),
            qd_score,
            mean_fitness: if fitnesses.is_empty() {
                0.0
            } else {
                qd_score / fitnesses.len() as f64
            },
            max_fitness: fitnesses.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            min_fitness: fitnesses.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }

    /// Write the archive as JSON.
    pub fn persist<W: Write>(&self, writer: W) -> Result<()> {
        let file = ArchiveFile {
            feature_ranges: self.feature_ranges.clone(),
            resolutions: self.resolutions.clone(),
            elites: self
                .elites()
                .into_iter()
                .filter_map(|(_, ind)| EliteRecord::from_individual(ind))
                .collect(),
        };
        serde_json::to_writer(writer, &file)?;
        Ok(())
    }

    /// Rebuild an archive written by [`FeatureMap::persist`].
    ///
    /// Cells are re-derived from each record's features, so the result does
    /// not depend on the order of the records.
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let file: ArchiveFile = serde_json::from_reader(reader)?;
        let mut map = FeatureMap::new(file.feature_ranges, file.resolutions)?;
        for record in file.elites {
            map.insert(record.into_individual())?;
        }
        Ok(map)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.persist(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(BufReader::new(File::open(path)?))
    }
}

/// Summary of the archive contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub occupied: usize,
    pub capacity: usize,
    pub coverage: f64,
    /// Sum of elite fitness values.
    pub qd_score: f64,
    pub mean_fitness: f64,
    pub max_fitness: f64,
    pub min_fitness: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveFile {
    feature_ranges: Vec<(f64, f64)>,
    resolutions: Vec<usize>,
    elites: Vec<EliteRecord>,
}

/// Persisted form of one elite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EliteRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<usize>,
    pub parameters: Vec<f64>,
    pub fitness: f64,
    pub features: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<f64>,
}

impl EliteRecord {
    fn from_individual(ind: &Individual) -> Option<Self> {
        let eval = ind.evaluation()?;
        Some(Self {
            id: ind.id(),
            parameters: ind.parameters().to_vec(),
            fitness: eval.fitness,
            features: eval.features.clone(),
            stats: eval.stats.clone(),
        })
    }

    fn into_individual(self) -> Individual {
        let mut ind = Individual::new(self.parameters).with_evaluation(
            Evaluation::new(self.fitness, self.features).with_stats(self.stats),
        );
        if let Some(id) = self.id {
            ind.assign_id(id);
        }
        ind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn evaluated(params: Vec<f64>, fitness: f64, features: Vec<f64>) -> Individual {
        Individual::new(params).with_evaluation(Evaluation::new(fitness, features))
    }

    #[test]
    fn cell_index_clamps_and_bins() {
        let map = FeatureMap::new(vec![(0.0, 10.0)], vec![5]).unwrap();
        let bins: Vec<usize> = [0.0, 2.0, 4.0, 6.0, 8.0, 10.0]
            .iter()
            .map(|&v| map.cell_index(0, v))
            .collect();
        assert_eq!(bins, vec![0, 0, 1, 2, 3, 4]);
        assert_eq!(map.cell_index(0, -5.0), 0);
        assert_eq!(map.cell_index(0, 1e9), 4);
        assert_eq!(map.cell_index(0, f64::NAN), 0);
    }

    #[test]
    fn single_bin_dimension() {
        let map = FeatureMap::new(vec![(0.0, 1.0)], vec![1]).unwrap();
        assert_eq!(map.cell_index(0, 0.5), 0);
        assert_eq!(map.cell_index(0, 2.0), 0);
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(matches!(
            FeatureMap::new(vec![(0.0, 1.0)], vec![1, 2]),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            FeatureMap::new(vec![(0.0, 1.0)], vec![0]),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            FeatureMap::new(vec![(1.0, 1.0)], vec![3]),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn insert_new_cell_then_improve() {
        let mut map = FeatureMap::new(vec![(0.0, 10.0), (0.0, 10.0)], vec![10, 10]).unwrap();
        assert!(map.insert(evaluated(vec![0.0], 1.0, vec![5.0, 5.0])).unwrap());
        assert_eq!(map.len(), 1);

        // tie keeps the incumbent
        assert!(!map.insert(evaluated(vec![1.0], 1.0, vec![5.0, 5.0])).unwrap());
        assert!(!map.insert(evaluated(vec![2.0], 0.5, vec![5.0, 5.0])).unwrap());
        assert!(map.insert(evaluated(vec![3.0], 2.5, vec![5.0, 5.0])).unwrap());
        assert_eq!(map.len(), 1);

        let cell = map.cell_of(&[5.0, 5.0]).unwrap();
        let elite = map.get(&cell).unwrap();
        assert_eq!(elite.parameters(), &[3.0]);
        assert_eq!(elite.delta(), Some(Delta::Improved { gain: 1.5 }));
    }

    #[test]
    fn nan_fitness_cannot_freeze_a_cell() {
        let mut map = FeatureMap::new(vec![(0.0, 10.0)], vec![10]).unwrap();
        assert!(matches!(
            map.insert(evaluated(vec![0.0], f64::NAN, vec![5.0])),
            Err(Error::EvaluatorProtocol(_))
        ));
        assert!(matches!(
            map.insert(evaluated(vec![0.0], 1.0, vec![f64::NAN])),
            Err(Error::EvaluatorProtocol(_))
        ));
        assert!(map.is_empty());

        assert!(map.insert(evaluated(vec![1.0], 100.0, vec![5.0])).unwrap());
        let cell = map.cell_of(&[5.0]).unwrap();
        assert_eq!(map.get(&cell).and_then(|e| e.fitness()), Some(100.0));
        assert_eq!(map.stats().qd_score, 100.0);
    }

    #[test]
    fn reload_is_bit_exact_for_non_dyadic_floats() {
        let mut map = FeatureMap::new(vec![(0.0, 1.0), (-1.0, 1.0)], vec![7, 3]).unwrap();
        map.insert(evaluated(
            vec![0.9556231396714921, -0.1, 1.0 / 3.0],
            0.1 + 0.2,
            vec![0.9556231396714921, 2.0f64.sqrt() - 1.0],
        ))
        .unwrap();
        map.insert(evaluated(
            vec![std::f64::consts::PI, 1e-17, -7.000000000000001],
            -123.45678901234568,
            vec![1.0 / 7.0, -0.3333333333333333],
        ))
        .unwrap();

        let mut buf = Vec::new();
        map.persist(&mut buf).unwrap();
        let loaded = FeatureMap::load(buf.as_slice()).unwrap();

        assert_eq!(loaded.len(), map.len());
        for ((ca, a), (cb, b)) in map.elites().into_iter().zip(loaded.elites()) {
            assert_eq!(ca, cb);
            let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(a.parameters()), bits(b.parameters()));
            assert_eq!(bits(a.features().unwrap()), bits(b.features().unwrap()));
            assert_eq!(a.fitness().unwrap().to_bits(), b.fitness().unwrap().to_bits());
        }
    }

    #[test]
    fn insert_reports_new_cell_delta() {
        let mut map = FeatureMap::new(vec![(0.0, 1.0)], vec![4]).unwrap();
        map.insert(evaluated(vec![0.0], 0.7, vec![0.9])).unwrap();
        let (_, elite) = map.elites()[0];
        assert_eq!(elite.delta(), Some(Delta::NewCell { fitness: 0.7 }));
    }

    #[test]
    fn insert_rejects_wrong_feature_count_and_pending() {
        let mut map = FeatureMap::new(vec![(0.0, 1.0)], vec![4]).unwrap();
        assert!(matches!(
            map.insert(evaluated(vec![0.0], 1.0, vec![0.1, 0.2])),
            Err(Error::DimensionMismatch { expected: 1, actual: 2, .. })
        ));
        assert!(matches!(
            map.insert(Individual::new(vec![0.0])),
            Err(Error::NotEvaluated)
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn sampling_empty_archive_fails() {
        let map = FeatureMap::new(vec![(0.0, 1.0)], vec![4]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            map.sample_random_elite(&mut rng),
            Err(Error::EmptyArchive)
        ));
    }

    #[test]
    fn sampling_visits_every_cell() {
        let mut map = FeatureMap::new(vec![(0.0, 4.0)], vec![5]).unwrap();
        for i in 0..5 {
            map.insert(evaluated(vec![i as f64], 1.0, vec![i as f64])).unwrap();
        }
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = [false; 5];
        for _ in 0..200 {
            let elite = map.sample_random_elite(&mut rng).unwrap();
            seen[elite.parameters()[0] as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn persist_and_load_round_trip() {
        let mut map = FeatureMap::new(vec![(0.0, 10.0), (-1.0, 1.0)], vec![5, 3]).unwrap();
        map.insert(evaluated(vec![0.1, 0.2], 3.0, vec![1.0, 0.5])).unwrap();
        map.insert(evaluated(vec![0.3, 0.4], -2.0, vec![9.0, -0.9])).unwrap();
        map.insert(evaluated(vec![0.5, 0.6], 7.25, vec![4.0, 0.0])).unwrap();

        let mut buf = Vec::new();
        map.persist(&mut buf).unwrap();
        let loaded = FeatureMap::load(buf.as_slice()).unwrap();

        assert_eq!(loaded.feature_ranges(), map.feature_ranges());
        assert_eq!(loaded.resolutions(), map.resolutions());
        assert_eq!(loaded.len(), map.len());
        for ((ca, a), (cb, b)) in map.elites().into_iter().zip(loaded.elites()) {
            assert_eq!(ca, cb);
            assert_eq!(a.parameters(), b.parameters());
            assert_eq!(a.fitness(), b.fitness());
            assert_eq!(a.features(), b.features());
        }
    }

    #[test]
    fn stats_summarize_elites() {
        let mut map = FeatureMap::new(vec![(0.0, 10.0)], vec![10]).unwrap();
        assert_eq!(map.stats().occupied, 0);
        map.insert(evaluated(vec![0.0], 1.0, vec![1.0])).unwrap();
        map.insert(evaluated(vec![0.0], 3.0, vec![9.0])).unwrap();
        let stats = map.stats();
        assert_eq!(stats.occupied, 2);
        assert_eq!(stats.capacity, 10);
        assert_eq!(stats.qd_score, 4.0);
        assert_eq!(stats.max_fitness, 3.0);
        assert_eq!(stats.min_fitness, 1.0);
        assert_eq!(map.best().and_then(|b| b.fitness()), Some(3.0));
    }
}
