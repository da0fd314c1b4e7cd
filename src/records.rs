//! Per-evaluation record rows and periodic elite snapshots.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;
use crate::feature_map::FeatureMap;
use crate::individual::Individual;

/// Evaluations between elite snapshots unless configured otherwise.
pub const DEFAULT_RECORD_FREQUENCY: usize = 20;

/// One row per evaluated individual.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: usize,
    pub method: &'static str,
    pub parameters: Vec<f64>,
    pub stats: Vec<f64>,
}

impl RunRecord {
    pub(crate) fn new(method: &'static str, individual: &Individual) -> Self {
        Self {
            id: individual.id().unwrap_or_default(),
            method,
            parameters: individual.parameters().to_vec(),
            stats: individual.stats().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EliteSummary {
    pub id: Option<usize>,
    pub fitness: f64,
    pub features: Vec<f64>,
}

/// The archive contents after `evaluated` evaluations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EliteSnapshot {
    pub evaluated: usize,
    pub elites: Vec<EliteSummary>,
}

impl EliteSnapshot {
    pub fn capture(evaluated: usize, map: &FeatureMap) -> Self {
        let elites = map
            .elites()
            .into_iter()
            .filter_map(|(_, ind)| {
                let eval = ind.evaluation()?;
                Some(EliteSummary {
                    id: ind.id(),
                    fitness: eval.fitness,
                    features: eval.features.clone(),
                })
            })
            .collect();
        Self { evaluated, elites }
    }
}

/// Destination for the records an algorithm emits while it runs.
pub trait RecordSink: Send {
    fn record(&mut self, row: &RunRecord) -> Result<()>;

    fn snapshot(&mut self, snapshot: &EliteSnapshot) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn record(&mut self, _row: &RunRecord) -> Result<()> {
        Ok(())
    }

    fn snapshot(&mut self, _snapshot: &EliteSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Keeps everything in memory.
///
/// Clones share the same storage, so a test can hand one clone to an
/// algorithm and read the records back through another.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryRecords>>,
}

#[derive(Debug, Default)]
struct MemoryRecords {
    rows: Vec<RunRecord>,
    snapshots: Vec<EliteSnapshot>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<RunRecord> {
        self.inner.lock().rows.clone()
    }

    pub fn snapshots(&self) -> Vec<EliteSnapshot> {
        self.inner.lock().snapshots.clone()
    }
}

impl RecordSink for MemorySink {
    fn record(&mut self, row: &RunRecord) -> Result<()> {
        self.inner.lock().rows.push(row.clone());
        Ok(())
    }

    fn snapshot(&mut self, snapshot: &EliteSnapshot) -> Result<()> {
        self.inner.lock().snapshots.push(snapshot.clone());
        Ok(())
    }
}

/// Writes rows and snapshots as tagged JSON lines.
pub struct JsonLinesSink<W> {
    out: W,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line<'a> {
    Record(&'a RunRecord),
    Snapshot(&'a EliteSnapshot),
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &Line<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, line)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn record(&mut self, row: &RunRecord) -> Result<()> {
        self.write_line(&Line::Record(row))
    }

    fn snapshot(&mut self, snapshot: &EliteSnapshot) -> Result<()> {
        self.write_line(&Line::Snapshot(snapshot))?;
        self.out.flush()?;
        Ok(())
    }
}
