use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::errors::EvalError;
use crate::jobset::{DataId, RectangularJobSet, ShardedData};
use crate::shard::{CompiledShard, FunctionId, ShardEvaluator, ShardFunction};

/// A shard's constant data as held by the worker that owns it, together with
/// the graph built from it.
#[derive(Debug)]
pub struct PinnedShard {
    pub shard: usize,
    pub real_data: Vec<f64>,
    pub int_data: Vec<i64>,
    pub compiled: CompiledShard,
}

impl PinnedShard {
    fn holds(&self, data: &ShardedData) -> bool {
        self.shard < data.len()
            && self.real_data == data.real_row(self.shard)
            && self.int_data == data.int_row(self.shard)
    }
}

#[derive(Debug)]
struct FunctionEntry {
    /// The data set this function's entries were last checked against.
    data: DataId,
    owner: Weak<dyn ShardFunction>,
}

#[derive(Debug, Default)]
struct WorkerSlot {
    functions: HashMap<FunctionId, FunctionEntry>,
    shards: HashMap<(FunctionId, usize), Arc<PinnedShard>>,
}

impl WorkerSlot {
    /// Point `function` at `data`, keeping pinned shards whose rows are
    /// unchanged. A function seen for the first time also drops the entries
    /// of evaluators that no longer exist.
    fn attach(&mut self, evaluator: &ShardEvaluator, data: &ShardedData) {
        let function = evaluator.id();
        match self.functions.get_mut(&function) {
            Some(entry) if entry.data == data.id() => {}
            Some(entry) => {
                entry.data = data.id();
                self.shards
                    .retain(|(f, _), pinned| *f != function || pinned.holds(data));
            }
            None => {
                self.functions.retain(|_, entry| entry.owner.strong_count() > 0);
                let live = &self.functions;
                self.shards.retain(|(f, _), _| live.contains_key(f));
                self.functions.insert(
                    function,
                    FunctionEntry {
                        data: data.id(),
                        owner: evaluator.liveness(),
                    },
                );
            }
        }
    }

    fn is_current(&self, function: FunctionId, data: DataId) -> bool {
        self.functions.get(&function).map(|e| e.data) == Some(data)
    }
}

/// Counters describing how often shard data had to be sent to a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementStats {
    pub transfers: usize,
    pub bytes_transferred: usize,
    pub hits: usize,
}

/// Explicit (worker, shard) cache of pinned shard data.
///
/// Entries are populated the first time a worker evaluates a shard and
/// reused for every later call whose rows for that shard are unchanged, even
/// when the job set was rebuilt from fresh arrays. Rows that differ are
/// re-pinned. Entries of dropped evaluators are evicted the next time a new
/// evaluator reaches the worker; [`DataPlacement::clear`] drops everything.
#[derive(Debug)]
pub struct DataPlacement {
    slots: Vec<Mutex<WorkerSlot>>,
    transfers: AtomicUsize,
    bytes: AtomicUsize,
    hits: AtomicUsize,
}

impl DataPlacement {
    pub fn new(workers: usize) -> Self {
        Self {
            slots: (0..workers).map(|_| Mutex::default()).collect(),
            transfers: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
        }
    }

    fn slot(&self, worker: usize) -> MutexGuard<'_, WorkerSlot> {
        self.slots[worker]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The pinned copy of `shard` on `worker`, transferring and compiling it
    /// on first use.
    pub fn pinned(
        &self,
        worker: usize,
        evaluator: &ShardEvaluator,
        jobs: &RectangularJobSet,
        shard: usize,
    ) -> Result<Arc<PinnedShard>, EvalError> {
        let function = evaluator.id();
        let data = jobs.data();
        let arity = (jobs.shared_params().len(), jobs.shard(shard).local_params.len());

        {
            let mut slot = self.slot(worker);
            slot.attach(evaluator, data);
            if let Some(pinned) = slot.shards.get(&(function, shard)) {
                if pinned.compiled.arity() == arity {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(pinned));
                }
            }
        }

        let real_data = data.real_row(shard).to_vec();
        let int_data = data.int_row(shard).to_vec();
        let compiled = evaluator.compile(arity.0, arity.1, &real_data, &int_data)?;
        let bytes = real_data.len() * std::mem::size_of::<f64>()
            + int_data.len() * std::mem::size_of::<i64>();
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        debug!(worker, shard, bytes, "pinned shard data");

        let pinned = Arc::new(PinnedShard {
            shard,
            real_data,
            int_data,
            compiled,
        });
        let mut slot = self.slot(worker);
        if slot.is_current(function, data.id()) {
            slot.shards.insert((function, shard), Arc::clone(&pinned));
        }
        Ok(pinned)
    }

    /// Shards currently pinned on `worker`, in ascending order.
    pub fn pinned_shards(&self, worker: usize) -> Vec<usize> {
        let mut shards: Vec<usize> = self.slot(worker).shards.keys().map(|(_, s)| *s).collect();
        shards.sort_unstable();
        shards
    }

    pub fn stats(&self) -> PlacementStats {
        PlacementStats {
            transfers: self.transfers.load(Ordering::Relaxed),
            bytes_transferred: self.bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }

    /// Drop every pinned shard, e.g. at the end of an outer run.
    pub fn clear(&self) {
        for worker in 0..self.slots.len() {
            let mut slot = self.slot(worker);
            slot.functions.clear();
            slot.shards.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, NodeId};
    use crate::shard::ShardArgs;

    fn sum_data(graph: &mut Graph, args: &ShardArgs<'_>) -> Result<Vec<NodeId>, EvalError> {
        let x = graph.add_data("x", args.real_data.to_vec());
        let scaled = graph.scalar_mul_data(args.shared[0], x);
        Ok(vec![graph.sum(scaled)])
    }

    fn jobs(data: &Arc<ShardedData>, beta: f64) -> RectangularJobSet {
        RectangularJobSet::with_data(vec![beta], vec![vec![]; data.len()], Arc::clone(data)).unwrap()
    }

    #[test]
    fn test_second_lookup_is_a_hit() {
        let data = Arc::new(
            ShardedData::new(vec![vec![1.0, 2.0], vec![3.0, 4.0]], vec![vec![]; 2])
                .unwrap(),
        );
        let placement = DataPlacement::new(1);
        let evaluator = ShardEvaluator::new(sum_data);

        placement.pinned(0, &evaluator, &jobs(&data, 1.0), 1).unwrap();
        let stats = placement.stats();
        assert_eq!(stats.transfers, 1);
        assert_eq!(stats.bytes_transferred, 16);

        let pinned = placement.pinned(0, &evaluator, &jobs(&data, 2.0), 1).unwrap();
        assert_eq!(pinned.real_data, vec![3.0, 4.0]);
        assert_eq!(placement.stats().transfers, 1);
        assert_eq!(placement.stats().hits, 1);
        assert_eq!(placement.pinned_shards(0), vec![1]);
    }

    #[test]
    fn test_new_data_set_replaces_entries() {
        let placement = DataPlacement::new(1);
        let evaluator = ShardEvaluator::new(sum_data);
        let first = Arc::new(ShardedData::new(vec![vec![1.0]], vec![vec![]]).unwrap());
        let second = Arc::new(ShardedData::new(vec![vec![5.0]], vec![vec![]]).unwrap());

        placement.pinned(0, &evaluator, &jobs(&first, 1.0), 0).unwrap();
        let pinned = placement.pinned(0, &evaluator, &jobs(&second, 1.0), 0).unwrap();
        assert_eq!(pinned.real_data, vec![5.0]);
        assert_eq!(placement.stats().transfers, 2);

        placement.clear();
        assert!(placement.pinned_shards(0).is_empty());
    }

    #[test]
    fn test_rebuilt_identical_data_stays_pinned() {
        let placement = DataPlacement::new(1);
        let evaluator = ShardEvaluator::new(sum_data);
        let rows = || vec![vec![1.0, 2.0], vec![3.0, 4.0]];

        for _ in 0..3 {
            let data = Arc::new(ShardedData::new(rows(), vec![vec![]; 2]).unwrap());
            placement.pinned(0, &evaluator, &jobs(&data, 1.0), 0).unwrap();
            placement.pinned(0, &evaluator, &jobs(&data, 1.0), 1).unwrap();
        }
        assert_eq!(placement.stats().transfers, 2);
        assert_eq!(placement.stats().hits, 4);

        // only the changed row is sent again
        let data = Arc::new(ShardedData::new(vec![vec![1.0, 2.0], vec![3.0, 9.0]], vec![vec![]; 2]).unwrap());
        placement.pinned(0, &evaluator, &jobs(&data, 1.0), 0).unwrap();
        let pinned = placement.pinned(0, &evaluator, &jobs(&data, 1.0), 1).unwrap();
        assert_eq!(pinned.real_data, vec![3.0, 9.0]);
        assert_eq!(placement.stats().transfers, 3);
    }

    #[test]
    fn test_dropped_evaluator_is_evicted() {
        let placement = DataPlacement::new(1);
        let data = Arc::new(ShardedData::new(vec![vec![1.0]], vec![vec![]]).unwrap());

        let first = ShardEvaluator::new(sum_data);
        placement.pinned(0, &first, &jobs(&data, 1.0), 0).unwrap();
        let kept = ShardEvaluator::new(sum_data);
        placement.pinned(0, &kept, &jobs(&data, 1.0), 0).unwrap();
        assert_eq!(placement.slot(0).shards.len(), 2);

        drop(first);
        let third = ShardEvaluator::new(sum_data);
        placement.pinned(0, &third, &jobs(&data, 1.0), 0).unwrap();
        let slot = placement.slot(0);
        assert_eq!(slot.shards.len(), 2);
        assert!(slot.shards.contains_key(&(kept.id(), 0)));
        assert!(slot.shards.contains_key(&(third.id(), 0)));
    }
}
