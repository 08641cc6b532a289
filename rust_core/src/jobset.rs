use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::{DataArray, Error, Result};
use crate::shard::ShardDescriptor;

static NEXT_DATA_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of one [`ShardedData`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataId(u64);

/// The constant part of a job set: one real row and one int row per shard.
///
/// Usually built once per outer run and shared by every job set of that run;
/// job sets rebuilt from equal rows still find their shards pinned. All real
/// rows have the same length, and so do all int rows.
#[derive(Debug)]
pub struct ShardedData {
    id: DataId,
    real: Vec<Vec<f64>>,
    int: Vec<Vec<i64>>,
}

fn check_rows<T>(array: DataArray, rows: &[Vec<T>]) -> Result<usize> {
    let expected = rows.first().map(Vec::len).unwrap_or(0);
    for (row, r) in rows.iter().enumerate() {
        if r.len() != expected {
            return Err(Error::RaggedRow {
                array,
                row,
                expected,
                found: r.len(),
            });
        }
    }
    Ok(expected)
}

impl ShardedData {
    pub fn new(real: Vec<Vec<f64>>, int: Vec<Vec<i64>>) -> Result<Self> {
        if real.len() != int.len() {
            return Err(Error::ShapeMismatch {
                local: real.len(),
                real: real.len(),
                int: int.len(),
            });
        }
        check_rows(DataArray::Real, &real)?;
        check_rows(DataArray::Int, &int)?;
        Ok(Self {
            id: DataId(NEXT_DATA_ID.fetch_add(1, Ordering::Relaxed)),
            real,
            int,
        })
    }

    /// Build from row-major flat buffers of `shards` rows each.
    pub fn from_flat(shards: usize, real: &[f64], int: &[i64]) -> Result<Self> {
        if shards == 0 {
            if real.is_empty() && int.is_empty() {
                return Self::new(Vec::new(), Vec::new());
            }
            return Err(Error::ShapeMismatch {
                local: 0,
                real: real.len(),
                int: int.len(),
            });
        }
        let split = |len: usize, array: DataArray| -> Result<usize> {
            if len % shards != 0 {
                return Err(Error::RaggedRow {
                    array,
                    row: shards - 1,
                    expected: len.div_ceil(shards),
                    found: len % shards,
                });
            }
            Ok(len / shards)
        };
        let r = split(real.len(), DataArray::Real)?;
        let i = split(int.len(), DataArray::Int)?;
        let real_rows = (0..shards).map(|k| real[k * r..(k + 1) * r].to_vec()).collect();
        let int_rows = (0..shards).map(|k| int[k * i..(k + 1) * i].to_vec()).collect();
        Self::new(real_rows, int_rows)
    }

    pub fn id(&self) -> DataId {
        self.id
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.real.len()
    }

    pub fn is_empty(&self) -> bool {
        self.real.is_empty()
    }

    pub fn real_row(&self, shard: usize) -> &[f64] {
        &self.real[shard]
    }

    pub fn int_row(&self, shard: usize) -> &[i64] {
        &self.int[shard]
    }

    /// Inner lengths (R, I) shared by every row.
    pub fn row_lengths(&self) -> (usize, usize) {
        (
            self.real.first().map(Vec::len).unwrap_or(0),
            self.int.first().map(Vec::len).unwrap_or(0),
        )
    }
}

/// A validated, immutable set of N shards for one map-reduce call.
#[derive(Debug, Clone)]
pub struct RectangularJobSet {
    shared_params: Arc<[f64]>,
    local_params: Vec<Vec<f64>>,
    data: Arc<ShardedData>,
}

impl RectangularJobSet {
    /// Validate the four parallel arrays and build the job set.
    ///
    /// Fails with [`Error::ShapeMismatch`] when the outer lengths differ and
    /// with [`Error::RaggedRow`] when rows of a data array differ in length.
    /// Nothing is evaluated here.
    pub fn new(
        shared_params: Vec<f64>,
        local_params: Vec<Vec<f64>>,
        real_data: Vec<Vec<f64>>,
        int_data: Vec<Vec<i64>>,
    ) -> Result<Self> {
        if local_params.len() != real_data.len() || real_data.len() != int_data.len() {
            return Err(Error::ShapeMismatch {
                local: local_params.len(),
                real: real_data.len(),
                int: int_data.len(),
            });
        }
        let data = Arc::new(ShardedData::new(real_data, int_data)?);
        Self::with_data(shared_params, local_params, data)
    }

    /// Pair fresh parameter values with already validated shard data.
    pub fn with_data(
        shared_params: Vec<f64>,
        local_params: Vec<Vec<f64>>,
        data: Arc<ShardedData>,
    ) -> Result<Self> {
        if local_params.len() != data.len() {
            return Err(Error::ShapeMismatch {
                local: local_params.len(),
                real: data.len(),
                int: data.len(),
            });
        }
        Ok(Self {
            shared_params: shared_params.into(),
            local_params,
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.local_params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_params.is_empty()
    }

    pub fn shared_params(&self) -> &[f64] {
        &self.shared_params
    }

    pub fn data(&self) -> &Arc<ShardedData> {
        &self.data
    }

    pub fn shard(&self, index: usize) -> ShardDescriptor<'_> {
        ShardDescriptor {
            index,
            shared_params: &self.shared_params,
            local_params: &self.local_params[index],
            real_data: self.data.real_row(index),
            int_data: self.data.int_row(index),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ShardDescriptor<'_>> + '_ {
        (0..self.len()).map(move |k| self.shard(k))
    }
}
