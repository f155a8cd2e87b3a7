//! Host side of the host/device transfer channel.
//!
//! The device only ever sees a [`TableDescriptor`] and the ids it wants; the
//! matrix itself stays in a [`HostStore`], distributed over replicas along the
//! table's partition strategy.

use crate::checkpoint::{self, Manifest};
use crate::error::{EmbeddingError, Result};
use crate::optim::OptimizerSpec;
use crate::partition::{self, PartitionStrategy};
use crate::table::{EmbeddingTable, Initializer, TableStore};
use crate::tensor::DType;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Contract both sides of the channel agree on for one named table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub rows: usize,
    pub width: usize,
    pub dtype: DType,
    pub partition_strategy: PartitionStrategy,
    #[serde(default)]
    pub optimizer: Option<OptimizerSpec>,
}

impl TableDescriptor {
    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.width]
    }

    pub fn is_trainable(&self) -> bool {
        self.optimizer.is_some()
    }

    pub fn signature(&self) -> String {
        let optimizer = match &self.optimizer {
            Some(spec) => format!("{}(lr={})", spec.kind(), spec.learning_rate()),
            None => "frozen".to_string(),
        };
        format!(
            "{}[{}, {}]:{} {} {}",
            self.name, self.rows, self.width, self.dtype, self.partition_strategy, optimizer
        )
    }
}

/// Opaque request/response channel to wherever host tables live.
///
/// Calls block until the host answers; failures are returned as-is, never
/// retried.
pub trait HostChannel {
    fn register(&mut self, descriptor: &TableDescriptor, initializer: &Initializer) -> Result<()>;

    /// Returns one row per id, in order.
    fn lookup(&mut self, descriptor: &TableDescriptor, ids: &[i64]) -> Result<Array2<f32>>;

    /// Copies the whole table back to the caller.
    fn fetch(&mut self, descriptor: &TableDescriptor) -> Result<EmbeddingTable>;

    /// Applies the descriptor's optimizer to the rows named by `ids`.
    fn accumulate(
        &mut self,
        descriptor: &TableDescriptor,
        ids: &[i64],
        grads: ArrayView2<'_, f32>,
    ) -> Result<()>;

    fn release(&mut self, name: &str);
}

/// In-process host table storage.
#[derive(Debug)]
pub struct HostStore {
    replicas: usize,
    store: TableStore,
    descriptors: BTreeMap<String, TableDescriptor>,
}

impl Default for HostStore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl HostStore {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            store: TableStore::new(),
            descriptors: BTreeMap::new(),
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn table(&self, name: &str) -> Result<&EmbeddingTable> {
        self.store.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &EmbeddingTable> {
        self.store.tables()
    }

    pub fn descriptor(&self, name: &str) -> Result<&TableDescriptor> {
        self.descriptors
            .get(name)
            .ok_or_else(|| EmbeddingError::not_found(name))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.descriptors.values()
    }

    /// Adopts an already materialized table, e.g. one restored from a checkpoint.
    pub fn adopt(&mut self, descriptor: TableDescriptor, table: EmbeddingTable) -> Result<()> {
        if table.shape() != descriptor.shape() || table.dtype() != descriptor.dtype {
            return Err(EmbeddingError::Conflict {
                name: descriptor.name.clone(),
                existing: table.signature(),
                requested: descriptor.signature(),
            });
        }
        self.check_compatible(&descriptor)?;
        self.store.register(table)?;
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Writes every registered table to a checkpoint directory.
    pub fn save(&self, dir: &Path) -> Result<Manifest> {
        let pairs = self
            .descriptors
            .values()
            .map(|descriptor| Ok((descriptor, self.store.get(&descriptor.name)?)))
            .collect::<Result<Vec<_>>>()?;
        checkpoint::save_tables(dir, pairs)
    }

    /// Rebuilds a store from a checkpoint directory.
    pub fn restore(dir: &Path, replicas: usize) -> Result<Self> {
        let mut store = Self::new(replicas);
        for (descriptor, table) in checkpoint::load_tables(dir)? {
            store.adopt(descriptor, table)?;
        }
        Ok(store)
    }

    fn check_compatible(&self, descriptor: &TableDescriptor) -> Result<()> {
        if let Some(existing) = self.descriptors.get(&descriptor.name) {
            if existing != descriptor {
                return Err(EmbeddingError::Conflict {
                    name: descriptor.name.clone(),
                    existing: existing.signature(),
                    requested: descriptor.signature(),
                });
            }
        }
        let axis_len = match descriptor.partition_strategy {
            PartitionStrategy::Token => descriptor.rows,
            PartitionStrategy::Encoding => descriptor.width,
        };
        partition::replica_ranges(axis_len, self.replicas)?;
        Ok(())
    }

    /// Checks that a request matches what was registered under its name.
    fn registered(&self, descriptor: &TableDescriptor) -> Result<&EmbeddingTable> {
        let existing = self.descriptor(&descriptor.name)?;
        if existing != descriptor {
            return Err(EmbeddingError::Conflict {
                name: descriptor.name.clone(),
                existing: existing.signature(),
                requested: descriptor.signature(),
            });
        }
        self.store.get(&descriptor.name)
    }

    fn check_ids(descriptor: &TableDescriptor, ids: &[i64]) -> Result<()> {
        match ids
            .iter()
            .find(|&&id| id < 0 || id as usize >= descriptor.rows)
        {
            Some(&index) => Err(EmbeddingError::IndexOutOfRange {
                index,
                rows: descriptor.rows,
            }),
            None => Ok(()),
        }
    }
}

impl HostChannel for HostStore {
    fn register(&mut self, descriptor: &TableDescriptor, initializer: &Initializer) -> Result<()> {
        self.check_compatible(descriptor)?;
        if self.descriptors.contains_key(&descriptor.name) {
            return Ok(());
        }
        let table = EmbeddingTable::new(
            &descriptor.name,
            &descriptor.shape(),
            descriptor.dtype.as_str(),
            initializer,
        )?;
        self.store.register(table)?;
        self.descriptors
            .insert(descriptor.name.clone(), descriptor.clone());
        Ok(())
    }

    fn lookup(&mut self, descriptor: &TableDescriptor, ids: &[i64]) -> Result<Array2<f32>> {
        let table = self.registered(descriptor)?;
        Self::check_ids(descriptor, ids)?;
        let pieces =
            partition::distribute(table.view(), descriptor.partition_strategy, self.replicas)?;
        tracing::debug!(
            name = %descriptor.name,
            num_ids = ids.len(),
            replicas = pieces.len(),
            strategy = %descriptor.partition_strategy,
            "host lookup"
        );

        let out = match descriptor.partition_strategy {
            PartitionStrategy::Token => {
                let mut out = Array2::<f32>::zeros((ids.len(), descriptor.width));
                for (mut dst, &id) in out.outer_iter_mut().zip(ids) {
                    let (replica, local) =
                        partition::route_token(id as usize, descriptor.rows, self.replicas);
                    dst.assign(&pieces[replica].row(local));
                }
                out
            }
            PartitionStrategy::Encoding => {
                let ids: Vec<usize> = ids.iter().map(|&id| id as usize).collect();
                let columns: Vec<Array2<f32>> = pieces
                    .iter()
                    .map(|piece| piece.select(Axis(0), &ids))
                    .collect();
                let views: Vec<ArrayView2<'_, f32>> = columns.iter().map(|c| c.view()).collect();
                concatenate(Axis(1), &views).map_err(|e| EmbeddingError::Transfer {
                    name: descriptor.name.clone(),
                    message: e.to_string(),
                })?
            }
        };
        Ok(out)
    }

    fn fetch(&mut self, descriptor: &TableDescriptor) -> Result<EmbeddingTable> {
        Ok(self.registered(descriptor)?.clone())
    }

    fn accumulate(
        &mut self,
        descriptor: &TableDescriptor,
        ids: &[i64],
        grads: ArrayView2<'_, f32>,
    ) -> Result<()> {
        self.registered(descriptor)?;
        let optimizer = descriptor.optimizer.ok_or_else(|| {
            EmbeddingError::argument(
                "optimizer_spec",
                format!("table '{}' is not trainable", descriptor.name),
            )
        })?;
        if grads.nrows() != ids.len() || grads.ncols() != descriptor.width {
            return Err(EmbeddingError::shape(
                grads.shape(),
                format!(
                    "expected [{}, {}] gradient rows for table '{}'",
                    ids.len(),
                    descriptor.width,
                    descriptor.name
                ),
            ));
        }
        Self::check_ids(descriptor, ids)?;
        let table = self.store.get_mut(&descriptor.name)?;
        optimizer.apply_rows(table.values_mut(), ids, grads);
        tracing::debug!(name = %descriptor.name, num_ids = ids.len(), "host accumulate");
        Ok(())
    }

    fn release(&mut self, name: &str) {
        if self.descriptors.remove(name).is_some() {
            self.store.remove(name);
            tracing::debug!(name, "released host table");
        }
    }
}
