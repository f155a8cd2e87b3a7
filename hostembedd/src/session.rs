use crate::protocol::{OptimizerRequest, Request, Response};
use hostembed_core::{
    table_digest, DeviceConfig, EmbeddingError, HostChannel, HostStore, IndexBatch, IndexPolicy,
    Initializer, OptimizerSpec, PartitionStrategy, Result, TableDescriptor,
};
use hostembed_core::table::validate_shape;
use ndarray::Array2;
use std::path::Path;

/// Host side of the channel: every table the daemon serves.
pub struct Session {
    config: DeviceConfig,
    store: HostStore,
}

impl Session {
    pub fn new(config: DeviceConfig) -> Self {
        let store = HostStore::new(config.replicas);
        Self { config, store }
    }

    pub fn restore(config: DeviceConfig, dir: &Path) -> Result<Self> {
        let store = HostStore::restore(dir, config.replicas)?;
        tracing::info!(
            dir = %dir.display(),
            tables = store.descriptors().count(),
            "restored tables"
        );
        Ok(Self { config, store })
    }

    fn policy(&self, clip_indices: Option<bool>) -> IndexPolicy {
        IndexPolicy::from_clip(clip_indices.unwrap_or(self.config.clip_indices))
    }

    fn digest(&self, name: &str) -> Result<String> {
        Ok(table_digest(self.store.table(name)?))
    }

    /// Handles one request. `Shutdown` is answered but ending the loop is the caller's job.
    pub fn handle(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::Register {
                name,
                shape,
                dtype,
                partition_strategy,
                optimizer,
                initializer,
            } => self.register(name, &shape, &dtype, &partition_strategy, optimizer, initializer),
            Request::Lookup {
                name,
                ids,
                shape,
                clip_indices,
            } => {
                let descriptor = self.store.descriptor(&name)?.clone();
                let batch = match shape {
                    Some(shape) => IndexBatch::new(&shape, ids)?,
                    None => IndexBatch::flat(ids),
                };
                let resolved: Vec<i64> = batch
                    .resolve(descriptor.rows, self.policy(clip_indices))?
                    .into_iter()
                    .map(|id| id as i64)
                    .collect();
                let rows = self.store.lookup(&descriptor, &resolved)?;
                Ok(Response::Lookup {
                    shape: batch.output_shape(descriptor.width),
                    values: rows.iter().copied().collect(),
                    sha256: self.digest(&name)?,
                    name,
                })
            }
            Request::Accumulate {
                name,
                ids,
                grads,
                clip_indices,
            } => {
                let descriptor = self.store.descriptor(&name)?.clone();
                let resolved: Vec<i64> = IndexBatch::flat(ids)
                    .resolve(descriptor.rows, self.policy(clip_indices))?
                    .into_iter()
                    .map(|id| id as i64)
                    .collect();
                let grads = grad_matrix(grads, descriptor.width)?;
                self.store.accumulate(&descriptor, &resolved, grads.view())?;
                Ok(Response::Accumulate {
                    rows_updated: resolved.len(),
                    sha256: self.digest(&name)?,
                    name,
                })
            }
            Request::Describe { name } => {
                let tables = match name {
                    Some(name) => vec![self.store.descriptor(&name)?.clone()],
                    None => self.store.descriptors().cloned().collect(),
                };
                Ok(Response::Describe { tables })
            }
            Request::Save { dir } => {
                let manifest = self.store.save(Path::new(&dir))?;
                Ok(Response::Save {
                    dir,
                    tables: manifest.tables.len(),
                    weights_sha256: manifest.weights_sha256,
                })
            }
            Request::Shutdown => Ok(Response::Shutdown),
        }
    }

    fn register(
        &mut self,
        name: String,
        shape: &[usize],
        dtype: &str,
        partition_strategy: &str,
        optimizer: Option<OptimizerRequest>,
        initializer: Option<Initializer>,
    ) -> Result<Response> {
        if name.trim().is_empty() {
            return Err(EmbeddingError::argument("name", "table name must not be empty"));
        }
        let (rows, width) = validate_shape(shape)?;
        let optimizer = optimizer
            .map(|spec| OptimizerSpec::new(&spec.kind, spec.learning_rate))
            .transpose()?;
        let descriptor = TableDescriptor {
            name,
            rows,
            width,
            dtype: dtype.parse()?,
            partition_strategy: partition_strategy.parse::<PartitionStrategy>()?,
            optimizer,
        };
        self.store
            .register(&descriptor, &initializer.unwrap_or_default())?;
        tracing::info!(table = %descriptor.signature(), "registered");
        Ok(Response::Register { table: descriptor })
    }
}

fn grad_matrix(grads: Vec<Vec<f32>>, width: usize) -> Result<Array2<f32>> {
    let rows = grads.len();
    if let Some(bad) = grads.iter().find(|row| row.len() != width) {
        return Err(EmbeddingError::shape(
            &[rows, bad.len()],
            format!("every gradient row must have width {}", width),
        ));
    }
    let flat: Vec<f32> = grads.into_iter().flatten().collect();
    Array2::from_shape_vec((rows, width), flat)
        .map_err(|e| EmbeddingError::shape(&[rows, width], e.to_string()))
}
