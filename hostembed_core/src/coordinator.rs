//! Coordinator for host-resident embeddings.
//!
//! Owns the registration table for one computation context. Each entry
//! moves through a one-way state machine:
//!
//! ```text
//! (unregistered) --create_host_embedding--> Registered --lookup--> LookedUp
//! ```
//!
//! Before the first lookup the table is served to the device as a plain
//! tensor; afterwards the device only holds an indirection through the host
//! channel. Nothing leaves `LookedUp`.

use crate::error::{EmbeddingError, Result};
use crate::host::{HostChannel, TableDescriptor};
use crate::lookup::{prepare_ids, HostLookup, LookupNode, LookupOptions};
use crate::optim::OptimizerSpec;
use crate::partition::PartitionStrategy;
use crate::table::{validate_shape, EmbeddingTable, Initializer};
use crate::tensor::{DType, IndexBatch, Tensor};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupState {
    Registered,
    LookedUp,
}

impl LookupState {
    fn after_lookup(self) -> Self {
        LookupState::LookedUp
    }
}

/// Registration record for one named host table.
#[derive(Clone, Debug, PartialEq)]
pub struct HostEmbeddingEntry {
    descriptor: TableDescriptor,
    state: LookupState,
}

impl HostEmbeddingEntry {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn partition_strategy(&self) -> PartitionStrategy {
        self.descriptor.partition_strategy
    }

    pub fn optimizer(&self) -> Option<OptimizerSpec> {
        self.descriptor.optimizer
    }

    pub fn state(&self) -> LookupState {
        self.state
    }

    pub fn has_lookup_occurred(&self) -> bool {
        self.state == LookupState::LookedUp
    }
}

/// Names a registered table; returned by [`Coordinator::create_host_embedding`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableHandle {
    name: String,
}

impl TableHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsRef<str> for TableHandle {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// What the device receives for a host table.
#[derive(Clone, Debug, PartialEq)]
pub enum Served {
    /// No lookup has happened yet: the table itself.
    Table(EmbeddingTable),
    /// Rows are fetched through the host channel.
    Indirect(TableDescriptor),
}

pub struct Coordinator<C: HostChannel> {
    channel: C,
    entries: BTreeMap<String, HostEmbeddingEntry>,
}

impl<C: HostChannel> Coordinator<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            entries: BTreeMap::new(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn entry(&self, name: &str) -> Result<&HostEmbeddingEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| EmbeddingError::not_found(name))
    }

    pub fn entries(&self) -> impl Iterator<Item = &HostEmbeddingEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a host-resident table and returns its handle.
    ///
    /// Re-registering a name with an identical descriptor returns the existing
    /// handle without touching its state; any difference is a conflict. Either
    /// the host accepts the table and an entry is recorded, or nothing is.
    pub fn create_host_embedding(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: &str,
        partition_strategy: PartitionStrategy,
        optimizer: Option<OptimizerSpec>,
        initializer: Option<&Initializer>,
    ) -> Result<TableHandle> {
        if name.trim().is_empty() {
            return Err(EmbeddingError::argument("name", "table name must not be empty"));
        }
        let (rows, width) = validate_shape(shape)?;
        let dtype: DType = dtype.parse()?;
        let descriptor = TableDescriptor {
            name: name.to_string(),
            rows,
            width,
            dtype,
            partition_strategy,
            optimizer,
        };

        if let Some(existing) = self.entries.get(name) {
            if existing.descriptor != descriptor {
                return Err(EmbeddingError::Conflict {
                    name: name.to_string(),
                    existing: existing.descriptor.signature(),
                    requested: descriptor.signature(),
                });
            }
            return Ok(TableHandle {
                name: name.to_string(),
            });
        }

        let default_initializer = Initializer::default();
        self.channel
            .register(&descriptor, initializer.unwrap_or(&default_initializer))?;
        tracing::info!(table = %descriptor.signature(), "registered host embedding");
        self.entries.insert(
            name.to_string(),
            HostEmbeddingEntry {
                descriptor,
                state: LookupState::Registered,
            },
        );
        Ok(TableHandle {
            name: name.to_string(),
        })
    }

    pub fn has_lookup_occurred(&self, table: impl AsRef<str>) -> Result<bool> {
        Ok(self.entry(table.as_ref())?.has_lookup_occurred())
    }

    /// Looks up `ids` in a host table; the result has shape `ids.shape ++ [width]`.
    ///
    /// Out-of-range ids are clipped to `[0, rows - 1]` when
    /// `options.clip_indices` is set and rejected otherwise. The serialization
    /// factor only applies to device tables; here it must merely be valid.
    pub fn lookup(
        &mut self,
        table: impl AsRef<str>,
        ids: &IndexBatch,
        options: &LookupOptions,
    ) -> Result<Tensor> {
        let name = table.as_ref();
        check_factor(options)?;
        let descriptor = self.entry(name)?.descriptor.clone();
        let (flat, out_shape) = prepare_ids(
            ids,
            descriptor.rows,
            descriptor.width,
            options.index_policy(),
        )?;

        let output = HostLookup::new(&mut self.channel, descriptor).forward(&flat, &out_shape)?;

        if let Some(entry) = self.entries.get_mut(name) {
            if entry.state == LookupState::Registered {
                tracing::info!(table = name, "first lookup, table now served indirectly");
            }
            entry.state = entry.state.after_lookup();
        }
        Ok(output)
    }

    /// Sends the upstream gradient of a previous lookup to the host, which
    /// applies the table's optimizer. Ids are resolved exactly as in [`Self::lookup`].
    pub fn apply_gradients(
        &mut self,
        table: impl AsRef<str>,
        ids: &IndexBatch,
        upstream: &Tensor,
        options: &LookupOptions,
    ) -> Result<()> {
        let name = table.as_ref();
        check_factor(options)?;
        let descriptor = self.entry(name)?.descriptor.clone();
        let (flat, _) = prepare_ids(
            ids,
            descriptor.rows,
            descriptor.width,
            options.index_policy(),
        )?;
        HostLookup::new(&mut self.channel, descriptor).backward(&flat, upstream)?;
        Ok(())
    }

    /// What the device should hold for `table` right now.
    pub fn serve_to_device(&mut self, table: impl AsRef<str>) -> Result<Served> {
        let entry = self.entry(table.as_ref())?;
        match entry.state {
            LookupState::Registered => {
                let descriptor = entry.descriptor.clone();
                Ok(Served::Table(self.channel.fetch(&descriptor)?))
            }
            LookupState::LookedUp => Ok(Served::Indirect(entry.descriptor.clone())),
        }
    }

    /// Releases every entry and its host table.
    pub fn end_session(&mut self) {
        let released = self.entries.len();
        for name in std::mem::take(&mut self.entries).into_keys() {
            self.channel.release(&name);
        }
        if released > 0 {
            tracing::info!(released, "ended host embedding session");
        }
    }
}

fn check_factor(options: &LookupOptions) -> Result<()> {
    if options.serialization_factor < 1 {
        return Err(EmbeddingError::argument(
            "serialization_factor",
            format!(
                "serialization factor has to be at least 1, but was {}",
                options.serialization_factor
            ),
        ));
    }
    Ok(())
}

impl<C: HostChannel> Drop for Coordinator<C> {
    fn drop(&mut self) {
        self.end_session();
    }
}
