pub mod backward;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
mod diagnostic;
mod error;
pub mod forward;
pub mod gradcheck;
pub mod gradient;
pub mod host;
pub mod ir;
pub mod kernels;
pub mod lookup;
pub mod optim;
pub mod partition;
pub mod rng;
pub mod table;
pub mod tensor;

pub use backward::execute_backward;
pub use checkpoint::{load_tables, save_tables, table_digest, Manifest};
pub use config::DeviceConfig;
pub use coordinator::{Coordinator, HostEmbeddingEntry, LookupState, Served, TableHandle};
pub use diagnostic::Diagnostic;
pub use error::{EmbeddingError, Result};
pub use forward::{evaluate, execute_forward};
pub use gradcheck::{gradcheck_serialized_lookup, GradcheckReport};
pub use gradient::scatter_add_gradient;
pub use host::{HostChannel, HostStore, TableDescriptor};
pub use ir::{Graph, NodeId, Op};
pub use lookup::{
    lookup, lookup_gradient, DirectGather, HostLookup, LookupMode, LookupNode, LookupOptions,
    SerializedGather,
};
pub use optim::{OptimizerKind, OptimizerSpec};
pub use partition::{distribute, split, PartitionStrategy, Shard};
pub use rng::SeededRng;
pub use table::{EmbeddingTable, Initializer, TableStore};
pub use tensor::{DType, IndexBatch, IndexPolicy, Tensor};
