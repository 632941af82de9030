//! Shared foundation for the merlin storage and repair cores: ring tokens
//! and ranges, decorated keys, partitioners, the error taxonomy, latches,
//! staged executors, and observability setup.

pub mod dht;
pub mod error;
pub mod observability;
pub mod partitioner;
pub mod shutdown;
pub mod stage;
pub mod sync;
pub mod types;

pub use dht::{AbstractBounds, Bounds, Range};
pub use error::{ErrorKind, HintError, MerlinError, MerlinResult, RepairError, StorageError};
pub use partitioner::{HashedPartitioner, OrderPreservingPartitioner, Partitioner};
pub use shutdown::ShutdownSignal;
pub use stage::StageExecutor;
pub use sync::{CountdownLatch, Latch};
pub use types::{DecoratedKey, Endpoint, SessionId, Token};
