//! Durable delivery: bounded queues, chunked transport, retry/backoff.

pub mod persister;
pub mod transport;

pub use persister::{compact_metric_batch, BatchCompactor, PersistDisposition, Persister};
pub use transport::{ChunkMetadata, ChunkTransport, HttpTransport, TransportAck};
