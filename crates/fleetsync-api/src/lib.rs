// fleetsync-api: wire types and transport seams for the OpenAPI and Sharing backends

pub mod backend;
pub mod error;
pub mod snapshot;
pub mod transport;
pub mod wire;

pub use backend::DeviceBackend;
pub use error::Error;
pub use snapshot::SnapshotBackend;
pub use transport::{LoopbackSource, MessageSource, RawMessage};
