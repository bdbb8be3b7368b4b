pub mod config;
pub mod error;
pub mod idempotency;
pub mod models;
pub mod overlay;
pub mod playback;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod resource;
pub mod rpc;
pub mod snapshot;
pub mod speech;
pub mod stats;
pub mod transport;
pub mod voice;
