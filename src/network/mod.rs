pub mod cors;
pub mod relay;
pub mod server;

pub use relay::{ChunkSink, ChunkSource, RelayOutcome, StreamRelay};
pub use server::{router, AppState, Server};
