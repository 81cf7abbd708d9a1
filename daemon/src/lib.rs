pub mod dto;
pub mod router;
pub mod rpc;
pub mod server;
pub mod state;

pub use router::DaemonRouter;
pub use server::DaemonServer;
pub use state::{ConsolidationLock, DaemonState, IngestionTask, TaskStatus};

#[cfg(test)]
mod tests;
