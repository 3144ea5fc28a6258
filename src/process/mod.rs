pub mod checkpoint;
pub mod controller;
pub mod host;

pub use checkpoint::{Checkpointer, CriuCheckpointer};
pub use controller::{LaunchKind, ProcessController};
pub use host::{ProcessHost, SystemProcessHost};
