//! Re-exports the `tracing` facade so every crate in this workspace logs
//! through one dependency and one feature set.

pub use tracing;
