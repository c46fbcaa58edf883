//! Runtime layer: registries, per-instance locking, and follow-up draining.

pub mod runtime;

pub use runtime::ProcessRuntime;
