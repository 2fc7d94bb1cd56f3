//! Iterative Ensemble Smoother (IES) update core.
//!
//! Given an ensemble of parameter vectors, an ensemble of simulated
//! measurements, observation values and errors, and perturbations of those
//! observations, this crate computes the transform matrix that moves
//! parameters toward observations across successive iterations, carrying
//! state (`W`, `E`, `A0`, masks) between them.
//!
//! The entry point for most callers is [`module::Module`], which mirrors
//! the `IES_ENKF` dispatch table: [`module::Module::alloc`], then
//! [`module::Module::init_update`] / [`module::Module::update_a`] once per
//! iteration. [`update::init_x`] is a stateless convenience for computing a
//! single transform matrix without any persistent state.
//!
//! Everything outside this crate -- ensemble configuration, forward-model
//! drivers, filesystem persistence, unit conversion, observation parsing,
//! and the driver that decides *when* to iterate -- is out of scope; see
//! the crate's design notes for the exact boundary.

pub mod config;
pub mod error;
pub mod inversion;
pub mod linalg;
pub mod logsink;
pub mod mask;
pub mod module;
pub mod state;
pub mod update;

#[cfg(test)]
mod tests;

pub use config::{Config, IesInversion, Truncation};
pub use error::{IesError, IesResult};
pub use logsink::{FileLogSink, LogSink, NullLogSink, RecordingLogSink};
pub use mask::Mask;
pub use module::Module;
pub use state::IterationState;
