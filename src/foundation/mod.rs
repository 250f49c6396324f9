/// Timeline primitives shared by every module.
pub mod core;
/// Error taxonomy for the export pipeline.
pub mod error;
/// Fixed-point pixel helpers.
pub mod math;
