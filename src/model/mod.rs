//! Read-only export inputs: the project snapshot, media descriptors and per-run settings.

/// Media descriptors and the catalog seam.
pub mod media;
/// Project / track / element snapshot.
pub mod project;
/// Per-run export settings.
pub mod settings;
