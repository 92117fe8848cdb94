//! Business logic services.

pub mod archiver;
pub mod importer;

pub use archiver::{Archiver, ArchiverContext};
