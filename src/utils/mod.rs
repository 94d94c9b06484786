//! Shared utilities: the error taxonomy and logging initialisation.

pub mod error;
pub mod logging;
