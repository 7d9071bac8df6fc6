//! Configuration for propserve
//!
//! Worker resource specs, pool bounds, connection options and the CLI
//! surface.

mod resources;
mod settings;

pub use resources::*;
pub use settings::*;
