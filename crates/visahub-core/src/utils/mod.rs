//! Small helpers shared across modules.

pub mod ids;

pub use ids::{id_string, opt_id_string};
