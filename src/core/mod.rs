pub mod config;
pub mod error;
pub mod geometry;
pub mod name;

/// Upper bound on lookup zones.
pub const MAX_ZONES: usize = 16;
