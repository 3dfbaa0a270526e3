// forgepad-common: shared types and utilities for the forgepad workspace

pub mod artifact;
pub mod diff;
pub mod path;
pub mod protocol;
pub mod types;
