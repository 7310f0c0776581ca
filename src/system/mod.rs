//! Host inspection helpers.

pub mod disk;
