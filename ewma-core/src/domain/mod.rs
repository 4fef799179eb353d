//! Domain models shared with the surrounding host-pool management.

pub mod host;
pub mod host_set;
