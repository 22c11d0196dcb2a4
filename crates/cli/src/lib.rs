//! Shared pieces of the optforge binaries: the demo payload both processes
//! evaluate, and the exit-code contract.

pub mod exit;
pub mod sphere;
