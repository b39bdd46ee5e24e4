//! Scheduling and governance subsystems.
//!
//! Each module exposes free functions that take an explicit `&Store`.

pub mod conflict;
pub mod events;
pub mod gates;
pub mod proof;
pub mod queue;
pub mod router;
pub mod workers;
