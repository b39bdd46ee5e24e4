//! Core modules for the gatehouse orchestration core.
//!
//! The truth store, entity model, and shared primitives live here. Every
//! subsystem in [`crate::plugins`] reads and writes through [`store::Store`].

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod pool;
pub mod rpc;
pub mod schemas;
pub mod store;
pub mod time;
pub mod truth;
