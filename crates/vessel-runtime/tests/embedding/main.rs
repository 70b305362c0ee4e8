//! End-to-end tests for embedding the VM
//!
//! These drive a [`vessel_runtime::Vessel`] the way a host application
//! would, with modules assembled by the bytecode builder.

mod harness;
mod hot_reload;
mod gc_guards;
mod lifecycle;
mod non_threaded;
mod static_access;
mod threaded;
