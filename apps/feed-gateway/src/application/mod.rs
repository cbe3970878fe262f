//! Application Layer
//!
//! Use-case orchestration over the domain and infrastructure layers:
//! the per-connection client aggregate and the named-client gateway
//! that serves as the control surface.

pub mod client;
pub mod gateway;
