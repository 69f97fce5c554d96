//! Readgate - admission control for AI-backed book reading endpoints
//!
//! Classifies inbound requests by how expensive they are to serve and
//! throttles the expensive ones per caller with a persisted, per-key window
//! counter that stays correct under concurrent callers across processes.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod store;

pub use gate::{Admission, AdmissionGate};
