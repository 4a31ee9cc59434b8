//! mindgate — local, resource-bounded inference router for a hybrid AI
//! assistant.
//!
//! A request comes in over HTTP, passes the predictive health gate, gets
//! classified and weighted, and is routed to one of several differently
//! capable models that the pool loads and evicts under a strict RAM
//! budget. Answers on the technical path may take an iterative refinement
//! pass before they leave.
//!
//! The crate is organised around four load-bearing pieces:
//!
//! - [`pool`] — model lifecycles, LRU/TTL eviction, swap groups, prefetch,
//!   fallback chains
//! - [`cascade`] and [`route`] — query classification into a routing
//!   decision over three inference tiers plus specialist paths
//! - [`orchestrator`] — the end-to-end request pipeline
//! - [`health`] — EWMA RAM-trend prediction gating admission

pub mod audit;
pub mod cache;
pub mod cascade;
pub mod classify;
pub mod control;
pub mod embedding;
pub mod error;
pub mod health;
pub mod http;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod refine;
pub mod request;
pub mod route;
pub mod settings;

pub use error::{MindgateError, Result};
pub use request::{InferenceRequest, RouteDecision, ScoreVector, Weights};
pub use settings::Settings;
