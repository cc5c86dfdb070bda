//! Turnstile - Multi-Tier Request Admission Control
//!
//! This crate implements a request admission controller that sits in
//! front of an HTTP API and decides, per request, whether to admit or
//! reject it before business logic runs. Quotas are enforced across
//! three cumulative tiers (endpoint, identity, address) using per-key
//! sliding windows, with quota metadata exposed on every response.

pub mod admission;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
