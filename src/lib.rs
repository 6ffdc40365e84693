//! Tollgate - Per-Key Request Admission Control
//!
//! This crate decides whether "consume N units under key K" requests fit
//! within one or more simultaneous rate limits, using a multi-tier token
//! bucket per key. Key state lives in a bounded, self-expiring in-memory
//! store so idle keys are forgotten.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod service;
