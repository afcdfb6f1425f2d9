//! Windowguard - Sliding-Window Rate Limiting
//!
//! This crate enforces "at most N operations per trailing window W" for each
//! caller key. The shared counting state lives in a coordination store
//! (Redis), and every decision is a single atomic evaluation in that store,
//! so any number of tasks and processes can share one quota.

pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod ratelimit;
