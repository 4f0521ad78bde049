//! Staffetta: a caching redirector for unreliable file hosts.
//!
//! Clients request `GET /{origin-url}`; the service fetches the bytes once,
//! stores them durably, and redirects to the stored copy from then on. A
//! signed webhook drives a serialized, coalesced deploy sequence.

pub mod cache;
pub mod config;
pub mod deploy;
pub mod error;
pub mod fetch;
pub mod infra;
pub mod storage;
mod util;
