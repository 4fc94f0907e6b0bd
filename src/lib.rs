//! Library crate for fanscan: a full-range TCP connect scanner whose port
//! space is dealt out to supervised worker units.
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ports;
pub mod probe;
pub mod report;
pub mod resolve;
pub mod services;
pub mod transport;
pub mod types;
pub mod worker;
