//! Persistence and replay core of a FIX gateway.
//!
//! Every business message that crosses the gateway is recorded in a durable
//! ordered journal. This crate indexes those messages by sequence number per
//! session, persists the session identity store, and services
//! `ResendRequest` by replaying the recorded bytes tagged as possible
//! duplicates.

pub mod agent;
pub mod archive;
pub mod config;
pub mod contexts;
pub mod error;
pub mod fix;
pub mod indexer;
pub mod journal;
pub mod replay_index;
pub mod replayer;
pub mod sector;

pub use config::Config;
pub use error::{CollectingErrorSink, Error, ErrorSink, LoggingErrorSink, Result};
