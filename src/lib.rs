//! Cardigann - declarative indexer engine
//!
//! Searches, authenticates against and downloads from torrent trackers,
//! Usenet gateways and streaming catalogs described by YAML definitions.
//! See [`indexer`] for the engine itself.

pub mod browser;
pub mod cli;
pub mod config;
pub mod http;
pub mod indexer;
pub mod session;
