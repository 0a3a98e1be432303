//! Dropgate Server Library
//!
//! Ephemeral, link-based file transfer. Uploads stream over a WebSocket into
//! blob storage; recipients fetch them with nonce-challenge proofs until the
//! download limit or the expiry is reached, after which the file is gone.
//!
//! # Modules
//!
//! - `store`: sharded in-memory metadata store
//! - `auth`: nonce challenge/response and owner checks
//! - `blob`: file contents on disk
//! - `channel`: duplex message pumps over a WebSocket
//! - `upload`: upload session state machine
//! - `routes`: HTTP surface
//! - `admission`: bounded worker pools
//! - `maintenance`: janitor, snapshots and startup repair

pub mod admission;
pub mod auth;
pub mod blob;
pub mod channel;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod routes;
pub mod state;
pub mod store;
pub mod upload;

pub use config::Config;
pub use state::AppState;
