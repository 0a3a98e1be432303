//! Upload Module
//!
//! Protocol flow over one duplex connection:
//! 1. Client sends a JSON handshake with its auth secret and transfer terms
//! 2. Server creates the record and replies with id, owner token and share url
//! 3. Client streams raw chunks, appended in arrival order
//! 4. Client sends a single `0x00` byte; server records the length, acks and
//!    closes

pub mod session;
pub mod types;

pub use session::{SessionOutcome, UploadSession};
pub use types::*;
