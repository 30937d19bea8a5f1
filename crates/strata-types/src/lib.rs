//! Shared vocabulary types for the strata store engine.
//!
//! Everything here is plain data: digests and their printable encodings,
//! revision/timestamp numbers, substitute records, and the process-wide
//! interrupt flag threaded through long-running walks.

pub mod hash;
pub mod interrupt;
pub mod revision;
pub mod substitute;

pub use hash::{Sha256Hash, StoreDigest, HASH_SIZE, STORE_DIGEST_SIZE};
pub use interrupt::Interrupt;
pub use revision::{Revision, Timestamp};
pub use substitute::Substitute;
