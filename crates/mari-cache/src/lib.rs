//! TTL cache used by the MaRi proxy to remember successful fetches.
//!
//! Entries expire lazily at lookup time against an injected [`Clock`].

pub mod clock;
pub mod sharded;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use sharded::TtlCache;
pub use traits::{CacheEntry, CacheStats};
