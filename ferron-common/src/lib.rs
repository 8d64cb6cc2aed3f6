//! Shared collaborator interfaces for the caching subsystem.
//!
//! This crate is deliberately thin: it does not implement a cache. It pins
//! down the contracts the cache façades in `ferron-http-cache`,
//! `ferron-filter-cache` and `ferron-encoding-cache` depend on but do not
//! own — the istream byte-source contract, the resource loader that
//! produces upstream responses, per-connection socket data, and the two
//! clocks the cache substrate needs (steady for LRU/TTL arithmetic, wall for
//! mapping HTTP `Expires`/`Date` headers onto it).

pub mod clock;
pub mod config;
pub mod istream;
pub mod logging;
pub mod observability;
pub mod resource;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::ByteSize;
pub use istream::{tee, IstreamError, IstreamSource};
pub use logging::ErrorLogger;
pub use resource::{ResourceAddress, ResourceLoader, SocketData, StringMap};
