//! The two collaborators §6.3 names as consumed, not owned, by the caching
//! core: the resource loader that produces upstream responses, and the
//! addressing scheme used to key requests. Grounded in
//! `ferron_common::modules::SocketData` and in `ResourceAddress.hxx` /
//! `ResourceLoader.hxx` from the original beng-proxy sources.

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::istream::{DynIstream, IstreamError};

/// A case-insensitive, byte-exact-value header container. `http::HeaderMap`
/// is exactly the "String map" §6.3 describes: order-irrelevant lookup,
/// case-insensitive names, opaque byte values.
pub type StringMap = http::HeaderMap;

/// Per-connection socket metadata, as seen by a handler.
#[derive(Debug, Clone, Copy)]
pub struct SocketData {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub encrypted: bool,
}

/// Identifies what an upstream request is addressed to. Only the kind
/// matters to the cache: `Pipe` and `Local` addresses are never cacheable
/// (§4.4), and `LocalHttp` carries the extra `https`/docroot discriminants
/// the key scheme folds in so that disjoint virtual hosts sharing one
/// upstream don't collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceAddress {
    /// A normal HTTP/AJP/FastCGI/WAS upstream, identified by its
    /// normalised URI.
    Http { uri: String },
    /// An upstream reached over the local HTTP loopback path, where the
    /// virtual host isn't otherwise reflected by the upstream's own
    /// `Vary` handling.
    LocalHttp {
        uri: String,
        https: bool,
        docroot_hash: u64,
    },
    /// A CGI-style pipe to a spawned process. Never cacheable.
    Pipe { path: String },
    /// A local filesystem resource. Never cacheable.
    Local { path: String },
}

impl ResourceAddress {
    /// §4.4: "Addresses whose kind is pipe or local are un-cacheable and
    /// bypass the cache."
    pub fn is_cacheable_kind(&self) -> bool {
        !matches!(self, ResourceAddress::Pipe { .. } | ResourceAddress::Local { .. })
    }
}

/// An upstream response, as delivered to a cache façade by a
/// [`ResourceLoader`].
pub struct UpstreamResponse {
    pub status: http::StatusCode,
    pub headers: StringMap,
    pub body: DynIstream,
}

/// The collaborator that actually issues upstream requests. Out of scope
/// for this subsystem (§1): the HTTP/AJP/FastCGI/WAS client stacks and
/// connection pooling live behind this one async method. Dropping the
/// returned future cancels the in-flight request — the Rust analogue of
/// the original's explicit `CancellablePointer`.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn send_request(
        &self,
        method: http::Method,
        address: &ResourceAddress,
        headers: StringMap,
        body: Option<DynIstream>,
    ) -> Result<UpstreamResponse, IstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_and_local_are_never_cacheable() {
        assert!(!ResourceAddress::Pipe { path: "/cgi".into() }.is_cacheable_kind());
        assert!(!ResourceAddress::Local { path: "/var/www".into() }.is_cacheable_kind());
    }

    #[test]
    fn http_addresses_are_cacheable() {
        assert!(ResourceAddress::Http { uri: "/a".into() }.is_cacheable_kind());
        assert!(ResourceAddress::LocalHttp {
            uri: "/a".into(),
            https: true,
            docroot_hash: 42,
        }
        .is_cacheable_kind());
    }
}
