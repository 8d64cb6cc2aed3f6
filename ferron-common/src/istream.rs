//! Minimal model of the istream contract this subsystem relies on (§6.4):
//! a lazy, cancellable byte source that a sink pulls from, with `OnEof`/
//! `OnError` firing exactly once and `Close` being callable (and idempotent)
//! at any point before that. The full istream framework — direct-to-fd
//! splicing, bucket lists, the pool-owned combinator graph — belongs to the
//! streaming layer this spec treats as an external collaborator; this is
//! just enough of its shape for the cache façades to tee a response body
//! into "one copy to the client, one copy into the rubber-sink" without
//! depending on that framework.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// An error surfacing from a byte source. Cheaply cloneable so the same
/// failure can be delivered to both branches of a `tee`.
pub type IstreamError = Arc<anyhow::Error>;

/// A lazy, pull-based byte source. `read` may be called again after
/// returning `Ok(Some(bytes))`; it returns `Ok(None)` exactly once, at EOF,
/// matching the istream contract's single terminal event.
///
/// A source may legitimately return `Ok(Some(Bytes::new()))` (a soft block,
/// zero bytes) — callers must tolerate that and call `read` again rather
/// than treating it as EOF.
#[async_trait]
pub trait IstreamSource: Send {
    /// Best-effort size estimate, mirroring `GetAvailable(partial)`.
    /// `partial = false` asks for an exact size (only answerable if the
    /// source already knows its total length, e.g. a `Content-Length`
    /// body); `partial = true` allows a lower-bound estimate of what's
    /// buffered so far.
    fn available(&self, partial: bool) -> Option<u64>;

    /// Pulls the next chunk, or `None` at EOF.
    async fn read(&mut self) -> Result<Option<Bytes>, IstreamError>;

    /// Tears the source down before a terminal event fired. Idempotent.
    fn close(&mut self) {}
}

/// A boxed, trait-object byte source.
pub type DynIstream = Box<dyn IstreamSource>;

/// An in-memory byte source, useful for tests and for replaying an already
/// fully-buffered body (e.g. the product of a cache hit).
pub struct BytesSource {
    remaining: Option<Bytes>,
}

impl BytesSource {
    pub fn new(body: Bytes) -> Self {
        Self {
            remaining: Some(body),
        }
    }
}

#[async_trait]
impl IstreamSource for BytesSource {
    fn available(&self, _partial: bool) -> Option<u64> {
        self.remaining.as_ref().map(|b| b.len() as u64)
    }

    async fn read(&mut self) -> Result<Option<Bytes>, IstreamError> {
        Ok(self.remaining.take())
    }
}

/// One output branch of a `tee`. Implements `IstreamSource` itself, so a
/// tee branch can be fed straight into another sink (e.g. the client
/// response body, or the rubber-sink).
pub struct TeeBranch {
    rx: mpsc::Receiver<Result<Bytes, IstreamError>>,
    available_hint: Option<u64>,
}

#[async_trait]
impl IstreamSource for TeeBranch {
    fn available(&self, _partial: bool) -> Option<u64> {
        self.available_hint
    }

    async fn read(&mut self) -> Result<Option<Bytes>, IstreamError> {
        match self.rx.recv().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

/// Duplicates `source` into two independent consumers. One branch (the
/// client) is never delayed by the other (the cache store): both channels
/// are generously buffered, and if a branch's receiver is dropped (the
/// store gave up, or the client disconnected) the pump simply stops
/// delivering to that branch without affecting the other — matching §5's
/// "the client branch is not delayed by the store branch".
pub fn tee(mut source: DynIstream) -> (TeeBranch, TeeBranch) {
    let available_hint = source.available(true);
    let (tx_a, rx_a) = mpsc::channel(32);
    let (tx_b, rx_b) = mpsc::channel(32);

    tokio::spawn(async move {
        loop {
            match source.read().await {
                Ok(Some(bytes)) => {
                    let _ = tx_a.send(Ok(bytes.clone())).await;
                    let _ = tx_b.send(Ok(bytes)).await;
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx_a.send(Err(e.clone())).await;
                    let _ = tx_b.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    (
        TeeBranch {
            rx: rx_a,
            available_hint,
        },
        TeeBranch {
            rx: rx_b,
            available_hint,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_source_yields_then_eof() {
        let mut s = BytesSource::new(Bytes::from_static(b"abc"));
        assert_eq!(s.read().await.unwrap(), Some(Bytes::from_static(b"abc")));
        assert_eq!(s.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn tee_delivers_same_bytes_to_both_branches() {
        let source: DynIstream = Box::new(BytesSource::new(Bytes::from_static(b"hello")));
        let (mut a, mut b) = tee(source);
        assert_eq!(a.read().await.unwrap(), Some(Bytes::from_static(b"hello")));
        assert_eq!(b.read().await.unwrap(), Some(Bytes::from_static(b"hello")));
        assert_eq!(a.read().await.unwrap(), None);
        assert_eq!(b.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn tee_client_branch_survives_dropped_store_branch() {
        let source: DynIstream = Box::new(BytesSource::new(Bytes::from_static(b"hello")));
        let (mut client, store) = tee(source);
        drop(store);
        assert_eq!(
            client.read().await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(client.read().await.unwrap(), None);
    }
}
