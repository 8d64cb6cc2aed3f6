//! The rubber-sink (§4.3): drains an istream into a single
//! [`RubberAllocation`], bounded by a configured size limit.
//!
//! The original exposes this as a handler interface (`RubberSinkHandler`)
//! invoked from callbacks on the istream event loop. Here it's a single
//! async function returning a typed outcome — the callbacks collapse into
//! `.await` points, and "a cancel handle, invoked before completion,
//! destroys the sink" becomes simply: drop the future. Both are textbook
//! translations of a callback-based state machine into `async fn`
//! already used by `ferron_common::istream::tee` in this same workspace.

use ferron_common::istream::{DynIstream, IstreamError};
use ferron_rubber::{RubberAllocation, RubberHandle};

/// The mutually-exclusive outcomes §4.3 specifies.
pub enum SinkOutcome {
    /// The source ended cleanly. `allocation` is `None` iff the body was
    /// empty (§4.3: "if final_size == 0, the allocation is dropped").
    Done {
        allocation: Option<RubberAllocation>,
        size: u64,
    },
    /// The source produced (or declared) more than `max_size` bytes.
    TooLarge,
    /// The initial allocation in the rubber region failed.
    OutOfMemory,
    /// The source itself failed.
    Error(IstreamError),
}

/// Consumes `source` into a single rubber allocation capped at
/// `max_size` bytes.
///
/// Size estimation per §4.3: if the source already knows its exact size,
/// allocate exactly that (bailing out early as `TooLarge` if it exceeds
/// the limit); if only a partial/lower-bound estimate is available and it
/// already exceeds the limit, bail out without allocating; otherwise
/// allocate the full `max_size` window and shrink to the actual size once
/// the source reaches EOF.
pub async fn sink_into_rubber(
    mut source: DynIstream,
    rubber: &RubberHandle,
    max_size: u64,
) -> SinkOutcome {
    let alloc_size = match source.available(false) {
        Some(exact) if exact > max_size => return SinkOutcome::TooLarge,
        Some(exact) => exact,
        None => match source.available(true) {
            Some(partial) if partial > max_size => return SinkOutcome::TooLarge,
            _ => max_size,
        },
    };

    let Some(allocation) = rubber.add(alloc_size.max(1)) else {
        return SinkOutcome::OutOfMemory;
    };
    let window = allocation.size();

    let mut written = 0u64;
    loop {
        match source.read().await {
            Ok(Some(bytes)) => {
                if bytes.is_empty() {
                    // Soft block: the source has nothing ready yet, but
                    // isn't at EOF either.
                    continue;
                }
                let end = written + bytes.len() as u64;
                if end > window || end > max_size {
                    source.close();
                    return SinkOutcome::TooLarge;
                }
                allocation.write()[written as usize..end as usize].copy_from_slice(&bytes);
                written = end;
            }
            Ok(None) => break,
            Err(e) => return SinkOutcome::Error(e),
        }
    }

    if written == 0 {
        return SinkOutcome::Done {
            allocation: None,
            size: 0,
        };
    }
    allocation.shrink(written);
    SinkOutcome::Done {
        allocation: Some(allocation),
        size: written,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ferron_common::istream::BytesSource;

    fn rubber() -> RubberHandle {
        RubberHandle::new(1024 * 1024).unwrap()
    }

    #[tokio::test]
    async fn done_with_exact_known_size() {
        let r = rubber();
        let source: DynIstream = Box::new(BytesSource::new(Bytes::from_static(b"hello")));
        match sink_into_rubber(source, &r, 1024).await {
            SinkOutcome::Done { allocation, size } => {
                assert_eq!(size, 5);
                assert_eq!(&*allocation.unwrap().read(), b"hello");
            }
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn empty_body_drops_the_allocation() {
        let r = rubber();
        let source: DynIstream = Box::new(BytesSource::new(Bytes::new()));
        match sink_into_rubber(source, &r, 1024).await {
            SinkOutcome::Done { allocation, size } => {
                assert_eq!(size, 0);
                assert!(allocation.is_none());
            }
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn declared_size_over_the_limit_is_too_large_without_allocating() {
        let r = rubber();
        let source: DynIstream = Box::new(BytesSource::new(Bytes::from(vec![0u8; 2048])));
        let netto_before = r.get_netto_size();
        match sink_into_rubber(source, &r, 1024).await {
            SinkOutcome::TooLarge => {}
            _ => panic!("expected TooLarge"),
        }
        assert_eq!(r.get_netto_size(), netto_before);
    }

    struct UnknownSizeSource {
        chunks: Vec<Bytes>,
    }

    #[async_trait::async_trait]
    impl ferron_common::istream::IstreamSource for UnknownSizeSource {
        fn available(&self, _partial: bool) -> Option<u64> {
            None
        }

        async fn read(&mut self) -> Result<Option<Bytes>, IstreamError> {
            Ok(if self.chunks.is_empty() {
                None
            } else {
                Some(self.chunks.remove(0))
            })
        }
    }

    #[tokio::test]
    async fn unknown_size_source_exceeding_the_limit_is_too_large() {
        let r = rubber();
        let source: DynIstream = Box::new(UnknownSizeSource {
            chunks: vec![Bytes::from(vec![0u8; 600]), Bytes::from(vec![0u8; 600])],
        });
        match sink_into_rubber(source, &r, 1024).await {
            SinkOutcome::TooLarge => {}
            _ => panic!("expected TooLarge"),
        }
    }

    #[tokio::test]
    async fn unknown_size_source_within_the_limit_is_shrunk_to_actual_size() {
        let r = rubber();
        let source: DynIstream = Box::new(UnknownSizeSource {
            chunks: vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")],
        });
        match sink_into_rubber(source, &r, 1024).await {
            SinkOutcome::Done { allocation, size } => {
                let allocation = allocation.unwrap();
                assert_eq!(size, 6);
                assert_eq!(allocation.size(), 6);
                assert_eq!(&*allocation.read(), b"abcdef");
            }
            _ => panic!("expected Done"),
        }
    }
}
