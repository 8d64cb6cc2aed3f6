//! A thin per-request error sink, shaped after `ferron`'s own
//! `ErrorLogger`/`LogMessage` handle (see `ferron/src/common/mod.rs` in the
//! teacher repo): a cheap, cloneable value threaded down a call chain so
//! deeply-nested code can report a failure without knowing where it
//! ultimately goes. The teacher fans failures out to per-virtual-host log
//! channels, which is the listener/logging subsystem this spec lists as an
//! external collaborator (§1); here the sink forwards straight to
//! `tracing`, since that subsystem is out of scope for the cache.

use std::fmt;

/// Identifies which cache subsystem produced a log line, so multiplexed
/// `tracing` output stays attributable without each façade hand-rolling a
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    HttpCache,
    FilterCache,
    EncodingCache,
    Rubber,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogSource::HttpCache => "http_cache",
            LogSource::FilterCache => "filter_cache",
            LogSource::EncodingCache => "encoding_cache",
            LogSource::Rubber => "rubber",
        };
        f.write_str(s)
    }
}

/// A cheap handle for reporting request-scoped errors and warnings.
#[derive(Debug, Clone, Copy)]
pub struct ErrorLogger {
    source: LogSource,
}

impl ErrorLogger {
    pub fn new(source: LogSource) -> Self {
        Self { source }
    }

    pub fn warn(&self, message: impl fmt::Display) {
        tracing::warn!(target: "ferron_cache", source = %self.source, "{message}");
    }

    pub fn error(&self, message: impl fmt::Display) {
        tracing::error!(target: "ferron_cache", source = %self.source, "{message}");
    }
}
