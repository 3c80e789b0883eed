//! The router's error taxonomy (SPEC_FULL.md §7). One variant per recovery
//! row in the spec's error table; component-local error types are wrapped in
//! via `#[from]` so callers can match at whichever granularity they need.

use crate::backend::history::HistoryError;
use crate::backend::ps_id_map::PsIdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("packet header claims a length inconsistent with prior continuations")]
    InconsistentContinuation,
    #[error("unexpected end of stream mid-packet")]
    Truncated,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("protocol framing error: {0}")]
    ProtocolFraming(#[from] FramingError),

    #[error("classifier could not determine statement type; routing conservatively to master")]
    ClassifierUnknown,

    #[error("backend {backend} unreachable: {source}")]
    BackendUnreachable {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transient rollback error from {backend} (sqlstate {sqlstate})")]
    TransientRollback { backend: String, sqlstate: String },

    #[error("backend {backend} not ready (wsrep bootstrapping)")]
    WsrepNotReady { backend: String },

    #[error("backend {backend} is gone: {reason}")]
    ShutdownLike { backend: String, reason: String },

    #[error("state mismatch on backend {backend}: {detail}")]
    StateMismatch { backend: String, detail: String },

    #[error("session history exhausted, state cannot be recovered")]
    HistoryExhausted,

    #[error("replay unsafe: {reason}")]
    ReplayUnsafe { reason: String },

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error("prepared statement id error: {0}")]
    PsId(#[from] PsIdError),

    #[error("session busy: queue depth exceeded while replay is in progress")]
    Busy,
}

impl RouterError {
    /// True if this error class should attempt transaction replay before
    /// surfacing to the client (spec §7 "Propagation").
    pub fn is_replayable(&self) -> bool {
        matches!(
            self,
            RouterError::BackendUnreachable { .. }
                | RouterError::TransientRollback { .. }
                | RouterError::WsrepNotReady { .. }
                | RouterError::ShutdownLike { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replayable_kinds() {
        let e = RouterError::ShutdownLike {
            backend: "m1".into(),
            reason: "server shutdown".into(),
        };
        assert!(e.is_replayable());

        let e = RouterError::HistoryExhausted;
        assert!(!e.is_replayable());
    }
}
