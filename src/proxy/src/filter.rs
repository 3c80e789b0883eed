//! The filter collaborator interface (SPEC_FULL.md §6, §9). A downstream
//! chain the router session consults before and after dispatching to
//! backends; each filter can short-circuit a query with a pre-formed reply
//! instead of letting it reach a backend (masking refusals, the PS reuse
//! cache, etc). Grounded on the original implementation's four-method
//! `FilterSession` pipeline, with `psreuse.cc`'s own subclass as the worked
//! example this crate's built-in PS reuse integration follows.

use async_trait::async_trait;

/// Outcome of `FilterSession::route_query`: either the query continues
/// toward the backends unchanged, or the filter has produced the entire
/// reply itself.
pub enum RouteOutcome {
    Forward(Vec<u8>),
    ShortCircuit(Vec<u8>),
}

#[async_trait]
pub trait FilterSession: Send {
    async fn route_query(&mut self, packet: &[u8]) -> RouteOutcome;
    async fn client_reply(&mut self, reply: &[u8]);
    async fn close_session(&mut self);
}

/// A filter module: a factory for per-session `FilterSession`s, mirroring
/// `create_instance -> new_session -> ... -> free_session`.
pub trait Filter: Send + Sync {
    fn new_session(&self) -> Box<dyn FilterSession>;
}

/// The no-op filter, used when no filter chain is configured. Forwards
/// every query untouched.
pub struct PassthroughFilter;

struct PassthroughSession;

#[async_trait]
impl FilterSession for PassthroughSession {
    async fn route_query(&mut self, packet: &[u8]) -> RouteOutcome {
        RouteOutcome::Forward(packet.to_vec())
    }

    async fn client_reply(&mut self, _reply: &[u8]) {}

    async fn close_session(&mut self) {}
}

impl Filter for PassthroughFilter {
    fn new_session(&self) -> Box<dyn FilterSession> {
        Box::new(PassthroughSession)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_forwards_unchanged() {
        let filter = PassthroughFilter;
        let mut session = filter.new_session();
        match session.route_query(b"SELECT 1").await {
            RouteOutcome::Forward(bytes) => assert_eq!(bytes, b"SELECT 1"),
            RouteOutcome::ShortCircuit(_) => panic!("expected forward"),
        }
    }
}
