//! The monitor collaborator interface and cross-worker broadcast mechanism
//! (SPEC_FULL.md §5, §6, §9). Topology discovery and failover orchestration
//! themselves are out of scope; the router only consumes the resulting
//! state snapshots.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Running,
    Down,
    Master,
    Slave,
    Synced,
    Maint,
    Draining,
}

#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub tier: u8,
}

/// A full-node-list snapshot broadcast by the monitor, with the server that
/// initiated the transition named for logging/diagnostics.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub initiator: Option<String>,
    pub servers: Vec<ServerStatus>,
}

impl ServerSnapshot {
    pub fn master(&self) -> Option<&ServerStatus> {
        self.servers.iter().find(|s| s.state == ServerState::Master)
    }

    pub fn usable_slaves(&self) -> impl Iterator<Item = &ServerStatus> {
        self.servers.iter().filter(|s| {
            s.state == ServerState::Slave || s.state == ServerState::Synced
        })
    }

    pub fn lowest_nonempty_tier(&self, candidates: &[&ServerStatus]) -> Option<u8> {
        candidates.iter().map(|s| s.tier).min()
    }
}

/// Publish-on-write handle: a dedicated administrative task holds the
/// sender, every session worker holds a clone of the receiver and swaps its
/// local snapshot at its next quiescent point (between statements), never
/// mid-statement.
pub fn channel(initial: ServerSnapshot) -> (watch::Sender<Arc<ServerSnapshot>>, watch::Receiver<Arc<ServerSnapshot>>) {
    watch::channel(Arc::new(initial))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_lookup() {
        let snap = ServerSnapshot {
            initiator: None,
            servers: vec![
                ServerStatus { name: "m1".into(), state: ServerState::Master, tier: 0 },
                ServerStatus { name: "s1".into(), state: ServerState::Slave, tier: 0 },
            ],
        };
        assert_eq!(snap.master().unwrap().name, "m1");
        assert_eq!(snap.usable_slaves().count(), 1);
    }

    #[tokio::test]
    async fn watch_channel_delivers_latest_snapshot_to_late_subscriber() {
        let initial = ServerSnapshot { initiator: None, servers: vec![] };
        let (tx, mut rx) = channel(initial);
        let updated = ServerSnapshot {
            initiator: Some("admin".into()),
            servers: vec![ServerStatus { name: "m1".into(), state: ServerState::Master, tier: 0 }],
        };
        tx.send(Arc::new(updated)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().servers.len(), 1);
    }
}
