//! Client-facing prepared statement ID assignment and per-backend ID
//! rewriting (SPEC_FULL.md §4.B).
//!
//! The client only ever sees MaxScale's own monotonically increasing IDs;
//! each backend assigns its own ID when its COM_STMT_PREPARE completes.
//! Outgoing STMT_* packets are rewritten in place so the backend sees its
//! own ID.

use hashbrown::HashMap;
use thiserror::Error;

/// Offset of the 4-byte statement ID within a `Packet`'s payload bytes (the
/// in-memory representation has no wire header, so this sits right after
/// the 1-byte command code — wire offset [5..9) minus the 4-byte header).
pub const PS_ID_OFFSET: usize = 1;

/// Sentinel the client may send meaning "execute the most recently prepared
/// statement", used by some connectors instead of an explicit ID.
pub const DIRECT_EXEC_SENTINEL: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PsIdError {
    #[error("no backend mapping recorded for client statement id {0}")]
    MissingMapping(u32),
    #[error("packet too short to carry a statement id")]
    PacketTooShort,
}

#[derive(Debug, Default)]
struct PreparedStatement {
    /// Original COM_STMT_PREPARE bytes, kept for transaction replay.
    prepare_bytes: Vec<u8>,
    backend_ids: HashMap<String, u32>,
}

pub struct PsIdMap {
    next_client_id: u32,
    last_assigned: u32,
    statements: HashMap<u32, PreparedStatement>,
}

impl Default for PsIdMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PsIdMap {
    pub fn new() -> Self {
        Self {
            next_client_id: 1,
            last_assigned: 0,
            statements: HashMap::new(),
        }
    }

    /// Allocates a monotonically increasing non-zero client-facing id for a
    /// new prepare and records the original bytes for replay.
    pub fn assign_client_id(&mut self, prepare_packet: &[u8]) -> u32 {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.last_assigned = id;
        self.statements.insert(
            id,
            PreparedStatement {
                prepare_bytes: prepare_packet.to_vec(),
                backend_ids: HashMap::new(),
            },
        );
        id
    }

    pub fn record_backend_id(&mut self, backend: &str, client_id: u32, backend_id: u32) {
        if let Some(stmt) = self.statements.get_mut(&client_id) {
            stmt.backend_ids.insert(backend.to_string(), backend_id);
        }
    }

    pub fn lookup(&self, backend: &str, client_id: u32) -> Option<u32> {
        self.statements
            .get(&client_id)
            .and_then(|s| s.backend_ids.get(backend))
            .copied()
    }

    pub fn prepare_bytes(&self, client_id: u32) -> Option<&[u8]> {
        self.statements.get(&client_id).map(|s| s.prepare_bytes.as_slice())
    }

    /// Rewrites bytes [PS_ID_OFFSET..PS_ID_OFFSET+4) of `packet` in place so
    /// the backend sees its own id instead of the client-facing one. If the
    /// packet carries the direct-execute sentinel, it is first replaced with
    /// the most recently assigned client id.
    pub fn rewrite(&self, backend: &str, packet: &mut [u8]) -> Result<(), PsIdError> {
        if packet.len() < PS_ID_OFFSET + 4 {
            return Err(PsIdError::PacketTooShort);
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&packet[PS_ID_OFFSET..PS_ID_OFFSET + 4]);
        let mut client_id = u32::from_le_bytes(raw);

        if client_id == DIRECT_EXEC_SENTINEL {
            client_id = self.last_assigned;
        }

        let backend_id = self
            .lookup(backend, client_id)
            .ok_or(PsIdError::MissingMapping(client_id))?;

        packet[PS_ID_OFFSET..PS_ID_OFFSET + 4].copy_from_slice(&backend_id.to_le_bytes());
        Ok(())
    }

    pub fn forget(&mut self, client_id: u32) {
        self.statements.remove(&client_id);
    }

    pub fn last_assigned(&self) -> u32 {
        self.last_assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt_execute_packet(client_id: u32) -> Vec<u8> {
        let mut p = vec![0x17u8]; // COM_STMT_EXECUTE
        p.extend_from_slice(&client_id.to_le_bytes());
        p.extend_from_slice(&[0u8; 4]); // trailing bytes (flags, iteration count)
        p
    }

    #[test]
    fn assign_is_monotonic_and_nonzero() {
        let mut map = PsIdMap::new();
        let a = map.assign_client_id(b"PREPARE stmt FROM 'SELECT ?'");
        let b = map.assign_client_id(b"PREPARE stmt2 FROM 'SELECT ?'");
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn rewrite_substitutes_backend_specific_id() {
        let mut map = PsIdMap::new();
        let client_id = map.assign_client_id(b"PREPARE s FROM 'SELECT ?'");
        map.record_backend_id("master", client_id, 7);
        map.record_backend_id("slave1", client_id, 19);

        let mut pkt = stmt_execute_packet(client_id);
        map.rewrite("master", &mut pkt).unwrap();
        assert_eq!(&pkt[PS_ID_OFFSET..PS_ID_OFFSET + 4], &7u32.to_le_bytes());

        let mut pkt2 = stmt_execute_packet(client_id);
        map.rewrite("slave1", &mut pkt2).unwrap();
        assert_eq!(&pkt2[PS_ID_OFFSET..PS_ID_OFFSET + 4], &19u32.to_le_bytes());
    }

    #[test]
    fn rewrite_missing_mapping_is_fatal_for_that_backend() {
        let map = PsIdMap::new();
        let mut pkt = stmt_execute_packet(42);
        let err = map.rewrite("master", &mut pkt).unwrap_err();
        assert_eq!(err, PsIdError::MissingMapping(42));
    }

    #[test]
    fn direct_exec_sentinel_resolves_to_last_assigned() {
        let mut map = PsIdMap::new();
        let client_id = map.assign_client_id(b"PREPARE s FROM 'SELECT ?'");
        map.record_backend_id("master", client_id, 7);

        let mut pkt = stmt_execute_packet(DIRECT_EXEC_SENTINEL);
        map.rewrite("master", &mut pkt).unwrap();
        assert_eq!(&pkt[PS_ID_OFFSET..PS_ID_OFFSET + 4], &7u32.to_le_bytes());
    }

    #[test]
    fn forget_removes_mapping() {
        let mut map = PsIdMap::new();
        let client_id = map.assign_client_id(b"PREPARE s FROM 'SELECT ?'");
        map.record_backend_id("master", client_id, 7);
        map.forget(client_id);
        assert!(map.lookup("master", client_id).is_none());
    }
}
