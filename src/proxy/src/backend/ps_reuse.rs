//! Optional per-session prepared-statement reuse cache (SPEC_FULL.md §4.G).
//!
//! Grounded on the original implementation's `psreuse` filter: a
//! `SQL text -> {cached OK bytes, active flag, client id}` map that lets a
//! session re-prepare the same text without round-tripping to the backends,
//! and refuses to re-prepare a statement whose handle the client still
//! holds open.

use hashbrown::HashMap;

/// MariaDB ER_MAX_PREPARED_STMT_COUNT_REACHED, reused here (as the original
/// psreuse filter does) to report "already prepared" on double-prepare.
pub const ER_ALREADY_PREPARED: u16 = 1461;
pub const ER_ALREADY_PREPARED_STATE: &str = "HY000";
pub const ER_ALREADY_PREPARED_MSG: &str = "Cannot prepare the same statement multiple times";

struct CacheEntry {
    ok_bytes: Vec<u8>,
    client_id: u32,
    active: bool,
}

#[derive(Default)]
pub struct PsReuseCache {
    by_sql: HashMap<String, CacheEntry>,
    by_id: HashMap<u32, String>,
    hits: u64,
    misses: u64,
}

pub enum PrepareOutcome {
    /// No cached entry for this SQL text; caller should prepare normally
    /// and call `complete` once the backend OK arrives.
    Miss,
    /// The SQL text is cached and not currently active: short-circuit with
    /// the cached OK bytes and the already-assigned client id.
    Reuse { ok_bytes: Vec<u8>, client_id: u32 },
    /// The SQL text is cached and still active (handle not closed):
    /// short-circuit with an error, do not touch backends.
    AlreadyActive,
}

impl PsReuseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_prepare(&mut self, sql: &str) -> PrepareOutcome {
        match self.by_sql.get_mut(sql) {
            Some(entry) if entry.active => PrepareOutcome::AlreadyActive,
            Some(entry) => {
                entry.active = true;
                self.hits += 1;
                PrepareOutcome::Reuse {
                    ok_bytes: entry.ok_bytes.clone(),
                    client_id: entry.client_id,
                }
            }
            None => {
                self.misses += 1;
                PrepareOutcome::Miss
            }
        }
    }

    /// Called once the real prepare completed against the backends, to seed
    /// the cache for future reuse.
    pub fn complete(&mut self, sql: &str, client_id: u32, ok_bytes: Vec<u8>) {
        self.by_sql.insert(
            sql.to_string(),
            CacheEntry {
                ok_bytes,
                client_id,
                active: true,
            },
        );
        self.by_id.insert(client_id, sql.to_string());
    }

    /// On COM_STMT_CLOSE: the handle is released but the mapping is kept for
    /// future reuse.
    pub fn on_close(&mut self, client_id: u32) {
        if let Some(sql) = self.by_id.get(&client_id) {
            if let Some(entry) = self.by_sql.get_mut(sql) {
                entry.active = false;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_on_first_prepare() {
        let mut cache = PsReuseCache::new();
        assert!(matches!(cache.on_prepare("SELECT 1"), PrepareOutcome::Miss));
    }

    #[test]
    fn reprepare_while_active_is_refused() {
        let mut cache = PsReuseCache::new();
        cache.on_prepare("SELECT 1");
        cache.complete("SELECT 1", 1, vec![0x00]);
        assert!(matches!(
            cache.on_prepare("SELECT 1"),
            PrepareOutcome::AlreadyActive
        ));
    }

    #[test]
    fn reprepare_after_close_reuses_client_id() {
        let mut cache = PsReuseCache::new();
        cache.on_prepare("SELECT 1");
        cache.complete("SELECT 1", 1, vec![0x00]);
        cache.on_close(1);

        match cache.on_prepare("SELECT 1") {
            PrepareOutcome::Reuse { client_id, .. } => assert_eq!(client_id, 1),
            _ => panic!("expected reuse"),
        }
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }
}
