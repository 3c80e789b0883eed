//! `RouterSession`: the central state machine (SPEC_FULL.md §4.F). Combines
//! statement classification, target selection, session-command fan-out,
//! reply merging and transaction replay. Grounded on the teacher's own
//! session-loop shape (`server/haentgl_server.rs`, `server/cmd_handler.rs`)
//! and on the original implementation's session-level `routeQuery`
//! contract (`include/maxscale/router.hh`).

use crate::backend::connection::{BackendConnection, ErrorClass};
use crate::backend::error::RouterError;
use crate::backend::history::{History, Outcome, SeqId, Subscriber};
use crate::backend::ps_id_map::PsIdMap;
use crate::backend::ps_reuse::{PrepareOutcome, PsReuseCache};
use crate::backend::trx_tracker::TrxTracker;
use crate::classifier::{Classification, Classifier, SessionEffect, TargetClass};
use common::metrics::counter_inc;
use common::metrics::metric_def::{
    ROUTER_PS_REUSE_HIT, ROUTER_PS_REUSE_MISS, ROUTER_REPLAY_ATTEMPT, ROUTER_SESSION_CMD_MISMATCH,
};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Deferred-close flag set by a Subscriber's mismatch callback. Per
/// SPEC_FULL.md §9 "Subscriber callback hazard", the callback itself must
/// not tear anything down; it only marks intent, and the router session
/// acts on it at the next event-loop boundary (the top of `dispatch`).
#[derive(Default)]
struct MismatchFlags {
    inner: std::sync::Mutex<Vec<String>>,
}

impl MismatchFlags {
    fn mark(&self, backend: String) {
        self.inner.lock().unwrap().push(backend);
    }

    fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }
}

pub struct BackendSlot {
    pub conn: BackendConnection,
    pub subscriber: Subscriber,
    pub tier: u8,
    pub is_master: bool,
    pub quarantined: bool,
    /// Set by `request_drain` (§4.F.5): no new statements are dispatched
    /// here, but in-flight ones are left to finish until `finalize_drain`.
    pub draining: bool,
    /// Stable index into `History`'s `subscriber_floors`, assigned once at
    /// `add_backend` time and never reused, so pruning always accounts for
    /// this backend's Subscriber even after others are added.
    idx: usize,
}

pub struct RouterSessionConfig {
    pub max_history: usize,
    pub allow_pruning: bool,
    pub replay_retry_budget: u32,
    pub write_queue_bound: usize,
}

impl Default for RouterSessionConfig {
    fn default() -> Self {
        Self {
            max_history: 64,
            allow_pruning: true,
            replay_retry_budget: 5,
            write_queue_bound: 32,
        }
    }
}

/// What to do with a just-classified, just-framed client statement.
pub enum Dispatch {
    /// Route to exactly one backend (normal statement).
    Single { backend: String, rewritten: Vec<u8> },
    /// Route to every live, non-quarantined backend as a session command;
    /// the seq_id is what each Subscriber will be compared against.
    FanOut { seq_id: SeqId, targets: Vec<(String, Vec<u8>)> },
    /// A filter or the PS reuse cache produced the entire reply already.
    ShortCircuit(Vec<u8>),
}

pub struct RouterSession {
    config: RouterSessionConfig,
    classifier: Arc<dyn Classifier>,
    history: History,
    ps_ids: PsIdMap,
    ps_reuse: Option<PsReuseCache>,
    trx: TrxTracker,
    backends: HashMap<String, BackendSlot>,
    active_read_target: Option<String>,
    master: Option<String>,
    rr_cursor: AtomicUsize,
    replay_attempts: u32,
    mismatches: Arc<MismatchFlags>,
    non_deterministic_observed: bool,
    bytes_streamed_for_current_stmt: bool,
    next_backend_idx: usize,
    /// Raw bytes of every statement issued so far inside the currently open,
    /// non-read-only transaction (§4.F.4 step 3), separate from the
    /// session-command `History` -- these never go through fan-out, so
    /// `History` never sees them. Cleared once the transaction ends.
    trx_statements: Vec<Vec<u8>>,
}

const STMT_CLOSE: u8 = 0x19;
const STMT_PREPARE: u8 = 0x16;
const STMT_EXECUTE: u8 = 0x17;
const STMT_SEND_LONG_DATA: u8 = 0x18;
const STMT_RESET: u8 = 0x1a;
const STMT_FETCH: u8 = 0x1c;

/// Whether `command`'s payload carries a prepared-statement id at
/// `PS_ID_OFFSET` that needs rewriting to the target backend's own id.
/// Anything else (COM_QUERY text, COM_STMT_PREPARE, session commands, ...)
/// must pass through untouched -- rewriting blind would either corrupt the
/// first 4 bytes of a text statement or fail lookup and abort dispatch.
fn carries_ps_id(command: u8) -> bool {
    matches!(command, STMT_EXECUTE | STMT_SEND_LONG_DATA | STMT_RESET | STMT_FETCH)
}

impl RouterSession {
    pub fn new(classifier: Arc<dyn Classifier>, config: RouterSessionConfig, use_ps_reuse: bool) -> Self {
        let history = History::new(config.max_history, config.allow_pruning);
        Self {
            ps_ids: PsIdMap::new(),
            ps_reuse: use_ps_reuse.then(PsReuseCache::new),
            trx: TrxTracker::new(),
            backends: HashMap::new(),
            active_read_target: None,
            master: None,
            rr_cursor: AtomicUsize::new(0),
            replay_attempts: 0,
            mismatches: Arc::new(MismatchFlags::default()),
            non_deterministic_observed: false,
            bytes_streamed_for_current_stmt: false,
            next_backend_idx: 0,
            trx_statements: Vec::new(),
            classifier,
            history,
            config,
        }
    }

    pub fn add_backend(&mut self, name: impl Into<String>, tier: u8, is_master: bool) {
        let name = name.into();
        let position = self.history.subscribe_position();
        let mismatches = Arc::clone(&self.mismatches);
        let backend_for_cb = name.clone();
        let subscriber = Subscriber::new_at(position, move |_seq_id| {
            mismatches.mark(backend_for_cb.clone());
        });
        if is_master {
            let current_is_live = self
                .master
                .as_ref()
                .and_then(|m| self.backends.get(m))
                .map(|s| !s.quarantined)
                .unwrap_or(false);
            if !current_is_live {
                self.master = Some(name.clone());
            }
        } else if self.active_read_target.is_none() {
            self.active_read_target = Some(name.clone());
        }
        let idx = self.next_backend_idx;
        self.next_backend_idx += 1;
        self.history.register_subscriber_floor(idx, position);
        self.backends.insert(
            name.clone(),
            BackendSlot {
                conn: BackendConnection::new(name, self.config.write_queue_bound),
                subscriber,
                tier,
                is_master,
                quarantined: false,
                draining: false,
                idx,
            },
        );
    }

    /// §4.F.5: refuse new dispatch to `backend`. In-flight statements are
    /// left alone; the caller is responsible for the grace-period timer and
    /// for calling `finalize_drain` once it expires (or immediately, for the
    /// `switchover-force` variant).
    pub fn request_drain(&mut self, backend: &str) {
        if let Some(slot) = self.backends.get_mut(backend) {
            slot.draining = true;
        }
    }

    pub fn is_draining(&self, backend: &str) -> bool {
        self.backends.get(backend).map(|s| s.draining).unwrap_or(false)
    }

    /// Forces `backend` out of service now. Returns true if it was carrying
    /// an open write transaction, meaning the caller should run the §4.F.4
    /// replay path on an alternative backend to finish the session cleanly.
    pub fn finalize_drain(&mut self, backend: &str) -> bool {
        if let Some(slot) = self.backends.get_mut(backend) {
            slot.quarantined = true;
            slot.draining = false;
        }
        self.trx.is_trx_active() && !self.trx.is_trx_read_only()
    }

    fn live_backends(&self) -> Vec<&str> {
        self.backends
            .iter()
            .filter(|(_, slot)| !slot.quarantined && !slot.draining)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Drains any pending quarantine requests raised synchronously by
    /// Subscriber mismatch callbacks during the previous dispatch, and
    /// actually closes those backends now that we're at a safe boundary.
    pub fn apply_pending_quarantines(&mut self) -> Vec<String> {
        let to_close = self.mismatches.drain();
        for name in &to_close {
            if let Some(slot) = self.backends.get_mut(name) {
                slot.quarantined = true;
            }
            counter_inc(ROUTER_SESSION_CMD_MISMATCH, 1, None);
        }
        to_close
    }

    /// Picks a read target among live slaves using the lowest non-empty
    /// tier, then round-robins within that tier (Open Question decision #1
    /// in DESIGN.md: any stable tiebreaker is acceptable).
    fn pick_slave(&self) -> Option<String> {
        let mut candidates: Vec<&BackendSlot> = self
            .backends
            .values()
            .filter(|s| !s.quarantined && !s.draining && !s.is_master)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|s| s.tier);
        let lowest_tier = candidates[0].tier;
        let tier_candidates: Vec<&BackendSlot> =
            candidates.into_iter().filter(|s| s.tier == lowest_tier).collect();
        let idx = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % tier_candidates.len();
        Some(tier_candidates[idx].conn.name.clone())
    }

    fn master_name(&self) -> Option<String> {
        self.master.clone().filter(|m| {
            self.backends
                .get(m)
                .map(|s| !s.quarantined && !s.draining)
                .unwrap_or(false)
        })
    }

    /// Parses a `-- maxscale route to {master|slave|server <name>}` hint
    /// trailing comment, if present.
    fn routing_hint(sql: &str) -> Option<TargetClass> {
        let lower = sql.to_ascii_lowercase();
        let marker = "-- maxscale route to ";
        let idx = lower.find(marker)?;
        let rest = lower[idx + marker.len()..].trim();
        if rest.starts_with("master") {
            Some(TargetClass::MasterOnly)
        } else if rest.starts_with("slave") {
            Some(TargetClass::SlavePreferred)
        } else if rest.starts_with("server") {
            Some(TargetClass::CurrentBackend)
        } else {
            None
        }
    }

    /// Target selection (§4.F.1 step 3).
    fn select_target(&self, sql: &str, classification: &Classification) -> TargetClass {
        if self.trx.is_trx_active() && !self.trx.is_trx_read_only() {
            return TargetClass::MasterOnly;
        }
        if classification.session_effect == SessionEffect::SessionWrite {
            return TargetClass::AllBackends;
        }
        if let Some(hint) = Self::routing_hint(sql) {
            return hint;
        }
        classification.target
    }

    /// Dispatches one client statement. `raw_packet` is the full Packet
    /// payload bytes (command byte first); `sql` is the decoded SQL text
    /// when the command carries one (COM_QUERY, COM_STMT_PREPARE).
    pub fn dispatch(&mut self, raw_packet: &[u8], sql: Option<&str>) -> Result<Dispatch, RouterError> {
        self.apply_pending_quarantines();

        if raw_packet.is_empty() {
            return Err(RouterError::ClassifierUnknown);
        }
        let command = raw_packet[0];

        if command == STMT_PREPARE {
            if let (Some(text), Some(cache)) = (sql, self.ps_reuse.as_mut()) {
                match cache.on_prepare(text) {
                    PrepareOutcome::AlreadyActive => {
                        counter_inc(ROUTER_PS_REUSE_HIT, 1, None);
                        return Ok(Dispatch::ShortCircuit(make_error_packet(
                            crate::backend::ps_reuse::ER_ALREADY_PREPARED,
                            crate::backend::ps_reuse::ER_ALREADY_PREPARED_STATE,
                            crate::backend::ps_reuse::ER_ALREADY_PREPARED_MSG,
                        )));
                    }
                    PrepareOutcome::Reuse { ok_bytes, .. } => {
                        counter_inc(ROUTER_PS_REUSE_HIT, 1, None);
                        return Ok(Dispatch::ShortCircuit(ok_bytes));
                    }
                    PrepareOutcome::Miss => {
                        counter_inc(ROUTER_PS_REUSE_MISS, 1, None);
                    }
                }
            }
        }

        if command == STMT_CLOSE {
            if raw_packet.len() >= 5 {
                let mut idbytes = [0u8; 4];
                idbytes.copy_from_slice(&raw_packet[1..5]);
                let client_id = u32::from_le_bytes(idbytes);
                self.ps_ids.forget(client_id);
                if let Some(cache) = self.ps_reuse.as_mut() {
                    cache.on_close(client_id);
                }
            }
        }

        let classification = sql
            .map(|s| self.classifier.classify(s))
            .unwrap_or_else(|| self.classifier.classify(""));

        if let Some(text) = sql {
            self.trx.apply(text);
        }

        let target = self.select_target(sql.unwrap_or(""), &classification);

        // §4.F.4 step 3: the open transaction's own statements are replayed
        // on a replacement master independently of the session-command
        // History, since they never fan out. Capture them here, in the
        // master-bound path that carries every statement of an open,
        // non-read-only transaction (including the BEGIN itself).
        if target == TargetClass::MasterOnly && self.trx.is_trx_active() {
            self.trx_statements.push(raw_packet.to_vec());
        }
        if self.trx.is_trx_ending() {
            self.trx_statements.clear();
        }

        match target {
            TargetClass::AllBackends => {
                let seq_id = self.history.begin_entry(raw_packet);
                let mut targets = Vec::new();
                for name in self.live_backends() {
                    let name = name.to_string();
                    let mut pkt = raw_packet.to_vec();
                    if carries_ps_id(command) {
                        let _ = self.ps_ids.rewrite(&name, &mut pkt);
                    }
                    if let Some(slot) = self.backends.get_mut(&name) {
                        slot.subscriber.set_current_id(seq_id);
                        self.history.register_subscriber_floor(slot.idx, slot.subscriber.needed());
                    }
                    targets.push((name, pkt));
                }
                Ok(Dispatch::FanOut { seq_id, targets })
            }
            TargetClass::MasterOnly => {
                let backend = self
                    .master_name()
                    .ok_or(RouterError::ClassifierUnknown)?;
                let mut pkt = raw_packet.to_vec();
                if carries_ps_id(command) {
                    self.ps_ids.rewrite(&backend, &mut pkt)?;
                }
                Ok(Dispatch::Single { backend, rewritten: pkt })
            }
            TargetClass::SlavePreferred => {
                let backend = self.pick_slave().or_else(|| self.master_name()).ok_or(
                    RouterError::ClassifierUnknown,
                )?;
                let mut pkt = raw_packet.to_vec();
                if carries_ps_id(command) {
                    self.ps_ids.rewrite(&backend, &mut pkt)?;
                }
                Ok(Dispatch::Single { backend, rewritten: pkt })
            }
            TargetClass::CurrentBackend => {
                let backend = self
                    .active_read_target
                    .clone()
                    .or_else(|| self.master_name())
                    .ok_or(RouterError::ClassifierUnknown)?;
                let mut pkt = raw_packet.to_vec();
                if carries_ps_id(command) {
                    self.ps_ids.rewrite(&backend, &mut pkt)?;
                }
                Ok(Dispatch::Single { backend, rewritten: pkt })
            }
        }
    }

    /// §4.F.3 session command consistency: records the canonical outcome for
    /// `seq_id` (first reply from the canonical backend) and compares every
    /// other backend's outcome against it, driving deferred comparisons for
    /// backends that already answered early.
    pub fn on_fanout_canonical_reply(&mut self, seq_id: SeqId, outcome: Outcome) {
        self.history.record_outcome(seq_id, outcome.clone());
        let mut subs: Vec<&mut Subscriber> =
            self.backends.values_mut().map(|s| &mut s.subscriber).collect();
        self.history.check_early_responses(seq_id, &outcome, &mut subs);
        for slot in self.backends.values() {
            self.history.register_subscriber_floor(slot.idx, slot.subscriber.needed());
        }
    }

    /// A non-canonical backend's reply to a fan-out statement, recorded via
    /// its Subscriber. If the canonical outcome is already known this
    /// compares immediately; otherwise it is deferred.
    pub fn on_fanout_backend_reply(&mut self, backend: &str, seq_id: SeqId, outcome: Outcome) {
        let canon = self.history.canonical_outcome(seq_id).cloned();
        if let Some(slot) = self.backends.get_mut(backend) {
            slot.subscriber.add_response(seq_id, outcome, canon.as_ref());
            self.history.register_subscriber_floor(slot.idx, slot.subscriber.needed());
        }
    }

    pub fn record_backend_prepared(&mut self, backend: &str, client_id: u32, backend_id: u32) {
        self.ps_ids.record_backend_id(backend, client_id, backend_id);
    }

    pub fn assign_prepare_id(&mut self, prepare_packet: &[u8]) -> u32 {
        self.ps_ids.assign_client_id(prepare_packet)
    }

    pub fn complete_ps_reuse(&mut self, sql: &str, client_id: u32, ok_bytes: Vec<u8>) {
        if let Some(cache) = self.ps_reuse.as_mut() {
            cache.complete(sql, client_id, ok_bytes);
        }
    }

    pub fn can_recover_state(&self) -> bool {
        self.history.can_recover_state()
    }

    pub fn backend_error_class(&self, backend: &str) -> Option<ErrorClass> {
        self.backends.get(backend).and_then(|s| s.conn.error_class())
    }

    /// §4.F.4 preconditions for attempting replay on a failed backend.
    pub fn may_replay(&self, failed_backend: &str) -> bool {
        if !self.can_recover_state() {
            return false;
        }
        if self.replay_attempts >= self.config.replay_retry_budget {
            return false;
        }
        if self.non_deterministic_observed && self.bytes_streamed_for_current_stmt {
            return false;
        }
        match self.backend_error_class(failed_backend) {
            Some(ErrorClass::TransientRollback) => self.trx.is_trx_active(),
            Some(ErrorClass::WsrepNotReady) | Some(ErrorClass::ShutdownLike) => true,
            _ => false,
        }
    }

    pub fn mark_non_deterministic_observed(&mut self) {
        self.non_deterministic_observed = true;
    }

    pub fn mark_bytes_streamed(&mut self) {
        self.bytes_streamed_for_current_stmt = true;
    }

    pub fn reset_replay_markers_for_new_statement(&mut self) {
        self.non_deterministic_observed = false;
        self.bytes_streamed_for_current_stmt = false;
    }

    /// §4.F.4 steps 1-3: pick a replacement, then return the recorded
    /// session commands (ordered (seq_id, bytes, expected outcome) triples
    /// to re-issue and verify) followed by the open transaction's own
    /// statement bytes (step 3 -- re-issued on the replacement in order,
    /// with no canonical outcome to compare since they were never fanned
    /// out). The caller re-executes the triggering statement itself last.
    pub fn replay_plan(
        &mut self,
        failed_backend: &str,
    ) -> Result<(String, Vec<(SeqId, Vec<u8>, Outcome)>, Vec<Vec<u8>>), RouterError> {
        if let Some(slot) = self.backends.get_mut(failed_backend) {
            slot.quarantined = true;
        }
        let tier = self.backends.get(failed_backend).map(|s| s.tier).unwrap_or(0);
        let is_master = self.backends.get(failed_backend).map(|s| s.is_master).unwrap_or(false);

        let replacement = self
            .backends
            .iter()
            .find(|(name, s)| {
                name.as_str() != failed_backend && !s.quarantined && s.tier == tier && s.is_master == is_master
            })
            .map(|(name, _)| name.clone())
            .ok_or(RouterError::ShutdownLike {
                backend: failed_backend.to_string(),
                reason: "no replacement backend available in the same tier".into(),
            })?;

        self.replay_attempts += 1;
        counter_inc(ROUTER_REPLAY_ATTEMPT, 1, None);
        if is_master {
            self.master = Some(replacement.clone());
        } else {
            self.active_read_target = Some(replacement.clone());
        }

        let mut plan = Vec::new();
        for (seq_id, bytes) in self.history.entries_for_replay() {
            if let Some(outcome) = self.history.canonical_outcome(seq_id) {
                plan.push((seq_id, bytes.to_vec(), outcome.clone()));
            }
        }
        Ok((replacement, plan, self.trx_statements.clone()))
    }
}

fn make_error_packet(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + sql_state.len() + message.len());
    buf.push(0xff);
    buf.extend_from_slice(&code.to_le_bytes());
    buf.push(b'#');
    buf.extend_from_slice(sql_state.as_bytes());
    buf.extend_from_slice(message.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ConservativeClassifier;

    fn session() -> RouterSession {
        let mut s = RouterSession::new(Arc::new(ConservativeClassifier), RouterSessionConfig::default(), false);
        s.add_backend("master", 0, true);
        s.add_backend("slave1", 0, false);
        s.add_backend("slave2", 0, false);
        s
    }

    fn query_packet(sql: &str) -> Vec<u8> {
        let mut p = vec![0x03u8];
        p.extend_from_slice(sql.as_bytes());
        p
    }

    #[test]
    fn select_dispatches_to_a_single_slave() {
        let mut s = session();
        let pkt = query_packet("SELECT 1");
        match s.dispatch(&pkt, Some("SELECT 1")).unwrap() {
            Dispatch::Single { backend, .. } => assert!(backend.starts_with("slave")),
            _ => panic!("expected single dispatch"),
        }
    }

    #[test]
    fn insert_dispatches_to_master() {
        let mut s = session();
        let pkt = query_packet("INSERT INTO t VALUES (1)");
        match s.dispatch(&pkt, Some("INSERT INTO t VALUES (1)")).unwrap() {
            Dispatch::Single { backend, .. } => assert_eq!(backend, "master"),
            _ => panic!("expected single dispatch"),
        }
    }

    #[test]
    fn set_session_command_fans_out_to_all_live_backends() {
        let mut s = session();
        let pkt = query_packet("SET SQL_MODE='ANSI'");
        match s.dispatch(&pkt, Some("SET SQL_MODE='ANSI'")).unwrap() {
            Dispatch::FanOut { targets, .. } => assert_eq!(targets.len(), 3),
            _ => panic!("expected fan-out"),
        }
    }

    #[test]
    fn active_transaction_forces_master_even_for_select() {
        let mut s = session();
        s.dispatch(&query_packet("BEGIN"), Some("BEGIN")).unwrap();
        match s.dispatch(&query_packet("SELECT 1"), Some("SELECT 1")).unwrap() {
            Dispatch::Single { backend, .. } => assert_eq!(backend, "master"),
            _ => panic!("expected single dispatch"),
        }
    }

    #[test]
    fn scenario_fast_mismatch_client_sees_canonical_and_slave_is_quarantined() {
        let mut s = session();
        let pkt = query_packet("SET SQL_MODE='ANSI'");
        let seq_id = match s.dispatch(&pkt, Some("SET SQL_MODE='ANSI'")).unwrap() {
            Dispatch::FanOut { seq_id, .. } => seq_id,
            _ => panic!("expected fan-out"),
        };

        // master (canonical) replies OK first.
        s.on_fanout_canonical_reply(seq_id, Outcome::ok([0x00]));
        // slave1 agrees.
        s.on_fanout_backend_reply("slave1", seq_id, Outcome::ok([0x00]));
        // slave2 disagrees (ERR).
        s.on_fanout_backend_reply("slave2", seq_id, Outcome::ok([0xff]));

        let closed = s.apply_pending_quarantines();
        assert_eq!(closed, vec!["slave2".to_string()]);
        assert!(s.backends["slave2"].quarantined);
        assert!(!s.backends["slave1"].quarantined);
    }

    #[test]
    fn scenario_slow_canonical_early_divergent_fires_exactly_once() {
        let mut s = session();
        let pkt = query_packet("SET SQL_MODE='ANSI'");
        let seq_id = match s.dispatch(&pkt, Some("SET SQL_MODE='ANSI'")).unwrap() {
            Dispatch::FanOut { seq_id, .. } => seq_id,
            _ => panic!("expected fan-out"),
        };

        // slave replies OK before master (canonical) has replied.
        s.on_fanout_backend_reply("slave1", seq_id, Outcome::ok([0x00]));
        // master now replies ERR -- the canonical outcome.
        s.on_fanout_canonical_reply(seq_id, Outcome::ok([0xff]));

        let closed = s.apply_pending_quarantines();
        assert_eq!(closed, vec!["slave1".to_string()]);
        assert_eq!(s.mismatches.drain().len(), 0, "callback must fire exactly once");
    }

    #[test]
    fn replay_plan_picks_same_tier_replacement_master() {
        let mut s = session();
        s.dispatch(&query_packet("BEGIN"), Some("BEGIN")).unwrap();
        s.dispatch(&query_packet("INSERT INTO t VALUES (1)"), Some("INSERT INTO t VALUES (1)"))
            .unwrap();

        // only master exists at tier 0 with is_master=true; add a second one.
        s.add_backend("master2", 0, true);
        let (replacement, _plan, trx_replay) = s.replay_plan("master").unwrap();
        assert_eq!(replacement, "master2");
        assert!(s.backends["master"].quarantined);
        assert_eq!(
            trx_replay,
            vec![query_packet("BEGIN"), query_packet("INSERT INTO t VALUES (1)")],
            "the open transaction's own BEGIN and INSERT must be replayed exactly once"
        );
    }

    #[test]
    fn trx_statements_cleared_once_transaction_commits() {
        let mut s = session();
        s.dispatch(&query_packet("BEGIN"), Some("BEGIN")).unwrap();
        s.dispatch(&query_packet("INSERT INTO t VALUES (1)"), Some("INSERT INTO t VALUES (1)"))
            .unwrap();
        s.dispatch(&query_packet("COMMIT"), Some("COMMIT")).unwrap();

        s.add_backend("master2", 0, true);
        let (_replacement, _plan, trx_replay) = s.replay_plan("master").unwrap();
        assert!(trx_replay.is_empty(), "a committed transaction leaves nothing to replay");
    }

    #[test]
    fn ordinary_query_dispatch_does_not_require_a_ps_mapping() {
        // A plain SELECT/INSERT packet's bytes[1..5] are never a prepared
        // statement id; dispatch must not try to rewrite them.
        let mut s = session();
        let pkt = query_packet("SELECT 1");
        assert!(s.dispatch(&pkt, Some("SELECT 1")).is_ok());
    }

    #[test]
    fn stmt_execute_without_a_recorded_backend_mapping_is_rejected() {
        let mut s = session();
        let client_id = s.assign_prepare_id(b"PREPARE stmt FROM 'SELECT ?'");
        let mut exec_pkt = vec![STMT_EXECUTE];
        exec_pkt.extend_from_slice(&client_id.to_le_bytes());
        exec_pkt.extend_from_slice(&[0u8; 4]);
        // no record_backend_prepared call yet: must fail, not silently pass
        // the client-facing id straight through to the backend.
        assert!(s.dispatch(&exec_pkt, None).is_err());
    }

    #[test]
    fn stmt_execute_with_recorded_mapping_is_rewritten_to_backend_id() {
        let mut s = session();
        let client_id = s.assign_prepare_id(b"PREPARE stmt FROM 'SELECT ?'");
        // STMT_EXECUTE with no SQL text classifies as unclassifiable ->
        // conservative MasterOnly fallback, so the mapping must exist for
        // "master".
        s.record_backend_prepared("master", client_id, 42);
        let mut exec_pkt = vec![STMT_EXECUTE];
        exec_pkt.extend_from_slice(&client_id.to_le_bytes());
        exec_pkt.extend_from_slice(&[0u8; 4]);
        match s.dispatch(&exec_pkt, None).unwrap() {
            Dispatch::Single { rewritten, .. } => {
                assert_eq!(&rewritten[1..5], &42u32.to_le_bytes());
            }
            _ => panic!("expected single dispatch"),
        }
    }

    #[test]
    fn replay_refused_when_retry_budget_exhausted() {
        let mut s = session();
        s.add_backend("master2", 0, true);
        let mut cfg_used = RouterSessionConfig::default();
        cfg_used.replay_retry_budget = 0;
        s.config = cfg_used;
        assert!(!s.may_replay("master"));
    }

    #[test]
    fn ps_reuse_short_circuits_second_prepare_while_active() {
        let mut s = RouterSession::new(Arc::new(ConservativeClassifier), RouterSessionConfig::default(), true);
        s.add_backend("master", 0, true);

        let mut prepare_pkt = vec![STMT_PREPARE];
        prepare_pkt.extend_from_slice(b"SELECT 1");
        // first prepare: miss, goes to master normally.
        s.dispatch(&prepare_pkt, Some("SELECT 1")).unwrap();
        s.complete_ps_reuse("SELECT 1", 1, vec![0x00]);

        match s.dispatch(&prepare_pkt, Some("SELECT 1")).unwrap() {
            Dispatch::ShortCircuit(bytes) => assert_eq!(bytes[0], 0xff),
            _ => panic!("expected short-circuit error"),
        }
    }

    #[test]
    fn draining_backend_is_excluded_from_new_dispatch_but_not_quarantined_yet() {
        let mut s = session();
        s.request_drain("slave1");
        assert!(s.is_draining("slave1"));

        for _ in 0..4 {
            match s.dispatch(&query_packet("SELECT 1"), Some("SELECT 1")).unwrap() {
                Dispatch::Single { backend, .. } => assert_ne!(backend, "slave1"),
                _ => panic!("expected single dispatch"),
            }
        }
    }

    #[test]
    fn finalize_drain_during_open_write_transaction_signals_replay_needed() {
        let mut s = session();
        s.dispatch(&query_packet("BEGIN"), Some("BEGIN")).unwrap();
        s.request_drain("master");
        let needs_replay = s.finalize_drain("master");
        assert!(needs_replay);
        assert!(s.backends["master"].quarantined);
    }
}
