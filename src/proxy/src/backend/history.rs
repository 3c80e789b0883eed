//! Session-command history: the ordered log of statements that mutate
//! session state (SET, USE, PREPARE, autocommit toggles, ...), the accepted
//! outcome of each, and per-backend subscribers used to detect when a
//! backend's reply to a session command diverges from the canonical one.

use std::collections::VecDeque;
use thiserror::Error;

pub type SeqId = u64;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history exhausted: entry {0} is no longer available for replay")]
    Exhausted(SeqId),
}

/// The accepted result of a session command: either an OK or an ERR, stored
/// as the backend bytes so that equality is a straight byte comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome(pub Vec<u8>);

impl Outcome {
    pub fn ok(bytes: impl Into<Vec<u8>>) -> Self {
        Outcome(bytes.into())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    seq_id: SeqId,
    bytes: Vec<u8>,
}

/// A per-backend handle into a session's History, used to compare that
/// backend's replies to session commands against the canonical outcome.
///
/// The mismatch callback is invoked synchronously from `add_response` /
/// `check_early_responses`. It must not panic, must not try to remove its
/// own Subscriber, and should only set a deferred-close flag; the actual
/// teardown happens at the next event-loop boundary, driven by the router
/// session that owns both the History and the Subscriber.
pub struct Subscriber {
    position: SeqId,
    current_id: SeqId,
    pending: Vec<(SeqId, Outcome)>,
    waiting_for_canonical: bool,
    mismatch_cb: Box<dyn FnMut(SeqId) + Send>,
}

impl Subscriber {
    fn new(position: SeqId, mismatch_cb: Box<dyn FnMut(SeqId) + Send>) -> Self {
        Self {
            position,
            current_id: position,
            pending: Vec::new(),
            waiting_for_canonical: false,
            mismatch_cb,
        }
    }

    pub fn position(&self) -> SeqId {
        self.position
    }

    pub fn set_current_id(&mut self, id: SeqId) {
        self.current_id = id;
    }

    /// Record this subscriber's own outcome for `id`, comparing it against
    /// the canonical outcome if one is already known.
    pub fn add_response(&mut self, id: SeqId, ok: Outcome, canonical: Option<&Outcome>) {
        match canonical {
            Some(canon) => {
                if *canon != ok {
                    (self.mismatch_cb)(id);
                }
                self.advance(id);
            }
            None => {
                self.pending.push((id, ok));
                self.waiting_for_canonical = true;
            }
        }
    }

    /// Called by History::check_early_responses when the canonical outcome
    /// for `id` has just arrived. Drains any pending outcome this subscriber
    /// recorded early for the same id and compares it now.
    fn check_early(&mut self, id: SeqId, canon: &Outcome) {
        if let Some(pos) = self.pending.iter().position(|(pid, _)| *pid == id) {
            let (_, ok) = self.pending.remove(pos);
            if ok != *canon {
                (self.mismatch_cb)(id);
            }
            self.advance(id);
        }
        self.waiting_for_canonical = !self.pending.is_empty();
    }

    fn advance(&mut self, id: SeqId) {
        if id > self.position {
            self.position = id;
        }
    }

    /// The highest seq_id this subscriber still needs retained in history,
    /// used by `prune_responses` to compute the safe prune bound.
    fn needed_floor(&self) -> SeqId {
        self.position.max(self.current_id)
    }
}

pub struct History {
    max_history: usize,
    allow_pruning: bool,
    entries: VecDeque<Entry>,
    responses: Vec<(SeqId, Outcome)>,
    pruned: bool,
    next_seq: SeqId,
    subscriber_floors: Vec<SeqId>,
}

impl History {
    pub fn new(max_history: usize, allow_pruning: bool) -> Self {
        Self {
            max_history,
            allow_pruning,
            entries: VecDeque::new(),
            responses: Vec::new(),
            pruned: false,
            next_seq: 1,
            subscriber_floors: Vec::new(),
        }
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tail_seq_id(&self) -> SeqId {
        self.entries.back().map(|e| e.seq_id).unwrap_or(0)
    }

    /// Records a session-altering statement's bytes and assigns its seq_id,
    /// *before* any backend has replied. The router session calls this at
    /// dispatch time so it can register each backend's Subscriber at the
    /// right `current_id`; `record_outcome` is called later once the
    /// canonical reply arrives.
    pub fn begin_entry(&mut self, packet_bytes: &[u8]) -> SeqId {
        if self.allow_pruning {
            if let Some(pos) = self.entries.iter().position(|e| e.bytes == packet_bytes) {
                let dup = self.entries.remove(pos).unwrap();
                self.responses.retain(|(id, _)| *id != dup.seq_id);
            }
        }

        let seq_id = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(Entry {
            seq_id,
            bytes: packet_bytes.to_vec(),
        });

        if self.entries.len() > self.max_history {
            self.entries.pop_front();
            self.pruned = true;
        }

        seq_id
    }

    /// Populates `responses[seq_id]` with the first authoritative (canonical)
    /// outcome and re-runs pruning.
    pub fn record_outcome(&mut self, seq_id: SeqId, outcome: Outcome) {
        self.responses.push((seq_id, outcome));
        self.prune_responses();
    }

    /// Convenience for the common case where the outcome is already known
    /// at insertion time (used directly by tests and by non-fan-out paths).
    pub fn add(&mut self, packet_bytes: &[u8], outcome: Outcome) -> SeqId {
        let seq_id = self.begin_entry(packet_bytes);
        self.record_outcome(seq_id, outcome);
        seq_id
    }

    pub fn erase(&mut self, seq_id: SeqId) {
        self.entries.retain(|e| e.seq_id != seq_id);
        self.responses.retain(|(id, _)| *id != seq_id);
    }

    pub fn canonical_outcome(&self, seq_id: SeqId) -> Option<&Outcome> {
        self.responses
            .iter()
            .find(|(id, _)| *id == seq_id)
            .map(|(_, o)| o)
    }

    /// Register a subscriber's needed floor (position/current_id) so the
    /// pruning bound accounts for it. Callers update this whenever a
    /// Subscriber's position or current_id changes.
    pub fn register_subscriber_floor(&mut self, idx: usize, floor: SeqId) {
        if idx >= self.subscriber_floors.len() {
            self.subscriber_floors.resize(idx + 1, 0);
        }
        self.subscriber_floors[idx] = floor;
    }

    pub fn remove_subscriber_floor(&mut self, idx: usize) {
        if idx < self.subscriber_floors.len() {
            self.subscriber_floors.remove(idx);
        }
    }

    /// min_needed = min( tail.seq_id, min over subscribers of max(position, current_id) )
    fn prune_responses(&mut self) {
        let tail = self.tail_seq_id();
        let min_needed = self
            .subscriber_floors
            .iter()
            .copied()
            .fold(tail, |acc, floor| acc.min(floor));

        let live: std::collections::HashSet<SeqId> =
            self.entries.iter().map(|e| e.seq_id).collect();
        self.responses
            .retain(|(id, _)| *id >= min_needed || live.contains(id));
    }

    /// true iff history is empty, or (within limit and (not pruned, or
    /// pruning is allowed)).
    pub fn can_recover_state(&self) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.entries.len() <= self.max_history && (!self.pruned || self.allow_pruning)
    }

    pub fn entries_for_replay(&self) -> impl Iterator<Item = (SeqId, &[u8])> {
        self.entries.iter().map(|e| (e.seq_id, e.bytes.as_slice()))
    }

    /// Subscribe at the current tail. Returns the starting position to seed
    /// a new Subscriber with.
    pub fn subscribe_position(&self) -> SeqId {
        self.tail_seq_id()
    }

    /// Called by the router session after the canonical backend's reply to
    /// seq_id has been accepted and stored via `add`/known via
    /// `canonical_outcome`. Drives any subscriber that recorded its own
    /// outcome for `id` before the canonical one arrived.
    pub fn check_early_responses(
        &self,
        id: SeqId,
        canon: &Outcome,
        subscribers: &mut [&mut Subscriber],
    ) {
        for sub in subscribers.iter_mut() {
            if sub.waiting_for_canonical {
                sub.check_early(id, canon);
            }
        }
    }
}

impl Subscriber {
    pub fn new_at(position: SeqId, mismatch_cb: impl FnMut(SeqId) + Send + 'static) -> Self {
        Subscriber::new(position, Box::new(mismatch_cb))
    }

    pub fn needed(&self) -> SeqId {
        self.needed_floor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_assigns_monotonic_seq_ids() {
        let mut h = History::new(10, false);
        let a = h.add(b"SET a=1", Outcome::ok([0]));
        let b = h.add(b"SET b=1", Outcome::ok([0]));
        assert!(b > a);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn add_prunes_front_past_max_history() {
        let mut h = History::new(2, false);
        h.add(b"a", Outcome::ok([0]));
        h.add(b"b", Outcome::ok([0]));
        h.add(b"c", Outcome::ok([0]));
        assert_eq!(h.len(), 2);
        assert!(h.is_pruned());
    }

    #[test]
    fn duplicate_elimination_moves_entry_to_tail_and_keeps_len() {
        let mut h = History::new(10, true);
        h.add(b"SET x=1", Outcome::ok([0]));
        h.add(b"SET y=1", Outcome::ok([0]));
        let before = h.len();
        h.add(b"SET x=1", Outcome::ok([0]));
        assert_eq!(h.len(), before);
        assert!(!h.is_pruned());
    }

    #[test]
    fn can_recover_state_true_when_empty() {
        let h = History::new(4, false);
        assert!(h.can_recover_state());
    }

    #[test]
    fn can_recover_state_false_once_pruned_without_allow_pruning() {
        let mut h = History::new(1, false);
        h.add(b"a", Outcome::ok([0]));
        h.add(b"b", Outcome::ok([0]));
        assert!(h.is_pruned());
        assert!(!h.can_recover_state());
    }

    #[test]
    fn subscriber_immediate_mismatch_fires_callback() {
        let mismatches = std::cell::RefCell::new(Vec::new());
        let mut sub = Subscriber::new_at(0, |id| mismatches.borrow_mut().push(id));
        let canon = Outcome::ok([0]);
        let divergent = Outcome::ok([0xff]);
        sub.add_response(1, divergent, Some(&canon));
        assert_eq!(mismatches.into_inner(), vec![1]);
        assert_eq!(sub.position(), 1);
    }

    #[test]
    fn subscriber_early_response_defers_then_compares_on_canonical_arrival() {
        let mismatches = std::cell::RefCell::new(Vec::new());
        let mut sub = Subscriber::new_at(0, |id| mismatches.borrow_mut().push(id));
        sub.add_response(1, Outcome::ok([0]), None);
        assert!(sub.waiting_for_canonical);

        let canon = Outcome::ok([0xff]);
        sub.check_early(1, &canon);
        assert_eq!(mismatches.into_inner(), vec![1]);
        assert_eq!(sub.position(), 1);
        assert!(!sub.waiting_for_canonical);
    }

    #[test]
    fn subscriber_matching_early_response_does_not_fire() {
        let mismatches = std::cell::RefCell::new(Vec::new());
        let mut sub = Subscriber::new_at(0, |id| mismatches.borrow_mut().push(id));
        let canon = Outcome::ok([0]);
        sub.add_response(1, canon.clone(), None);
        sub.check_early(1, &canon);
        assert!(mismatches.into_inner().is_empty());
    }

    #[test]
    fn prune_responses_respects_subscriber_floor() {
        let mut h = History::new(100, false);
        let s1 = h.add(b"a", Outcome::ok([0]));
        let _s2 = h.add(b"b", Outcome::ok([0]));
        h.erase(s1);
        // a subscriber still needing s1 should keep its response alive
        h.register_subscriber_floor(0, s1);
        h.prune_responses();
        assert!(h.canonical_outcome(s1).is_some());
    }
}
