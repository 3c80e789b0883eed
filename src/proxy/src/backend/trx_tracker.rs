//! Transaction/autocommit state tracker (SPEC_FULL.md §4.E).
//!
//! Classifies each outbound statement by matching against a compiled set of
//! anchored, case-insensitive patterns, mirroring the pattern table of the
//! original implementation's boundary matcher. A cheap prefix test gates the
//! more specific patterns so ordinary SELECT/INSERT/UPDATE traffic never
//! pays for a full regex scan.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxEffect {
    Begin { read_only: Option<bool> },
    Commit,
    Rollback,
    EnableAutocommit,
    DisableAutocommit,
    None,
}

struct Patterns {
    prefix: Regex,
    begin: Regex,
    commit: Regex,
    rollback: Regex,
    start_trx_ro: Regex,
    start_trx_rw: Regex,
    start_trx: Regex,
    autocommit_on: Regex,
    autocommit_off: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        prefix: Regex::new(r"(?is)^\s*(BEGIN|COMMIT|ROLLBACK|START|SET)").unwrap(),
        begin: Regex::new(r"(?is)^\s*BEGIN(\s+WORK)?\s*;?\s*$").unwrap(),
        commit: Regex::new(r"(?is)^\s*COMMIT(\s+WORK)?\s*;?\s*$").unwrap(),
        rollback: Regex::new(r"(?is)^\s*ROLLBACK(\s+WORK)?\s*;?\s*$").unwrap(),
        start_trx_ro: Regex::new(r"(?is)^\s*START\s+TRANSACTION\s+READ\s+ONLY\s*;?\s*$").unwrap(),
        start_trx_rw: Regex::new(r"(?is)^\s*START\s+TRANSACTION\s+READ\s+WRITE\s*;?\s*$").unwrap(),
        start_trx: Regex::new(r"(?is)^\s*START\s+TRANSACTION(\s*;?\s*|(\s+.*))$").unwrap(),
        autocommit_on: Regex::new(r"(?is)^\s*SET\s+AUTOCOMMIT\s*=\s*(1|true)\s*;?\s*$").unwrap(),
        autocommit_off: Regex::new(r"(?is)^\s*SET\s+AUTOCOMMIT\s*=\s*(0|false)\s*;?\s*$").unwrap(),
    })
}

/// Classifies a single SQL text. Returns `TrxEffect::None` for anything that
/// doesn't touch transaction/autocommit state (the common case).
pub fn classify(sql: &str) -> TrxEffect {
    let p = patterns();
    if !p.prefix.is_match(sql) {
        return TrxEffect::None;
    }
    if p.begin.is_match(sql) {
        return TrxEffect::Begin { read_only: None };
    }
    if p.commit.is_match(sql) {
        return TrxEffect::Commit;
    }
    if p.rollback.is_match(sql) {
        return TrxEffect::Rollback;
    }
    if p.start_trx_ro.is_match(sql) {
        return TrxEffect::Begin {
            read_only: Some(true),
        };
    }
    if p.start_trx_rw.is_match(sql) {
        return TrxEffect::Begin {
            read_only: Some(false),
        };
    }
    if p.start_trx.is_match(sql) {
        return TrxEffect::Begin { read_only: None };
    }
    if p.autocommit_on.is_match(sql) {
        return TrxEffect::EnableAutocommit;
    }
    if p.autocommit_off.is_match(sql) {
        return TrxEffect::DisableAutocommit;
    }
    TrxEffect::None
}

/// Session-scoped transaction/autocommit state, updated by `apply` as
/// statements are classified.
#[derive(Debug, Clone, Copy)]
pub struct TrxTracker {
    in_trx: bool,
    read_only_trx: bool,
    autocommit: bool,
    trx_ending: bool,
}

impl Default for TrxTracker {
    fn default() -> Self {
        Self {
            in_trx: false,
            read_only_trx: false,
            autocommit: true,
            trx_ending: false,
        }
    }
}

impl TrxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, sql: &str) -> TrxEffect {
        let effect = classify(sql);
        self.trx_ending = false;
        match effect {
            TrxEffect::Begin { read_only } => {
                self.in_trx = true;
                self.read_only_trx = read_only.unwrap_or(false);
            }
            TrxEffect::Commit => {
                self.trx_ending = true;
                self.in_trx = false;
                self.read_only_trx = false;
            }
            TrxEffect::Rollback => {
                self.trx_ending = true;
                self.in_trx = false;
                self.read_only_trx = false;
            }
            TrxEffect::EnableAutocommit => {
                self.autocommit = true;
                self.trx_ending = true;
                self.in_trx = false;
            }
            TrxEffect::DisableAutocommit => {
                self.autocommit = false;
                self.in_trx = true;
            }
            TrxEffect::None => {}
        }
        effect
    }

    pub fn is_trx_active(&self) -> bool {
        self.in_trx
    }

    pub fn is_trx_starting(&self, effect: TrxEffect) -> bool {
        matches!(effect, TrxEffect::Begin { .. })
    }

    pub fn is_trx_ending(&self) -> bool {
        self.trx_ending
    }

    pub fn is_trx_read_only(&self) -> bool {
        self.read_only_trx
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_statements_are_none() {
        assert_eq!(classify("SELECT * FROM t"), TrxEffect::None);
        assert_eq!(classify("INSERT INTO t VALUES (1)"), TrxEffect::None);
    }

    #[test]
    fn begin_variants() {
        assert_eq!(classify("BEGIN"), TrxEffect::Begin { read_only: None });
        assert_eq!(
            classify("begin work;"),
            TrxEffect::Begin { read_only: None }
        );
        assert_eq!(
            classify("START TRANSACTION"),
            TrxEffect::Begin { read_only: None }
        );
        assert_eq!(
            classify("START TRANSACTION READ ONLY"),
            TrxEffect::Begin {
                read_only: Some(true)
            }
        );
        assert_eq!(
            classify("START TRANSACTION READ WRITE"),
            TrxEffect::Begin {
                read_only: Some(false)
            }
        );
    }

    #[test]
    fn commit_and_rollback() {
        assert_eq!(classify("COMMIT"), TrxEffect::Commit);
        assert_eq!(classify("ROLLBACK WORK"), TrxEffect::Rollback);
    }

    #[test]
    fn autocommit_toggles() {
        assert_eq!(classify("SET AUTOCOMMIT=0"), TrxEffect::DisableAutocommit);
        assert_eq!(
            classify("SET AUTOCOMMIT = false"),
            TrxEffect::DisableAutocommit
        );
        assert_eq!(classify("SET AUTOCOMMIT=1"), TrxEffect::EnableAutocommit);
    }

    #[test]
    fn tracker_disabling_autocommit_starts_implicit_transaction() {
        let mut t = TrxTracker::new();
        assert!(t.is_autocommit());
        t.apply("SET AUTOCOMMIT=0");
        assert!(!t.is_autocommit());
        assert!(t.is_trx_active());
    }

    #[test]
    fn tracker_commit_ends_transaction() {
        let mut t = TrxTracker::new();
        t.apply("BEGIN");
        assert!(t.is_trx_active());
        t.apply("COMMIT");
        assert!(!t.is_trx_active());
        assert!(t.is_trx_ending());
    }

    #[test]
    fn tracker_read_only_start_sets_flag() {
        let mut t = TrxTracker::new();
        t.apply("START TRANSACTION READ ONLY");
        assert!(t.is_trx_read_only());
    }
}
