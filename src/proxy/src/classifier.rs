//! The query classifier collaborator interface (SPEC_FULL.md §6). The core
//! never inspects SQL syntax directly; it treats classification as a black
//! box produced by whatever implementation is plugged in. This module ships
//! one conservative built-in implementation, sufficient to drive this
//! crate's own tests and to serve as a default -- it is explicitly not a
//! full SQL parser.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetClass {
    MasterOnly,
    SlavePreferred,
    AllBackends,
    CurrentBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEffect {
    SessionWrite,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxClassEffect {
    Begin,
    Commit,
    Rollback,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub target: TargetClass,
    pub session_effect: SessionEffect,
    pub trx_effect: TrxClassEffect,
    pub autocommit_effect: Option<bool>,
    pub response_expected: bool,
    pub tables: Vec<String>,
    pub databases: Vec<String>,
}

/// `classify(bytes) -> {target_class, operation, tables, databases,
/// has_clause, canonical_form, affected_fields}` (§6). Implementations plug
/// in; this trait is the entire surface the router core depends on.
pub trait Classifier: Send + Sync {
    fn classify(&self, sql: &str) -> Classification;
}

/// Keyword/prefix-based classifier good enough to drive the router's own
/// test suite. Anything it cannot confidently classify is routed
/// conservatively to the master, per spec §4.F.1 ("the parser could not
/// classify -> MASTER").
pub struct ConservativeClassifier;

impl Classifier for ConservativeClassifier {
    fn classify(&self, sql: &str) -> Classification {
        let trimmed = sql.trim_start();
        let upper_prefix: String = trimmed
            .chars()
            .take(16)
            .collect::<String>()
            .to_ascii_uppercase();

        let is_session_write = upper_prefix.starts_with("SET")
            || upper_prefix.starts_with("USE ")
            || upper_prefix.starts_with("PREPARE");

        let (target, response_expected) = if upper_prefix.starts_with("SELECT")
            || upper_prefix.starts_with("SHOW")
            || upper_prefix.starts_with("EXPLAIN")
        {
            (TargetClass::SlavePreferred, true)
        } else if upper_prefix.starts_with("INSERT")
            || upper_prefix.starts_with("UPDATE")
            || upper_prefix.starts_with("DELETE")
            || upper_prefix.starts_with("REPLACE")
            || upper_prefix.starts_with("CREATE")
            || upper_prefix.starts_with("ALTER")
            || upper_prefix.starts_with("DROP")
        {
            (TargetClass::MasterOnly, true)
        } else if is_session_write {
            (TargetClass::AllBackends, true)
        } else {
            // Unclassifiable: conservative fallback.
            (TargetClass::MasterOnly, true)
        };

        let trx_effect = match crate::backend::trx_tracker::classify(sql) {
            crate::backend::trx_tracker::TrxEffect::Begin { .. } => TrxClassEffect::Begin,
            crate::backend::trx_tracker::TrxEffect::Commit => TrxClassEffect::Commit,
            crate::backend::trx_tracker::TrxEffect::Rollback => TrxClassEffect::Rollback,
            _ => TrxClassEffect::None,
        };

        let autocommit_effect = match crate::backend::trx_tracker::classify(sql) {
            crate::backend::trx_tracker::TrxEffect::EnableAutocommit => Some(true),
            crate::backend::trx_tracker::TrxEffect::DisableAutocommit => Some(false),
            _ => None,
        };

        Classification {
            target,
            session_effect: if is_session_write {
                SessionEffect::SessionWrite
            } else {
                SessionEffect::Normal
            },
            trx_effect,
            autocommit_effect,
            response_expected,
            tables: Vec::new(),
            databases: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_routes_to_slave_preferred() {
        let c = ConservativeClassifier.classify("SELECT * FROM t");
        assert_eq!(c.target, TargetClass::SlavePreferred);
    }

    #[test]
    fn insert_routes_to_master() {
        let c = ConservativeClassifier.classify("INSERT INTO t VALUES (1)");
        assert_eq!(c.target, TargetClass::MasterOnly);
    }

    #[test]
    fn set_is_a_session_write_to_all_backends() {
        let c = ConservativeClassifier.classify("SET SQL_MODE='ANSI'");
        assert_eq!(c.target, TargetClass::AllBackends);
        assert_eq!(c.session_effect, SessionEffect::SessionWrite);
    }

    #[test]
    fn unrecognized_statement_falls_back_to_master() {
        let c = ConservativeClassifier.classify("CALL some_proc()");
        assert_eq!(c.target, TargetClass::MasterOnly);
    }
}
