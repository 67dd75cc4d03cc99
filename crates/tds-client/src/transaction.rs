//! Transaction bookkeeping.
//!
//! From TDS 7.2 the server hands out transaction descriptors through
//! ENVCHANGE tokens and every request carries the innermost one. Older
//! servers get plain `BEGIN TRAN` batches, and nesting is tracked with a
//! depth counter and the savepoint names instead.

use tds_protocol::{IsolationLevel, TransactionRequest};

/// Descriptor stack plus the legacy nesting depth and savepoints.
///
/// The stack always holds the all-zero root descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransactionLedger {
    descriptors: Vec<u64>,
    depth: u32,
    savepoints: Vec<String>,
    in_transaction: bool,
}

impl TransactionLedger {
    pub(crate) fn new() -> Self {
        Self {
            descriptors: vec![0],
            depth: 0,
            savepoints: Vec::new(),
            in_transaction: false,
        }
    }

    /// Descriptor to put in ALL_HEADERS.
    pub(crate) fn current(&self) -> u64 {
        self.descriptors.last().copied().unwrap_or(0)
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Open transactions: the legacy depth, or descriptors above the root.
    pub(crate) fn depth(&self) -> u32 {
        let nested = u32::try_from(self.descriptors.len().saturating_sub(1)).unwrap_or(u32::MAX);
        self.depth.max(nested)
    }

    /// BeginTransaction ENVCHANGE.
    pub(crate) fn begin(&mut self, descriptor: u64) {
        self.descriptors.push(descriptor);
        self.in_transaction = true;
    }

    /// Commit, rollback or server-ended transaction ENVCHANGE.
    pub(crate) fn end(&mut self) {
        self.descriptors.truncate(1);
        self.clear_legacy();
    }

    /// Apply a legacy transaction batch that succeeded.
    pub(crate) fn apply_legacy(&mut self, change: DepthChange) {
        match change {
            DepthChange::Increment => {
                self.depth += 1;
                self.in_transaction = true;
            }
            DepthChange::Decrement => {
                self.depth = self.depth.saturating_sub(1);
                if self.depth == 0 {
                    self.clear_legacy();
                }
            }
            DepthChange::Save(name) => {
                if self.in_transaction {
                    self.savepoints.push(name);
                }
            }
            DepthChange::Rollback(name) => {
                // A savepoint keeps the transaction open; any other name
                // undoes every nesting level.
                match self.savepoints.iter().rposition(|s| *s == name) {
                    Some(at) => self.savepoints.truncate(at + 1),
                    None => self.clear_legacy(),
                }
            }
            DepthChange::Clear => self.clear_legacy(),
            DepthChange::None => {}
        }
    }

    fn clear_legacy(&mut self) {
        self.depth = 0;
        self.savepoints.clear();
        self.in_transaction = false;
    }

    /// Session reset or new physical connection.
    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Effect of a legacy transaction batch on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DepthChange {
    Increment,
    Decrement,
    /// `SAVE TRAN name`.
    Save(String),
    /// `ROLLBACK TRAN name`: to a savepoint if the ledger knows one by that
    /// name, otherwise the whole transaction.
    Rollback(String),
    /// `ROLLBACK TRAN` without a name.
    Clear,
    None,
}

/// The SQL batch standing in for a transaction manager request on servers
/// older than TDS 7.2.
pub(crate) fn legacy_sql(request: &TransactionRequest) -> (String, DepthChange) {
    match request {
        TransactionRequest::Begin { isolation, name } => {
            let level = match isolation {
                IsolationLevel::NoChange => String::new(),
                other => format!("SET TRANSACTION ISOLATION LEVEL {};", other.as_sql()),
            };
            (format!("{level}BEGIN TRAN {name}"), DepthChange::Increment)
        }
        TransactionRequest::Commit { name } => {
            (format!("COMMIT TRAN {name}"), DepthChange::Decrement)
        }
        TransactionRequest::Rollback { name } if name.is_empty() => {
            ("ROLLBACK TRAN".to_string(), DepthChange::Clear)
        }
        TransactionRequest::Rollback { name } => {
            (format!("ROLLBACK TRAN {name}"), DepthChange::Rollback(name.clone()))
        }
        TransactionRequest::Save { name } => {
            (format!("SAVE TRAN {name}"), DepthChange::Save(name.clone()))
        }
    }
}

/// Name for a transaction started by the transaction helper.
pub(crate) fn generated_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("_tds_{}", &id[..20])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_root_descriptor_survives() {
        let mut ledger = TransactionLedger::new();
        assert_eq!(ledger.current(), 0);
        ledger.end();
        assert_eq!(ledger.current(), 0);

        ledger.begin(0x1234);
        assert_eq!(ledger.current(), 0x1234);
        assert!(ledger.in_transaction());
        ledger.end();
        assert_eq!(ledger.current(), 0);
        assert!(!ledger.in_transaction());
    }

    #[test]
    fn test_legacy_depth() {
        let mut ledger = TransactionLedger::new();
        ledger.apply_legacy(DepthChange::Increment);
        ledger.apply_legacy(DepthChange::Increment);
        assert_eq!(ledger.depth(), 2);
        ledger.apply_legacy(DepthChange::Decrement);
        assert!(ledger.in_transaction());
        ledger.apply_legacy(DepthChange::Decrement);
        assert!(!ledger.in_transaction());
        ledger.apply_legacy(DepthChange::Decrement);
        assert_eq!(ledger.depth(), 0);
    }

    #[test]
    fn test_legacy_sql() {
        let (sql, change) = legacy_sql(&TransactionRequest::Begin {
            isolation: IsolationLevel::Serializable,
            name: "t1".into(),
        });
        assert_eq!(sql, "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE;BEGIN TRAN t1");
        assert_eq!(change, DepthChange::Increment);

        let (sql, change) = legacy_sql(&TransactionRequest::Save { name: "sp".into() });
        assert_eq!(sql, "SAVE TRAN sp");
        assert_eq!(change, DepthChange::Save("sp".into()));

        let (sql, change) = legacy_sql(&TransactionRequest::Rollback { name: String::new() });
        assert_eq!(sql, "ROLLBACK TRAN");
        assert_eq!(change, DepthChange::Clear);
    }

    #[test]
    fn test_legacy_rollback_to_savepoint_keeps_depth() {
        let mut ledger = TransactionLedger::new();
        ledger.apply_legacy(DepthChange::Increment);
        ledger.apply_legacy(DepthChange::Save("sp1".into()));
        ledger.apply_legacy(DepthChange::Save("sp2".into()));

        ledger.apply_legacy(DepthChange::Rollback("sp1".into()));
        assert!(ledger.in_transaction());
        assert_eq!(ledger.depth(), 1);
        assert_eq!(ledger.savepoints, vec!["sp1".to_string()]);

        // sp2 went with the rollback, so its name now means the transaction.
        ledger.apply_legacy(DepthChange::Rollback("sp2".into()));
        assert!(!ledger.in_transaction());
        assert_eq!(ledger.depth(), 0);
    }

    #[test]
    fn test_legacy_full_rollback_clears_every_level() {
        let mut ledger = TransactionLedger::new();
        ledger.apply_legacy(DepthChange::Increment);
        ledger.apply_legacy(DepthChange::Increment);
        ledger.apply_legacy(DepthChange::Rollback("outer".into()));
        assert_eq!(ledger.depth(), 0);
        assert!(!ledger.in_transaction());

        ledger.apply_legacy(DepthChange::Increment);
        ledger.apply_legacy(DepthChange::Increment);
        ledger.apply_legacy(DepthChange::Clear);
        assert_eq!(ledger.depth(), 0);
        assert!(!ledger.in_transaction());
    }

    #[test]
    fn test_generated_name() {
        let name = generated_name();
        assert!(name.starts_with("_tds_"));
        assert_eq!(name.len(), 25);
        assert_ne!(name, generated_name());
    }
}
