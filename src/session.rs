//! Per-execution-context state
//!
//! Each connection, thread or task running statements owns one `Session`.
//! The current transaction lives here and nowhere else, so two contexts can
//! never observe or change each other's association.

use crate::granite::types::TxnId;

#[derive(Debug, Default)]
pub struct Session {
    /// Transaction that logged operations are attributed to
    pub(crate) current_txn: Option<TxnId>,
}

impl Session {
    pub fn new() -> Self {
        Self { current_txn: None }
    }

    pub fn current_transaction(&self) -> Option<TxnId> {
        self.current_txn
    }

    pub fn in_transaction(&self) -> bool {
        self.current_txn.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_has_no_transaction() {
        let session = Session::new();
        assert_eq!(session.current_transaction(), None);
        assert!(!session.in_transaction());
    }
}
