use sea_orm::{DatabaseConnection, DatabaseTransaction, DbErr, IsolationLevel, TransactionTrait};

use crate::error::ProvisionError;

/// Opens a serializable transaction. This is the only mutual exclusion the
/// allocators rely on.
pub async fn begin_serializable(db: &DatabaseConnection) -> Result<DatabaseTransaction, DbErr> {
    db.begin_with_config(Some(IsolationLevel::Serializable), None)
        .await
}

/// Serialization conflicts and deadlocks are safe to retry from the top of
/// the transaction.
pub fn is_conflict(err: &DbErr) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("40001")
        || msg.contains("could not serialize")
        || msg.contains("40p01")
        || msg.contains("deadlock detected")
        || msg.contains("database is locked")
}

pub fn is_retryable(err: &ProvisionError) -> bool {
    matches!(err, ProvisionError::Store(db) if is_conflict(db))
}

pub(crate) fn now() -> sea_orm::prelude::DateTimeWithTimeZone {
    chrono::Utc::now().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_postgres_serialization_failures() {
        let err = DbErr::Custom(
            "error returned from database: could not serialize access due to concurrent update"
                .to_string(),
        );
        assert!(is_conflict(&err));
        assert!(is_conflict(&DbErr::Custom("SQLSTATE 40001".to_string())));
        assert!(!is_conflict(&DbErr::Custom("syntax error".to_string())));
    }

    #[test]
    fn only_store_conflicts_are_retryable() {
        assert!(is_retryable(&ProvisionError::Store(DbErr::Custom(
            "40001".to_string()
        ))));
        assert!(!is_retryable(&ProvisionError::Validation("x".to_string())));
    }
}
