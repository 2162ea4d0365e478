#[derive(Debug, thiserror::Error)]
pub enum MnemosError {
    #[error("{entity} {id} not found for user {user_id}")]
    NotFound {
        user_id: String,
        entity: &'static str,
        id: String,
    },

    #[error("{operation} requires {missing}, which is not configured")]
    Capability {
        operation: &'static str,
        missing: &'static str,
    },

    #[error("{stage} failed for user {user_id}: {reason}")]
    Extraction {
        user_id: String,
        stage: &'static str,
        reason: String,
    },

    #[error("conflicting write on {entity} for user {user_id}")]
    Conflict { user_id: String, entity: String },

    #[error("storage error for user {user_id}: {reason}")]
    Storage { user_id: String, reason: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool: {0}")]
    Pool(String),
}

impl MnemosError {
    /// Attach the user scope to low-level storage failures.
    pub fn with_user(self, user_id: &str) -> Self {
        match self {
            Self::Database(e) => Self::Storage {
                user_id: user_id.to_string(),
                reason: e.to_string(),
            },
            Self::Pool(reason) => Self::Storage {
                user_id: user_id.to_string(),
                reason,
            },
            other => other,
        }
    }

    /// Conflicts and storage hiccups can be retried as-is; the rest cannot.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Storage { .. } | Self::Database(_) | Self::Pool(_)
        )
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::NotFound { user_id, .. }
            | Self::Extraction { user_id, .. }
            | Self::Conflict { user_id, .. }
            | Self::Storage { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    pub(crate) fn extraction(user_id: &str, stage: &'static str, reason: impl ToString) -> Self {
        Self::Extraction {
            user_id: user_id.to_string(),
            stage,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn not_found(user_id: &str, entity: &'static str, id: &str) -> Self {
        Self::NotFound {
            user_id: user_id.to_string(),
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(user_id: &str, entity: impl Into<String>) -> Self {
        Self::Conflict {
            user_id: user_id.to_string(),
            entity: entity.into(),
        }
    }
}

/// Lock contention and uniqueness violations mean another writer got there
/// first. Everything else is a plain storage failure.
pub(crate) fn is_conflict(e: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;
    match e {
        rusqlite::Error::SqliteFailure(f, _) => matches!(
            f.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation
        ),
        _ => false,
    }
}
