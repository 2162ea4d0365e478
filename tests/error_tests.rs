use mnemos::error::MnemosError;

#[test]
fn messages_are_human_readable() {
    let e = MnemosError::Capability {
        operation: "semantic file retrieval",
        missing: "embedder",
    };
    assert_eq!(e.to_string(), "semantic file retrieval requires embedder, which is not configured");
    assert!(MnemosError::Validation("bad level".into()).to_string().contains("bad level"));

    let e = MnemosError::Extraction {
        user_id: "u1".into(),
        stage: "classify",
        reason: "timeout".into(),
    };
    assert_eq!(e.to_string(), "classify failed for user u1: timeout");
}

#[test]
fn database_errors_pick_up_user_scope() {
    let raw = MnemosError::Database(rusqlite::Error::InvalidQuery);
    assert_eq!(raw.user_id(), None);
    let scoped = raw.with_user("u7");
    assert!(matches!(scoped, MnemosError::Storage { .. }));
    assert_eq!(scoped.user_id(), Some("u7"));

    // already-scoped errors keep their user
    let e = MnemosError::Conflict {
        user_id: "a".into(),
        entity: "triplet (User, works_at)".into(),
    }
    .with_user("b");
    assert_eq!(e.user_id(), Some("a"));
}

#[test]
fn only_transient_errors_are_retryable() {
    assert!(MnemosError::Conflict {
        user_id: "u".into(),
        entity: "item".into()
    }
    .is_retryable());
    assert!(MnemosError::Pool("timed out".into()).is_retryable());
    assert!(!MnemosError::Validation("x".into()).is_retryable());
    assert!(!MnemosError::Capability {
        operation: "graph memory",
        missing: "embedder"
    }
    .is_retryable());
}
