/*!
Tests for error handling and error types.
*/

#[cfg(test)]
mod tests {
    use crate::error::KeepError;
    use std::io;

    #[test]
    fn test_keep_error_display() {
        let error = KeepError::validation("test validation error");
        assert_eq!(error.to_string(), "Validation error: test validation error");

        let error = KeepError::compression("test compression error");
        assert_eq!(error.to_string(), "Compression error: test compression error");

        let error = KeepError::storage("test storage error");
        assert_eq!(error.to_string(), "Storage error: test storage error");
    }

    #[test]
    fn test_keep_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let keep_error = KeepError::from(io_error);

        match keep_error {
            KeepError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_keep_error_from_sql_error() {
        let sql_error = rusqlite::Error::QueryReturnedNoRows;
        let keep_error = KeepError::from(sql_error);

        assert!(matches!(keep_error, KeepError::Sql(_)));
        assert!(keep_error.to_string().starts_with("SQL error"));
    }

    #[test]
    fn test_quota_exceeded_is_distinct() {
        let error = KeepError::QuotaExceeded {
            needed: 2048,
            available: 100,
        };

        assert!(error.is_quota_exceeded());
        assert!(!error.triggers_rebuild());
        assert!(error.to_string().contains("2048"));
        assert!(!KeepError::storage("disk offline").is_quota_exceeded());
    }

    #[test]
    fn test_rebuild_triggers() {
        assert!(KeepError::corrupt("not a database").triggers_rebuild());
        assert!(KeepError::stale("version 1 < 2").triggers_rebuild());
        assert!(KeepError::IntegrityCheckFailed {
            expected: "abc".to_string(),
            actual: "def".to_string(),
        }
        .triggers_rebuild());
        assert!(!KeepError::StoreUnavailable("no store".to_string()).triggers_rebuild());
        assert!(!KeepError::EngineNotReady("Initializing".to_string()).triggers_rebuild());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KeepError>();
        assert_sync::<KeepError>();
    }

    #[test]
    fn test_engine_not_ready_mentions_state() {
        let error = KeepError::EngineNotReady("LoadingSnapshot".to_string());
        assert!(error.to_string().contains("LoadingSnapshot"));
    }
}
