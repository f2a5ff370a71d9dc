//! Error types for pool operations

/// Errors from pool operations.
///
/// Unknown ids are not errors: lookups return `None` and mutators no-op.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account with email {email} already exists (id {existing_id})")]
    DuplicateEmail { email: String, existing_id: String },

    #[error("account store error: {0}")]
    Store(#[from] account_store::Error),

    #[error("usage store error: {0}")]
    Usage(#[from] usage_store::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_email_names_email_and_existing_id() {
        let err = Error::DuplicateEmail {
            email: "x@y.com".into(),
            existing_id: "acct-1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("x@y.com"), "got: {msg}");
        assert!(msg.contains("acct-1"), "got: {msg}");
    }

    #[test]
    fn store_errors_convert() {
        let err: Error = account_store::Error::Io("disk gone".into()).into();
        assert!(err.to_string().contains("disk gone"));
        let err: Error = usage_store::Error::NotReady.into();
        assert!(err.to_string().contains("not ready"));
    }
}
