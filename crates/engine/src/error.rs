use thiserror::Error;
use workbench_core::CoreError;
use workbench_storage::{MigrationError, StorageError, Transient};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A planned mutation found its neighbours changed underneath it.
    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error code surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    ChecksumMismatch,
    Cancelled,
    Internal,
    Unimplemented,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
            Self::Unimplemented => "unimplemented",
        }
    }
}

fn core_code(e: &CoreError) -> ErrorCode {
    match e {
        CoreError::InvalidId(_) | CoreError::InvalidArgument(_) => ErrorCode::InvalidArgument,
        CoreError::Cancelled | CoreError::DeadlineExceeded => ErrorCode::Cancelled,
    }
}

fn storage_code(e: &StorageError) -> ErrorCode {
    match e {
        StorageError::NotFound(_) => ErrorCode::NotFound,
        StorageError::InvalidArgument(_) => ErrorCode::InvalidArgument,
        StorageError::Unimplemented(_) => ErrorCode::Unimplemented,
        StorageError::Core(core) => core_code(core),
        StorageError::Sqlite(_)
        | StorageError::Serialization(_)
        | StorageError::Corrupt(_)
        | StorageError::Io(_) => ErrorCode::Internal,
    }
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Storage(e) => storage_code(e),
            Self::Core(e) => core_code(e),
            Self::Migration(e) => match e {
                MigrationError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
                MigrationError::DuplicateMigration(_) | MigrationError::InvalidRegistration { .. } => {
                    ErrorCode::InvalidArgument
                }
                MigrationError::Cancelled => ErrorCode::Cancelled,
                MigrationError::Storage(e) => storage_code(e),
                MigrationError::Precheck { .. }
                | MigrationError::Apply { .. }
                | MigrationError::Validate { .. }
                | MigrationError::Backup(_)
                | MigrationError::Failed(_) => ErrorCode::Internal,
            },
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::Conflict(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl Transient for EngineError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_underlying_error() {
        assert_eq!(
            EngineError::from(StorageError::NotFound("x".into())).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            EngineError::from(StorageError::Corrupt("cycle".into())).code(),
            ErrorCode::Internal
        );
        assert_eq!(EngineError::from(CoreError::Cancelled).code(), ErrorCode::Cancelled);
        assert_eq!(
            EngineError::from(MigrationError::ChecksumMismatch {
                id: workbench_storage::Ulid::nil(),
                recorded: "a".into(),
                registered: "b".into(),
            })
            .code(),
            ErrorCode::ChecksumMismatch
        );
        assert_eq!(
            EngineError::Conflict("moved".into()).code(),
            ErrorCode::Internal
        );
    }
}
