use thiserror::Error;

/// Error surfaced to OVSDB clients.
///
/// `code()` yields the exact wire string RFC 7047 (and the common
/// extensions) prescribe for the response `error` member; the variant
/// payload, where present, becomes the `details` member.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OvsdbError {
    #[error("duplicate uuid-name: {0}")]
    DuplicateUuidName(String),
    #[error("duplicate uuid: {0}")]
    DuplicateUuid(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("referential integrity violation: {0}")]
    ReferentialIntegrity(String),
    #[error("domain error: {0}")]
    Domain(String),
    #[error("range error: {0}")]
    Range(String),
    #[error("timed out")]
    TimedOut,
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("aborted")]
    Aborted,
    #[error("not owner")]
    NotOwner,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("ovsdb error: {0}")]
    Ovsdb(String),
    #[error("permission error: {0}")]
    Permission(String),
    #[error("syntax error or unknown column: {0}")]
    Syntax(String),
    #[error("resources exhausted")]
    ResourcesExhausted,
}

impl OvsdbError {
    /// The verbatim OVSDB error code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            OvsdbError::DuplicateUuidName(_) => "duplicate uuid-name",
            OvsdbError::DuplicateUuid(_) => "duplicate uuid",
            OvsdbError::ConstraintViolation(_) => "constraint violation",
            OvsdbError::ReferentialIntegrity(_) => "referential integrity violation",
            OvsdbError::Domain(_) => "domain error",
            OvsdbError::Range(_) => "range error",
            OvsdbError::TimedOut => "timed out",
            OvsdbError::NotSupported(_) => "not supported",
            OvsdbError::Aborted => "aborted",
            OvsdbError::NotOwner => "not owner",
            OvsdbError::Io(_) => "I/O error",
            OvsdbError::Internal(_) => "internal error",
            OvsdbError::Ovsdb(_) => "ovsdb error",
            OvsdbError::Permission(_) => "permission error",
            OvsdbError::Syntax(_) => "syntax error or unknown column",
            OvsdbError::ResourcesExhausted => "resources exhausted",
        }
    }

    /// Human-readable elaboration for the response `details` member.
    pub fn details(&self) -> Option<&str> {
        match self {
            OvsdbError::DuplicateUuidName(d)
            | OvsdbError::DuplicateUuid(d)
            | OvsdbError::ConstraintViolation(d)
            | OvsdbError::ReferentialIntegrity(d)
            | OvsdbError::Domain(d)
            | OvsdbError::Range(d)
            | OvsdbError::NotSupported(d)
            | OvsdbError::Io(d)
            | OvsdbError::Internal(d)
            | OvsdbError::Ovsdb(d)
            | OvsdbError::Permission(d)
            | OvsdbError::Syntax(d) => Some(d.as_str()),
            OvsdbError::TimedOut
            | OvsdbError::Aborted
            | OvsdbError::NotOwner
            | OvsdbError::ResourcesExhausted => None,
        }
    }
}
