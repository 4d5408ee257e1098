use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    AlreadyExists,
    InUse,
    Permission,
    Corrupt,
    Io,
    Semaphore,
    InvalidSize,
    NoSuchRecord,
    Stompled,
    RecordTooLarge,
    Full,
    Frozen,
    AwaitTimedOut,
    AwaitInterrupted,
}

/// Base of the pool retort range shared with the remote protocol.
pub const POOL_RETORT_BASE: i64 = -200_000;

impl ErrorKind {
    /// Numeric code for the remote protocol boundary. Stable once published.
    pub fn retort(self) -> i64 {
        let offset = match self {
            ErrorKind::Internal => 0,
            ErrorKind::Io => 10,
            ErrorKind::Semaphore => 20,
            ErrorKind::InUse => 50,
            ErrorKind::Usage => 60,
            ErrorKind::Corrupt => 80,
            ErrorKind::Permission => 85,
            ErrorKind::InvalidSize => 100,
            ErrorKind::NotFound => 110,
            ErrorKind::AlreadyExists => 120,
            ErrorKind::NoSuchRecord => 210,
            ErrorKind::AwaitTimedOut => 220,
            ErrorKind::AwaitInterrupted => 230,
            ErrorKind::RecordTooLarge => 250,
            ErrorKind::Frozen => 260,
            ErrorKind::Full => 270,
            ErrorKind::Stompled => 280,
        };
        POOL_RETORT_BASE - offset
    }

    /// Races are always safe to retry after re-resolving the position.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Stompled)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    index: Option<u64>,
    offset: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            index: None,
            offset: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    pub fn index(&self) -> Option<u64> {
        self.index
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(index) = self.index {
            write!(f, " (index: {index})")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::AlreadyExists => 4,
        ErrorKind::InUse => 5,
        ErrorKind::Permission => 6,
        ErrorKind::Corrupt => 7,
        ErrorKind::Io => 8,
        ErrorKind::Semaphore => 9,
        ErrorKind::InvalidSize => 10,
        ErrorKind::NoSuchRecord => 11,
        ErrorKind::Stompled => 12,
        ErrorKind::RecordTooLarge => 13,
        ErrorKind::Full => 14,
        ErrorKind::Frozen => 15,
        ErrorKind::AwaitTimedOut => 16,
        ErrorKind::AwaitInterrupted => 17,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, POOL_RETORT_BASE, to_exit_code};
    use std::collections::HashSet;

    const ALL: [ErrorKind; 17] = [
        ErrorKind::Internal,
        ErrorKind::Usage,
        ErrorKind::NotFound,
        ErrorKind::AlreadyExists,
        ErrorKind::InUse,
        ErrorKind::Permission,
        ErrorKind::Corrupt,
        ErrorKind::Io,
        ErrorKind::Semaphore,
        ErrorKind::InvalidSize,
        ErrorKind::NoSuchRecord,
        ErrorKind::Stompled,
        ErrorKind::RecordTooLarge,
        ErrorKind::Full,
        ErrorKind::Frozen,
        ErrorKind::AwaitTimedOut,
        ErrorKind::AwaitInterrupted,
    ];

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::AlreadyExists, 4),
            (ErrorKind::InUse, 5),
            (ErrorKind::Permission, 6),
            (ErrorKind::Corrupt, 7),
            (ErrorKind::Io, 8),
            (ErrorKind::NoSuchRecord, 11),
            (ErrorKind::Stompled, 12),
            (ErrorKind::AwaitInterrupted, 17),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn retorts_are_distinct_and_negative() {
        let mut seen = HashSet::new();
        for kind in ALL {
            let retort = kind.retort();
            assert!(retort <= POOL_RETORT_BASE);
            assert!(seen.insert(retort), "duplicate retort for {kind:?}");
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::NoSuchRecord)
            .with_message("record no longer in pool")
            .with_index(7)
            .with_offset(4096);
        let text = err.to_string();
        assert!(text.starts_with("NoSuchRecord: record no longer in pool"));
        assert!(text.contains("(index: 7)"));
        assert!(text.contains("(offset: 4096)"));
    }

    #[test]
    fn only_stomples_are_retryable() {
        for kind in ALL {
            assert_eq!(kind.is_retryable(), kind == ErrorKind::Stompled);
        }
    }
}
