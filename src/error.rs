//! Error types for stylesheet loading, section building and the page cache.

use std::fmt;
use std::io;

/// Pipeline phase an error originated in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorPhase {
    /// Stylesheet parsing or stylesheet cache I/O.
    Stylesheet,
    /// Markup tokenizing.
    Tokenize,
    /// Line breaking and pagination.
    Layout,
    /// Page cache store read/write.
    Cache,
    /// Orchestration (cache selection, worker management).
    Orchestrate,
}

impl fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stylesheet => "stylesheet",
            Self::Tokenize => "tokenize",
            Self::Layout => "layout",
            Self::Cache => "cache",
            Self::Orchestrate => "orchestrate",
        };
        f.write_str(name)
    }
}

/// Typed actual-vs-limit context attached to size rejections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorLimitContext {
    /// Which limit was hit.
    pub kind: &'static str,
    /// Observed value.
    pub actual: usize,
    /// Configured ceiling.
    pub limit: usize,
}

impl ErrorLimitContext {
    pub fn new(kind: &'static str, actual: usize, limit: usize) -> Self {
        Self {
            kind,
            actual,
            limit,
        }
    }
}

/// Every failure the crate surfaces.
#[derive(Debug)]
pub enum FolioError {
    /// Input exceeds a hard size ceiling and was rejected outright.
    InputTooLarge {
        phase: ErrorPhase,
        limit: ErrorLimitContext,
    },
    /// Markup could not be parsed past a recoverable point.
    MalformedMarkup { offset: u64, message: Box<str> },
    /// Persisted blob carries a different format version.
    CacheVersionMismatch { found: u8, expected: u8 },
    /// Persisted section was built for different render parameters.
    CacheParameterMismatch { field: &'static str },
    /// Persisted blob is truncated or internally inconsistent.
    CacheCorrupt { message: Box<str> },
    /// Requested page index is past the end of the section.
    PageOutOfRange { index: usize, count: usize },
    /// Underlying storage failed.
    Storage {
        phase: ErrorPhase,
        kind: io::ErrorKind,
        message: Box<str>,
    },
    /// A cancellation token fired while work was in progress.
    Cancelled,
}

impl FolioError {
    pub(crate) fn too_large(
        phase: ErrorPhase,
        kind: &'static str,
        actual: usize,
        limit: usize,
    ) -> Self {
        Self::InputTooLarge {
            phase,
            limit: ErrorLimitContext::new(kind, actual, limit),
        }
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::CacheCorrupt {
            message: message.into().into_boxed_str(),
        }
    }

    pub(crate) fn malformed(offset: u64, message: impl Into<String>) -> Self {
        Self::MalformedMarkup {
            offset,
            message: message.into().into_boxed_str(),
        }
    }

    /// Re-tag a storage error with the phase it surfaced in.
    pub(crate) fn in_phase(self, phase: ErrorPhase) -> Self {
        match self {
            Self::Storage { kind, message, .. } => Self::Storage {
                phase,
                kind,
                message,
            },
            other => other,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InputTooLarge {
                phase: ErrorPhase::Stylesheet,
                ..
            } => "CSS_INPUT_TOO_LARGE",
            Self::InputTooLarge { .. } => "DOCUMENT_TOO_LARGE",
            Self::MalformedMarkup { .. } => "MARKUP_MALFORMED",
            Self::CacheVersionMismatch { .. } => "CACHE_VERSION_MISMATCH",
            Self::CacheParameterMismatch { .. } => "CACHE_PARAMETER_MISMATCH",
            Self::CacheCorrupt { .. } => "CACHE_CORRUPT",
            Self::PageOutOfRange { .. } => "PAGE_OUT_OF_RANGE",
            Self::Storage { .. } => "STORAGE_FAILURE",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Phase the error originated in.
    pub fn phase(&self) -> ErrorPhase {
        match self {
            Self::InputTooLarge { phase, .. } | Self::Storage { phase, .. } => *phase,
            Self::MalformedMarkup { .. } => ErrorPhase::Tokenize,
            Self::CacheVersionMismatch { .. }
            | Self::CacheParameterMismatch { .. }
            | Self::CacheCorrupt { .. }
            | Self::PageOutOfRange { .. } => ErrorPhase::Cache,
            Self::Cancelled => ErrorPhase::Orchestrate,
        }
    }

    /// True when a persisted blob must be discarded and rebuilt from source.
    pub fn is_cache_invalid(&self) -> bool {
        matches!(
            self,
            Self::CacheVersionMismatch { .. }
                | Self::CacheParameterMismatch { .. }
                | Self::CacheCorrupt { .. }
        )
    }

    /// True when the persisted blob simply does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                kind: io::ErrorKind::NotFound,
                ..
            }
        )
    }
}

impl fmt::Display for FolioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: ", self.phase(), self.code())?;
        match self {
            Self::InputTooLarge { limit, .. } => write!(
                f,
                "input too large [limit_kind={} actual={} limit={}]",
                limit.kind, limit.actual, limit.limit
            ),
            Self::MalformedMarkup { offset, message } => {
                write!(f, "{} [offset={}]", message, offset)
            }
            Self::CacheVersionMismatch { found, expected } => write!(
                f,
                "cache format version {} does not match {}",
                found, expected
            ),
            Self::CacheParameterMismatch { field } => {
                write!(f, "cached render parameter differs [field={}]", field)
            }
            Self::CacheCorrupt { message } => f.write_str(message),
            Self::PageOutOfRange { index, count } => {
                write!(f, "page {} requested, section has {}", index, count)
            }
            Self::Storage { kind, message, .. } => write!(f, "{} [kind={:?}]", message, kind),
            Self::Cancelled => f.write_str("operation cancelled"),
        }
    }
}

impl std::error::Error for FolioError {}

impl From<io::Error> for FolioError {
    fn from(err: io::Error) -> Self {
        // Short reads and undecodable fields mean the persisted blob is bad.
        match err.kind() {
            io::ErrorKind::UnexpectedEof => {
                return Self::corrupt(format!("truncated read: {}", err));
            }
            io::ErrorKind::InvalidData => return Self::corrupt(err.to_string()),
            _ => {}
        }
        Self::Storage {
            phase: ErrorPhase::Cache,
            kind: err.kind(),
            message: err.to_string().into_boxed_str(),
        }
    }
}
