use nom::error::{FromExternalError, ParseError};

use thiserror::Error;

pub type Result<T, E = ClfsError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClfsError {
    #[error("invalid BLF file, possibly corrupt/empty")]
    InvalidBlf,

    #[error("{0}")]
    InvalidRecordBlock(&'static str),

    #[error("invalid symbol table: {0}")]
    InvalidSymbolTable(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("unable to parse structure: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClfsError {
    /// Re-tag truncation and structural parse failures with the record
    /// block message for the current call site. Other errors pass through.
    pub(crate) fn or_record_block(self, msg: &'static str) -> ClfsError {
        match self {
            ClfsError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                ClfsError::InvalidRecordBlock(msg)
            }
            ClfsError::Parse(_) => ClfsError::InvalidRecordBlock(msg),
            other => other,
        }
    }
}

#[derive(Debug)]
pub struct ClfsParseError<I> {
    kind: ErrorKind<I>,
    backtrace: Vec<ClfsParseError<I>>,
}

#[derive(Debug)]
pub enum ErrorKind<I> {
    Nom(I, nom::error::ErrorKind),
}

impl<I> ParseError<I> for ClfsParseError<I> {
    fn from_error_kind(input: I, kind: nom::error::ErrorKind) -> Self {
        Self {
            kind: ErrorKind::Nom(input, kind),
            backtrace: Vec::new(),
        }
    }

    fn append(input: I, kind: nom::error::ErrorKind, mut other: Self) -> Self {
        other.backtrace.push(Self::from_error_kind(input, kind));
        other
    }
}

impl<I, E> FromExternalError<I, E> for ClfsParseError<I> {
    fn from_external_error(input: I, kind: nom::error::ErrorKind, _e: E) -> Self {
        Self::from_error_kind(input, kind)
    }
}

impl<I> From<ClfsParseError<I>> for ClfsError {
    fn from(err: ClfsParseError<I>) -> Self {
        let ErrorKind::Nom(_, kind) = err.kind;
        ClfsError::Parse(kind.description().to_string())
    }
}

impl<I> From<nom::Err<ClfsParseError<I>>> for ClfsError {
    fn from(err: nom::Err<ClfsParseError<I>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => ClfsError::Parse("incomplete input".to_string()),
            nom::Err::Error(e) | nom::Err::Failure(e) => e.into(),
        }
    }
}
