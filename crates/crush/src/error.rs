//! Error types for map authoring, the binary codec and the text compiler.

use thiserror::Error;

/// A specialized `Result` type for CRUSH operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while building, encoding, decoding or compiling a map.
///
/// Authoring-time failures abort the operation they occurred in; the
/// selection path never returns an error (exhaustion is rendered as a short
/// result or gaps instead).
#[derive(Debug, Error)]
pub enum Error {
    /// Textual input is malformed.
    #[error("{msg}")]
    Parse {
        /// What the parser objected to.
        msg: String,
    },

    /// Reference to an unknown device, type, item or rule.
    #[error("'{name}' is not defined")]
    Undefined {
        /// The unresolved name.
        name: String,
    },

    /// The same name or id was declared twice.
    #[error("'{name}' is already defined")]
    Duplicate {
        /// The redeclared name or id.
        name: String,
    },

    /// A bucket references an unknown child, or the hierarchy is not a
    /// forest.
    #[error("invalid topology: {why}")]
    InvalidTopology {
        /// What was violated.
        why: String,
    },

    /// Device offload outside the legal range.
    #[error("illegal device offload {value} (valid range is [0,1])")]
    InvalidOffload {
        /// The rejected value.
        value: f64,
    },

    /// Binary input could not be decoded.
    #[error("corrupt binary at offset {offset}: {why}")]
    CorruptBinary {
        /// Byte offset the decoder failed at.
        offset: usize,
        /// What went wrong.
        why: String,
    },

    /// Binary input carries a magic number this version does not speak.
    #[error("unrecognized map magic {magic:#010x}")]
    UnknownVersion {
        /// The magic read from the input.
        magic: u32,
    },

    /// An error qualified with the input line it was detected on.
    #[error("line {line}: {source}")]
    At {
        /// 1-based input line.
        line: usize,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Qualify this error with the input line it was detected on.
    ///
    /// Already-qualified errors keep their original position.
    #[must_use]
    pub fn at(self, line: usize) -> Self {
        match self {
            Self::At { .. } => self,
            other => Self::At { line, source: Box::new(other) },
        }
    }

    /// The input line this error refers to, when it has one.
    #[must_use]
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::At { line, .. } => Some(*line),
            _ => None,
        }
    }

    /// The error stripped of any position qualification.
    #[must_use]
    pub fn inner(&self) -> &Error {
        match self {
            Self::At { source, .. } => source.inner(),
            other => other,
        }
    }
}
