/// Errors surfaced by the cache.
///
/// User errors (`BadKey`, `EmptyValue`, `Oversize`, `KeyExists`,
/// `KeyNotFound`, `NonNumeric`) and contention (`Locked`) leave the segment
/// untouched. `Corrupt` means an in-segment invariant check failed; the
/// offending walk is abandoned with all locks released.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error from the backing files or mappings
    Io(std::io::Error),

    /// Key is empty or contains a space / control byte
    BadKey,

    /// Zero-length values cannot be stored (a zero `valSize` marks a dead chunk)
    EmptyValue,

    /// Value does not fit a zone (byte length attached)
    Oversize(usize),

    /// `add` on a key that is already present
    KeyExists,

    /// `replace` or typed update on a key that is not present
    KeyNotFound,

    /// `increment` on a value that is not a decimal integer
    NonNumeric,

    /// Lock acquisition timed out
    Locked,

    /// An in-segment invariant check failed (detail attached)
    Corrupt(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::BadKey => write!(f, "invalid cache key"),
            Self::EmptyValue => write!(f, "empty values cannot be stored"),
            Self::Oversize(n) => write!(f, "value of {n} bytes exceeds the chunk payload limit"),
            Self::KeyExists => write!(f, "key already exists"),
            Self::KeyNotFound => write!(f, "key not found"),
            Self::NonNumeric => write!(f, "stored value is not a decimal integer"),
            Self::Locked => write!(f, "lock acquisition timed out"),
            Self::Corrupt(what) => write!(f, "segment corrupt: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Cache result
pub type Result<T> = std::result::Result<T, Error>;
