use core::fmt;

/// Everything that can go wrong talking to an [`crate::io::PageStorage`] backend or
/// violating one of the engine's invariants.
///
/// None of these are retried internally: a failure is handed back to the caller with
/// the ring state left exactly as it was before the call that failed.
#[derive(Debug)]
pub enum Error {
    /// Invalid configuration at `open` (bad key size, unaligned page counts, too few
    /// buffers, too few spline points, ...).
    Config(&'static str),
    /// A page read/write/erase/open/close/flush call into the host backend failed.
    Io(IoError),
    /// `put` was called with a key not strictly greater than the last inserted key.
    OutOfOrder,
    /// The requested key is not present.
    NotFound,
    /// `getVar` found the record but its variable-length bytes have already been
    /// overwritten by ring wraparound. The fixed part of the record is still valid.
    VarDataDeleted,
    /// Recovery scan observed content that cannot correspond to a well-formed ring
    /// (e.g. two valid pages claiming the same logical id).
    Corrupt(&'static str),
    /// `putVar`/`getVar` called while variable-length data support is not configured.
    FeatureDisabled,
}

/// A failure reported by a [`crate::io::PageStorage`] backend.
#[derive(Debug)]
pub enum IoError {
    /// `open` failed.
    Open,
    /// `close` failed.
    Close,
    /// `flush` failed.
    Flush,
    /// `read` failed for the given logical page.
    Read(u32),
    /// `write` failed for the given logical page.
    Write(u32),
    /// `erase` failed for the given physical page range.
    Erase(u32, u32),
    /// Wraps an underlying `std::io::Error` for backends built on `std::io`.
    Os(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "invalid storage engine configuration: {msg}"),
            Error::Io(err) => write!(f, "page storage I/O error: {err}"),
            Error::OutOfOrder => write!(f, "put called with a key that is not strictly greater than the last inserted key"),
            Error::NotFound => write!(f, "key not found"),
            Error::VarDataDeleted => write!(f, "variable data for this key has been overwritten by ring wraparound"),
            Error::Corrupt(msg) => write!(f, "recovery scan found corrupt ring content: {msg}"),
            Error::FeatureDisabled => write!(f, "variable-length data support is not enabled for this instance"),
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Open => write!(f, "failed to open backing file"),
            IoError::Close => write!(f, "failed to close backing file"),
            IoError::Flush => write!(f, "failed to flush backing file"),
            IoError::Read(page) => write!(f, "failed to read logical page {page}"),
            IoError::Write(page) => write!(f, "failed to write logical page {page}"),
            IoError::Erase(start, end) => write!(f, "failed to erase physical pages [{start}, {end})"),
            IoError::Os(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {}
impl std::error::Error for IoError {}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
