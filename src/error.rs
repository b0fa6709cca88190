pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// On-disk structure does not look like what was expected at this address.
    #[error(
        "{variable}: bad structure at address {address:#x}: expected {expected}, found {found}"
    )]
    Structural {
        variable: String,
        address: u64,
        expected: String,
        found: String,
    },
    #[error("{variable}: unsupported filter {filter}")]
    UnsupportedFilter { variable: String, filter: String },
    #[error("{variable}: request of {requested} bytes exceeds the buffer limit of {limit} bytes")]
    SizeLimit {
        variable: String,
        requested: u64,
        limit: u64,
    },
    #[error("{variable}: invalid section: {message}")]
    InvalidSection { variable: String, message: String },
    #[error("{variable}: invalid descriptor: {message}")]
    InvalidDescriptor { variable: String, message: String },
    #[error(
        "{variable}: fletcher32 checksum mismatch for chunk at {address:#x}: stored {stored:#010x}, computed {computed:#010x}"
    )]
    ChecksumMismatch {
        variable: String,
        address: u64,
        stored: u32,
        computed: u32,
    },
    #[error("linked storage cannot seek backwards from {position} to {requested}")]
    BackwardSeek { position: u64, requested: u64 },
    #[error("{variable}: variable-length elements need a heap resolver")]
    MissingHeapResolver { variable: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("{0}")]
    General(String),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub(crate) fn structural(
        variable: &str,
        address: u64,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::Structural {
            variable: variable.to_string(),
            address,
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub(crate) fn invalid_section(variable: &str, message: impl Into<String>) -> Self {
        Self::InvalidSection {
            variable: variable.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_descriptor(variable: &str, message: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            variable: variable.to_string(),
            message: message.into(),
        }
    }
}
