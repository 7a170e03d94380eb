/// Errors that can occur when talking to XREAL One / One Pro glasses.
///
/// The set is closed: every failure surfaced by this crate maps onto exactly
/// one of these kinds. Terminal session errors are cloned into every pending
/// waiter, so the enum carries owned data only.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no usable network candidate for {0}")]
    NetworkUnavailable(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    #[error("command rejected by device (status 0x{status:04x})")]
    CommandRejected { status: i32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("transaction {tx_id} already pending for magic 0x{magic:04x}")]
    TransactionCollision { tx_id: u32, magic: u16 },

    #[error("config is not valid JSON: {0}")]
    Parse(String),

    #[error("config schema violation at {path}: {detail}")]
    SchemaValidation { path: String, detail: String },
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        // Kind and payload compare by display form, which is all the state
        // snapshots need.
        std::mem::discriminant(self) == std::mem::discriminant(other)
            && self.to_string() == other.to_string()
    }
}

impl Error {
    pub(crate) fn io(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }

    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        Error::Protocol(detail.into())
    }

    pub(crate) fn schema(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::SchemaValidation {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Whether a new `start()` may succeed without operator intervention.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidArgument(_) | Error::Parse(_) | Error::SchemaValidation { .. }
        )
    }
}
