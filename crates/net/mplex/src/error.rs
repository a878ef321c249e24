use lattice_net_framing::FramingError;

/// Errors raised by the mplex layer.
#[derive(Debug, thiserror::Error)]
pub enum MplexError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("unknown mplex packet type {0}")]
    UnknownPacketType(u8),
    #[error("mplex payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("muxer role cannot change after a stream was opened")]
    RoleFixed,
    #[error("muxer channel is closed")]
    Closed,
}

impl From<MplexError> for std::io::Error {
    fn from(error: MplexError) -> Self {
        match error {
            MplexError::Io(e) => e,
            MplexError::Closed => std::io::Error::new(std::io::ErrorKind::BrokenPipe, error),
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
