use multiaddr::Multiaddr;

/// Errors raised by transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("address {0} is not supported by this transport")]
    UnsupportedAddress(Multiaddr),
    #[error("this transport cannot listen")]
    ListenUnsupported,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
