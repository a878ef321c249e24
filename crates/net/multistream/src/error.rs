use lattice_net_framing::FramingError;

/// Errors raised during multistream-select negotiation.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("remote answered the multistream header with {received:?}")]
    InvalidHeader { received: String },
    #[error("no protocol agreed on, offered {offered:?}")]
    NoAgreement { offered: Vec<String> },
    #[error("remote requested protocol listing, which is not supported")]
    ListUnsupported,
}
