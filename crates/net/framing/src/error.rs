/// Errors raised while encoding or decoding negotiation frames.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("varint error: {0}")]
    Varint(#[from] unsigned_varint::decode::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame is missing its terminating newline")]
    MissingNewline,
    #[error("frame length prefix is zero")]
    EmptyFrame,
    #[error("frame payload is not valid utf-8")]
    InvalidString(#[from] std::str::Utf8Error),
}

impl FramingError {
    /// True when the underlying stream ended mid-frame.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
