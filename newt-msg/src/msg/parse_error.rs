use super::opt::parse_error::OptParseError;

/// Errors encounterable while parsing a message from bytes
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Eq, Ord)]
pub enum MessageParseError {
  /// Reached end of stream before parsing was finished
  UnexpectedEndOfStream,

  /// Token length was > 8
  InvalidTokenLength(u8),

  /// Version was not 1
  InvalidVersion(u8),

  /// Error parsing option
  OptParseError(OptParseError),

  /// A payload marker (0xFF) was followed by zero bytes
  PayloadMarkerWithoutPayload,

  /// An Empty (0.00) message had a token, options or a payload
  EmptyMessageWithContent,

  /// A stream frame's length header disagreed with the bytes available
  FrameLengthMismatch {
    /// length announced by the frame header
    expected: usize,
    /// bytes actually following the header
    actual: usize,
  },
}

impl MessageParseError {
  /// Shorthand for [`MessageParseError::UnexpectedEndOfStream`]
  pub fn eof() -> Self {
    Self::UnexpectedEndOfStream
  }
}

impl core::fmt::Display for MessageParseError {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      | Self::UnexpectedEndOfStream => write!(f, "unexpected end of message"),
      | Self::InvalidTokenLength(n) => write!(f, "token length {} exceeds 8", n),
      | Self::InvalidVersion(v) => write!(f, "unsupported version {}", v),
      | Self::OptParseError(e) => write!(f, "invalid option: {:?}", e),
      | Self::PayloadMarkerWithoutPayload => write!(f, "payload marker without payload"),
      | Self::EmptyMessageWithContent => write!(f, "empty message carries content"),
      | Self::FrameLengthMismatch { expected, actual } => {
        write!(f, "frame announced {} bytes but {} followed", expected, actual)
      },
    }
  }
}

impl std::error::Error for MessageParseError {}
