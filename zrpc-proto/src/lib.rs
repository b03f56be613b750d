//! Wire framing shared by every zRPC transport.
//!
//! A frame on the wire is `[type:u8][flags:u8][length:u32 BE][payload]`.
//! Stream identity is the transport's concern and is never embedded here;
//! adapters that multiplex logical substreams over a single socket prepend
//! their own substream header before the frame.

mod frame;
mod headers;
mod settings;

pub use frame::{Frame, FrameDecoder, FrameError, FrameType, FLAG_END_HEADERS, FLAG_END_STREAM};
pub use headers::{Headers, HeadersError};
pub use settings::{Settings, SettingsError};

/// Default maximum frame payload, negotiable upward via SETTINGS.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024;

/// Absolute ceiling on a frame payload; larger lengths are always malformed.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Content type stamped on request headers when the caller supplies none.
pub const CONTENT_TYPE: &str = "application/zrpc+zpb";

/// Pseudo-header carrying the fully-qualified `Service/Method` name.
pub const HEADER_METHOD: &str = ":method";

/// Pseudo-header carrying the caller's deadline budget in milliseconds.
pub const HEADER_DEADLINE_MS: &str = ":deadline-ms";

/// Pseudo-header carrying the numeric status code on response headers.
pub const HEADER_STATUS: &str = ":status";

/// Header carrying the diagnostic status message, if any.
pub const HEADER_MESSAGE: &str = "zrpc-message";

/// Header carrying the payload content type.
pub const HEADER_CONTENT_TYPE: &str = "content-type";
