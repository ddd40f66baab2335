/// Wire protocol version string, reported by `/info`.
pub const PROTOCOL_VERSION: &str = "/hearth/messaging/1.0.0";

/// Moderation categories that can block a message outright.
pub const HIGH_RISK_CATEGORIES: [&str; 5] =
    ["violence", "sexual", "hate", "self-harm", "harassment"];

/// Confidence threshold passed to the moderation service for text.
pub const TEXT_MODERATION_THRESHOLD: f64 = 0.7;

/// Score above which a high-risk text category blocks the send.
pub const TEXT_BLOCK_CONFIDENCE: f64 = 0.85;

/// Confidence threshold passed to the moderation service for media.
pub const MEDIA_MODERATION_THRESHOLD: f64 = 0.75;

/// Score above which a high-risk media category blocks the message.
pub const MEDIA_BLOCK_CONFIDENCE: f64 = 0.9;

/// Maximum text content length in characters
pub const MAX_TEXT_LENGTH: usize = 5_000;

/// Maximum media upload size in bytes (25 MiB)
pub const MAX_MEDIA_SIZE: usize = 25 * 1024 * 1024;

/// Thumbnails fit within a square of this many pixels.
pub const THUMBNAIL_MAX_DIMENSION: u32 = 320;

/// Maximum participants in a group conversation (creator included)
pub const MAX_GROUP_PARTICIPANTS: usize = 256;

/// Maximum length of a group title
pub const MAX_TITLE_LENGTH: usize = 120;

/// Maximum length of a group description
pub const MAX_DESCRIPTION_LENGTH: usize = 1_000;

/// Maximum length of a reaction symbol
pub const MAX_REACTION_LENGTH: usize = 32;

/// Maximum length of a custom presence status
pub const MAX_CUSTOM_STATUS_LENGTH: usize = 100;

/// Page size used by `get_messages` when none is given
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Upper bound for `get_messages` page size
pub const MAX_PAGE_SIZE: u32 = 100;

/// Typing entries older than this are swept
pub const DEFAULT_TYPING_TIMEOUT_MS: u64 = 5_000;

/// Interval between typing sweeps
pub const DEFAULT_TYPING_SWEEP_MS: u64 = 1_000;

/// Messages kept per conversation in the in-process cache
pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 100;

/// Default HTTP/WebSocket port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
