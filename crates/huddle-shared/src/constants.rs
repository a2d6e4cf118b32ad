/// Prefix of client-generated ids for optimistic messages
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Cache namespace holding one message array per room
pub const ROOM_MESSAGES_PREFIX: &str = "room_messages_";

/// Cache namespace of the generic TTL cache
pub const APP_CACHE_PREFIX: &str = "app_cache_";

/// Window inside which two messages with the same author and content are
/// treated as one logical message (milliseconds)
pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 10_000;

/// Interval between subscription health checks in seconds
pub const DEFAULT_HEALTH_CHECK_SECS: u64 = 30;

/// Recently-seen message ids tracked per subscription before trimming
pub const SEEN_IDS_MAX: usize = 1000;

/// Recently-seen message ids kept after a trim
pub const SEEN_IDS_RETAIN: usize = 500;

/// Default page size for remote history queries
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Messages kept in the local cache per room
pub const CACHED_MESSAGES_PER_ROOM: usize = 500;

/// Length of the numeric room access code
pub const ACCESS_CODE_LEN: usize = 6;

/// Emoji given to a recent-room entry when none is chosen
pub const DEFAULT_ROOM_EMOJI: &str = "💬";

/// Nickname shown on synthetic system entries
pub const SYSTEM_NICKNAME: &str = "system";
