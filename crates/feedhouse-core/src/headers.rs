//! Standard attribute names understood by the relay.
//!
//! Senders supply most of these as HTTP headers; the receiver stamps the rest.

pub const FEED: &str = "Feed";
pub const TYPE: &str = "Type";
pub const COMPRESSION: &str = "Compression";
pub const GUID: &str = "GUID";
pub const RECEIPT_ID: &str = "ReceiptId";
pub const RECEIVED_TIME: &str = "ReceivedTime";
pub const RECEIVED_TIME_HISTORY: &str = "ReceivedTimeHistory";
pub const EFFECTIVE_TIME: &str = "EffectiveTime";
pub const REMOTE_ADDRESS: &str = "RemoteAddress";
pub const REMOTE_HOST: &str = "RemoteHost";
pub const RECEIVED_PATH: &str = "ReceivedPath";
pub const OVERRIDE_EMBEDDED_META: &str = "OverrideEmbeddedMeta";

/// Aggregate statistics added to forwarded output.
pub const ITEM_COUNT: &str = "ItemCount";
pub const UNCOMPRESSED_SIZE: &str = "UncompressedByteSize";

/// Response header carrying the numeric feed status code.
pub const FEED_STATUS: &str = "Feed-Status";

pub const COMPRESSION_ZIP: &str = "ZIP";
pub const COMPRESSION_GZIP: &str = "GZIP";
pub const COMPRESSION_NONE: &str = "NONE";

/// Keys whose values are normalised to ISO-8601 on insert.
pub const DATE_KEYS: &[&str] = &[EFFECTIVE_TIME, RECEIVED_TIME];

/// Request headers never copied into an attribute map.
pub const EXCLUDED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "authorization",
    "cookie",
    "expect",
];

pub fn is_date_key(key: &str) -> bool {
    DATE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key.trim()))
}

pub fn is_excluded_header(name: &str) -> bool {
    EXCLUDED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}
