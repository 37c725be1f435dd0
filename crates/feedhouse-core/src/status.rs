//! Feed status taxonomy returned to submitters.

use std::fmt;

/// Outcome of an ingestion request.
///
/// Each status carries the HTTP status line sent back and a stable numeric code
/// written to the `Feed-Status` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedStatus {
    Ok,
    FeedMustBeSpecified,
    UnexpectedDataType,
    UnknownCompression,
    CompressedStreamInvalid,
    UnknownError,
}

impl FeedStatus {
    pub fn http_code(&self) -> u16 {
        match self {
            FeedStatus::Ok => 200,
            FeedStatus::FeedMustBeSpecified
            | FeedStatus::UnexpectedDataType
            | FeedStatus::UnknownCompression => 406,
            FeedStatus::CompressedStreamInvalid => 400,
            FeedStatus::UnknownError => 500,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            FeedStatus::Ok => 0,
            FeedStatus::FeedMustBeSpecified => 100,
            FeedStatus::UnexpectedDataType => 120,
            FeedStatus::UnknownCompression => 200,
            FeedStatus::CompressedStreamInvalid => 400,
            FeedStatus::UnknownError => 999,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            FeedStatus::Ok => "OK",
            FeedStatus::FeedMustBeSpecified => "Feed must be specified",
            FeedStatus::UnexpectedDataType => "Unexpected data type",
            FeedStatus::UnknownCompression => "Unknown compression",
            FeedStatus::CompressedStreamInvalid => "Compressed stream invalid",
            FeedStatus::UnknownError => "Unknown error",
        }
    }

    /// Label used for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            FeedStatus::Ok => "ok",
            FeedStatus::FeedMustBeSpecified => "feed_must_be_specified",
            FeedStatus::UnexpectedDataType => "unexpected_data_type",
            FeedStatus::UnknownCompression => "unknown_compression",
            FeedStatus::CompressedStreamInvalid => "compressed_stream_invalid",
            FeedStatus::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.code(), self.message())
    }
}
