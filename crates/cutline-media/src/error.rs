// crates/cutline-media/src/error.rs
//
// The typed error surface of the engine.
//
// Two tiers:
//   • Public APIs return `Result<T, Error>` — categorised, matchable.
//   • Worker threads use `anyhow::Result` internally for context chains;
//     a failure is parked into the owning object's `last_error` string and
//     surfaced as `Error::Worker` on the next read. Workers never panic
//     across the thread boundary.

use thiserror::Error;

use ffmpeg_the_third as ffmpeg;

#[derive(Error, Debug)]
pub enum Error {
    /// Arithmetic violation of an entity invariant — negative offsets,
    /// duration ≤ 0, index out of range, a duplicated pair. Rejected at the
    /// API boundary with no state mutation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("media is not opened")]
    NotOpened,

    #[error("component is not configured")]
    NotConfigured,

    #[error("component is not started")]
    NotStarted,

    #[error("reader is suspended")]
    Suspended,

    /// A codec-library call returned an error; `api` names the call.
    #[error("{api} failed: {source}")]
    Ffmpeg {
        api: &'static str,
        #[source]
        source: ffmpeg::Error,
    },

    /// A worker thread parked this failure; the triggering read surfaces it.
    #[error("worker failed: {0}")]
    Worker(String),

    #[error("end of stream")]
    Eof,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

/// Wrap a codec-library error with the failing API's name.
pub(crate) fn ff(api: &'static str, source: ffmpeg::Error) -> Error {
    Error::Ffmpeg { api, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_error_names_the_api() {
        let e = ff("avformat_open_input", ffmpeg::Error::InvalidData);
        assert!(e.to_string().contains("avformat_open_input"));
    }

    #[test]
    fn invalid_argument_carries_message() {
        let e = Error::invalid("start_offset must be >= 0");
        assert!(matches!(e, Error::InvalidArgument(_)));
        assert!(e.to_string().contains("start_offset"));
    }
}
