use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive as _, ToPrimitive as _};

/// The standard RPC status codes carried in the `grpc-status` trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// The decimal ASCII form used on the wire, e.g. `"0"` or `"5"`.
    #[must_use]
    pub fn as_trailer(self) -> String {
        // unwrap: StatusCode is repr(u32)
        self.to_u32().unwrap().to_string()
    }

    #[must_use]
    pub fn from_trailer(value: &str) -> Option<Self> {
        value.parse().ok().and_then(Self::from_u32)
    }
}

/// An application-level RPC failure. Recovered locally: the code and
/// message land in the response trailers and the stream stays healthy.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("rpc failed with status {code:?}: {message}")]
pub struct BadStatus {
    pub code: StatusCode,
    pub message: String,
}

impl BadStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_form() {
        assert_eq!(StatusCode::Ok.as_trailer(), "0");
        assert_eq!(StatusCode::NotFound.as_trailer(), "5");
        assert_eq!(StatusCode::Unauthenticated.as_trailer(), "16");
        assert_eq!(StatusCode::from_trailer("7"), Some(StatusCode::PermissionDenied));
        assert_eq!(StatusCode::from_trailer("17"), None);
        assert_eq!(StatusCode::from_trailer("nope"), None);
    }
}
