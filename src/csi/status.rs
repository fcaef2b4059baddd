//! gRPC status mapping

use crate::error::{Error, ErrorKind};
use tonic::{Code, Status};

/// gRPC code reported for an error kind
pub fn code_for(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::InvalidArgument => Code::InvalidArgument,
        ErrorKind::FailedPrecondition | ErrorKind::Busy => Code::FailedPrecondition,
        ErrorKind::ResourceExhausted => Code::ResourceExhausted,
        ErrorKind::OutOfRange => Code::OutOfRange,
        ErrorKind::NotFound => Code::NotFound,
        ErrorKind::AlreadyExists => Code::AlreadyExists,
        ErrorKind::Unimplemented => Code::Unimplemented,
        ErrorKind::Conflict => Code::Aborted,
        ErrorKind::Timeout => Code::DeadlineExceeded,
        _ => Code::Internal,
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        Status::new(code_for(e.kind()), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_codes() {
        let cases = [
            (Error::InvalidArgument("name missing".into()), Code::InvalidArgument),
            (Error::Busy { device: "/dev/sdb".into() }, Code::FailedPrecondition),
            (Error::ResourceExhausted("no topology".into()), Code::ResourceExhausted),
            (Error::OutOfRange("no capacity".into()), Code::OutOfRange),
            (Error::conflict("drive", "node1-abc"), Code::Aborted),
            (
                Error::Timeout {
                    operation: "mount".into(),
                    after: Duration::from_secs(300),
                },
                Code::DeadlineExceeded,
            ),
            (Error::Internal("boom".into()), Code::Internal),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn test_message_is_kept() {
        let status = Status::from(Error::not_found("volume", "pvc-1"));
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("pvc-1"));
    }
}
