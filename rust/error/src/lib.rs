// Defines a set of standard error codes based on the error codes defined in the
// gRPC spec. https://grpc.github.io/grpc/core/md_doc_statuscodes.html
// Custom errors can use these codes in order to allow for generic handling
use std::error::Error;

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ErrorCodes {
    // OK is returned on success, we use "Success" since Ok is a keyword in Rust.
    Success = 0,
    // CANCELLED indicates the operation was cancelled (typically by the caller).
    Cancelled = 1,
    // UNKNOWN indicates an unknown error.
    Unknown = 2,
    // INVALID_ARGUMENT indicates client specified an invalid argument.
    InvalidArgument = 3,
    // NOT_FOUND means some requested entity (e.g., a segment file) was not found.
    NotFound = 5,
    // ALREADY_EXISTS means an entity that we attempted to create already exists.
    AlreadyExists = 6,
    // RESOURCE_EXHAUSTED indicates some resource has been exhausted, here the
    // circuit-breaker memory budget.
    ResourceExhausted = 8,
    // FAILED_PRECONDITION indicates the operation was rejected because the system
    // is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    // ABORTED indicates the operation was aborted.
    Aborted = 10,
    // INTERNAL errors are internal errors.
    Internal = 13,
    // UNAVAILABLE indicates a subsystem is currently unavailable.
    Unavailable = 14,
    // DATA_LOSS indicates unrecoverable data loss or corruption.
    DataLoss = 15,
    // VERSION_MISMATCH indicates an on-disk format version this build does not
    // understand. This is not from the gRPC spec and is specific to Tephra.
    VersionMismatch = 17,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::InvalidArgument => "InvalidArgumentError",
            ErrorCodes::NotFound => "NotFoundError",
            ErrorCodes::ResourceExhausted => "ResourceExhaustedError",
            ErrorCodes::DataLoss => "DataLossError",
            ErrorCodes::Internal => "InternalError",
            ErrorCodes::VersionMismatch => "VersionMismatchError",
            _ => "TephraError",
        }
    }
}

pub trait TephraError: Error + Send {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn TephraError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
    fn should_trace_error(&self) -> bool {
        true
    }
}

impl Error for Box<dyn TephraError> {}

impl TephraError for Box<dyn TephraError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }
}

impl TephraError for std::io::Error {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Internal
    }
}
