//! Classification of AWS SDK errors by their error code.

use aws_sdk_ec2::error::ProvideErrorMetadata;

/// Error codes meaning the requested resource does not exist
const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchEntity",
    "InvalidInstanceID.NotFound",
    "InvalidAMIID.NotFound",
    "InvalidSnapshot.NotFound",
    "ResourceNotFoundException",
];

/// Error codes meaning the resource being created already exists
const ALREADY_EXISTS_CODES: &[&str] = &["EntityAlreadyExists", "InvalidGroup.Duplicate"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Other,
}

pub fn classify_code(code: Option<&str>) -> ErrorKind {
    match code {
        Some(code) if NOT_FOUND_CODES.contains(&code) => ErrorKind::NotFound,
        Some(code) if ALREADY_EXISTS_CODES.contains(&code) => ErrorKind::AlreadyExists,
        _ => ErrorKind::Other,
    }
}

/// Classify any SDK error, this works for errors from every AWS service client.
pub fn classify<E: ProvideErrorMetadata>(err: &E) -> ErrorKind {
    classify_code(err.code())
}

pub fn is_not_found<E: ProvideErrorMetadata>(err: &E) -> bool {
    classify(err) == ErrorKind::NotFound
}

pub fn is_already_exists<E: ProvideErrorMetadata>(err: &E) -> bool {
    classify(err) == ErrorKind::AlreadyExists
}
