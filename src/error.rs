use std::fmt;

use crate::types::PlatformKey;

/// Errors surfaced by the persistent store.
///
/// Infrastructure failures are propagated to the caller of a batch pass;
/// individual job state is left unchanged so a later pass can retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    Unavailable(String),

    /// A query or update failed.
    Query(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) =>
                write!(f, "store unavailable: {msg}"),
            StoreError::Query(msg) =>
                write!(f, "store query failed: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from resolving destination credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The encrypted blob could not be decrypted.
    DecryptFailed(String),

    /// Decryption succeeded but required fields are missing or malformed.
    Invalid(String),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::DecryptFailed(msg) =>
                write!(f, "credential decryption failed: {msg}"),
            CredentialError::Invalid(msg) =>
                write!(f, "invalid credentials: {msg}"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Whether a destination send failure is worth retrying.
///
/// Every adapter error is retryable unless the adapter marks it permanent
/// (bad credentials, payload validation rejection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

/// A failed send to a single destination.
///
/// Recorded per-destination; it does not by itself fail the job when
/// another destination succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub class: ErrorClass,
    pub status_code: Option<u16>,
    pub message: String,
}

impl SendFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (status {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for SendFailure {}

/// Errors returned by pipeline entry points before any delivery begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The order event failed validation at the queue-write boundary.
    InvalidEvent(String),

    /// A destination adapter was referenced but never registered.
    UnknownPlatform {
        platform: PlatformKey,
    },

    /// The persistent store failed.
    Store(StoreError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InvalidEvent(msg) =>
                write!(f, "invalid order event: {msg}"),
            PipelineError::UnknownPlatform { platform } =>
                write!(f, "platform not registered: {platform}"),
            PipelineError::Store(err) =>
                write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Store(err)
    }
}
