use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The closed set of outcomes every public operation can fail with.
///
/// Callers branch on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NetworkUnavailable,
    InvalidServerResponse,
    ChallengeRequired,
    AuthenticationRejected,
    NotLicensed,
    ArtifactNotFound,
    IntegrityMismatch,
    TransferInterrupted,
    Cancelled,
    PackagingDegraded,
    /// Local machine failures: filesystem, user input, credential storage.
    Local,
}

/// What the backend wants before it will issue a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Challenge {
    /// A second-factor code must be appended to the password.
    VerificationCode,
    /// The backend answered with an anti-automation page and no account data.
    /// Retrying the login later usually clears it.
    AntiAutomation,
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Challenge::VerificationCode => f.write_str("a verification code is required"),
            Challenge::AntiAutomation => f.write_str("the store asked for an anti-automation check"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppdownError {
    #[error("Network unavailable: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Unexpected server response: {0}")]
    InvalidResponse(String),

    #[error("HTTP {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },

    #[error("Challenge required: {0}")]
    ChallengeRequired(Challenge),

    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("Session is no longer valid, log in again")]
    SessionInvalid,

    #[error("App {app_id} is not licensed for this account")]
    NotLicensed { app_id: String },

    #[error("Nothing found for {0}")]
    ArtifactNotFound(String),

    #[error("Checksum mismatch: expected {expected}, got {computed}")]
    IntegrityMismatch { expected: String, computed: String },

    #[error("Transfer interrupted after {transferred} bytes: {reason}")]
    TransferInterrupted { transferred: u64, reason: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Metadata could not be written: {0}")]
    PackagingDegraded(String),

    #[error("Invalid IPA: {0}")]
    InvalidIpa(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Credential store error: {0}")]
    CredentialStore(String),
}

impl AppdownError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppdownError::Network(_) | AppdownError::Timeout(_) => ErrorKind::NetworkUnavailable,
            AppdownError::HttpStatus { status, .. } if *status >= 500 => {
                ErrorKind::NetworkUnavailable
            }
            AppdownError::InvalidResponse(_)
            | AppdownError::HttpStatus { .. }
            | AppdownError::InvalidIpa(_)
            | AppdownError::Plist(_) => ErrorKind::InvalidServerResponse,
            AppdownError::ChallengeRequired(_) => ErrorKind::ChallengeRequired,
            AppdownError::AuthenticationRejected(_) | AppdownError::SessionInvalid => {
                ErrorKind::AuthenticationRejected
            }
            AppdownError::NotLicensed { .. } => ErrorKind::NotLicensed,
            AppdownError::ArtifactNotFound(_) => ErrorKind::ArtifactNotFound,
            AppdownError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            AppdownError::TransferInterrupted { .. } => ErrorKind::TransferInterrupted,
            AppdownError::Cancelled => ErrorKind::Cancelled,
            AppdownError::PackagingDegraded(_) => ErrorKind::PackagingDegraded,
            AppdownError::Io(_)
            | AppdownError::Zip(_)
            | AppdownError::Json(_)
            | AppdownError::FileNotFound(_)
            | AppdownError::InvalidInput(_)
            | AppdownError::Config(_)
            | AppdownError::CredentialStore(_) => ErrorKind::Local,
        }
    }

    /// Whether repeating the same operation may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NetworkUnavailable
                | ErrorKind::TransferInterrupted
                | ErrorKind::IntegrityMismatch
        )
    }

    /// Whether the backend no longer accepts the session that made the call.
    pub fn invalidates_session(&self) -> bool {
        self.kind() == ErrorKind::AuthenticationRejected
    }
}

impl From<reqwest::Error> for AppdownError {
    fn from(err: reqwest::Error) -> Self {
        let endpoint = err
            .url()
            .map(|u| u.path().to_string())
            .unwrap_or_default();
        if err.is_timeout() {
            AppdownError::Timeout(endpoint)
        } else if let Some(status) = err.status() {
            AppdownError::HttpStatus {
                status: status.as_u16(),
                endpoint,
            }
        } else if err.is_decode() {
            AppdownError::InvalidResponse(err.to_string())
        } else {
            AppdownError::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, AppdownError>;
