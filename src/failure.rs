use crate::error::{AppdownError, Challenge};

const BAD_LOGIN_MESSAGE: &str = "MZFinance.BadLogin.Configurator_message";
const CODE_REQUIRED_MESSAGE: &str = "verification code is required";
const ANTI_AUTOMATION_MARKER: &str = "AMD-Action";
const ACCOUNT_DISABLED_MESSAGE: &str = "Your account is disabled";
const ALREADY_OWNED_MESSAGE: &str = "already own";

/// A backend failure signal after classification.
///
/// Built only by [`classify`]; the rest of the crate matches on this instead of
/// the raw `failureType` / `customerMessage` strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    CodeRequired,
    AntiAutomation,
    InvalidCredentials,
    AccountNotFound,
    AccountLocked,
    TokenExpired,
    LicenseNotFound,
    TemporarilyUnavailable,
    /// Purchase of an app the account already holds a license for.
    AlreadyOwned,
    Unrecognized(String),
}

impl Failure {
    /// Map onto the crate error taxonomy. `context` names the call that failed,
    /// `app_id` is used for licensing errors.
    pub fn into_error(self, context: &str, app_id: &str, message: Option<&str>) -> AppdownError {
        let detail = message
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string);
        match self {
            Failure::CodeRequired => AppdownError::ChallengeRequired(Challenge::VerificationCode),
            Failure::AntiAutomation => AppdownError::ChallengeRequired(Challenge::AntiAutomation),
            Failure::InvalidCredentials => AppdownError::AuthenticationRejected(
                detail.unwrap_or_else(|| "invalid Apple ID or password".to_string()),
            ),
            Failure::AccountNotFound => AppdownError::AuthenticationRejected(
                detail.unwrap_or_else(|| "account not found".to_string()),
            ),
            Failure::AccountLocked => AppdownError::AuthenticationRejected(
                detail.unwrap_or_else(|| "account is locked or disabled".to_string()),
            ),
            Failure::TokenExpired => AppdownError::SessionInvalid,
            Failure::LicenseNotFound => AppdownError::NotLicensed {
                app_id: app_id.to_string(),
            },
            Failure::TemporarilyUnavailable => AppdownError::ArtifactNotFound(format!(
                "{} is temporarily unavailable",
                app_id
            )),
            Failure::AlreadyOwned => AppdownError::InvalidResponse(format!(
                "{} reported {} as already owned",
                context, app_id
            )),
            Failure::Unrecognized(code) => AppdownError::InvalidResponse(match detail {
                Some(msg) => format!("{} failed ({}): {}", context, code, msg),
                None => format!("{} failed ({})", context, code),
            }),
        }
    }
}

/// Classify the raw failure fields of a store response.
///
/// Message signals are checked before `failureType` because the backend
/// reports a missing second factor with a generic failure type. The bad-login
/// message means "code required" only when no code was sent; with a code it
/// means the password or the code was wrong.
pub fn classify(
    failure_type: Option<&str>,
    customer_message: Option<&str>,
    code_supplied: bool,
) -> Option<Failure> {
    let failure_type = failure_type.map(str::trim).filter(|s| !s.is_empty());
    let message = customer_message.map(str::trim).filter(|s| !s.is_empty());

    if let Some(msg) = message {
        if msg == BAD_LOGIN_MESSAGE || msg.contains(CODE_REQUIRED_MESSAGE) {
            return Some(if code_supplied {
                Failure::InvalidCredentials
            } else {
                Failure::CodeRequired
            });
        }
        if msg.contains(ANTI_AUTOMATION_MARKER) {
            return Some(Failure::AntiAutomation);
        }
        if msg.contains(ACCOUNT_DISABLED_MESSAGE) {
            return Some(Failure::AccountLocked);
        }
        if msg.contains(ALREADY_OWNED_MESSAGE) {
            return Some(Failure::AlreadyOwned);
        }
    }

    let code = failure_type?;
    Some(match code {
        "-5000" | "invalidCredentials" | "authenticationFailed" => Failure::InvalidCredentials,
        "accountNotFound" => Failure::AccountNotFound,
        "lockedAccount" => Failure::AccountLocked,
        "codeRequired" => {
            if code_supplied {
                Failure::InvalidCredentials
            } else {
                Failure::CodeRequired
            }
        }
        "2034" | "2042" => Failure::TokenExpired,
        "9610" => Failure::LicenseNotFound,
        "2059" => Failure::TemporarilyUnavailable,
        other => Failure::Unrecognized(other.to_string()),
    })
}
