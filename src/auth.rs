use crate::error::{AppdownError, Challenge, Result};
use crate::failure::{classify, Failure};
use crate::plist_ext::{self, dict_of, string_of};
use crate::protocol::{PlistResponse, StoreHttp, STOREFRONT_RESPONSE_HEADER};
use crate::session::{Identity, Session};
use plist::{Dictionary, Value};

const MAX_AUTH_REDIRECTS: usize = 3;
const ATTEMPT_WITH_CODE: &str = "2";
const ATTEMPT_WITHOUT_CODE: &str = "4";

/// Result of a login handshake that reached the backend.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// Signed in. The session may still lack a token when the store answered
    /// 200 without account data; check [`Session::ensure_valid`].
    Authenticated(Session),
    /// Call again with the same credentials once the challenge is satisfied.
    ChallengeRequired(Challenge),
}

impl AuthOutcome {
    pub fn into_session(self) -> Result<Session> {
        match self {
            AuthOutcome::Authenticated(session) => Ok(session),
            AuthOutcome::ChallengeRequired(challenge) => {
                Err(AppdownError::ChallengeRequired(challenge))
            }
        }
    }
}

#[derive(Clone)]
pub struct AuthClient {
    http: StoreHttp,
}

impl AuthClient {
    pub fn new(http: StoreHttp) -> Self {
        Self { http }
    }

    /// Run the login handshake. A second-factor code, when given, is appended
    /// to the password the way the store expects.
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
        code: Option<&str>,
    ) -> Result<AuthOutcome> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(AppdownError::InvalidInput(
                "email and password are required".to_string(),
            ));
        }
        let code = code.map(str::trim).filter(|c| !c.is_empty());

        let guid = self.http.guid().to_string();
        let body = login_body(email, password, code, &guid);
        let url = format!("{}?guid={}", self.http.config().endpoints.auth, guid);

        tracing::info!(account = %email, with_code = code.is_some(), "signing in");
        let response = self
            .http
            .post_plist_following(&url, &[], &body, MAX_AUTH_REDIRECTS)
            .await?;

        let outcome = parse_login(
            &response,
            email,
            code.is_some(),
            &self.http.config().default_storefront,
        )?;

        match outcome {
            AuthOutcome::Authenticated(mut session) => {
                session.refresh_cookies(self.http.cookie_snapshot());
                if session.identity().has_token() {
                    tracing::info!(account = %email, "signed in");
                } else {
                    tracing::warn!(account = %email, "login succeeded without account data");
                }
                Ok(AuthOutcome::Authenticated(session))
            }
            other => Ok(other),
        }
    }
}

fn login_body(email: &str, password: &str, code: Option<&str>, guid: &str) -> Dictionary {
    let (attempt, secret) = match code {
        Some(code) => (ATTEMPT_WITH_CODE, format!("{}{}", password, code)),
        None => (ATTEMPT_WITHOUT_CODE, password.to_string()),
    };
    let mut body = Dictionary::new();
    body.insert("appleId".into(), Value::String(email.to_string()));
    body.insert("attempt".into(), Value::String(attempt.to_string()));
    body.insert("createSession".into(), Value::String("true".to_string()));
    body.insert("guid".into(), Value::String(guid.to_string()));
    body.insert("password".into(), Value::String(secret));
    body.insert("rmp".into(), Value::String("0".to_string()));
    body.insert("why".into(), Value::String("signIn".to_string()));
    body
}

fn parse_login(
    response: &PlistResponse,
    email: &str,
    code_supplied: bool,
    default_storefront: &str,
) -> Result<AuthOutcome> {
    let message = response.string("customerMessage");
    match classify(response.string("failureType"), message, code_supplied) {
        Some(Failure::CodeRequired) => {
            tracing::info!(account = %email, "verification code required");
            return Ok(AuthOutcome::ChallengeRequired(Challenge::VerificationCode));
        }
        Some(Failure::AntiAutomation) => {
            tracing::warn!(account = %email, "store answered with an anti-automation challenge");
            return Ok(AuthOutcome::ChallengeRequired(Challenge::AntiAutomation));
        }
        Some(failure) => return Err(failure.into_error("login", "", message)),
        None => {}
    }
    if !response.is_success() {
        return Err(AppdownError::HttpStatus {
            status: response.status,
            endpoint: "login".to_string(),
        });
    }

    let body = &response.body;
    let info = dict_of(body, "accountInfo");
    let address = info.and_then(|i| dict_of(i, "address"));
    let info_string = |keys: &[&str]| info.and_then(|i| string_of(i, keys));
    let address_string = |key: &str| address.and_then(|a| string_of(a, &[key]));

    let storefront = response
        .header(STOREFRONT_RESPONSE_HEADER)
        .map(str::to_string)
        .or_else(|| info_string(&["storeFront", "storefront"]))
        .unwrap_or_else(|| default_storefront.to_string());

    let identity = Identity {
        email: info_string(&["appleId"]).unwrap_or_else(|| email.to_string()),
        first_name: address_string("firstName").unwrap_or_default(),
        last_name: address_string("lastName").unwrap_or_default(),
        dsid: plist_ext::account_id(body).unwrap_or_default(),
        country_code: info_string(&["countryCode"]).unwrap_or_else(|| "US".to_string()),
        storefront,
        password_token: string_of(body, &["passwordToken"]).unwrap_or_default(),
        session_token: string_of(body, &["clearToken"]).unwrap_or_default(),
        cookies: Vec::new(),
    };
    Ok(AuthOutcome::Authenticated(Session::new(identity)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn response(status: u16, pairs: Vec<(&str, Value)>) -> PlistResponse {
        PlistResponse {
            status,
            headers: HeaderMap::new(),
            body: pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    #[test]
    fn body_appends_code_and_lowers_attempt() {
        let body = login_body("a@example.com", "hunter2", Some("123456"), "A483E701020F");
        assert_eq!(body.get("password").and_then(Value::as_string), Some("hunter2123456"));
        assert_eq!(body.get("attempt").and_then(Value::as_string), Some("2"));

        let body = login_body("a@example.com", "hunter2", None, "A483E701020F");
        assert_eq!(body.get("password").and_then(Value::as_string), Some("hunter2"));
        assert_eq!(body.get("attempt").and_then(Value::as_string), Some("4"));
        for key in ["appleId", "createSession", "guid", "rmp", "why"] {
            assert!(body.contains_key(key), "{}", key);
        }
    }

    #[test]
    fn parses_identity_from_nested_account_info() {
        let mut address = Dictionary::new();
        address.insert("firstName".into(), s("Ada"));
        address.insert("lastName".into(), s("Lovelace"));
        let mut info = Dictionary::new();
        info.insert("appleId".into(), s("ada@example.com"));
        info.insert("dsPersonId".into(), Value::Integer(9001.into()));
        info.insert("countryCode".into(), s("GB"));
        info.insert("address".into(), Value::Dictionary(address));

        let mut resp = response(
            200,
            vec![
                ("passwordToken", s("tok")),
                ("accountInfo", Value::Dictionary(info)),
            ],
        );
        resp.headers.insert(
            STOREFRONT_RESPONSE_HEADER,
            HeaderValue::from_static("143444-2,29"),
        );

        let session = parse_login(&resp, "ada@example.com", false, "143441-1,29")
            .unwrap()
            .into_session()
            .unwrap();
        let id = session.identity();
        assert_eq!(id.dsid, "9001");
        assert_eq!(id.display_name(), "Ada Lovelace");
        assert_eq!(id.country_code, "GB");
        assert_eq!(id.storefront, "143444-2,29");
        assert!(session.ensure_valid().is_ok());
    }

    #[test]
    fn empty_success_is_a_session_without_token() {
        let session = parse_login(&response(200, vec![]), "a@example.com", false, "143441-1,29")
            .unwrap()
            .into_session()
            .unwrap();
        assert!(!session.identity().has_token());
        assert_eq!(session.identity().storefront, "143441-1,29");
    }

    #[test]
    fn anti_automation_is_soft_challenge() {
        let resp = response(200, vec![("customerMessage", s("AMD-Action:authenticate"))]);
        let outcome = parse_login(&resp, "a@example.com", false, "143441-1,29").unwrap();
        assert!(matches!(
            outcome,
            AuthOutcome::ChallengeRequired(Challenge::AntiAutomation)
        ));
    }

    #[test]
    fn bad_credentials_are_rejected() {
        let resp = response(
            200,
            vec![
                ("failureType", s("-5000")),
                ("customerMessage", s("Your Apple ID or password was entered incorrectly.")),
            ],
        );
        let err = parse_login(&resp, "a@example.com", false, "143441-1,29").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationRejected);
    }
}
