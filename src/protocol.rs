use crate::config::Config;
use crate::device::Guid;
use crate::error::{AppdownError, Result};
use crate::plist_ext;
use crate::session::Identity;
use plist::Dictionary;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, CONTENT_TYPE, LOCATION};
use reqwest::redirect;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const PLIST_CONTENT_TYPE: &str = "application/x-apple-plist";
pub const STOREFRONT_RESPONSE_HEADER: &str = "x-set-apple-store-front";

/// A parsed property-list reply.
#[derive(Debug, Clone)]
pub struct PlistResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Dictionary,
}

impl PlistResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(|v| v.as_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Transport shared by every store client.
///
/// Holds one process-wide cookie jar used by two clients: an API client that
/// never follows redirects on its own, and a bulk client for artifacts and
/// the version-history service.
#[derive(Clone)]
pub struct StoreHttp {
    api: reqwest::Client,
    bulk: reqwest::Client,
    jar: Arc<Jar>,
    config: Arc<Config>,
    guid: Guid,
}

impl StoreHttp {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let guid = match config.guid.as_deref() {
            Some(raw) => Guid::parse(raw)
                .ok_or_else(|| AppdownError::Config(format!("invalid guid: {}", raw)))?,
            None => Guid::for_host(),
        };

        let jar = Arc::new(Jar::default());
        let api = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .cookie_provider(jar.clone())
            .redirect(redirect::Policy::none())
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AppdownError::Config(e.to_string()))?;

        let mut bulk = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .cookie_provider(jar.clone())
            .connect_timeout(config.connect_timeout());
        if let Some(timeout) = config.resource_timeout() {
            bulk = bulk.timeout(timeout);
        }
        let bulk = bulk
            .build()
            .map_err(|e| AppdownError::Config(e.to_string()))?;

        tracing::debug!(guid = %guid, "store transport ready");
        Ok(Self {
            api,
            bulk,
            jar,
            config: Arc::new(config),
            guid,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn bulk_client(&self) -> reqwest::Client {
        self.bulk.clone()
    }

    /// POST a property-list body and parse the property-list reply.
    pub async fn post_plist(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &Dictionary,
    ) -> Result<PlistResponse> {
        let payload = plist_ext::to_xml_bytes(body)?;
        let mut request = self
            .api
            .post(url)
            .header(CONTENT_TYPE, PLIST_CONTENT_TYPE)
            .body(payload);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let bytes = response.bytes().await?;
        tracing::debug!(status, len = bytes.len(), "store response");

        let body = if bytes.iter().all(u8::is_ascii_whitespace) {
            Dictionary::new()
        } else {
            match plist_ext::from_bytes(&bytes) {
                Ok(body) => body,
                Err(_) if (300..400).contains(&status) => Dictionary::new(),
                Err(_) if !(200..300).contains(&status) => {
                    return Err(AppdownError::HttpStatus {
                        status,
                        endpoint: endpoint_name(url),
                    })
                }
                Err(e) => {
                    return Err(AppdownError::InvalidResponse(format!(
                        "{} returned a body that is not a property list: {}",
                        endpoint_name(url),
                        e
                    )))
                }
            }
        };

        Ok(PlistResponse {
            status,
            headers,
            body,
        })
    }

    /// [`post_plist`](Self::post_plist), re-posting the same body when the
    /// store redirects the account to another pod.
    pub async fn post_plist_following(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &Dictionary,
        max_redirects: usize,
    ) -> Result<PlistResponse> {
        let mut current = url.to_string();
        for _ in 0..=max_redirects {
            let response = self.post_plist(&current, headers, body).await?;
            if !matches!(response.status, 301 | 302 | 303 | 307 | 308) {
                return Ok(response);
            }
            let location = response
                .headers
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    AppdownError::InvalidResponse("redirect without a Location header".into())
                })?;
            let next = Url::parse(&current)
                .and_then(|base| base.join(location))
                .map_err(|e| AppdownError::InvalidResponse(format!("bad redirect target: {}", e)))?;
            tracing::debug!(to = %next.host_str().unwrap_or_default(), "following store redirect");
            current = next.to_string();
        }
        Err(AppdownError::InvalidResponse(format!(
            "more than {} redirects from {}",
            max_redirects,
            endpoint_name(url)
        )))
    }

    /// GET a JSON document with its own timeout. Unauthenticated.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, timeout: Duration) -> Result<T> {
        let response = self
            .bulk
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AppdownError::InvalidResponse(format!("{}: {}", endpoint_name(url), e)))
    }

    fn cookie_scopes(&self) -> Vec<Url> {
        let endpoints = &self.config.endpoints;
        [&endpoints.auth, &endpoints.store, &endpoints.purchase]
            .iter()
            .filter_map(|u| Url::parse(u).ok())
            .collect()
    }

    /// Current `name=value` cookies for the store endpoints.
    pub fn cookie_snapshot(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for scope in self.cookie_scopes() {
            let Some(header) = self.jar.cookies(&scope) else {
                continue;
            };
            let Ok(header) = header.to_str() else {
                continue;
            };
            for pair in header.split(';').map(str::trim).filter(|p| p.contains('=')) {
                if !out.iter().any(|c| c == pair) {
                    out.push(pair.to_string());
                }
            }
        }
        out
    }

    /// Put previously captured cookies back into the jar.
    pub fn restore_cookies(&self, cookies: &[String]) {
        let scopes = self.cookie_scopes();
        for cookie in cookies {
            let cookie = if cookie.contains(';') {
                cookie.clone()
            } else {
                format!("{}; Path=/", cookie)
            };
            for scope in &scopes {
                self.jar.add_cookie_str(&cookie, scope);
            }
        }
        tracing::debug!(count = cookies.len(), "restored store cookies");
    }
}

/// Headers that identify the account on authenticated calls.
pub fn account_headers(identity: &Identity, default_storefront: &str) -> Vec<(&'static str, String)> {
    let storefront = if identity.storefront.is_empty() {
        default_storefront.to_string()
    } else {
        identity.storefront.clone()
    };
    vec![
        ("X-Dsid", identity.dsid.clone()),
        ("iCloud-DSID", identity.dsid.clone()),
        ("X-Token", identity.password_token.clone()),
        ("X-Apple-Store-Front", storefront),
    ]
}

fn endpoint_name(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().rsplit('/').next().unwrap_or_default().to_string())
        .unwrap_or_else(|_| url.to_string())
}
