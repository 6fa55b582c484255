use crate::error::{AppdownError, Result};
use crate::failure::{classify, Failure};
use crate::plist_ext::{as_u64, dict_of, integer_of, integers_of, string_of};
use crate::protocol::{account_headers, PlistResponse, StoreHttp};
use crate::session::Session;
use plist::{Dictionary, Value};

pub const BUNDLE_ID_KEYS: &[&str] = &["softwareVersionBundleId", "bundle-identifier"];
pub const DISPLAY_NAME_KEYS: &[&str] = &["bundleDisplayName", "itemName", "item-name"];
pub const SHORT_VERSION_KEYS: &[&str] = &["bundleShortVersionString", "bundle-short-version-string"];
pub const BUILD_ID_KEYS: &[&str] = &["softwareVersionExternalIdentifier", "external-version-id"];
pub const HISTORY_KEYS: &[&str] = &["softwareVersionExternalIdentifiers", "external-version-ids"];

const DOWNLOAD_PATH: &str = "/WebObjects/MZFinance.woa/wa/volumeStoreDownloadProduct";

/// Per-architecture signature blob that ships next to the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sinf {
    pub id: u64,
    pub data: Vec<u8>,
}

/// One-shot grant to fetch a single binary. The URL expires; a new ticket
/// must be acquired instead of retrying an old one.
#[derive(Debug, Clone)]
pub struct DownloadTicket {
    pub app_id: String,
    pub url: String,
    /// Hex digest declared by the store (MD5)
    pub checksum: String,
    pub sinfs: Vec<Sinf>,
    pub bundle_id: String,
    pub display_name: String,
    pub version: Option<String>,
    pub build_id: Option<u64>,
    pub historical_ids: Vec<u64>,
    /// The entry's metadata map as received
    pub metadata: Dictionary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseResult {
    pub app_id: String,
    pub already_owned: bool,
    pub doc_type: Option<String>,
}

/// Talks to the ticket and purchase endpoints on behalf of a session.
#[derive(Clone)]
pub struct AcquisitionClient {
    http: StoreHttp,
}

impl AcquisitionClient {
    pub fn new(http: StoreHttp) -> Self {
        Self { http }
    }

    /// Request a download ticket. `build_id` selects a historical build;
    /// `None` lets the store pick the current one.
    pub async fn acquire(
        &self,
        app_id: &str,
        build_id: Option<&str>,
        session: &Session,
    ) -> Result<DownloadTicket> {
        let identity = session.ensure_valid()?;
        let config = self.http.config();
        let guid = self.http.guid().to_string();

        let mut body = Dictionary::new();
        body.insert("creditDisplay".into(), Value::String(String::new()));
        body.insert("guid".into(), Value::String(guid.clone()));
        body.insert("salableAdamId".into(), Value::String(app_id.to_string()));
        if let Some(build) = build_id.map(str::trim).filter(|b| !b.is_empty()) {
            let value = match build.parse::<u64>() {
                Ok(n) => Value::Integer(n.into()),
                Err(_) => Value::String(build.to_string()),
            };
            body.insert("externalVersionId".into(), value);
        }

        let url = format!("{}{}?guid={}", config.endpoints.store, DOWNLOAD_PATH, guid);
        let headers = account_headers(identity, &config.default_storefront);
        tracing::info!(app_id, build_id = build_id.unwrap_or("current"), "requesting download ticket");
        let response = self.http.post_plist(&url, &headers, &body).await?;

        parse_ticket_response(&response, app_id).map_err(|e| {
            if e.invalidates_session() {
                session.invalidate();
            }
            e
        })
    }

    /// Obtain a license for a free app. Succeeds when the store grants one
    /// or reports the app as already owned.
    pub async fn purchase_if_needed(&self, app_id: &str, session: &Session) -> Result<LicenseResult> {
        let identity = session.ensure_valid()?;
        let config = self.http.config();

        let mut body = Dictionary::new();
        body.insert("appExtVrsId".into(), Value::String("0".into()));
        body.insert("dsPersonId".into(), Value::String(identity.dsid.clone()));
        body.insert("guid".into(), Value::String(self.http.guid().to_string()));
        body.insert("passwordToken".into(), Value::String(identity.password_token.clone()));
        body.insert("price".into(), Value::String("0".into()));
        body.insert("pricingParameters".into(), Value::String("STDQ".into()));
        body.insert("productType".into(), Value::String("C".into()));
        body.insert("salableAdamId".into(), Value::String(app_id.to_string()));

        let headers = account_headers(identity, &config.default_storefront);
        tracing::info!(app_id, "acquiring free license");
        let response = self
            .http
            .post_plist(&config.endpoints.purchase, &headers, &body)
            .await?;

        parse_purchase_response(&response, app_id).map_err(|e| {
            if e.invalidates_session() {
                session.invalidate();
            }
            e
        })
    }
}

fn parse_ticket_response(response: &PlistResponse, app_id: &str) -> Result<DownloadTicket> {
    let message = response.string("customerMessage");
    if let Some(failure) = classify(response.string("failureType"), message, true) {
        return Err(failure.into_error("download", app_id, message));
    }
    if !response.is_success() {
        return Err(AppdownError::HttpStatus {
            status: response.status,
            endpoint: "volumeStoreDownloadProduct".into(),
        });
    }

    let entries = match response.body.get("songList") {
        None => &[][..],
        Some(Value::Array(items)) => items.as_slice(),
        Some(_) => {
            return Err(AppdownError::InvalidResponse(
                "songList is not an array".to_string(),
            ))
        }
    };
    let entry = match entries.first() {
        None => {
            tracing::info!(app_id, "no download entries, app is not licensed");
            return Err(AppdownError::NotLicensed {
                app_id: app_id.to_string(),
            });
        }
        Some(entry) => entry.as_dictionary().ok_or_else(|| {
            AppdownError::InvalidResponse("download entry is not a dictionary".to_string())
        })?,
    };
    parse_entry(entry, app_id)
}

fn parse_entry(entry: &Dictionary, app_id: &str) -> Result<DownloadTicket> {
    let url = string_of(entry, &["URL"])
        .ok_or_else(|| AppdownError::InvalidResponse("download entry has no URL".to_string()))?;
    let checksum = string_of(entry, &["md5"]).ok_or_else(|| {
        AppdownError::InvalidResponse("download entry has no checksum".to_string())
    })?;

    let sinfs = entry
        .get("sinfs")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_dictionary)
                .filter_map(|item| {
                    let data = item.get("sinf")?.as_data()?.to_vec();
                    let id = item.get("id").and_then(as_u64).unwrap_or(0);
                    Some(Sinf { id, data })
                })
                .collect()
        })
        .unwrap_or_default();

    let metadata = dict_of(entry, "metadata").cloned().unwrap_or_default();
    let bundle_id = string_of(&metadata, BUNDLE_ID_KEYS).unwrap_or_default();
    let display_name = string_of(&metadata, DISPLAY_NAME_KEYS)
        .unwrap_or_else(|| bundle_id.clone());

    Ok(DownloadTicket {
        app_id: app_id.to_string(),
        url,
        checksum,
        sinfs,
        display_name,
        version: string_of(&metadata, SHORT_VERSION_KEYS),
        build_id: integer_of(&metadata, BUILD_ID_KEYS),
        historical_ids: integers_of(&metadata, HISTORY_KEYS).unwrap_or_default(),
        bundle_id,
        metadata,
    })
}

fn parse_purchase_response(response: &PlistResponse, app_id: &str) -> Result<LicenseResult> {
    let message = response.string("customerMessage");
    let doc_type = response.string("jingleDocType").map(str::to_string);
    match classify(response.string("failureType"), message, true) {
        Some(Failure::AlreadyOwned) => {
            tracing::info!(app_id, "license already owned");
            return Ok(LicenseResult {
                app_id: app_id.to_string(),
                already_owned: true,
                doc_type,
            });
        }
        Some(failure) => return Err(failure.into_error("purchase", app_id, message)),
        None => {}
    }
    if !response.is_success() {
        return Err(AppdownError::HttpStatus {
            status: response.status,
            endpoint: "buyProduct".into(),
        });
    }
    if let Some(kind) = doc_type.as_deref() {
        if kind != "purchaseSuccess" {
            return Err(AppdownError::InvalidResponse(format!(
                "purchase returned {}",
                kind
            )));
        }
    }
    tracing::info!(app_id, "license acquired");
    Ok(LicenseResult {
        app_id: app_id.to_string(),
        already_owned: false,
        doc_type,
    })
}
