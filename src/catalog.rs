use crate::acquire::{AcquisitionClient, DownloadTicket};
use crate::error::{AppdownError, Result};
use crate::protocol::StoreHttp;
use crate::session::Session;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One historical build of an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildDescriptor {
    pub build_id: u64,
    /// Human version string, when a source provides one
    pub version: Option<String>,
    /// What to show for this build
    pub label: String,
    pub is_current: bool,
    pub released: Option<NaiveDateTime>,
}

/// A row from the version-history service.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionRecord {
    pub bundle_version: String,
    pub external_identifier: LenientId,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LenientId {
    Number(u64),
    Text(String),
}

impl LenientId {
    pub fn value(&self) -> Option<u64> {
        match self {
            LenientId::Number(n) => Some(*n),
            LenientId::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Lists the builds of an app, preferring the version-history service and
/// falling back to the ids the store reports with the current ticket.
#[derive(Clone)]
pub struct CatalogResolver {
    http: StoreHttp,
    acquisition: AcquisitionClient,
}

impl CatalogResolver {
    pub fn new(http: StoreHttp, acquisition: AcquisitionClient) -> Self {
        Self { http, acquisition }
    }

    /// Ordered builds for `app_id`, newest first. Without a session only the
    /// version-history service can answer.
    pub async fn resolve_versions(
        &self,
        app_id: &str,
        session: Option<&Session>,
    ) -> Result<Vec<BuildDescriptor>> {
        match self.fetch_history(app_id).await {
            Ok(records) if !records.is_empty() => {
                let builds = order_records(records);
                if !builds.is_empty() {
                    tracing::info!(app_id, count = builds.len(), "resolved builds from version history");
                    return Ok(builds);
                }
                tracing::info!(app_id, "version history had no usable records");
            }
            Ok(_) => tracing::info!(app_id, "version history is empty"),
            Err(e) => tracing::warn!(app_id, error = %e, "version history unavailable"),
        }

        let session = session.ok_or_else(|| {
            AppdownError::ArtifactNotFound(format!(
                "no version history for {} and no account to ask the store",
                app_id
            ))
        })?;
        let ticket = self.acquisition.acquire(app_id, None, session).await?;
        let builds = builds_from_ticket(&ticket, self.http.config().history_cap);
        if builds.is_empty() {
            return Err(AppdownError::ArtifactNotFound(format!(
                "the store listed no builds for {}",
                app_id
            )));
        }
        tracing::info!(app_id, count = builds.len(), "resolved builds from the store");
        Ok(builds)
    }

    async fn fetch_history(&self, app_id: &str) -> Result<Vec<VersionRecord>> {
        let config = self.http.config();
        let mut url = url::Url::parse(&config.endpoints.version_history)
            .map_err(|e| AppdownError::Config(e.to_string()))?;
        url.query_pairs_mut().append_pair("id", app_id);
        self.http
            .get_json(url.as_str(), config.enrichment_timeout())
            .await
    }
}

/// Sort history records newest first. Release dates decide when every record
/// has one that parses; otherwise the dotted version strings do.
pub fn order_records(records: Vec<VersionRecord>) -> Vec<BuildDescriptor> {
    let mut builds: Vec<BuildDescriptor> = records
        .into_iter()
        .filter_map(|record| {
            let Some(build_id) = record.external_identifier.value() else {
                tracing::warn!(
                    id = ?record.external_identifier,
                    version = %record.bundle_version,
                    "skipping history row without a numeric build id"
                );
                return None;
            };
            let version = record.bundle_version.trim().to_string();
            let released = record
                .created_at
                .as_deref()
                .and_then(|s| NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT).ok());
            Some(BuildDescriptor {
                build_id,
                label: if version.is_empty() {
                    format!("Build {}", build_id)
                } else {
                    version.clone()
                },
                version: (!version.is_empty()).then_some(version),
                is_current: false,
                released,
            })
        })
        .collect();

    let all_dated = builds.iter().all(|b| b.released.is_some());
    builds.sort_by(|a, b| {
        let by_version = || {
            compare_versions(
                b.version.as_deref().unwrap_or(""),
                a.version.as_deref().unwrap_or(""),
            )
            .then_with(|| b.build_id.cmp(&a.build_id))
        };
        if all_dated {
            b.released.cmp(&a.released).then_with(by_version)
        } else {
            by_version()
        }
    });

    if let Some(first) = builds.first_mut() {
        first.is_current = true;
    }
    builds
}

/// Compare dotted versions component by component; missing or non-numeric
/// components count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                let digits: String = part.trim().chars().take_while(char::is_ascii_digit).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Current build plus up to `cap` historical ids, newest first. The store
/// lists ids oldest first and gives no version strings for them.
pub fn builds_from_ticket(ticket: &DownloadTicket, cap: usize) -> Vec<BuildDescriptor> {
    let mut builds = Vec::with_capacity(cap + 1);
    if let Some(current) = ticket.build_id {
        builds.push(BuildDescriptor {
            build_id: current,
            label: ticket
                .version
                .clone()
                .unwrap_or_else(|| "Current build".to_string()),
            version: ticket.version.clone(),
            is_current: true,
            released: None,
        });
    }

    let history = ticket
        .historical_ids
        .iter()
        .rev()
        .filter(|id| Some(**id) != ticket.build_id)
        .take(cap);
    for (n, id) in history.enumerate() {
        builds.push(BuildDescriptor {
            build_id: *id,
            version: None,
            label: format!("Historical build {}", n + 1),
            is_current: false,
            released: None,
        });
    }
    builds
}
