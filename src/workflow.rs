use crate::acquire::{AcquisitionClient, DownloadTicket};
use crate::auth::{AuthClient, AuthOutcome};
use crate::catalog::{BuildDescriptor, CatalogResolver};
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{AppdownError, Result};
use crate::package::{MetadataPackager, MetadataRecord, PackagingOutcome};
use crate::protocol::StoreHttp;
use crate::session::{AccountManager, Session};
use crate::transfer::{ByteSource, HttpByteSource, TransferEngine, TransferSettings, TransferState};
use crate::verify::{IntegrityResult, IntegrityVerifier};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub app_id: String,
    /// Historical build to fetch; the current build when `None`
    pub build_id: Option<String>,
    /// File path, or a directory to place `<bundle>_<version>.ipa` in
    pub output: Option<PathBuf>,
    /// Acquire a free license when the account has none
    pub purchase: bool,
    /// Skip the metadata step entirely
    pub skip_metadata: bool,
}

impl DownloadRequest {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            build_id: None,
            output: None,
            purchase: true,
            skip_metadata: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub bundle_id: String,
    pub display_name: String,
    pub version: Option<String>,
    pub build_id: Option<u64>,
    pub integrity: IntegrityResult,
    /// `None` when metadata was skipped
    pub packaging: Option<PackagingOutcome>,
}

impl DownloadReport {
    pub fn packaging_degraded(&self) -> bool {
        self.packaging.as_ref().is_some_and(PackagingOutcome::is_degraded)
    }
}

/// Wires the store clients into the full acquire, transfer, verify and
/// package pipeline for the active account.
pub struct Downloader<S: ByteSource = HttpByteSource> {
    http: StoreHttp,
    auth: AuthClient,
    catalog: CatalogResolver,
    acquisition: AcquisitionClient,
    transfer: TransferEngine<S>,
    verifier: IntegrityVerifier,
    packager: MetadataPackager,
    accounts: AccountManager,
}

impl Downloader<HttpByteSource> {
    pub fn new(config: Config, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let http = StoreHttp::new(config)?;
        let transfer = TransferEngine::from_http(&http);
        Ok(Self::assemble(http, transfer, store))
    }
}

impl<S: ByteSource> Downloader<S> {
    /// Use a custom byte source for artifact transfers.
    pub fn with_source(config: Config, store: Arc<dyn CredentialStore>, source: S) -> Result<Self> {
        let http = StoreHttp::new(config)?;
        let transfer = TransferEngine::new(source, TransferSettings::from_config(http.config()));
        Ok(Self::assemble(http, transfer, store))
    }

    fn assemble(http: StoreHttp, transfer: TransferEngine<S>, store: Arc<dyn CredentialStore>) -> Self {
        let acquisition = AcquisitionClient::new(http.clone());
        let config = http.config();
        Self {
            auth: AuthClient::new(http.clone()),
            catalog: CatalogResolver::new(http.clone(), acquisition.clone()),
            packager: MetadataPackager::new(config.metadata_dir(), config.embed_metadata),
            accounts: AccountManager::new(store),
            verifier: IntegrityVerifier,
            acquisition,
            transfer,
            http,
        }
    }

    pub fn config(&self) -> &Config {
        self.http.config()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.accounts.current()
    }

    /// Sign in and, when the store returned a usable session, make it the
    /// active account.
    pub async fn login(&self, email: &str, password: &str, code: Option<&str>) -> Result<AuthOutcome> {
        let outcome = self.auth.authenticate(email, password, code).await?;
        if let AuthOutcome::Authenticated(session) = &outcome {
            if session.identity().has_token() {
                self.accounts.activate(session.clone())?;
            }
        }
        Ok(outcome)
    }

    /// Reload the stored account and its cookies.
    pub fn restore_session(&self) -> Result<Option<Session>> {
        let session = self.accounts.restore()?;
        if let Some(session) = &session {
            self.http.restore_cookies(&session.identity().cookies);
            tracing::debug!(account = %session.identity().email, "restored session");
        }
        Ok(session)
    }

    pub fn logout(&self) -> Result<bool> {
        self.accounts.logout()
    }

    fn session(&self) -> Result<Session> {
        let session = self.accounts.current().ok_or(AppdownError::SessionInvalid)?;
        session.ensure_valid()?;
        Ok(session)
    }

    pub async fn resolve_versions(&self, app_id: &str) -> Result<Vec<BuildDescriptor>> {
        let session = self.accounts.current().filter(Session::is_valid);
        self.catalog.resolve_versions(app_id, session.as_ref()).await
    }

    /// Acquire a ticket, buying a free license and retrying once when the
    /// account does not own the app. A second refusal is final.
    pub async fn acquire_licensed(
        &self,
        app_id: &str,
        build_id: Option<&str>,
        session: &Session,
        purchase: bool,
    ) -> Result<DownloadTicket> {
        match self.acquisition.acquire(app_id, build_id, session).await {
            Err(AppdownError::NotLicensed { .. }) if purchase => {
                let license = self.acquisition.purchase_if_needed(app_id, session).await?;
                tracing::info!(app_id, already_owned = license.already_owned, "retrying after license");
                self.acquisition.acquire(app_id, build_id, session).await
            }
            other => other,
        }
    }

    /// Run the whole pipeline for the active account. Transfer updates go to
    /// `progress` when given.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        progress: Option<mpsc::UnboundedSender<TransferState>>,
    ) -> Result<DownloadReport> {
        let session = self.session()?;
        let build = request.build_id.as_deref();
        let mut ticket = self
            .acquire_licensed(&request.app_id, build, &session, request.purchase)
            .await?;
        let path = output_path(request.output.as_deref(), &ticket)?;
        let max_retries = self.config().integrity_retries;

        let mut attempt = 0;
        let (bytes, integrity) = loop {
            let progress = match &progress {
                Some(tx) => tx.clone(),
                None => mpsc::unbounded_channel().0,
            };
            let handle = self.transfer.start(&ticket, &path, progress);
            let report = handle.wait().await?;

            let integrity = self.verifier.verify(&path, &ticket.checksum).await?;
            if integrity.matches {
                break (report.bytes, integrity);
            }
            tokio::fs::remove_file(&path).await?;
            if attempt >= max_retries {
                return Err(AppdownError::IntegrityMismatch {
                    expected: ticket.checksum.to_ascii_lowercase(),
                    computed: integrity.computed,
                });
            }
            attempt += 1;
            tracing::warn!(
                expected = %ticket.checksum,
                computed = %integrity.computed,
                attempt,
                "checksum mismatch, downloading again"
            );
            ticket = self
                .acquire_licensed(&request.app_id, build, &session, request.purchase)
                .await?;
        };

        let packaging = if request.skip_metadata {
            None
        } else {
            let record = MetadataRecord::from_ticket(&ticket, Some(session.identity()));
            let packager = self.packager.clone();
            let sinfs = ticket.sinfs.clone();
            let artifact = path.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                packager.annotate(&artifact, &record, &sinfs)
            })
            .await
            .map_err(|e| AppdownError::Io(std::io::Error::other(e.to_string())))??;
            Some(outcome)
        };

        Ok(DownloadReport {
            path,
            bytes,
            bundle_id: ticket.bundle_id,
            display_name: ticket.display_name,
            version: ticket.version,
            build_id: ticket.build_id,
            integrity,
            packaging,
        })
    }
}

/// Where the artifact goes: `output` as a file, or a generated name inside
/// `output` (or the working directory) when it is a directory.
fn output_path(output: Option<&Path>, ticket: &DownloadTicket) -> Result<PathBuf> {
    let name = {
        let base = if ticket.bundle_id.is_empty() {
            ticket.app_id.as_str()
        } else {
            ticket.bundle_id.as_str()
        };
        match (&ticket.version, ticket.build_id) {
            (Some(v), _) => format!("{}_{}.ipa", base, v),
            (None, Some(b)) => format!("{}_{}.ipa", base, b),
            (None, None) => format!("{}.ipa", base),
        }
    };
    let name: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect();
    match output {
        None => Ok(std::env::current_dir()?.join(name)),
        Some(dir) if dir.is_dir() => Ok(dir.join(name)),
        Some(file) => Ok(file.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(version: Option<&str>) -> DownloadTicket {
        DownloadTicket {
            app_id: "1".into(),
            url: String::new(),
            checksum: String::new(),
            sinfs: vec![],
            bundle_id: "com.example.demo".into(),
            display_name: "Demo".into(),
            version: version.map(str::to_string),
            build_id: Some(77),
            historical_ids: vec![],
            metadata: Default::default(),
        }
    }

    #[test]
    fn output_into_directory_uses_bundle_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = output_path(Some(dir.path()), &ticket(Some("2.0"))).unwrap();
        assert_eq!(path, dir.path().join("com.example.demo_2.0.ipa"));

        let path = output_path(Some(dir.path()), &ticket(None)).unwrap();
        assert_eq!(path, dir.path().join("com.example.demo_77.ipa"));

        let file = dir.path().join("custom.ipa");
        assert_eq!(output_path(Some(&file), &ticket(None)).unwrap(), file);
    }
}
