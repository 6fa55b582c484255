use crate::error::{AppdownError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str =
    "Configurator/2.15 (Macintosh; OS X 11.0.0; 16G29) AppleWebKit/2603.3.8";
pub const DEFAULT_STOREFRONT: &str = "143441-1,29";

/// Store endpoints. Overridable so the client can be pointed at a mirror or a test server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Login handshake; `?guid=` is appended
    pub auth: String,
    /// Base of the download-ticket endpoint (`/WebObjects/MZFinance.woa/...` is appended)
    pub store: String,
    /// Zero-price license acquisition
    pub purchase: String,
    /// Third-party version history, `?id=` is appended
    pub version_history: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            auth: "https://auth.itunes.apple.com/auth/v1/native/fast".to_string(),
            store: "https://p25-buy.itunes.apple.com".to_string(),
            purchase: "https://buy.itunes.apple.com/WebObjects/MZBuy.woa/wa/buyProduct"
                .to_string(),
            version_history: "https://api.timbrd.com/apple/app-version/index.php".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoints: Endpoints,
    pub user_agent: String,
    /// Fixed device GUID; derived from the host when unset
    pub guid: Option<String>,
    /// Storefront used when the account does not report one
    pub default_storefront: String,
    /// Where credentials and fallback metadata live
    pub data_dir: PathBuf,

    /// Per-request timeout for login, lookup and ticket calls
    pub request_timeout_secs: u64,
    /// Version-history lookup timeout
    pub enrichment_timeout_secs: u64,
    /// Upper bound for a whole artifact request; 0 disables it
    pub resource_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// A transfer stalled this long is treated as a dropped connection
    pub idle_timeout_secs: u64,

    /// Historical builds listed when only build ids are known
    pub history_cap: usize,
    pub chunk_size: usize,
    pub progress_interval_ms: u64,
    pub transfer_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Re-downloads after a checksum mismatch
    pub integrity_retries: u32,
    /// Rewrite the IPA with metadata; when false only the external record is written
    pub embed_metadata: bool,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            endpoints: Endpoints::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            guid: None,
            default_storefront: DEFAULT_STOREFRONT.to_string(),
            data_dir,
            request_timeout_secs: 30,
            enrichment_timeout_secs: 10,
            resource_timeout_secs: 0,
            connect_timeout_secs: 30,
            idle_timeout_secs: 60,
            history_cap: 20,
            chunk_size: 256 * 1024,
            progress_interval_ms: 100,
            transfer_retries: 3,
            retry_base_delay_ms: 500,
            integrity_retries: 2,
            embed_metadata: true,
        }
    }

    /// Read a JSON config file; absent keys keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AppdownError::FileNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(AppdownError::Config("request_timeout_secs must be positive".into()));
        }
        if self.resource_timeout_secs != 0 && self.resource_timeout_secs <= self.request_timeout_secs {
            return Err(AppdownError::Config(
                "resource_timeout_secs must exceed request_timeout_secs".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(AppdownError::Config("chunk_size must be positive".into()));
        }
        if self.progress_interval_ms == 0 {
            return Err(AppdownError::Config("progress_interval_ms must be positive".into()));
        }
        for url in [
            &self.endpoints.auth,
            &self.endpoints.store,
            &self.endpoints.purchase,
            &self.endpoints.version_history,
        ] {
            url::Url::parse(url)
                .map_err(|e| AppdownError::Config(format!("invalid endpoint {}: {}", url, e)))?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn enrichment_timeout(&self) -> Duration {
        Duration::from_secs(self.enrichment_timeout_secs)
    }

    pub fn resource_timeout(&self) -> Option<Duration> {
        (self.resource_timeout_secs > 0).then(|| Duration::from_secs(self.resource_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("account.json")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    /// `APPDOWN_DATA_DIR`, then the platform data directory.
    pub fn data_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("APPDOWN_DATA_DIR") {
            return PathBuf::from(dir);
        }
        dirs::data_local_dir()
            .map(|d| d.join("appdown"))
            .unwrap_or_else(|| PathBuf::from(".appdown"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"history_cap": 5, "endpoints": {"store": "http://127.0.0.1:9000"}}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.history_cap, 5);
        assert_eq!(config.endpoints.store, "http://127.0.0.1:9000");
        assert_eq!(config.endpoints.purchase, Endpoints::default().purchase);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.progress_interval_ms, 100);
    }

    #[test]
    fn resource_timeout_must_exceed_request_timeout() {
        let mut config = Config::new(PathBuf::from("/tmp/appdown"));
        config.resource_timeout_secs = 10;
        assert!(config.validate().is_err());
        config.resource_timeout_secs = 300;
        assert!(config.validate().is_ok());
        assert_eq!(config.resource_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::load("/nonexistent/appdown.json").unwrap_err();
        assert!(matches!(err, AppdownError::FileNotFound(_)));
    }
}
