pub mod acquire;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod device;
pub mod error;
pub mod failure;
pub mod ipa;
pub mod package;
pub mod plist_ext;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod verify;
pub mod workflow;

pub use acquire::{AcquisitionClient, DownloadTicket, LicenseResult, Sinf};
pub use auth::{AuthClient, AuthOutcome};
pub use catalog::{BuildDescriptor, CatalogResolver};
pub use config::{Config, Endpoints};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use device::Guid;
pub use error::{AppdownError, Challenge, ErrorKind, Result};
pub use package::{MetadataPackager, MetadataRecord, PackagingOutcome};
pub use plist_ext::PlistFile;
pub use protocol::StoreHttp;
pub use session::{AccountManager, Identity, Session};
pub use transfer::{
    ByteSource, Eta, HttpByteSource, SourceBody, TransferEngine, TransferHandle, TransferReport,
    TransferSettings, TransferState, TransferStatus,
};
pub use verify::{ChecksumAlgorithm, IntegrityResult, IntegrityVerifier};
pub use workflow::{DownloadReport, DownloadRequest, Downloader};
