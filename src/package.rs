use crate::acquire::{DownloadTicket, Sinf};
use crate::error::{AppdownError, Result};
use crate::ipa::{inspect_ipa, rewrite_ipa};
use crate::plist_ext::{self, PlistFile};
use crate::session::Identity;
use plist::{Dictionary, Value};
use std::path::{Path, PathBuf};

pub const METADATA_ENTRY: &str = "iTunesMetadata.plist";

/// The `iTunesMetadata.plist` installers read to treat an IPA as licensed.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub fields: Dictionary,
}

impl MetadataRecord {
    /// Placeholders first, then whatever the store sent with the ticket, then
    /// the fields that must describe this exact build.
    pub fn from_ticket(ticket: &DownloadTicket, identity: Option<&Identity>) -> Self {
        let mut fields = placeholders();
        for (key, value) in ticket.metadata.iter() {
            fields.insert(key.clone(), value.clone());
        }

        let app_id = ticket.app_id.parse::<u64>().ok();
        let str_value = |s: &str| Value::String(s.to_string());
        let bundle_id = if ticket.bundle_id.is_empty() {
            ticket.app_id.as_str()
        } else {
            ticket.bundle_id.as_str()
        };

        fields.insert("bundleId".into(), str_value(bundle_id));
        fields.insert("softwareVersionBundleId".into(), str_value(bundle_id));
        fields.insert("itemName".into(), str_value(&ticket.display_name));
        fields.insert("playlistName".into(), str_value("iOS Apps"));
        if let Some(id) = app_id {
            fields.insert("itemId".into(), Value::Integer(id.into()));
        }
        if let Some(version) = &ticket.version {
            fields.insert("bundleShortVersionString".into(), str_value(version));
            if !fields.contains_key("bundleVersion") {
                fields.insert("bundleVersion".into(), str_value(version));
            }
        }
        if let Some(build) = ticket.build_id {
            fields.insert(
                "softwareVersionExternalIdentifier".into(),
                Value::Integer(build.into()),
            );
        }
        fields.insert(
            "softwareVersionExternalIdentifiers".into(),
            Value::Array(
                ticket
                    .historical_ids
                    .iter()
                    .map(|id| Value::Integer((*id).into()))
                    .collect(),
            ),
        );
        fields.insert("price".into(), Value::Real(0.0));
        fields.insert("priceDisplay".into(), str_value("Free"));
        fields.insert("fileExtension".into(), str_value("ipa"));
        fields.insert(
            "fileName".into(),
            str_value(&format!("{}.ipa", sanitize(&ticket.display_name))),
        );

        if let Some(identity) = identity {
            let account = if identity.email.is_empty() {
                bundle_id
            } else {
                identity.email.as_str()
            };
            fields.insert("appleId".into(), str_value(account));
            fields.insert("userName".into(), str_value(&identity.display_name()));
            if let Some(storefront) = identity.storefront_id() {
                fields.insert("s".into(), Value::Integer(storefront.into()));
            }
        } else {
            fields.insert("appleId".into(), str_value(bundle_id));
        }

        Self { fields }
    }

    pub fn bundle_id(&self) -> Option<&str> {
        self.fields.get("bundleId").and_then(Value::as_string)
    }

    pub fn to_xml(&self) -> Result<Vec<u8>> {
        plist_ext::to_xml_bytes(&self.fields)
    }
}

fn placeholders() -> Dictionary {
    let mut d = Dictionary::new();
    let s = |v: &str| Value::String(v.to_string());
    d.insert("artistId".into(), Value::Integer(0.into()));
    d.insert("artistName".into(), s("Unknown"));
    d.insert("copyright".into(), s(""));
    d.insert("drmVersionNumber".into(), Value::Integer(0.into()));
    d.insert("genre".into(), s("Productivity"));
    d.insert("genreId".into(), Value::Integer(6007.into()));
    d.insert("kind".into(), s("software"));
    d.insert("rating".into(), s("4+"));
    d.insert("releaseDate".into(), s(&chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()));
    d.insert("s".into(), Value::Integer(143441.into()));
    d.insert("softwareIcon57x57URL".into(), s(""));
    d.insert("softwareIconNeedsShine".into(), Value::Boolean(false));
    d.insert(
        "softwareSupportedDeviceIds".into(),
        Value::Array(vec![Value::Integer(1.into()), Value::Integer(2.into())]),
    );
    d.insert("subgenres".into(), Value::Array(Vec::new()));
    d.insert("vendorId".into(), Value::Integer(0.into()));
    d.insert("versionRestrictions".into(), Value::Integer(0.into()));
    d
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "app".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackagingOutcome {
    /// Metadata and signatures were written into the IPA.
    Embedded { path: PathBuf },
    /// The IPA is untouched; the record sits at `metadata_path` for a manual
    /// merge, or nowhere when that write failed too.
    Degraded {
        path: PathBuf,
        metadata_path: Option<PathBuf>,
        reason: String,
    },
}

impl PackagingOutcome {
    pub fn path(&self) -> &Path {
        match self {
            PackagingOutcome::Embedded { path } | PackagingOutcome::Degraded { path, .. } => path,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, PackagingOutcome::Degraded { .. })
    }
}

#[derive(Debug, Clone)]
pub struct MetadataPackager {
    fallback_dir: PathBuf,
    embed: bool,
}

impl MetadataPackager {
    /// `embed == false` skips archive mutation and always writes the external record.
    pub fn new<P: AsRef<Path>>(fallback_dir: P, embed: bool) -> Self {
        Self {
            fallback_dir: fallback_dir.as_ref().to_path_buf(),
            embed,
        }
    }

    /// Write `record` (and the signature blobs) into the IPA at `artifact`.
    ///
    /// Archive write failures degrade to an external record instead of
    /// failing. An artifact that is not an IPA is an error.
    pub fn annotate(
        &self,
        artifact: &Path,
        record: &MetadataRecord,
        sinfs: &[Sinf],
    ) -> Result<PackagingOutcome> {
        if !artifact.exists() {
            return Err(AppdownError::FileNotFound(artifact.to_path_buf()));
        }
        let layout = inspect_ipa(artifact)?;

        if !self.embed {
            return Ok(self.degrade(artifact, record, "archive rewriting is disabled".to_string()));
        }

        let mut entries = vec![(METADATA_ENTRY.to_string(), record.to_xml()?)];
        let targets = layout.sinf_targets(sinfs.len());
        if targets.len() < sinfs.len() {
            tracing::warn!(
                expected = sinfs.len(),
                placed = targets.len(),
                "not every signature blob has a destination"
            );
        }
        for (target, sinf) in targets.into_iter().zip(sinfs) {
            entries.push((target, sinf.data.clone()));
        }

        match rewrite_ipa(artifact, &entries) {
            Ok(()) => {
                tracing::info!(path = %artifact.display(), entries = entries.len(), "embedded metadata");
                Ok(PackagingOutcome::Embedded {
                    path: artifact.to_path_buf(),
                })
            }
            Err(e @ (AppdownError::Io(_) | AppdownError::Zip(_))) => {
                Ok(self.degrade(artifact, record, e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn degrade(&self, artifact: &Path, record: &MetadataRecord, reason: String) -> PackagingOutcome {
        let name = format!(
            "iTunesMetadata_{}.plist",
            sanitize(record.bundle_id().unwrap_or("app"))
        );
        let target = self.fallback_dir.join(name);
        let (metadata_path, reason) = match PlistFile::new(&target, record.fields.clone()).save() {
            Ok(()) => (Some(target), reason),
            Err(e) => {
                tracing::warn!(metadata = %target.display(), error = %e, "could not write metadata record");
                (None, format!("{}; record not written: {}", reason, e))
            }
        };
        tracing::warn!(
            path = %artifact.display(),
            metadata = ?metadata_path,
            reason = %reason,
            "metadata not embedded"
        );
        PackagingOutcome::Degraded {
            path: artifact.to_path_buf(),
            metadata_path,
            reason,
        }
    }
}
