use crate::error::{AppdownError, Result};
use crate::plist_ext;
use plist::Value;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

/// What packaging needs to know about an IPA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpaLayout {
    /// Archive prefix of the app bundle, e.g. `Payload/Example.app/`
    pub app_dir: String,
    pub executable: Option<String>,
    pub bundle_id: Option<String>,
    /// Bundle-relative signature paths from `SC_Info/Manifest.plist`
    pub sinf_paths: Vec<String>,
}

impl IpaLayout {
    /// Archive paths for `count` signature blobs, in blob order.
    pub fn sinf_targets(&self, count: usize) -> Vec<String> {
        if !self.sinf_paths.is_empty() {
            return self
                .sinf_paths
                .iter()
                .take(count)
                .map(|p| format!("{}{}", self.app_dir, p.trim_start_matches('/')))
                .collect();
        }
        match (&self.executable, count) {
            (Some(exe), n) if n > 0 => vec![format!("{}SC_Info/{}.sinf", self.app_dir, exe)],
            _ => Vec::new(),
        }
    }
}

pub fn inspect_ipa<P: AsRef<Path>>(ipa_path: P) -> Result<IpaLayout> {
    let file = File::open(ipa_path.as_ref())?;
    let mut archive = zip::ZipArchive::new(file)?;

    // Check for valid IPA structure
    let has_payload = archive
        .file_names()
        .any(|name| name.starts_with("Payload/"));
    if !has_payload {
        return Err(AppdownError::InvalidIpa(
            "No Payload folder found".to_string(),
        ));
    }

    let info_name = archive
        .file_names()
        .find(|name| is_bundle_info_plist(name))
        .map(str::to_string)
        .ok_or_else(|| AppdownError::InvalidIpa("No Info.plist found, invalid app".to_string()))?;
    let app_dir = info_name.trim_end_matches("Info.plist").to_string();

    let info = read_plist(&mut archive, &info_name)?;
    let executable = plist_ext::string_of(&info, &["CFBundleExecutable"]);
    let bundle_id = plist_ext::string_of(&info, &["CFBundleIdentifier"]);

    let manifest_name = format!("{}SC_Info/Manifest.plist", app_dir);
    let sinf_paths = if archive.index_for_name(&manifest_name).is_some() {
        read_plist(&mut archive, &manifest_name)?
            .get("SinfPaths")
            .and_then(Value::as_array)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(Value::as_string)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    Ok(IpaLayout {
        app_dir,
        executable,
        bundle_id,
        sinf_paths,
    })
}

/// `Payload/<name>.app/Info.plist`, not a nested bundle's.
fn is_bundle_info_plist(name: &str) -> bool {
    let parts: Vec<&str> = name.split('/').collect();
    parts.len() == 3 && parts[0] == "Payload" && parts[1].ends_with(".app") && parts[2] == "Info.plist"
}

fn read_plist(archive: &mut zip::ZipArchive<File>, name: &str) -> Result<plist::Dictionary> {
    let mut entry = archive.by_name(name)?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf)?;
    plist_ext::from_bytes(&buf)
}

/// Rewrite the IPA in place with `extra` entries added (or replaced).
///
/// Existing entries are copied without recompression. The new archive is
/// built next to the original and renamed over it, so a failure leaves the
/// original untouched.
pub fn rewrite_ipa<P: AsRef<Path>>(ipa_path: P, extra: &[(String, Vec<u8>)]) -> Result<()> {
    let ipa_path = ipa_path.as_ref();
    let dir = ipa_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut archive = zip::ZipArchive::new(File::open(ipa_path)?)?;
    let replaced: HashSet<&str> = extra.iter().map(|(name, _)| name.as_str()).collect();

    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut zip = zip::ZipWriter::new(tmp);
    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        if replaced.contains(entry.name()) {
            continue;
        }
        zip.raw_copy_file(entry)?;
    }

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, data) in extra {
        zip.start_file(name.as_str(), options)?;
        zip.write_all(data)?;
    }

    let tmp = zip.finish()?;
    tmp.persist(ipa_path)
        .map_err(|e| AppdownError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Minimal IPA with an executable named `Demo`.
    pub(crate) fn fake_ipa(dir: &Path, manifest: Option<&[&str]>) -> PathBuf {
        let path = dir.join("Demo.ipa");
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut info = plist::Dictionary::new();
        info.insert("CFBundleExecutable".into(), Value::String("Demo".into()));
        info.insert("CFBundleIdentifier".into(), Value::String("com.example.demo".into()));
        zip.add_directory("Payload/", options).unwrap();
        zip.add_directory("Payload/Demo.app/", options).unwrap();
        zip.start_file("Payload/Demo.app/Info.plist", options).unwrap();
        zip.write_all(&plist_ext::to_xml_bytes(&info).unwrap()).unwrap();
        zip.start_file("Payload/Demo.app/Demo", options).unwrap();
        zip.write_all(&[0xcf, 0xfa, 0xed, 0xfe, 1, 2, 3, 4]).unwrap();
        zip.start_file("Payload/Demo.app/PlugIns/Widget.appex/Info.plist", options).unwrap();
        zip.write_all(b"<plist/>").unwrap();

        if let Some(paths) = manifest {
            let mut m = plist::Dictionary::new();
            m.insert(
                "SinfPaths".into(),
                Value::Array(paths.iter().map(|p| Value::String(p.to_string())).collect()),
            );
            zip.start_file("Payload/Demo.app/SC_Info/Manifest.plist", options).unwrap();
            zip.write_all(&plist_ext::to_xml_bytes(&m).unwrap()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    pub(crate) fn entry_bytes(path: &Path, name: &str) -> Option<Vec<u8>> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entry = archive.by_name(name).ok()?;
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).unwrap();
        Some(buf)
    }

    #[test]
    fn inspect_finds_top_level_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let ipa = fake_ipa(dir.path(), None);
        let layout = inspect_ipa(&ipa).unwrap();
        assert_eq!(layout.app_dir, "Payload/Demo.app/");
        assert_eq!(layout.executable.as_deref(), Some("Demo"));
        assert_eq!(layout.bundle_id.as_deref(), Some("com.example.demo"));
        assert_eq!(layout.sinf_targets(1), vec!["Payload/Demo.app/SC_Info/Demo.sinf"]);
    }

    #[test]
    fn manifest_paths_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let ipa = fake_ipa(dir.path(), Some(&["SC_Info/Demo.sinf", "PlugIns/Widget.appex/SC_Info/Widget.sinf"]));
        let layout = inspect_ipa(&ipa).unwrap();
        assert_eq!(
            layout.sinf_targets(2),
            vec![
                "Payload/Demo.app/SC_Info/Demo.sinf",
                "Payload/Demo.app/PlugIns/Widget.appex/SC_Info/Widget.sinf"
            ]
        );
    }

    #[test]
    fn rewrite_keeps_entries_and_replaces_named_ones() {
        let dir = tempfile::tempdir().unwrap();
        let ipa = fake_ipa(dir.path(), None);
        rewrite_ipa(
            &ipa,
            &[
                ("iTunesMetadata.plist".to_string(), b"meta".to_vec()),
                ("Payload/Demo.app/Demo".to_string(), b"new".to_vec()),
            ],
        )
        .unwrap();

        assert_eq!(entry_bytes(&ipa, "iTunesMetadata.plist").unwrap(), b"meta");
        assert_eq!(entry_bytes(&ipa, "Payload/Demo.app/Demo").unwrap(), b"new");
        assert!(entry_bytes(&ipa, "Payload/Demo.app/Info.plist").is_some());
        let mut archive = zip::ZipArchive::new(File::open(&ipa).unwrap()).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert_eq!(names.iter().filter(|n| **n == "Payload/Demo.app/Demo").count(), 1);
        assert!(archive.by_name("Payload/").is_ok());
    }

    #[test]
    fn non_ipa_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ipa");
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        zip.start_file("readme.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"hi").unwrap();
        zip.finish().unwrap();

        let err = inspect_ipa(&path).unwrap_err();
        assert!(matches!(err, AppdownError::InvalidIpa(_)));
    }
}
