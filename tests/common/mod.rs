#![allow(dead_code)]

use appdown::Config;
use plist::{Dictionary, Value};
use std::io::Write;
use std::path::Path;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

pub const GUID: &str = "A483E701020F";
pub const AUTH_PATH: &str = "/auth/v1/native/fast";
pub const DOWNLOAD_PATH: &str = "/WebObjects/MZFinance.woa/wa/volumeStoreDownloadProduct";
pub const PURCHASE_PATH: &str = "/WebObjects/MZBuy.woa/wa/buyProduct";
pub const HISTORY_PATH: &str = "/apple/app-version/index.php";

/// Config with every endpoint pointed at `server` and short retry delays.
pub fn config(server: &MockServer, data_dir: &Path) -> Config {
    let mut config = Config::new(data_dir.to_path_buf());
    config.endpoints.auth = format!("{}{}", server.uri(), AUTH_PATH);
    config.endpoints.store = server.uri();
    config.endpoints.purchase = format!("{}{}", server.uri(), PURCHASE_PATH);
    config.endpoints.version_history = format!("{}{}", server.uri(), HISTORY_PATH);
    config.guid = Some(GUID.to_string());
    config.retry_base_delay_ms = 10;
    config
}

pub fn s(v: &str) -> Value {
    Value::String(v.to_string())
}

pub fn dict(pairs: Vec<(&str, Value)>) -> Dictionary {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

pub fn plist_response(status: u16, body: Dictionary) -> ResponseTemplate {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &body).unwrap();
    ResponseTemplate::new(status)
        .insert_header("Content-Type", "application/x-apple-plist")
        .set_body_bytes(buf)
}

pub fn login_success() -> Dictionary {
    let address = dict(vec![("firstName", s("Ada")), ("lastName", s("Lovelace"))]);
    let info = dict(vec![
        ("appleId", s("ada@example.com")),
        ("address", Value::Dictionary(address)),
    ]);
    dict(vec![
        ("passwordToken", s("tok")),
        ("clearToken", s("clear")),
        ("dsPersonId", Value::Integer(123.into())),
        ("accountInfo", Value::Dictionary(info)),
    ])
}

pub async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(plist_response(200, login_success()))
        .mount(server)
        .await;
}

/// A `songList` entry for an app with the given artifact URL and checksum.
pub fn ticket_entry(url: &str, md5: &str, current: u64, history: &[u64]) -> Value {
    let metadata = dict(vec![
        ("softwareVersionBundleId", s("com.example.demo")),
        ("bundleDisplayName", s("Demo")),
        ("bundleShortVersionString", s("2.1")),
        ("softwareVersionExternalIdentifier", Value::Integer(current.into())),
        (
            "softwareVersionExternalIdentifiers",
            Value::Array(history.iter().map(|id| Value::Integer((*id).into())).collect()),
        ),
    ]);
    let sinf = dict(vec![
        ("id", Value::Integer(0.into())),
        ("sinf", Value::Data(b"sinf-blob".to_vec())),
    ]);
    Value::Dictionary(dict(vec![
        ("URL", s(url)),
        ("md5", s(md5)),
        ("sinfs", Value::Array(vec![Value::Dictionary(sinf)])),
        ("metadata", Value::Dictionary(metadata)),
    ]))
}

pub fn song_list(entries: Vec<Value>) -> Dictionary {
    dict(vec![("songList", Value::Array(entries))])
}

/// Bytes of a minimal IPA whose executable is `Demo`.
pub fn ipa_bytes() -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let info = dict(vec![
        ("CFBundleExecutable", s("Demo")),
        ("CFBundleIdentifier", s("com.example.demo")),
    ]);
    let mut info_xml = Vec::new();
    plist::to_writer_xml(&mut info_xml, &info).unwrap();

    zip.start_file("Payload/Demo.app/Info.plist", options).unwrap();
    zip.write_all(&info_xml).unwrap();
    zip.start_file("Payload/Demo.app/Demo", options).unwrap();
    zip.write_all(&[0xcf, 0xfa, 0xed, 0xfe, 7, 0, 0, 1]).unwrap();
    zip.finish().unwrap().into_inner()
}

pub fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data))
}

pub fn entry_bytes(ipa: &Path, name: &str) -> Option<Vec<u8>> {
    use std::io::Read;
    let mut archive = zip::ZipArchive::new(std::fs::File::open(ipa).unwrap()).unwrap();
    let mut entry = archive.by_name(name).ok()?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).unwrap();
    Some(buf)
}
