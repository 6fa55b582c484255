use crate::error::Result;
use plist::{Dictionary, Value};
use std::path::{Path, PathBuf};

/// Every spelling the store has used for the numeric account identifier.
pub const ACCOUNT_ID_KEYS: &[&str] = &[
    "dsPersonId",
    "dsPersonID",
    "dsid",
    "DSID",
    "directoryServicesIdentifier",
];

/// First text value under any of `keys`, in order. Integers are rendered as
/// text and empty strings are skipped.
pub fn string_of(dict: &Dictionary, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match dict.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(r) if r.fract() == 0.0 => Some(format!("{}", *r as i64)),
        _ => None,
    })
}

/// Integer under any of `keys`; numeric strings count.
pub fn integer_of(dict: &Dictionary, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| as_u64(dict.get(key)?))
}

/// Integer array under any of `keys`; non-numeric members are dropped.
pub fn integers_of(dict: &Dictionary, keys: &[&str]) -> Option<Vec<u64>> {
    keys.iter().find_map(|key| {
        dict.get(key)?
            .as_array()
            .map(|items| items.iter().filter_map(as_u64).collect())
    })
}

pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(i) => i.as_unsigned(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn dict_of<'a>(dict: &'a Dictionary, key: &str) -> Option<&'a Dictionary> {
    dict.get(key).and_then(Value::as_dictionary)
}

/// Account identifier from a login or purchase response. The root value wins
/// over the nested `accountInfo` one.
pub fn account_id(response: &Dictionary) -> Option<String> {
    string_of(response, ACCOUNT_ID_KEYS).or_else(|| {
        dict_of(response, "accountInfo").and_then(|info| string_of(info, ACCOUNT_ID_KEYS))
    })
}

pub fn to_xml_bytes(dict: &Dictionary) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, dict)?;
    Ok(buf)
}

/// Parse a response body. Both XML and binary property lists are accepted.
pub fn from_bytes(body: &[u8]) -> Result<Dictionary> {
    Ok(plist::from_bytes::<Dictionary>(body)?)
}

/// A property list backed by a file on disk.
pub struct PlistFile {
    pub path: PathBuf,
    pub data: Dictionary,
}

impl PlistFile {
    pub fn new<P: AsRef<Path>>(path: P, data: Dictionary) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            data,
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = plist::from_file::<_, Dictionary>(&path)?;
        Ok(Self { path, data })
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_string())
    }

    pub fn get_integer(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(as_u64)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        plist::to_file_xml(&self.path, &self.data)?;
        Ok(())
    }
}
