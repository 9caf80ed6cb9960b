use base64::prelude::*;
use flate2::read::MultiGzDecoder;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use thiserror::Error;

/// Key holding the base64 payload inside a JSON-encoded field.
pub const DATA_KEY: &str = "data";

pub const GZIP_FIELD: &str = "dataFile";
pub const ITEM_FIELD: &str = "item";

const GZIP_HEADER_LEN: usize = 10;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_DEFLATE: u8 = 8;

/// A JSON object whose values are all strings.
pub type JsonMap = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{0}")]
    GzipHeader(&'static str),
    #[error("{0}")]
    GzipStream(#[source] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Base64(#[from] base64::DecodeError),
}

impl DecodeError {
    /// True when the failure happened before any payload byte was inflated.
    pub fn is_gzip_open(&self) -> bool {
        matches!(self, DecodeError::GzipHeader(_))
    }
}

fn check_gzip_header(data: &[u8]) -> Result<(), DecodeError> {
    if data.len() < GZIP_HEADER_LEN {
        return Err(DecodeError::GzipHeader("unexpected end of gzip header"));
    }
    if data[0..2] != GZIP_MAGIC {
        return Err(DecodeError::GzipHeader("invalid gzip header"));
    }
    if data[2] != GZIP_DEFLATE {
        return Err(DecodeError::GzipHeader("unsupported gzip compression method"));
    }
    Ok(())
}

/// Inflate a gzip stream, following concatenated members to the end.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    check_gzip_header(data)?;
    let mut out = Vec::new();
    MultiGzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(DecodeError::GzipStream)?;
    Ok(out)
}

/// Standard alphabet, padding required.
pub fn base64_decode(encoded: &[u8]) -> Result<Vec<u8>, DecodeError> {
    Ok(BASE64_STANDARD.decode(encoded)?)
}

pub fn json_map(data: &[u8]) -> Result<JsonMap, DecodeError> {
    Ok(serde_json::from_slice(data)?)
}

/// Cut `data` down to `max` leading bytes. Returns whether anything was dropped.
#[inline]
pub fn truncate(data: &mut Vec<u8>, max: usize) -> bool {
    if data.len() > max {
        data.truncate(max);
        true
    } else {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FileStrategy {
    /// Log the part as received.
    Raw,
    /// Gzip-decompress, then truncate.
    Gzip,
    /// JSON object whose `data` entry is base64; decoded, truncated, re-encoded.
    JsonBase64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ValueStrategy {
    Raw,
    /// Each entry is a JSON object of strings, logged key by key.
    Json,
    /// Like `Json`, with the `data` entry base64-decoded and truncated.
    JsonBase64,
}

/// Named presets for the strategy registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// `dataFile` gzip, every value JSON, `item` values carry base64 data.
    #[default]
    GzipJsonValues,
    /// `dataFile` gzip, `item` file carries base64 data, values logged raw.
    JsonFiles,
}

/// Field name to decoding strategy, with a fallback for unlisted names.
#[derive(Clone, Debug)]
pub struct Registry {
    files: HashMap<String, FileStrategy>,
    values: HashMap<String, ValueStrategy>,
    default_file: FileStrategy,
    default_value: ValueStrategy,
}

impl Registry {
    pub fn new(default_file: FileStrategy, default_value: ValueStrategy) -> Self {
        Self {
            files: HashMap::new(),
            values: HashMap::new(),
            default_file,
            default_value,
        }
    }

    pub fn for_profile(profile: Profile) -> Self {
        match profile {
            Profile::GzipJsonValues => Self::new(FileStrategy::Raw, ValueStrategy::Json)
                .with_file(GZIP_FIELD, FileStrategy::Gzip)
                .with_value(ITEM_FIELD, ValueStrategy::JsonBase64),
            Profile::JsonFiles => Self::new(FileStrategy::Raw, ValueStrategy::Raw)
                .with_file(GZIP_FIELD, FileStrategy::Gzip)
                .with_file(ITEM_FIELD, FileStrategy::JsonBase64),
        }
    }

    pub fn with_file(mut self, field: &str, strategy: FileStrategy) -> Self {
        self.set_file(field, strategy);
        self
    }

    pub fn with_value(mut self, field: &str, strategy: ValueStrategy) -> Self {
        self.set_value(field, strategy);
        self
    }

    pub fn set_file(&mut self, field: &str, strategy: FileStrategy) {
        self.files.insert(field.to_owned(), strategy);
    }

    pub fn set_value(&mut self, field: &str, strategy: ValueStrategy) {
        self.values.insert(field.to_owned(), strategy);
    }

    pub fn file(&self, field: &str) -> FileStrategy {
        self.files.get(field).copied().unwrap_or(self.default_file)
    }

    pub fn value(&self, field: &str) -> ValueStrategy {
        self.values.get(field).copied().unwrap_or(self.default_value)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::for_profile(Profile::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn gunzip_reads_concatenated_members() {
        let mut data = gzip(b"hello ");
        data.extend(gzip(b"world"));
        assert_eq!(gunzip(&data).unwrap(), b"hello world");
    }

    #[test]
    fn gunzip_rejects_bad_header_as_open_error() {
        let err = gunzip(b"definitely not gzip").unwrap_err();
        assert!(err.is_gzip_open());
        assert_eq!(err.to_string(), "invalid gzip header");

        let err = gunzip(&[0x1f, 0x8b]).unwrap_err();
        assert!(err.is_gzip_open());
    }

    #[test]
    fn gunzip_reports_corrupt_body_as_stream_error() {
        // valid header, then a deflate block with the reserved block type
        let data = [0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff];
        let err = gunzip(&data).unwrap_err();
        assert!(!err.is_gzip_open());
    }

    #[test]
    fn base64_requires_padding() {
        assert_eq!(base64_decode(b"aGk=").unwrap(), b"hi");
        assert!(base64_decode(b"aGk").is_err());
        assert!(base64_decode(b"!!!!").is_err());
    }

    #[test]
    fn json_map_only_accepts_string_values() {
        let map = json_map(br#"{"serial":"M0","data":"aGk="}"#).unwrap();
        assert_eq!(map.get("serial").map(String::as_str), Some("M0"));
        assert!(json_map(br#"{"count":3}"#).is_err());
        assert!(json_map(b"[1,2]").is_err());
    }

    #[test]
    fn truncate_only_when_longer() {
        let mut data = vec![1u8; 10];
        assert!(!truncate(&mut data, 10));
        assert_eq!(data.len(), 10);
        assert!(truncate(&mut data, 4));
        assert_eq!(data, vec![1u8; 4]);
    }

    #[test]
    fn profiles_dispatch_by_field_name() {
        let a = Registry::for_profile(Profile::GzipJsonValues);
        assert_eq!(a.file("dataFile"), FileStrategy::Gzip);
        assert_eq!(a.file("item"), FileStrategy::Raw);
        assert_eq!(a.value("item"), ValueStrategy::JsonBase64);
        assert_eq!(a.value("other"), ValueStrategy::Json);

        let b = Registry::for_profile(Profile::JsonFiles);
        assert_eq!(b.file("dataFile"), FileStrategy::Gzip);
        assert_eq!(b.file("item"), FileStrategy::JsonBase64);
        assert_eq!(b.value("item"), ValueStrategy::Raw);
    }

    #[test]
    fn overrides_replace_profile_entries() {
        let reg = Registry::for_profile(Profile::JsonFiles).with_file("dataFile", FileStrategy::Raw);
        assert_eq!(reg.file("dataFile"), FileStrategy::Raw);
    }
}
