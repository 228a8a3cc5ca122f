//! File codecs and the registry that picks one for each write.
//!
//! Each [`Codec`] votes on incoming data with [`Codec::accepts`]; the highest priority wins
//! and ties go to the codec registered first. An explicit `filetype` bypasses the vote.

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::metaarray::MetaArray;
use crate::utils::split_extension;

/// Payload handed to [`crate::store::Handle::write_file`] and returned by `read_file`.
#[derive(Debug, Clone, PartialEq)]
pub enum FileData {
    Array(MetaArray),
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl FileData {
    pub fn as_array(&self) -> Option<&MetaArray> {
        match self {
            FileData::Array(ma) => Some(ma),
            _ => None,
        }
    }
}

impl From<MetaArray> for FileData {
    fn from(ma: MetaArray) -> Self {
        FileData::Array(ma)
    }
}

pub trait Codec: Send + Sync {
    /// Registry name, used as `filetype`.
    fn name(&self) -> &str;

    /// Extension (without dot) this codec owns, if any.
    fn extension(&self) -> Option<&str>;

    /// Priority vote for writing `data` to `filename`; `None` declines.
    fn accepts(&self, data: &FileData, filename: &str) -> Option<i32>;

    /// Final file name: appends the codec's extension unless already present.
    fn filename(&self, filename: &str) -> String {
        match self.extension() {
            Some(ext) if split_extension(filename).1 != format!(".{}", ext) => format!("{}.{}", filename, ext),
            _ => filename.to_string(),
        }
    }

    fn encode(&self, data: &FileData) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<FileData>;

    /// Concatenates `new` onto `existing` along `axis`.
    fn append(&self, _existing: FileData, _new: &FileData, axis: &str, path: &Path) -> Result<FileData> {
        Err(Error::SchemaMismatch {
            path: path.to_path_buf(),
            reason: format!("{} files cannot be appended along '{}'", self.name(), axis),
        })
    }
}

fn unsupported(codec: &str, data: &FileData) -> Error {
    Error::invalid(codec, format!("cannot encode {:?}", std::mem::discriminant(data)))
}

pub struct MetaArrayCodec;

impl Codec for MetaArrayCodec {
    fn name(&self) -> &str {
        "MetaArray"
    }
    fn extension(&self) -> Option<&str> {
        Some("ma")
    }
    fn accepts(&self, data: &FileData, _filename: &str) -> Option<i32> {
        matches!(data, FileData::Array(_)).then_some(100)
    }
    fn encode(&self, data: &FileData) -> Result<Vec<u8>> {
        match data {
            FileData::Array(ma) => ma.to_bytes(),
            other => Err(unsupported(self.name(), other)),
        }
    }
    fn decode(&self, bytes: &[u8]) -> Result<FileData> {
        Ok(FileData::Array(MetaArray::from_bytes(bytes)?))
    }
    fn append(&self, existing: FileData, new: &FileData, axis: &str, path: &Path) -> Result<FileData> {
        let mismatch = |reason: String| Error::SchemaMismatch {
            path: path.to_path_buf(),
            reason,
        };
        let (FileData::Array(mut current), FileData::Array(more)) = (existing, new) else {
            return Err(mismatch("both sides must be arrays".to_string()));
        };
        current.append(more, axis).map_err(mismatch)?;
        Ok(FileData::Array(current))
    }
}

pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        "JSON"
    }
    fn extension(&self) -> Option<&str> {
        Some("json")
    }
    fn accepts(&self, data: &FileData, filename: &str) -> Option<i32> {
        match data {
            FileData::Json(_) => Some(50),
            FileData::Text(_) if filename.ends_with(".json") => Some(20),
            _ => None,
        }
    }
    fn encode(&self, data: &FileData) -> Result<Vec<u8>> {
        match data {
            FileData::Json(v) => Ok(serde_json::to_vec_pretty(v)?),
            FileData::Text(t) => Ok(t.as_bytes().to_vec()),
            other => Err(unsupported(self.name(), other)),
        }
    }
    fn decode(&self, bytes: &[u8]) -> Result<FileData> {
        Ok(FileData::Json(serde_json::from_slice(bytes)?))
    }
}

pub struct TextCodec;

impl Codec for TextCodec {
    fn name(&self) -> &str {
        "Text"
    }
    fn extension(&self) -> Option<&str> {
        Some("txt")
    }
    fn accepts(&self, data: &FileData, _filename: &str) -> Option<i32> {
        matches!(data, FileData::Text(_)).then_some(10)
    }
    fn encode(&self, data: &FileData) -> Result<Vec<u8>> {
        match data {
            FileData::Text(t) => Ok(t.as_bytes().to_vec()),
            other => Err(unsupported(self.name(), other)),
        }
    }
    fn decode(&self, bytes: &[u8]) -> Result<FileData> {
        Ok(FileData::Text(String::from_utf8_lossy(bytes).into_owned()))
    }
}

/// Fallback for opaque bytes; keeps whatever name it is given.
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &str {
        "Raw"
    }
    fn extension(&self) -> Option<&str> {
        None
    }
    fn accepts(&self, data: &FileData, _filename: &str) -> Option<i32> {
        matches!(data, FileData::Bytes(_)).then_some(0)
    }
    fn encode(&self, data: &FileData) -> Result<Vec<u8>> {
        match data {
            FileData::Bytes(b) => Ok(b.clone()),
            FileData::Text(t) => Ok(t.as_bytes().to_vec()),
            other => Err(unsupported(self.name(), other)),
        }
    }
    fn decode(&self, bytes: &[u8]) -> Result<FileData> {
        Ok(FileData::Bytes(bytes.to_vec()))
    }
}

pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self { codecs: Vec::new() }
    }

    /// Registry with the built-in codecs.
    pub fn with_defaults() -> Self {
        let mut reg = Self::empty();
        reg.register(Arc::new(MetaArrayCodec));
        reg.register(Arc::new(JsonCodec));
        reg.register(Arc::new(TextCodec));
        reg.register(Arc::new(RawCodec));
        reg
    }

    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.push(codec);
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.iter().find(|c| c.name() == name).cloned()
    }

    /// Codec owning the extension of `filename`; [`RawCodec`]-like fallback otherwise.
    pub fn for_file(&self, filename: &str) -> Option<Arc<dyn Codec>> {
        let ext = split_extension(filename).1.trim_start_matches('.');
        self.codecs
            .iter()
            .find(|c| c.extension() == Some(ext))
            .or_else(|| self.codecs.iter().find(|c| c.extension().is_none()))
            .cloned()
    }

    /// Highest vote wins; ties go to the earliest registration.
    pub fn select(&self, data: &FileData, filename: &str) -> Option<Arc<dyn Codec>> {
        let mut best: Option<(i32, &Arc<dyn Codec>)> = None;
        for codec in self.codecs.iter() {
            if let Some(priority) = codec.accepts(data, filename) {
                if best.map_or(true, |(p, _)| priority > p) {
                    best = Some((priority, codec));
                }
            }
        }
        best.map(|(_, c)| c.clone())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
