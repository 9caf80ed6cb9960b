//! Multipart form parsing on top of `multer`.
//!
//! The request body is streamed into the parser, and the whole form is
//! collected before anything is traced, so a malformed stream yields an error
//! and no parts at all. File bytes past the memory budget go to a temporary
//! file through tokio's file I/O; the file is removed when its part is dropped.

use bytes::Bytes;
use futures::Stream;
use mime::Mime;
use std::collections::BTreeMap;
use std::io;
use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};

/// Extra room granted to plain values on top of the memory budget.
pub const VALUE_MEMORY_RESERVE: u64 = 10 << 20;

#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("request Content-Type isn't multipart/form-data")]
    NotMultipart,
    #[error("no multipart boundary param in Content-Type")]
    NoBoundary,
    #[error("invalid Content-Type: {0}")]
    ContentType(#[from] mime::FromStrError),
    #[error("multipart: message too large")]
    TooLarge,
    #[error("{0}")]
    Stream(#[from] multer::Error),
    #[error("failed to spool file part: {0}")]
    Spool(#[from] io::Error),
}

/// Size limits applied while parsing.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// File bytes kept in memory across the whole form.
    pub memory: u64,
    /// Upper bound on the streamed body.
    pub body: u64,
}

#[derive(Debug)]
enum Storage {
    Memory(Bytes),
    Spooled(TempPath),
}

#[derive(Debug)]
pub struct FilePart {
    filename: String,
    size: u64,
    storage: Storage,
}

impl FilePart {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self.storage, Storage::Spooled(_))
    }

    /// A fresh reader over the part content.
    pub async fn open(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin + '_>> {
        match &self.storage {
            Storage::Memory(data) => Ok(Box::new(data.as_ref())),
            Storage::Spooled(path) => Ok(Box::new(File::open(path).await?)),
        }
    }
}

struct Spool {
    file: File,
    path: TempPath,
}

impl Spool {
    async fn create() -> io::Result<Self> {
        let named = tokio::task::spawn_blocking(NamedTempFile::new)
            .await
            .map_err(io::Error::other)??;
        let (file, path) = named.into_parts();
        Ok(Self {
            file: File::from_std(file),
            path,
        })
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await
    }

    async fn finish(mut self) -> io::Result<TempPath> {
        self.file.flush().await?;
        Ok(self.path)
    }
}

#[derive(Debug, Default)]
pub struct MultipartForm {
    pub files: BTreeMap<String, Vec<FilePart>>,
    pub values: BTreeMap<String, Vec<Bytes>>,
}

impl MultipartForm {
    pub fn file_count(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn value_count(&self) -> usize {
        self.values.values().map(Vec::len).sum()
    }
}

/// Boundary of a `multipart/form-data` content type.
pub fn boundary(content_type: Option<&str>) -> Result<String, MultipartError> {
    let m: Mime = content_type.ok_or(MultipartError::NotMultipart)?.parse()?;
    if m.type_() != mime::MULTIPART || m.subtype() != mime::FORM_DATA {
        return Err(MultipartError::NotMultipart);
    }
    m.get_param(mime::BOUNDARY)
        .map(|b| b.as_str().to_owned())
        .filter(|b| !b.is_empty())
        .ok_or(MultipartError::NoBoundary)
}

/// Parse a streamed `multipart/form-data` body.
///
/// File parts stay in memory while they fit in `limits.memory`; plain values
/// may use `limits.memory + VALUE_MEMORY_RESERVE` before the form is rejected.
pub async fn parse_multipart<S, O, E>(
    boundary: String,
    stream: S,
    limits: Limits,
) -> Result<MultipartForm, MultipartError>
where
    S: Stream<Item = Result<O, E>> + Send + 'static,
    O: Into<Bytes> + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let constraints =
        multer::Constraints::new().size_limit(multer::SizeLimit::new().whole_stream(limits.body));
    let mut multipart = multer::Multipart::with_constraints(stream, boundary, constraints);

    let mut form = MultipartForm::default();
    let mut file_budget = limits.memory;
    let mut value_budget = limits.memory.saturating_add(VALUE_MEMORY_RESERVE);

    while let Some(mut field) = multipart.next_field().await? {
        let name = match field.name() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => continue,
        };
        let filename = field
            .file_name()
            .filter(|f| !f.is_empty())
            .map(str::to_owned);

        match filename {
            None => {
                let mut data = Vec::new();
                while let Some(chunk) = field.chunk().await? {
                    value_budget = value_budget
                        .checked_sub(chunk.len() as u64)
                        .ok_or(MultipartError::TooLarge)?;
                    data.extend_from_slice(&chunk);
                }
                form.values.entry(name).or_default().push(Bytes::from(data));
            }
            Some(filename) => {
                let (size, storage) = read_file(&mut field, &mut file_budget).await?;
                if !matches!(storage, Storage::Spooled(_)) {
                    value_budget = value_budget.saturating_sub(size);
                }
                form.files.entry(name).or_default().push(FilePart {
                    filename,
                    size,
                    storage,
                });
            }
        }
    }

    Ok(form)
}

/// Buffer a file part, switching to a temporary file once it outgrows `budget`.
async fn read_file(
    field: &mut multer::Field<'_>,
    budget: &mut u64,
) -> Result<(u64, Storage), MultipartError> {
    let mut size = 0u64;
    let mut buffered = Vec::new();
    let mut spool: Option<Spool> = None;

    while let Some(chunk) = field.chunk().await? {
        size += chunk.len() as u64;
        if let Some(spool) = spool.as_mut() {
            spool.write(&chunk).await?;
        } else if size > *budget {
            let mut fresh = Spool::create().await?;
            fresh.write(&buffered).await?;
            fresh.write(&chunk).await?;
            buffered = Vec::new();
            spool = Some(fresh);
        } else {
            buffered.extend_from_slice(&chunk);
        }
    }

    match spool {
        Some(spool) => Ok((size, Storage::Spooled(spool.finish().await?))),
        None => {
            *budget -= size;
            Ok((size, Storage::Memory(Bytes::from(buffered))))
        }
    }
}
