//! Upload persistence: where an uploaded file lands and how its bytes get there.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Uploads are copied to disk in chunks of this size.
pub const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// How a client-supplied filename becomes a storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilenamePolicy {
    /// Use the filename verbatim. `../` segments and separators are honored,
    /// so a crafted name can land outside the storage directory.
    #[default]
    Raw,
    /// Keep only the final path component.
    Sanitize,
}

#[derive(Debug, thiserror::Error)]
#[error("filename {0:?} has no usable file name component")]
pub struct InvalidFilename(pub String);

/// A file written to the storage directory for one request.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub filename: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Resolve the on-disk path for an uploaded `filename`.
///
/// This is the single place that decides between raw and sanitized names.
/// Raw mode concatenates `storage_dir`, `/` and the name as-is, so even an
/// absolute name stays textually under the directory while `..` still escapes it.
pub fn storage_path(
    storage_dir: &Path,
    filename: &str,
    policy: FilenamePolicy,
) -> Result<PathBuf, InvalidFilename> {
    match policy {
        FilenamePolicy::Raw => {
            if is_suspicious(filename) {
                tracing::warn!(
                    filename,
                    "upload filename contains path segments; storing verbatim"
                );
            }
            let mut raw = OsString::from(storage_dir.as_os_str());
            raw.push("/");
            raw.push(filename);
            Ok(PathBuf::from(raw))
        }
        FilenamePolicy::Sanitize => {
            let name = filename
                .rsplit(['/', '\\'])
                .next()
                .filter(|n| !n.is_empty() && *n != "." && *n != "..")
                .ok_or_else(|| InvalidFilename(filename.to_string()))?;
            Ok(storage_dir.join(name))
        }
    }
}

fn is_suspicious(filename: &str) -> bool {
    filename.contains(['/', '\\'])
        || Path::new(filename)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
}

/// Copy `reader` into a freshly truncated file at `path`, one chunk at a time.
///
/// Each chunk is filled up to [`UPLOAD_CHUNK_SIZE`] before it is written;
/// copying stops at the first read that yields nothing. Returns the byte count.
pub async fn persist_upload<R>(mut reader: R, path: &Path) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(path).await?;
    let mut chunk = vec![0u8; UPLOAD_CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let len = fill_chunk(&mut reader, &mut chunk).await?;
        if len == 0 {
            break;
        }
        file.write_all(&chunk[..len]).await?;
        written += len as u64;
    }

    file.flush().await?;
    Ok(written)
}

/// Read until `buf` is full or the reader is exhausted.
async fn fill_chunk<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
