//! Streaming file I/O on top of the buffer pool.
//!
//! Copies, compression and hashing move data through a single pooled buffer instead of
//! loading whole files into memory. Errors from opening, reading or writing surface as
//! `DeckflowError::Io`; a partially written destination is left in place.

pub mod hash;

use crate::utils::pool::BufferPool;
use crate::{DeckflowError, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::future::Future;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};

pub use hash::sha256_hex;

/// Pooled, chunked file operations.
#[derive(Debug, Clone, Default)]
pub struct StreamingIo {
    pool: BufferPool,
}

impl StreamingIo {
    pub fn new(pool: BufferPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Copy `src` to `dst` through a pooled buffer.
    ///
    /// `on_progress` receives `(bytes_copied, total_bytes)` after every chunk; the last call
    /// reports `bytes_copied == total_bytes` unless the source changed during the copy.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # async fn demo() -> deckflow::Result<()> {
    /// use deckflow::io::StreamingIo;
    ///
    /// let io = StreamingIo::default();
    /// io.copy_file("in.pptx", "out.pptx", None::<fn(u64, u64)>).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn copy_file<P>(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>, on_progress: Option<P>) -> Result<u64>
    where
        P: FnMut(u64, u64) + Send,
    {
        let mut buffer = self.pool.acquire();
        copy_through(src.as_ref(), dst.as_ref(), &mut buffer, on_progress).await
    }

    /// Same as [`copy_file`](Self::copy_file) but through a caller-provided buffer.
    pub async fn copy_file_with_buffer<P>(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        buffer: &mut [u8],
        on_progress: Option<P>,
    ) -> Result<u64>
    where
        P: FnMut(u64, u64) + Send,
    {
        copy_through(src.as_ref(), dst.as_ref(), buffer, on_progress).await
    }

    /// Place a copy of `src` at `dst` without ever exposing a partial file there.
    ///
    /// The content goes to a uniquely named sibling first and is renamed into place. If
    /// `dst` already holds `expected_len` bytes it is reused as is, so concurrent stagings of
    /// the same content never truncate a file another reader has open.
    pub async fn stage_file(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>, expected_len: u64) -> Result<u64> {
        let (src, dst) = (src.as_ref(), dst.as_ref());
        if staged_len(dst).await == Some(expected_len) {
            tracing::debug!("Reusing staged copy {}", dst.display());
            return Ok(expected_len);
        }

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = dst.with_file_name(format!(
            ".{}.{}.part",
            crate::types::file_name(dst),
            uuid::Uuid::new_v4().simple()
        ));

        let mut buffer = self.pool.acquire();
        let copied = match copy_through(src, &partial, &mut buffer, None::<fn(u64, u64)>).await {
            Ok(copied) => copied,
            Err(err) => {
                let _ = fs::remove_file(&partial).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&partial, dst).await {
            let _ = fs::remove_file(&partial).await;
            // another stager won the race
            if staged_len(dst).await == Some(copied) {
                return Ok(copied);
            }
            return Err(err.into());
        }
        Ok(copied)
    }

    /// Gzip `src` into `dst`. Returns the number of uncompressed bytes read.
    pub async fn compress_file(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<u64> {
        let src = src.as_ref().to_path_buf();
        let dst = dst.as_ref().to_path_buf();
        let pool = self.pool.clone();

        run_blocking("compression", move || {
            let mut buffer = pool.acquire();
            let mut reader = std::fs::File::open(&src)?;
            let writer = std::io::BufWriter::new(std::fs::File::create(&dst)?);
            let mut encoder = GzEncoder::new(writer, Compression::default());

            let mut total = 0u64;
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                encoder.write_all(&buffer[..n])?;
                total += n as u64;
            }

            encoder.finish()?.flush()?;
            tracing::debug!("Compressed {} bytes from {} to {}", total, src.display(), dst.display());
            Ok(total)
        })
        .await
    }

    /// Inflate gzip `src` into `dst`. Returns the number of bytes written.
    pub async fn decompress_file(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<u64> {
        let src = src.as_ref().to_path_buf();
        let dst = dst.as_ref().to_path_buf();
        let pool = self.pool.clone();

        run_blocking("decompression", move || {
            let mut buffer = pool.acquire();
            let mut decoder = GzDecoder::new(std::io::BufReader::new(std::fs::File::open(&src)?));
            let mut writer = std::io::BufWriter::new(std::fs::File::create(&dst)?);

            let mut total = 0u64;
            loop {
                let n = decoder.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buffer[..n])?;
                total += n as u64;
            }

            writer.flush()?;
            Ok(total)
        })
        .await
    }

    /// Read `path` in chunks of `chunk_size` bytes, awaiting `on_chunk(chunk, index)` before
    /// reading the next one. Every chunk except the last is exactly `chunk_size` bytes.
    ///
    /// Returns the total number of bytes read. An error from `on_chunk` stops the read.
    pub async fn read_file_in_chunks<F, Fut>(&self, path: impl AsRef<Path>, chunk_size: usize, mut on_chunk: F) -> Result<u64>
    where
        F: FnMut(Vec<u8>, usize) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if chunk_size == 0 {
            return Err(DeckflowError::validation("chunk_size must be greater than zero"));
        }

        let mut file = fs::File::open(path.as_ref()).await?;
        let mut total = 0u64;
        let mut index = 0usize;

        loop {
            let mut chunk = vec![0u8; chunk_size];
            let filled = fill_buffer(&mut file, &mut chunk).await?;
            if filled == 0 {
                break;
            }
            chunk.truncate(filled);
            total += filled as u64;

            on_chunk(chunk, index).await?;
            index += 1;

            if filled < chunk_size {
                break;
            }
        }

        Ok(total)
    }

    /// Hand an open, buffered reader for `path` to `processor`. The file is closed when the
    /// processor returns, whatever the outcome.
    pub async fn process_file_stream<F, Fut, T>(&self, path: impl AsRef<Path>, processor: F) -> Result<T>
    where
        F: FnOnce(BufReader<fs::File>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let file = fs::File::open(path.as_ref()).await?;
        let reader = BufReader::with_capacity(self.pool.buffer_size().max(1), file);
        processor(reader).await
    }

    /// Hex SHA-256 of the file content, streamed through a pooled buffer.
    pub async fn hash_file(&self, path: impl AsRef<Path>) -> Result<String> {
        let mut file = fs::File::open(path.as_ref()).await?;
        let mut buffer = self.pool.acquire();
        let mut hasher = hash::ContentHasher::default();

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hasher.finish())
    }

    /// Drop every pooled buffer.
    pub fn dispose(&self) {
        self.pool.clear();
    }
}

/// Drain an async reader into memory.
pub async fn stream_to_buffer<R>(mut reader: R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await?;
    Ok(data)
}

/// Expose an in-memory buffer as an async reader.
pub fn buffer_to_stream(data: Vec<u8>) -> std::io::Cursor<Vec<u8>> {
    std::io::Cursor::new(data)
}

async fn copy_through<P>(src: &Path, dst: &Path, buffer: &mut [u8], mut on_progress: Option<P>) -> Result<u64>
where
    P: FnMut(u64, u64) + Send,
{
    if buffer.is_empty() {
        return Err(DeckflowError::validation("Copy buffer must not be empty"));
    }

    let mut reader = fs::File::open(src).await?;
    let total = reader.metadata().await?.len();
    let mut writer = fs::File::create(dst).await?;
    let mut copied = 0u64;

    loop {
        let n = reader.read(buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        copied += n as u64;

        if let Some(callback) = on_progress.as_mut() {
            callback(copied, total);
        }
    }

    writer.flush().await?;

    if copied == 0
        && let Some(callback) = on_progress.as_mut()
    {
        callback(0, total);
    }

    tracing::debug!("Copied {} bytes from {} to {}", copied, src.display(), dst.display());
    Ok(copied)
}

async fn staged_len(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .await
        .ok()
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
}

async fn fill_buffer(file: &mut fs::File, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn run_blocking<T, F>(what: &str, job: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| DeckflowError::Other(format!("{} task panicked: {}", what, e)))?
}

/// Staging path for `input` inside `work_dir`: `<work_dir>/<stem>_<hash prefix>/<file name>`.
pub fn staging_path(work_dir: &Path, input: &Path, content_hash: &str) -> PathBuf {
    let prefix: String = content_hash.chars().take(16).collect();
    work_dir
        .join(format!("{}_{}", crate::types::file_stem(input), prefix))
        .join(crate::types::file_name(input))
}
