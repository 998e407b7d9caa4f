//! File download with single byte-range support.

use axum::body::{Body as AxumBody, Bytes};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use httpdate::fmt_http_date;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::STREAM_BUFFER_SIZE;
use crate::error::ApiError;
use crate::sandbox::{Sandbox, SandboxError};

/// Serves the file at `local_path`, honoring a single `Range` when it is valid.
///
/// Paths outside the sandbox, symlinks and directories all answer 404.
/// An unusable `Range` header falls back to the full file with 200. With
/// `include_body` unset (HEAD) the headers are the same and the file is not
/// opened.
pub async fn serve_file(
    sandbox: &Sandbox,
    local_path: &str,
    request_headers: &HeaderMap,
    include_body: bool,
) -> Result<Response, ApiError> {
    let target = match sandbox.resolve_checked(local_path, false).await {
        Ok(target) => target,
        Err(SandboxError::Forbidden | SandboxError::NotFound) => return Err(ApiError::NotFound),
        Err(err) => return Err(err.into()),
    };
    let metadata = fs::metadata(&target).await?;
    if !metadata.is_file() {
        return Err(ApiError::NotFound);
    }
    let file_size = metadata.len();
    let mime = mime_guess::from_path(&target).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(modified) = metadata.modified() {
        response_headers.insert(
            header::LAST_MODIFIED,
            header_value(&fmt_http_date(modified))?,
        );
    }

    let range = parse_range(request_headers.get(header::RANGE), file_size);
    let (status, start, length) = match range {
        Some((start, end)) => {
            let length = end - start + 1;
            debug!(path = local_path, start, end, length, "range request accepted");
            response_headers.insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {start}-{end}/{file_size}"))?,
            );
            (StatusCode::PARTIAL_CONTENT, start, length)
        }
        None => {
            info!(path = local_path, size = file_size, "serving full file");
            (StatusCode::OK, 0, file_size)
        }
    };
    response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);

    if !include_body {
        return Ok((status, response_headers, AxumBody::empty()).into_response());
    }

    let mut file = File::open(&target).await?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let body = AxumBody::from_stream(TrackedStream::new(file, length, target));
    Ok((status, response_headers, body).into_response())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("failed to build header".into()))
}

/// Parses `bytes=<start>-<end>` with an optional end. Returns `None` for
/// anything that is not a satisfiable single range, which callers answer with
/// the whole file.
pub fn parse_range(value: Option<&HeaderValue>, file_size: u64) -> Option<(u64, u64)> {
    let value = value?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes=")?;
    let (start_part, end_part) = range.split_once('-')?;
    let start: u64 = start_part.trim().parse().ok()?;
    let last_byte = file_size.checked_sub(1)?;
    let end: u64 = match end_part.trim() {
        "" => last_byte,
        explicit => explicit.parse().ok()?,
    };

    if start > end || end > last_byte {
        return None;
    }
    Some((start, end))
}

/// Body stream over the next `length` bytes of a file, read through a
/// bounded buffer. Ends quietly at EOF; logs when the body is dropped before
/// it is fully sent, which is how a disconnecting client shows up.
struct TrackedStream {
    inner: ReaderStream<tokio::io::Take<File>>,
    remaining: u64,
    finished: bool,
    path: PathBuf,
}

impl TrackedStream {
    fn new(file: File, length: u64, path: PathBuf) -> Self {
        Self {
            inner: ReaderStream::with_capacity(file.take(length), STREAM_BUFFER_SIZE),
            remaining: length,
            finished: false,
            path,
        }
    }
}

impl Stream for TrackedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.inner).poll_next(cx);
        match &poll {
            Poll::Ready(Some(Ok(chunk))) => {
                self.remaining = self.remaining.saturating_sub(chunk.len() as u64);
            }
            Poll::Ready(Some(Err(_)) | None) => self.finished = true,
            Poll::Pending => {}
        }
        poll
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if !self.finished && self.remaining > 0 {
            debug!(
                path = %self.path.display(),
                remaining = self.remaining,
                "response body dropped before completion"
            );
        }
    }
}
