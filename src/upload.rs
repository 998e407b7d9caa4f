//! Multipart upload handler.
//!
//! The body is not run through a MIME parser. It is spooled to disk and read
//! twice, line by line: the first pass picks up the `filename` and the
//! `currentPath` field, the second copies the lines between the file part's
//! headers and the next boundary into the destination, each line re-terminated
//! with CRLF. Content containing a line that starts with the boundary marker
//! ends the copy early.

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::atomic::AtomicFile;
use crate::auth::require_auth;
use crate::config::UPLOAD_SUCCESS_BODY;
use crate::error::ApiError;
use crate::sandbox::Sandbox;
use crate::settings::SettingsStore;

const CURRENT_PATH_FIELD: &[u8] = br#"name="currentPath""#;

/// Form values found by the first pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UploadFields {
    pub filename: String,
    pub current_path: String,
}

/// `POST /uploadFile`.
pub async fn upload_file(
    Extension(sandbox): Extension<Arc<Sandbox>>,
    Extension(store): Extension<Arc<SettingsStore>>,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<Response, ApiError> {
    require_auth(&headers, &store).await?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("multipart/form-data") {
        return Err(ApiError::BadRequest("expected multipart/form-data".into()));
    }
    let boundary = multipart_boundary(content_type)
        .ok_or_else(|| ApiError::BadRequest("missing multipart boundary".into()))?;

    let spool = spool_body(body).await?;
    let mut reader = BufReader::new(spool);
    let fields = scan_fields(&mut reader).await?;
    if fields.filename.is_empty() {
        return Err(ApiError::BadRequest("no file in upload".into()));
    }

    let relative = format!(
        "{}/{}",
        fields.current_path.trim_start_matches('/'),
        fields.filename.trim_start_matches('/')
    );
    info!(filename = fields.filename, current_path = fields.current_path, "upload requested");
    let target = sandbox.resolve_checked(&relative, true).await?;
    if sandbox.is_root(&target) || target.file_name().is_none() {
        warn!(path = %target.display(), "upload target is the sandbox root");
        return Err(ApiError::Forbidden);
    }
    if fs::metadata(&target).await.is_ok_and(|metadata| metadata.is_dir()) {
        warn!(path = %target.display(), "upload target is a directory");
        return Err(ApiError::Forbidden);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    reader.seek(SeekFrom::Start(0)).await?;
    let mut atomic = AtomicFile::create(&target).await?;
    let copied = match copy_file_part(&mut reader, &boundary, atomic.file_mut()).await {
        Ok(copied) => copied,
        Err(err) => {
            atomic.discard().await;
            return Err(err.into());
        }
    };
    atomic.finalize().await?;
    info!(path = %target.display(), bytes = copied, "upload stored");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/plain")),
            (
                header::CONTENT_LENGTH,
                HeaderValue::from(UPLOAD_SUCCESS_BODY.len()),
            ),
        ],
        UPLOAD_SUCCESS_BODY,
    )
        .into_response())
}

/// Extracts the `boundary=` parameter from a multipart content type.
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("boundary="))
        .map(|value| value.trim().trim_matches('"').to_string())
        .find(|value| !value.is_empty())
}

/// Copies the request body into an anonymous temp file and rewinds it.
async fn spool_body(body: AxumBody) -> Result<File, ApiError> {
    let spool = tokio::task::spawn_blocking(tempfile::tempfile)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;
    let mut spool = File::from_std(spool);

    let mut data_stream = BodyExt::into_data_stream(body);
    let mut total: u64 = 0;
    while let Some(chunk) = data_stream.next().await {
        let chunk = chunk.map_err(|err: AxumError| ApiError::Internal(err.to_string()))?;
        total += chunk.len() as u64;
        spool.write_all(&chunk).await?;
    }
    spool.flush().await?;
    spool.seek(SeekFrom::Start(0)).await?;
    debug!(bytes = total, "upload body spooled");
    Ok(spool)
}

/// Reads one line, without its `\n` and a preceding `\r`. `None` at EOF.
async fn next_line<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn is_file_disposition(line: &[u8]) -> bool {
    contains(line, b"Content-Disposition") && contains(line, b"filename")
}

fn filename_from_disposition(line: &[u8]) -> String {
    String::from_utf8_lossy(line)
        .split(';')
        .map(str::trim)
        .find(|part| part.starts_with("filename="))
        .map(|part| {
            part.replace("filename=", "")
                .trim_matches([' ', '"'])
                .to_string()
        })
        .unwrap_or_default()
}

/// First pass: finds the uploaded filename and the `currentPath` field.
pub async fn scan_fields<R>(reader: &mut R) -> std::io::Result<UploadFields>
where
    R: AsyncBufRead + Unpin,
{
    let mut fields = UploadFields::default();
    while let Some(line) = next_line(reader).await? {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if is_file_disposition(&line) {
            fields.filename = filename_from_disposition(&line);
        }
        if contains(&line, CURRENT_PATH_FIELD) {
            next_line(reader).await?;
            let value = next_line(reader).await?.unwrap_or_default();
            fields.current_path = String::from_utf8_lossy(&value).trim().to_string();
        }
    }
    Ok(fields)
}

/// Second pass: writes the file part's lines to `out`, returning the byte count.
pub async fn copy_file_part<R, W>(reader: &mut R, boundary: &str, out: &mut W) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let marker = format!("--{boundary}");
    let mut writing = false;
    let mut written: u64 = 0;

    while let Some(line) = next_line(reader).await? {
        if line.starts_with(marker.as_bytes()) {
            if writing {
                break;
            }
        } else if writing {
            out.write_all(&line).await?;
            out.write_all(b"\r\n").await?;
            written += line.len() as u64 + 2;
        }

        if is_file_disposition(&line) {
            // Part headers run until the first empty line.
            while let Some(header_line) = next_line(reader).await? {
                if header_line.is_empty() {
                    break;
                }
            }
            writing = true;
        }
    }
    out.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
    use std::io::Cursor;
    use tempfile::tempdir;

    const BOUNDARY: &str = "----formBoundary7MA4YWxk";

    fn multipart_body(current_path: &str, filename: &str, content: &str) -> String {
        format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"uploadedFile\"; filename=\"{filename}\"\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             {content}\r\n\
             --{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"currentPath\"\r\n\
             \r\n\
             {current_path}\r\n\
             --{BOUNDARY}--\r\n"
        )
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        sandbox: Arc<Sandbox>,
        store: Arc<SettingsStore>,
    }

    async fn fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let sandbox = Sandbox::open(&temp.path().join("root"))
            .await
            .expect("open sandbox");
        let store = SettingsStore::new(temp.path().join("config.json"));
        Fixture {
            _temp: temp,
            sandbox: Arc::new(sandbox),
            store: Arc::new(store),
        }
    }

    fn upload_headers(credentials: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("multipart/form-data; boundary={BOUNDARY}"))
                .expect("content type"),
        );
        if let Some(credentials) = credentials {
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Basic {}", BASE64_STANDARD.encode(credentials)))
                    .expect("authorization"),
            );
        }
        headers
    }

    async fn post(fixture: &Fixture, headers: HeaderMap, body: String) -> Result<Response, ApiError> {
        upload_file(
            Extension(fixture.sandbox.clone()),
            Extension(fixture.store.clone()),
            headers,
            AxumBody::from(body),
        )
        .await
    }

    #[test]
    fn boundary_parameter_is_extracted() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            multipart_boundary("multipart/form-data; charset=utf-8; boundary=\"q r\"").as_deref(),
            Some("q r")
        );
        assert_eq!(multipart_boundary("multipart/form-data"), None);
    }

    #[tokio::test]
    async fn scan_finds_filename_and_path_in_any_order() {
        let body = multipart_body("/music/", "song.txt", "la la");
        let fields = scan_fields(&mut Cursor::new(body.into_bytes()))
            .await
            .expect("scan");
        assert_eq!(
            fields,
            UploadFields {
                filename: "song.txt".into(),
                current_path: "/music/".into(),
            }
        );

        let reversed = String::from(
            "--b\r\nContent-Disposition: form-data; name=\"currentPath\"\r\n\r\ndocs\r\n\
             --b\r\nContent-Disposition: form-data; name=\"uploadedFile\"; filename=\"a.txt\"\r\n\r\nx\r\n--b--\r\n",
        );
        let fields = scan_fields(&mut Cursor::new(reversed.into_bytes()))
            .await
            .expect("scan");
        assert_eq!(fields.filename, "a.txt");
        assert_eq!(fields.current_path, "docs");
    }

    #[tokio::test]
    async fn copy_reterminates_lines_with_crlf() {
        let body = multipart_body("/", "notes.txt", "line one\nline two");
        let mut out = Vec::new();
        let written = copy_file_part(&mut Cursor::new(body.into_bytes()), BOUNDARY, &mut out)
            .await
            .expect("copy");
        assert_eq!(out, b"line one\r\nline two\r\n");
        assert_eq!(written, out.len() as u64);
    }

    #[tokio::test]
    async fn upload_writes_into_subdirectory() {
        let fixture = fixture().await;
        let response = post(
            &fixture,
            upload_headers(Some("admin:password")),
            multipart_body("subdir", "test.txt", "hello"),
        )
        .await
        .expect("upload");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH),
            Some(&HeaderValue::from_static("26"))
        );
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect")
            .to_bytes();
        assert_eq!(&body[..], b"File uploaded successfully");

        let stored = fs::read(fixture.sandbox.root_path().join("subdir").join("test.txt"))
            .await
            .expect("read upload");
        // The line scanner re-terminates every copied line.
        assert_eq!(stored, b"hello\r\n");
    }

    #[tokio::test]
    async fn upload_requires_credentials() {
        let fixture = fixture().await;
        for credentials in [None, Some("admin:nope")] {
            let result = post(
                &fixture,
                upload_headers(credentials),
                multipart_body("/", "test.txt", "hello"),
            )
            .await;
            assert!(matches!(result, Err(ApiError::Unauthorized)));
        }
        assert!(!fixture.sandbox.root_path().join("test.txt").exists());
    }

    #[tokio::test]
    async fn upload_outside_sandbox_is_forbidden() {
        let fixture = fixture().await;
        let root = fixture.sandbox.root_path().to_path_buf();
        let outside = root.parent().expect("parent").join("escaped.txt");

        for (path, name) in [("../", "escaped.txt"), ("/", "../escaped.txt"), ("a/../../", "escaped.txt")] {
            let result = post(
                &fixture,
                upload_headers(Some("admin:password")),
                multipart_body(path, name, "nope"),
            )
            .await;
            assert!(matches!(result, Err(ApiError::Forbidden)), "{path}{name}");
        }
        assert!(!outside.exists());
        assert!(!root.join("a").exists());
    }

    #[tokio::test]
    async fn upload_onto_root_or_directory_is_forbidden() {
        let fixture = fixture().await;
        let root = fixture.sandbox.root_path().to_path_buf();
        std::fs::create_dir_all(root.join("sub")).expect("create sub");

        for (path, name) in [("sub", ".."), ("", "."), ("/", "sub")] {
            let result = post(
                &fixture,
                upload_headers(Some("admin:password")),
                multipart_body(path, name, "nope"),
            )
            .await;
            assert!(matches!(result, Err(ApiError::Forbidden)), "{path}/{name}");
        }

        let parent = root.parent().expect("parent");
        let beside_root: Vec<String> = std::fs::read_dir(parent)
            .expect("read parent")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .filter(|name| name != "root" && name != "config.json")
            .collect();
        assert!(beside_root.is_empty(), "{beside_root:?}");
        assert_eq!(std::fs::read_dir(&root).expect("read root").count(), 1);
        assert_eq!(std::fs::read_dir(root.join("sub")).expect("read sub").count(), 0);
    }

    #[tokio::test]
    async fn upload_rejects_non_multipart() {
        let fixture = fixture().await;
        let mut headers = upload_headers(Some("admin:password"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let result = post(&fixture, headers, "hello".into()).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn concurrent_uploads_to_same_path_last_writer_wins() {
        let fixture = fixture().await;
        let first = post(
            &fixture,
            upload_headers(Some("admin:password")),
            multipart_body("shared", "same.txt", "first"),
        );
        let second = post(
            &fixture,
            upload_headers(Some("admin:password")),
            multipart_body("shared", "same.txt", "second"),
        );
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.expect("first upload").status(), StatusCode::OK);
        assert_eq!(second.expect("second upload").status(), StatusCode::OK);

        // No serialization between writers; either body may be the survivor.
        let stored = fs::read(fixture.sandbox.root_path().join("shared").join("same.txt"))
            .await
            .expect("read upload");
        assert!(stored == b"first\r\n" || stored == b"second\r\n");
    }
}
