//! HTML directory listings, gzip-compressed on the way out.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Local};
use flate2::Compression;
use flate2::write::GzEncoder;
use html_escape::{encode_double_quoted_attribute, encode_text};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::time::SystemTime;
use tokio::fs;
use tracing::info;

use crate::error::ApiError;
use crate::sandbox::{Sandbox, SandboxError};
use crate::settings::Settings;

/// Characters left unescaped in links: the RFC 3986 unreserved set.
const LINK_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const STYLE: &str = concat!(
    "table { width: 100%; border-collapse: collapse; }",
    "th, td { padding: 3px; text-align: left; border: 1px solid #ddd; }",
    "th { background-color: #f2f2f2; }",
    "tr:nth-child(even) { background-color: #f9f9f9; }",
    "tr:hover { background-color: #f1f1f1; }",
    "td:nth-child(2), td:nth-child(3) { white-space: nowrap; }",
    "td:first-child { word-break: break-all; width: 100%; }",
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// What the page needs to know besides the entries themselves.
pub struct ListingPage<'a> {
    pub local_path: &'a str,
    pub at_root: bool,
    pub show_notification: bool,
    pub config_path: &'a Path,
}

/// Renders the listing for `local_path` (which ends in `/`).
pub async fn list_directory(
    sandbox: &Sandbox,
    local_path: &str,
    settings: &Settings,
    config_path: &Path,
) -> Result<Response, ApiError> {
    let target = match sandbox.resolve_checked(local_path, false).await {
        Ok(target) => target,
        Err(SandboxError::Forbidden | SandboxError::NotFound) => return Err(ApiError::NotFound),
        Err(err) => return Err(err.into()),
    };
    if !fs::metadata(&target).await?.is_dir() {
        return Err(ApiError::NotFound);
    }

    let entries = read_entries(&target).await?;
    info!(path = local_path, count = entries.len(), "list directory");
    let page = ListingPage {
        local_path,
        at_root: sandbox.is_root(&target),
        show_notification: settings.show_notification,
        config_path,
    };
    let html = render_listing(&page, &entries);
    let compressed = gzip(html.as_bytes())?;

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            ),
            (header::CONTENT_ENCODING, HeaderValue::from_static("gzip")),
            (header::CONTENT_LENGTH, HeaderValue::from(compressed.len())),
        ],
        compressed,
    )
        .into_response())
}

/// Immediate children of `dir`, symlinks left out. Directories come first.
pub async fn read_entries(dir: &Path) -> Result<Vec<ListingEntry>, ApiError> {
    let mut read_dir = fs::read_dir(dir).await?;
    let mut entries = Vec::new();

    while let Some(entry) = read_dir.next_entry().await? {
        let file_type = entry.file_type().await?;
        if file_type.is_symlink() {
            continue;
        }
        let metadata = entry.metadata().await?;
        entries.push(ListingEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: file_type.is_dir(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
        });
    }

    entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });
    Ok(entries)
}

/// Builds the listing page HTML, before compression.
pub fn render_listing(page: &ListingPage<'_>, entries: &[ListingEntry]) -> String {
    let mut html = String::from("<!DOCTYPE html><html><head><style>");
    html.push_str(STYLE);
    html.push_str("</style></head><body><h1>Directory Listing</h1>");

    if page.show_notification {
        html.push_str(
            "<div class=\"notification\" style=\"background-color: #f44336; color: white; text-align: center; padding: 10px;\">",
        );
        let _ = write!(
            html,
            "<p>Warning: You are using the default configuration. Edit the config at {}</p></div>",
            encode_text(&page.config_path.to_string_lossy())
        );
    } else {
        html.push_str("<form action=\"/uploadFile\" method=\"POST\" enctype=\"multipart/form-data\">");
        html.push_str("<input type=\"file\" name=\"uploadedFile\"/>");
        html.push_str("<input type=\"submit\" value=\"Upload File\"/>");
        let _ = write!(
            html,
            "<input type=\"hidden\" name=\"currentPath\" value=\"{}\"/></form>",
            encode_double_quoted_attribute(page.local_path)
        );
    }

    html.push_str("<table><tr><th>Name</th><th>Size</th><th>Last Modified</th></tr>");
    if !page.at_root {
        html.push_str("<tr><td><a href=\"../\">..</a></td><td>Directory</td><td></td></tr>");
    }

    let prefix = escape_link_path(page.local_path.trim_end_matches('/'));
    for entry in entries {
        let name = encode_text(&entry.name);
        let link = utf8_percent_encode(&entry.name, LINK_SEGMENT);
        let modified = entry.modified.map(format_modified).unwrap_or_default();
        if entry.is_dir {
            let _ = write!(
                html,
                "<tr><td><a href=\"{prefix}/{link}/\">{name}/</a></td><td>Directory</td><td>{modified}</td></tr>"
            );
        } else {
            let size = format_size(entry.size);
            let _ = write!(
                html,
                "<tr><td><a href=\"{prefix}/{link}\">{name}</a></td><td>{size}</td><td>{modified}</td></tr>"
            );
        }
    }

    html.push_str("</table><p><a href=\"?logout=401\">Log out</a></p></body></html>");
    html
}

/// Human-readable size, truncating to whole units.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    match bytes {
        b if b < KB => format!("{b} B"),
        b if b < MB => format!("{} KB", b / KB),
        b if b < GB => format!("{} MB", b / MB),
        b => format!("{} GB", b / GB),
    }
}

fn format_modified(time: SystemTime) -> String {
    let local: DateTime<Local> = time.into();
    local.format("%Y-%m-%d %I:%M:%S %p").to_string()
}

fn escape_link_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, LINK_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
