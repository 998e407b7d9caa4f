//! CLI arguments and server configuration defaults.

use clap::Parser;
use std::path::PathBuf;

pub const CONFIG_DIR_NAME: &str = "MediaServer";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_AUTH_USER: &str = "admin";
pub const DEFAULT_AUTH_PASS: &str = "password";
pub const DEFAULT_INTERFACE: &str = "*";
pub const DEFAULT_PORT: u16 = 8080;
pub const AUTH_REALM: &str = r#"Basic realm="Secure Area""#;
pub const LOGOUT_QUERY: &str = "logout=401";
pub const UPLOAD_ROUTE: &str = "/uploadFile";
pub const STREAM_BUFFER_SIZE: usize = 1024 * 1024;
pub const UPLOAD_SUCCESS_BODY: &str = "File uploaded successfully";
pub const NOT_FOUND_BODY: &str = "<html><body><h1>404 Not Found</h1></body></html>";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "media-drive", version, about = "Authenticated HTTP file server")]
pub struct Args {
    #[arg(
        env = "MEDIA_DRIVE_CONFIG",
        help = "Path to the settings file (created with defaults if missing)"
    )]
    pub config: Option<PathBuf>,
    #[arg(
        short = 'b',
        long,
        env = "MEDIA_DRIVE_BIND",
        help = "Bind interface, overrides the settings file"
    )]
    pub bind: Option<String>,
    #[arg(
        short = 'p',
        long,
        env = "MEDIA_DRIVE_PORT",
        help = "HTTP port, overrides the settings file"
    )]
    pub port: Option<u16>,
}

impl Args {
    /// Returns the settings path, falling back to the platform config directory.
    pub fn config_path(&self) -> PathBuf {
        if let Some(path) = &self.config {
            return path.clone();
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }
}
