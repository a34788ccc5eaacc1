use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::http_client::HttpSettings;

/// Booking session - sign in to the booking backend and call it with a managed session
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend API base URL
    #[arg(
        short = 'u',
        long,
        env = "API_BASE_URL",
        default_value = "http://127.0.0.1:8000/api/v1"
    )]
    pub api_url: String,

    /// Path to the session SQLite database
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Upper bound on the token refresh call, in seconds
    #[arg(long, env = "REFRESH_TIMEOUT", default_value = "10")]
    pub refresh_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in as a client with email and password
    LoginClient {
        email: String,
        /// Prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Sign in as a business administrator
    LoginBusiness {
        email: String,
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Request a one-time code for phone sign-in
    SendOtp { phone: String },

    /// Sign in with a one-time code
    VerifyOtp {
        phone: String,
        /// Prompted for when omitted
        code: Option<String>,
    },

    /// Create a client account and sign in
    Register {
        email: String,
        #[arg(short, long)]
        name: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Show the current session
    Status,

    /// Forget the current session
    Logout,

    /// Authenticated GET
    Get { path: String },

    /// Authenticated POST with a JSON body
    Post {
        path: String,
        #[arg(default_value = "{}")]
        body: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_base_url: String,

    // Session storage
    pub session_db_file: PathBuf,

    // Timeouts
    pub refresh_timeout: u64,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // HTTP client
    pub http_max_connections: usize,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args)?;
        Ok((config, args.command))
    }

    /// Build the configuration from parsed arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let session_db_file = match &args.db_file {
            Some(path) => expand_tilde(path),
            None => default_db_path().context(
                "Could not determine a data directory (use -d or set SESSION_DB_FILE)",
            )?,
        };

        Ok(Config {
            api_base_url: args.api_url.trim_end_matches('/').to_string(),

            session_db_file,

            refresh_timeout: args.refresh_timeout,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            log_level: args.log_level.clone(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            anyhow::bail!(
                "API_BASE_URL must be an http(s) URL: {}",
                self.api_base_url
            );
        }

        if self.refresh_timeout == 0 {
            anyhow::bail!("REFRESH_TIMEOUT must be at least one second");
        }

        Ok(())
    }

    /// Settings for the request dispatcher
    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            base_url: self.api_base_url.clone(),
            max_connections: self.http_max_connections,
            connect_timeout: Duration::from_secs(self.http_connect_timeout),
            request_timeout: Duration::from_secs(self.http_request_timeout),
            refresh_timeout: Duration::from_secs(self.refresh_timeout),
        }
    }
}

/// Default location of the session database
fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("booking-session").join("session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
