use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::{env, path::PathBuf, str::FromStr};
use uuid::Uuid;

const ENV_PREFIX: &str = "ASSET_UPLOADER_";

/// Which object backend serves the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// SQLite metadata + payload files under `storage_dir`.
    Local,
    /// Process memory; nothing survives a restart.
    Memory,
}

/// Centralized application configuration.
/// CLI arguments override `ASSET_UPLOADER_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub storage_dir: String,
    pub database_url: String,
    /// Base of every asset `src`.
    pub public_url: String,
    pub api_token: Option<String>,
    pub signing_secret: String,
    pub max_chunk_body: usize,
    pub max_direct_upload: u64,
    pub verify_max_retries: u32,
}

/// What the process was asked to do.
#[derive(Debug, Clone)]
pub enum RunMode {
    Serve,
    Migrate,
    Upload(UploadArgs),
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked asset upload service")]
pub struct Args {
    /// Host to bind to (overrides ASSET_UPLOADER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides ASSET_UPLOADER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Object backend (overrides ASSET_UPLOADER_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Directory where objects are stored (overrides ASSET_UPLOADER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides ASSET_UPLOADER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL of this service (overrides ASSET_UPLOADER_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Bearer token for the upload API (overrides ASSET_UPLOADER_API_TOKEN)
    #[arg(long)]
    pub api_token: Option<String>,

    /// Key for presigned URLs (overrides ASSET_UPLOADER_SIGNING_SECRET)
    #[arg(long)]
    pub signing_secret: Option<String>,

    /// Request ceiling of the chunk route in bytes (overrides ASSET_UPLOADER_MAX_CHUNK_BODY)
    #[arg(long)]
    pub max_chunk_body: Option<usize>,

    /// Largest presigned PUT or multipart part in bytes (overrides ASSET_UPLOADER_MAX_DIRECT_UPLOAD)
    #[arg(long)]
    pub max_direct_upload: Option<u64>,

    /// Listing attempts before a combine gives up (overrides ASSET_UPLOADER_VERIFY_MAX_RETRIES)
    #[arg(long)]
    pub verify_max_retries: Option<u32>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a file to a running server through the chunked pipeline
    Upload(UploadArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct UploadArgs {
    /// File to upload
    pub path: PathBuf,

    /// Base URL of the server
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    pub server: String,

    /// Bearer token (falls back to ASSET_UPLOADER_API_TOKEN)
    #[arg(long)]
    pub token: Option<String>,

    /// Chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Content type; guessed from the extension when omitted
    #[arg(long)]
    pub content_type: Option<String>,

    /// Send the whole file with one presigned PUT instead of chunks
    #[arg(long)]
    pub direct: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();

        let backend = match args.backend {
            Some(kind) => kind,
            None => match env_var("BACKEND") {
                Some(raw) => <BackendKind as ValueEnum>::from_str(&raw, true)
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("parsing {ENV_PREFIX}BACKEND value `{raw}`"))?,
                None => BackendKind::Local,
            },
        };

        let cfg = Self {
            host: args
                .host
                .or_else(|| env_var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: pick(args.port, "PORT", 3000)?,
            backend,
            storage_dir: args
                .storage_dir
                .or_else(|| env_var("STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| env_var("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/asset_uploader.db".into()),
            public_url: args
                .public_url
                .or_else(|| env_var("PUBLIC_URL"))
                .unwrap_or_else(|| "http://127.0.0.1:3000".into()),
            api_token: args.api_token.or_else(|| env_var("API_TOKEN")),
            signing_secret: args
                .signing_secret
                .or_else(|| env_var("SIGNING_SECRET"))
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            max_chunk_body: pick(args.max_chunk_body, "MAX_CHUNK_BODY", 4 * 1024 * 1024)?,
            max_direct_upload: pick(args.max_direct_upload, "MAX_DIRECT_UPLOAD", 100 * 1024 * 1024)?,
            verify_max_retries: pick(args.verify_max_retries, "VERIFY_MAX_RETRIES", 10)?,
        };

        let mode = match args.command {
            Some(Command::Upload(mut upload)) => {
                if upload.token.is_none() {
                    upload.token = cfg.api_token.clone();
                }
                RunMode::Upload(upload)
            }
            None if args.migrate => RunMode::Migrate,
            None => RunMode::Serve,
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

/// CLI value, else parsed env value, else `default`.
fn pick<T>(cli: Option<T>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match env_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{raw}`")),
        None => Ok(default),
    }
}
