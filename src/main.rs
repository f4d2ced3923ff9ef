use anyhow::{Context, Result};
use asset_uploader::{
    client::{self, FileUpload, HttpUploadClient},
    codec::DEFAULT_CHUNK_SIZE,
    config::{AppConfig, BackendKind, RunMode, UploadArgs},
    db,
    handlers::auth::ApiToken,
    retry::RetryPolicy,
    routes,
    services::{
        assembly::AssemblyConfig,
        signing::UrlSigner,
        upload_service::{PresignRequest, UploadService, UploadSettings},
    },
    storage::{DynBackend, LocalStorage, MIN_PART_SIZE, MemoryStorage},
};
use axum::Router;
use bytes::Bytes;
use std::{io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    match mode {
        RunMode::Upload(args) => run_upload(args).await,
        RunMode::Migrate => {
            let pool = db::connect(&cfg.database_url).await?;
            db::run_migrations(&pool).await?;
            tracing::info!("Database migration complete.");
            Ok(())
        }
        RunMode::Serve => serve(cfg).await,
    }
}

async fn build_backend(cfg: &AppConfig) -> Result<DynBackend> {
    match cfg.backend {
        BackendKind::Memory => {
            tracing::warn!("Using in-memory backend; uploads do not survive a restart");
            Ok(Arc::new(MemoryStorage::new()))
        }
        BackendKind::Local => {
            if !Path::new(&cfg.storage_dir).exists() {
                std::fs::create_dir_all(&cfg.storage_dir)
                    .with_context(|| format!("creating {}", cfg.storage_dir))?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            let pool = db::connect(&cfg.database_url).await?;
            db::run_migrations(&pool).await?;
            Ok(Arc::new(LocalStorage::new(
                Arc::new(pool),
                cfg.storage_dir.clone(),
            )))
        }
    }
}

async fn serve(cfg: AppConfig) -> Result<()> {
    tracing::info!(
        host = %cfg.host,
        port = cfg.port,
        backend = ?cfg.backend,
        storage_dir = %cfg.storage_dir,
        public_url = %cfg.public_url,
        "Starting asset-uploader"
    );
    if cfg.api_token.is_none() {
        tracing::warn!("ASSET_UPLOADER_API_TOKEN is not set; every upload request will be rejected");
    }

    let backend = build_backend(&cfg).await?;

    let assembly = AssemblyConfig {
        verify_policy: RetryPolicy::listing_consistency_with(cfg.verify_max_retries),
        public_url: cfg.public_url.trim_end_matches('/').to_string(),
        ..AssemblyConfig::default()
    };
    let settings = UploadSettings {
        max_direct_upload: cfg.max_direct_upload,
    };
    let signer = UrlSigner::new(&cfg.signing_secret)
        .map_err(|e| anyhow::anyhow!("invalid signing secret: {e}"))?;
    let service = UploadService::new(backend, assembly, signer, settings);

    let max_direct_upload = usize::try_from(cfg.max_direct_upload).unwrap_or(usize::MAX);
    let app: Router = routes::routes::routes(
        ApiToken::new(cfg.api_token.clone()),
        cfg.max_chunk_body,
        max_direct_upload,
    )
    .with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_upload(args: UploadArgs) -> Result<()> {
    let file_name = args
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("path has no file name")?;
    let content_type = args.content_type.clone().unwrap_or_else(|| {
        mime_guess::from_path(&args.path)
            .first_or_octet_stream()
            .to_string()
    });

    let mut builder =
        HttpUploadClient::builder(&args.server).timeout(Duration::from_secs(args.timeout_secs));
    if let Some(token) = args.token.clone() {
        builder = builder.token(token);
    }
    let http = builder.build()?;

    if args.direct {
        return run_direct_upload(&http, &args, file_name, content_type).await;
    }

    let mut file = tokio::fs::File::open(&args.path)
        .await
        .with_context(|| format!("opening {}", args.path.display()))?;
    let upload = FileUpload {
        file_name,
        content_type,
        file_size: file.metadata().await?.len(),
        chunk_size: args.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
        min_part_size: MIN_PART_SIZE,
    };
    let asset = client::upload_file(
        &http,
        RetryPolicy::chunk_transport(),
        &mut file,
        &upload,
        |p| tracing::info!(loaded = p.loaded, total = p.total, "{:.1}%", p.percent()),
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&asset)?);
    Ok(())
}

/// One presigned PUT of the whole file.
async fn run_direct_upload(
    http: &HttpUploadClient,
    args: &UploadArgs,
    file_name: String,
    content_type: String,
) -> Result<()> {
    let body = tokio::fs::read(&args.path)
        .await
        .with_context(|| format!("reading {}", args.path.display()))?;
    let presigned = http
        .presign(&PresignRequest {
            file_name,
            content_type: content_type.clone(),
            file_size: body.len() as u64,
        })
        .await?;
    let etag = http
        .put_presigned(&presigned, &content_type, Bytes::from(body))
        .await?;
    tracing::info!(asset_id = %presigned.asset_id, etag = %etag, "direct upload complete");

    println!("{}", serde_json::to_string_pretty(&presigned)?);
    Ok(())
}
