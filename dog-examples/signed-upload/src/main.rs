use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dog_upload::{
    FileSource, HttpGrantIssuer, HttpTransport, SignedUploader, UploadConfig, UploadEvent,
    UploadRequest,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Uploads every file named on the command line through a signed-URL issuer.
///
/// `SIGNED_UPLOAD_ISSUER_URL` points at the issuer endpoint and
/// `SIGNED_UPLOAD_ISSUER_TOKEN`, when set, is sent as a bearer token. Pipeline
/// settings come from `DOG_UPLOAD__*`. Events are printed as JSON lines.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        bail!("usage: signed-upload <file>...");
    }

    let endpoint = std::env::var("SIGNED_UPLOAD_ISSUER_URL")
        .context("SIGNED_UPLOAD_ISSUER_URL is not set")?;
    let mut issuer = HttpGrantIssuer::new(endpoint);
    if let Ok(token) = std::env::var("SIGNED_UPLOAD_ISSUER_TOKEN") {
        issuer = issuer.with_bearer_token(token);
    }

    let config = UploadConfig::from_env("DOG_UPLOAD")?;
    info!(
        chunk_size = config.chunk_size,
        max_concurrent_transfers = config.max_concurrent_transfers,
        "configured"
    );
    let uploader = SignedUploader::new(Arc::new(issuer), Arc::new(HttpTransport::new()), config)?;

    let mut items = Vec::with_capacity(paths.len());
    for path in &paths {
        let request = UploadRequest::for_file(path)
            .await
            .with_context(|| format!("cannot read {}", path))?;
        items.push((request, FileSource::new(path)));
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling uploads");
                cancel.cancel();
            }
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<UploadEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("cannot serialize event: {}", e),
            }
        }
    });

    let results = uploader.upload_all(items, Arc::new(tx), &cancel).await;
    printer.await?;

    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        bail!("{} of {} uploads failed", failed, results.len());
    }
    Ok(())
}
