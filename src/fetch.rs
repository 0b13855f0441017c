//! Raw artifact acquisition helpers.
//!
//! Downloads are cached under the raw data directory so that re-runs skip
//! the network entirely. Retry/backoff sophistication lives with the remote
//! services, not here; a failed download surfaces to the caller.

use crate::error::Result;
use flate2::read::GzDecoder;
use std::io::Read as _;
use std::path::Path;
use tracing::{debug, info};

/// Download a URL and return the response body.
pub async fn fetch_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = client.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    debug!("Downloaded {} bytes from {}", bytes.len(), url);
    Ok(bytes.to_vec())
}

/// Download a gzip-compressed text payload and return the decompressed text.
/// NOAA archives are latin-1 encoded, so decoding is lossy rather than strict.
pub async fn fetch_gzipped_text(client: &reqwest::Client, url: &str) -> Result<String> {
    let bytes = fetch_bytes(client, url).await?;
    let mut decoder = GzDecoder::new(&bytes[..]);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    debug!("Decompressed to {} bytes", decompressed.len());
    Ok(String::from_utf8_lossy(&decompressed).into_owned())
}

/// Download `url` to `dest` unless the file already exists. Returns `true`
/// when a download happened, `false` when the cached copy was reused.
pub async fn download_cached(client: &reqwest::Client, url: &str, dest: &Path) -> Result<bool> {
    if dest.exists() {
        info!(
            "Raw file already exists, skipping download: {}",
            dest.display()
        );
        println!(
            "   Raw file already exists, skipping download: {}",
            dest.display()
        );
        return Ok(false);
    }
    println!("   Downloading from: {url}");
    let bytes = fetch_bytes(client, url).await?;
    std::fs::write(dest, &bytes)?;
    info!("Saved {} bytes -> {}", bytes.len(), dest.display());
    Ok(true)
}
