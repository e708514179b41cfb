//! Input resolution: load document bytes from a local path or a URL.
//!
//! pdfium reads the document from memory, so both sources end up as a
//! `Vec<u8>`. The `%PDF` magic is checked here, before any pdfium call, so
//! callers get a meaningful error rather than a parser failure.

use crate::error::TableFormulaError;
use std::path::PathBuf;
use tracing::{debug, info};

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Reject empty input and bytes that do not start with `%PDF`.
pub fn validate_pdf_bytes(bytes: &[u8]) -> Result<(), TableFormulaError> {
    if bytes.is_empty() {
        return Err(TableFormulaError::EmptyDocument);
    }
    if !bytes.starts_with(b"%PDF") {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(TableFormulaError::NotAPdf { magic });
    }
    Ok(())
}

/// Load the document named by `input` (local path or HTTP/HTTPS URL).
pub async fn load_input(input: &str, timeout_secs: u64) -> Result<Vec<u8>, TableFormulaError> {
    let bytes = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(input).await?
    };
    validate_pdf_bytes(&bytes)?;
    Ok(bytes)
}

async fn read_local(path_str: &str) -> Result<Vec<u8>, TableFormulaError> {
    let path = PathBuf::from(path_str);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
            Ok(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(TableFormulaError::PermissionDenied { path })
        }
        Err(_) => Err(TableFormulaError::FileNotFound { path }),
    }
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, TableFormulaError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| TableFormulaError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            TableFormulaError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}
