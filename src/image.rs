//! Fetching client-supplied media: data URLs or plain HTTP(S) links.

use crate::error::{RelayError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use std::time::Duration;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub mime_type: String,
    pub data: Bytes,
}

impl FetchedImage {
    pub fn is_pdf(&self) -> bool {
        self.mime_type == "application/pdf"
    }

    pub fn base64(&self) -> String {
        BASE64_STANDARD.encode(&self.data)
    }

    pub fn dimensions(&self) -> Result<(u64, u64)> {
        let size = imagesize::blob_size(&self.data).map_err(|e| {
            RelayError::translation("image_size_failed", format!("cannot measure image: {e}"))
        })?;
        Ok((size.width as u64, size.height as u64))
    }
}

#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
}

impl Default for ImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageFetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        if url.starts_with("data:") {
            return decode_data_url(url);
        }
        self.fetch_http(url).await
    }

    /// Pixel width and height of the image behind `url`.
    pub async fn dimensions(&self, url: &str) -> Result<(u64, u64)> {
        self.fetch(url).await?.dimensions()
    }

    async fn fetch_http(&self, url: &str) -> Result<FetchedImage> {
        let mut resp = self.client.get(url).send().await.map_err(|e| {
            RelayError::translation("image_fetch_failed", format!("failed to fetch image {url}: {e}"))
        })?;
        if !resp.status().is_success() {
            return Err(RelayError::translation(
                "image_fetch_failed",
                format!("failed to fetch image {url}: status {}", resp.status()),
            ));
        }
        if resp
            .content_length()
            .is_some_and(|len| len as usize > MAX_IMAGE_BYTES)
        {
            return Err(too_large(url));
        }

        let header_mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let mut buf = BytesMut::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| {
            RelayError::translation("image_fetch_failed", format!("failed to read image {url}: {e}"))
        })? {
            if buf.len() + chunk.len() > MAX_IMAGE_BYTES {
                return Err(too_large(url));
            }
            buf.extend_from_slice(&chunk);
        }
        let data = buf.freeze();

        let mime_type = match header_mime {
            Some(mime) if mime.starts_with("image/") || mime == "application/pdf" => mime,
            _ => sniff_mime(&data).ok_or_else(|| {
                RelayError::translation("image_type_unknown", format!("unrecognized media at {url}"))
            })?,
        };
        Ok(FetchedImage { mime_type, data })
    }
}

fn too_large(url: &str) -> RelayError {
    RelayError::translation(
        "image_too_large",
        format!("image at {url} exceeds {MAX_IMAGE_BYTES} bytes"),
    )
}

fn decode_data_url(url: &str) -> Result<FetchedImage> {
    let (metadata, data) = url
        .split_once(',')
        .ok_or_else(|| RelayError::translation("invalid_data_url", "missing comma in data url"))?;
    let Some(mime) = metadata
        .strip_prefix("data:")
        .and_then(|m| m.strip_suffix(";base64"))
    else {
        return Err(RelayError::translation(
            "invalid_data_url",
            "only base64 encoded data URLs are supported",
        ));
    };

    let decoded = BASE64_STANDARD
        .decode(data.trim())
        .map_err(|e| RelayError::translation("invalid_data_url", format!("invalid base64: {e}")))?;
    if decoded.len() > MAX_IMAGE_BYTES {
        return Err(too_large("data url"));
    }

    let mime_type = if mime.is_empty() {
        sniff_mime(&decoded).unwrap_or_else(|| "application/octet-stream".to_string())
    } else {
        mime.to_string()
    };
    Ok(FetchedImage {
        mime_type,
        data: Bytes::from(decoded),
    })
}

fn sniff_mime(data: &[u8]) -> Option<String> {
    if data.starts_with(b"%PDF") {
        return Some("application/pdf".to_string());
    }
    let mime = match imagesize::image_type(data).ok()? {
        imagesize::ImageType::Png => "image/png",
        imagesize::ImageType::Jpeg => "image/jpeg",
        imagesize::ImageType::Gif => "image/gif",
        imagesize::ImageType::Webp => "image/webp",
        imagesize::ImageType::Bmp => "image/bmp",
        _ => return None,
    };
    Some(mime.to_string())
}
