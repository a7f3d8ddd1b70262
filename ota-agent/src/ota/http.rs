//! Chunked HTTP downloader feeding a sink callback.
//!
//! Grounded on `tachtalk-firmware/src/ota.rs`'s `download_and_update`
//! (`EspHttpConnection` + TLS cert bundle + `Content-Length` parsing),
//! generalized from a single inline reader closure into the sink-callback,
//! abortable contract the engine needs.

use anyhow::{anyhow, bail, Result};
use std::time::Duration;

/// One delivery to the sink. `socket_handle` is an opaque per-download
/// identifier a sink can pass back to `abort`.
pub struct Chunk<'a> {
    pub socket_handle: u32,
    pub chunk_start: usize,
    pub chunk_size: usize,
    pub total_size: usize,
    pub last_chunk: bool,
    pub data: &'a [u8],
}

/// Returned by the sink to continue or abort the download.
pub enum SinkResult {
    Continue,
    Abort,
}

pub type Sink<'a> = dyn FnMut(Chunk) -> SinkResult + 'a;

/// `download(url, headers, timeout_ms, sink)`. The sink is invoked zero or
/// more times; `SinkResult::Abort` unwinds the operation cleanly and
/// `download` returns `Err` with a `Canceled`-shaped message so the caller
/// can distinguish it from a genuine network failure.
pub trait HttpDownloader: Send {
    fn download(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        timeout_ms: u64,
        sink: &mut Sink<'_>,
    ) -> Result<()>;
}

/// Sentinel error used so callers can tell "sink asked us to stop" apart
/// from a genuine transport failure without a downcast.
pub const ABORTED_BY_SINK: &str = "aborted by sink";

/// ESP-IDF-backed `HttpDownloader`, wrapping `EspHttpConnection`.
pub struct EspHttpDownloader;

impl Default for EspHttpDownloader {
    fn default() -> Self {
        Self
    }
}

impl HttpDownloader for EspHttpDownloader {
    fn download(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        timeout_ms: u64,
        sink: &mut Sink<'_>,
    ) -> Result<()> {
        use embedded_svc::io::Read;
        use esp_idf_svc::http::client::{Configuration, EspHttpConnection, FollowRedirectsPolicy};

        let mut conn = EspHttpConnection::new(&Configuration {
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            timeout: Some(Duration::from_millis(timeout_ms)),
            follow_redirects_policy: FollowRedirectsPolicy::FollowAll,
            buffer_size: Some(4096),
            ..Default::default()
        })
        .map_err(|e| anyhow!("NETWORK_ERROR: connection setup failed: {e}"))?;

        conn.initiate_request(embedded_svc::http::Method::Get, url, headers)
            .map_err(|e| anyhow!("NETWORK_ERROR: request failed: {e}"))?;
        conn.initiate_response()
            .map_err(|e| anyhow!("NETWORK_ERROR: response failed: {e}"))?;

        let status = conn.status();
        if !(200..300).contains(&status) {
            bail!("HTTP_REQUEST_ERROR: status {status}");
        }

        let total_size: usize = conn
            .header("Content-Length")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| anyhow!("NETWORK_ERROR: missing Content-Length"))?;

        let socket_handle = 0u32;
        let mut buf = [0u8; 4096];
        let mut read_so_far = 0usize;

        loop {
            let n = Read::read(&mut conn, &mut buf)
                .map_err(|e| anyhow!("NETWORK_ERROR: read failed: {e}"))?;
            let last = n == 0 || read_so_far + n >= total_size;
            let chunk = Chunk {
                socket_handle,
                chunk_start: read_so_far,
                chunk_size: n,
                total_size,
                last_chunk: last,
                data: &buf[..n],
            };
            match sink(chunk) {
                SinkResult::Abort => bail!("{ABORTED_BY_SINK}"),
                SinkResult::Continue => {}
            }
            read_so_far += n;
            if last {
                break;
            }
        }
        Ok(())
    }
}

/// In-memory `HttpDownloader` used by host-side unit tests.
///
/// Delivers `body` in `chunk_size`-sized pieces, optionally truncating the
/// stream after `fail_after_bytes` to simulate a mid-download connection
/// reset.
pub struct MockHttpDownloader {
    pub body: Vec<u8>,
    pub chunk_size: usize,
    pub fail_after_bytes: Option<usize>,
    pub declared_total_size: Option<usize>,
}

impl MockHttpDownloader {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            chunk_size: 64,
            fail_after_bytes: None,
            declared_total_size: None,
            body,
        }
    }
}

impl HttpDownloader for MockHttpDownloader {
    fn download(
        &mut self,
        _url: &str,
        _headers: &[(&str, &str)],
        _timeout_ms: u64,
        sink: &mut Sink<'_>,
    ) -> Result<()> {
        let total_size = self.declared_total_size.unwrap_or(self.body.len());
        let mut sent = 0usize;
        let socket_handle = 0u32;

        while sent < self.body.len() {
            if let Some(limit) = self.fail_after_bytes {
                if sent >= limit {
                    bail!("NETWORK_ERROR: simulated connection reset at {sent} bytes");
                }
            }
            let end = (sent + self.chunk_size).min(self.body.len());
            let last = end >= self.body.len();
            let chunk = Chunk {
                socket_handle,
                chunk_start: sent,
                chunk_size: end - sent,
                total_size,
                last_chunk: last,
                data: &self.body[sent..end],
            };
            match sink(chunk) {
                SinkResult::Abort => bail!("{ABORTED_BY_SINK}"),
                SinkResult::Continue => {}
            }
            sent = end;
        }
        Ok(())
    }
}
