//! HTTP(S) transport for origin fetches.
//!
//! The transport presents a synchronous per-call surface; cancellation is
//! polled between body reads. Validators travel with every request and a
//! mismatch is a fatal error: the cached bytes no longer correspond to the
//! origin, and retrying cannot fix that.

use std::io::Read;
use std::time::Duration;

use base64::prelude::*;
use ureq::Agent;

use crate::error::{IoError, IoResult};

/// Read granularity for response bodies; also the cancellation latency bound.
const BODY_READ_SIZE: usize = 64 * 1024;

/// Where an image's bytes come from, with opaque credential and validator
/// pass-through.
#[derive(Debug, Clone, Default)]
pub struct Origin {
    /// Fetch URL.
    pub url: String,
    /// HTTP Basic user, if the origin requires authentication.
    pub username: Option<String>,
    /// HTTP Basic password.
    pub password: Option<String>,
    /// Cookie header values forwarded verbatim.
    pub cookies: Vec<String>,
    /// Entity tag pinned when the image was configured.
    pub etag: Option<String>,
    /// `Last-Modified` value pinned when the image was configured.
    pub last_modified: Option<String>,
}

impl Origin {
    fn authorization(&self) -> Option<String> {
        self.username.as_ref().map(|user| {
            let password = self.password.as_deref().unwrap_or("");
            format!(
                "Basic {}",
                BASE64_STANDARD.encode(format!("{user}:{password}"))
            )
        })
    }
}

/// Size and validators reported by the origin.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    /// Total resource length in bytes.
    pub size: u64,
    /// Entity tag, if the origin sent one.
    pub etag: Option<String>,
    /// `Last-Modified`, if the origin sent one.
    pub last_modified: Option<String>,
}

/// Byte source for images. Offsets are origin-absolute; the caller applies
/// any per-image fetch offset first.
pub trait Transport: Send + Sync {
    /// Fill `buf` from `offset`. Delivers exactly `buf.len()` bytes or fails;
    /// a short origin response is a premature-EOF error.
    fn fetch(
        &self,
        origin: &Origin,
        buf: &mut [u8],
        offset: u64,
        cancel: &dyn Fn() -> bool,
    ) -> IoResult<()>;

    /// Stream `length` bytes from `offset` into `sink` in arbitrary-sized
    /// pieces, never more than `length` in total. `cancel` is polled between
    /// deliveries; sink errors abort the stream unchanged.
    fn fetch_stream(
        &self,
        origin: &Origin,
        offset: u64,
        length: u64,
        sink: &mut dyn FnMut(&[u8]) -> IoResult<()>,
        cancel: &dyn Fn() -> bool,
    ) -> IoResult<()>;

    /// Ask the origin for the resource size and current validators.
    fn probe(&self, origin: &Origin) -> IoResult<ProbeInfo>;
}

/// Map a response status. `ranged` says whether the request carried a Range
/// header starting past zero, in which case a 200 means the origin ignored
/// it and would deliver the wrong bytes.
fn check_status(status: u16, ranged: bool) -> IoResult<()> {
    match status {
        206 => Ok(()),
        200 if !ranged => Ok(()),
        412 => Err(IoError::TransportFatal(
            "validator mismatch: origin content changed".to_owned(),
        )),
        408 | 429 | 500..=599 => Err(IoError::TransportNetwork(format!(
            "origin returned status {status}"
        ))),
        _ => Err(IoError::TransportFatal(format!(
            "origin returned status {status}"
        ))),
    }
}

/// Blocking HTTP transport.
pub struct HttpTransport {
    agent: Agent,
}

impl HttpTransport {
    /// Build a transport with its own connection pool.
    pub fn new() -> Self {
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(Duration::from_secs(60)))
            .build()
            .into();
        HttpTransport { agent }
    }

    fn get(
        &self,
        origin: &Origin,
        offset: u64,
        length: u64,
    ) -> IoResult<ureq::http::Response<ureq::Body>> {
        let mut req = self
            .agent
            .get(origin.url.as_str())
            .header("Range", format!("bytes={}-{}", offset, offset + length - 1).as_str());
        if let Some(auth) = origin.authorization() {
            req = req.header("Authorization", auth.as_str());
        }
        if let Some(etag) = &origin.etag {
            req = req.header("If-Match", etag.as_str());
        }
        if let Some(last_modified) = &origin.last_modified {
            req = req.header("If-Unmodified-Since", last_modified.as_str());
        }
        for cookie in &origin.cookies {
            req = req.header("Cookie", cookie.as_str());
        }
        let resp = req
            .call()
            .map_err(|err| IoError::TransportNetwork(err.to_string()))?;
        check_status(resp.status().as_u16(), offset > 0)?;
        Ok(resp)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        HttpTransport::new()
    }
}

impl Transport for HttpTransport {
    fn fetch(
        &self,
        origin: &Origin,
        buf: &mut [u8],
        offset: u64,
        cancel: &dyn Fn() -> bool,
    ) -> IoResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut resp = self.get(origin, offset, buf.len() as u64)?;
        let mut reader = resp.body_mut().as_reader();
        let mut done = 0usize;
        while done < buf.len() {
            if cancel() {
                return Err(IoError::Interrupted);
            }
            let upto = (done + BODY_READ_SIZE).min(buf.len());
            let count = reader
                .read(&mut buf[done..upto])
                .map_err(|err| IoError::TransportNetwork(err.to_string()))?;
            if count == 0 {
                return Err(IoError::PrematureEof {
                    got: done as u64,
                    want: buf.len() as u64,
                });
            }
            done += count;
        }
        Ok(())
    }

    fn fetch_stream(
        &self,
        origin: &Origin,
        offset: u64,
        length: u64,
        sink: &mut dyn FnMut(&[u8]) -> IoResult<()>,
        cancel: &dyn Fn() -> bool,
    ) -> IoResult<()> {
        if length == 0 {
            return Ok(());
        }
        let mut resp = self.get(origin, offset, length)?;
        let mut reader = resp.body_mut().as_reader();
        let mut piece = vec![0u8; BODY_READ_SIZE.min(length as usize)];
        let mut remaining = length;
        while remaining > 0 {
            if cancel() {
                return Err(IoError::Interrupted);
            }
            let want = piece.len().min(remaining as usize);
            let count = reader
                .read(&mut piece[..want])
                .map_err(|err| IoError::TransportNetwork(err.to_string()))?;
            if count == 0 {
                return Err(IoError::PrematureEof {
                    got: length - remaining,
                    want: length,
                });
            }
            sink(&piece[..count])?;
            remaining -= count as u64;
        }
        Ok(())
    }

    fn probe(&self, origin: &Origin) -> IoResult<ProbeInfo> {
        let mut req = self.agent.head(origin.url.as_str());
        if let Some(auth) = origin.authorization() {
            req = req.header("Authorization", auth.as_str());
        }
        for cookie in &origin.cookies {
            req = req.header("Cookie", cookie.as_str());
        }
        let resp = req
            .call()
            .map_err(|err| IoError::TransportNetwork(err.to_string()))?;
        check_status(resp.status().as_u16(), false)?;

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        let size = header("Content-Length")
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| {
                IoError::TransportFatal("origin did not report a content length".to_owned())
            })?;
        Ok(ProbeInfo {
            size,
            etag: header("ETag"),
            last_modified: header("Last-Modified"),
        })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").finish()
    }
}
