//! Image specifications as given on the command line.
//!
//! An image is described by a comma-separated `key=value` list:
//!
//! ```text
//! name=root,url=https://origin/disk.img,size=8589934592,mode=stream
//! ```
//!
//! `size=` may be omitted when the origin answers a HEAD probe. Values must
//! not contain commas; validators with commas in them (HTTP dates) are
//! better picked up from the probe than passed on the command line.

use std::str::FromStr;

use crate::image::FetchMode;

/// Default chunk size: 128 KiB.
pub(crate) const DEFAULT_CHUNK_SIZE: u32 = 128 * 1024;

/// Parsed `--image` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Directory name within the mount.
    pub name: String,
    /// Origin URL.
    pub url: String,
    /// Image size; probed from the origin when absent.
    pub size: Option<u64>,
    /// Chunk size in bytes.
    pub chunk_size: u32,
    /// Byte offset of the image within the origin resource.
    pub fetch_offset: u64,
    /// HTTP Basic user.
    pub username: Option<String>,
    /// HTTP Basic password.
    pub password: Option<String>,
    /// Cookie header values, forwarded verbatim.
    pub cookies: Vec<String>,
    /// Pinned entity tag.
    pub etag: Option<String>,
    /// Pinned `Last-Modified` value.
    pub last_modified: Option<String>,
    /// Fetch policy.
    pub mode: FetchMode,
}

impl FromStr for ImageSpec {
    type Err = String;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut name = None;
        let mut url = None;
        let mut size = None;
        let mut chunk_size = DEFAULT_CHUNK_SIZE;
        let mut fetch_offset = 0;
        let mut username = None;
        let mut password = None;
        let mut cookies = Vec::new();
        let mut etag = None;
        let mut last_modified = None;
        let mut mode = FetchMode::Demand;

        for field in spec.split(',') {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, got {field:?}"))?;
            match key {
                "name" => name = Some(value.to_owned()),
                "url" => url = Some(value.to_owned()),
                "size" => {
                    size = Some(
                        value
                            .parse::<u64>()
                            .map_err(|err| format!("bad size {value:?}: {err}"))?,
                    );
                }
                "chunk-size" => {
                    chunk_size = value
                        .parse::<u32>()
                        .map_err(|err| format!("bad chunk-size {value:?}: {err}"))?;
                }
                "fetch-offset" => {
                    fetch_offset = value
                        .parse::<u64>()
                        .map_err(|err| format!("bad fetch-offset {value:?}: {err}"))?;
                }
                "user" => username = Some(value.to_owned()),
                "password" => password = Some(value.to_owned()),
                "cookie" => cookies.push(value.to_owned()),
                "etag" => etag = Some(value.to_owned()),
                "last-modified" => last_modified = Some(value.to_owned()),
                "mode" => {
                    mode = match value {
                        "demand" => FetchMode::Demand,
                        "stream" => FetchMode::Stream,
                        _ => return Err(format!("bad mode {value:?} (demand or stream)")),
                    };
                }
                _ => return Err(format!("unknown image option {key:?}")),
            }
        }

        let name = name.ok_or("image spec needs name=")?;
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(format!("bad image name {name:?}"));
        }
        if chunk_size == 0 {
            return Err("chunk-size must be positive".to_owned());
        }
        Ok(ImageSpec {
            name,
            url: url.ok_or("image spec needs url=")?,
            size,
            chunk_size,
            fetch_offset,
            username,
            password,
            cookies,
            etag,
            last_modified,
            mode,
        })
    }
}
