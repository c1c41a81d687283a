//! Remote disk images as locally mutable files.
//!
//! Each image is a large byte-addressable object whose backing bytes live on
//! an HTTP(S) origin. Reads populate a local pristine chunk cache on demand
//! (or ahead of demand via a background streamer); writes go copy-on-write
//! into a sparse local overlay. A FUSE surface exposes the image itself plus
//! per-image statistics pseudo-files that support poll-for-change.
//!
//! The interesting machinery is per chunk: a transient lock table serializes
//! readers, writers, the truncator, and the streamer on each chunk without
//! serializing across chunks, and the image size can only shrink past a chunk
//! once nobody holds its lock.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::cond::Interrupt;
pub use crate::config::ImageSpec;
pub use crate::error::{IoError, IoResult};
pub use crate::fs::DiskFs;
pub use crate::image::{FetchMode, Image, ImageConfig};
pub use crate::pollable::{PollWaker, Pollable};
pub use crate::stats::{ImageStats, Stat};
pub use crate::transport::{HttpTransport, Origin, ProbeInfo, Transport};

mod bitmap;
mod chunk_state;
mod cond;
mod config;
mod cursor;
mod error;
mod fs;
mod image;
mod modified;
mod pollable;
mod pristine;
mod stats;
mod stream;
mod transport;
