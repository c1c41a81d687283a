//! Local cache of bytes fetched verbatim from the origin.
//!
//! One file per chunk under `<cache_dir>/pristine/`, named by chunk index.
//! The cache survives process restart: at open, files whose length matches
//! the chunk's pristine length seed the `present` map. The map itself is
//! process-local, so two processes sharing a cache directory may fetch a
//! chunk redundantly; they write identical bytes, which is harmless.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use log::debug;
use nix::sys::uio::{pread, pwrite};

use crate::bitmap::{Bitmap, BitmapGroup};
use crate::error::{IoError, IoResult};

pub(crate) struct PristineStore {
    dir: PathBuf,
    present: Bitmap,
    chunk_size: u32,
    initial_size: u64,
}

impl PristineStore {
    /// Open (creating if needed) the cache directory and rediscover which
    /// chunks are already present.
    pub(crate) fn open(
        cache_dir: &Path,
        bitmaps: &BitmapGroup,
        chunk_size: u32,
        initial_size: u64,
    ) -> IoResult<Self> {
        let dir = cache_dir.join("pristine");
        fs::create_dir_all(&dir)?;

        let store = PristineStore {
            dir,
            present: bitmaps.new_map(false),
            chunk_size,
            initial_size,
        };

        let chunks = initial_size.div_ceil(u64::from(chunk_size));
        for entry in fs::read_dir(&store.dir)? {
            let entry = entry?;
            let Some(chunk) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            else {
                continue;
            };
            if chunk >= chunks {
                continue;
            }
            let len = entry.metadata()?.len();
            if len == store.pristine_len(chunk) {
                store.present.set(chunk);
            } else {
                debug!(
                    "ignoring pristine chunk {} with bad length {} (want {})",
                    chunk,
                    len,
                    store.pristine_len(chunk)
                );
            }
        }
        Ok(store)
    }

    /// Bytes of origin data backing `chunk`: a full chunk, or less for the
    /// final chunk of the origin range, or zero past its end.
    pub(crate) fn pristine_len(&self, chunk: u64) -> u64 {
        self.initial_size
            .saturating_sub(chunk * u64::from(self.chunk_size))
            .min(u64::from(self.chunk_size))
    }

    /// Whether `chunk` has been fetched into the cache by this process.
    pub(crate) fn is_present(&self, chunk: u64) -> bool {
        self.present.test(chunk)
    }

    /// Index of the first chunk not yet present, scanning from zero.
    pub(crate) fn first_missing(&self, chunks: u64) -> Option<u64> {
        self.present.first_clear(chunks)
    }

    fn chunk_path(&self, chunk: u64) -> PathBuf {
        self.dir.join(chunk.to_string())
    }

    /// Read `buf.len()` bytes at `offset` within a present chunk. Bytes past
    /// the chunk's pristine length are not addressable here; the engine
    /// clips to [`pristine_len`](Self::pristine_len) before calling.
    pub(crate) fn read_chunk(&self, buf: &mut [u8], chunk: u64, offset: u32) -> IoResult<()> {
        let file = File::open(self.chunk_path(chunk))?;
        let mut done = 0usize;
        while done < buf.len() {
            let count = pread(
                file.as_fd(),
                &mut buf[done..],
                (u64::from(offset) + done as u64) as i64,
            )?;
            if count == 0 {
                return Err(IoError::InvalidCache(format!(
                    "pristine chunk {} shorter than expected ({} of {} bytes)",
                    chunk,
                    u64::from(offset) + done as u64,
                    self.pristine_len(chunk)
                )));
            }
            done += count;
        }
        Ok(())
    }

    /// Write a complete chunk of `len` bytes and mark it present.
    pub(crate) fn write_chunk(&self, data: &[u8], chunk: u64, len: u64) -> IoResult<()> {
        debug_assert_eq!(len, self.pristine_len(chunk));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.chunk_path(chunk))?;
        let data = &data[..len as usize];
        let mut done = 0usize;
        while done < data.len() {
            done += pwrite(file.as_fd(), &data[done..], done as i64)?;
        }
        self.present.set(chunk);
        Ok(())
    }
}

impl std::fmt::Debug for PristineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PristineStore")
            .field("dir", &self.dir)
            .field("chunk_size", &self.chunk_size)
            .field("initial_size", &self.initial_size)
            .finish()
    }
}
