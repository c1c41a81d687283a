//! Writable overlay holding chunks that diverged from the origin.
//!
//! A single sparse file of exactly the image size. The descriptor is shared
//! across threads; all access uses positional read/write so concurrent chunk
//! operations never race on a file offset.

use std::fs::OpenOptions;
use std::os::fd::AsFd;
use std::path::Path;

use nix::sys::uio::{pread, pwrite};
use nix::unistd::ftruncate;

use crate::bitmap::{Bitmap, BitmapGroup};
use crate::error::{IoError, IoResult};

pub(crate) struct ModifiedStore {
    file: std::fs::File,
    modified: Bitmap,
    chunk_size: u32,
}

impl ModifiedStore {
    /// Open (creating if needed) the overlay file and size it to the image.
    pub(crate) fn open(
        cache_dir: &Path,
        bitmaps: &BitmapGroup,
        chunk_size: u32,
        image_size: u64,
    ) -> IoResult<Self> {
        let path = cache_dir.join("modified");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        ftruncate(file.as_fd(), image_size as i64)?;
        Ok(ModifiedStore {
            file,
            modified: bitmaps.new_map(false),
            chunk_size,
        })
    }

    /// Whether `chunk` lives in the overlay and supersedes pristine data.
    pub(crate) fn is_modified(&self, chunk: u64) -> bool {
        self.modified.test(chunk)
    }

    fn check_bounds(&self, image_size: u64, chunk: u64, offset: u32, len: u64) -> IoResult<u64> {
        debug_assert!(u64::from(offset) + len <= u64::from(self.chunk_size));
        let start = chunk * u64::from(self.chunk_size) + u64::from(offset);
        if start + len > image_size {
            return Err(IoError::Eof);
        }
        Ok(start)
    }

    /// Read from a modified chunk. Only legal while the chunk's bit is set.
    pub(crate) fn read_chunk(
        &self,
        image_size: u64,
        buf: &mut [u8],
        chunk: u64,
        offset: u32,
    ) -> IoResult<()> {
        let start = self.check_bounds(image_size, chunk, offset, buf.len() as u64)?;
        let mut done = 0usize;
        while done < buf.len() {
            let count = pread(self.file.as_fd(), &mut buf[done..], (start + done as u64) as i64)?;
            if count == 0 {
                // The overlay is kept exactly image_size bytes long, so a
                // short read means the size invariant was violated.
                return Err(IoError::InvalidCache(format!(
                    "overlay shorter than image: chunk {chunk} offset {offset}"
                )));
            }
            done += count;
        }
        Ok(())
    }

    /// Write into a chunk and mark it modified. A zero-length write is legal
    /// and only sets the bit: it admits a chunk that has no pristine backing
    /// (entirely past the origin end) into the overlay.
    pub(crate) fn write_chunk(
        &self,
        image_size: u64,
        data: &[u8],
        chunk: u64,
        offset: u32,
    ) -> IoResult<()> {
        let start = self.check_bounds(image_size, chunk, offset, data.len() as u64)?;
        let mut done = 0usize;
        while done < data.len() {
            done += pwrite(self.file.as_fd(), &data[done..], (start + done as u64) as i64)?;
        }
        self.modified.set(chunk);
        Ok(())
    }

    /// Truncate or (sparsely) extend the overlay to the new image size.
    pub(crate) fn set_size(&self, _current_size: u64, new_size: u64) -> IoResult<()> {
        ftruncate(self.file.as_fd(), new_size as i64)?;
        Ok(())
    }

    /// Flush overlay data to stable storage.
    pub(crate) fn sync(&self) -> IoResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for ModifiedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModifiedStore")
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path, image_size: u64) -> ModifiedStore {
        let bitmaps = BitmapGroup::new(image_size.div_ceil(4096));
        ModifiedStore::open(dir, &bitmaps, 4096, image_size).unwrap()
    }

    #[test]
    fn write_sets_bit_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 16384);
        assert!(!store.is_modified(2));
        store.write_chunk(16384, b"abc", 2, 10).unwrap();
        assert!(store.is_modified(2));
        let mut buf = [0u8; 3];
        store.read_chunk(16384, &mut buf, 2, 10).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn zero_length_write_only_sets_bit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 16384);
        store.write_chunk(16384, &[], 1, 0).unwrap();
        assert!(store.is_modified(1));
        let mut buf = [0xffu8; 8];
        store.read_chunk(16384, &mut buf, 1, 0).unwrap();
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn access_past_logical_eof_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 10000);
        let mut buf = [0u8; 100];
        // Chunk 2 ends at 10000; reading past it must fail even though the
        // chunk index itself is valid.
        assert!(matches!(
            store.read_chunk(10000, &mut buf, 2, 1900),
            Err(IoError::Eof)
        ));
        assert!(matches!(
            store.write_chunk(10000, &buf, 2, 1901),
            Err(IoError::Eof)
        ));
    }

    #[test]
    fn extension_reads_back_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 4096);
        store.set_size(4096, 12288).unwrap();
        let mut buf = [0xaau8; 64];
        store.read_chunk(12288, &mut buf, 2, 0).unwrap();
        assert_eq!(buf, [0; 64]);
    }
}
