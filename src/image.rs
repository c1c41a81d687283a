//! Images and their chunk I/O engine.
//!
//! An [`Image`] owns the two caches, the bitmaps, the chunk-lock table, and
//! (in stream mode) the background streamer. All reads and writes funnel
//! through the per-chunk engine: acquire the chunk lock, consult the bitmaps,
//! fetch on miss, then serve from the pristine cache or the modified overlay.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::bitmap::{Bitmap, BitmapGroup};
use crate::chunk_state::{ChunkState, ChunkStateInner};
use crate::cond::Interrupt;
use crate::cursor::ChunkCursor;
use crate::error::{IoError, IoResult};
use crate::modified::ModifiedStore;
use crate::pollable::PollWaker;
use crate::pristine::PristineStore;
use crate::stats::ImageStats;
use crate::stream::Streamer;
use crate::transport::{Origin, Transport};

/// When missing chunks are fetched from the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Fetch a chunk when a read misses it.
    #[default]
    Demand,
    /// Demand fetching plus a background stream of every missing chunk.
    Stream,
}

/// Immutable attributes of an image.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// Name of the image directory in the mounted tree.
    pub name: String,
    /// Where the bytes come from.
    pub origin: Origin,
    /// Directory holding this image's pristine cache and modified overlay.
    pub cache_dir: PathBuf,
    /// Byte offset of the image within the origin resource.
    pub fetch_offset: u64,
    /// Size of the origin-backed data, and the image size at open.
    pub initial_size: u64,
    /// Chunk size in bytes.
    pub chunk_size: u32,
    /// Fetch policy.
    pub fetch_mode: FetchMode,
}

/// One remote disk image presented as a locally mutable file.
pub struct Image {
    name: String,
    origin: Origin,
    fetch_offset: u64,
    initial_size: u64,
    chunk_size: u32,
    transport: Arc<dyn Transport>,
    bitmaps: Arc<BitmapGroup>,
    accessed: Bitmap,
    pristine: Arc<PristineStore>,
    modified: Arc<ModifiedStore>,
    state: Arc<ChunkState>,
    stats: Arc<ImageStats>,
    streamer: Mutex<Option<Streamer>>,
}

impl Image {
    /// Open an image: set up the caches and bitmaps, rediscover pristine
    /// chunks, and in stream mode start the background streamer.
    pub fn open(config: ImageConfig, transport: Arc<dyn Transport>) -> IoResult<Arc<Image>> {
        fs::create_dir_all(&config.cache_dir)?;
        let chunks = config.initial_size.div_ceil(u64::from(config.chunk_size));
        let bitmaps = Arc::new(BitmapGroup::new(chunks));
        let pristine = Arc::new(PristineStore::open(
            &config.cache_dir,
            &bitmaps,
            config.chunk_size,
            config.initial_size,
        )?);
        let modified = Arc::new(ModifiedStore::open(
            &config.cache_dir,
            &bitmaps,
            config.chunk_size,
            config.initial_size,
        )?);
        let accessed = bitmaps.new_map(false);
        let state = Arc::new(ChunkState::new(config.initial_size));

        let image = Arc::new(Image {
            name: config.name,
            origin: config.origin,
            fetch_offset: config.fetch_offset,
            initial_size: config.initial_size,
            chunk_size: config.chunk_size,
            transport,
            bitmaps,
            accessed,
            pristine,
            modified,
            state,
            stats: Arc::new(ImageStats::new()),
            streamer: Mutex::new(None),
        });

        if config.fetch_mode == FetchMode::Stream {
            match Streamer::start(&image) {
                Ok(streamer) => *image.streamer.lock() = streamer,
                Err(err) => warn!("image {}: couldn't start streaming: {err}", image.name),
            }
        }
        Ok(image)
    }

    /// Image name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// The per-image counters.
    pub fn stats(&self) -> &ImageStats {
        &self.stats
    }

    pub(crate) fn stats_handle(&self) -> Arc<ImageStats> {
        self.stats.clone()
    }

    pub(crate) fn origin(&self) -> &Origin {
        &self.origin
    }

    pub(crate) fn fetch_offset(&self) -> u64 {
        self.fetch_offset
    }

    pub(crate) fn initial_size(&self) -> u64 {
        self.initial_size
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn chunk_state(&self) -> &Arc<ChunkState> {
        &self.state
    }

    pub(crate) fn pristine(&self) -> &Arc<PristineStore> {
        &self.pristine
    }

    /// Whether `chunk` has been fetched into the pristine cache.
    pub fn is_present(&self, chunk: u64) -> bool {
        self.pristine.is_present(chunk)
    }

    /// Whether `chunk` lives in the modified overlay.
    pub fn is_modified(&self, chunk: u64) -> bool {
        self.modified.is_modified(chunk)
    }

    /// Whether `chunk` was touched by any read or write.
    pub fn is_accessed(&self, chunk: u64) -> bool {
        self.accessed.test(chunk)
    }

    /// Number of chunks at the current image size.
    pub fn chunk_count(&self) -> u64 {
        self.get_size().0.div_ceil(u64::from(self.chunk_size))
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    fn count_write<T>(&self, result: IoResult<T>) -> IoResult<T> {
        if result.is_err() {
            self.stats.io_errors.add(1);
        }
        result
    }

    /// Fetch a chunk's pristine bytes from the origin into `buf`.
    fn fetch_chunk(&self, buf: &mut [u8], chunk: u64, intr: &Interrupt) -> IoResult<()> {
        let start = chunk * u64::from(self.chunk_size);
        self.stats.chunk_fetches.add(1);
        let cancel = || intr.is_set();
        let result = self
            .transport
            .fetch(&self.origin, buf, self.fetch_offset + start, &cancel);
        if let Err(err) = &result {
            // Interruption is cancellation, not a fault.
            if !err.is_interrupted() {
                self.stats.io_errors.add(1);
            }
        }
        result
    }

    /// Serve a read within one chunk. The chunk lock must be held and
    /// `image_size` must be the size snapshot taken at acquisition.
    fn read_chunk_unlocked(
        &self,
        image_size: u64,
        buf: &mut [u8],
        chunk: u64,
        offset: u32,
        intr: &Interrupt,
    ) -> IoResult<u32> {
        let chunk_bytes = u64::from(self.chunk_size);
        debug_assert!(u64::from(offset) + buf.len() as u64 <= chunk_bytes);

        let pos = chunk * chunk_bytes + u64::from(offset);
        if pos >= image_size {
            return Err(IoError::Eof);
        }
        let length = (image_size - pos).min(buf.len() as u64) as u32;
        let buf = &mut buf[..length as usize];

        self.accessed.set(chunk);
        if self.modified.is_modified(chunk) {
            self.modified.read_chunk(image_size, buf, chunk, offset)?;
            return Ok(length);
        }

        let pristine_len = self.pristine.pristine_len(chunk);
        if pristine_len == 0 {
            // Entirely past the origin end: the overlay's sparse extension
            // backs these bytes, so they read as zeros until written.
            self.modified.read_chunk(image_size, buf, chunk, offset)?;
            return Ok(length);
        }

        // If two instances work out of the same pristine cache directory,
        // they fetch chunks redundantly because the present map is
        // process-local. That wastes a fetch but never corrupts.
        if !self.pristine.is_present(chunk) {
            let mut fetched = vec![0u8; pristine_len as usize];
            self.fetch_chunk(&mut fetched, chunk, intr)?;
            self.count_write(self.pristine.write_chunk(&fetched, chunk, pristine_len))?;
        }

        let from_pristine = pristine_len
            .saturating_sub(u64::from(offset))
            .min(u64::from(length)) as usize;
        if from_pristine > 0 {
            self.pristine
                .read_chunk(&mut buf[..from_pristine], chunk, offset)?;
        }
        // Anything between the origin length and an expanded image size
        // reads as zeros.
        buf[from_pristine..].fill(0);
        Ok(length)
    }

    /// Read up to `buf.len()` bytes from one chunk at `offset` within it.
    /// Returns the bytes read, clipped at the logical end of the image.
    pub fn read_chunk(
        &self,
        buf: &mut [u8],
        chunk: u64,
        offset: u32,
        intr: &Interrupt,
    ) -> IoResult<u32> {
        let image_size = self.state.try_lock(chunk, intr)?;
        let result = self.read_chunk_unlocked(image_size, buf, chunk, offset, intr);
        self.state.unlock(chunk);
        result
    }

    /// Copy a chunk's pristine-sized prefix into the overlay. The chunk lock
    /// must be held.
    fn copy_to_modified(&self, image_size: u64, chunk: u64, intr: &Interrupt) -> IoResult<()> {
        let count = self.pristine.pristine_len(chunk);
        self.stats.chunk_dirties.add(1);
        if count == 0 {
            // No pristine backing: admit the chunk to the overlay as zeros.
            return self.count_write(self.modified.write_chunk(image_size, &[], chunk, 0));
        }
        let mut buf = vec![0u8; count as usize];
        let read = self.read_chunk_unlocked(image_size, &mut buf, chunk, 0, intr)?;
        if u64::from(read) != count {
            return Err(IoError::PrematureEof {
                got: read.into(),
                want: count,
            });
        }
        self.count_write(self.modified.write_chunk(image_size, &buf, chunk, 0))
    }

    /// Write `data` into one chunk at `offset` within it, expanding the image
    /// if the write ends past the current size. Returns `data.len()`.
    pub fn write_chunk(
        &self,
        data: &[u8],
        chunk: u64,
        offset: u32,
        intr: &Interrupt,
    ) -> IoResult<u32> {
        let chunk_bytes = u64::from(self.chunk_size);
        debug_assert!(u64::from(offset) + data.len() as u64 <= chunk_bytes);

        let needed = chunk * chunk_bytes + u64::from(offset) + data.len() as u64;
        let image_size = self.state.try_lock_ensure_size(
            chunk,
            needed,
            |inner, new_size| self.set_image_size_locked(inner, new_size),
            intr,
        )?;
        let result: IoResult<u32> = (|| {
            self.accessed.set(chunk);
            if !self.modified.is_modified(chunk) {
                self.copy_to_modified(image_size, chunk, intr)?;
            }
            self.count_write(self.modified.write_chunk(image_size, data, chunk, offset))?;
            Ok(data.len() as u32)
        })();
        self.state.unlock(chunk);
        result
    }

    /// Read into `buf` starting at image offset `start`, splitting by chunk.
    /// Partial progress is reported through the byte count; an error is
    /// returned only when nothing was read.
    pub fn read(&self, buf: &mut [u8], start: u64, intr: &Interrupt) -> IoResult<usize> {
        let mut cursor = ChunkCursor::new(self.chunk_size, start, buf.len() as u64);
        while let Some(seg) = cursor.segment() {
            let dst = &mut buf[seg.io_offset as usize..(seg.io_offset + u64::from(seg.len)) as usize];
            match self.read_chunk(dst, seg.chunk, seg.offset, intr) {
                Ok(count) => {
                    cursor.advance(count.into());
                    if count < seg.len {
                        break;
                    }
                }
                Err(IoError::Eof) => break,
                Err(err) if cursor.io_offset() == 0 => return Err(err),
                Err(_) => break,
            }
        }
        let done = cursor.io_offset();
        if done > 0 {
            self.stats.bytes_read.add(done);
        }
        Ok(done as usize)
    }

    /// Write `data` starting at image offset `start`, splitting by chunk.
    /// Same partial-progress contract as [`read`](Self::read).
    pub fn write(&self, data: &[u8], start: u64, intr: &Interrupt) -> IoResult<usize> {
        let mut cursor = ChunkCursor::new(self.chunk_size, start, data.len() as u64);
        while let Some(seg) = cursor.segment() {
            let src = &data[seg.io_offset as usize..][..seg.len as usize];
            match self.write_chunk(src, seg.chunk, seg.offset, intr) {
                Ok(count) => cursor.advance(count.into()),
                Err(err) if cursor.io_offset() == 0 => return Err(err),
                Err(_) => break,
            }
        }
        let done = cursor.io_offset();
        if done > 0 {
            self.stats.bytes_written.add(done);
        }
        Ok(done as usize)
    }

    /// Change the image size and resize the bitmaps in lock-step. The
    /// chunk-state mutex must be held; shrink races are the caller's problem.
    fn set_image_size_locked(&self, inner: &mut ChunkStateInner, new_size: u64) -> IoResult<()> {
        self.modified.set_size(inner.image_size, new_size)?;
        inner.image_size = new_size;
        self.bitmaps
            .resize(new_size.div_ceil(u64::from(self.chunk_size)));
        self.state.size_pollable.change();
        Ok(())
    }

    /// Current image size and its change cookie.
    pub fn get_size(&self) -> (u64, u64) {
        self.state.size()
    }

    /// Copy `chunk` into the overlay unless it was truncated away or
    /// modified while we were acquiring its lock.
    fn lock_and_copy_to_modified(&self, chunk: u64, intr: &Interrupt) -> IoResult<()> {
        let image_size = self.state.try_lock(chunk, intr)?;
        let result = if chunk * u64::from(self.chunk_size) < image_size
            && !self.modified.is_modified(chunk)
        {
            self.copy_to_modified(image_size, chunk, intr)
        } else {
            Ok(())
        };
        self.state.unlock(chunk);
        result
    }

    /// Set the image size. Expansion is immediate; truncation first copies a
    /// partial pristine-backed last chunk into the overlay and backs off
    /// around busy chunks, restarting until the target size is reached.
    pub fn set_size(&self, size: u64, intr: &Interrupt) -> IoResult<()> {
        let chunk_bytes = u64::from(self.chunk_size);
        loop {
            let mut inner = self.state.inner.lock();
            if size > inner.image_size {
                return self.set_image_size_locked(&mut inner, size);
            }
            if size == inner.image_size {
                return Ok(());
            }

            if size % chunk_bytes > 0
                && size < self.initial_size
                && !self.modified.is_modified((size - 1) / chunk_bytes)
            {
                // The new last chunk will be a partial chunk backed by the
                // pristine cache. Copy it into the overlay first so a later
                // expansion doesn't reveal the truncated tail of the chunk.
                drop(inner);
                self.lock_and_copy_to_modified((size - 1) / chunk_bytes, intr)?;
                // The image size may have changed meanwhile; start over.
                continue;
            }

            // A chunk currently being accessed can't be truncated. Walk from
            // the last chunk down; on the first busy chunk, truncate to just
            // above it, wait for its lock, and start over.
            let mut chunk = (inner.image_size - 1) / chunk_bytes;
            let floor = size / chunk_bytes;
            let busy = loop {
                if inner.is_locked(chunk) {
                    break Some(chunk);
                }
                if chunk == 0 {
                    break None;
                }
                chunk -= 1;
                if chunk < floor {
                    break None;
                }
            };
            match busy {
                Some(chunk) => {
                    let backoff = (chunk + 1) * chunk_bytes;
                    if backoff < inner.image_size {
                        self.set_image_size_locked(&mut inner, backoff)?;
                    }
                    drop(inner);
                    self.state.try_lock(chunk, intr)?;
                    self.state.unlock(chunk);
                }
                None => return self.set_image_size_locked(&mut inner, size),
            }
        }
    }

    /// Arm a waker against the size change cookie. After close the size is
    /// permanently "changed": the waker fires immediately, as does every
    /// later one.
    pub fn size_add_waker(&self, waker: Box<dyn PollWaker>, seen_cookie: u64) -> bool {
        let inner = self.state.inner.lock();
        if inner.closed {
            drop(inner);
            self.state.size_pollable.add_waker(waker, true);
            true
        } else {
            self.state
                .size_pollable
                .add_waker_conditional(waker, seen_cookie)
        }
    }

    /// Close the image: stop the streamer, close bitmaps and stats, and
    /// notify size pollers. Terminal and idempotent.
    pub fn close(&self) {
        if let Some(streamer) = self.streamer.lock().as_ref() {
            streamer.stop();
        }
        self.bitmaps.close();
        self.stats.close();
        let mut inner = self.state.inner.lock();
        if !inner.closed {
            inner.closed = true;
            self.state.size_pollable.change();
        }
    }

    /// Flush the modified overlay to stable storage.
    pub fn sync(&self) -> IoResult<()> {
        self.modified.sync()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        // Join before free: the worker only ever borrows state that outlives
        // it through Arcs, but a joined thread can't outlive the image
        // either way.
        if let Some(streamer) = self.streamer.lock().take() {
            streamer.shutdown();
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name)
            .field("chunk_size", &self.chunk_size)
            .field("initial_size", &self.initial_size)
            .finish()
    }
}
