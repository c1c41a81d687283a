//! Background sequential prefetch of missing chunks.
//!
//! The streamer locks the contiguous tail of missing chunks up front (before
//! the filesystem serves requests), then fills them from one long origin
//! stream, unlocking each chunk the moment its bytes are on disk so demand
//! readers can take over as early as possible.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::chunk_state::ChunkState;
use crate::cursor::ChunkCursor;
use crate::error::{IoError, IoResult};
use crate::image::Image;
use crate::pristine::PristineStore;
use crate::stats::ImageStats;
use crate::transport::{Origin, Transport};

/// Everything the worker needs, cloned out of the image at startup. The
/// worker never holds a reference to the image itself; the image joins the
/// thread before it is dropped.
struct StreamPayload {
    name: String,
    origin: Origin,
    fetch_offset: u64,
    initial_size: u64,
    chunk_size: u32,
    start_chunk: u64,
    chunks: u64,
    transport: Arc<dyn Transport>,
    state: Arc<ChunkState>,
    pristine: Arc<PristineStore>,
    stats: Arc<ImageStats>,
}

/// Handle to the worker; owned by the image.
pub(crate) struct Streamer {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Streamer {
    /// Start streaming if any chunk is missing. Returns `None` when the last
    /// chunk is already present (nothing left for a sequential fill to add).
    pub(crate) fn start(image: &Image) -> IoResult<Option<Streamer>> {
        let chunks = image
            .initial_size()
            .div_ceil(u64::from(image.chunk_size()));
        if chunks == 0 || image.pristine().is_present(chunks - 1) {
            return Ok(None);
        }
        let start_chunk = image
            .pristine()
            .first_missing(chunks)
            .expect("last chunk is missing");

        let state = image.chunk_state().clone();
        state.lock_range(start_chunk..chunks, &crate::cond::Interrupt::new())?;

        let payload = StreamPayload {
            name: image.name().to_owned(),
            origin: image.origin().clone(),
            fetch_offset: image.fetch_offset(),
            initial_size: image.initial_size(),
            chunk_size: image.chunk_size(),
            start_chunk,
            chunks,
            transport: image.transport().clone(),
            state,
            pristine: image.pristine().clone(),
            stats: image.stats_handle(),
        };

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let thread = thread::Builder::new()
            .name(format!("stream-{}", payload.name))
            .spawn(move || run(payload, worker_stop));
        match thread {
            Ok(thread) => Ok(Some(Streamer {
                stop,
                thread: Some(thread),
            })),
            Err(err) => {
                image.chunk_state().unlock_range(start_chunk..chunks);
                Err(err.into())
            }
        }
    }

    /// Ask the worker to stop at the next cancellation point.
    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop and join the worker.
    pub(crate) fn shutdown(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("stopped", &self.stop.load(Ordering::SeqCst))
            .finish()
    }
}

fn run(payload: StreamPayload, stop: Arc<AtomicBool>) {
    let chunk_bytes = u64::from(payload.chunk_size);
    let offset = payload.start_chunk * chunk_bytes;
    let length = payload.initial_size - offset;

    let mut scratch = vec![0u8; chunk_bytes as usize];
    let mut cursor = ChunkCursor::new(payload.chunk_size, offset, length);
    // First chunk whose lock we still hold.
    let mut release_from = payload.start_chunk;

    let result = {
        let cancel = || stop.load(Ordering::SeqCst);
        let mut sink = |mut data: &[u8]| -> IoResult<()> {
            while !data.is_empty() {
                let seg = cursor.segment().ok_or_else(|| {
                    IoError::TransportFatal(
                        "origin delivered more bytes than requested".to_owned(),
                    )
                })?;
                let take = data.len().min(seg.len as usize);
                let begin = seg.offset as usize;
                scratch[begin..begin + take].copy_from_slice(&data[..take]);
                data = &data[take..];
                cursor.advance(take as u64);

                if take as u32 == seg.len {
                    // The cursor reached the end of this chunk's coverage:
                    // put it in the pristine cache.
                    let filled = u64::from(seg.offset) + u64::from(seg.len);
                    if payload.pristine.is_present(seg.chunk) {
                        payload.stats.chunk_fetch_skips.add(1);
                    } else if let Err(err) =
                        payload.pristine.write_chunk(&scratch, seg.chunk, filled)
                    {
                        payload.stats.io_errors.add(1);
                        return Err(err);
                    }
                    if filled == chunk_bytes {
                        // Truly advancing off the chunk: hand it to demand
                        // readers now.
                        payload.state.unlock(seg.chunk);
                        release_from = seg.chunk + 1;
                    }
                }
            }
            Ok(())
        };
        payload.transport.fetch_stream(
            &payload.origin,
            payload.fetch_offset + offset,
            length,
            &mut sink,
            &cancel,
        )
    };

    match &result {
        Ok(()) => debug!(
            "image {}: streamed chunks {}..{}",
            payload.name, payload.start_chunk, payload.chunks
        ),
        Err(err) if err.is_interrupted() => {}
        Err(err) => warn!(
            "image {}: streaming failed after {} bytes: {err}",
            payload.name,
            cursor.io_offset()
        ),
    }

    // Whatever wasn't released chunk by chunk (the tail on error or stop,
    // or a final partial chunk) is released here; those chunks stay absent
    // and future reads fetch them on demand.
    payload.state.unlock_range(release_from..payload.chunks);
}
