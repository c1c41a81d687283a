//! End-to-end chunk engine scenarios against an in-memory origin.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use netdiskfs::{
    FetchMode, Image, ImageConfig, Interrupt, IoError, IoResult, Origin, ProbeInfo, Transport,
};

const CHUNK: u32 = 4096;

fn origin_byte(i: u64) -> u8 {
    (i.wrapping_mul(31).wrapping_add(7) % 251) as u8
}

/// Origin double: serves a deterministic byte pattern and counts calls.
struct MemOrigin {
    data: Vec<u8>,
    fetches: AtomicU64,
    streams: AtomicU64,
    stream_piece: usize,
    stream_delay: Duration,
}

impl MemOrigin {
    fn new(len: u64) -> Arc<Self> {
        Self::with_stream(len, 1000, Duration::ZERO)
    }

    fn with_stream(len: u64, stream_piece: usize, stream_delay: Duration) -> Arc<Self> {
        Arc::new(MemOrigin {
            data: (0..len).map(origin_byte).collect(),
            fetches: AtomicU64::new(0),
            streams: AtomicU64::new(0),
            stream_piece,
            stream_delay,
        })
    }

    fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Transport for MemOrigin {
    fn fetch(
        &self,
        _origin: &Origin,
        buf: &mut [u8],
        offset: u64,
        cancel: &dyn Fn() -> bool,
    ) -> IoResult<()> {
        if cancel() {
            return Err(IoError::Interrupted);
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let offset = offset as usize;
        if offset + buf.len() > self.data.len() {
            return Err(IoError::PrematureEof {
                got: self.data.len().saturating_sub(offset) as u64,
                want: buf.len() as u64,
            });
        }
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn fetch_stream(
        &self,
        _origin: &Origin,
        offset: u64,
        length: u64,
        sink: &mut dyn FnMut(&[u8]) -> IoResult<()>,
        cancel: &dyn Fn() -> bool,
    ) -> IoResult<()> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        let mut pos = offset as usize;
        let end = (offset + length) as usize;
        assert!(end <= self.data.len());
        while pos < end {
            if cancel() {
                return Err(IoError::Interrupted);
            }
            if !self.stream_delay.is_zero() {
                thread::sleep(self.stream_delay);
            }
            let take = self.stream_piece.min(end - pos);
            sink(&self.data[pos..pos + take])?;
            pos += take;
        }
        Ok(())
    }

    fn probe(&self, _origin: &Origin) -> IoResult<ProbeInfo> {
        Ok(ProbeInfo {
            size: self.data.len() as u64,
            etag: None,
            last_modified: None,
        })
    }
}

fn open_image(
    cache_dir: &Path,
    origin: &Arc<MemOrigin>,
    initial_size: u64,
    mode: FetchMode,
) -> Arc<Image> {
    Image::open(
        ImageConfig {
            name: "disk".to_owned(),
            origin: Origin {
                url: "mem://disk".to_owned(),
                ..Origin::default()
            },
            cache_dir: cache_dir.to_path_buf(),
            fetch_offset: 0,
            initial_size,
            chunk_size: CHUNK,
            fetch_mode: mode,
        },
        origin.clone() as Arc<dyn Transport>,
    )
    .unwrap()
}

fn read_vec(image: &Image, start: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let count = image.read(&mut buf, start, &Interrupt::new()).unwrap();
    buf.truncate(count);
    buf
}

fn origin_range(start: u64, len: usize) -> Vec<u8> {
    (start..start + len as u64).map(origin_byte).collect()
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn cold_then_hot_demand_read() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);

    assert_eq!(read_vec(&image, 0, 1), origin_range(0, 1));
    assert_eq!(image.stats().chunk_fetches.get().0, 1);
    assert_eq!(origin.fetches(), 1);
    assert!(image.is_present(0));
    assert!(image.is_accessed(0));
    assert!(!image.is_modified(0));

    // Hot: the pristine cache answers, no further transport call.
    assert_eq!(read_vec(&image, 0, 1), origin_range(0, 1));
    assert_eq!(image.stats().chunk_fetches.get().0, 1);
    assert_eq!(origin.fetches(), 1);
    assert!(image.is_present(0));
}

#[test]
fn copy_on_write_merges_with_origin() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);

    let intr = Interrupt::new();
    assert_eq!(image.write(&[0xaa], 2, &intr).unwrap(), 1);
    assert!(image.is_modified(0));
    assert_eq!(image.stats().chunk_dirties.get().0, 1);

    let mut expected = origin_range(0, 4);
    expected[2] = 0xaa;
    assert_eq!(read_vec(&image, 0, 4), expected);
}

#[test]
fn write_then_read_round_trips_across_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);

    let intr = Interrupt::new();
    let data: Vec<u8> = (0u32..10_000).map(|i| (i % 253) as u8).collect();
    assert_eq!(image.write(&data, 100, &intr).unwrap(), data.len());
    assert_eq!(read_vec(&image, 100, data.len()), data);
    assert_eq!(image.stats().bytes_written.get().0, data.len() as u64);

    // Idempotent: writing the same bytes again changes nothing visible.
    assert_eq!(image.write(&data, 100, &intr).unwrap(), data.len());
    assert_eq!(read_vec(&image, 100, data.len()), data);
}

#[test]
fn straddling_write_marks_both_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);

    let offset = u64::from(CHUNK) - 1;
    assert_eq!(image.write(&[1, 2], offset, &Interrupt::new()).unwrap(), 2);
    assert!(image.is_modified(0));
    assert!(image.is_modified(1));
    assert_eq!(read_vec(&image, offset, 2), vec![1, 2]);
}

#[test]
fn expansion_via_write() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);

    let (size, cookie_before) = image.get_size();
    assert_eq!(size, 16384);

    assert_eq!(image.write(&[0x42], 20000, &Interrupt::new()).unwrap(), 1);
    let (size, cookie_after) = image.get_size();
    assert_eq!(size, 20001);
    assert_eq!(cookie_after, cookie_before + 1);
    assert_eq!(image.chunk_count(), 5);
    assert!(image.is_modified(4));

    // The gap behind the write is overlay-backed and reads as zeros.
    assert_eq!(read_vec(&image, 16384, 3617), {
        let mut expected = vec![0u8; 3617];
        expected[3616] = 0x42;
        expected
    });
    // No fetch happened for the chunk past the origin end.
    assert_eq!(origin.fetches(), 0);
}

#[test]
fn truncation_precopies_partial_pristine_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(24576);
    let image = open_image(dir.path(), &origin, 24576, FetchMode::Demand);

    let intr = Interrupt::new();
    image.set_size(18000, &intr).unwrap();
    assert_eq!(image.get_size().0, 18000);
    // The new last chunk was pristine-backed and partial, so it moved into
    // the overlay before the shrink.
    assert!(image.is_modified(4));
    assert_eq!(image.stats().chunk_dirties.get().0, 1);
    assert_eq!(read_vec(&image, 16384, 1616), origin_range(16384, 1616));

    // Expanding again must not reveal the truncated tail of chunk 4.
    image.set_size(24576, &intr).unwrap();
    assert_eq!(read_vec(&image, 18000, 2480), vec![0u8; 2480]);
    // A fully pristine chunk dropped by the shrink comes back from the
    // origin on demand.
    assert_eq!(read_vec(&image, 20480, 4096), origin_range(20480, 4096));
}

#[test]
fn set_size_is_idempotent_and_expansion_reads_zeros() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(8192);
    let image = open_image(dir.path(), &origin, 8192, FetchMode::Demand);

    let intr = Interrupt::new();
    image.set_size(20000, &intr).unwrap();
    let cookie = image.get_size().1;
    image.set_size(20000, &intr).unwrap();
    // The repeated call is a no-op: same size, same cookie.
    assert_eq!(image.get_size(), (20000, cookie));

    image.set_size(30000, &intr).unwrap();
    assert_eq!(image.get_size().0, 30000);
    assert_eq!(read_vec(&image, 20000, 10000), vec![0u8; 10000]);
}

#[test]
fn eof_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);

    let intr = Interrupt::new();
    // The single-chunk engine reports end-of-file as an error...
    let mut buf = [0u8; 1];
    assert!(matches!(
        image.read_chunk(&mut buf, 4, 0, &intr),
        Err(IoError::Eof)
    ));
    // ...and the multi-chunk surface turns that into zero bytes.
    assert_eq!(read_vec(&image, 16384, 100), Vec::<u8>::new());
    assert_eq!(read_vec(&image, 99999, 100), Vec::<u8>::new());

    // A read crossing end-of-file is clipped.
    assert_eq!(read_vec(&image, 16350, 100), origin_range(16350, 34));
}

#[test]
fn streamer_fills_every_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    let image = open_image(dir.path(), &origin, 16384, FetchMode::Stream);

    wait_until("stream fill", || (0..4).all(|chunk| image.is_present(chunk)));
    assert_eq!(origin.streams.load(Ordering::SeqCst), 1);
    assert_eq!(origin.fetches(), 0);
    assert_eq!(read_vec(&image, 0, 16384), origin_range(0, 16384));
    // Everything came over the stream; demand fetching never ran.
    assert_eq!(image.stats().chunk_fetches.get().0, 0);
}

#[test]
fn streamer_skips_chunks_already_present() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    {
        let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);
        // Seed chunk 2 in the pristine cache, then let the image go away.
        assert_eq!(read_vec(&image, 8192, 1), origin_range(8192, 1));
    }

    let image = open_image(dir.path(), &origin, 16384, FetchMode::Stream);
    wait_until("stream fill", || (0..4).all(|chunk| image.is_present(chunk)));
    assert_eq!(image.stats().chunk_fetch_skips.get().0, 1);
    assert_eq!(read_vec(&image, 0, 16384), origin_range(0, 16384));
}

#[test]
fn close_mid_stream_leaves_demand_fetching_working() {
    let dir = tempfile::tempdir().unwrap();
    // 40 chunks, delivered slowly enough that close lands mid-stream.
    let size = 40 * u64::from(CHUNK);
    let origin = MemOrigin::with_stream(size, 1000, Duration::from_millis(5));
    let image = open_image(dir.path(), &origin, size, FetchMode::Stream);

    image.close();
    assert!(image.is_closed());

    // The worker observes the stop flag and releases its remaining locks;
    // any chunk it never reached is fetched on demand.
    if let Some(missing) = (0..40).find(|&chunk| !image.is_present(chunk)) {
        let start = missing * u64::from(CHUNK);
        assert_eq!(
            read_vec(&image, start, CHUNK as usize),
            origin_range(start, CHUNK as usize)
        );
        assert!(image.is_present(missing));
    }
}

#[test]
fn reopen_rediscovers_pristine_cache() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    {
        let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);
        assert_eq!(read_vec(&image, 0, 4096), origin_range(0, 4096));
    }
    assert_eq!(origin.fetches(), 1);

    let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);
    assert!(image.is_present(0));
    assert_eq!(read_vec(&image, 0, 4096), origin_range(0, 4096));
    // Served from the rediscovered cache.
    assert_eq!(origin.fetches(), 1);
}

#[test]
fn interrupted_fetch_propagates_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);

    let intr = Interrupt::new();
    intr.set();
    let mut buf = [0u8; 16];
    assert!(matches!(
        image.read(&mut buf, 0, &intr),
        Err(IoError::Interrupted)
    ));
    assert!(!image.is_present(0));
    assert_eq!(image.stats().io_errors.get().0, 0);
}

#[test]
fn size_pollable_fires_on_change_and_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);

    let fired = Arc::new(AtomicU64::new(0));
    let waker = |count: &Arc<AtomicU64>| {
        let count = count.clone();
        Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };

    let (_, cookie) = image.get_size();
    assert!(!image.size_add_waker(waker(&fired), cookie));
    image.set_size(20000, &Interrupt::new()).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Armed against a stale cookie: fires immediately.
    assert!(image.size_add_waker(waker(&fired), cookie));
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    // After close every subscription fires, current cookie or not.
    image.close();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    let (_, cookie) = image.get_size();
    assert!(image.size_add_waker(waker(&fired), cookie));
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[test]
fn stats_close_refuses_nothing_but_marks_closed() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MemOrigin::new(16384);
    let image = open_image(dir.path(), &origin, 16384, FetchMode::Demand);

    assert!(!image.stats().bytes_read.is_closed());
    image.close();
    assert!(image.stats().bytes_read.is_closed());
    assert!(image.stats().io_errors.is_closed());
}
