//! FUSE dispatch surface.
//!
//! Presents each image as a directory holding the mutable `image` file and a
//! `stats/` tree of read-only counters:
//!
//! ```text
//! /<name>/image
//! /<name>/stats/{bytes_read,bytes_written,chunk_fetch_skips,
//!                chunk_fetches,chunk_dirties,io_errors,chunk_size,chunks}
//! ```
//!
//! Counter files snapshot their value and change cookie at open; `poll` arms
//! the matching pollable against the open-time cookie and wakes the kernel
//! through the FUSE poll notifier when it advances.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FUSE_ROOT_ID, FileAttr, FileType, Filesystem, Notifier, PollHandle, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyPoll, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow,
};
use log::debug;
use parking_lot::Mutex;

use crate::cond::Interrupt;
use crate::image::Image;
use crate::pollable::PollWaker;

const TTL: Duration = Duration::from_secs(1);

/// Inodes are laid out arithmetically: each image occupies a fixed stride of
/// the inode space starting after the root.
const INO_STRIDE: u64 = 16;

const STAT_NAMES: [&str; 6] = [
    "bytes_read",
    "bytes_written",
    "chunk_fetch_skips",
    "chunk_fetches",
    "chunk_dirties",
    "io_errors",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Root,
    ImageDir(usize),
    ImageFile(usize),
    StatsDir(usize),
    StatFile(usize, usize),
    ChunkSize(usize),
    Chunks(usize),
}

impl Node {
    fn ino(self) -> u64 {
        let base = |image: usize| 2 + image as u64 * INO_STRIDE;
        match self {
            Node::Root => FUSE_ROOT_ID,
            Node::ImageDir(i) => base(i),
            Node::ImageFile(i) => base(i) + 1,
            Node::StatsDir(i) => base(i) + 2,
            Node::StatFile(i, stat) => base(i) + 3 + stat as u64,
            Node::ChunkSize(i) => base(i) + 9,
            Node::Chunks(i) => base(i) + 10,
        }
    }

    fn decode(ino: u64, images: usize) -> Option<Node> {
        if ino == FUSE_ROOT_ID {
            return Some(Node::Root);
        }
        if ino < 2 {
            return None;
        }
        let image = ((ino - 2) / INO_STRIDE) as usize;
        if image >= images {
            return None;
        }
        match (ino - 2) % INO_STRIDE {
            0 => Some(Node::ImageDir(image)),
            1 => Some(Node::ImageFile(image)),
            2 => Some(Node::StatsDir(image)),
            slot @ 3..=8 => Some(Node::StatFile(image, (slot - 3) as usize)),
            9 => Some(Node::ChunkSize(image)),
            10 => Some(Node::Chunks(image)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PollSource {
    Stat(usize, usize),
    ImageSize(usize),
    Fixed,
}

enum OpenHandle {
    Image(usize),
    Buffered {
        content: Vec<u8>,
        cookie: u64,
        source: PollSource,
    },
}

/// The filesystem served to the kernel.
pub struct DiskFs {
    images: Vec<Arc<Image>>,
    notifier: Arc<OnceLock<Notifier>>,
    handles: Mutex<HashMap<u64, OpenHandle>>,
    next_fh: AtomicU64,
}

impl DiskFs {
    /// Build the filesystem over the given images.
    pub fn new(images: Vec<Arc<Image>>) -> Self {
        DiskFs {
            images,
            notifier: Arc::new(OnceLock::new()),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    /// Slot for the session's poll notifier; filled in by the mount code
    /// once the session exists.
    pub fn notifier_slot(&self) -> Arc<OnceLock<Notifier>> {
        self.notifier.clone()
    }

    fn decode(&self, ino: u64) -> Option<Node> {
        Node::decode(ino, self.images.len())
    }

    fn lookup_node(&self, parent: Node, name: &str) -> Option<Node> {
        match parent {
            Node::Root => {
                let image = self.images.iter().position(|img| img.name() == name)?;
                Some(Node::ImageDir(image))
            }
            Node::ImageDir(i) => match name {
                "image" => Some(Node::ImageFile(i)),
                "stats" => Some(Node::StatsDir(i)),
                _ => None,
            },
            Node::StatsDir(i) => {
                if let Some(stat) = STAT_NAMES.iter().position(|stat| *stat == name) {
                    return Some(Node::StatFile(i, stat));
                }
                match name {
                    "chunk_size" => Some(Node::ChunkSize(i)),
                    "chunks" => Some(Node::Chunks(i)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn attr(&self, req: &Request<'_>, node: Node) -> FileAttr {
        let (kind, perm, size) = match node {
            Node::Root | Node::ImageDir(_) | Node::StatsDir(_) => {
                (FileType::Directory, 0o555, 0)
            }
            Node::ImageFile(i) => (FileType::RegularFile, 0o600, self.images[i].get_size().0),
            // Pseudo-file sizes are nominal; reads are served from the
            // open-time snapshot.
            Node::StatFile(..) | Node::ChunkSize(_) | Node::Chunks(_) => {
                (FileType::RegularFile, 0o444, 0)
            }
        };
        FileAttr {
            ino: node.ino(),
            size,
            blocks: size.div_ceil(512),
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind,
            perm,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn insert_handle(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(fh, handle);
        fh
    }

    /// Open-time snapshot for a pseudo-file, or `None` to refuse the open.
    fn snapshot(&self, node: Node) -> Option<OpenHandle> {
        match node {
            Node::StatFile(i, stat) => {
                let stats = self.images[i].stats();
                let stat_ref = stat_by_index(stats, stat);
                if stat_ref.is_closed() {
                    return None;
                }
                let (value, cookie) = stat_ref.get();
                Some(OpenHandle::Buffered {
                    content: format!("{value}\n").into_bytes(),
                    cookie,
                    source: PollSource::Stat(i, stat),
                })
            }
            Node::ChunkSize(i) => Some(OpenHandle::Buffered {
                content: format!("{}\n", self.images[i].chunk_size()).into_bytes(),
                cookie: 0,
                source: PollSource::Fixed,
            }),
            Node::Chunks(i) => {
                let image = &self.images[i];
                if image.is_closed() {
                    return None;
                }
                let (size, cookie) = image.get_size();
                let chunks = size.div_ceil(u64::from(image.chunk_size()));
                Some(OpenHandle::Buffered {
                    content: format!("{chunks}\n").into_bytes(),
                    cookie,
                    source: PollSource::ImageSize(i),
                })
            }
            _ => None,
        }
    }

    fn poll_waker(&self, ph: PollHandle) -> Option<Box<dyn PollWaker>> {
        let notifier = self.notifier.get()?.clone();
        Some(Box::new(move || {
            if let Err(err) = notifier.poll(ph.into()) {
                debug!("poll notification failed: {err}");
            }
        }))
    }
}

fn stat_by_index(stats: &crate::stats::ImageStats, index: usize) -> &crate::stats::Stat {
    match index {
        0 => &stats.bytes_read,
        1 => &stats.bytes_written,
        2 => &stats.chunk_fetch_skips,
        3 => &stats.chunk_fetches,
        4 => &stats.chunk_dirties,
        _ => &stats.io_errors,
    }
}

const POLL_READY: u32 = (libc::POLLIN | libc::POLLRDNORM) as u32;

impl Filesystem for DiskFs {
    fn destroy(&mut self) {
        for image in &self.images {
            image.close();
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let found = self
            .decode(parent)
            .zip(name.to_str())
            .and_then(|(parent, name)| self.lookup_node(parent, name));
        match found {
            Some(node) => reply.entry(&TTL, &self.attr(req, node), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.decode(ino) {
            Some(node) => reply.attr(&TTL, &self.attr(req, node)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(node) = self.decode(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(size) = size {
            let Node::ImageFile(i) = node else {
                reply.error(libc::EACCES);
                return;
            };
            let intr = Interrupt::new();
            if let Err(err) = self.images[i].set_size(size, &intr) {
                reply.error(err.errno());
                return;
            }
        }
        reply.attr(&TTL, &self.attr(req, node));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.decode(ino) {
            Some(Node::ImageFile(i)) => {
                if self.images[i].is_closed() {
                    reply.error(libc::EACCES);
                } else {
                    let fh = self.insert_handle(OpenHandle::Image(i));
                    reply.opened(fh, 0);
                }
            }
            Some(node @ (Node::StatFile(..) | Node::ChunkSize(_) | Node::Chunks(_))) => {
                match self.snapshot(node) {
                    Some(handle) => {
                        let fh = self.insert_handle(handle);
                        reply.opened(fh, 0);
                    }
                    None => reply.error(libc::EACCES),
                }
            }
            Some(_) => reply.error(libc::EISDIR),
            None => reply.error(libc::ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let handles = self.handles.lock();
        match handles.get(&fh) {
            Some(OpenHandle::Image(i)) => {
                let image = self.images[*i].clone();
                drop(handles);
                if image.is_closed() {
                    reply.error(libc::EACCES);
                    return;
                }
                let intr = Interrupt::new();
                let mut buf = vec![0u8; size as usize];
                match image.read(&mut buf, offset as u64, &intr) {
                    Ok(count) => reply.data(&buf[..count]),
                    Err(err) => reply.error(err.errno()),
                }
            }
            Some(OpenHandle::Buffered { content, .. }) => {
                let start = (offset as usize).min(content.len());
                let end = (start + size as usize).min(content.len());
                reply.data(&content[start..end]);
            }
            None => reply.error(libc::EBADF),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let handles = self.handles.lock();
        match handles.get(&fh) {
            Some(OpenHandle::Image(i)) => {
                let image = self.images[*i].clone();
                drop(handles);
                if image.is_closed() {
                    reply.error(libc::EACCES);
                    return;
                }
                let intr = Interrupt::new();
                match image.write(data, offset as u64, &intr) {
                    Ok(count) => reply.written(count as u32),
                    Err(err) => reply.error(err.errno()),
                }
            }
            Some(OpenHandle::Buffered { .. }) => reply.error(libc::EACCES),
            None => reply.error(libc::EBADF),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let image = match self.handles.lock().get(&fh) {
            Some(OpenHandle::Image(i)) => Some(self.images[*i].clone()),
            _ => None,
        };
        match image.map(|image| image.sync()).transpose() {
            Ok(_) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.lock().remove(&fh);
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        let image = match self.handles.lock().get(&fh) {
            Some(OpenHandle::Image(i)) => Some(self.images[*i].clone()),
            _ => None,
        };
        match image.map(|image| image.sync()).transpose() {
            Ok(_) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(node) = self.decode(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let parent = match node {
            Node::StatsDir(i) => Node::ImageDir(i).ino(),
            _ => FUSE_ROOT_ID,
        };
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_owned()),
            (parent, FileType::Directory, "..".to_owned()),
        ];
        match node {
            Node::Root => {
                for (i, image) in self.images.iter().enumerate() {
                    entries.push((
                        Node::ImageDir(i).ino(),
                        FileType::Directory,
                        image.name().to_owned(),
                    ));
                }
            }
            Node::ImageDir(i) => {
                entries.push((
                    Node::ImageFile(i).ino(),
                    FileType::RegularFile,
                    "image".to_owned(),
                ));
                entries.push((Node::StatsDir(i).ino(), FileType::Directory, "stats".to_owned()));
            }
            Node::StatsDir(i) => {
                for (stat, name) in STAT_NAMES.iter().enumerate() {
                    entries.push((
                        Node::StatFile(i, stat).ino(),
                        FileType::RegularFile,
                        (*name).to_owned(),
                    ));
                }
                entries.push((
                    Node::ChunkSize(i).ino(),
                    FileType::RegularFile,
                    "chunk_size".to_owned(),
                ));
                entries.push((Node::Chunks(i).ino(), FileType::RegularFile, "chunks".to_owned()));
            }
            _ => {
                reply.error(libc::ENOTDIR);
                return;
            }
        }
        for (index, (ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(ino, (index + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn poll(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        ph: PollHandle,
        _events: u32,
        _flags: u32,
        reply: ReplyPoll,
    ) {
        let (cookie, source) = match self.handles.lock().get(&fh) {
            Some(OpenHandle::Buffered { cookie, source, .. }) => (*cookie, *source),
            Some(OpenHandle::Image(_)) => {
                reply.poll(POLL_READY);
                return;
            }
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        let Some(waker) = self.poll_waker(ph) else {
            // No notifier wired up: report ready rather than arming a wakeup
            // that could never fire.
            reply.poll(POLL_READY);
            return;
        };
        let changed = match source {
            PollSource::Stat(i, stat) => {
                stat_by_index(self.images[i].stats(), stat).add_waker_conditional(waker, cookie)
            }
            PollSource::ImageSize(i) => self.images[i].size_add_waker(waker, cookie),
            PollSource::Fixed => true,
        };
        reply.poll(if changed { POLL_READY } else { 0 });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }
}

impl std::fmt::Debug for DiskFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskFs")
            .field("images", &self.images.len())
            .finish()
    }
}
