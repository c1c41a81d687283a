use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use fuser::{MountOption, Session};
use log::{error, info};

use netdiskfs::{DiskFs, HttpTransport, Image, ImageConfig, ImageSpec, Origin, Transport};

#[derive(Debug, Parser)]
#[command(name = "netdiskfs", version, about = "Mount remote disk images as local files")]
struct Args {
    /// Where to mount the filesystem.
    mountpoint: PathBuf,

    /// Directory holding the per-image caches.
    #[arg(long)]
    cache_dir: PathBuf,

    /// Image specification, repeatable:
    /// name=NAME,url=URL[,size=BYTES][,chunk-size=BYTES][,fetch-offset=BYTES]
    /// [,mode=demand|stream][,user=USER][,password=PASSWORD][,cookie=COOKIE]
    /// [,etag=ETAG][,last-modified=DATE]
    #[arg(long = "image", required = true, verbatim_doc_comment)]
    images: Vec<ImageSpec>,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,

    /// Unmount automatically when the process exits.
    #[arg(long)]
    auto_unmount: bool,
}

fn open_image(
    spec: &ImageSpec,
    cache_root: &PathBuf,
    transport: &Arc<HttpTransport>,
) -> Result<Arc<Image>, Box<dyn std::error::Error>> {
    let mut origin = Origin {
        url: spec.url.clone(),
        username: spec.username.clone(),
        password: spec.password.clone(),
        cookies: spec.cookies.clone(),
        etag: spec.etag.clone(),
        last_modified: spec.last_modified.clone(),
    };

    let initial_size = match spec.size {
        Some(size) => size,
        None => {
            let probe = transport.probe(&origin)?;
            // Pin the validators the probe saw so every later fetch checks
            // against the same origin state.
            if origin.etag.is_none() {
                origin.etag = probe.etag;
            }
            if origin.last_modified.is_none() {
                origin.last_modified = probe.last_modified;
            }
            probe.size.checked_sub(spec.fetch_offset).ok_or_else(|| {
                format!(
                    "image {}: fetch offset {} is past the origin size {}",
                    spec.name, spec.fetch_offset, probe.size
                )
            })?
        }
    };

    info!(
        "image {}: {} bytes from {} in {:?} mode",
        spec.name, initial_size, spec.url, spec.mode
    );
    let image = Image::open(
        ImageConfig {
            name: spec.name.clone(),
            origin,
            cache_dir: cache_root.join(&spec.name),
            fetch_offset: spec.fetch_offset,
            initial_size,
            chunk_size: spec.chunk_size,
            fetch_mode: spec.mode,
        },
        transport.clone() as Arc<dyn Transport>,
    )?;
    Ok(image)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let transport = Arc::new(HttpTransport::new());
    let mut images = Vec::new();
    for spec in &args.images {
        images.push(open_image(spec, &args.cache_dir, &transport)?);
    }

    let fs = DiskFs::new(images.clone());
    let notifier_slot = fs.notifier_slot();

    let mut options = vec![
        MountOption::FSName("netdiskfs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }
    if args.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let mut session = Session::new(fs, &args.mountpoint, &options)?;
    let _ = notifier_slot.set(session.notifier());
    session.run()?;

    for image in &images {
        image.close();
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        error!("{err}");
        process::exit(1);
    }
}
