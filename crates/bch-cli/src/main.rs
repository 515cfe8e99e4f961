#![forbid(unsafe_code)]
//! The multiplexer binary: one executable dispatching every
//! management subcommand against file- or device-backed filesystems.
//!
//! Exit codes: 0 success, 1 usage or generic error, 2 corruption
//! detected and fixed, 4 uncorrectable corruption, 8 fatal,
//! 16 help displayed.

use anyhow::{Context, Result, bail};
use asupersync::Cx;
use bch_error::ExitCode;
use bch_fs::ctl::{DeviceFlags, Ioctl, IoctlReply};
use bch_fs::data::DataOp;
use bch_fs::format::{FormatDev, FormatOpts};
use bch_fs::fsck::RepairPolicy;
use bch_fs::{Fs, OpenOptions};
use bch_types::{DeviceIdx, MemberState, Pos};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode as ProcessExit;
use std::sync::Arc;

fn cli_cx() -> Cx {
    Cx::for_request()
}

#[derive(Parser)]
#[command(name = "bcachefs", about = "multi-device COW filesystem management tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct FsArgs {
    /// Member devices (repeat or colon-join), or the filesystem UUID.
    #[arg(required = true)]
    devices: Vec<String>,
    /// Passphrase for encrypted filesystems.
    #[arg(long)]
    passphrase: Option<String>,
    /// Allow mounting with missing members.
    #[arg(long)]
    degraded: bool,
}

#[derive(Args, Debug)]
struct FormatArgs {
    devices: Vec<PathBuf>,
    /// Sets both data and metadata replicas.
    #[arg(long)]
    replicas: Option<u8>,
    /// Enable whole-filesystem encryption (chacha20/poly1305).
    #[arg(long)]
    encrypted: bool,
    #[arg(long)]
    passphrase: Option<String>,
    #[arg(short = 'L', long)]
    label: Option<String>,
    #[arg(short = 'U', long)]
    uuid: Option<uuid::Uuid>,
    #[arg(long)]
    block_size: Option<u32>,
    #[arg(long)]
    btree_node_size: Option<u32>,
    #[arg(long)]
    bucket_size: Option<u32>,
    #[arg(long)]
    fs_size: Option<u64>,
    #[arg(long)]
    compression: Option<String>,
    #[arg(long)]
    data_replicas: Option<u8>,
    #[arg(long)]
    metadata_replicas: Option<u8>,
    /// Disk group label for the devices.
    #[arg(short = 'g', long)]
    group: Option<String>,
    #[arg(long)]
    discard: bool,
    #[arg(long)]
    durability: Option<u8>,
    #[arg(long)]
    data_allowed: Option<String>,
    #[arg(long)]
    foreground_target: Option<String>,
    #[arg(long)]
    background_target: Option<String>,
    #[arg(long)]
    promote_target: Option<String>,
    #[arg(long)]
    metadata_target: Option<String>,
    #[arg(long)]
    error_action: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new filesystem on one or more devices.
    Format(FormatArgs),
    /// Print a device's superblock.
    ShowSuper {
        device: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Check (and optionally repair) filesystem consistency.
    Fsck {
        #[command(flatten)]
        fs: FsArgs,
        /// Fix everything fixable without asking.
        #[arg(short = 'y', long)]
        fix: bool,
    },
    /// Filesystem-level queries.
    Fs {
        #[command(subcommand)]
        cmd: FsCmd,
    },
    /// Member-device management.
    Device {
        #[command(subcommand)]
        cmd: DeviceCmd,
    },
    /// Bulk data jobs.
    Data {
        #[command(subcommand)]
        cmd: DataCmd,
    },
    /// Subvolume management.
    Subvolume {
        #[command(subcommand)]
        cmd: SubvolumeCmd,
    },
    /// Move all data off a device so it can be removed.
    Migrate {
        #[command(flatten)]
        fs: FsArgs,
        #[arg(long)]
        dev: u32,
    },
    /// Rewrite the superblock copies of one member from the others.
    MigrateSuperblock {
        #[command(flatten)]
        fs: FsArgs,
        /// Member device whose copies should be rewritten.
        #[arg(long)]
        dev: u32,
    },
    /// Dump metadata summary for support bundles.
    Dump {
        #[command(flatten)]
        fs: FsArgs,
    },
    /// List keys of one btree.
    List {
        #[command(flatten)]
        fs: FsArgs,
        /// Which btree to walk.
        #[arg(short = 'b', long, default_value = "extents")]
        btree: String,
        /// Range start, `inode:offset[:snapshot]`.
        #[arg(short = 's', long)]
        start: Option<String>,
        /// Range end, `inode:offset[:snapshot]`.
        #[arg(short = 'e', long)]
        end: Option<String>,
    },
    /// List journal entries.
    ListJournal {
        #[command(flatten)]
        fs: FsArgs,
    },
    /// Set (or change) the encryption passphrase.
    SetPassphrase {
        #[command(flatten)]
        fs: FsArgs,
        #[arg(long)]
        new_passphrase: String,
    },
    /// Wrap the key under the empty passphrase.
    RemovePassphrase {
        #[command(flatten)]
        fs: FsArgs,
    },
    /// Verify a passphrase against the stored key material.
    Unlock {
        device: PathBuf,
        #[arg(long)]
        passphrase: String,
    },
    /// Set a bcachefs. attribute on a path.
    Setattr {
        #[command(flatten)]
        fs: FsArgs,
        path: String,
        name: String,
        value: String,
    },
    /// Mount via the external FUSE adapter.
    Fusemount {
        #[command(flatten)]
        fs: FsArgs,
        mountpoint: PathBuf,
    },
    /// Print version information.
    Version,
}

#[derive(Subcommand)]
enum FsCmd {
    /// Capacity and usage summary.
    Usage {
        #[command(flatten)]
        fs: FsArgs,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum DeviceCmd {
    Add {
        #[command(flatten)]
        fs: FsArgs,
        device: PathBuf,
    },
    Remove {
        #[command(flatten)]
        fs: FsArgs,
        #[arg(long)]
        dev: u32,
        #[arg(short = 'f', long)]
        force: bool,
    },
    Online {
        #[command(flatten)]
        fs: FsArgs,
        device: PathBuf,
    },
    Offline {
        #[command(flatten)]
        fs: FsArgs,
        #[arg(long)]
        dev: u32,
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Migrate data off a device, then leave it empty.
    Evacuate {
        #[command(flatten)]
        fs: FsArgs,
        #[arg(long)]
        dev: u32,
    },
    SetState {
        #[command(flatten)]
        fs: FsArgs,
        #[arg(long)]
        dev: u32,
        /// One of rw, ro, failed, spare.
        state: String,
        #[arg(short = 'f', long)]
        force: bool,
    },
    Resize {
        #[command(flatten)]
        fs: FsArgs,
        #[arg(long)]
        dev: u32,
        nbuckets: u64,
    },
    ResizeJournal {
        #[command(flatten)]
        fs: FsArgs,
        #[arg(long)]
        dev: u32,
        nbuckets: u64,
    },
}

#[derive(Subcommand)]
enum DataCmd {
    /// Restore every extent's desired replica count.
    Rereplicate {
        #[command(flatten)]
        fs: FsArgs,
        #[arg(short = 's', long)]
        start: Option<String>,
        #[arg(short = 'e', long)]
        end: Option<String>,
    },
    /// Reserved.
    Scrub {
        #[command(flatten)]
        fs: FsArgs,
    },
    /// Run a named data job.
    Job {
        #[command(flatten)]
        fs: FsArgs,
        /// rereplicate | scrub | rewrite_old_nodes | migrate
        job: String,
        #[arg(long)]
        dev: Option<u32>,
        #[arg(short = 's', long)]
        start: Option<String>,
        #[arg(short = 'e', long)]
        end: Option<String>,
    },
}

#[derive(Subcommand)]
enum SubvolumeCmd {
    Create {
        #[command(flatten)]
        fs: FsArgs,
        path: String,
    },
    Delete {
        #[command(flatten)]
        fs: FsArgs,
        path: String,
    },
    Snapshot {
        #[command(flatten)]
        fs: FsArgs,
        src: String,
        dst: String,
        #[arg(long)]
        readonly: bool,
    },
}

fn main() -> ProcessExit {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                let _ = err.print();
                ExitCode::Error
            } else {
                // Help or version text requested.
                let _ = err.print();
                ExitCode::HelpDisplayed
            };
            return to_process_exit(code);
        }
    };

    match run(cli) {
        Ok(code) => to_process_exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<bch_error::Error>()
                .map(classify_error)
                .unwrap_or(ExitCode::Error);
            to_process_exit(code)
        }
    }
}

fn to_process_exit(code: ExitCode) -> ProcessExit {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    ProcessExit::from(code.code() as u8)
}

fn classify_error(err: &bch_error::Error) -> ExitCode {
    use bch_error::Error;
    match err {
        Error::BadMagic { .. } | Error::Stopped => ExitCode::Fatal,
        e if e.is_corruption() => ExitCode::UncorrectedErrors,
        _ => ExitCode::Error,
    }
}

/// Split colon-joined device lists.
fn device_paths(args: &FsArgs) -> Vec<PathBuf> {
    args.devices
        .iter()
        .flat_map(|d| d.split(':'))
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn open_fs(cx: &Cx, args: &FsArgs) -> Result<Arc<Fs>> {
    let opts = OpenOptions {
        read_only: false,
        passphrase: args.passphrase.clone(),
        degraded: args.degraded,
        opts: Default::default(),
    };

    // A single UUID argument means "search for members".
    if args.devices.len() == 1 {
        if let Ok(uuid) = uuid::Uuid::parse_str(&args.devices[0]) {
            let candidates = bch_fs::mount::enumerate_block_devices(std::path::Path::new("/dev"))
                .unwrap_or_default();
            return Fs::open_by_uuid(cx, uuid, &candidates, &opts)
                .with_context(|| format!("opening filesystem {uuid}"));
        }
    }

    let paths = device_paths(args);
    Fs::open(cx, &paths, &opts).context("opening filesystem")
}

fn parse_pos(s: Option<&str>, default: Pos) -> Result<Pos> {
    let Some(s) = s else { return Ok(default) };
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        bail!("position must be inode:offset[:snapshot], got {s:?}");
    }
    Ok(Pos {
        inode: parts[0].parse().context("inode")?,
        offset: parts[1].parse().context("offset")?,
        snapshot: parts.get(2).map(|p| p.parse()).transpose().context("snapshot")?.unwrap_or(0),
    })
}

fn run(cli: Cli) -> Result<ExitCode> {
    let cx = cli_cx();
    match cli.command {
        Command::Format(args) => cmd_format(&cx, args),
        Command::ShowSuper { device, json } => cmd_show_super(&cx, &device, json),
        Command::Fsck { fs, fix } => cmd_fsck(&cx, &fs, fix),
        Command::Fs {
            cmd: FsCmd::Usage { fs, json },
        } => cmd_usage(&cx, &fs, json),
        Command::Device { cmd } => cmd_device(&cx, cmd),
        Command::Data { cmd } => cmd_data(&cx, cmd),
        Command::Subvolume { cmd } => cmd_subvolume(&cx, cmd),
        Command::Migrate { fs, dev } => {
            let handle = open_fs(&cx, &fs)?;
            let summary = handle.run_data_job(
                &cx,
                DataOp::Migrate { dev },
                Pos::MIN,
                Pos::MAX,
                &mut print_progress,
            )?;
            println!(
                "migrated {} keys ({} sectors) off device {dev}",
                summary.keys_processed, summary.sectors_moved
            );
            handle.stop(&cx)?;
            Ok(ExitCode::Ok)
        }
        Command::MigrateSuperblock { fs, dev } => {
            let handle = open_fs(&cx, &fs)?;
            // Rewriting every copy heals a member whose superblock
            // region was damaged.
            handle.write_sb(&cx)?;
            println!("superblock copies rewritten (member {dev})");
            handle.stop(&cx)?;
            Ok(ExitCode::Ok)
        }
        Command::Dump { fs } => cmd_dump(&cx, &fs),
        Command::List {
            fs,
            btree,
            start,
            end,
        } => cmd_list(&cx, &fs, &btree, start.as_deref(), end.as_deref()),
        Command::ListJournal { fs } => cmd_list_journal(&cx, &fs),
        Command::SetPassphrase { fs, new_passphrase } => {
            let handle = open_fs(&cx, &fs)?;
            handle.set_passphrase(&cx, &new_passphrase)?;
            handle.stop(&cx)?;
            Ok(ExitCode::Ok)
        }
        Command::RemovePassphrase { fs } => {
            let handle = open_fs(&cx, &fs)?;
            handle.remove_passphrase(&cx)?;
            handle.stop(&cx)?;
            Ok(ExitCode::Ok)
        }
        Command::Unlock { device, passphrase } => {
            let dev = bch_block::FileByteDevice::open(&device)?;
            let sb = bch_super::read_super(&cx, &dev)?;
            Fs::check_passphrase(&sb, &passphrase)?;
            println!("passphrase ok");
            Ok(ExitCode::Ok)
        }
        Command::Setattr {
            fs,
            path,
            name,
            value,
        } => {
            let handle = open_fs(&cx, &fs)?;
            handle.setattr(&cx, &path, &name, &value)?;
            handle.stop(&cx)?;
            Ok(ExitCode::Ok)
        }
        Command::Fusemount {
            fs: _,
            mountpoint: _,
        } => {
            bail!(bch_error::Error::NotImplemented(
                "the FUSE adapter ships as a separate binary; install it and mount through it"
            ));
        }
        Command::Version => {
            println!("bcachefs tool version {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::Ok)
        }
    }
}

#[allow(clippy::too_many_lines)]
fn cmd_format(cx: &Cx, args: FormatArgs) -> Result<ExitCode> {
    let FormatArgs {
        devices,
        replicas,
        encrypted,
        passphrase,
        label,
        uuid,
        block_size,
        btree_node_size,
        bucket_size,
        fs_size,
        compression,
        data_replicas,
        metadata_replicas,
        group,
        discard,
        durability,
        data_allowed,
        foreground_target,
        background_target,
        promote_target,
        metadata_target,
        error_action,
    } = args;
    if devices.is_empty() {
        bail!("format needs at least one device");
    }
    if encrypted && passphrase.is_none() {
        bail!("--encrypted needs --passphrase");
    }

    let mut opts = FormatOpts {
        label: label.unwrap_or_default(),
        uuid,
        passphrase: if encrypted { passphrase } else { None },
        foreground_target: foreground_target.unwrap_or_default(),
        background_target: background_target.unwrap_or_default(),
        promote_target: promote_target.unwrap_or_default(),
        metadata_target: metadata_target.unwrap_or_default(),
        ..FormatOpts::default()
    };
    if let Some(v) = block_size {
        opts.opts.set_by_name("block_size", &v.to_string())?;
    }
    if let Some(v) = btree_node_size {
        opts.opts.set_by_name("btree_node_size", &v.to_string())?;
    }
    if let Some(v) = replicas {
        opts.opts.set_by_name("data_replicas", &v.to_string())?;
        opts.opts.set_by_name("metadata_replicas", &v.to_string())?;
    }
    if let Some(v) = data_replicas {
        opts.opts.set_by_name("data_replicas", &v.to_string())?;
    }
    if let Some(v) = metadata_replicas {
        opts.opts.set_by_name("metadata_replicas", &v.to_string())?;
    }
    if let Some(v) = &compression {
        opts.opts.set_by_name("compression", v)?;
    }
    if let Some(v) = &error_action {
        opts.opts.set_by_name("error_action", v)?;
    }

    let mut format_devs = Vec::new();
    for path in devices {
        let mut fd = FormatDev::new(path);
        fd.opts.discard = discard;
        if let Some(v) = durability {
            fd.opts.set_by_name("durability", &v.to_string())?;
        }
        if let Some(v) = &data_allowed {
            fd.opts.set_by_name("data_allowed", v)?;
        }
        fd.opts.group = group.clone();
        if let Some(size) = fs_size {
            fd.size = size;
        }
        if let Some(bs) = bucket_size {
            fd.bucket_size = bs;
        }
        format_devs.push(fd);
    }

    let uuid = bch_fs::format::format(cx, &format_devs, &opts)?;
    println!("formatted: {uuid}");
    Ok(ExitCode::Ok)
}

fn cmd_show_super(cx: &Cx, device: &PathBuf, json: bool) -> Result<ExitCode> {
    let dev = bch_block::FileByteDevice::open(device)
        .with_context(|| format!("opening {}", device.display()))?;
    let sb = bch_super::read_super(cx, &dev)?;
    if json {
        // The superblock is a hand-coded codec, not serde; render the
        // interesting fields.
        let rendered = serde_json::json!({
            "external_uuid": sb.user_uuid.to_string(),
            "internal_uuid": sb.uuid.to_string(),
            "label": sb.label,
            "version": sb.version,
            "seq": sb.seq,
            "block_size": sb.block_size,
            "btree_node_size": sb.opts.btree_node_size,
            "encrypted": sb.crypt.is_some(),
            "members": sb.members.iter().map(|m| serde_json::json!({
                "uuid": m.uuid.to_string(),
                "nbuckets": m.nbuckets,
                "bucket_size_sectors": m.bucket_size,
                "state": m.state.to_string(),
                "durability": m.durability,
                "group": m.group,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&rendered)?);
    } else {
        println!("external uuid: {}", sb.user_uuid);
        println!("internal uuid: {}", sb.uuid);
        println!("label:         {}", sb.label);
        println!("version:       {}", sb.version);
        println!("seq:           {}", sb.seq);
        println!("block size:    {}", sb.block_size);
        println!("node size:     {}", sb.opts.btree_node_size);
        println!("encrypted:     {}", sb.crypt.is_some());
        println!("members:       {}", sb.members.len());
        for (idx, m) in sb.members.iter().enumerate() {
            println!(
                "  device {idx}: {} buckets of {} sectors, state {}, durability {}",
                m.nbuckets, m.bucket_size, m.state, m.durability
            );
        }
    }
    Ok(ExitCode::Ok)
}

fn cmd_fsck(cx: &Cx, fs: &FsArgs, fix: bool) -> Result<ExitCode> {
    let handle = open_fs(cx, fs)?;
    let policy = if fix {
        RepairPolicy::Yes
    } else {
        RepairPolicy::No
    };
    let report = handle.fsck(cx, policy)?;
    for note in &report.notes {
        println!("fsck: {note}");
    }
    println!(
        "fsck: {} keys checked, {} errors, {} fixed",
        report.keys_checked, report.errors_found, report.errors_fixed
    );
    let code = report.exit_code();
    handle.stop(cx)?;
    Ok(code)
}

fn cmd_usage(cx: &Cx, fs: &FsArgs, json: bool) -> Result<ExitCode> {
    let handle = open_fs(cx, fs)?;
    let usage = handle.fs_usage(cx)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&usage)?);
    } else {
        println!(
            "capacity: {} MiB",
            usage.capacity_sectors * 512 / (1 << 20)
        );
        println!("used:     {} MiB", usage.used_sectors * 512 / (1 << 20));
        println!("free:     {} MiB", usage.free_sectors * 512 / (1 << 20));
        println!("degraded: {}", usage.degraded);
        for dev in &usage.devices {
            println!(
                "device {}: state {}, {}/{} buckets free, {} user, {} cached",
                dev.dev,
                dev.state,
                dev.buckets_free,
                dev.nbuckets,
                dev.buckets_user,
                dev.buckets_cached
            );
        }
    }
    handle.stop(cx)?;
    Ok(ExitCode::Ok)
}

fn cmd_device(cx: &Cx, cmd: DeviceCmd) -> Result<ExitCode> {
    match cmd {
        DeviceCmd::Add { fs, device } => {
            let handle = open_fs(cx, &fs)?;
            let reply = handle.ioctl(cx, Ioctl::DiskAdd { path: device })?;
            if let IoctlReply::DeviceIdx(idx) = reply {
                println!("added as device {idx}");
            }
            handle.stop(cx)?;
        }
        DeviceCmd::Remove { fs, dev, force } => {
            let handle = open_fs(cx, &fs)?;
            handle.ioctl(
                cx,
                Ioctl::DiskRemove {
                    dev,
                    flags: DeviceFlags { force },
                },
            )?;
            handle.stop(cx)?;
        }
        DeviceCmd::Online { fs, device } => {
            let handle = open_fs(cx, &fs)?;
            handle.ioctl(cx, Ioctl::DiskOnline { path: device })?;
            handle.stop(cx)?;
        }
        DeviceCmd::Offline { fs, dev, force } => {
            let handle = open_fs(cx, &fs)?;
            handle.ioctl(
                cx,
                Ioctl::DiskOffline {
                    dev,
                    flags: DeviceFlags { force },
                },
            )?;
            handle.stop(cx)?;
        }
        DeviceCmd::Evacuate { fs, dev } => {
            let handle = open_fs(cx, &fs)?;
            let summary = handle.run_data_job(
                cx,
                DataOp::Migrate { dev },
                Pos::MIN,
                Pos::MAX,
                &mut print_progress,
            )?;
            println!(
                "evacuated {} keys ({} sectors)",
                summary.keys_processed, summary.sectors_moved
            );
            handle.stop(cx)?;
        }
        DeviceCmd::SetState {
            fs,
            dev,
            state,
            force,
        } => {
            let state = MemberState::parse(&state).map_err(bch_error::Error::from)?;
            let handle = open_fs(cx, &fs)?;
            handle.ioctl(
                cx,
                Ioctl::DiskSetState {
                    dev,
                    state,
                    flags: DeviceFlags { force },
                },
            )?;
            handle.stop(cx)?;
        }
        DeviceCmd::Resize { fs, dev, nbuckets } => {
            let handle = open_fs(cx, &fs)?;
            handle.ioctl(cx, Ioctl::DiskResize { dev, nbuckets })?;
            handle.stop(cx)?;
        }
        DeviceCmd::ResizeJournal { fs, dev, nbuckets } => {
            let handle = open_fs(cx, &fs)?;
            handle.ioctl(cx, Ioctl::DiskResizeJournal { dev, nbuckets })?;
            handle.stop(cx)?;
        }
    }
    Ok(ExitCode::Ok)
}

fn print_progress(progress: bch_fs::data::DataProgress) {
    println!(
        "{}: {} keys, {} sectors (at {})",
        progress.op, progress.keys_processed, progress.sectors_moved, progress.pos
    );
}

fn cmd_data(cx: &Cx, cmd: DataCmd) -> Result<ExitCode> {
    let (fs, op, start, end) = match cmd {
        DataCmd::Rereplicate { fs, start, end } => (fs, DataOp::Rereplicate, start, end),
        DataCmd::Scrub { fs } => (fs, DataOp::Scrub, None, None),
        DataCmd::Job {
            fs,
            job,
            dev,
            start,
            end,
        } => {
            let op = match job.as_str() {
                "rereplicate" => DataOp::Rereplicate,
                "scrub" => DataOp::Scrub,
                "rewrite_old_nodes" => DataOp::RewriteOldNodes,
                "migrate" => DataOp::Migrate {
                    dev: dev.ok_or_else(|| anyhow::anyhow!("migrate needs --dev"))?,
                },
                other => bail!("unknown data job {other:?}"),
            };
            (fs, op, start, end)
        }
    };
    let start = parse_pos(start.as_deref(), Pos::MIN)?;
    let end = parse_pos(end.as_deref(), Pos::MAX)?;

    let handle = open_fs(cx, &fs)?;
    let summary = handle.run_data_job(cx, op, start, end, &mut print_progress)?;
    println!(
        "{}: {} keys processed, {} sectors moved",
        op.as_str(),
        summary.keys_processed,
        summary.sectors_moved
    );
    handle.stop(cx)?;
    Ok(ExitCode::Ok)
}

fn cmd_subvolume(cx: &Cx, cmd: SubvolumeCmd) -> Result<ExitCode> {
    match cmd {
        SubvolumeCmd::Create { fs, path } => {
            let handle = open_fs(cx, &fs)?;
            let id = handle.subvolume_create(cx, &path)?;
            println!("created subvolume {id} at {path}");
            handle.stop(cx)?;
        }
        SubvolumeCmd::Delete { fs, path } => {
            let handle = open_fs(cx, &fs)?;
            handle.subvolume_destroy(cx, &path)?;
            handle.stop(cx)?;
        }
        SubvolumeCmd::Snapshot {
            fs,
            src,
            dst,
            readonly,
        } => {
            let handle = open_fs(cx, &fs)?;
            let id = handle.subvolume_snapshot(cx, &src, &dst, readonly)?;
            println!("created snapshot {id} at {dst}");
            handle.stop(cx)?;
        }
    }
    Ok(ExitCode::Ok)
}

fn cmd_dump(cx: &Cx, fs: &FsArgs) -> Result<ExitCode> {
    let handle = open_fs(cx, fs)?;
    let sb = handle.sb();
    println!("superblock seq {} uuid {}", sb.seq, sb.user_uuid);
    for btree in bch_types::BtreeId::ALL {
        let mut count = 0_u64;
        let mut iter = handle.sys.iter(btree, Pos::MIN);
        while let Some(key) = handle.sys.iter_peek(cx, &mut iter)? {
            iter.advance(&key);
            count += 1;
        }
        println!("btree {btree}: {count} keys");
    }
    handle.stop(cx)?;
    Ok(ExitCode::Ok)
}

fn cmd_list(
    cx: &Cx,
    fs: &FsArgs,
    btree: &str,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<ExitCode> {
    let btree = bch_types::BtreeId::ALL
        .into_iter()
        .find(|b| b.as_str() == btree)
        .ok_or_else(|| anyhow::anyhow!("unknown btree {btree:?}"))?;
    let start = parse_pos(start, Pos::MIN)?;
    let end = parse_pos(end, Pos::MAX)?;

    let handle = open_fs(cx, fs)?;
    let mut iter = handle.sys.iter(btree, start);
    while let Some(key) = handle.sys.iter_peek(cx, &mut iter)? {
        if key.pos >= end {
            break;
        }
        iter.advance(&key);
        println!("{} size {}: {:?}", key.pos, key.size, key.val);
    }
    handle.stop(cx)?;
    Ok(ExitCode::Ok)
}

fn cmd_list_journal(cx: &Cx, fs: &FsArgs) -> Result<ExitCode> {
    // Journal contents are only meaningful pre-replay, so read the
    // devices directly instead of mounting.
    let paths = device_paths(fs);
    let mut slots = Vec::new();
    let mut sb_newest: Option<bch_ondisk::sb::Superblock> = None;
    for path in &paths {
        let dev: Arc<dyn bch_block::ByteDevice> =
            Arc::new(bch_block::FileByteDevice::open(path)?);
        let sb = bch_super::read_super(cx, dev.as_ref())?;
        let member = sb.this_member()?.clone();
        let device = Arc::new(bch_block::Device::new(
            DeviceIdx(sb.dev_idx),
            path.clone(),
            dev,
            MemberState::Ro,
            member.bucket_size,
            member.nbuckets,
            member.first_bucket,
            member.durability,
            member.data_allowed,
            member.discard,
        ));
        if let Some(jb) = sb.journal_buckets.iter().find(|jb| jb.dev == sb.dev_idx) {
            slots.push((device, jb.buckets.clone()));
        }
        if sb_newest.as_ref().map_or(true, |n| sb.seq > n.seq) {
            sb_newest = Some(sb);
        }
    }
    let sb = sb_newest.ok_or_else(|| anyhow::anyhow!("no superblock found"))?;
    let csum = bch_types::ChecksumType::from_u8(sb.opts.metadata_checksum_type)
        .map_err(bch_error::Error::from)?;
    let plan = bch_journal::scan_for_replay(cx, &slots, csum, None, &sb.blacklist)?;
    for entry in &plan.entries {
        println!(
            "seq {} last_seq {} flush {} updates {}",
            entry.seq.0,
            entry.last_seq.0,
            entry.flush,
            entry.updates.len()
        );
        for update in &entry.updates {
            println!("  {} level {}: {}", update.btree, update.level, update.key.pos);
        }
    }
    println!(
        "{} entries, {} blacklisted skipped",
        plan.entries.len(),
        plan.skipped_blacklisted
    );
    Ok(ExitCode::Ok)
}
