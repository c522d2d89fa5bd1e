//! Command-line front end for the dump/refine/split pipeline.
//!
//! Each subcommand shares one [`Args`] struct (the CLI flags, plus the
//! `discforge.toml` sidecar they fall back to) and operates on one
//! capture rooted at `image_path`. `dump`/`refine`/`rings` talk to a
//! physical drive; `protection`/`split`/`info`/`subchannel` work
//! offline against an existing capture; `cd` chains the whole
//! pipeline in one invocation.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use discforge::capture::{self, Store, SCRAM_SIZE};
use discforge::config::{self, Config};
use discforge::drive::{DriveProfile, Registry};
use discforge::dump::{self, DumpOptions, DumpStats};
use discforge::lba;
use discforge::offset;
use discforge::protection::{self, ProtectionFinding};
use discforge::ranges::{string_to_ranges, Range};
use discforge::scrambler;
use discforge::scsi::cdb::TocFormat;
use discforge::scsi::Transport;
use discforge::split::{self, SplitOptions};
use discforge::subchannel::{extract_channel, AdrControl, QData, SubChannelQ};
use discforge::toc::TocTrack;
use discforge::{cue, CdResult, Error, Lba, Msf, SessionFormat, Toc, Track, TrackFormat};

#[derive(Parser)]
#[command(name = "discforge", version, about = "Raw optical disc dumping, subchannel reconciliation and redump-style track splitting")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Pull raw sectors and subchannel data off a drive into a capture.
    Dump(Args),
    /// Reread the unreliable sectors of an existing capture.
    Refine(Args),
    /// Scan a capture for the PS2/Datel fake-TOC copy-protection pattern.
    Protection(Args),
    /// Slice a capture into redump-style track files and a cue sheet.
    Split(Args),
    /// Print TOC/track information for a capture.
    Info(Args),
    /// Dump a drive's internal cache ring to a side file.
    Rings(Args),
    /// Summarize a capture's Q-subchannel health.
    Subchannel(Args),
    /// Run offline diagnostics (subchannel summary, and cache ring if `--drive` is given).
    Debug(Args),
    /// Run the full dump, protection, refine, split, info pipeline in order.
    Cd(Args),
}

impl Mode {
    fn args(&self) -> &Args {
        match self {
            Mode::Dump(a)
            | Mode::Refine(a)
            | Mode::Protection(a)
            | Mode::Split(a)
            | Mode::Info(a)
            | Mode::Rings(a)
            | Mode::Subchannel(a)
            | Mode::Debug(a)
            | Mode::Cd(a) => a,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Mode::Dump(_) => "dump",
            Mode::Refine(_) => "refine",
            Mode::Protection(_) => "protection",
            Mode::Split(_) => "split",
            Mode::Info(_) => "info",
            Mode::Rings(_) => "rings",
            Mode::Subchannel(_) => "subchannel",
            Mode::Debug(_) => "debug",
            Mode::Cd(_) => "cd",
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct Args {
    /// Capture/output base path: sibling `.scram`/`.subcode`/`.state`/
    /// `.toc`/`.fulltoc` files, per-track binaries and the cue sheet
    /// are all named from this.
    #[arg(long)]
    image_path: PathBuf,

    /// Image/track base name. Defaults to the base path's file name.
    #[arg(long)]
    image_name: Option<String>,

    /// Path to a `discforge.toml` sidecar. Defaults to `<image_path>.toml`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// SCSI/MMC device node to read from (e.g. `/dev/sr0`).
    #[arg(long)]
    drive: Option<PathBuf>,

    /// Drive vendor string to use for profile lookup instead of issuing INQUIRY.
    #[arg(long)]
    drive_type: Option<String>,
    /// Override the profile's preferred read method (`be`, `d8`, `bebat`).
    #[arg(long)]
    drive_read_method: Option<String>,
    /// Override the profile's READ CD byte ordering (`data_c2_sub`, `data_sub_c2`).
    #[arg(long)]
    drive_sector_order: Option<String>,
    #[arg(long)]
    drive_c2_shift: Option<i32>,
    #[arg(long)]
    drive_pregap_start: Option<i32>,
    /// Override the profile's maximum sectors per READ CD transfer/cache-mining window.
    #[arg(long)]
    ring_size: Option<u32>,
    /// Fixed write offset in samples; skips the sync-pattern detector.
    #[arg(long)]
    drive_read_offset: Option<i32>,
    /// Don't attempt the Plextor lead-in pre-pass even if the profile supports it.
    #[arg(long)]
    skip_leadin: bool,

    /// Overwrite an existing capture instead of resuming it.
    #[arg(long)]
    overwrite: bool,
    #[arg(long)]
    speed: Option<u16>,
    #[arg(long)]
    retries: Option<u32>,
    /// Stop the walk at this LBA instead of the TOC's lead-out.
    #[arg(long)]
    stop_lba: Option<i32>,
    /// During refine, also reread sectors whose Q subchannel fails its CRC.
    #[arg(long)]
    refine_subchannel: bool,
    /// Reread the drive's TOC/FULL TOC even if a sidecar is already on disk.
    #[arg(long)]
    force_toc: bool,
    /// Fail instead of silently falling back to the drive TOC when the
    /// subcode-derived QTOC can't be built from the capture.
    #[arg(long)]
    force_qtoc: bool,
    /// Use INDEX 01 minus 150 sectors as the pregap start instead of a recorded INDEX 00.
    #[arg(long)]
    disable_toc_zero: bool,
    /// Accept BE-mode reads of a mixed data/audio disc despite the descrambling risk.
    #[arg(long)]
    unsupported: bool,

    /// Colon-separated `first-last` LBA ranges to treat as expected-bad.
    #[arg(long)]
    skip: Option<String>,
    /// Fill byte for synthesized sectors inside a skip range (decimal or `0x..` hex).
    #[arg(long, value_parser = parse_fill_byte)]
    skip_fill: Option<u8>,
    /// Clamp a protection finding's folded skip range to this many sectors.
    #[arg(long)]
    skip_size: Option<i32>,
    /// Emit tracks even with unfilled read errors remaining outside any skip range.
    #[arg(long)]
    force_split: bool,
    /// Trim the last track's length to its ISO9660 volume space size.
    #[arg(long)]
    iso9660_trim: bool,
    /// Probe the first track's pregap for a CDI-Ready data signature when no data track exists to detect the offset from directly.
    #[arg(long)]
    cdi_correct_offset: bool,
    /// Leave existing split output alone if a cue sheet is already present.
    #[arg(long)]
    leave_unchanged: bool,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(short, long, action = ArgAction::Count)]
    quiet: u8,
}

fn parse_fill_byte(s: &str) -> Result<u8, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        None => s.parse::<u8>().map_err(|e| e.to_string()),
    }
}

/// RFC 3339 UTC timestamp, used to stamp `P.log` and `P_info.txt`.
fn timestamp() -> String {
    time::OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339).unwrap_or_else(|_| "unknown-time".to_string())
}

/// Append a timestamped run marker to the capture's `.log` sidecar.
/// Best-effort: a write failure here shouldn't abort an otherwise
/// working dump/split/info run.
fn append_log_header(base: &Path, mode: &str) {
    use std::io::Write;
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(base.with_extension("log")) else {
        return;
    };
    let _ = writeln!(file, "=== {mode} started {} ===", timestamp());
}

fn init_logging(verbose: u8, quiet: u8) {
    let level = match verbose as i16 - quiet as i16 {
        i16::MIN..=-1 => log::LevelFilter::Error,
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).format_timestamp(None).init();
}

/// Bundles the resolved base path, image name, loaded sidecar config
/// and CLI/sidecar-merged skip ranges every stage needs.
struct Session {
    base: PathBuf,
    image_name: String,
    config: Config,
    skip_ranges: Vec<Range>,
    skip_fill: u8,
}

impl Session {
    fn new(args: &Args) -> CdResult<Session> {
        let base = args.image_path.clone();
        let image_name = args
            .image_name
            .clone()
            .unwrap_or_else(|| base.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "image".to_string()));

        let config_path = args.config.clone().unwrap_or_else(|| base.with_extension("toml"));
        let config = Config::load(&config_path)?;

        let mut skip_ranges = match &args.skip {
            Some(s) => string_to_ranges(s)?,
            None => config.defaults.skip_ranges()?,
        };
        skip_ranges.sort_by_key(|r| r.0);

        let skip_fill = args.skip_fill.or(config.defaults.skip_fill).unwrap_or(split::DEFAULT_SKIP_FILL);

        Ok(Session { base, image_name, config, skip_ranges, skip_fill })
    }
}

/// `<base><suffix>` — appended to the base path's file name, used for
/// the `_protection.txt`/`_split.txt`/`_info.txt` report side files.
fn sidecar(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn resolve_identity(args: &Args, transport: &Transport) -> CdResult<discforge::scsi::DriveIdentity> {
    match &args.drive_type {
        Some(vendor) => Ok(discforge::scsi::DriveIdentity { vendor: vendor.clone(), product: String::new(), revision: String::new() }),
        None => transport.inquiry(),
    }
}

fn build_profile(args: &Args, session: &Session, transport: &Transport) -> CdResult<DriveProfile> {
    let identity = resolve_identity(args, transport)?;
    let mut profile = Registry::lookup(&identity);
    session.config.drive.apply(&mut profile)?;

    if let Some(m) = &args.drive_read_method {
        profile.read_method = config::parse_read_method(m)?;
    }
    if let Some(order) = &args.drive_sector_order {
        profile.sector_order = config::parse_sector_order(order)?;
    }
    if let Some(v) = args.drive_c2_shift {
        profile.c2_shift = v;
    }
    if let Some(v) = args.drive_pregap_start {
        profile.pregap_start = v;
    }
    if let Some(v) = args.ring_size {
        profile.max_read_sectors = v;
    }
    if args.skip_leadin {
        profile.can_read_lead_in = false;
    }

    Ok(profile)
}

fn open_transport(args: &Args, purpose: &str) -> CdResult<Transport> {
    let path = args.drive.as_deref().ok_or_else(|| Error::Protocol(format!("{purpose} requires --drive <device>")))?;
    let transport = Transport::open(path)?;
    transport.wait_ready(Duration::from_secs(30))?;
    Ok(transport)
}

/// READ TOC/FULL TOC from the drive, preferring FULL TOC (it carries
/// session typing) unless `force_toc` asks for the plain format or the
/// drive doesn't support FULL TOC at all. Returns the parsed TOC, the
/// raw response (to persist as a sidecar), and whether it was a FULL TOC.
fn read_drive_toc(transport: &Transport, force_toc: bool) -> CdResult<(Toc, Vec<u8>, bool)> {
    if force_toc {
        let raw = transport.read_toc_raw(TocFormat::Toc, false)?;
        return Ok((Toc::parse_toc(&raw)?, raw, false));
    }

    match transport.read_toc_raw(TocFormat::FullToc, false) {
        Ok(raw) => Ok((Toc::parse_full_toc(&raw)?, raw, true)),
        Err(_) => {
            let raw = transport.read_toc_raw(TocFormat::Toc, false)?;
            Ok((Toc::parse_toc(&raw)?, raw, false))
        }
    }
}

fn persist_drive_toc(base: &Path, raw: &[u8], full: bool) -> CdResult<()> {
    let path = base.with_extension(if full { "fulltoc" } else { "toc" });
    fs::write(path, raw).map_err(Error::Io)
}

/// Best-effort READ TOC format 0x05 (CD-TEXT): many drives and most
/// discs don't carry it, so a failure here is silently ignored rather
/// than treated as fatal.
fn persist_cdtext(transport: &Transport, base: &Path) -> CdResult<()> {
    if let Ok(raw) = transport.read_toc_raw(TocFormat::CdText, false) {
        fs::write(base.with_extension("cdtext"), raw).map_err(Error::Io)?;
    }
    Ok(())
}

/// Refine must be rereading the same disc it dumped: if a TOC of the
/// same format was already persisted and disagrees byte-for-byte with
/// what the drive just reported, abort rather than silently mixing
/// sector data captured from two different discs into one store.
fn verify_same_disc(base: &Path, raw: &[u8], full: bool) -> CdResult<()> {
    let path = base.with_extension(if full { "fulltoc" } else { "toc" });
    if let Ok(existing) = fs::read(&path) {
        if existing != raw {
            return Err(Error::DifferentDisc);
        }
    }
    Ok(())
}

fn load_persisted_toc(base: &Path) -> CdResult<Toc> {
    let full_path = base.with_extension("fulltoc");
    if let Ok(raw) = fs::read(&full_path) {
        return Toc::parse_full_toc(&raw);
    }
    let toc_path = base.with_extension("toc");
    let raw = fs::read(&toc_path).map_err(Error::Io)?;
    Toc::parse_toc(&raw)
}

/// Walk every captured sector of the program area and decode its Q
/// subchannel, gap-filling corrupted blocks, to build ground-truth
/// track/index boundaries.
fn build_observed_toc(store: &mut Store, program_start: Lba, lead_out: Lba) -> CdResult<Toc> {
    let mut raw_entries = Vec::new();
    let mut lba_cursor = program_start;
    while lba_cursor < lead_out {
        if let Ok((_, subcode, states)) = store.read_entry(lba_cursor) {
            if capture::any_read(&states) {
                raw_entries.push((lba_cursor, subcode));
            }
        }
        lba_cursor = lba_cursor + 1;
    }

    let repaired = split::fill_subchannel_gaps(&raw_entries);
    let qs: Vec<SubChannelQ> = repaired.into_iter().map(|(_, q)| q).collect();
    Toc::from_subq(&qs, lead_out)
}

/// Reconcile a drive-reported TOC with the capture's own subcode QTOC.
/// `force_qtoc` turns a failure to build the QTOC at all (too short
/// a capture, corrupted subchannel throughout) into a hard error
/// instead of a silent fallback to the drive's report.
fn reconcile_toc(store: &mut Store, drive_toc: Toc, force_qtoc: bool, force_toc: bool) -> CdResult<Toc> {
    let program_start = drive_toc.tracks.iter().map(|t| t.start_lba()).min().unwrap_or(Lba::new(0));

    match build_observed_toc(store, program_start, drive_toc.lead_out) {
        Ok(observed) => Ok(drive_toc.reconcile(&observed, force_toc)),
        Err(e) if force_qtoc => Err(e),
        Err(_) => Ok(drive_toc),
    }
}

fn load_toc_for_offline(store: &mut Store, base: &Path, force_qtoc: bool, force_toc: bool) -> CdResult<Toc> {
    let persisted = load_persisted_toc(base)?;
    reconcile_toc(store, persisted, force_qtoc, force_toc)
}

fn effective_pregap_start(track: &TocTrack, disable_toc_zero: bool) -> Lba {
    if disable_toc_zero {
        track.start_lba() - 150
    } else {
        track.pregap_lba().unwrap_or(track.start_lba() - 150)
    }
}

fn detect_write_offset(store: &mut Store, toc: &Toc, args: &Args) -> CdResult<i32> {
    if let Some(v) = args.drive_read_offset {
        return Ok(v);
    }

    if let Some(data_track) = toc.tracks.iter().find(|t| t.is_data()) {
        return offset::detect(store, data_track.start_lba());
    }

    if args.cdi_correct_offset {
        if let Some(first) = toc.tracks.first() {
            let pregap_start = effective_pregap_start(first, args.disable_toc_zero);
            let pregap_len = first.start_lba().checked_sub_lba(pregap_start).unwrap_or(0);
            if let Some(offset) = offset::detect_cdi_ready(store, pregap_start, pregap_len)? {
                return Ok(offset);
            }
        }
    }

    Ok(0)
}

/// Descramble the track's first sector to recover its CD-ROM mode
/// byte (header offset 15): `1` is Mode 1, anything else under a data
/// track's control bit is Mode 2, disambiguated into XA vs CD-i via
/// the TOC's own session typing.
fn detect_track_format(store: &mut Store, toc: &Toc, toc_track: &TocTrack, write_offset: i32) -> CdResult<TrackFormat> {
    if !toc_track.is_data() {
        return Ok(TrackFormat::Audio);
    }

    let byte_shift = write_offset as i64 * 4;
    let mut sector = [0u8; SCRAM_SIZE];
    store.read_scram_at(toc_track.start_lba(), byte_shift, &mut sector)?;
    if !scrambler::descramble_sector(&mut sector, None) {
        return Err(Error::BadFormat(format!("track {} does not start with a recognizable sector sync", toc_track.track.binary())));
    }

    match sector[15] {
        1 => Ok(TrackFormat::Mode1),
        _ if toc_track.is_cdi || toc.disc_type == SessionFormat::Cdi => Ok(TrackFormat::Mode2CdI),
        _ => Ok(TrackFormat::Mode2Xa),
    }
}

/// Trim a data track's length down to its ISO9660 volume space size
/// (the logical-block count recorded at PVD offset 80), read off the
/// track's own Primary Volume Descriptor at its sector 16.
fn iso9660_trimmed_length(store: &mut Store, track_start: Lba, write_offset: i32) -> CdResult<Option<Msf>> {
    let byte_shift = write_offset as i64 * 4;
    let mut sector = [0u8; SCRAM_SIZE];
    store.read_scram_at(track_start + 16, byte_shift, &mut sector)?;
    if !scrambler::descramble_sector(&mut sector, None) {
        return Ok(None);
    }

    let user = &sector[16..2064];
    if user[0] != 1 {
        return Ok(None);
    }

    let volume_space_size = u32::from_le_bytes([user[80], user[81], user[82], user[83]]);
    Ok(Msf::from_sector_index(volume_space_size))
}

fn build_tracks(store: &mut Store, toc: &Toc, write_offset: i32, iso9660_trim: bool) -> CdResult<Vec<Track>> {
    let mut ordered: Vec<&TocTrack> = toc.tracks.iter().collect();
    ordered.sort_by_key(|t| t.track.bcd());

    let mut tracks = Vec::with_capacity(ordered.len());
    for (i, toc_track) in ordered.iter().enumerate() {
        let start_lba = toc_track.start_lba();
        let next_lba = ordered.get(i + 1).map(|t| t.start_lba()).unwrap_or(toc.lead_out);
        let length_sectors = next_lba.checked_sub_lba(start_lba).ok_or(Error::InvalidMsf)?.max(0) as u32;

        let format = detect_track_format(store, toc, toc_track, write_offset)?;
        let start = lba::lba_to_bcdmsf(start_lba).ok_or(Error::InvalidMsf)?;
        let mut length = Msf::from_sector_index(length_sectors).ok_or(Error::InvalidMsf)?;

        if iso9660_trim && i + 1 == ordered.len() && format.is_cdrom() {
            if let Some(trimmed) = iso9660_trimmed_length(store, start_lba, write_offset)? {
                length = trimmed;
            }
        }

        tracks.push(Track {
            track: toc_track.track,
            format,
            start,
            length,
            control: AdrControl::from_bits_truncate(toc_track.control << 4),
        });
    }

    Ok(tracks)
}

/// A terminal progress bar sized to the span a dump/refine walk is
/// about to cover, or a no-op bar (indicatif hides itself) when stderr
/// isn't a terminal — either way `log::info!` still carries the final
/// summary line.
fn progress_bar(toc: &Toc) -> (ProgressBar, i32) {
    let start = toc.tracks.iter().map(|t| t.start_lba().as_i32()).min().unwrap_or(0) - 150;
    let total = (toc.lead_out.as_i32() - start).max(1) as u64;

    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template("[{percent}%] {msg} ({pos}/{len})") {
        pb.set_style(style);
    }
    (pb, start)
}

fn report_progress(pb: &ProgressBar, start: i32, lba: Lba, stats: &DumpStats) {
    pb.set_position((lba.as_i32() - start).max(0) as u64);
    pb.set_message(format!("LBA {lba}, errors: {{ SCSI/C2: {}, Q: {} }}", stats.scsi_errors + stats.c2_errors, stats.q_errors));
}

fn finalize_skip_range(finding: &ProtectionFinding, skip_size: Option<i32>) -> Range {
    match skip_size {
        Some(size) if size > 0 => (finding.range.0, finding.range.0 + size),
        _ => finding.range,
    }
}

fn stage_dump(args: &Args, session: &Session) -> CdResult<()> {
    let transport = open_transport(args, "dump")?;
    let profile = build_profile(args, session, &transport)?;

    let (drive_toc, raw, full) = read_drive_toc(&transport, args.force_toc)?;
    persist_drive_toc(&session.base, &raw, full)?;
    persist_cdtext(&transport, &session.base)?;

    let mut store = if args.overwrite {
        Store::create(&session.base)?
    } else {
        Store::open(&session.base).or_else(|_| Store::create(&session.base))?
    };

    let opts = DumpOptions {
        speed_kb_s: args.speed.or(session.config.defaults.speed),
        retries: args.retries.or(session.config.defaults.retries).unwrap_or(1),
        refine: false,
        refine_subchannel: args.refine_subchannel || session.config.defaults.refine_subchannel.unwrap_or(false),
        stop_lba: args.stop_lba.map(Lba::new),
        force_toc: args.force_toc,
        unsupported: args.unsupported || session.config.defaults.unsupported.unwrap_or(false),
        skip_ranges: session.skip_ranges.clone(),
    };

    let (pb, pb_start) = progress_bar(&drive_toc);
    let stats = dump::run(&transport, &mut store, &drive_toc, &profile, &opts, |lba, s| report_progress(&pb, pb_start, lba, s))?;
    pb.finish_and_clear();
    log::info!(
        "dump complete: {} sectors read, {} SCSI errors, {} C2 errors, {} Q errors",
        stats.sectors_read,
        stats.scsi_errors,
        stats.c2_errors,
        stats.q_errors
    );

    Ok(())
}

fn stage_refine(args: &Args, session: &Session) -> CdResult<()> {
    let transport = open_transport(args, "refine")?;
    let profile = build_profile(args, session, &transport)?;

    let mut store = Store::open(&session.base)?;

    let (drive_toc, raw, full) = read_drive_toc(&transport, args.force_toc)?;
    verify_same_disc(&session.base, &raw, full)?;
    persist_drive_toc(&session.base, &raw, full)?;
    persist_cdtext(&transport, &session.base)?;

    let toc = reconcile_toc(&mut store, drive_toc, args.force_qtoc, args.force_toc)?;

    let opts = DumpOptions {
        speed_kb_s: args.speed.or(session.config.defaults.speed),
        retries: args.retries.or(session.config.defaults.retries).unwrap_or(1),
        refine: true,
        refine_subchannel: args.refine_subchannel || session.config.defaults.refine_subchannel.unwrap_or(false),
        stop_lba: args.stop_lba.map(Lba::new),
        force_toc: args.force_toc,
        unsupported: args.unsupported || session.config.defaults.unsupported.unwrap_or(false),
        skip_ranges: session.skip_ranges.clone(),
    };

    let (pb, pb_start) = progress_bar(&toc);
    let stats = dump::run(&transport, &mut store, &toc, &profile, &opts, |lba, s| report_progress(&pb, pb_start, lba, s))?;
    pb.finish_and_clear();
    log::info!(
        "refine complete: {} sectors re-read, {} SCSI errors, {} C2 errors, {} Q errors",
        stats.sectors_read,
        stats.scsi_errors,
        stats.c2_errors,
        stats.q_errors
    );

    Ok(())
}

fn stage_protection(args: &Args, session: &Session) -> CdResult<Option<ProtectionFinding>> {
    let mut store = Store::open(&session.base)?;
    let toc = load_toc_for_offline(&mut store, &session.base, args.force_qtoc, args.force_toc)?;
    let write_offset = detect_write_offset(&mut store, &toc, args)?;

    let finding = protection::scan(&mut store, &toc, write_offset)?;
    let report = match &finding {
        Some(f) => {
            log::info!("{}", f.describe());
            format!("{}\n", f.describe())
        }
        None => {
            log::info!("no known copy-protection pattern found");
            "no known copy-protection pattern found\n".to_string()
        }
    };
    fs::write(sidecar(&session.base, "_protection.txt"), report).map_err(Error::Io)?;

    Ok(finding)
}

fn stage_split(args: &Args, session: &Session) -> CdResult<()> {
    let out_dir = session.base.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

    if args.leave_unchanged && out_dir.join(format!("{}.cue", session.image_name)).exists() {
        log::info!("cue sheet already exists; leaving split output unchanged");
        return Ok(());
    }

    let mut store = Store::open(&session.base)?;
    let toc = load_toc_for_offline(&mut store, &session.base, args.force_qtoc, args.force_toc)?;
    let write_offset = detect_write_offset(&mut store, &toc, args)?;

    let split_opts =
        SplitOptions { skip_ranges: session.skip_ranges.clone(), skip_fill: session.skip_fill, force_split: args.force_split || session.config.defaults.force_split.unwrap_or(false) };

    let tracks = build_tracks(&mut store, &toc, write_offset, args.iso9660_trim)?;
    let width = tracks.len().to_string().len().max(2);

    for (i, track) in tracks.iter().enumerate() {
        let filename = cue::track_filename(&session.image_name, i + 1, tracks.len(), width);
        let out_path = out_dir.join(&filename);
        let stats = split::split_track(&mut store, track, write_offset, &split_opts, &out_path)?;
        log::info!(
            "track {:02}: {} sectors, {} filled, {} EDC errors, {} ECC errors, crc32={:08x}",
            i + 1,
            stats.sectors,
            stats.filled_sectors,
            stats.edc_errors,
            stats.ecc_errors,
            stats.crc32
        );
    }

    cue::write_cue(&toc, &tracks, &session.image_name, &out_dir)?;
    fs::write(sidecar(&session.base, "_split.txt"), format!("{} tracks split to {}\n", tracks.len(), out_dir.display())).map_err(Error::Io)?;

    Ok(())
}

fn stage_info(args: &Args, session: &Session) -> CdResult<()> {
    let mut store = Store::open(&session.base)?;
    let toc = load_toc_for_offline(&mut store, &session.base, args.force_qtoc, args.force_toc)?;

    let mut out = String::new();
    out.push_str(&format!("# {}\n", timestamp()));
    out.push_str(&format!("Disc type: {:?}\n", toc.disc_type));
    if let Some(mcn) = &toc.mcn {
        out.push_str(&format!("MCN: {mcn}\n"));
    }
    out.push_str(&format!("Tracks: {}\n", toc.tracks.len()));
    for t in &toc.tracks {
        out.push_str(&format!(
            "  Track {:02} (session {}): {} start LBA {}\n",
            t.track.binary(),
            t.session,
            if t.is_data() { "data" } else { "audio" },
            t.start_lba()
        ));
    }
    out.push_str(&format!("Lead-out: {}\n", toc.lead_out));

    print!("{out}");
    fs::write(sidecar(&session.base, "_info.txt"), out).map_err(Error::Io)?;

    Ok(())
}

fn stage_rings(args: &Args, session: &Session) -> CdResult<()> {
    let transport = open_transport(args, "rings")?;
    let profile = build_profile(args, session, &transport)?;

    let entries = args.ring_size.unwrap_or(profile.max_read_sectors);
    let raw = transport.asus_cache_read(0, entries)?;

    let path = sidecar(&session.base, ".asus");
    fs::write(&path, &raw).map_err(Error::Io)?;
    log::info!("wrote {} bytes of cache ring to {}", raw.len(), path.display());

    Ok(())
}

fn stage_subchannel(_args: &Args, session: &Session) -> CdResult<()> {
    let mut store = Store::open(&session.base)?;
    let sectors = store.sector_count()?;

    let mut valid = 0u64;
    let mut invalid = 0u64;
    let mut mcn_seen = None;

    for i in 0..sectors {
        let lba = Lba::new(Lba::CAPTURE_ORIGIN.as_i32() + i as i32);
        let (_, subcode, states) = match store.read_entry(lba) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if !capture::any_read(&states) {
            continue;
        }

        let q = SubChannelQ::new(extract_channel(&subcode, 1));
        if !q.is_valid() {
            invalid += 1;
            continue;
        }
        valid += 1;

        if let QData::Mcn(digits, _) = q.parse_data() {
            mcn_seen.get_or_insert(digits);
        }
    }

    log::info!("subchannel Q: {valid} valid, {invalid} invalid blocks out of {sectors} sectors");
    if let Some(mcn) = mcn_seen {
        log::info!("MCN observed: {mcn}");
    }

    Ok(())
}

fn stage_debug(args: &Args, session: &Session) -> CdResult<()> {
    stage_subchannel(args, session)?;
    if args.drive.is_some() {
        stage_rings(args, session)?;
    }
    Ok(())
}

fn stage_cd(args: &Args, session: &mut Session) -> CdResult<()> {
    stage_dump(args, session)?;

    if let Some(finding) = stage_protection(args, session)? {
        session.skip_ranges.push(finalize_skip_range(&finding, args.skip_size));
        session.skip_ranges.sort_by_key(|r| r.0);
    }

    stage_refine(args, session)?;
    stage_split(args, session)?;
    stage_info(args, session)?;

    Ok(())
}

fn run(mode: &Mode) -> CdResult<()> {
    let args = mode.args();
    let mut session = Session::new(args)?;
    append_log_header(&session.base, mode.name());

    match mode {
        Mode::Cd(_) => stage_cd(args, &mut session),
        Mode::Dump(_) => stage_dump(args, &session),
        Mode::Refine(_) => stage_refine(args, &session),
        Mode::Protection(_) => stage_protection(args, &session).map(|_| ()),
        Mode::Split(_) => stage_split(args, &session),
        Mode::Info(_) => stage_info(args, &session),
        Mode::Rings(_) => stage_rings(args, &session),
        Mode::Subchannel(_) => stage_subchannel(args, &session),
        Mode::Debug(_) => stage_debug(args, &session),
    }
}

/// Soft, user-actionable failures exit 1 (force a flag and rerun);
/// everything else (I/O, protocol, corruption) exits 2.
fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::UnfilledErrors | Error::UnsupportedBeMixedMode | Error::DifferentDisc => 1,
        _ => 2,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = cli.mode.args();
    init_logging(args.verbose, args.quiet);

    match run(&cli.mode) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}
