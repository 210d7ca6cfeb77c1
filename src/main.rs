use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use fat32d::bridge::{serve, StreamTransport};
use fat32d::dev::FileDisk;
use fat32d::fs::FatFs;
use fat32d::logger;

const USAGE: &str = "\
usage: fat32d [options] <device> <mountpoint>

options:
  -h, --help      print this help and exit
  -v, --version   print the version and exit
  -d, --debug     verbose logging
  -l, --log FILE  append log output to FILE

unrecognised options are forwarded to the bridge framework.";

struct Args {
    device: PathBuf,
    mountpoint: PathBuf,
    debug: bool,
    log_file: Option<PathBuf>,
    forwarded: Vec<String>,
}

fn parse_args() -> Result<Option<Args>, String> {
    let mut positional = Vec::new();
    let mut debug = false;
    let mut log_file = None;
    let mut forwarded = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-h" || arg == "--help" {
            println!("{USAGE}");
            return Ok(None);
        } else if arg == "-v" || arg == "--version" {
            println!("fat32d {}", env!("CARGO_PKG_VERSION"));
            return Ok(None);
        } else if arg == "-d" || arg == "--debug" {
            debug = true;
        } else if arg == "-l" || arg == "--log" {
            let path = args
                .next()
                .ok_or_else(|| format!("{arg} requires a file argument"))?;
            log_file = Some(PathBuf::from(path));
        } else if arg.starts_with('-') {
            forwarded.push(arg);
        } else {
            positional.push(arg);
        }
    }

    let mut positional = positional.into_iter();
    let device = positional
        .next()
        .ok_or_else(|| "missing device argument".to_string())?;
    let mountpoint = positional
        .next()
        .ok_or_else(|| "missing mountpoint argument".to_string())?;
    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument '{extra}'"));
    }

    Ok(Some(Args {
        device: PathBuf::from(device),
        mountpoint: PathBuf::from(mountpoint),
        debug,
        log_file,
        forwarded,
    }))
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fat32d: {e}");
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    if logger::init(args.debug, args.log_file.as_deref()).is_err() {
        eprintln!("fat32d: logger already installed");
    }

    let disk = match FileDisk::open(&args.device) {
        Ok(disk) => disk,
        Err(e) => {
            log::error!("cannot open {}: {e}", args.device.display());
            return ExitCode::FAILURE;
        }
    };

    let mut fs = match FatFs::mount(disk) {
        Ok(fs) => fs,
        Err(e) => {
            // a magic mismatch or unreadable device refuses the mount.
            log::error!("mount of {} failed: {e}", args.device.display());
            return ExitCode::FAILURE;
        }
    };

    log::info!(
        "serving {} at {}{}",
        args.device.display(),
        args.mountpoint.display(),
        if args.forwarded.is_empty() {
            String::new()
        } else {
            format!(" (forwarded: {})", args.forwarded.join(" "))
        }
    );

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut transport = StreamTransport::new(stdin.lock(), stdout.lock());
    if let Err(e) = serve(&mut fs, &mut transport) {
        log::error!("bridge transport failed: {e}");
        return ExitCode::FAILURE;
    }

    match fs.unmount() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("unmount failed: {e}");
            ExitCode::FAILURE
        }
    }
}
