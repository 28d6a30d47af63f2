//! ntfsck - Offline NTFS consistency checker and repair tool.

mod progress;

use anyhow::Context;
use clap::Parser;
use humansize::{format_size, BINARY};
use ntfsck_core::{
    exit_code, CheckOptions, CheckSession, FileDevice, FsckError, NoProgress, ProblemEngine,
    Progress, RepairMode, Volume, VolumeDevice,
};
use progress::BarProgress;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "ntfsck")]
#[command(version, about = "Check and repair an NTFS volume", long_about = None)]
struct Args {
    /// Automatic repair, no questions
    #[arg(short = 'a', long = "repair-auto")]
    auto: bool,

    /// Same as -a
    #[arg(short = 'p')]
    preen: bool,

    /// Only check whether the volume is marked dirty
    #[arg(short = 'C')]
    check_dirty: bool,

    /// Check only, fix nothing, open the device read-only
    #[arg(short = 'n', long = "repair-no")]
    no: bool,

    /// Repair interactively
    #[arg(short = 'r', long = "repair")]
    interactive: bool,

    /// Answer yes to every repair question
    #[arg(short = 'y', long = "repair-yes")]
    yes: bool,

    /// No progress bar
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Block device or volume image to check
    device: String,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let selected = [
        args.auto || args.preen,
        args.check_dirty,
        args.no,
        args.interactive,
        args.yes,
    ]
    .iter()
    .filter(|&&b| b)
    .count();
    if selected > 1 {
        eprintln!("ntfsck: Only one of the options -a/-p, -C, -n, -r or -y may be specified.");
        return exit_code::USAGE_ERROR;
    }

    let mode = if args.auto || args.preen {
        RepairMode::Auto
    } else if args.no || args.check_dirty {
        RepairMode::No
    } else if args.yes {
        RepairMode::Yes
    } else {
        // -r and the no-option default both prompt.
        RepairMode::Ask
    };

    init_tracing(args.verbose);
    tracing::debug!(?mode, device = %args.device, "starting check");

    if let Err(code) = refuse_if_mounted(&args.device, mode) {
        return code;
    }

    let read_only = !mode.allows_write();
    let dev = match FileDevice::open(&args.device, read_only)
        .with_context(|| format!("Failed to open device: {}", args.device))
    {
        Ok(d) => d,
        Err(e) => {
            eprintln!("ntfsck: {e:#}");
            return exit_code::OPERATIONAL_ERROR;
        }
    };
    let device_size = dev.len();

    let mut problems = ProblemEngine::new(mode);
    let vol = match Volume::mount(Box::new(dev), &mut problems) {
        Ok(v) => v,
        Err(e) => {
            if args.check_dirty {
                println!("Check volume: Volume mount failed, Consider volume is dirty.");
                return exit_code::ERRORS_LEFT_UNCORRECTED;
            }
            return match e {
                FsckError::InvalidBootSector(_) => {
                    eprintln!("ntfsck: The superblock does not describe a valid NTFS.");
                    exit_code::OPERATIONAL_ERROR
                }
                other => {
                    eprintln!("ntfsck: mount failed: {other}");
                    exit_code::OPERATIONAL_ERROR
                }
            };
        }
    };

    if args.check_dirty {
        return if vol.is_dirty() {
            println!("Check volume: Volume is dirty.");
            exit_code::ERRORS_LEFT_UNCORRECTED
        } else {
            println!("Check volume: Volume is clean.");
            exit_code::NO_ERRORS
        };
    }

    if !args.quiet {
        println!(
            "Checking {} ({})",
            args.device,
            format_size(device_size, BINARY)
        );
    }

    let mut session = CheckSession::new(vol, problems, CheckOptions::default());
    let mut bar = BarProgress::new();
    let mut none = NoProgress;
    let progress: &mut dyn Progress = if args.quiet { &mut none } else { &mut bar };

    let report = match session.run(progress) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("ntfsck: {e}");
            return exit_code::OPERATIONAL_ERROR;
        }
    };

    if report.errors_left() > 0 {
        println!(
            "{} errors left (errors:{}, fixed:{})",
            report.errors_left(),
            report.errors,
            report.fixes
        );
    } else {
        println!(
            "Clean, No errors found or left (errors:{}, fixed:{})",
            report.errors, report.fixes
        );
    }

    report.exit_code()
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "ntfsck=debug,ntfsck_core=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// A read-write mount always blocks the tool; a read-only mount is
/// accepted only for a read-only check.
fn refuse_if_mounted(device: &str, mode: RepairMode) -> Result<(), i32> {
    let Some(options) = mount_options(device) else {
        return Ok(());
    };
    let read_only_mount = options.split(',').any(|o| o == "ro");
    if !read_only_mount {
        eprintln!("ntfsck: Refusing to operate on read-write mounted device {device}.");
        return Err(exit_code::OPERATIONAL_ERROR);
    }
    if mode.allows_write() {
        eprintln!("ntfsck: Refusing to change filesystem on read mounted device {device}.");
        return Err(exit_code::OPERATIONAL_ERROR);
    }
    Ok(())
}

/// Mount options for `device` from /proc/self/mounts, if it is mounted.
fn mount_options(device: &str) -> Option<String> {
    let mounts = std::fs::read_to_string("/proc/self/mounts").ok()?;
    let want = Path::new(device);
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let _target = fields.next()?;
        let _fstype = fields.next()?;
        let options = fields.next()?;
        if Path::new(source) == want {
            return Some(options.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_modes() {
        let a = Args::parse_from(["ntfsck", "-y", "/dev/sdb1"]);
        assert!(a.yes);
        assert_eq!(a.device, "/dev/sdb1");

        let a = Args::parse_from(["ntfsck", "--repair-no", "img.bin"]);
        assert!(a.no);

        let a = Args::parse_from(["ntfsck", "-C", "img.bin"]);
        assert!(a.check_dirty);
    }

    #[test]
    fn test_mount_options_parsing_misses_unknown_device() {
        assert!(mount_options("/dev/does-not-exist-zzz").is_none());
    }
}
