//! Report how much RAM is saved by sharing the pages of shared libraries among all running
//! processes. It needs `CAP_SYS_ADMIN` (i.e., run it as root).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use sharemap::{ExitedPolicy, ScanConfig, SystemInfo};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// be more verbose (repeatable)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// also count read-only data (`r--p`) mappings of shared libraries
    #[clap(short, long)]
    data: bool,

    /// only scan the process with this PID
    #[clap(short, long)]
    pid: Option<u64>,

    /// skip processes that exit while being scanned, instead of failing
    #[clap(long)]
    skip_exited: bool,

    /// where procfs is mounted
    #[clap(long, hide = true, default_value = ScanConfig::DEFAULT_PROC_ROOT)]
    proc_root: PathBuf,
}

impl Args {
    fn level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            proc_root: self.proc_root.clone(),
            include_read_only_data: self.data,
            pid: self.pid,
            exited: if self.skip_exited {
                ExitedPolicy::Skip
            } else {
                ExitedPolicy::Abort
            },
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    TermLogger::init(
        args.level(),
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context("failed to initialize the logger")?;

    sharemap::require_privileges()?;
    let sysinfo = SystemInfo::query()?;
    let savings = sharemap::scan(args.scan_config(), sysinfo)?;

    println!(
        "Saved: {} MB ({} bytes)",
        savings.saved_bytes() / 1024 / 1024,
        savings.saved_bytes()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let args = Args::parse_from(["ramsave", "-vv", "-d", "-p", "42", "--skip-exited"]);
        assert_eq!(args.level(), LevelFilter::Debug);
        let cfg = args.scan_config();
        assert!(cfg.include_read_only_data);
        assert_eq!(cfg.pid, Some(42));
        assert_eq!(cfg.exited, ExitedPolicy::Skip);
        assert_eq!(cfg.proc_root, PathBuf::from("/proc"));
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["ramsave"]);
        assert_eq!(args.level(), LevelFilter::Warn);
        assert_eq!(args.scan_config(), ScanConfig::default());
    }

    #[test]
    fn test_bad_pid() {
        assert!(Args::try_parse_from(["ramsave", "-p", "self"]).is_err());
    }
}
