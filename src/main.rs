use std::io::{self, Write};

use anyhow::Context;
use clap::{error::ErrorKind, ArgAction, Parser};
use log::info;

use procmap::{dump, DisplayMode, ProcFs, Retriever};

/// Display the virtual memory map of processes.
///
/// Without any pid, the memory map of the parent process is displayed.
#[derive(Parser, Debug)]
#[command(name = "procmap", version, args_override_self = true)]
struct Cli {
    /// Display every attribute of each mapping
    #[arg(short = 'a', overrides_with_all = ["solaris", "linux"])]
    all: bool,

    /// Display mappings like Solaris' pmap(1) (default)
    #[arg(short = 's', overrides_with_all = ["all", "linux"])]
    solaris: bool,

    /// Display mappings like /proc/<pid>/maps
    #[arg(short = 'l', overrides_with_all = ["all", "solaris"])]
    linux: bool,

    /// Display the process with the given pid
    #[arg(short = 'p', value_name = "pid", overrides_with = "own")]
    pid: Option<u32>,

    /// Display this very process
    #[arg(short = 'P', overrides_with = "pid")]
    own: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Further processes to display, in order
    #[arg(value_name = "pid")]
    pids: Vec<u32>,
}

impl Cli {
    fn display_mode(&self) -> DisplayMode {
        if self.all {
            DisplayMode::All
        } else if self.linux {
            DisplayMode::Linux
        } else {
            DisplayMode::Solaris
        }
    }

    /// The processes to display, in order: the one picked by `-p`/`-P` (or the parent, if no
    /// process was named at all), followed by the positional ones.
    fn targets(&self) -> Vec<u32> {
        let first = match (self.pid, self.own) {
            (Some(pid), _) => Some(pid),
            (None, true) => Some(std::process::id()),
            (None, false) if self.pids.is_empty() => Some(std::os::unix::process::parent_id()),
            (None, false) => None,
        };
        first.into_iter().chain(self.pids.iter().copied()).collect()
    }

    fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

fn parse_args() -> Cli {
    Cli::try_parse().unwrap_or_else(|e| match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
        _ => {
            e.print().ok();
            std::process::exit(1)
        }
    })
}

fn main() -> anyhow::Result<()> {
    let cli = parse_args();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level()))
        .init();

    let mode = cli.display_mode();
    let mut retriever =
        Retriever::new(ProcFs::new().context("procfs")?).context("page size")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for pid in cli.targets() {
        info!("displaying pid {} ({:?})", pid, mode);
        let snap = retriever
            .snapshot(pid)
            .with_context(|| format!("vmmap of pid {}", pid))?;
        dump(&mut out, &snap, mode).with_context(|| format!("display of pid {}", pid))?;
    }
    out.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("procmap").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_target_is_parent() {
        let cli = parse(&[]);
        assert_eq!(cli.targets(), vec![std::os::unix::process::parent_id()]);
        assert_eq!(cli.display_mode(), DisplayMode::Solaris);
    }

    #[test]
    fn test_targets_order() {
        assert_eq!(parse(&["-p", "10", "20", "30"]).targets(), vec![10, 20, 30]);
        // Positional pids alone do not pull in the parent.
        assert_eq!(parse(&["20", "30"]).targets(), vec![20, 30]);
        assert_eq!(
            parse(&["-P", "20"]).targets(),
            vec![std::process::id(), 20]
        );
        assert_eq!(parse(&["-p", "0"]).targets(), vec![0]);
        assert_eq!(parse(&["-p", "4294967295"]).targets(), vec![u32::MAX]);
    }

    #[test]
    fn test_last_flag_wins() {
        assert_eq!(parse(&["-a"]).display_mode(), DisplayMode::All);
        assert_eq!(parse(&["-a", "-s"]).display_mode(), DisplayMode::Solaris);
        assert_eq!(parse(&["-s", "-a"]).display_mode(), DisplayMode::All);
        assert_eq!(parse(&["-a", "-l"]).display_mode(), DisplayMode::Linux);
        assert_eq!(parse(&["-a", "-a"]).display_mode(), DisplayMode::All);

        assert_eq!(parse(&["-p", "10", "-P"]).targets(), vec![std::process::id()]);
        assert_eq!(parse(&["-P", "-p", "10"]).targets(), vec![10]);
    }

    #[test]
    fn test_invalid_usage() {
        for args in &[
            &["-x"][..],
            &["-p"][..],
            &["-p", "abc"][..],
            &["-p", "4294967296"][..],
            &["12a"][..],
        ] {
            let res = Cli::try_parse_from(std::iter::once("procmap").chain(args.iter().copied()));
            assert!(res.is_err(), "{:?} should be rejected", args);
        }
    }

    #[test]
    fn test_log_level() {
        assert_eq!(parse(&[]).log_level(), "warn");
        assert_eq!(parse(&["-vv"]).log_level(), "debug");
        assert_eq!(parse(&["-v", "-v", "-v", "-v"]).log_level(), "trace");
    }
}
