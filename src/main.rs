//! Backend entry point. Per §6 of the design, this binary takes a single
//! positional argument: the absolute name of the control pipe. When that
//! argument is absent the binary is meant to run as the frontend, which is
//! out of scope for this crate — we report that plainly and exit non-zero
//! rather than silently doing nothing.
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use natspy::CommandRouter;

#[derive(Parser, Debug)]
#[command(
    name = "natspy",
    about = "Sampling CPU profiler backend for native executables",
    version
)]
struct Cli {
    /// Absolute path of the control pipe to connect to as the profiling
    /// backend. Omit to invoke frontend mode, which this build does not
    /// implement.
    pipe: Option<String>,

    /// Raise the log level by one step per occurrence (warn -> info ->
    /// debug -> trace). Ignored when `RUST_LOG` is set.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Additionally write log output to this file, alongside stderr.
    #[arg(long = "log-file")]
    log_file: Option<String>,
}

/// Writes every line to stderr and, if given, to an open log file. Neither
/// sink's failure is allowed to take down the other.
struct TeeWriter {
    file: Option<std::fs::File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stderr().write_all(buf);
        if let Some(file) = self.file.as_mut() {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stderr().flush();
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        Ok(())
    }
}

/// `env_logger::try_init` semantics, not `init`: a second call (as a test
/// harness invoking `main`'s setup twice might do) returns an error instead
/// of panicking.
fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::new();
    match std::env::var("RUST_LOG") {
        Ok(spec) => {
            builder.parse_filters(&spec);
        }
        Err(_) => {
            builder.filter_level(level);
        }
    }

    if let Some(path) = cli.log_file.as_deref() {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file: Some(file) })));
    }

    let _ = builder.try_init();
    Ok(())
}

#[cfg(windows)]
fn connect_pipe(path: &str) -> std::io::Result<std::fs::File> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::os::windows::io::FromRawHandle;
    use std::ptr;

    use winapi::um::fileapi::{CreateFileW, OPEN_EXISTING};
    use winapi::um::handleapi::INVALID_HANDLE_VALUE;
    use winapi::um::winnt::{FILE_SHARE_READ, FILE_SHARE_WRITE, GENERIC_READ, GENERIC_WRITE};

    let wide: Vec<u16> = OsStr::new(path).encode_wide().chain(std::iter::once(0)).collect();
    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            ptr::null_mut(),
            OPEN_EXISTING,
            0,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { std::fs::File::from_raw_handle(handle as std::os::windows::io::RawHandle) })
}

/// Connect to the named pipe and run the command router until `STOP` or a
/// clean disconnect. The sampler thread it spawns is the only thing in the
/// process that ever touches the debug-event primitive, the stack walker,
/// or the platform symbol API (§5).
#[cfg(windows)]
fn run_backend(path: &str) -> anyhow::Result<()> {
    let file = connect_pipe(path).with_context(|| format!("connect control pipe {path}"))?;
    let writer = file
        .try_clone()
        .context("duplicate control pipe handle")?;
    let mut reader = file;
    let router = CommandRouter::new(Arc::new(Mutex::new(writer)));
    router.run(move |buf| reader.read(buf));
    Ok(())
}

#[cfg(not(windows))]
fn run_backend(path: &str) -> anyhow::Result<()> {
    anyhow::bail!(
        "control pipe {path} requires debugging a native Windows target; this build was \
         compiled for a non-Windows host"
    )
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }

    let result = match cli.pipe.as_deref() {
        Some(path) => run_backend(path),
        None => Err(anyhow::anyhow!(
            "no control pipe given; frontend mode is out of scope for this build"
        )),
    };

    if let Err(e) = result {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_pipe_argument_parses_to_none() {
        let cli = Cli::parse_from(["natspy"]);
        assert!(cli.pipe.is_none());
    }

    #[cfg(not(windows))]
    #[test]
    fn run_backend_without_windows_reports_unsupported_and_does_not_panic() {
        let err = run_backend("\\\\.\\pipe\\does-not-matter").unwrap_err();
        assert!(err.to_string().contains("non-Windows host"));
    }

    #[test]
    fn init_logging_can_run_more_than_once_without_panicking() {
        let cli = Cli::parse_from(["natspy"]);
        assert!(init_logging(&cli).is_ok());
        assert!(init_logging(&cli).is_ok());
    }
}
