use std::fs::OpenOptions;
use std::sync::Once;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt as tracingfmt, EnvFilter};

/// If `cond` is false, logs a warning with your message instead of panicking.
/// For invariants that should hold but whose violation the scheduler can
/// survive (a misbehaving phone must never take the service loop down).
#[macro_export]
macro_rules! assert_warn {
    ($cond:expr, $($arg:tt)+) => {{
        if !$cond {
            tracing::warn!(
                target: module_path!(),
                "assertion warning: `{}` failed: {} at {}:{}",
                stringify!($cond),
                format_args!($($arg)+),
                file!(),
                line!(),
            );
        }
    }};
}

static INIT_LOG: Once = Once::new();

/// Sets up logging with maximum verbosity (trace level).
/// Mainly for unit tests.
pub fn setup_logging_verbose() {
    setup_logging(EnvFilter::new("trace"), None);
}

/// Sets up default logging to stdout and optionally a verbose log file.
/// Returns a guard that needs to be kept alive for logging to file to work.
pub fn setup_logging_default(verbose_logfile: Option<String>) -> Option<WorkerGuard> {
    let logfile_and_filter = verbose_logfile.map(|file| (file, EnvFilter::new("debug")));
    setup_logging(get_default_stdout_filter(), logfile_and_filter)
}

pub fn get_default_stdout_filter() -> EnvFilter {
    EnvFilter::new("info")
        // The tick loop and per-block traffic are too chatty for stdout
        .add_directive("gprs_mac::sched=info".parse().unwrap())
        .add_directive("gprs_mac::rlc=info".parse().unwrap())
        .add_directive("gprs_mac::resources=warn".parse().unwrap())
        // State machines are the interesting part
        .add_directive("gprs_mac::tbf=debug".parse().unwrap())
        .add_directive("gprs_mac::msinfo=debug".parse().unwrap())
}

/// Sets up logging to stdout and optionally a verbose log file.
/// If an output file is requested, returns Some(WorkerGuard). Keep this
/// value alive or logging to file may cease working.
fn setup_logging(stdout_filter: EnvFilter, outfile: Option<(String, EnvFilter)>) -> Option<WorkerGuard> {
    if let Some((outfile, outfile_filter)) = outfile {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(outfile)
            .expect("Failed to open log file");
        let (file_writer, guard) = tracing_appender::non_blocking(file);

        INIT_LOG.call_once(|| {
            let file_layer = tracingfmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false)
                .with_file(true)
                .with_line_number(true);

            let stdout_layer = tracingfmt::layer().with_target(false).with_file(true).with_line_number(true);

            tracing_subscriber::registry()
                .with(file_layer.with_filter(outfile_filter))
                .with(stdout_layer.with_filter(stdout_filter))
                .init();
        });

        Some(guard)
    } else {
        INIT_LOG.call_once(|| {
            let stdout_layer = tracingfmt::layer().with_target(false).with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(stdout_layer.with_filter(stdout_filter)).init();
        });
        None
    }
}
