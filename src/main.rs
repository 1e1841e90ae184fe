//! rdna-stack: device and memory diagnostics for AMD RDNA GPUs.
//!
//! Loads the configuration, initializes the runtime on the simulated driver,
//! and prints the requested report.

use std::io;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use rdna_stack::config::{Cli, Command, Config};
use rdna_stack::gpu::allocator::format_bytes;
use rdna_stack::Runtime;

const INFO_FILTER: &str = "rdna_stack=info";
const DEBUG_FILTER: &str = "rdna_stack=debug";

/// Handle on the installed log filter.
struct LogLevel {
    handle: reload::Handle<EnvFilter, Registry>,

    /// Set by `--verbose` or `RUST_LOG`; the config file cannot override it.
    pinned: bool,
}

impl LogLevel {
    fn raise_to_debug(&self) -> anyhow::Result<()> {
        if !self.pinned {
            self.handle.reload(EnvFilter::new(DEBUG_FILTER))?;
        }
        Ok(())
    }
}

/// Install the global subscriber. Runs before anything else logs.
fn init_tracing(cli: &Cli) -> LogLevel {
    let default = if cli.verbose { DEBUG_FILTER } else { INFO_FILTER };
    let from_env = EnvFilter::try_from_default_env().ok();
    let pinned = cli.verbose || from_env.is_some();
    let (filter, handle) =
        reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new(default)));

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init();
    }

    LogLevel { handle, pinned }
}

/// Load the configuration file and apply its `logging.debug` switch.
fn load_config(cli: &Cli, log_level: &LogLevel) -> anyhow::Result<Config> {
    let config = Config::load(&cli.config)?;
    if config.logging.debug {
        log_level.raise_to_debug()?;
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    let log_level = init_tracing(&cli);
    let config = load_config(&cli, &log_level)?;

    info!("rdna-stack v{}", rdna_stack::VERSION);
    info!(
        path = %cli.config.display(),
        from_file = cli.config.exists(),
        visible = ?config.devices.visible,
        simulated = config.devices.simulated.len(),
        "Configuration loaded"
    );

    let runtime = Runtime::from_config(config)?;
    if cli.verbose {
        runtime.set_debug_logging(true);
    }
    let devices = runtime.initialize();
    info!(devices, "Runtime ready");

    let diagnostics = runtime.diagnostics();
    let mut stdout = io::stdout().lock();

    match cli.command.unwrap_or(Command::Diagnostics) {
        Command::Diagnostics => diagnostics.run(&mut stdout),
        Command::SystemInfo => println!("{}", diagnostics.system_info()),
        Command::MemoryInfo { device } => println!("{}", diagnostics.memory_info(device)),
        Command::Exercise {
            device,
            bytes,
            count,
        } => {
            let guard = runtime
                .device(&device)
                .with_context(|| format!("cannot select device {device:?}"))?;
            info!(
                device = guard.index(),
                bytes = %format_bytes(bytes),
                count,
                "Exercising allocator"
            );

            let mut blocks = Vec::with_capacity(count);
            for _ in 0..count {
                blocks.push(runtime.allocate(bytes)?);
            }
            // Free every other block first so the cache has holes to coalesce.
            let (odd, even): (Vec<_>, Vec<_>) = blocks
                .into_iter()
                .enumerate()
                .partition(|(i, _)| i % 2 == 1);
            for (_, block) in odd.into_iter().chain(even) {
                runtime.free(block)?;
            }
            // Reuse from the cache.
            let reused = runtime.allocate(bytes)?;
            println!("{}", runtime.memory_summary(Some(guard.index()))?);
            runtime.free(reused)?;

            let released = runtime.empty_cache(Some(guard.index()));
            println!("Released {} back to the driver.", format_bytes(released));
            drop(guard);
            println!();
            println!("{}", diagnostics.memory_info(None));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    /// Log sink shared with the test body.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` under an info-level subscriber that writes to the returned sink.
    fn with_capture<R>(f: impl FnOnce(&LogLevel) -> R) -> (R, Captured) {
        let sink = Captured::default();
        let writer = sink.clone();
        let (filter, handle) = reload::Layer::new(EnvFilter::new(INFO_FILTER));
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(move || writer.clone()),
        );
        let log_level = LogLevel {
            handle,
            pinned: false,
        };
        let result = tracing::subscriber::with_default(subscriber, || f(&log_level));
        (result, sink)
    }

    fn cli_for(path: &std::path::Path) -> Cli {
        Cli::parse_from(["rdna-stack", "--config", path.to_str().unwrap()])
    }

    #[test]
    fn test_missing_config_warning_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let cli = cli_for(&dir.path().join("absent.json"));

        let (config, logs) = with_capture(|log_level| load_config(&cli, log_level));
        assert!(!config.unwrap().logging.debug);
        assert!(logs.text().contains("Config file not found"));
    }

    #[test]
    fn test_config_debug_switch_raises_level() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "logging": {{ "debug": true }} }}"#).unwrap();
        let cli = cli_for(file.path());

        let (_, logs) = with_capture(|log_level| {
            tracing::debug!(target: "rdna_stack::gpu", "before load");
            load_config(&cli, log_level).unwrap();
            tracing::debug!(target: "rdna_stack::gpu", "after load");
        });
        let text = logs.text();
        assert!(!text.contains("before load"));
        assert!(text.contains("after load"));
    }

    #[test]
    fn test_pinned_level_ignores_config_switch() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "logging": {{ "debug": true }} }}"#).unwrap();
        let cli = cli_for(file.path());

        let (_, logs) = with_capture(|log_level| {
            let pinned = LogLevel {
                handle: log_level.handle.clone(),
                pinned: true,
            };
            load_config(&cli, &pinned).unwrap();
            tracing::debug!(target: "rdna_stack::gpu", "after load");
        });
        assert!(!logs.text().contains("after load"));
    }
}
