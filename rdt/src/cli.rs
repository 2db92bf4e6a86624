//! Shared command-line plumbing: the protocol flag and logging setup.
//!
//! Logging goes to stdout unless `--quiet`, and additionally to a JSON
//! file under `./logs` when `--log` is passed.

use clap::ValueEnum;
use rdt_core::ProtocolKind;
use std::fs::{create_dir_all, OpenOptions};
use std::sync::Arc;
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, Registry};

/// The `-r/--protocol` flag, using the same names the wire format does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    #[value(name = "stop_and_wait")]
    StopAndWait,
    #[value(name = "selective_repeat")]
    SelectiveRepeat,
}

impl From<Protocol> for ProtocolKind {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::StopAndWait => ProtocolKind::StopAndWait,
            Protocol::SelectiveRepeat => ProtocolKind::SelectiveRepeat,
        }
    }
}

/// Installs the global tracing subscriber. Should be called once at the
/// start of each binary.
pub fn initialize_logging(verbose: bool, quiet: bool, log_to_file: bool) -> anyhow::Result<()> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match (!quiet, log_to_file) {
        (true, true) => Box::new(
            Registry::default()
                .with(level)
                .with(
                    fmt::Layer::default()
                        .json()
                        .with_writer(Arc::new(open_log_file()?)),
                )
                .with(
                    fmt::Layer::default()
                        .without_time()
                        .with_file(false)
                        .with_target(false),
                ),
        ),
        (true, false) => Box::new(
            Registry::default().with(level).with(
                fmt::Layer::default()
                    .without_time()
                    .with_file(false)
                    .with_target(false),
            ),
        ),
        (false, true) => Box::new(
            Registry::default().with(level).with(
                fmt::Layer::default()
                    .json()
                    .with_writer(Arc::new(open_log_file()?)),
            ),
        ),
        (false, false) => Box::new(Registry::default()),
    };
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn open_log_file() -> anyhow::Result<std::fs::File> {
    let directory = "./logs";
    create_dir_all(directory)?;
    let path = format!(
        "{}/rdt-{}.log",
        directory,
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    Ok(OpenOptions::new().append(true).create(true).open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_flag_matches_wire_names() {
        for (protocol, kind) in [
            (Protocol::StopAndWait, ProtocolKind::StopAndWait),
            (Protocol::SelectiveRepeat, ProtocolKind::SelectiveRepeat),
        ] {
            assert_eq!(ProtocolKind::from(protocol), kind);
            let value = protocol.to_possible_value().unwrap();
            assert_eq!(value.get_name(), kind.wire_name());
        }
    }
}
