//! Log sink construction.
//!
//! Nothing here installs a global subscriber. [`dispatch`] returns a
//! [`Dispatch`] that the binary makes current for its own thread with
//! [`tracing::dispatcher::with_default`]; components that spawn
//! threads capture it at construction and re-install it in each
//! thread they start, so every log line of the process goes through
//! the one sink.

use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing::Dispatch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::Error;
use crate::errors::Result;

/// Log target of everything in this crate.
pub const TARGET: &str = "meterflow";

pub fn parse_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level).map_err(|_| Error::config(format!("Wrong log level: {level}")))
}

/// Build the process log sink.
///
/// When `RUST_LOG` is set it replaces `level` as the filter, and can
/// also enable other crates' targets.
pub fn dispatch(level: LevelFilter) -> Dispatch {
    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    match EnvFilter::try_from_default_env() {
        Ok(env) => Dispatch::new(Registry::default().with(logs.with_filter(env))),
        Err(_) => Dispatch::new(
            Registry::default().with(logs.with_filter(Targets::new().with_target(TARGET, level))),
        ),
    }
}

#[test]
fn levels_parse_case_insensitively() {
    assert_eq!(parse_level("DEBUG").unwrap(), LevelFilter::DEBUG);
    assert_eq!(parse_level("warn").unwrap(), LevelFilter::WARN);
    assert!(parse_level("loud").is_err());
}

