//! Settings for the dispatcher and the processing units.
//!
//! Both can be loaded from a JSON file; every field is optional and
//! falls back to its default. Durations are written as fractional
//! seconds:
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:5000",
//!   "accept_timeout": 10,
//!   "receive_timeout": 10,
//!   "active_peer": "192.168.43.215",
//!   "split": 0.3333333333333333,
//!   "standby": "reserve"
//! }
//! ```
//!
//! Values are checked by `validate` after loading; every problem is
//! reported at once.

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::errors::Result;
use crate::partition::SplitRatio;

pub const DEFAULT_PORT: u16 = 5000;

/// (De)serialize a [`Duration`] as fractional seconds.
mod seconds {
    use std::time::Duration;

    use serde::de::Error;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|err| D::Error::custom(format!("invalid duration {secs}: {err}")))
    }
}

/// What the passive unit is given when the active one stays silent.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StandbyPolicy {
    /// The passive unit stays idle unless the active one breaks down.
    /// The minority share is retained by the dispatcher.
    #[default]
    Reserve,
    /// Both units watch for breakdowns; on silence the active unit
    /// gets the majority share and the passive unit the minority.
    Share,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// One CSV file per artifact.
    #[default]
    Fs,
    /// One SQLite DB per checkpoint directory.
    Sqlite,
}

/// How long a recovering process waits for the next artifact.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Total time to wait.
    #[serde(with = "seconds")]
    pub window: Duration,
    /// Time between looks.
    #[serde(with = "seconds")]
    pub interval: Duration,
}

impl ProbeConfig {
    pub fn new(window: Duration, interval: Duration) -> Result<Self> {
        let probe = Self { window, interval };
        let mut errors = Vec::new();
        probe.check(&mut errors);
        finish(errors)?;
        Ok(probe)
    }

    fn check(&self, errors: &mut Vec<String>) {
        if self.interval.is_zero() {
            errors.push("probe interval must be > 0".to_string());
        }
        if self.window < self.interval {
            errors.push(format!(
                "probe window {:?} is shorter than the probe interval {:?}",
                self.window, self.interval
            ));
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    pub listen: SocketAddr,
    /// How long each accept waits: first for one unit, then for its
    /// partner. The whole accept window can reach twice this.
    #[serde(with = "seconds")]
    pub accept_timeout: Duration,
    /// How long a unit has to send the failure signal.
    #[serde(with = "seconds")]
    pub receive_timeout: Duration,
    /// Address of the unit that should be active.
    pub active_peer: IpAddr,
    pub split: SplitRatio,
    pub standby: StandbyPolicy,
    /// Shuffle the batch with this seed before partitioning.
    pub shuffle_seed: Option<u64>,
    /// Serve `/metrics` and `/status` here.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            accept_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(10),
            active_peer: IpAddr::V4(Ipv4Addr::LOCALHOST),
            split: SplitRatio::default(),
            standby: StandbyPolicy::default(),
            shuffle_seed: None,
            metrics_addr: None,
        }
    }
}

impl DispatcherConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.accept_timeout.is_zero() {
            errors.push("accept_timeout must be > 0".to_string());
        }
        if self.receive_timeout.is_zero() {
            errors.push("receive_timeout must be > 0".to_string());
        }
        // `SplitRatio` validates itself on deserialization; recheck
        // values built in code.
        if let Err(err) = SplitRatio::new(self.split.minority_fraction()) {
            errors.push(err.to_string());
        }
        finish(errors)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnitConfig {
    /// Where the dispatcher listens.
    pub dispatcher: SocketAddr,
    pub checkpoint_dir: PathBuf,
    pub backend: StoreBackend,
    /// Worker threads per stage.
    pub workers: usize,
    pub probe: ProbeConfig,
    /// Send the failure signal instead of taking work.
    pub simulate_breakdown: bool,
    /// Also copy the final output here.
    pub export: Option<PathBuf>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            dispatcher: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            checkpoint_dir: PathBuf::from("checkpoints"),
            backend: StoreBackend::default(),
            workers: 2,
            probe: ProbeConfig::default(),
            simulate_breakdown: false,
            export: None,
        }
    }
}

impl UnitConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.workers == 0 {
            errors.push("workers must be >= 1".to_string());
        }
        if self.checkpoint_dir.as_os_str().is_empty() {
            errors.push("checkpoint_dir must not be empty".to_string());
        }
        self.probe.check(&mut errors);
        finish(errors)
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    tracing::debug!("Loading config from {path:?}");
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[track_caller]
fn finish(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::config(errors.join("; ")))
    }
}

#[test]
fn partial_file_keeps_defaults() {
    let config: DispatcherConfig = serde_json::from_str(
        r#"{"active_peer": "192.168.43.215", "receive_timeout": 2.5, "standby": "share"}"#,
    )
    .unwrap();
    assert_eq!(config.active_peer, "192.168.43.215".parse::<IpAddr>().unwrap());
    assert_eq!(config.receive_timeout, Duration::from_millis(2500));
    assert_eq!(config.standby, StandbyPolicy::Share);
    assert_eq!(config.listen.port(), DEFAULT_PORT);
    assert_eq!(config.split, SplitRatio::default());
    config.validate().unwrap();
}

#[test]
fn unknown_fields_are_refused() {
    let res: std::result::Result<UnitConfig, _> = serde_json::from_str(r#"{"worker": 4}"#);
    assert!(res.is_err());
}

#[test]
fn bad_split_is_refused_on_load() {
    let res: std::result::Result<DispatcherConfig, _> = serde_json::from_str(r#"{"split": 1.5}"#);
    assert!(res.is_err());
}

#[test]
fn probe_window_must_cover_an_interval() {
    assert!(ProbeConfig::new(Duration::from_secs(5), Duration::from_secs(10)).is_err());
    assert!(ProbeConfig::new(Duration::from_secs(10), Duration::ZERO).is_err());
    ProbeConfig::new(Duration::from_secs(10), Duration::from_secs(1)).unwrap();

    let config = UnitConfig {
        workers: 0,
        probe: ProbeConfig {
            window: Duration::from_secs(1),
            interval: Duration::from_secs(2),
        },
        ..Default::default()
    };
    let msg = config.validate().unwrap_err().to_string();
    assert!(msg.contains("workers"), "got: {msg}");
    assert!(msg.contains("probe window"), "got: {msg}");
}

#[test]
fn load_reads_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unit.json");
    std::fs::write(
        &path,
        r#"{"backend": "sqlite", "workers": 4, "probe": {"window": 3, "interval": 0.5}}"#,
    )
    .unwrap();
    let config = UnitConfig::load(&path).unwrap();
    assert_eq!(config.backend, StoreBackend::Sqlite);
    assert_eq!(config.workers, 4);
    assert_eq!(config.probe.interval, Duration::from_millis(500));
}
