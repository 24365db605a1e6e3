//! Failover dispatcher.
//!
//! One cycle partitions a batch, watches the connected units for the
//! failure signal during a fixed receive window, and pushes each unit
//! at most one share. The decisions live in [`Arbiter`], which knows
//! nothing about sockets; each connection is served by its own thread
//! that reports what it saw and waits to be told what to send.

use std::io::ErrorKind;
use std::io::Read;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use tracing::Dispatch;

use crate::broker::Broker;
use crate::broker::Peer;
use crate::broker::Role;
use crate::config::DispatcherConfig;
use crate::config::StandbyPolicy;
use crate::errors::panic_message;
use crate::errors::Result;
use crate::metrics::Metrics;
use crate::partition::partition;
use crate::partition::Share;
use crate::partition::ShareKind;
use crate::partition::Shares;
use crate::record::Batch;
use crate::wire;
use crate::wire::SignalScanner;

/// Longest single blocking read while watching a unit.
const WATCH_POLL: Duration = Duration::from_millis(50);

/// What a watched unit did during the receive window.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Sent the failure signal.
    Breakdown,
    /// Closed its connection or the connection failed.
    HungUp,
    /// Said nothing before the deadline.
    Silent,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Silent)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    Push(ShareKind),
    Close,
}

/// Decides which unit gets which share.
///
/// Every unit is sent exactly one command. A unit that failed is only
/// ever sent [`Command::Close`].
#[derive(Debug)]
pub struct Arbiter {
    policy: StandbyPolicy,
    roles: Vec<Role>,
    commanded: Vec<bool>,
    retained: Option<ShareKind>,
    undelivered: Vec<ShareKind>,
    failover: bool,
}

impl Arbiter {
    pub fn new(policy: StandbyPolicy, roles: Vec<Role>) -> Self {
        let commanded = vec![false; roles.len()];
        Self {
            policy,
            roles,
            commanded,
            retained: None,
            undelivered: Vec::new(),
            failover: false,
        }
    }

    /// Whether this unit's connection is read during the window.
    /// A reserve passive unit is only held.
    pub fn watches(&self, peer: usize) -> bool {
        match self.roles[peer] {
            Role::Passive => self.policy == StandbyPolicy::Share,
            Role::Active | Role::Sole => true,
        }
    }

    pub fn on_outcome(&mut self, peer: usize, outcome: Outcome) -> Vec<(usize, Command)> {
        let mut commands = Vec::new();
        if self.commanded[peer] {
            tracing::debug!("Ignoring {outcome:?} from peer {peer}; already decided");
            return commands;
        }
        let role = self.roles[peer];
        let partner = self.partner(peer);

        if outcome.is_failure() {
            commands.push((peer, Command::Close));
            match partner {
                Some(other) if !self.commanded[other] => {
                    commands.push((other, Command::Push(ShareKind::Combined)));
                    self.failover = true;
                }
                // The partner already took its own share.
                Some(_) => self.undelivered.extend(self.own_share(role)),
                None => self.undelivered.push(ShareKind::Combined),
            }
        } else {
            match self.own_share(role) {
                Some(share) => commands.push((peer, Command::Push(share))),
                None => commands.push((peer, Command::Close)),
            }
            if role == Role::Active && self.policy == StandbyPolicy::Reserve {
                self.retained = Some(ShareKind::Minority);
                if let Some(other) = partner.filter(|other| !self.commanded[*other]) {
                    commands.push((other, Command::Close));
                }
            }
        }

        for (target, _) in &commands {
            self.commanded[*target] = true;
        }
        commands
    }

    pub fn is_settled(&self) -> bool {
        self.commanded.iter().all(|c| *c)
    }

    /// Share kept back by the dispatcher under the reserve policy.
    pub fn retained(&self) -> Option<ShareKind> {
        self.retained
    }

    /// Shares no unit could be given.
    pub fn undelivered(&self) -> &[ShareKind] {
        &self.undelivered
    }

    pub fn failover(&self) -> bool {
        self.failover
    }

    fn partner(&self, peer: usize) -> Option<usize> {
        (0..self.roles.len()).find(|other| *other != peer)
    }

    fn own_share(&self, role: Role) -> Option<ShareKind> {
        match (role, self.policy) {
            (Role::Sole, _) => Some(ShareKind::Combined),
            (Role::Active, _) => Some(ShareKind::Majority),
            (Role::Passive, StandbyPolicy::Share) => Some(ShareKind::Minority),
            (Role::Passive, StandbyPolicy::Reserve) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delivery {
    Pushed {
        share: ShareKind,
        records: usize,
        bytes: usize,
    },
    Closed,
    /// The push failed and the connection was dropped.
    SendFailed { share: ShareKind, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerReport {
    pub addr: SocketAddr,
    pub role: Role,
    /// `None` for units that were not watched.
    pub outcome: Option<Outcome>,
    pub delivery: Delivery,
}

/// Summary of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub records: usize,
    pub peers: Vec<PeerReport>,
    /// Records held back under the reserve policy.
    pub retained: usize,
    /// Records no unit received.
    pub undelivered: usize,
    pub failover: bool,
}

impl CycleReport {
    pub fn peer(&self, role: Role) -> Option<&PeerReport> {
        self.peers.iter().find(|p| p.role == role)
    }

    /// Total records pushed to units.
    pub fn pushed(&self) -> usize {
        self.peers
            .iter()
            .map(|p| match p.delivery {
                Delivery::Pushed { records, .. } => records,
                _ => 0,
            })
            .sum()
    }
}

enum Event {
    Outcome { peer: usize, outcome: Outcome },
    Finished { peer: usize, delivery: Delivery },
}

pub struct Dispatcher {
    config: DispatcherConfig,
    metrics: Arc<Metrics>,
    /// Log sink re-installed in every peer thread.
    dispatch: Dispatch,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, metrics: Arc<Metrics>) -> Self {
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);
        Self {
            config,
            metrics,
            dispatch,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Apply the configured shuffle, then partition.
    pub fn prepare(&self, mut batch: Batch) -> Shares {
        if let Some(seed) = self.config.shuffle_seed {
            tracing::debug!("Shuffling {} records with seed {seed}", batch.len());
            batch.shuffle(&mut fastrand::Rng::with_seed(seed));
        }
        partition(&batch, self.config.split)
    }

    /// Accept units and run one cycle with them.
    pub fn serve(&self, broker: &Broker, batch: Batch) -> Result<CycleReport> {
        let peers = broker.accept_peers()?;
        self.run_cycle(batch, peers)
    }

    #[tracing::instrument(
        name = "dispatch_cycle",
        skip_all,
        fields(records = batch.len(), units = peers.len())
    )]
    pub fn run_cycle(&self, batch: Batch, peers: Vec<Peer>) -> Result<CycleReport> {
        let shares = self.prepare(batch);
        let mut report = CycleReport {
            records: shares.combined.len(),
            ..Default::default()
        };
        if peers.is_empty() {
            tracing::warn!("No unit connected; {} records undelivered", report.records);
            report.undelivered = report.records;
            return Ok(report);
        }
        tracing::info!(
            "Split {} records into minority {:?} and majority {:?}",
            report.records,
            shares.minority.rows,
            shares.majority.rows
        );

        let idents: Vec<(SocketAddr, Role)> = peers.iter().map(|p| (p.addr, p.role)).collect();
        let mut arbiter = Arbiter::new(
            self.config.standby,
            idents.iter().map(|(_, role)| *role).collect(),
        );
        let mut outcomes: Vec<Option<Outcome>> = vec![None; idents.len()];
        let mut deliveries: Vec<Option<Delivery>> = vec![None; idents.len()];

        let deadline = Instant::now() + self.config.receive_timeout;
        let (event_tx, event_rx) = mpsc::channel();
        thread::scope(|scope| -> Result<()> {
            let shares = &shares;
            let mut command_txs = Vec::with_capacity(peers.len());
            let mut handles = Vec::with_capacity(peers.len());
            for (index, peer) in peers.into_iter().enumerate() {
                let (command_tx, command_rx) = mpsc::channel();
                command_txs.push(command_tx);
                let watch = arbiter.watches(index);
                let events = event_tx.clone();
                let dispatch = self.dispatch.clone();
                let handle = thread::Builder::new()
                    .name(format!("peer-{}", peer.role))
                    .spawn_scoped(scope, move || {
                        tracing::dispatcher::with_default(&dispatch, || {
                            let span =
                                tracing::info_span!("peer", addr = %peer.addr, role = %peer.role);
                            span.in_scope(|| {
                                serve_peer(index, peer, watch, deadline, shares, command_rx, events)
                            })
                        })
                    })?;
                handles.push(handle);
            }
            drop(event_tx);

            let mut finished = 0;
            while finished < handles.len() {
                let Ok(event) = event_rx.recv() else {
                    break;
                };
                match event {
                    Event::Outcome { peer, outcome } => {
                        let (addr, role) = idents[peer];
                        tracing::info!("{role} unit {addr}: {outcome:?}");
                        outcomes[peer] = Some(outcome);
                        for (target, command) in arbiter.on_outcome(peer, outcome) {
                            let (addr, role) = idents[target];
                            tracing::info!("Telling {role} unit {addr}: {command:?}");
                            if command_txs[target].send(command).is_err() {
                                tracing::error!("Thread for {role} unit {addr} already exited");
                            }
                        }
                    }
                    Event::Finished { peer, delivery } => {
                        deliveries[peer] = Some(delivery);
                        finished += 1;
                    }
                }
            }
            drop(command_txs);
            for handle in handles {
                handle.join().map_err(panic_message)?;
            }
            Ok(())
        })?;

        for (((addr, role), outcome), delivery) in idents.into_iter().zip(outcomes).zip(deliveries) {
            let delivery = delivery.unwrap_or(Delivery::Closed);
            match &delivery {
                Delivery::Pushed { share, .. } => {
                    self.metrics
                        .pushes
                        .with_label_values(&[role.as_str(), share.as_str()])
                        .inc();
                }
                Delivery::SendFailed { share, error } => {
                    tracing::error!("Push of {share} share to {addr} failed: {error}");
                    report.undelivered += shares.get(*share).len();
                }
                Delivery::Closed => {}
            }
            report.peers.push(PeerReport {
                addr,
                role,
                outcome,
                delivery,
            });
        }
        if let Some(kind) = arbiter.retained() {
            report.retained = shares.get(kind).len();
            tracing::warn!("{} records of the {kind} share retained", report.retained);
        }
        for kind in arbiter.undelivered() {
            tracing::error!("No unit available for the {kind} share");
            report.undelivered += shares.get(*kind).len();
        }
        if arbiter.failover() {
            self.metrics.failovers.inc();
            report.failover = true;
        }
        Ok(report)
    }
}

enum Watch {
    Outcome(Outcome),
    /// Decided before this unit's window ended.
    Preempted(Command),
}

fn serve_peer(
    index: usize,
    peer: Peer,
    watch: bool,
    deadline: Instant,
    shares: &Shares,
    commands: Receiver<Command>,
    events: Sender<Event>,
) {
    let Peer { mut stream, .. } = peer;
    let command = if watch {
        match watch_window(&mut stream, deadline, &commands) {
            Watch::Outcome(outcome) => {
                // The coordinator only goes away if it failed; close.
                if events.send(Event::Outcome { peer: index, outcome }).is_err() {
                    Command::Close
                } else {
                    commands.recv().unwrap_or(Command::Close)
                }
            }
            Watch::Preempted(command) => command,
        }
    } else {
        commands.recv().unwrap_or(Command::Close)
    };

    let delivery = execute(&mut stream, command, shares);
    let _ = events.send(Event::Finished {
        peer: index,
        delivery,
    });
}

fn watch_window(stream: &mut TcpStream, deadline: Instant, commands: &Receiver<Command>) -> Watch {
    let mut scanner = SignalScanner::new();
    let mut buf = [0u8; 512];
    loop {
        match commands.try_recv() {
            Ok(command) => return Watch::Preempted(command),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Watch::Preempted(Command::Close),
        }
        let now = Instant::now();
        if now >= deadline {
            return Watch::Outcome(Outcome::Silent);
        }
        if let Err(err) = stream.set_read_timeout(Some(WATCH_POLL.min(deadline - now))) {
            tracing::warn!("Can't watch connection: {err}");
            return Watch::Outcome(Outcome::HungUp);
        }
        match stream.read(&mut buf) {
            Ok(0) => return Watch::Outcome(Outcome::HungUp),
            Ok(n) => {
                if scanner.feed(&buf[..n]) {
                    return Watch::Outcome(Outcome::Breakdown);
                }
                tracing::debug!("Ignoring {n} unrecognized bytes");
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                tracing::warn!("Connection failed while watching: {err}");
                return Watch::Outcome(Outcome::HungUp);
            }
        }
    }
}

fn execute(stream: &mut TcpStream, command: Command, shares: &Shares) -> Delivery {
    match command {
        Command::Push(kind) => {
            let share = shares.get(kind);
            let delivery = match push(stream, share) {
                Ok(bytes) => {
                    tracing::info!("Pushed {} records ({bytes} bytes) of the {kind} share", share.len());
                    Delivery::Pushed {
                        share: kind,
                        records: share.len(),
                        bytes,
                    }
                }
                Err(err) => Delivery::SendFailed {
                    share: kind,
                    error: err.to_string(),
                },
            };
            let _ = stream.shutdown(Shutdown::Write);
            delivery
        }
        Command::Close => {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                tracing::debug!("Closing connection: {err}");
            }
            Delivery::Closed
        }
    }
}

fn push(stream: &mut TcpStream, share: &Share) -> Result<usize> {
    stream.set_read_timeout(None)?;
    wire::send_batch(stream, &share.batch)
}

#[cfg(test)]
fn pair(policy: StandbyPolicy) -> Arbiter {
    Arbiter::new(policy, vec![Role::Active, Role::Passive])
}

#[test]
fn reserve_silent_active_gets_majority() {
    let mut arbiter = pair(StandbyPolicy::Reserve);
    assert!(arbiter.watches(0));
    assert!(!arbiter.watches(1));
    assert_eq!(
        arbiter.on_outcome(0, Outcome::Silent),
        vec![(0, Command::Push(ShareKind::Majority)), (1, Command::Close)]
    );
    assert!(arbiter.is_settled());
    assert_eq!(arbiter.retained(), Some(ShareKind::Minority));
    assert!(!arbiter.failover());
}

#[test]
fn reserve_breakdown_fails_over_to_passive() {
    let mut arbiter = pair(StandbyPolicy::Reserve);
    assert_eq!(
        arbiter.on_outcome(0, Outcome::Breakdown),
        vec![(0, Command::Close), (1, Command::Push(ShareKind::Combined))]
    );
    assert!(arbiter.is_settled());
    assert!(arbiter.failover());
    assert_eq!(arbiter.retained(), None);
    assert!(arbiter.undelivered().is_empty());
}

#[test]
fn hang_up_counts_as_breakdown() {
    let mut arbiter = pair(StandbyPolicy::Reserve);
    assert_eq!(
        arbiter.on_outcome(0, Outcome::HungUp),
        vec![(0, Command::Close), (1, Command::Push(ShareKind::Combined))]
    );
}

#[test]
fn share_policy_splits_on_silence() {
    let mut arbiter = pair(StandbyPolicy::Share);
    assert!(arbiter.watches(1));
    assert_eq!(
        arbiter.on_outcome(1, Outcome::Silent),
        vec![(1, Command::Push(ShareKind::Minority))]
    );
    assert!(!arbiter.is_settled());
    assert_eq!(
        arbiter.on_outcome(0, Outcome::Silent),
        vec![(0, Command::Push(ShareKind::Majority))]
    );
    assert!(arbiter.is_settled());
    assert_eq!(arbiter.retained(), None);
}

#[test]
fn share_policy_passive_breakdown_fails_over_to_active() {
    let mut arbiter = pair(StandbyPolicy::Share);
    assert_eq!(
        arbiter.on_outcome(1, Outcome::Breakdown),
        vec![(1, Command::Close), (0, Command::Push(ShareKind::Combined))]
    );
    // Active's own window ending later changes nothing.
    assert!(arbiter.on_outcome(0, Outcome::Silent).is_empty());
}

#[test]
fn breakdown_after_partner_took_its_share_is_undelivered() {
    let mut arbiter = pair(StandbyPolicy::Share);
    arbiter.on_outcome(1, Outcome::Silent);
    assert_eq!(
        arbiter.on_outcome(0, Outcome::Breakdown),
        vec![(0, Command::Close)]
    );
    assert_eq!(arbiter.undelivered(), &[ShareKind::Majority]);
}

#[test]
fn both_break_down() {
    let mut arbiter = pair(StandbyPolicy::Share);
    arbiter.on_outcome(0, Outcome::Breakdown);
    // Passive was already told to take everything.
    assert!(arbiter.on_outcome(1, Outcome::Breakdown).is_empty());
    assert!(arbiter.failover());
}

#[test]
fn sole_unit_gets_combined_or_nothing() {
    let mut arbiter = Arbiter::new(StandbyPolicy::Reserve, vec![Role::Sole]);
    assert_eq!(
        arbiter.on_outcome(0, Outcome::Silent),
        vec![(0, Command::Push(ShareKind::Combined))]
    );

    let mut arbiter = Arbiter::new(StandbyPolicy::Reserve, vec![Role::Sole]);
    assert_eq!(arbiter.on_outcome(0, Outcome::Breakdown), vec![(0, Command::Close)]);
    assert_eq!(arbiter.undelivered(), &[ShareKind::Combined]);
}

#[test]
fn never_more_than_one_command_per_unit() {
    let outcomes = [Outcome::Silent, Outcome::Breakdown, Outcome::HungUp];
    for policy in [StandbyPolicy::Reserve, StandbyPolicy::Share] {
        for first in outcomes {
            for second in outcomes {
                let mut arbiter = pair(policy);
                let mut sent = vec![0; 2];
                let order: &[(usize, Outcome)] = if policy == StandbyPolicy::Share {
                    &[(0, first), (1, second)]
                } else {
                    &[(0, first)]
                };
                for (peer, outcome) in order {
                    for (target, command) in arbiter.on_outcome(*peer, *outcome) {
                        sent[target] += 1;
                        if *peer == target && outcome.is_failure() {
                            assert_eq!(command, Command::Close);
                        }
                    }
                }
                assert!(sent.iter().all(|n| *n == 1), "{policy:?} {first:?} {second:?}: {sent:?}");
            }
        }
    }
}

#[test]
fn empty_cycle_reports_everything_undelivered() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), Metrics::new().unwrap());
    let batch = Batch::new((0..9).map(|i| crate::record::reading(&format!("{i:06}"), "5 kWh")).collect());
    let report = dispatcher.run_cycle(batch, Vec::new()).unwrap();
    assert_eq!(report.records, 9);
    assert_eq!(report.undelivered, 9);
    assert!(report.peers.is_empty());
}
