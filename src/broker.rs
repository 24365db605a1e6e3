//! Accepting units and assigning their roles.

use std::fmt;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;

use crate::errors::Result;

/// How often a pending accept checks its deadline.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Role of a connected unit for one cycle. Never persisted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Active,
    Passive,
    /// The only unit that connected.
    Sole,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Active => "active",
            Role::Passive => "passive",
            Role::Sole => "sole",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connected unit.
#[derive(Debug)]
pub struct Peer {
    pub role: Role,
    pub addr: SocketAddr,
    pub stream: TcpStream,
}

/// Assign roles to connections in arrival order.
///
/// The first connection from `active_peer` is active, whichever order
/// the two arrived in. If neither matches, the first arrival is.
pub fn classify(arrivals: &[SocketAddr], active_peer: IpAddr) -> Vec<Role> {
    match arrivals {
        [] => Vec::new(),
        [_] => vec![Role::Sole],
        [first, second] => {
            if first.ip() != active_peer && second.ip() == active_peer {
                vec![Role::Passive, Role::Active]
            } else {
                if first.ip() != active_peer {
                    tracing::warn!(
                        "Neither {first} nor {second} is the configured active unit \
                         {active_peer}; making the first arrival active"
                    );
                }
                vec![Role::Active, Role::Passive]
            }
        }
        more => {
            tracing::error!("{} connections is more than two; ignoring the extras", more.len());
            classify(&more[..2], active_peer)
        }
    }
}

pub struct Broker {
    listener: TcpListener,
    accept_timeout: Duration,
    active_peer: IpAddr,
}

impl Broker {
    pub fn bind(addr: SocketAddr, accept_timeout: Duration, active_peer: IpAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        tracing::info!("Listening for units on {:?}", listener.local_addr()?);
        Ok(Self::from_listener(listener, accept_timeout, active_peer))
    }

    pub fn from_listener(listener: TcpListener, accept_timeout: Duration, active_peer: IpAddr) -> Self {
        Self {
            listener,
            accept_timeout,
            active_peer,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept up to two units.
    ///
    /// Each accept, the first one included, waits up to the accept
    /// timeout, so the whole window can last twice that. A lone unit
    /// is served after one timeout instead of waiting forever for a
    /// partner.
    #[tracing::instrument(name = "accept_units", skip(self))]
    pub fn accept_peers(&self) -> Result<Vec<Peer>> {
        let accepted = with_nonblocking(&self.listener, || self.accept_up_to_two())?;

        let addrs: Vec<SocketAddr> = accepted.iter().map(|(_, addr)| *addr).collect();
        let roles = classify(&addrs, self.active_peer);
        let peers = accepted
            .into_iter()
            .zip(roles)
            .map(|((stream, addr), role)| {
                tracing::info!("{addr} is {role}");
                Peer { role, addr, stream }
            })
            .collect();
        Ok(peers)
    }

    fn accept_up_to_two(&self) -> Result<Vec<(TcpStream, SocketAddr)>> {
        let mut accepted = Vec::with_capacity(2);
        while accepted.len() < 2 {
            match self.accept_within(self.accept_timeout)? {
                Some(conn) => {
                    tracing::info!("Unit connected from {}", conn.1);
                    accepted.push(conn);
                }
                None => {
                    tracing::info!(
                        "No more units within {:?}; {} connected",
                        self.accept_timeout,
                        accepted.len()
                    );
                    break;
                }
            }
        }
        Ok(accepted)
    }

    fn accept_within(&self, timeout: Duration) -> Result<Option<(TcpStream, SocketAddr)>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    // Accepted sockets inherit non-blocking mode on
                    // some platforms.
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    return Ok(Some((stream, addr)));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(ACCEPT_POLL.min(deadline - now));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Run `f` with the listener in non-blocking mode, restoring blocking
/// mode whether or not `f` succeeds.
fn with_nonblocking<T>(listener: &TcpListener, f: impl FnOnce() -> Result<T>) -> Result<T> {
    listener.set_nonblocking(true)?;
    let result = f();
    listener.set_nonblocking(false)?;
    result
}

#[cfg(test)]
use crate::errors::Error;

#[cfg(test)]
fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[test]
fn active_is_found_by_address_not_arrival() {
    let active: IpAddr = "192.168.43.215".parse().unwrap();
    assert_eq!(
        classify(&[addr("192.168.43.9:4000"), addr("192.168.43.215:4001")], active),
        vec![Role::Passive, Role::Active]
    );
    assert_eq!(
        classify(&[addr("192.168.43.215:4001"), addr("192.168.43.9:4000")], active),
        vec![Role::Active, Role::Passive]
    );
}

#[test]
fn unmatched_pair_uses_arrival_order() {
    let active: IpAddr = "10.0.0.1".parse().unwrap();
    assert_eq!(
        classify(&[addr("10.0.0.7:1"), addr("10.0.0.8:1")], active),
        vec![Role::Active, Role::Passive]
    );
}

#[test]
fn same_host_pair_makes_first_arrival_active() {
    let active: IpAddr = "127.0.0.1".parse().unwrap();
    assert_eq!(
        classify(&[addr("127.0.0.1:50001"), addr("127.0.0.1:50000")], active),
        vec![Role::Active, Role::Passive]
    );
}

#[test]
fn lone_unit_is_sole() {
    let active: IpAddr = "10.0.0.1".parse().unwrap();
    assert_eq!(classify(&[addr("10.0.0.9:1")], active), vec![Role::Sole]);
    assert!(classify(&[], active).is_empty());
}

#[test]
fn accept_gives_up_after_timeout() {
    let broker = Broker::bind(
        addr("127.0.0.1:0"),
        Duration::from_millis(100),
        "127.0.0.1".parse().unwrap(),
    )
    .unwrap();
    let target = broker.local_addr().unwrap();
    let client = thread::spawn(move || TcpStream::connect(target).unwrap());

    let started = Instant::now();
    let peers = broker.accept_peers().unwrap();
    let _client = client.join().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].role, Role::Sole);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn late_first_unit_still_gets_a_full_wait_for_its_partner() {
    let timeout = Duration::from_millis(150);
    let broker = Broker::bind(addr("127.0.0.1:0"), timeout, "127.0.0.1".parse().unwrap()).unwrap();
    let target = broker.local_addr().unwrap();
    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        TcpStream::connect(target).unwrap()
    });

    let started = Instant::now();
    let peers = broker.accept_peers().unwrap();
    let elapsed = started.elapsed();
    let _client = client.join().unwrap();
    assert_eq!(peers.len(), 1);
    // The second accept restarts the clock at the first arrival.
    assert!(elapsed >= Duration::from_millis(80) + timeout, "{elapsed:?}");
    assert!(elapsed < timeout * 2 + Duration::from_millis(100), "{elapsed:?}");
}

#[test]
fn failed_accept_restores_blocking_mode() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let local = listener.local_addr().unwrap();
    let result: Result<()> = with_nonblocking(&listener, || Err(Error::protocol("accept failed")));
    assert!(result.is_err());

    // A non-blocking listener would return WouldBlock before the
    // client gets there.
    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        TcpStream::connect(local).unwrap()
    });
    let (_conn, from) = listener.accept().unwrap();
    assert_eq!(from.ip(), local.ip());
    client.join().unwrap();
}
