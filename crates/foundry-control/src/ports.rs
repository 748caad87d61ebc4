//! Port leasing.
//!
//! The reservation table is the source of truth for which ports are taken.
//! A bind probe alone is not atomic across two racing deployments, so a port
//! is only handed out after it has been claimed in the table under its lock.
//! The probe is consulted as well, to skip ports something outside this
//! process is already using.
//!
//! Leases go through two phases: a port is *reserved* by [`PortAllocator::lease`]
//! and *confirmed* once the container publishing it has started. Both kinds
//! are released by [`PortAllocator::release`] or by dropping the
//! [`PortLease`] guard.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::PortConfig;
use crate::error::{ControlError, ControlResult};

/// Result of probing a single port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The port could be bound.
    Free,
    /// Something else holds the port.
    InUse,
    /// The probe failed for another reason. Treated as unavailable.
    Inconclusive(String),
}

/// Checks whether a port can be bound.
pub trait BindProbe: Send + Sync + fmt::Debug {
    /// Probe `port` on `host`.
    fn probe(&self, host: IpAddr, port: u16) -> ProbeOutcome;
}

/// Probes by binding a TCP listener and dropping it straight away.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpBindProbe;

impl BindProbe for TcpBindProbe {
    fn probe(&self, host: IpAddr, port: u16) -> ProbeOutcome {
        match TcpListener::bind(SocketAddr::new(host, port)) {
            Ok(_) => ProbeOutcome::Free,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => ProbeOutcome::InUse,
            Err(e) => ProbeOutcome::Inconclusive(e.to_string()),
        }
    }
}

/// Lifecycle of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Claimed, dependent container not started yet.
    Reserved,
    /// Dependent container is running.
    Confirmed,
    /// Returned to the pool.
    Released,
}

/// A row of the reservation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseInfo {
    /// Leased port.
    pub port: u16,
    /// Who holds it.
    pub holder: String,
    /// When it was reserved.
    pub acquired_at: DateTime<Utc>,
    /// Current state.
    pub state: LeaseState,
}

#[derive(Debug)]
struct LeaseTable {
    cursor: u16,
    leases: HashMap<u16, LeaseInfo>,
}

/// Leases exclusive ports from a shared range.
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    host: IpAddr,
    probe: Arc<dyn BindProbe>,
    table: Mutex<LeaseTable>,
}

impl PortAllocator {
    /// Create an allocator for `start..=end`, probing on `host`.
    pub fn new(start: u16, end: u16, host: IpAddr) -> ControlResult<Self> {
        if start > end {
            return Err(ControlError::Config(format!(
                "port range {start}-{end} is empty"
            )));
        }
        Ok(Self {
            range: start..=end,
            host,
            probe: Arc::new(TcpBindProbe),
            table: Mutex::new(LeaseTable {
                cursor: start,
                leases: HashMap::new(),
            }),
        })
    }

    /// Create an allocator from configuration.
    pub fn from_config(config: &PortConfig) -> ControlResult<Self> {
        Self::new(config.start, config.end, config.probe_host)
    }

    /// Replace the bind probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn BindProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// The configured range.
    #[must_use]
    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// Reserve a port from the configured range.
    pub fn lease(self: &Arc<Self>, holder: impl Into<String>) -> ControlResult<PortLease> {
        let (start, end) = (*self.range.start(), *self.range.end());
        self.lease_in(start, end, holder)
    }

    /// Reserve a port from `start..=end`.
    ///
    /// Scans upwards from the rolling cursor and wraps once. Ports already in
    /// the table, in use, or whose probe is inconclusive are skipped.
    pub fn lease_in(
        self: &Arc<Self>,
        start: u16,
        end: u16,
        holder: impl Into<String>,
    ) -> ControlResult<PortLease> {
        if start > end {
            return Err(ControlError::NoPortsAvailable { start, end });
        }
        let holder = holder.into();

        let mut table = self.table.lock();
        let span = u32::from(end) - u32::from(start) + 1;
        let offset = u32::from(table.cursor.clamp(start, end)) - u32::from(start);

        for step in 0..span {
            let Ok(port) = u16::try_from(u32::from(start) + (offset + step) % span) else {
                continue;
            };
            if table.leases.contains_key(&port) {
                continue;
            }
            match self.probe.probe(self.host, port) {
                ProbeOutcome::Free => {}
                ProbeOutcome::InUse => {
                    debug!(port, "port in use, skipping");
                    continue;
                }
                ProbeOutcome::Inconclusive(reason) => {
                    debug!(port, reason = %reason, "port probe inconclusive, skipping");
                    continue;
                }
            }

            let acquired_at = Utc::now();
            table.leases.insert(
                port,
                LeaseInfo {
                    port,
                    holder: holder.clone(),
                    acquired_at,
                    state: LeaseState::Reserved,
                },
            );
            table.cursor = if port >= end { start } else { port + 1 };
            debug!(port, holder = %holder, "port reserved");

            return Ok(PortLease {
                allocator: Arc::clone(self),
                port,
                holder,
                acquired_at,
                state: LeaseState::Reserved,
            });
        }

        Err(ControlError::NoPortsAvailable { start, end })
    }

    /// Mark a reservation confirmed.
    pub fn confirm(&self, port: u16, holder: &str) -> ControlResult<()> {
        let mut table = self.table.lock();
        match table.leases.get_mut(&port) {
            Some(lease) if lease.holder == holder => {
                lease.state = LeaseState::Confirmed;
                debug!(port, holder = %holder, "port confirmed");
                Ok(())
            }
            Some(lease) => Err(ControlError::internal(format!(
                "port {port} is held by {}, not {holder}",
                lease.holder
            ))),
            None => Err(ControlError::internal(format!(
                "port {port} is not reserved"
            ))),
        }
    }

    /// Return a port to the pool.
    ///
    /// Only the holder can release. Returns `false` if the port was not held
    /// by `holder`, which makes repeated releases harmless.
    pub fn release(&self, port: u16, holder: &str) -> bool {
        let mut table = self.table.lock();
        match table.leases.get(&port) {
            Some(lease) if lease.holder == holder => {
                table.leases.remove(&port);
                debug!(port, holder = %holder, "port released");
                true
            }
            _ => false,
        }
    }

    /// Current lease on `port`, if any.
    #[must_use]
    pub fn lease_on(&self, port: u16) -> Option<LeaseInfo> {
        self.table.lock().leases.get(&port).cloned()
    }

    /// Every lease, ordered by port.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LeaseInfo> {
        let table = self.table.lock();
        let mut leases: Vec<_> = table.leases.values().cloned().collect();
        leases.sort_by_key(|lease| lease.port);
        leases
    }
}

impl fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range", &self.range)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// A held port. Released on drop unless detached.
#[derive(Debug)]
pub struct PortLease {
    allocator: Arc<PortAllocator>,
    port: u16,
    holder: String,
    acquired_at: DateTime<Utc>,
    state: LeaseState,
}

impl PortLease {
    /// Leased port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Holder token.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// When the port was reserved.
    #[must_use]
    pub const fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// State as seen by this guard.
    #[must_use]
    pub const fn state(&self) -> LeaseState {
        self.state
    }

    /// Mark the reservation confirmed.
    pub fn confirm(&mut self) -> ControlResult<()> {
        self.allocator.confirm(self.port, &self.holder)?;
        self.state = LeaseState::Confirmed;
        Ok(())
    }

    /// Give up the port now.
    pub fn release(mut self) {
        self.release_now();
    }

    /// Keep the port leased after this guard is dropped.
    ///
    /// Whoever records the port becomes responsible for releasing it with
    /// [`PortAllocator::release`].
    #[must_use]
    pub fn detach(mut self) -> u16 {
        self.state = LeaseState::Released;
        self.port
    }

    fn release_now(&mut self) {
        if self.state != LeaseState::Released {
            self.allocator.release(self.port, &self.holder);
            self.state = LeaseState::Released;
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release_now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    use super::*;

    #[derive(Debug, Default)]
    struct ScriptedProbe {
        outcomes: HashMap<u16, ProbeOutcome>,
    }

    impl ScriptedProbe {
        fn with(mut self, port: u16, outcome: ProbeOutcome) -> Self {
            self.outcomes.insert(port, outcome);
            self
        }
    }

    impl BindProbe for ScriptedProbe {
        fn probe(&self, _host: IpAddr, port: u16) -> ProbeOutcome {
            self.outcomes.get(&port).cloned().unwrap_or(ProbeOutcome::Free)
        }
    }

    fn allocator(start: u16, end: u16, probe: ScriptedProbe) -> Arc<PortAllocator> {
        Arc::new(
            PortAllocator::new(start, end, IpAddr::V4(Ipv4Addr::LOCALHOST))
                .unwrap()
                .with_probe(Arc::new(probe)),
        )
    }

    #[test]
    fn leases_ascend_from_cursor() {
        let ports = allocator(9000, 9002, ScriptedProbe::default());
        let a = ports.lease("a").unwrap();
        let b = ports.lease("b").unwrap();
        assert_eq!((a.port(), b.port()), (9000, 9001));
    }

    #[test]
    fn cursor_rolls_past_released_ports() {
        let ports = allocator(9000, 9002, ScriptedProbe::default());
        let a = ports.lease("a").unwrap();
        a.release();
        assert_eq!(ports.lease("b").unwrap().port(), 9001);
    }

    #[test]
    fn scan_wraps_around() {
        let ports = allocator(9000, 9001, ScriptedProbe::default());
        let _a = ports.lease("a").unwrap();
        let b = ports.lease("b").unwrap();
        drop(b);
        // cursor is back at 9000, which is held, so 9001 is reused
        assert_eq!(ports.lease("c").unwrap().port(), 9001);
    }

    #[test]
    fn exhaustion_is_reported() {
        let ports = allocator(9000, 9001, ScriptedProbe::default());
        let _a = ports.lease("a").unwrap();
        let _b = ports.lease("b").unwrap();
        let err = ports.lease("c").unwrap_err();
        assert!(matches!(
            err,
            ControlError::NoPortsAvailable {
                start: 9000,
                end: 9001
            }
        ));
    }

    #[test]
    fn in_use_and_inconclusive_ports_are_skipped() {
        let probe = ScriptedProbe::default()
            .with(9000, ProbeOutcome::InUse)
            .with(9001, ProbeOutcome::Inconclusive("permission denied".into()));
        let ports = allocator(9000, 9002, probe);
        assert_eq!(ports.lease("a").unwrap().port(), 9002);
        assert!(ports.lease("b").is_err());
    }

    #[test]
    fn confirm_and_release_check_holder() {
        let ports = allocator(9000, 9000, ScriptedProbe::default());
        let lease = ports.lease("a").unwrap();
        let port = lease.detach();

        assert!(ports.confirm(port, "b").is_err());
        ports.confirm(port, "a").unwrap();
        assert_eq!(ports.lease_on(port).unwrap().state, LeaseState::Confirmed);

        assert!(!ports.release(port, "b"));
        assert!(ports.release(port, "a"));
        assert!(!ports.release(port, "a"));
        assert!(ports.snapshot().is_empty());
    }

    #[test]
    fn dropping_guard_releases() {
        let ports = allocator(9000, 9000, ScriptedProbe::default());
        {
            let mut lease = ports.lease("a").unwrap();
            lease.confirm().unwrap();
            assert_eq!(lease.state(), LeaseState::Confirmed);
        }
        assert!(ports.snapshot().is_empty());
        assert!(ports.lease_in(9000, 9000, "b").is_ok());
    }

    #[test]
    fn stale_guard_does_not_release_new_holder() {
        let ports = allocator(9000, 9000, ScriptedProbe::default());
        let port = ports.lease("a").unwrap().detach();
        assert!(ports.release(port, "a"));
        let _b = ports.lease("b").unwrap();
        assert!(!ports.release(port, "a"));
        assert_eq!(ports.lease_on(port).unwrap().holder, "b");
    }

    #[test]
    fn concurrent_leases_are_distinct() {
        let ports = allocator(9100, 9107, ScriptedProbe::default());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || {
                    ports.lease(format!("holder-{i}")).ok().map(|mut lease| {
                        lease.confirm().unwrap();
                        lease.detach()
                    })
                })
            })
            .collect();

        let leased: Vec<u16> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        let distinct: HashSet<u16> = leased.iter().copied().collect();

        assert_eq!(leased.len(), 8);
        assert_eq!(distinct.len(), 8);
        assert!(ports
            .snapshot()
            .iter()
            .all(|lease| lease.state == LeaseState::Confirmed));
    }

    #[test]
    fn tcp_probe_sees_bound_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(
            TcpBindProbe.probe(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            ProbeOutcome::InUse
        );
        drop(listener);
    }
}
