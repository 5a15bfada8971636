//! A dynamic collection of [`Link`]s forming one vehicle.

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use polling::{Event, Poller};
use rc_proto::{Inbound, Outbound};
use tracing::warn;

use crate::error::LinkError;
use crate::link::Link;

/// Outcome of [`Connection::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// No bytes arrived on any link within the deadline.
    NoData,
    /// These link indices have bytes ready to [`Connection::recv`].
    Ready(Vec<usize>),
}

/// Waits up to `timeout` for any of `fds` to become readable. Takes bare
/// file descriptors rather than a `&Connection` so a caller can release the
/// lock guarding `Connection` before blocking on this call.
pub fn poll_fds(fds: &[(usize, RawFd)], timeout: Duration) -> Result<PollOutcome, LinkError> {
    if fds.is_empty() {
        return Err(LinkError::Io {
            path: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "no open links"),
        });
    }

    let poller = Poller::new().map_err(|e| LinkError::Io { path: String::new(), source: e })?;
    for (key, &(_, fd)) in fds.iter().enumerate() {
        // SAFETY: the caller guarantees every fd in `fds` stays open and
        // valid for the duration of this call; nothing is deregistered
        // because `poller` is dropped at the end of the function.
        unsafe {
            poller
                .add(fd, Event::readable(key))
                .map_err(|e| LinkError::Io { path: String::new(), source: e })?;
        }
    }

    let mut events = Vec::new();
    poller
        .wait(&mut events, Some(timeout))
        .map_err(|e| LinkError::Io { path: String::new(), source: e })?;

    if events.is_empty() {
        return Ok(PollOutcome::NoData);
    }

    let ready = events.iter().map(|ev| fds[ev.key].0).collect();
    Ok(PollOutcome::Ready(ready))
}

/// The set of [`Link`]s that together make up one vehicle's connection to
/// its flight board(s).
#[derive(Default)]
pub struct Connection {
    links: Vec<Link>,
}

impl Connection {
    pub fn new() -> Self {
        Connection { links: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.links.iter().all(|l| !l.is_open())
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut [Link] {
        &mut self.links
    }

    pub fn link(&self, idx: usize) -> Option<&Link> {
        self.links.get(idx)
    }

    /// Adds a link, enforcing the connection-wide invariants: at most one
    /// enabled link per `imu`/`mag` capability, and pairwise-disjoint motor
    /// ranges. Grows the backing vector first, then commits the new link,
    /// so a failed invariant check never leaves `self` partially mutated.
    pub fn add_link(&mut self, link: Link) -> Result<usize, LinkError> {
        if link.imu && self.links.iter().any(|l| l.imu) {
            return Err(LinkError::BadDevice {
                path: link.path.clone(),
                reason: "an IMU-capable link is already open".into(),
            });
        }
        if link.mag && self.links.iter().any(|l| l.mag) {
            return Err(LinkError::BadDevice {
                path: link.path.clone(),
                reason: "a magnetometer-capable link is already open".into(),
            });
        }
        if let Some((min, max)) = link.motor_range {
            for existing in self.links.iter() {
                if let Some((emin, emax)) = existing.motor_range {
                    if min <= emax && emin <= max {
                        return Err(LinkError::BadDevice {
                            path: link.path.clone(),
                            reason: format!(
                                "motor range [{min},{max}] overlaps existing link's [{emin},{emax}]"
                            ),
                        });
                    }
                }
            }
        }
        if let Some(id) = link.os_identity() {
            if let Some(dup) = self.links.iter().find(|l| l.os_identity() == Some(id)) {
                return Err(LinkError::AlreadyOpen {
                    path: link.path.clone(),
                    other_path: dup.path.clone(),
                });
            }
        }

        self.links.reserve(1);
        self.links.push(link);
        Ok(self.links.len() - 1)
    }

    pub fn remove_link(&mut self, idx: usize) -> Option<Link> {
        if idx < self.links.len() {
            let mut link = self.links.remove(idx);
            link.close();
            Some(link)
        } else {
            None
        }
    }

    /// Snapshots the (link index, raw fd) pairs of every currently open
    /// link. Callers that must not hold `Connection` across a blocking wait
    /// (e.g. the `comm` task, which polls off a shared lock) take this
    /// snapshot, drop their reference to `Connection`, and hand the fd list
    /// to [`poll_fds`].
    pub fn open_fds(&self) -> Vec<(usize, RawFd)> {
        self.links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_open())
            .map(|(i, l)| (i, l.as_raw_fd()))
            .collect()
    }

    /// Waits up to `timeout` for bytes to become available on any open
    /// link.
    pub fn poll(&self, timeout: Duration) -> Result<PollOutcome, LinkError> {
        poll_fds(&self.open_fds(), timeout)
    }

    /// Drains every pending frame from the given link indices.
    pub fn recv(&mut self, ready: &[usize]) -> Vec<(usize, Inbound)> {
        let mut out = Vec::new();
        for &idx in ready {
            if let Some(link) = self.links.get_mut(idx) {
                for msg in link.drain() {
                    out.push((idx, msg));
                }
            }
        }
        out
    }

    /// Sends `msg` to every open link.
    pub fn broadcast(&mut self, msg: &Outbound) {
        for link in self.links.iter_mut().filter(|l| l.is_open()) {
            if let Err(e) = link.send(msg) {
                warn!(path = %link.path, error = %e, "broadcast send failed");
            }
        }
    }

    /// Sends `msg` only to links carrying the given capability, selected by
    /// `pred`.
    pub fn send_where(&mut self, msg: &Outbound, pred: impl Fn(&Link) -> bool) {
        for link in self.links.iter_mut().filter(|l| l.is_open() && pred(l)) {
            if let Err(e) = link.send(msg) {
                warn!(path = %link.path, error = %e, "send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, DeviceSpec};

    fn fake_link(path: &str, imu: bool, mag: bool, motor_range: Option<(u8, u8)>) -> Link {
        // Constructed out of band for testing; mirrors the private fields of
        // `Link` via its test-only constructor in `link.rs`.
        crate::link::Link::new_for_test(path, imu, mag, motor_range)
    }

    #[test]
    fn rejects_second_imu_capable_link() {
        let mut conn = Connection::new();
        conn.add_link(fake_link("a", true, false, None)).unwrap();
        assert!(conn.add_link(fake_link("b", true, false, None)).is_err());
    }

    #[test]
    fn rejects_overlapping_motor_ranges() {
        let mut conn = Connection::new();
        conn.add_link(fake_link("a", false, false, Some((1, 4)))).unwrap();
        assert!(conn.add_link(fake_link("b", false, false, Some((4, 6)))).is_err());
        assert!(conn.add_link(fake_link("c", false, false, Some((5, 8)))).is_ok());
    }
}
