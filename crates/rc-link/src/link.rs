//! A single open serial connection to one flight-board microcontroller.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use rc_proto::{encode_frame, CodecError, Framer, Inbound, Outbound};
use serialport::TTYPort;
use tracing::{debug, warn};

use crate::device::{identify, DeviceKind, DeviceSpec};
use crate::error::LinkError;

/// Maximum size of a single reassembled payload before framing gives up and
/// resyncs. Generous relative to the largest known inbound frame (16 bytes).
const MAX_FRAME_LEN: usize = 256;

const HANDSHAKE_ATTEMPTS: u32 = 3;
const HANDSHAKE_DEADLINE: Duration = Duration::from_millis(500);

/// One open link to a board, plus everything negotiated during its
/// handshake.
pub struct Link {
    pub path: String,
    port: Option<TTYPort>,
    os_identity: Option<(u64, u64)>,
    pub device: Option<(DeviceKind, DeviceSpec)>,
    pub imu: bool,
    pub mag: bool,
    pub motor: bool,
    /// Inclusive global rotor-id range this link's motors occupy.
    pub motor_range: Option<(u8, u8)>,
    framer: Framer,
}

impl Link {
    /// Opens `path` at `baud`, configures 8N1 raw mode, and runs the
    /// identify handshake.
    pub fn open(path: &str, baud: u32, imu: bool, mag: bool, motor_range: Option<(u8, u8)>) -> Result<Link, LinkError> {
        let mut port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(HANDSHAKE_DEADLINE)
            .open_native()
            .map_err(|e| LinkError::Io { path: path.to_string(), source: e.into() })?;

        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| LinkError::Io { path: path.to_string(), source: e.into() })?;

        let os_identity = os_identity_of(path).ok();

        let (kind, spec, rev) = Self::handshake(&mut port, path)?;
        debug!(path, ?kind, rev, "handshake complete");

        Ok(Link {
            path: path.to_string(),
            port: Some(port),
            os_identity,
            device: Some((kind, spec)),
            imu,
            mag,
            motor: motor_range.is_some(),
            motor_range,
            framer: Framer::new(MAX_FRAME_LEN),
        })
    }

    fn handshake(port: &mut TTYPort, path: &str) -> Result<(DeviceKind, DeviceSpec, f64), LinkError> {
        let mut framer = Framer::new(MAX_FRAME_LEN);
        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            let frame = encode_frame(&Outbound::Identify.encode());
            port.write_all(&frame)
                .map_err(|e| LinkError::Io { path: path.to_string(), source: e })?;

            let deadline = Instant::now() + HANDSHAKE_DEADLINE;
            let mut buf = [0u8; 64];
            while Instant::now() < deadline {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        for payload in framer.push_all(&buf[..n]) {
                            if let Ok(Inbound::Identity(text)) = Inbound::decode(&payload) {
                                return identify(&text).map(|(k, s, r)| (k, s, r)).map_err(|e| {
                                    LinkError::BadDevice { path: path.to_string(), reason: e.into() }
                                });
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(LinkError::Io { path: path.to_string(), source: e }),
                }
            }
            warn!(path, attempt, "no identity reply yet");
        }
        Err(LinkError::NoReply { path: path.to_string(), attempts: HANDSHAKE_ATTEMPTS })
    }

    pub fn os_identity(&self) -> Option<(u64, u64)> {
        self.os_identity
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn close(&mut self) {
        self.port = None;
    }

    pub fn send(&mut self, msg: &Outbound) -> Result<(), LinkError> {
        let port = self.port.as_mut().ok_or_else(|| LinkError::Io {
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "link closed"),
        })?;
        let frame = encode_frame(&msg.encode());
        port.write_all(&frame).map_err(|e| LinkError::Io { path: self.path.clone(), source: e })
    }

    /// Reads whatever bytes are currently available and returns every
    /// complete frame recognized, decoded. Malformed frames are logged and
    /// dropped rather than propagated, per the wire protocol's tolerance for
    /// unrecognized lengths/tags.
    pub fn drain(&mut self) -> Vec<Inbound> {
        let path = self.path.clone();
        let Some(port) = self.port.as_mut() else { return Vec::new() };

        let mut buf = [0u8; 256];
        let mut out = Vec::new();
        loop {
            match port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for payload in self.framer.push_all(&buf[..n]) {
                        match Inbound::decode(&payload) {
                            Ok(msg) => out.push(msg),
                            Err(CodecError::UnknownTag(t)) => {
                                warn!(path = %path, tag = t, "dropping frame with unknown tag")
                            }
                            Err(e) => warn!(path = %path, error = %e, "dropping malformed frame"),
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => {
                    warn!(path = %path, error = %e, "read error, closing link");
                    self.port = None;
                    break;
                }
            }
        }
        out
    }

    /// Resolves a motor frame's local id (low nibble of `state`) into the
    /// global rotor id this link is responsible for, or `None` if it falls
    /// outside this link's assigned range.
    pub fn resolve_motor_id(&self, state: u8) -> Option<u8> {
        self.meta().resolve_motor_id(state)
    }

    /// A lightweight, `Copy`able snapshot of this link's identity and
    /// capabilities, for consumers (like `SensorPipeline`) that only need to
    /// know what the link is, not hold the open file descriptor itself.
    pub fn meta(&self) -> LinkMeta {
        LinkMeta { device: self.device, motor_range: self.motor_range }
    }
}

/// See [`Link::meta`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkMeta {
    pub device: Option<(DeviceKind, DeviceSpec)>,
    pub motor_range: Option<(u8, u8)>,
}

impl LinkMeta {
    pub fn resolve_motor_id(&self, state: u8) -> Option<u8> {
        let (minid, maxid) = self.motor_range?;
        let local = state & 0x0F;
        let global = minid.checked_sub(1)?.checked_add(local)?;
        if global >= minid && global <= maxid {
            Some(global)
        } else {
            None
        }
    }
}

impl AsRawFd for Link {
    fn as_raw_fd(&self) -> RawFd {
        self.port.as_ref().map(|p| p.as_raw_fd()).unwrap_or(-1)
    }
}

fn os_identity_of(path: &str) -> std::io::Result<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

#[cfg(test)]
impl Link {
    /// Builds a `Link` with no backing file descriptor, for tests that only
    /// exercise routing/invariant logic.
    pub(crate) fn new_for_test(path: &str, imu: bool, mag: bool, motor_range: Option<(u8, u8)>) -> Link {
        Link {
            path: path.to_string(),
            port: None,
            os_identity: None,
            device: None,
            imu,
            mag,
            motor: motor_range.is_some(),
            motor_range,
            framer: Framer::new(MAX_FRAME_LEN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, DeviceSpec};

    fn fake_spec() -> DeviceSpec {
        DeviceSpec {
            prefix: "chimera",
            min_rev: 1.1,
            gyro_res: 0.00106,
            accel_res: 0.00239,
            mag_res: 0.00000015,
            temp: Some((0.01, 0.0)),
            supports_pid: false,
        }
    }

    fn fake_link(motor_range: Option<(u8, u8)>) -> Link {
        Link {
            path: "test".into(),
            port: None,
            os_identity: None,
            device: Some((DeviceKind::Chimera, fake_spec())),
            imu: true,
            mag: false,
            motor: motor_range.is_some(),
            motor_range,
            framer: Framer::new(MAX_FRAME_LEN),
        }
    }

    #[test]
    fn motor_id_routing_stays_within_assigned_range() {
        let link = fake_link(Some((5, 8)));
        // local id 0 -> global 5, local id 3 -> global 8
        assert_eq!(link.resolve_motor_id(0x00), Some(5));
        assert_eq!(link.resolve_motor_id(0x83), Some(8)); // high bits (emerg flag) ignored
        assert_eq!(link.resolve_motor_id(0x04), None); // local id 4 -> global 9, out of range
    }

    #[test]
    fn motor_id_routing_without_capability_is_none() {
        let link = fake_link(None);
        assert_eq!(link.resolve_motor_id(0x00), None);
    }
}
