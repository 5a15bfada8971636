//! Typed outbound commands and inbound board frames.

use crate::codec::{get_i16, get_u16, put_array_i16, put_i16, put_u16, put_u32, put_u8};
use crate::error::CodecError;

/// Host → board commands.
///
/// Each variant knows its own tag byte and how to serialize its arguments,
/// following the format grammar in the protocol notes (`%1 %2 %4 %@`).
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    BatteryPeriodUs(u32),
    MotorPeriodUs(u32),
    ImuPeriodUs(u32),
    MagPeriodUs(u32),
    EmergencyStopAll,
    EmergencyStopOne(u8),
    StartMotor(u8),
    /// Per-motor half-period commands, `w%@`.
    Velocity(Vec<i16>),
    /// Per-motor throttle commands in `-1023..=1023`, `q%@`.
    Throttle(Vec<i16>),
    SetPid {
        motor: u8,
        kp: u16,
        ki: u16,
        kd: u16,
        f: u16,
    },
    Identify,
    Beep { freq_hz: u16 },
}

impl Outbound {
    pub fn tag(&self) -> u8 {
        match self {
            Outbound::BatteryPeriodUs(_) => b'b',
            Outbound::MotorPeriodUs(_) => b'm',
            Outbound::ImuPeriodUs(_) => b'i',
            Outbound::MagPeriodUs(_) => b'c',
            Outbound::EmergencyStopAll | Outbound::EmergencyStopOne(_) => b'x',
            Outbound::StartMotor(_) => b'g',
            Outbound::Velocity(_) => b'w',
            Outbound::Throttle(_) => b'q',
            Outbound::SetPid { .. } => b'%',
            Outbound::Identify => b'?',
            Outbound::Beep { .. } => b'~',
        }
    }

    /// Encodes tag + arguments into a message payload (unframed).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.tag()];
        match self {
            Outbound::BatteryPeriodUs(p)
            | Outbound::MotorPeriodUs(p)
            | Outbound::ImuPeriodUs(p)
            | Outbound::MagPeriodUs(p) => put_u32(&mut buf, *p),
            Outbound::EmergencyStopAll => {}
            Outbound::EmergencyStopOne(id) => put_u8(&mut buf, *id),
            Outbound::StartMotor(id) => put_u8(&mut buf, *id),
            Outbound::Velocity(v) | Outbound::Throttle(v) => put_array_i16(&mut buf, v),
            Outbound::SetPid { motor, kp, ki, kd, f } => {
                put_u8(&mut buf, *motor);
                put_u16(&mut buf, *kp);
                put_u16(&mut buf, *ki);
                put_u16(&mut buf, *kd);
                put_u16(&mut buf, *f);
            }
            Outbound::Identify => {}
            Outbound::Beep { freq_hz } => put_u16(&mut buf, *freq_hz),
        }
        buf
    }
}

/// Board → host frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Imu {
        seq: u8,
        accel: [i16; 3],
        gyro: [i16; 3],
        temp: Option<i16>,
    },
    Mag {
        seq: u8,
        mag: [i16; 3],
    },
    Motor {
        seq: u8,
        state: u8,
        velocity: i16,
        throttle: i16,
        consumption: u16,
    },
    Battery {
        seq: u8,
        level_mv: u16,
    },
    Clkrate {
        local_id: u8,
        clkrate: u8,
    },
    Identity(String),
}

impl Inbound {
    /// Decodes a complete, unescaped message payload (tag byte included).
    pub fn decode(payload: &[u8]) -> Result<Inbound, CodecError> {
        let &tag = payload.first().ok_or(CodecError::Empty)?;
        let body = &payload[1..];
        match tag {
            b'I' => {
                if body.len() != 13 && body.len() != 15 {
                    return Err(CodecError::BadLength {
                        tag,
                        expected: 14,
                        got: payload.len(),
                    });
                }
                let seq = body[0];
                let accel = [get_i16(body, 1), get_i16(body, 3), get_i16(body, 5)];
                let gyro = [get_i16(body, 7), get_i16(body, 9), get_i16(body, 11)];
                let temp = if body.len() == 15 {
                    Some(get_i16(body, 13))
                } else {
                    None
                };
                Ok(Inbound::Imu { seq, accel, gyro, temp })
            }
            b'C' => {
                if body.len() != 7 {
                    return Err(CodecError::BadLength { tag, expected: 8, got: payload.len() });
                }
                let seq = body[0];
                let mag = [get_i16(body, 1), get_i16(body, 3), get_i16(body, 5)];
                Ok(Inbound::Mag { seq, mag })
            }
            b'M' => {
                if body.len() != 8 {
                    return Err(CodecError::BadLength { tag, expected: 9, got: payload.len() });
                }
                Ok(Inbound::Motor {
                    seq: body[0],
                    state: body[1],
                    velocity: get_i16(body, 2),
                    throttle: get_i16(body, 4),
                    consumption: get_u16(body, 6),
                })
            }
            b'B' => {
                if body.len() != 3 {
                    return Err(CodecError::BadLength { tag, expected: 4, got: payload.len() });
                }
                Ok(Inbound::Battery {
                    seq: body[0],
                    level_mv: get_u16(body, 1),
                })
            }
            b'T' => {
                if body.len() != 2 {
                    return Err(CodecError::BadLength { tag, expected: 3, got: payload.len() });
                }
                Ok(Inbound::Clkrate {
                    local_id: body[0],
                    clkrate: body[1],
                })
            }
            b'?' => Ok(Inbound::Identity(String::from_utf8_lossy(body).into_owned())),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, Framer};

    fn round_trip(out: &Outbound) -> Vec<u8> {
        let payload = out.encode();
        let frame = encode_frame(&payload);
        let mut framer = Framer::new(256);
        let mut got = None;
        for b in frame {
            if let Some(p) = framer.push(b) {
                got = Some(p);
            }
        }
        got.expect("frame recognized")
    }

    #[test]
    fn velocity_command_round_trips_through_framing() {
        let out = Outbound::Velocity(vec![5000, -5000, 32767, -32767]);
        let payload = round_trip(&out);
        assert_eq!(payload, out.encode());
    }

    #[test]
    fn set_pid_round_trips() {
        let out = Outbound::SetPid {
            motor: 3,
            kp: 10_000,
            ki: 500,
            kd: 25,
            f: 1,
        };
        let payload = round_trip(&out);
        assert_eq!(payload, out.encode());
    }

    #[test]
    fn imu_frame_without_temperature() {
        let mut payload = vec![b'I', 7];
        for v in [100i16, -200, 300, 1, 2, 3] {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        let decoded = Inbound::decode(&payload).unwrap();
        assert_eq!(
            decoded,
            Inbound::Imu {
                seq: 7,
                accel: [100, -200, 300],
                gyro: [1, 2, 3],
                temp: None,
            }
        );
    }

    #[test]
    fn imu_frame_with_temperature() {
        let mut payload = vec![b'I', 7];
        for v in [100i16, -200, 300, 1, 2, 3, 2500] {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        let decoded = Inbound::decode(&payload).unwrap();
        assert_eq!(
            decoded,
            Inbound::Imu {
                seq: 7,
                accel: [100, -200, 300],
                gyro: [1, 2, 3],
                temp: Some(2500),
            }
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(Inbound::decode(&[b'Z', 1, 2]), Err(CodecError::UnknownTag(b'Z')));
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(matches!(
            Inbound::decode(&[b'B', 1, 2]),
            Err(CodecError::BadLength { tag: b'B', .. })
        ));
    }
}
