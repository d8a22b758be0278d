//! Typed packets and their per-type decode routines.
//!
//! Payload structs keep the device's fixed-point words so that decoding and
//! re-encoding is lossless; accessor methods apply the physical scale.

use super::frame::{dword, encode_frame, pack_words, word, FRAME_LEN, PAYLOAD_LEN};
use serde::Serialize;

/// Full-scale acceleration in g.
pub const ACC_RANGE_G: f64 = 16.0;
/// Full-scale angular velocity in °/s.
pub const GYRO_RANGE_DPS: f64 = 2000.0;
/// Full-scale angle in degrees.
pub const ANGLE_RANGE_DEG: f64 = 180.0;
/// Fixed-point denominator shared by the inertial fields.
pub const FULL_SCALE: f64 = 32768.0;
/// Temperature words are hundredths of a degree.
pub const TEMPERATURE_SCALE: f64 = 100.0;

/// Packet type bytes with a decode routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum PacketKind {
    /// On-chip clock
    Time = 0x50,
    /// Linear acceleration
    Acceleration = 0x51,
    /// Angular velocity
    AngularVelocity = 0x52,
    /// Euler angles
    Angle = 0x53,
    /// Magnetometer
    MagneticField = 0x54,
    /// Digital port levels
    PortStatus = 0x55,
    /// Barometer
    Pressure = 0x56,
    /// GPS longitude/latitude
    GpsPosition = 0x57,
    /// GPS ground speed, altitude, heading
    GpsSpeed = 0x58,
    /// Orientation quaternion
    Quaternion = 0x59,
    /// GPS satellites and dilution of precision
    GpsAccuracy = 0x5A,
    /// Response to a register read command
    RegisterRead = 0x5F,
}

impl PacketKind {
    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Time => "TIME",
            PacketKind::Acceleration => "ACCELERATION",
            PacketKind::AngularVelocity => "ANGULAR_VELOCITY",
            PacketKind::Angle => "ANGLE",
            PacketKind::MagneticField => "MAGNETIC_FIELD",
            PacketKind::PortStatus => "PORT_STATUS",
            PacketKind::Pressure => "PRESSURE_HEIGHT",
            PacketKind::GpsPosition => "GPS_LON_LAT",
            PacketKind::GpsSpeed => "GPS_SPEED",
            PacketKind::Quaternion => "QUATERNION",
            PacketKind::GpsAccuracy => "GPS_ACCURACY",
            PacketKind::RegisterRead => "READ_REGISTER_RESPONSE",
        }
    }
}

/// On-chip date and time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub millisecond: u16,
}

/// Three fixed-point axis words plus the temperature word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AxisTriple {
    /// Raw x, y, z words
    pub raw: [i16; 3],
    /// Raw temperature word (hundredths of °C)
    pub raw_temperature: i16,
}

impl AxisTriple {
    fn from_payload(payload: &[u8; PAYLOAD_LEN]) -> Self {
        Self {
            raw: [word(payload, 0), word(payload, 1), word(payload, 2)],
            raw_temperature: word(payload, 3),
        }
    }

    fn to_payload(self) -> [u8; PAYLOAD_LEN] {
        pack_words([self.raw[0], self.raw[1], self.raw[2], self.raw_temperature])
    }

    fn scaled(&self, range: f64) -> [f64; 3] {
        self.raw.map(|r| r as f64 / FULL_SCALE * range)
    }

    /// On-chip temperature in °C.
    pub fn temperature_c(&self) -> f64 {
        self.raw_temperature as f64 / TEMPERATURE_SCALE
    }
}

/// Linear acceleration frame (type 0x51).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Acceleration(pub AxisTriple);

impl Acceleration {
    /// Build from physical values, rounding to the nearest fixed-point word.
    pub fn from_g(x: f64, y: f64, z: f64, temperature_c: f64) -> Self {
        let to_raw = |g: f64| {
            (g / ACC_RANGE_G * FULL_SCALE)
                .round()
                .clamp(i16::MIN as f64, i16::MAX as f64) as i16
        };
        Acceleration(AxisTriple {
            raw: [to_raw(x), to_raw(y), to_raw(z)],
            raw_temperature: (temperature_c * TEMPERATURE_SCALE)
                .round()
                .clamp(i16::MIN as f64, i16::MAX as f64) as i16,
        })
    }

    /// Acceleration per axis in g.
    pub fn g(&self) -> [f64; 3] {
        self.0.scaled(ACC_RANGE_G)
    }

    /// On-chip temperature in °C.
    pub fn temperature_c(&self) -> f64 {
        self.0.temperature_c()
    }

    /// Encode back into a complete frame.
    pub fn to_frame(&self) -> [u8; FRAME_LEN] {
        encode_frame(PacketKind::Acceleration as u8, &self.0.to_payload())
    }
}

/// Encode an acceleration packet into a complete frame.
pub fn encode_acceleration(acc: &Acceleration) -> [u8; FRAME_LEN] {
    acc.to_frame()
}

/// Angular velocity frame (type 0x52).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AngularVelocity(pub AxisTriple);

impl AngularVelocity {
    /// Angular velocity per axis in °/s.
    pub fn deg_per_s(&self) -> [f64; 3] {
        self.0.scaled(GYRO_RANGE_DPS)
    }
}

/// Euler angle frame (type 0x53).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Angle(pub AxisTriple);

impl Angle {
    /// Roll, pitch, yaw in degrees.
    pub fn degrees(&self) -> [f64; 3] {
        self.0.scaled(ANGLE_RANGE_DEG)
    }
}

/// Magnetometer frame (type 0x54); axis values stay in LSB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MagneticField(pub AxisTriple);

/// Barometer frame (type 0x56).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pressure {
    /// Pressure in Pa
    pub pressure_pa: u32,
    /// Height in decimetres
    pub raw_height: u32,
}

impl Pressure {
    /// Barometric height in metres.
    pub fn height_m(&self) -> f64 {
        self.raw_height as f64 / 10.0
    }
}

/// GPS-derived frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum GpsData {
    /// Type 0x57, degrees
    Position { longitude: f64, latitude: f64 },
    /// Type 0x58
    Speed {
        /// km/h
        ground_speed_kmh: f64,
        /// metres
        altitude_m: f64,
        /// degrees
        heading_deg: f64,
    },
    /// Type 0x5A
    Accuracy {
        satellites: i16,
        pdop: f64,
        hdop: f64,
        vdop: f64,
    },
}

/// A checksum-verified, typed packet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum DecodedPacket {
    /// Type 0x50
    Time(DeviceTime),
    /// Type 0x51
    Acceleration(Acceleration),
    /// Type 0x52
    AngularVelocity(AngularVelocity),
    /// Type 0x53
    Angle(Angle),
    /// Type 0x54
    MagneticField(MagneticField),
    /// Type 0x55, four port words
    PortStatus([i16; 4]),
    /// Type 0x56
    Pressure(Pressure),
    /// Types 0x57, 0x58, 0x5A
    Gps(GpsData),
    /// Type 0x59, components in [-1, 1]
    Quaternion([f64; 4]),
    /// Type 0x5F, four register words
    RegisterRead([i16; 4]),
    /// Data-range type with no decode routine; payload kept verbatim
    Other { kind: u8, payload: [u8; PAYLOAD_LEN] },
}

impl DecodedPacket {
    /// Type byte this packet was decoded from.
    pub fn kind_byte(&self) -> u8 {
        match self {
            DecodedPacket::Time(_) => PacketKind::Time as u8,
            DecodedPacket::Acceleration(_) => PacketKind::Acceleration as u8,
            DecodedPacket::AngularVelocity(_) => PacketKind::AngularVelocity as u8,
            DecodedPacket::Angle(_) => PacketKind::Angle as u8,
            DecodedPacket::MagneticField(_) => PacketKind::MagneticField as u8,
            DecodedPacket::PortStatus(_) => PacketKind::PortStatus as u8,
            DecodedPacket::Pressure(_) => PacketKind::Pressure as u8,
            DecodedPacket::Gps(GpsData::Position { .. }) => PacketKind::GpsPosition as u8,
            DecodedPacket::Gps(GpsData::Speed { .. }) => PacketKind::GpsSpeed as u8,
            DecodedPacket::Gps(GpsData::Accuracy { .. }) => PacketKind::GpsAccuracy as u8,
            DecodedPacket::Quaternion(_) => PacketKind::Quaternion as u8,
            DecodedPacket::RegisterRead(_) => PacketKind::RegisterRead as u8,
            DecodedPacket::Other { kind, .. } => *kind,
        }
    }
}

/// Decode routine for one packet type.
pub type DecodeFn = fn(&[u8; PAYLOAD_LEN]) -> DecodedPacket;

/// Type byte → decode routine. Adding a packet type is an entry here.
pub const DECODE_TABLE: &[(PacketKind, DecodeFn)] = &[
    (PacketKind::Time, decode_time),
    (PacketKind::Acceleration, decode_acceleration),
    (PacketKind::AngularVelocity, decode_angular_velocity),
    (PacketKind::Angle, decode_angle),
    (PacketKind::MagneticField, decode_magnetic_field),
    (PacketKind::PortStatus, decode_port_status),
    (PacketKind::Pressure, decode_pressure),
    (PacketKind::GpsPosition, decode_gps_position),
    (PacketKind::GpsSpeed, decode_gps_speed),
    (PacketKind::Quaternion, decode_quaternion),
    (PacketKind::GpsAccuracy, decode_gps_accuracy),
    (PacketKind::RegisterRead, decode_register_read),
];

impl TryFrom<u8> for PacketKind {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        DECODE_TABLE
            .iter()
            .map(|(k, _)| *k)
            .find(|k| *k as u8 == byte)
            .ok_or(byte)
    }
}

/// Look up the routine for a type byte.
pub fn decode_routine(kind: u8) -> Option<DecodeFn> {
    DECODE_TABLE
        .iter()
        .find(|(k, _)| *k as u8 == kind)
        .map(|(_, f)| *f)
}

fn words4(payload: &[u8; PAYLOAD_LEN]) -> [i16; 4] {
    [
        word(payload, 0),
        word(payload, 1),
        word(payload, 2),
        word(payload, 3),
    ]
}

fn decode_time(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::Time(DeviceTime {
        year: 2000 + p[0] as u16,
        month: p[1],
        day: p[2],
        hour: p[3],
        minute: p[4],
        second: p[5],
        millisecond: u16::from_le_bytes([p[6], p[7]]),
    })
}

fn decode_acceleration(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::Acceleration(Acceleration(AxisTriple::from_payload(p)))
}

fn decode_angular_velocity(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::AngularVelocity(AngularVelocity(AxisTriple::from_payload(p)))
}

fn decode_angle(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::Angle(Angle(AxisTriple::from_payload(p)))
}

fn decode_magnetic_field(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::MagneticField(MagneticField(AxisTriple::from_payload(p)))
}

fn decode_port_status(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::PortStatus(words4(p))
}

fn decode_pressure(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::Pressure(Pressure {
        pressure_pa: dword(p, 0),
        raw_height: dword(p, 1),
    })
}

fn decode_gps_position(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::Gps(GpsData::Position {
        longitude: dword(p, 0) as f64 / 1e7,
        latitude: dword(p, 1) as f64 / 1e7,
    })
}

fn decode_gps_speed(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::Gps(GpsData::Speed {
        ground_speed_kmh: dword(p, 0) as f64 / 1000.0,
        altitude_m: word(p, 2) as f64 / 10.0,
        heading_deg: word(p, 3) as f64 / 100.0,
    })
}

fn decode_quaternion(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::Quaternion(words4(p).map(|w| w as f64 / FULL_SCALE))
}

fn decode_gps_accuracy(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::Gps(GpsData::Accuracy {
        satellites: word(p, 0),
        pdop: word(p, 1) as f64 / 100.0,
        hdop: word(p, 2) as f64 / 100.0,
        vdop: word(p, 3) as f64 / 100.0,
    })
}

fn decode_register_read(p: &[u8; PAYLOAD_LEN]) -> DecodedPacket {
    DecodedPacket::RegisterRead(words4(p))
}
