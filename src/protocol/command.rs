//! Register write commands.
//!
//! The sensor is configured by writing 16-bit register values:
//! `FF AA <reg> <lo> <hi>`. Writes are only accepted after the unlock key has
//! been written, and are persisted by a write to the save register.
//!
//! The pipeline never sends these itself; they are the primitive shared with
//! the external configuration service.

/// Command prefix.
pub const COMMAND_PREFIX: [u8; 2] = [0xFF, 0xAA];

/// Save configuration (value 0 = save, 1 = factory reset).
pub const REG_SAVE: u8 = 0x00;
/// Output content bit mask.
pub const REG_RSW: u8 = 0x02;
/// Output rate code.
pub const REG_RRATE: u8 = 0x03;
/// Baud rate code.
pub const REG_BAUD: u8 = 0x04;
/// Unlock register.
pub const REG_KEY: u8 = 0x69;

/// Value written to [`REG_KEY`] to accept configuration writes.
pub const UNLOCK_KEY: u16 = 0xB588;

/// Bits of the output content register.
pub mod rsw {
    pub const TIME: u16 = 1 << 0;
    pub const ACC: u16 = 1 << 1;
    pub const GYRO: u16 = 1 << 2;
    pub const ANGLE: u16 = 1 << 3;
    pub const MAG: u16 = 1 << 4;
    pub const PORT: u16 = 1 << 5;
    pub const PRESS: u16 = 1 << 6;
    pub const GPS: u16 = 1 << 7;
    pub const VELOCITY: u16 = 1 << 8;
    pub const QUATER: u16 = 1 << 9;
    pub const GSA: u16 = 1 << 10;
}

/// Output rate register codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OutputRate {
    Hz0_2 = 0x01,
    Hz0_5 = 0x02,
    Hz1 = 0x03,
    Hz2 = 0x04,
    Hz5 = 0x05,
    Hz10 = 0x06,
    Hz20 = 0x07,
    Hz50 = 0x08,
    Hz100 = 0x09,
    Hz125 = 0x0A,
    Hz200 = 0x0B,
    Single = 0x0C,
    Off = 0x0D,
}

/// Register code for a baud rate, if the device supports it.
pub fn baud_code(baud: u32) -> Option<u16> {
    let code = match baud {
        4800 => 0x01,
        9600 => 0x02,
        19200 => 0x03,
        38400 => 0x04,
        57600 => 0x05,
        115_200 => 0x06,
        230_400 => 0x07,
        460_800 => 0x08,
        921_600 => 0x09,
        _ => return None,
    };
    Some(code)
}

/// A single register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCommand {
    pub register: u8,
    pub value: u16,
}

impl WriteCommand {
    pub fn new(register: u8, value: u16) -> Self {
        Self { register, value }
    }

    pub fn unlock() -> Self {
        Self::new(REG_KEY, UNLOCK_KEY)
    }

    pub fn save() -> Self {
        Self::new(REG_SAVE, 0x0000)
    }

    pub fn output_rate(rate: OutputRate) -> Self {
        Self::new(REG_RRATE, rate as u16)
    }

    pub fn output_content(mask: u16) -> Self {
        Self::new(REG_RSW, mask)
    }

    /// Wire bytes for this command.
    pub fn encode(&self) -> [u8; 5] {
        let [lo, hi] = self.value.to_le_bytes();
        [COMMAND_PREFIX[0], COMMAND_PREFIX[1], self.register, lo, hi]
    }
}

/// Unlock, apply `writes`, then save.
pub fn configure_sequence(writes: &[WriteCommand]) -> Vec<WriteCommand> {
    let mut sequence = Vec::with_capacity(writes.len() + 2);
    sequence.push(WriteCommand::unlock());
    sequence.extend_from_slice(writes);
    sequence.push(WriteCommand::save());
    sequence
}
