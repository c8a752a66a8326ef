use std::time::Duration;

use rusb::{DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use rust_embed::RustEmbed;

use crate::{Error, Result};

// OV534 bridge registers used to proxy SCCB traffic to the sensor
pub(crate) const REG_ADDRESS: u8 = 0xf1;
pub(crate) const REG_SUBADDR: u8 = 0xf2;
pub(crate) const REG_WRITE: u8 = 0xf3;
pub(crate) const REG_READ: u8 = 0xf4;
pub(crate) const REG_OPERATION: u8 = 0xf5;
pub(crate) const REG_STATUS: u8 = 0xf6;

pub(crate) const OP_WRITE_3: u8 = 0x37;
pub(crate) const OP_WRITE_2: u8 = 0x33;
pub(crate) const OP_READ_2: u8 = 0xf9;

pub(crate) const SENSOR_ADDRESS: u8 = 0x42;

const CONTROL_REQUEST: u8 = 0x01;
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
const STATUS_ATTEMPTS: usize = 5;

/// Single byte access to the bridge registers.
pub trait RegisterBus {
    fn write_register(&self, reg: u8, val: u8) -> Result<()>;

    fn read_register(&self, reg: u8) -> Result<u8>;
}

impl<T: UsbContext> RegisterBus for DeviceHandle<T> {
    fn write_register(&self, reg: u8, val: u8) -> Result<()> {
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);

        match self.write_control(
            request_type,
            CONTROL_REQUEST,
            0x00,
            reg.into(),
            &[val],
            CONTROL_TIMEOUT,
        )? {
            0 => Err(Error::Transport(rusb::Error::Io)),
            _ => Ok(()),
        }
    }

    fn read_register(&self, reg: u8) -> Result<u8> {
        let request_type =
            rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);

        let mut buf = [0; 1];
        match self.read_control(
            request_type,
            CONTROL_REQUEST,
            0x00,
            reg.into(),
            &mut buf,
            CONTROL_TIMEOUT,
        )? {
            0 => Err(Error::Transport(rusb::Error::Io)),
            _ => Ok(buf[0]),
        }
    }
}

/// Sensor register access tunneled through the bridge.
pub trait Sccb: RegisterBus {
    fn sccb_write(&self, reg: u8, val: u8) -> Result<()> {
        self.write_register(REG_SUBADDR, reg)?;
        self.write_register(REG_WRITE, val)?;
        self.write_register(REG_OPERATION, OP_WRITE_3)?;

        if !sccb_check_status(self)? {
            log::warn!("sccb write of {:#04x} to {:#04x} failed", val, reg);
        }
        Ok(())
    }

    fn sccb_read(&self, reg: u8) -> Result<u8> {
        self.write_register(REG_SUBADDR, reg)?;
        self.write_register(REG_OPERATION, OP_WRITE_2)?;
        if !sccb_check_status(self)? {
            log::warn!("sccb read of {:#04x} failed selecting the register", reg);
        }

        self.write_register(REG_OPERATION, OP_READ_2)?;
        if !sccb_check_status(self)? {
            log::warn!("sccb read of {:#04x} failed", reg);
        }

        self.read_register(REG_READ)
    }
}

impl<B: RegisterBus + ?Sized> Sccb for B {}

/// Polls the proxy status. `Ok(false)` means the sensor rejected the operation.
fn sccb_check_status<B: RegisterBus + ?Sized>(bus: &B) -> Result<bool> {
    for attempt in 1..=STATUS_ATTEMPTS {
        match bus.read_register(REG_STATUS)? {
            0x00 => return Ok(true),
            0x04 => return Ok(false),
            0x03 => {}
            status => log::warn!(
                "sccb status {:#04x}, attempt {}/{}",
                status,
                attempt,
                STATUS_ATTEMPTS
            ),
        }
    }

    Ok(true)
}

#[derive(RustEmbed)]
#[folder = "resources/ov534/"]
struct ScriptResources;

/// Fixed register sequences replayed during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    BridgeInit,
    SensorInit,
    BridgeStartVga,
    SensorStartVga,
}

impl Script {
    fn file_name(self) -> &'static str {
        match self {
            Script::BridgeInit => "bridge_init.hex",
            Script::SensorInit => "sensor_init.hex",
            Script::BridgeStartVga => "bridge_start_vga.hex",
            Script::SensorStartVga => "sensor_start_vga.hex",
        }
    }

    fn targets_sensor(self) -> bool {
        matches!(self, Script::SensorInit | Script::SensorStartVga)
    }

    pub fn load(self) -> Result<Vec<(u8, u8)>> {
        let name = self.file_name();
        let file = ScriptResources::get(name).ok_or(Error::Script { name, line: 0 })?;

        parse_script(name, &file.data)
    }
}

// One "reg value" hex pair per line, `#` starts a comment.
fn parse_script(name: &'static str, data: &[u8]) -> Result<Vec<(u8, u8)>> {
    let text = std::str::from_utf8(data).map_err(|_| Error::Script { name, line: 0 })?;

    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let entry: String = line
            .split('#')
            .next()
            .unwrap_or_default()
            .split_whitespace()
            .collect();
        if entry.is_empty() {
            continue;
        }

        let line = index + 1;
        let bytes = hex::decode(&entry).map_err(|_| Error::Script { name, line })?;
        match bytes[..] {
            [reg, val] => entries.push((reg, val)),
            _ => return Err(Error::Script { name, line }),
        }
    }

    Ok(entries)
}

/// Linear replay, no rollback if a write in the middle fails.
pub fn write_script<B: RegisterBus + ?Sized>(bus: &B, script: Script) -> Result<()> {
    let entries = script.load()?;
    log::debug!("writing {:?} ({} registers)", script, entries.len());

    for (reg, val) in entries {
        if !script.targets_sensor() {
            bus.write_register(reg, val)?;
        } else if reg != 0xff {
            bus.sccb_write(reg, val)?;
        } else {
            bus.sccb_read(val)?;
            bus.sccb_write(0xff, 0x00)?;
        }
    }

    Ok(())
}

// Bit 7 of 0x21 is the LED direction, bit 7 of 0x23 its level.
pub fn set_led<B: RegisterBus + ?Sized>(bus: &B, on: bool) -> Result<()> {
    let data = bus.read_register(0x21)?;
    bus.write_register(0x21, data | 0x80)?;

    let data = bus.read_register(0x23)?;
    bus.write_register(0x23, if on { data | 0x80 } else { data & !0x80 })?;

    if !on {
        let data = bus.read_register(0x21)?;
        bus.write_register(0x21, data & !0x80)?;
    }

    Ok(())
}

pub fn reset_bridge<B: RegisterBus + ?Sized>(bus: &B) -> Result<()> {
    bus.write_register(0xe7, 0x3a)?;
    bus.write_register(0xe0, 0x08)?;
    bus.write_register(REG_ADDRESS, SENSOR_ADDRESS)?;

    bus.sccb_write(0x12, 0x80)
}

/// Reads the product id out of the sensor. Only used for diagnostics.
pub fn probe_sensor_id<B: RegisterBus + ?Sized>(bus: &B) -> Result<u16> {
    // the first read after a reset returns stale data
    bus.sccb_read(0x0a)?;
    let high = bus.sccb_read(0x0a)?;
    bus.sccb_read(0x0b)?;
    let low = bus.sccb_read(0x0b)?;

    Ok(u16::from_be_bytes([high, low]))
}

pub fn enable_stream<B: RegisterBus + ?Sized>(bus: &B, enable: bool) -> Result<()> {
    bus.write_register(0xe0, if enable { 0x00 } else { 0x09 })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub fps: u32,
    r11: u8,
    r0d: u8,
    re5: u8,
}

// 640x480, fastest first. 83 fps output is partly corrupt, 75 and below is clean.
const FRAME_RATES_VGA: [FrameRate; 14] = [
    FrameRate { fps: 83, r11: 0x01, r0d: 0xc1, re5: 0x02 },
    FrameRate { fps: 75, r11: 0x01, r0d: 0x81, re5: 0x02 },
    FrameRate { fps: 60, r11: 0x00, r0d: 0x41, re5: 0x04 },
    FrameRate { fps: 50, r11: 0x01, r0d: 0x41, re5: 0x02 },
    FrameRate { fps: 40, r11: 0x02, r0d: 0xc1, re5: 0x04 },
    FrameRate { fps: 30, r11: 0x04, r0d: 0x81, re5: 0x02 },
    FrameRate { fps: 25, r11: 0x00, r0d: 0x01, re5: 0x02 },
    FrameRate { fps: 20, r11: 0x04, r0d: 0x41, re5: 0x02 },
    FrameRate { fps: 15, r11: 0x09, r0d: 0x81, re5: 0x02 },
    FrameRate { fps: 10, r11: 0x09, r0d: 0x41, re5: 0x02 },
    FrameRate { fps: 8, r11: 0x02, r0d: 0x01, re5: 0x02 },
    FrameRate { fps: 5, r11: 0x04, r0d: 0x01, re5: 0x02 },
    FrameRate { fps: 3, r11: 0x06, r0d: 0x01, re5: 0x02 },
    FrameRate { fps: 2, r11: 0x09, r0d: 0x01, re5: 0x02 },
];

/// Largest supported rate not above `requested`, or the slowest one.
pub fn resolve_frame_rate(requested: u32) -> FrameRate {
    FRAME_RATES_VGA
        .iter()
        .copied()
        .find(|rate| rate.fps <= requested)
        .unwrap_or(FRAME_RATES_VGA[FRAME_RATES_VGA.len() - 1])
}

pub fn set_frame_rate<B: RegisterBus + ?Sized>(bus: &B, requested: u32) -> Result<u32> {
    let rate = resolve_frame_rate(requested);

    bus.sccb_write(0x11, rate.r11)?;
    bus.sccb_write(0x0d, rate.r0d)?;
    bus.write_register(0xe5, rate.re5)?;

    Ok(rate.fps)
}
