use super::ov534::{RegisterBus, Sccb};
use crate::Result;

pub const MAX_GAIN: u8 = 63;
pub const MAX_SHARPNESS: u8 = 63;

/// Cached image settings. Mirrors what was last written to the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub gain: u8,
    pub exposure: u8,
    pub sharpness: u8,
    pub hue: u8,
    pub brightness: u8,
    pub contrast: u8,
    pub red_balance: u8,
    pub blue_balance: u8,
    pub green_balance: u8,
    pub autogain: bool,
    pub auto_white_balance: bool,
    pub flip_h: bool,
    pub flip_v: bool,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            gain: 20,
            exposure: 120,
            sharpness: 0,
            hue: 143,
            brightness: 20,
            contrast: 37,
            red_balance: 128,
            blue_balance: 128,
            green_balance: 128,
            autogain: false,
            auto_white_balance: false,
            flip_h: false,
            flip_v: false,
        }
    }
}

/// Repacks a 0..=63 gain into the sensor's GAIN register layout.
///
/// The two high bits select a range, each range sets progressively more of
/// the upper nibble on top of the low nibble.
pub fn encode_gain(val: u8) -> u8 {
    let low = val & 0x0f;
    match val & 0x30 {
        0x00 => low,
        0x10 => low | 0x30,
        0x20 => low | 0x70,
        _ => low | 0xf0,
    }
}

pub fn write_gain<B: RegisterBus + ?Sized>(bus: &B, val: u8) -> Result<()> {
    bus.sccb_write(0x00, encode_gain(val))
}

pub fn write_exposure<B: RegisterBus + ?Sized>(bus: &B, val: u8) -> Result<()> {
    bus.sccb_write(0x08, val >> 7)?;
    bus.sccb_write(0x10, val << 1)
}

pub fn write_sharpness<B: RegisterBus + ?Sized>(bus: &B, val: u8) -> Result<()> {
    bus.sccb_write(0x91, val)?; // vga noise
    bus.sccb_write(0x8e, val) // qvga noise
}

pub fn write_contrast<B: RegisterBus + ?Sized>(bus: &B, val: u8) -> Result<()> {
    bus.sccb_write(0x9c, val)
}

pub fn write_brightness<B: RegisterBus + ?Sized>(bus: &B, val: u8) -> Result<()> {
    bus.sccb_write(0x9b, val)
}

pub fn write_hue<B: RegisterBus + ?Sized>(bus: &B, val: u8) -> Result<()> {
    bus.sccb_write(0x01, val)
}

pub fn write_red_balance<B: RegisterBus + ?Sized>(bus: &B, val: u8) -> Result<()> {
    bus.sccb_write(0x43, val)
}

pub fn write_blue_balance<B: RegisterBus + ?Sized>(bus: &B, val: u8) -> Result<()> {
    bus.sccb_write(0x42, val)
}

pub fn write_green_balance<B: RegisterBus + ?Sized>(bus: &B, val: u8) -> Result<()> {
    bus.sccb_write(0x44, val)
}

/// Turning autogain off hands gain and exposure back to the cached values.
pub fn write_autogain<B: RegisterBus + ?Sized>(bus: &B, controls: &Controls) -> Result<()> {
    if controls.autogain {
        bus.sccb_write(0x13, 0xf7)?; // AGC, AEC, AWB on
        let val = bus.sccb_read(0x64)?;
        bus.sccb_write(0x64, val | 0x03)
    } else {
        bus.sccb_write(0x13, 0xf0)?; // AGC, AEC, AWB off
        let val = bus.sccb_read(0x64)?;
        bus.sccb_write(0x64, val & 0xfc)?;

        write_gain(bus, controls.gain)?;
        write_exposure(bus, controls.exposure)
    }
}

pub fn write_auto_white_balance<B: RegisterBus + ?Sized>(bus: &B, on: bool) -> Result<()> {
    bus.sccb_write(0x63, if on { 0xe0 } else { 0xaa })
}

// The sensor mirrors by default, so the bits are set when flipping is off.
pub fn write_flip<B: RegisterBus + ?Sized>(bus: &B, horizontal: bool, vertical: bool) -> Result<()> {
    let mut val = bus.sccb_read(0x0c)? & !0xc0;
    if !horizontal {
        val |= 0x40;
    }
    if !vertical {
        val |= 0x80;
    }
    bus.sccb_write(0x0c, val)
}

/// Replays every cached setting, in the order the sensor expects after a restart.
pub fn write_all<B: RegisterBus + ?Sized>(bus: &B, controls: &Controls) -> Result<()> {
    write_autogain(bus, controls)?;
    write_auto_white_balance(bus, controls.auto_white_balance)?;
    write_gain(bus, controls.gain)?;
    write_hue(bus, controls.hue)?;
    write_exposure(bus, controls.exposure)?;
    write_brightness(bus, controls.brightness)?;
    write_contrast(bus, controls.contrast)?;
    write_sharpness(bus, controls.sharpness)?;
    write_red_balance(bus, controls.red_balance)?;
    write_blue_balance(bus, controls.blue_balance)?;
    write_green_balance(bus, controls.green_balance)?;
    write_flip(bus, controls.flip_h, controls.flip_v)
}

#[cfg(test)]
mod tests {
    use super::super::ov534::mock::MockBus;
    use super::*;

    #[test]
    fn gain_ranges_repack() {
        assert_eq!(encode_gain(0x05), 0x05);
        assert_eq!(encode_gain(0x15), 0x35);
        assert_eq!(encode_gain(0x25), 0x75);
        assert_eq!(encode_gain(0x35), 0xf5);
        assert_eq!(encode_gain(MAX_GAIN), 0xff);
    }

    #[test]
    fn gain_is_written_to_register_zero() {
        let bus = MockBus::default();

        write_gain(&bus, 0x25).unwrap();

        assert_eq!(*bus.sensor_writes.borrow(), vec![(0x00, 0x75)]);
    }

    #[test]
    fn exposure_splits_across_two_registers() {
        let bus = MockBus::default();

        write_exposure(&bus, 0xc3).unwrap();

        assert_eq!(bus.sensor_value(0x08), Some(0x01));
        assert_eq!(bus.sensor_value(0x10), Some(0x86));
    }

    #[test]
    fn flip_preserves_low_bits() {
        let bus = MockBus::default();
        bus.set_sensor(0x0c, 0xd5);

        write_flip(&bus, true, false).unwrap();
        assert_eq!(bus.sensor_value(0x0c), Some(0x95));

        write_flip(&bus, false, true).unwrap();
        assert_eq!(bus.sensor_value(0x0c), Some(0x55));

        write_flip(&bus, true, true).unwrap();
        assert_eq!(bus.sensor_value(0x0c), Some(0x15));
    }

    #[test]
    fn disabling_autogain_restores_manual_values() {
        let bus = MockBus::default();
        bus.set_sensor(0x64, 0x87);
        let controls = Controls {
            gain: 0x15,
            exposure: 0x40,
            ..Default::default()
        };

        write_autogain(&bus, &controls).unwrap();

        assert_eq!(bus.sensor_value(0x13), Some(0xf0));
        assert_eq!(bus.sensor_value(0x64), Some(0x84));
        assert_eq!(bus.sensor_value(0x00), Some(0x35));
        assert_eq!(bus.sensor_value(0x10), Some(0x80));
    }

    #[test]
    fn enabling_autogain_leaves_gain_alone() {
        let bus = MockBus::default();
        bus.set_sensor(0x64, 0x84);
        let controls = Controls {
            autogain: true,
            ..Default::default()
        };

        write_autogain(&bus, &controls).unwrap();

        assert_eq!(bus.sensor_value(0x13), Some(0xf7));
        assert_eq!(bus.sensor_value(0x64), Some(0x87));
        assert_eq!(bus.sensor_value(0x00), None);
    }

    #[test]
    fn write_all_covers_every_setting() {
        let bus = MockBus::default();
        let controls = Controls::default();

        write_all(&bus, &controls).unwrap();

        assert_eq!(bus.sensor_value(0x63), Some(0xaa));
        assert_eq!(bus.sensor_value(0x01), Some(143));
        assert_eq!(bus.sensor_value(0x9b), Some(20));
        assert_eq!(bus.sensor_value(0x9c), Some(37));
        assert_eq!(bus.sensor_value(0x91), Some(0));
        assert_eq!(bus.sensor_value(0x43), Some(128));
        assert_eq!(bus.sensor_value(0x42), Some(128));
        assert_eq!(bus.sensor_value(0x44), Some(128));
        assert_eq!(bus.sensor_value(0x0c), Some(0xc0));
    }
}
