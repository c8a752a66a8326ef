use std::sync::Arc;

use rusb::{Context, Device, DeviceHandle};

use super::ov534::RegisterBus;
use super::transfer::{EventLoop, Stream};
use crate::Result;

/// A camera found on the bus, not opened yet.
pub(crate) trait CameraDevice: Send {
    fn open(&self) -> Result<Box<dyn CameraHandle>>;

    fn port_number(&self) -> u8;
}

/// An opened camera: bridge register access plus the bulk video stream.
pub(crate) trait CameraHandle: RegisterBus + Send {
    fn start_stream(&mut self, width: usize, height: usize) -> Result<Stream>;
}

pub(crate) struct UsbDevice {
    device: Device<Context>,
    event_loop: Arc<EventLoop>,
}

impl UsbDevice {
    pub fn new(device: Device<Context>, event_loop: Arc<EventLoop>) -> Self {
        Self { device, event_loop }
    }
}

impl CameraDevice for UsbDevice {
    fn open(&self) -> Result<Box<dyn CameraHandle>> {
        let mut handle = self.device.open()?;
        handle.claim_interface(0)?;
        log::debug!(
            "opened PS3 Eye on bus {} port {}",
            self.device.bus_number(),
            self.device.port_number()
        );

        Ok(Box::new(UsbHandle {
            handle,
            event_loop: Arc::clone(&self.event_loop),
        }))
    }

    fn port_number(&self) -> u8 {
        self.device.port_number()
    }
}

/// Holds interface 0 until dropped.
struct UsbHandle {
    handle: DeviceHandle<Context>,
    event_loop: Arc<EventLoop>,
}

impl RegisterBus for UsbHandle {
    fn write_register(&self, reg: u8, val: u8) -> Result<()> {
        self.handle.write_register(reg, val)
    }

    fn read_register(&self, reg: u8) -> Result<u8> {
        self.handle.read_register(reg)
    }
}

impl CameraHandle for UsbHandle {
    fn start_stream(&mut self, width: usize, height: usize) -> Result<Stream> {
        Stream::start(&mut self.handle, width, height, Arc::clone(&self.event_loop))
    }
}

impl Drop for UsbHandle {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(0) {
            log::warn!("could not release interface: {}", e);
        }
    }
}
