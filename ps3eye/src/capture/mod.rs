mod camera;
mod controls;
mod debayer;
mod device;
mod ov534;
mod queue;
mod scanner;
mod transfer;

use std::sync::Arc;

use rusb::{Context, UsbContext};

pub use camera::Camera;
pub use controls::Controls;

use crate::{Error, Result, PRODUCT_ID, VENDOR_ID};
use device::UsbDevice;
use transfer::EventLoop;

/// Owns the USB context and the event thread shared by every camera it hands out.
pub struct Ps3Eye {
    context: Context,
    event_loop: Arc<EventLoop>,
}

impl Ps3Eye {
    pub fn new() -> Result<Self> {
        let context = Context::new()?;

        Ok(Self {
            event_loop: Arc::new(EventLoop::new(context.clone())),
            context,
        })
    }

    /// Every attached PS3 Eye that can be opened, indexed in bus order.
    pub fn devices(&self) -> Result<Vec<Camera>> {
        let mut cameras = Vec::new();

        for device in self.context.devices()?.iter() {
            let device_desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };

            if device_desc.vendor_id() != VENDOR_ID || device_desc.product_id() != PRODUCT_ID {
                continue;
            }

            // only probe, init() reopens
            match device.open() {
                Ok(handle) => drop(handle),
                Err(e) => {
                    log::warn!(
                        "PS3 Eye on bus {} port {} could not be opened: {}",
                        device.bus_number(),
                        device.port_number(),
                        e
                    );
                    continue;
                }
            }

            let index = cameras.len();
            log::debug!(
                "found PS3 Eye {} on bus {} port {}",
                index,
                device.bus_number(),
                device.port_number()
            );
            cameras.push(Camera::new(
                Box::new(UsbDevice::new(device, Arc::clone(&self.event_loop))),
                index,
            ));
        }

        Ok(cameras)
    }

    pub fn device(&self, index: usize) -> Result<Camera> {
        self.devices()?
            .into_iter()
            .nth(index)
            .ok_or(Error::DeviceNotFound(index))
    }
}
