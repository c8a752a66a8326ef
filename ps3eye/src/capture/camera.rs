use bytes::BytesMut;
use image::RgbImage;

use super::controls::{self, Controls, MAX_GAIN, MAX_SHARPNESS};
use super::device::{CameraDevice, CameraHandle};
use super::ov534::{self, Script};
use super::transfer::Stream;
use crate::{Error, Format, Result};

const FRAME_WIDTH: usize = 640;
const FRAME_HEIGHT: usize = 480;
const DEFAULT_FRAME_RATE: u32 = 60;

/// One PS3 Eye. Obtained from [`Ps3Eye::devices`](crate::Ps3Eye::devices).
///
/// The camera is driven from a single thread: `init`, `start`, the setters
/// and `read_frame` are not meant to be called concurrently.
pub struct Camera {
    device: Box<dyn CameraDevice>,
    index: usize,
    handle: Option<Box<dyn CameraHandle>>,
    controls: Controls,
    frame_rate: u32,
    format: Option<Format>,
    wait_for_frame: bool,
    stream: Option<Stream>,
}

impl Camera {
    pub(crate) fn new(device: Box<dyn CameraDevice>, index: usize) -> Self {
        Self {
            device,
            index,
            handle: None,
            controls: Controls::default(),
            frame_rate: DEFAULT_FRAME_RATE,
            format: None,
            wait_for_frame: true,
            stream: None,
        }
    }

    /// Opens the device and runs the bridge and sensor bring-up.
    pub fn init(&mut self, frame_rate: u32, format: Format) -> Result<()> {
        if self.is_streaming() {
            return Err(Error::Usage("init() called while streaming, stop() first"));
        }
        self.stream = None;

        self.frame_rate = ov534::resolve_frame_rate(frame_rate).fps;
        self.format = Some(format);

        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => self.device.open()?,
        };
        let bus: &dyn CameraHandle = &**self.handle.insert(handle);

        ov534::reset_bridge(bus)?;

        let sensor_id = ov534::probe_sensor_id(bus)?;
        log::debug!("PS3 Eye {} sensor id {:04x}", self.index, sensor_id);

        ov534::write_script(bus, Script::BridgeInit)?;
        ov534::set_led(bus, true)?;
        ov534::write_script(bus, Script::SensorInit)?;
        ov534::enable_stream(bus, false)?;
        ov534::set_led(bus, false)
    }

    /// Programs the capture mode, replays the cached controls and starts streaming.
    pub fn start(&mut self) -> Result<()> {
        if self.is_streaming() {
            return Ok(());
        }
        // a stream that died on a transfer error is reaped here
        self.stream = None;

        let handle = self
            .handle
            .as_mut()
            .ok_or(Error::Usage("init() must be called before start()"))?;
        let bus: &dyn CameraHandle = &**handle;

        ov534::write_script(bus, Script::BridgeStartVga)?;
        ov534::write_script(bus, Script::SensorStartVga)?;
        ov534::set_frame_rate(bus, self.frame_rate)?;
        controls::write_all(bus, &self.controls)?;

        ov534::set_led(bus, true)?;
        ov534::enable_stream(bus, true)?;

        let stream = handle.start_stream(FRAME_WIDTH, FRAME_HEIGHT)?;
        stream.queue().set_wait_for_frame(self.wait_for_frame);
        self.stream = Some(stream);

        log::debug!("PS3 Eye {} streaming at {} fps", self.index, self.frame_rate);
        Ok(())
    }

    /// Stops the sensor output and waits for every outstanding transfer.
    pub fn stop(&mut self) -> Result<()> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => return Ok(()),
        };

        let result = match self.handle.as_deref() {
            Some(bus) => ov534::enable_stream(bus, false).and_then(|_| ov534::set_led(bus, false)),
            None => Ok(()),
        };

        stream.close();
        result
    }

    /// Stops streaming and closes the USB handle.
    pub fn release(&mut self) -> Result<()> {
        let result = self.stop();
        self.handle = None;
        result
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.as_ref().map_or(false, Stream::is_running)
    }

    pub fn is_available(&self) -> bool {
        self.is_streaming()
            && self
                .stream
                .as_ref()
                .map_or(false, |stream| stream.queue().is_available())
    }

    /// Whether [`read_frame`](Self::read_frame) blocks until a frame arrives. On by default.
    pub fn wait_available(&mut self, wait: bool) {
        self.wait_for_frame = wait;
        if let Some(stream) = &self.stream {
            stream.queue().set_wait_for_frame(wait);
        }
    }

    pub fn frame_len(&self) -> usize {
        FRAME_WIDTH * FRAME_HEIGHT * self.format().bytes_per_pixel()
    }

    /// Copies the next frame into `buffer` in the configured format.
    ///
    /// `buffer` is resized to `width * height * bytes_per_pixel` first.
    /// Returns `false` if nothing was copied: the camera is not streaming,
    /// or waiting is off and no frame is ready.
    pub fn read_frame(&self, buffer: &mut BytesMut) -> bool {
        self.read_frame_as(buffer, self.format())
    }

    fn read_frame_as(&self, buffer: &mut BytesMut, format: Format) -> bool {
        let len = FRAME_WIDTH * FRAME_HEIGHT * format.bytes_per_pixel();
        if buffer.len() != len {
            buffer.clear();
            buffer.resize(len, 0);
        }

        match &self.stream {
            Some(stream) if stream.is_running() => stream.queue().dequeue(buffer, format),
            _ => false,
        }
    }

    /// Next frame as an RGB image, regardless of the configured format.
    pub fn frame_image(&self) -> Option<RgbImage> {
        let mut buffer = BytesMut::new();
        if !self.read_frame_as(&mut buffer, Format::Rgb) {
            return None;
        }

        RgbImage::from_raw(FRAME_WIDTH as u32, FRAME_HEIGHT as u32, buffer.to_vec())
    }

    pub fn frame_width(&self) -> usize {
        FRAME_WIDTH
    }

    pub fn frame_height(&self) -> usize {
        FRAME_HEIGHT
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    /// Picks the closest supported rate at or below `frame_rate` and applies it if the device is open.
    pub fn set_frame_rate(&mut self, frame_rate: u32) -> Result<u32> {
        self.frame_rate = match self.handle.as_deref() {
            Some(bus) => ov534::set_frame_rate(bus, frame_rate)?,
            None => ov534::resolve_frame_rate(frame_rate).fps,
        };
        Ok(self.frame_rate)
    }

    pub fn format(&self) -> Format {
        self.format.unwrap_or_default()
    }

    pub fn set_format(&mut self, format: Format) {
        self.format = Some(format);
    }

    pub fn device_index(&self) -> usize {
        self.index
    }

    pub fn usb_port_number(&self) -> u8 {
        self.device.port_number()
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    // Setters update the cache and, once the device is open, the sensor.

    pub fn gain(&self) -> u8 {
        self.controls.gain
    }

    pub fn set_gain(&mut self, val: u8) -> Result<()> {
        self.controls.gain = val.min(MAX_GAIN);
        match self.handle.as_deref() {
            Some(bus) => controls::write_gain(bus, self.controls.gain),
            None => Ok(()),
        }
    }

    pub fn exposure(&self) -> u8 {
        self.controls.exposure
    }

    pub fn set_exposure(&mut self, val: u8) -> Result<()> {
        self.controls.exposure = val;
        match self.handle.as_deref() {
            Some(bus) => controls::write_exposure(bus, val),
            None => Ok(()),
        }
    }

    pub fn sharpness(&self) -> u8 {
        self.controls.sharpness
    }

    pub fn set_sharpness(&mut self, val: u8) -> Result<()> {
        self.controls.sharpness = val.min(MAX_SHARPNESS);
        match self.handle.as_deref() {
            Some(bus) => controls::write_sharpness(bus, self.controls.sharpness),
            None => Ok(()),
        }
    }

    pub fn hue(&self) -> u8 {
        self.controls.hue
    }

    pub fn set_hue(&mut self, val: u8) -> Result<()> {
        self.controls.hue = val;
        match self.handle.as_deref() {
            Some(bus) => controls::write_hue(bus, val),
            None => Ok(()),
        }
    }

    pub fn brightness(&self) -> u8 {
        self.controls.brightness
    }

    pub fn set_brightness(&mut self, val: u8) -> Result<()> {
        self.controls.brightness = val;
        match self.handle.as_deref() {
            Some(bus) => controls::write_brightness(bus, val),
            None => Ok(()),
        }
    }

    pub fn contrast(&self) -> u8 {
        self.controls.contrast
    }

    pub fn set_contrast(&mut self, val: u8) -> Result<()> {
        self.controls.contrast = val;
        match self.handle.as_deref() {
            Some(bus) => controls::write_contrast(bus, val),
            None => Ok(()),
        }
    }

    pub fn red_balance(&self) -> u8 {
        self.controls.red_balance
    }

    pub fn set_red_balance(&mut self, val: u8) -> Result<()> {
        self.controls.red_balance = val;
        match self.handle.as_deref() {
            Some(bus) => controls::write_red_balance(bus, val),
            None => Ok(()),
        }
    }

    pub fn blue_balance(&self) -> u8 {
        self.controls.blue_balance
    }

    pub fn set_blue_balance(&mut self, val: u8) -> Result<()> {
        self.controls.blue_balance = val;
        match self.handle.as_deref() {
            Some(bus) => controls::write_blue_balance(bus, val),
            None => Ok(()),
        }
    }

    pub fn green_balance(&self) -> u8 {
        self.controls.green_balance
    }

    pub fn set_green_balance(&mut self, val: u8) -> Result<()> {
        self.controls.green_balance = val;
        match self.handle.as_deref() {
            Some(bus) => controls::write_green_balance(bus, val),
            None => Ok(()),
        }
    }

    pub fn autogain(&self) -> bool {
        self.controls.autogain
    }

    pub fn set_autogain(&mut self, on: bool) -> Result<()> {
        self.controls.autogain = on;
        match self.handle.as_deref() {
            Some(bus) => controls::write_autogain(bus, &self.controls),
            None => Ok(()),
        }
    }

    pub fn auto_white_balance(&self) -> bool {
        self.controls.auto_white_balance
    }

    pub fn set_auto_white_balance(&mut self, on: bool) -> Result<()> {
        self.controls.auto_white_balance = on;
        match self.handle.as_deref() {
            Some(bus) => controls::write_auto_white_balance(bus, on),
            None => Ok(()),
        }
    }

    /// (horizontal, vertical)
    pub fn flip(&self) -> (bool, bool) {
        (self.controls.flip_h, self.controls.flip_v)
    }

    pub fn set_flip(&mut self, horizontal: bool, vertical: bool) -> Result<()> {
        self.controls.flip_h = horizontal;
        self.controls.flip_v = vertical;
        match self.handle.as_deref() {
            Some(bus) => controls::write_flip(bus, horizontal, vertical),
            None => Ok(()),
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("error releasing PS3 Eye {}: {}", self.index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::capture::controls::encode_gain;
    use crate::capture::ov534::mock::MockBus;
    use crate::capture::ov534::RegisterBus;

    type SharedBus = Arc<Mutex<MockBus>>;

    struct MockDevice(SharedBus);

    impl CameraDevice for MockDevice {
        fn open(&self) -> Result<Box<dyn CameraHandle>> {
            Ok(Box::new(MockHandle(Arc::clone(&self.0))))
        }

        fn port_number(&self) -> u8 {
            4
        }
    }

    struct MockHandle(SharedBus);

    impl RegisterBus for MockHandle {
        fn write_register(&self, reg: u8, val: u8) -> Result<()> {
            self.0.lock().unwrap().write_register(reg, val)
        }

        fn read_register(&self, reg: u8) -> Result<u8> {
            self.0.lock().unwrap().read_register(reg)
        }
    }

    impl CameraHandle for MockHandle {
        fn start_stream(&mut self, width: usize, height: usize) -> Result<Stream> {
            Ok(Stream::detached(width, height))
        }
    }

    fn camera() -> (Camera, SharedBus) {
        let bus = SharedBus::default();
        (Camera::new(Box::new(MockDevice(Arc::clone(&bus))), 0), bus)
    }

    fn bridge_writes(bus: &SharedBus) -> usize {
        bus.lock().unwrap().bridge_writes.borrow().len()
    }

    fn push_frame(camera: &Camera, val: u8) {
        let queue = camera.stream.as_ref().unwrap().queue();
        queue.write(queue.write_start(), &vec![val; FRAME_WIDTH * FRAME_HEIGHT]);
        queue.enqueue();
    }

    #[test]
    fn start_before_init_is_usage_error() {
        let (mut camera, bus) = camera();

        assert!(matches!(camera.start(), Err(Error::Usage(_))));
        assert!(!camera.is_streaming());
        assert_eq!(bridge_writes(&bus), 0);
    }

    #[test]
    fn setters_before_init_only_update_cache() {
        let (mut camera, bus) = camera();

        camera.set_gain(100).unwrap();
        camera.set_sharpness(200).unwrap();
        camera.set_hue(10).unwrap();
        camera.set_autogain(true).unwrap();
        camera.set_flip(true, false).unwrap();
        assert_eq!(camera.set_frame_rate(45).unwrap(), 40);

        assert_eq!(camera.gain(), MAX_GAIN);
        assert_eq!(camera.sharpness(), MAX_SHARPNESS);
        assert_eq!(camera.hue(), 10);
        assert!(camera.autogain());
        assert_eq!(camera.flip(), (true, false));
        assert_eq!(camera.frame_rate(), 40);
        assert_eq!(bridge_writes(&bus), 0);
    }

    #[test]
    fn start_replays_cached_controls() {
        let (mut camera, bus) = camera();
        camera.set_gain(100).unwrap();
        camera.set_contrast(99).unwrap();

        camera.init(30, Format::Bayer).unwrap();
        camera.start().unwrap();
        assert!(camera.is_streaming());

        let bus = bus.lock().unwrap();
        assert_eq!(bus.sensor_value(0x00), Some(encode_gain(MAX_GAIN)));
        assert_eq!(bus.sensor_value(0x9c), Some(99));
        // 30 fps clock divider
        assert_eq!(bus.sensor_value(0x11), Some(0x04));
        assert_eq!(bus.bridge.borrow().get(&0xe0), Some(&0x00));
        assert_eq!(bus.bridge.borrow().get(&0x23).map(|v| v & 0x80), Some(0x80));
    }

    #[test]
    fn setters_write_once_open() {
        let (mut camera, bus) = camera();
        camera.init(60, Format::Rgb).unwrap();

        camera.set_brightness(77).unwrap();
        camera.set_exposure(0x81).unwrap();

        let bus = bus.lock().unwrap();
        assert_eq!(bus.sensor_value(0x9b), Some(77));
        assert_eq!(bus.sensor_value(0x08), Some(0x01));
        assert_eq!(bus.sensor_value(0x10), Some(0x02));
    }

    #[test]
    fn init_while_streaming_is_rejected() {
        let (mut camera, bus) = camera();
        camera.init(60, Format::Rgb).unwrap();
        camera.start().unwrap();
        let writes = bridge_writes(&bus);

        assert!(matches!(camera.init(60, Format::Rgb), Err(Error::Usage(_))));
        assert!(camera.is_streaming());
        assert_eq!(bridge_writes(&bus), writes);
    }

    #[test]
    fn stop_disables_stream_and_led() {
        let (mut camera, bus) = camera();
        camera.init(60, Format::Rgb).unwrap();
        camera.start().unwrap();

        camera.stop().unwrap();

        assert!(!camera.is_streaming());
        assert!(!camera.read_frame(&mut BytesMut::new()));
        let bus = bus.lock().unwrap();
        assert_eq!(bus.bridge.borrow().get(&0xe0), Some(&0x09));
        assert_eq!(bus.bridge.borrow().get(&0x23).map(|v| v & 0x80), Some(0x00));
    }

    #[test]
    fn read_frame_sizes_buffer_when_idle() {
        let (mut camera, _bus) = camera();

        let mut buffer = BytesMut::new();
        assert!(!camera.read_frame(&mut buffer));
        assert_eq!(buffer.len(), FRAME_WIDTH * FRAME_HEIGHT * 3);

        camera.set_format(Format::Bayer);
        let mut buffer = BytesMut::from(&[7u8; 10][..]);
        assert!(!camera.read_frame(&mut buffer));
        assert_eq!(buffer.len(), camera.frame_len());
        assert_eq!(camera.frame_len(), FRAME_WIDTH * FRAME_HEIGHT);
    }

    #[test]
    fn read_frame_copies_queued_frame() {
        let (mut camera, _bus) = camera();
        camera.init(60, Format::Bayer).unwrap();
        camera.start().unwrap();

        push_frame(&camera, 0x5a);
        assert!(camera.is_available());

        let mut buffer = BytesMut::new();
        assert!(camera.read_frame(&mut buffer));
        assert!(buffer.iter().all(|&b| b == 0x5a));

        camera.wait_available(false);
        assert!(!camera.read_frame(&mut buffer));
    }

    #[test]
    fn frame_image_is_rgb() {
        let (mut camera, _bus) = camera();
        camera.init(60, Format::Bayer).unwrap();
        camera.start().unwrap();

        push_frame(&camera, 50);
        let image = camera.frame_image().unwrap();

        assert_eq!(image.dimensions(), (FRAME_WIDTH as u32, FRAME_HEIGHT as u32));
        assert_eq!(image.get_pixel(320, 240).0, [50, 50, 50]);
    }

    #[test]
    fn device_details() {
        let (camera, _bus) = camera();

        assert_eq!(camera.device_index(), 0);
        assert_eq!(camera.usb_port_number(), 4);
        assert_eq!((camera.frame_width(), camera.frame_height()), (640, 480));
        assert_eq!(camera.format(), Format::Rgb);
    }
}
