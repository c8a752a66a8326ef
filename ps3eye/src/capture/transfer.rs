use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::{ptr, slice};
extern crate libusb1_sys as usbffi;

use bytes::BytesMut;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use usbffi::constants::{
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NOT_FOUND, LIBUSB_TRANSFER_CANCELLED,
    LIBUSB_TRANSFER_COMPLETED,
};

use super::queue::FrameQueue;
use super::scanner::PacketScanner;
use crate::{Error, Result};

pub(crate) const NUM_TRANSFERS: usize = 5;
pub(crate) const TRANSFER_SIZE: usize = 65536;

const EVENT_POLL_USEC: i64 = 50 * 1000;
const SCAN_POLL: Duration = Duration::from_millis(100);
// buffers in flight between the callback and the scanner
const POOL_SIZE: usize = NUM_TRANSFERS * 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives libusb's event handling for every open stream.
///
/// The thread is started with the first stream and joined when the last one
/// stops; completion callbacks run on it.
pub(crate) struct EventLoop {
    context: Context,
    state: Mutex<EventLoopState>,
}

#[derive(Default)]
struct EventLoopState {
    streams: usize,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            state: Mutex::new(EventLoopState::default()),
        }
    }

    pub fn stream_started(&self) -> Result<()> {
        let mut state = lock(&self.state);

        if state.streams == 0 {
            let stop = Arc::new(AtomicBool::new(false));
            let thread = {
                let stop = Arc::clone(&stop);
                let context = self.context.clone();
                thread::Builder::new()
                    .name("ps3eye-usb-events".into())
                    .spawn(move || pump_events(&context, &stop))?
            };
            log::debug!("usb event thread started");

            state.stop = stop;
            state.thread = Some(thread);
        }
        state.streams += 1;

        Ok(())
    }

    pub fn stream_stopped(&self) {
        let mut state = lock(&self.state);

        state.streams = state.streams.saturating_sub(1);
        if state.streams > 0 {
            return;
        }

        state.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = state.thread.take() {
            match thread.join() {
                Ok(_) => log::debug!("usb event thread stopped"),
                Err(e) => log::error!("usb event thread panicked: {:?}", e),
            }
        }
    }
}

fn pump_events(context: &Context, stop: &AtomicBool) {
    let timeout = libc::timeval {
        tv_sec: 0,
        tv_usec: EVENT_POLL_USEC as _,
    };

    while !stop.load(Ordering::Relaxed) {
        let rc = unsafe {
            usbffi::libusb_handle_events_timeout_completed(
                context.as_raw(),
                &timeout as *const libc::timeval,
                ptr::null_mut(),
            )
        };
        if rc < 0 && rc != LIBUSB_ERROR_INTERRUPTED {
            log::warn!("libusb event handling failed ({})", rc);
        }
    }
}

/// First bulk IN endpoint with a non-zero packet size on interface 0.
fn find_bulk_endpoint<T: UsbContext>(device: &Device<T>) -> Result<u8> {
    let config = device.active_config_descriptor()?;

    let altsetting = config
        .interfaces()
        .find(|interface| interface.number() == 0)
        .and_then(|interface| interface.descriptors().next())
        .ok_or(Error::NoBulkEndpoint)?;

    altsetting
        .endpoint_descriptors()
        .find(|endpoint| {
            endpoint.transfer_type() == TransferType::Bulk
                && endpoint.direction() == Direction::In
                && endpoint.max_packet_size() != 0
        })
        .map(|endpoint| endpoint.address())
        .ok_or(Error::NoBulkEndpoint)
}

#[derive(Debug)]
struct StreamState {
    active: usize,
    running: bool,
}

struct TransferPtr(*mut usbffi::libusb_transfer);

// libusb transfers may be cancelled from any thread
unsafe impl Send for TransferPtr {}
unsafe impl Sync for TransferPtr {}

/// Transfer-sized buffers cycled between the completion callback and the scanner.
#[derive(Clone)]
struct BufferPool {
    free: Receiver<BytesMut>,
    recycle: Sender<BytesMut>,
}

impl BufferPool {
    fn new(count: usize) -> Self {
        let (recycle, free) = channel::bounded(count);
        for _ in 0..count {
            let _ = recycle.try_send(BytesMut::with_capacity(TRANSFER_SIZE));
        }

        Self { free, recycle }
    }

    fn take(&self) -> BytesMut {
        self.free
            .try_recv()
            .unwrap_or_else(|_| BytesMut::with_capacity(TRANSFER_SIZE))
    }

    fn give_back(&self, mut buffer: BytesMut) {
        buffer.clear();
        let _ = self.recycle.try_send(buffer);
    }
}

/// State shared between the owning [`Stream`] and the completion callbacks.
struct Shared {
    state: Mutex<StreamState>,
    idle: Condvar,
    transfers: Vec<TransferPtr>,
    queue: Arc<FrameQueue>,
    events: Sender<BytesMut>,
    pool: BufferPool,
}

impl Shared {
    fn new(
        queue: Arc<FrameQueue>,
        transfers: Vec<TransferPtr>,
        events: Sender<BytesMut>,
        pool: BufferPool,
    ) -> Self {
        Self {
            state: Mutex::new(StreamState {
                active: 0,
                running: true,
            }),
            idle: Condvar::new(),
            transfers,
            queue,
            events,
            pool,
        }
    }

    fn cancel_all(&self) {
        for transfer in &self.transfers {
            // never filled, so never submitted
            if unsafe { (*transfer.0).dev_handle.is_null() } {
                continue;
            }
            let rc = unsafe { usbffi::libusb_cancel_transfer(transfer.0) };
            if rc != 0 && rc != LIBUSB_ERROR_NOT_FOUND {
                log::warn!("could not cancel transfer ({})", rc);
            }
        }
    }

    // Partial-stream recovery is not supported, any failure stops everything
    // and wakes a reader blocked on the queue.
    fn fail(&self, state: &mut StreamState) {
        if state.running {
            state.running = false;
            self.cancel_all();
            self.queue.shutdown();
        }
    }

    fn retire(&self, state: &mut StreamState) {
        state.active = state.active.saturating_sub(1);
        self.idle.notify_all();
    }

    /// Stops resubmission, cancels every transfer and blocks until all of them have come back.
    fn cancel_and_wait(&self) {
        let mut state = lock(&self.state);
        state.running = false;
        self.cancel_all();

        while state.active > 0 {
            state = self
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct SlotContext {
    shared: Arc<Shared>,
    index: usize,
}

/// One libusb transfer with its buffer. Only dropped once it is no longer in flight.
struct Slot {
    transfer: *mut usbffi::libusb_transfer,
    buffer: *mut [u8],
    context: *mut SlotContext,
}

unsafe impl Send for Slot {}

impl Slot {
    fn alloc() -> Result<Self> {
        let transfer = unsafe { usbffi::libusb_alloc_transfer(0) };
        if transfer.is_null() {
            return Err(Error::Transport(rusb::Error::NoMem));
        }

        Ok(Self {
            transfer,
            buffer: Box::into_raw(vec![0u8; TRANSFER_SIZE].into_boxed_slice()),
            context: ptr::null_mut(),
        })
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        unsafe {
            usbffi::libusb_free_transfer(self.transfer);
            drop(Box::from_raw(self.buffer));
            if !self.context.is_null() {
                drop(Box::from_raw(self.context));
            }
        }
    }
}

extern "system" fn transfer_finished(transfer_ptr: *mut usbffi::libusb_transfer) {
    let transfer: &usbffi::libusb_transfer = unsafe { &*transfer_ptr };

    if transfer.user_data.is_null() {
        return;
    }
    let context = unsafe { &*(transfer.user_data as *const SlotContext) };
    let shared = &context.shared;

    if transfer.status == LIBUSB_TRANSFER_COMPLETED {
        let len = usize::try_from(transfer.actual_length).unwrap_or(0);
        let data = unsafe { slice::from_raw_parts(transfer.buffer, len) };

        let mut buffer = shared.pool.take();
        buffer.extend_from_slice(data);
        if let Err(TrySendError::Full(buffer)) = shared.events.try_send(buffer) {
            log::trace!("scanner is behind, dropping transfer {}", context.index);
            shared.pool.give_back(buffer);
        }
    }

    let mut state = lock(&shared.state);
    match transfer.status {
        LIBUSB_TRANSFER_COMPLETED if state.running => {
            let rc = unsafe { usbffi::libusb_submit_transfer(transfer_ptr) };
            if rc == 0 {
                return;
            }
            log::error!("error re-submitting transfer {} ({})", context.index, rc);
            shared.fail(&mut state);
        }
        LIBUSB_TRANSFER_COMPLETED | LIBUSB_TRANSFER_CANCELLED => {}
        status => {
            log::error!("transfer {} failed with status {}", context.index, status);
            shared.fail(&mut state);
        }
    }
    shared.retire(&mut state);
}

fn spawn_scanner(
    queue: Arc<FrameQueue>,
    events: Receiver<BytesMut>,
    pool: BufferPool,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("ps3eye-scanner".into())
        .spawn(move || {
            let mut scanner = PacketScanner::new(queue);

            while !shutdown.load(Ordering::Relaxed) {
                match events.recv_timeout(SCAN_POLL) {
                    Ok(data) => {
                        scanner.scan(&data);
                        pool.give_back(data);
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;

    Ok(handle)
}

/// A running capture: `NUM_TRANSFERS` bulk transfers that resubmit themselves
/// and a scanner thread feeding the frame queue.
pub(crate) struct Stream {
    shared: Arc<Shared>,
    slots: Vec<Slot>,
    scanner: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    event_loop: Option<Arc<EventLoop>>,
    closed: bool,
}

impl Stream {
    pub fn start<T: UsbContext>(
        handle: &mut DeviceHandle<T>,
        width: usize,
        height: usize,
        event_loop: Arc<EventLoop>,
    ) -> Result<Self> {
        let endpoint = find_bulk_endpoint(&handle.device())?;
        handle.clear_halt(endpoint)?;
        log::debug!("streaming from bulk endpoint {:#04x}", endpoint);

        let slots = (0..NUM_TRANSFERS)
            .map(|_| Slot::alloc())
            .collect::<Result<Vec<_>>>()?;

        let pool = BufferPool::new(POOL_SIZE);
        let (tx, rx) = channel::bounded(POOL_SIZE);
        let shared = Arc::new(Shared::new(
            Arc::new(FrameQueue::new(width, height)),
            slots.iter().map(|slot| TransferPtr(slot.transfer)).collect(),
            tx,
            pool.clone(),
        ));

        event_loop.stream_started()?;

        // from here on Drop unwinds whatever got started
        let mut stream = Stream {
            shared,
            slots,
            scanner: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            event_loop: Some(event_loop),
            closed: false,
        };

        stream.scanner = Some(spawn_scanner(
            Arc::clone(&stream.shared.queue),
            rx,
            pool,
            Arc::clone(&stream.shutdown),
        )?);

        for index in 0..stream.slots.len() {
            stream.submit(index, handle, endpoint)?;
        }

        Ok(stream)
    }

    /// A stream with no USB transfers behind it, frames are fed through [`queue`](Self::queue).
    #[cfg(test)]
    pub(crate) fn detached(width: usize, height: usize) -> Self {
        let (tx, _) = channel::bounded(1);

        Stream {
            shared: Arc::new(Shared::new(
                Arc::new(FrameQueue::new(width, height)),
                Vec::new(),
                tx,
                BufferPool::new(1),
            )),
            slots: Vec::new(),
            scanner: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            event_loop: None,
            closed: false,
        }
    }

    fn submit<T: UsbContext>(
        &mut self,
        index: usize,
        handle: &DeviceHandle<T>,
        endpoint: u8,
    ) -> Result<()> {
        let slot = &mut self.slots[index];
        slot.context = Box::into_raw(Box::new(SlotContext {
            shared: Arc::clone(&self.shared),
            index,
        }));

        unsafe {
            usbffi::libusb_fill_bulk_transfer(
                slot.transfer,
                handle.as_raw(),
                endpoint,
                slot.buffer as *mut u8,
                TRANSFER_SIZE as c_int,
                transfer_finished as _,
                slot.context as *mut c_void,
                0,
            );
        }

        // hold the lock so a fast completion can't retire before we count it
        let mut state = lock(&self.shared.state);
        match unsafe { usbffi::libusb_submit_transfer(slot.transfer) } {
            0 => {
                state.active += 1;
                Ok(())
            }
            rc => Err(Error::Submit(rc)),
        }
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.shared.queue
    }

    /// False once the stream was closed or a transfer failed.
    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).running
    }

    /// Cancels every transfer and blocks until all of them have come back.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.shared.cancel_and_wait();
        self.shared.queue.shutdown();

        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(scanner) = self.scanner.take() {
            if let Err(e) = scanner.join() {
                log::error!("scanner thread panicked: {:?}", e);
            }
        }

        if let Some(event_loop) = self.event_loop.take() {
            event_loop.stream_stopped();
        }
        self.slots.clear();
        log::debug!("stream closed");
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}
