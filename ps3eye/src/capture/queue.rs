use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;

use super::debayer::debayer;
use crate::Format;

pub(crate) const NUM_FRAMES: usize = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Cursor {
    head: usize,
    tail: usize,
    available: usize,
    dequeuing: bool,
    closed: bool,
}

/// Two frame ring between the packet scanner and the caller.
///
/// The producer never blocks on a slow consumer. When the consumer is a full
/// frame behind, `enqueue` hands back the slot that was just filled and the
/// next frame overwrites it. The producer can therefore only ever be
/// `NUM_FRAMES - 1` frames ahead, which keeps it off the slot being read.
///
/// Frames are addressed by a byte offset into a `NUM_FRAMES * frame_size`
/// arena; each slot has its own lock so writing `head` never waits on a
/// dequeue of `tail`.
pub struct FrameQueue {
    width: usize,
    height: usize,
    frame_size: usize,
    slots: Vec<Mutex<BytesMut>>,
    cursor: Mutex<Cursor>,
    frame_available: Condvar,
    dequeue_finished: Condvar,
    wait_for_frame: AtomicBool,
}

impl FrameQueue {
    pub fn new(width: usize, height: usize) -> Self {
        let frame_size = width * height;

        Self {
            width,
            height,
            frame_size,
            slots: (0..NUM_FRAMES)
                .map(|_| Mutex::new(BytesMut::zeroed(frame_size)))
                .collect(),
            cursor: Mutex::new(Cursor::default()),
            frame_available: Condvar::new(),
            dequeue_finished: Condvar::new(),
            wait_for_frame: AtomicBool::new(true),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Offset the producer starts writing the first frame at.
    pub fn write_start(&self) -> usize {
        lock(&self.cursor).head * self.frame_size
    }

    /// Copies `data` into the arena at `offset`. The range must not cross a slot boundary.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let (slot, start) = (offset / self.frame_size, offset % self.frame_size);

        lock(&self.slots[slot])[start..start + data.len()].copy_from_slice(data);
    }

    /// Publishes the frame in `head` and returns the offset of the next frame to fill.
    pub fn enqueue(&self) -> usize {
        let mut cursor = lock(&self.cursor);

        if cursor.available >= NUM_FRAMES - 1 {
            return cursor.head * self.frame_size;
        }

        while cursor.dequeuing {
            cursor = self
                .dequeue_finished
                .wait(cursor)
                .unwrap_or_else(PoisonError::into_inner);
        }

        cursor.head = (cursor.head + 1) % NUM_FRAMES;
        cursor.available += 1;
        self.frame_available.notify_all();

        cursor.head * self.frame_size
    }

    pub fn is_available(&self) -> bool {
        lock(&self.cursor).available > 0
    }

    pub fn set_wait_for_frame(&self, wait: bool) {
        self.wait_for_frame.store(wait, Ordering::Relaxed);
    }

    /// Copies the oldest frame into `out`, demosaicing it when `format` asks for it.
    ///
    /// Returns `false` without touching `out` when no frame is ready and
    /// waiting is disabled, or when the queue was shut down.
    pub fn dequeue(&self, out: &mut [u8], format: Format) -> bool {
        let tail = {
            let mut cursor = lock(&self.cursor);

            if self.wait_for_frame.load(Ordering::Relaxed) {
                while cursor.available == 0 && !cursor.closed {
                    cursor = self
                        .frame_available
                        .wait(cursor)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            if cursor.available == 0 {
                return false;
            }

            cursor.dequeuing = true;
            cursor.tail
        };

        {
            let frame = lock(&self.slots[tail]);
            match format {
                Format::Bayer => out[..self.frame_size].copy_from_slice(&frame),
                Format::Rgb => debayer(&frame, self.width, self.height, out, false),
                Format::Bgr => debayer(&frame, self.width, self.height, out, true),
            }
        }

        let mut cursor = lock(&self.cursor);
        cursor.tail = (tail + 1) % NUM_FRAMES;
        cursor.available -= 1;
        cursor.dequeuing = false;
        self.dequeue_finished.notify_all();

        true
    }

    /// Wakes any blocked consumer. No further frames are handed out once drained.
    pub fn shutdown(&self) {
        lock(&self.cursor).closed = true;
        self.frame_available.notify_all();
    }

    #[cfg(test)]
    fn positions(&self) -> (usize, usize, usize) {
        let cursor = lock(&self.cursor);
        (cursor.head, cursor.tail, cursor.available)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crossbeam::channel;

    use super::*;

    fn fill(queue: &FrameQueue, offset: usize, val: u8) {
        queue.write(offset, &vec![val; queue.frame_size()]);
    }

    #[test]
    fn enqueue_advances_head() {
        let queue = FrameQueue::new(4, 4);
        let offset = queue.write_start();
        assert_eq!(offset, 0);

        fill(&queue, offset, 1);
        assert_eq!(queue.enqueue(), 16);
        assert_eq!(queue.positions(), (1, 0, 1));
        assert!(queue.is_available());
    }

    #[test]
    fn full_queue_overwrites_newest_slot() {
        let queue = FrameQueue::new(4, 4);

        fill(&queue, queue.write_start(), 1);
        let offset = queue.enqueue();
        fill(&queue, offset, 2);

        // consumer is a frame behind, nothing moves
        assert_eq!(queue.enqueue(), offset);
        assert_eq!(queue.positions(), (1, 0, 1));

        fill(&queue, offset, 3);
        assert_eq!(queue.enqueue(), offset);
        assert_eq!(queue.positions(), (1, 0, 1));

        let mut out = vec![0; 16];
        assert!(queue.dequeue(&mut out, Format::Bayer));
        assert_eq!(out, vec![1; 16]);
        assert_eq!(queue.positions(), (1, 1, 0));

        // the overwritten slot is published by the next enqueue
        assert_eq!(queue.enqueue(), 0);
        assert!(queue.dequeue(&mut out, Format::Bayer));
        assert_eq!(out, vec![3; 16]);
    }

    #[test]
    fn non_blocking_dequeue_returns_when_empty() {
        let queue = FrameQueue::new(4, 4);
        queue.set_wait_for_frame(false);

        let mut out = vec![7; 16];
        assert!(!queue.dequeue(&mut out, Format::Bayer));
        assert_eq!(out, vec![7; 16]);
        assert_eq!(queue.positions(), (0, 0, 0));
    }

    #[test]
    fn blocking_dequeue_waits_for_producer() {
        let queue = Arc::new(FrameQueue::new(4, 4));
        let (tx, rx) = channel::bounded(1);

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut out = vec![0; 16];
                let got = queue.dequeue(&mut out, Format::Bayer);
                tx.send(()).unwrap();
                (got, out)
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        fill(&queue, queue.write_start(), 9);
        queue.enqueue();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let (got, out) = consumer.join().unwrap();
        assert!(got);
        assert_eq!(out, vec![9; 16]);
        assert!(!queue.is_available());
    }

    #[test]
    fn shutdown_releases_blocked_consumer() {
        let queue = Arc::new(FrameQueue::new(4, 4));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue(&mut [0; 16], Format::Bayer))
        };

        thread::sleep(Duration::from_millis(50));
        queue.shutdown();

        assert!(!consumer.join().unwrap());
    }

    #[test]
    fn dequeue_demosaics_on_request() {
        let queue = FrameQueue::new(4, 4);
        fill(&queue, queue.write_start(), 50);
        queue.enqueue();

        let mut out = vec![0; 16 * 3];
        assert!(queue.dequeue(&mut out, Format::Rgb));
        assert_eq!(out, vec![50; 16 * 3]);
    }
}
