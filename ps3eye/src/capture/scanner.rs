use std::sync::Arc;

use super::queue::FrameQueue;

/// Bulk payloads are fixed size, the last one in a transfer may be shorter.
pub(crate) const PAYLOAD_SIZE: usize = 2048;
const HEADER_LEN: usize = 12;

// bmHeaderInfo bits
const STREAM_ERR: u8 = 1 << 6;
const STREAM_PTS: u8 = 1 << 2;
const STREAM_EOF: u8 = 1 << 1;
const STREAM_FID: u8 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Packet {
    Discard,
    First,
    Inter,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PayloadHeader {
    pts: u32,
    fid: bool,
    end_of_frame: bool,
}

impl PayloadHeader {
    fn parse(chunk: &[u8]) -> Option<Self> {
        if chunk.len() < HEADER_LEN || usize::from(chunk[0]) != HEADER_LEN {
            return None;
        }

        let flags = chunk[1];
        if flags & STREAM_ERR != 0 || flags & STREAM_PTS == 0 {
            return None;
        }

        Some(Self {
            pts: u32::from_le_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
            fid: flags & STREAM_FID != 0,
            end_of_frame: flags & STREAM_EOF != 0,
        })
    }
}

/// Reassembles frames out of bulk transfer buffers.
///
/// A frame starts whenever the PTS or FID of a payload changes, and ends on
/// an EOF payload that brings the frame to exactly `frame_size` bytes.
/// Payload data is written straight into the queue's current write slot.
pub struct PacketScanner {
    queue: Arc<FrameQueue>,
    frame_size: usize,
    frame_start: usize,
    frame_len: usize,
    last_packet: Packet,
    last_pts: u32,
    last_fid: bool,
}

impl PacketScanner {
    pub fn new(queue: Arc<FrameQueue>) -> Self {
        Self {
            frame_size: queue.frame_size(),
            frame_start: queue.write_start(),
            frame_len: 0,
            last_packet: Packet::Discard,
            last_pts: 0,
            last_fid: false,
            queue,
        }
    }

    pub fn scan(&mut self, data: &[u8]) {
        for chunk in data.chunks(PAYLOAD_SIZE) {
            self.scan_payload(chunk);
        }
    }

    fn scan_payload(&mut self, chunk: &[u8]) {
        let header = match PayloadHeader::parse(chunk) {
            Some(header) => header,
            None => {
                log::trace!("dropping payload with bad header");
                self.frame_add(Packet::Discard, &[]);
                return;
            }
        };
        let payload = &chunk[HEADER_LEN..];

        if header.pts != self.last_pts || header.fid != self.last_fid {
            if self.last_packet == Packet::Inter {
                // the previous frame never saw its EOF
                log::trace!("discarding truncated frame ({} bytes)", self.frame_len);
                self.frame_add(Packet::Discard, &[]);
            }
            self.last_pts = header.pts;
            self.last_fid = header.fid;
            self.frame_add(Packet::First, payload);
        } else if header.end_of_frame {
            self.last_pts = 0;
            if self.frame_len + payload.len() != self.frame_size {
                log::trace!(
                    "discarding frame of {} bytes, expected {}",
                    self.frame_len + payload.len(),
                    self.frame_size
                );
                self.frame_add(Packet::Discard, &[]);
            } else {
                self.frame_add(Packet::Last, payload);
            }
        } else {
            self.frame_add(Packet::Inter, payload);
        }
    }

    fn frame_add(&mut self, mut packet: Packet, data: &[u8]) {
        if packet == Packet::First {
            self.frame_len = 0;
        } else {
            match self.last_packet {
                Packet::Discard => {
                    if packet == Packet::Last {
                        self.last_packet = packet;
                        self.frame_len = 0;
                    }
                    return;
                }
                Packet::Last => return,
                Packet::First | Packet::Inter => {}
            }
        }

        if !data.is_empty() {
            if self.frame_len + data.len() > self.frame_size {
                packet = Packet::Discard;
                self.frame_len = 0;
            } else {
                self.queue.write(self.frame_start + self.frame_len, data);
                self.frame_len += data.len();
            }
        }

        self.last_packet = packet;

        if packet == Packet::Last {
            self.frame_len = 0;
            self.frame_start = self.queue.enqueue();
        }
    }
}
