//! Fixed-size send ring of the reliable stream
//!
//! Every connection owns one [`SendWindow`] of `BUFFER_LENGTH` slots.
//! The send pointer and ack pointer are monotonic counters; a counter
//! maps onto its ring slot by masking with `SEQ_MASK`, which is why the
//! ring length must be a power of two. The window treats the in-flight
//! range `[ack, send)` as a contiguous segment: acknowledgments outside
//! it are ignored, and only the contiguous acked prefix advances the ack
//! pointer — a gap stalls the window until it is filled.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;

use lanmesh_core::{BUFFER_LENGTH, SEQ_MASK};

#[derive(Default)]
struct Slot {
    acked: bool,
    pending: Option<PendingSyn>,
}

struct PendingSyn {
    payload: Bytes,
    sent_at: Instant,
}

/// Sliding send window with per-slot acknowledgment flags
pub struct SendWindow {
    slots: Mutex<Vec<Slot>>,
    send_count: AtomicU32,
    ack_count: AtomicU32,
    space: Notify,
}

impl SendWindow {
    /// Create an empty window
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(BUFFER_LENGTH);
        slots.resize_with(BUFFER_LENGTH, Slot::default);
        Self {
            slots: Mutex::new(slots),
            send_count: AtomicU32::new(0),
            ack_count: AtomicU32::new(0),
            space: Notify::new(),
        }
    }

    /// Map a monotonic counter onto its wire sequence number
    pub fn seq_of(counter: u32) -> u16 {
        (counter as u16) & SEQ_MASK
    }

    /// Claim the next sequence counter, waiting while the ring is full
    pub async fn reserve(&self) -> u32 {
        loop {
            let notified = self.space.notified();
            let send = self.send_count.load(Ordering::Acquire);
            let ack = self.ack_count.load(Ordering::Acquire);
            if send.wrapping_sub(ack) < BUFFER_LENGTH as u32 {
                if self
                    .send_count
                    .compare_exchange(send, send.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return send;
                }
                continue;
            }
            notified.await;
        }
    }

    /// Store the payload of a reserved slot for acknowledgment tracking
    /// and retransmission
    pub fn record(&self, counter: u32, payload: Bytes) {
        let mut slots = self.slots.lock().expect("send window poisoned");
        slots[(counter as usize) & (BUFFER_LENGTH - 1)] = Slot {
            acked: false,
            pending: Some(PendingSyn {
                payload,
                sent_at: Instant::now(),
            }),
        };
    }

    /// Mark a sequence number acknowledged and advance the contiguous
    /// prefix, clearing each consumed slot
    ///
    /// Returns whether the acknowledgment landed inside the in-flight
    /// window and was not a duplicate.
    pub fn acknowledge(&self, seq: u16) -> bool {
        let mut slots = self.slots.lock().expect("send window poisoned");
        let ack = self.ack_count.load(Ordering::Acquire);
        let send = self.send_count.load(Ordering::Acquire);
        let in_flight = send.wrapping_sub(ack);
        if in_flight == 0 {
            return false;
        }

        let base = Self::seq_of(ack);
        let offset = (seq.wrapping_sub(base) & SEQ_MASK) as u32;
        if offset >= in_flight {
            return false;
        }

        let idx = (seq & SEQ_MASK) as usize;
        if slots[idx].acked {
            return false;
        }
        slots[idx].acked = true;

        let mut cur = ack;
        while cur != send {
            let i = (cur as usize) & (BUFFER_LENGTH - 1);
            if !slots[i].acked {
                break;
            }
            slots[i] = Slot::default();
            cur = cur.wrapping_add(1);
        }
        if cur != ack {
            // Sole writer of the ack pointer, serialized by the slot lock
            self.ack_count.store(cur, Ordering::Release);
            self.space.notify_waiters();
        }
        true
    }

    /// Collect unacked datagrams older than `older_than` for
    /// retransmission, restamping their send time
    pub fn stale_payloads(&self, older_than: Duration) -> Vec<(u16, Bytes)> {
        let mut slots = self.slots.lock().expect("send window poisoned");
        let ack = self.ack_count.load(Ordering::Acquire);
        let send = self.send_count.load(Ordering::Acquire);
        let now = Instant::now();

        let mut stale = Vec::new();
        let mut cur = ack;
        while cur != send {
            let slot = &mut slots[(cur as usize) & (BUFFER_LENGTH - 1)];
            if !slot.acked {
                if let Some(pending) = &mut slot.pending {
                    if now.duration_since(pending.sent_at) >= older_than {
                        pending.sent_at = now;
                        stale.push((Self::seq_of(cur), pending.payload.clone()));
                    }
                }
            }
            cur = cur.wrapping_add(1);
        }
        stale
    }

    /// Current (send, ack) counters
    pub fn pointers(&self) -> (u32, u32) {
        (
            self.send_count.load(Ordering::Acquire),
            self.ack_count.load(Ordering::Acquire),
        )
    }

    /// Number of unconsumed in-flight slots
    pub fn in_flight(&self) -> u32 {
        let (send, ack) = self.pointers();
        send.wrapping_sub(ack)
    }

    /// Whether every sent datagram has been acknowledged and consumed
    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new()
    }
}
