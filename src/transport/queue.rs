//! Bounded ring of preallocated datagram slots that turns the connectionless
//! UDP socket into a per-peer byte source for the handshake. Single
//! producer (the demultiplexer), single consumer (the registration task).
//! `enqueue` drops on overflow; `read_into` blocks until data or close.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::constants::{REGISTRATION_QUEUE_DEPTH, REGISTRATION_SLOT};
use crate::error::{Result, TunnelError};

struct Slot {
    buf: Box<[u8]>,
    len: usize,
}

struct Inner {
    slots: Vec<Slot>,
    head: usize,
    count: usize,
    closed: bool,
}

pub struct RegistrationQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    depth: usize,
}

impl RegistrationQueue {
    pub fn new() -> Self {
        Self::with_depth(REGISTRATION_QUEUE_DEPTH)
    }

    pub fn with_depth(depth: usize) -> Self {
        let slots = (0..depth)
            .map(|_| Slot { buf: vec![0u8; REGISTRATION_SLOT].into_boxed_slice(), len: 0 })
            .collect();
        Self {
            inner: Mutex::new(Inner { slots, head: 0, count: 0, closed: false }),
            notify: Notify::new(),
            depth,
        }
    }

    /// Copy a datagram into the next free slot. Returns false (dropping the
    /// packet) when the queue is full, closed, or the packet exceeds the
    /// slot size.
    pub fn enqueue(&self, datagram: &[u8]) -> bool {
        if datagram.len() > REGISTRATION_SLOT {
            return false;
        }
        {
            let mut inner = self.inner.lock();
            if inner.closed || inner.count == self.depth {
                return false;
            }
            let tail = (inner.head + inner.count) % self.depth;
            inner.slots[tail].buf[..datagram.len()].copy_from_slice(datagram);
            inner.slots[tail].len = datagram.len();
            inner.count += 1;
        }
        self.notify.notify_one();
        true
    }

    /// Pop the oldest datagram into `buf`, waiting for one to arrive.
    /// A closed and drained queue reads as `TransportClosed` (EOF).
    pub async fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if inner.count > 0 {
                    let head = inner.head;
                    let len = inner.slots[head].len.min(buf.len());
                    buf[..len].copy_from_slice(&inner.slots[head].buf[..len]);
                    inner.head = (head + 1) % self.depth;
                    inner.count -= 1;
                    return Ok(len);
                }
                if inner.closed {
                    return Err(TunnelError::TransportClosed);
                }
            }
            notified.await;
        }
    }

    /// Close the queue and wake any waiter.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for RegistrationQueue {
    fn default() -> Self {
        Self::new()
    }
}
