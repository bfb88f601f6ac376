//----------------------------------------------------------------------------------------------
// Module queue
// Transmit queue, bounded multi producer single consumer queue of XCP packets
// Packets are stored in preallocated slots, producers never allocate and never wait on the consumer

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

// Transport layer message header: dlc u16, ctr u16
pub const XCPTL_TRANSPORT_LAYER_HEADER_SIZE: usize = 4;

struct QueueEntry {
    ctr: u16,
    data: Vec<u8>,
}

struct QueueInner {
    entries: Vec<QueueEntry>,
    head: usize, // Index of the oldest packet
    len: usize,  // Number of packets in the queue
    ctr: u16,    // Next transport layer message counter
    flush: bool, // Flush requested
}

/// Transmit queue of the protocol layer
/// Producers are the command processor and the DAQ event engine, the consumer is the transport layer
pub struct XcpTlQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
    capacity: usize,
    reserve: usize,
    max_packet_size: usize,
}

impl XcpTlQueue {
    /// Create a queue with capacity packets of maximum size max_packet_size
    /// The last capacity/8 packets are not available for realtime producers
    pub fn new(capacity: usize, max_packet_size: usize) -> XcpTlQueue {
        debug!("Create transmit queue, capacity={}, max_packet_size={}", capacity, max_packet_size);
        let entries = (0..capacity)
            .map(|_| QueueEntry {
                ctr: 0,
                data: Vec::with_capacity(max_packet_size),
            })
            .collect();
        XcpTlQueue {
            inner: Mutex::new(QueueInner {
                entries,
                head: 0,
                len: 0,
                ctr: 0,
                flush: false,
            }),
            cond: Condvar::new(),
            capacity,
            reserve: capacity / 8,
            max_packet_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of packets in the queue
    pub fn level(&self) -> usize {
        self.inner.lock().len
    }

    /// Discard all packets and restart the message counter
    pub fn clear(&self) {
        let mut q = self.inner.lock();
        if q.len > 0 {
            debug!("Transmit queue cleared, {} packets discarded", q.len);
        }
        q.head = 0;
        q.len = 0;
        q.ctr = 0;
        q.flush = false;
    }

    /// Push a single packet
    pub fn push(&self, packet: &[u8], flush: bool) -> bool {
        self.push_packets(packet, &[packet.len() as u16], flush, false)
    }

    /// Push all packets of a sample or none of them
    /// buf holds the concatenated packets, lens their sizes
    /// A realtime producer never waits for the queue lock and can not use the reserved part of the queue
    pub fn push_packets(&self, buf: &[u8], lens: &[u16], flush: bool, realtime: bool) -> bool {
        let mut q = if realtime {
            match self.inner.try_lock() {
                Some(q) => q,
                None => return false,
            }
        } else {
            self.inner.lock()
        };

        let limit = if realtime { self.capacity - self.reserve } else { self.capacity };
        if q.len + lens.len() > limit {
            return false;
        }

        let mut offset = 0;
        for &len in lens {
            let len = len as usize;
            let packet = &buf[offset..offset + len];
            offset += len;
            debug_assert!(len <= self.max_packet_size);
            let index = (q.head + q.len) % self.capacity;
            let ctr = q.ctr;
            q.ctr = ctr.wrapping_add(1);
            q.len += 1;
            let entry = &mut q.entries[index];
            entry.ctr = ctr;
            entry.data.clear();
            entry.data.extend_from_slice(packet);
        }

        if flush {
            q.flush = true;
        }
        let notify = flush || q.len >= self.capacity / 2;
        drop(q);
        if notify {
            self.cond.notify_one();
        }
        true
    }

    /// Pop the oldest packet
    pub fn pop_packet(&self) -> Option<Vec<u8>> {
        let mut q = self.inner.lock();
        if q.len == 0 {
            q.flush = false;
            return None;
        }
        let index = q.head;
        q.head = (q.head + 1) % self.capacity;
        q.len -= 1;
        let packet = q.entries[index].data.clone();
        trace!("pop_packet: ctr={}, len={}", q.entries[index].ctr, packet.len());
        Some(packet)
    }

    /// Pop packets as a transport layer segment
    /// Each packet is preceded by its transport layer header (dlc u16, ctr u16)
    /// The segment contains at least one packet and does not exceed max_segment_size otherwise
    pub fn pop_segment(&self, max_segment_size: usize) -> Option<Vec<u8>> {
        let mut q = self.inner.lock();
        if q.len == 0 {
            q.flush = false;
            return None;
        }
        let mut segment = Vec::with_capacity(max_segment_size);
        while q.len > 0 {
            let index = q.head;
            let entry = &q.entries[index];
            let size = entry.data.len() + XCPTL_TRANSPORT_LAYER_HEADER_SIZE;
            if !segment.is_empty() && segment.len() + size > max_segment_size {
                break;
            }
            segment.extend_from_slice(&(entry.data.len() as u16).to_le_bytes());
            segment.extend_from_slice(&entry.ctr.to_le_bytes());
            segment.extend_from_slice(&entry.data);
            q.head = (q.head + 1) % self.capacity;
            q.len -= 1;
        }
        if q.len == 0 {
            q.flush = false;
        }
        Some(segment)
    }

    /// Wait until a flush is requested, the queue is half full or timeout elapsed
    /// Returns true if there are packets in the queue
    pub fn wait_for_packets(&self, timeout: Duration) -> bool {
        let mut q = self.inner.lock();
        if !q.flush && q.len < self.capacity / 2 {
            let _ = self.cond.wait_for(&mut q, timeout);
        }
        q.len > 0
    }

    /// Flush requested and not yet fully consumed
    pub fn is_flush_requested(&self) -> bool {
        self.inner.lock().flush
    }
}

//-------------------------------------------------------------------------------------------------
// Test module

#[cfg(test)]
mod queue_tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_pop() {
        let q = XcpTlQueue::new(8, 16);
        assert!(q.push(&[1, 2, 3], false));
        assert!(q.push(&[4], true));
        assert_eq!(q.level(), 2);
        assert!(q.is_flush_requested());
        assert_eq!(q.pop_packet().unwrap(), vec![1, 2, 3]);
        assert_eq!(q.pop_packet().unwrap(), vec![4]);
        assert!(q.pop_packet().is_none());
        assert!(!q.is_flush_requested());
    }

    #[test]
    fn test_all_or_nothing() {
        let q = XcpTlQueue::new(8, 16);
        let buf = [0u8; 12];
        assert!(q.push_packets(&buf, &[4, 4, 4], false, false));
        assert!(q.push_packets(&buf, &[4, 4, 4], false, false));
        assert!(!q.push_packets(&buf, &[4, 4, 4], false, false));
        assert_eq!(q.level(), 6);
        assert!(q.push_packets(&buf[..8], &[4, 4], false, false));
        assert_eq!(q.level(), 8);
    }

    #[test]
    fn test_realtime_reserve() {
        let q = XcpTlQueue::new(16, 16);
        for _ in 0..14 {
            assert!(q.push_packets(&[0; 4], &[4], false, true));
        }
        // Last 2 packets are reserved
        assert!(!q.push_packets(&[0; 4], &[4], false, true));
        assert!(q.push_packets(&[0; 4], &[4], false, false));
        assert!(q.push_packets(&[0; 4], &[4], false, false));
        assert!(!q.push_packets(&[0; 4], &[4], false, false));
    }

    #[test]
    fn test_segment() {
        let q = XcpTlQueue::new(8, 16);
        for i in 0..5u8 {
            assert!(q.push(&[i; 6], false));
        }
        // 10 bytes per message, 2 messages fit into 25 bytes
        let s = q.pop_segment(25).unwrap();
        assert_eq!(s.len(), 20);
        assert_eq!(&s[0..4], &[6, 0, 0, 0]);
        assert_eq!(&s[10..14], &[6, 0, 1, 0]);
        assert_eq!(s[14], 1);
        let s = q.pop_segment(1000).unwrap();
        assert_eq!(s.len(), 30);
        assert_eq!(&s[2..4], &[2, 0]);
        assert!(q.pop_segment(1000).is_none());

        // Counter restarts after clear
        q.push(&[0], false);
        q.clear();
        q.push(&[0], false);
        let s = q.pop_segment(1000).unwrap();
        assert_eq!(&s[2..4], &[0, 0]);
    }

    #[test]
    fn test_wait_for_packets() {
        let q = Arc::new(XcpTlQueue::new(8, 16));
        assert!(!q.wait_for_packets(Duration::from_millis(1)));
        let q1 = q.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            q1.push(&[1], true);
        });
        let mut ok = false;
        for _ in 0..100 {
            if q.wait_for_packets(Duration::from_millis(100)) {
                ok = true;
                break;
            }
        }
        t.join().unwrap();
        assert!(ok);
    }
}
