//----------------------------------------------------------------------------------------------
// Module daq_event
// DAQ event engine, samples the DAQ lists bound to an event and queues the DTO packets

use log::{trace, warn};
use std::cell::RefCell;
use std::sync::atomic::Ordering;

use super::{DaqList, DTO_HEADER_SIZE_TS};
use crate::xcp::addr::{read_memory, XcpMemoryWindow};
use crate::xcp::config::XcpCapabilities;
use crate::xcp::event::{EventList, XcpEventPriority};
use crate::xcp::protocol::DAQ_HDR_FILL;
use crate::xcp::{Xcp, XcpSessionStatus};

//----------------------------------------------------------------------------------------------
// SampleBuffer

// Scratch buffer to assemble the DTO packets of one sample outside of the queue lock
struct SampleBuffer {
    data: Vec<u8>,
    lens: Vec<u16>,
}

impl SampleBuffer {
    fn new() -> SampleBuffer {
        SampleBuffer {
            data: Vec::with_capacity(4096),
            lens: Vec::with_capacity(16),
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.lens.clear();
    }
}

thread_local! {
    static SAMPLE_BUFFER: RefCell<SampleBuffer> = RefCell::new(SampleBuffer::new());
}

//----------------------------------------------------------------------------------------------
// Trigger

impl Xcp {
    /// Trigger an event, timestamp from the DAQ clock
    /// Cheap no-op if DAQ is not running
    #[inline]
    pub fn trigger_event(&self, event: u16) {
        if self.session.is(XcpSessionStatus::SS_DAQ) {
            self.trigger(event, None, None);
        }
    }

    /// Trigger an event with an explicit timestamp
    #[inline]
    pub fn trigger_event_at(&self, event: u16, timestamp: u64) {
        if self.session.is(XcpSessionStatus::SS_DAQ) {
            self.trigger(event, Some(timestamp), None);
        }
    }

    /// Trigger an event, absolute addresses of this sample are resolved in window instead of the memory window of the protocol layer
    /// Returns true if all DAQ lists of the event have been sampled and queued
    #[inline]
    pub fn trigger_event_ext(&self, event: u16, window: &XcpMemoryWindow) -> bool {
        if self.session.is(XcpSessionStatus::SS_DAQ) {
            self.trigger(event, None, Some(window))
        } else {
            false
        }
    }

    // Triggers may nest, a read_memory callback may trigger events on the same thread
    // The trigger path uses recursive read locks, a pending writer must not block a nested trigger
    fn trigger(&self, event: u16, timestamp: Option<u64>, window: Option<&XcpMemoryWindow>) -> bool {
        // The event list is write locked only while events are created or cleared
        let events = self.events.read_recursive();
        let Some(e) = events.get(event) else {
            return false;
        };
        if e.daq_list.load(Ordering::Relaxed) == EventList::XCP_UNDEFINED_DAQ_LIST {
            return false;
        }
        let realtime = e.priority == XcpEventPriority::Realtime;

        // Serialize triggers of the same event
        let _guard = if realtime { None } else { e.sync.lock() };

        let timestamp = timestamp.unwrap_or_else(|| self.clock.get_clock64());
        if self.config.capabilities.contains(XcpCapabilities::TIMESTAMP_CHECK) && !e.check_timestamp(timestamp) {
            warn!("Event {} timestamp {} not increasing", event, timestamp);
            self.session.timestamp_anomaly();
        }

        // A realtime trigger never waits for the command processor
        let daq = if realtime {
            match self.daq.try_read_recursive() {
                Some(daq) => daq,
                None => {
                    self.session.overflow();
                    return false;
                }
            }
        } else {
            self.daq.read_recursive()
        };
        if !daq.is_running() {
            return false;
        }

        let window = window.unwrap_or(&self.window);
        let flush = e.priority == XcpEventPriority::Pushing;
        let mut queued = false;
        let mut lost = false;
        let mut daq_list = e.daq_list.load(Ordering::Relaxed);
        while let Some(l) = daq.get_list(daq_list) {
            if l.is_running() && l.prescale() {
                if self.sample(daq_list, l, timestamp, window, flush, realtime) {
                    queued = true;
                } else {
                    lost = true;
                }
            }
            daq_list = l.next;
        }

        // One overflow per trigger with lost samples, regardless of the number of DAQ lists
        if lost {
            self.session.overflow();
        }
        queued && !lost
    }

    // Sample a DAQ list and queue its packets
    fn sample(&self, daq: u16, list: &DaqList, timestamp: u64, window: &XcpMemoryWindow, flush: bool, realtime: bool) -> bool {
        SAMPLE_BUFFER.with(|cell| match cell.try_borrow_mut() {
            Ok(mut buf) => self.sample_into(&mut buf, daq, list, timestamp, window, flush, realtime),
            // Trigger from within a read_memory callback of this thread
            Err(_) => self.sample_into(&mut SampleBuffer::new(), daq, list, timestamp, window, flush, realtime),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn sample_into(&self, buf: &mut SampleBuffer, daq: u16, list: &DaqList, timestamp: u64, window: &XcpMemoryWindow, flush: bool, realtime: bool) -> bool {
        buf.clear();
        for (i, odt) in list.odts.iter().enumerate() {
            let start = buf.data.len();
            buf.data.push(i as u8);
            buf.data.push(DAQ_HDR_FILL);
            buf.data.extend_from_slice(&daq.to_le_bytes());
            if i == 0 {
                buf.data.extend_from_slice(&(timestamp as u32).to_le_bytes());
                debug_assert_eq!(buf.data.len() - start, DTO_HEADER_SIZE_TS);
            }
            for entry in &odt.entries {
                if entry.size == 0 {
                    continue;
                }
                let p = buf.data.len();
                buf.data.resize(p + entry.size as usize, 0);
                if read_memory(self.appl.as_ref(), window, entry.ext, entry.addr, &mut buf.data[p..]).is_err() {
                    trace!("DAQ {}: {:?}:0x{:08X} not readable", daq, entry.ext, entry.addr);
                    buf.data[p..].fill(0);
                }
            }
            buf.lens.push((buf.data.len() - start) as u16);
        }
        self.queue.push_packets(&buf.data, &buf.lens, flush, realtime)
    }
}

//-------------------------------------------------------------------------------------------------
// Test module

#[cfg(test)]
mod daq_event_tests {
    use super::*;
    use crate::xcp::appl::XcpDefaultAppl;
    use crate::xcp::config::XcpConfig;
    use crate::xcp::appl::XcpAppl;
    use crate::xcp::clock::XcpClock;
    use crate::xcp::protocol::XcpCmdError;
    use crate::xcp::xcp_test::{test_setup, test_xcp};
    use crate::xcp::XcpBuilder;
    use once_cell::sync::OnceCell;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::{Arc, Weak};
    use std::thread;
    use std::time::Duration;

    // Configure one DAQ list with one ODT for each (event, entries) and start all of them
    fn start_daq_lists(xcp: &Xcp, lists: &[(u16, &[(u8, u32, u8)])]) {
        let events = xcp.events.read();
        let mut daq = xcp.daq.write();
        daq.free();
        daq.alloc_daq(lists.len() as u16).unwrap();
        for i in 0..lists.len() {
            daq.alloc_odt(i as u16, 1).unwrap();
        }
        for (i, (_, entries)) in lists.iter().enumerate() {
            daq.alloc_odt_entry(i as u16, 0, entries.len() as u8).unwrap();
        }
        for (i, (event, entries)) in lists.iter().enumerate() {
            daq.set_daq_ptr(i as u16, 0, 0).unwrap();
            for &(ext, addr, size) in *entries {
                daq.write_daq(0xFF, size, ext, addr).unwrap();
            }
            daq.set_daq_list_mode(i as u16, 0x10, *event, 1, 0, events.len()).unwrap();
        }
        daq.bind_events(&events);
        let all: Vec<u16> = (0..lists.len() as u16).collect();
        daq.start_lists(&all);
        xcp.session.start_daq(xcp.clock.get_clock64());
    }

    // Configure DAQ list 0 with one ODT for event and start it
    fn start_daq(xcp: &Xcp, event: u16, entries: &[(u8, u32, u8)]) {
        start_daq_lists(xcp, &[(event, entries)]);
    }

    // Decode (daq, timestamp, data) of a single ODT DTO
    fn decode_dto(p: &[u8]) -> (u16, u32, &[u8]) {
        assert_eq!(p[0], 0);
        assert_eq!(p[1], DAQ_HDR_FILL);
        let daq = u16::from_le_bytes([p[2], p[3]]);
        let timestamp = u32::from_le_bytes([p[4], p[5], p[6], p[7]]);
        (daq, timestamp, &p[8..])
    }

    // Clock advancing by one tick on every read
    struct TickClock(AtomicU64);

    impl XcpClock for TickClock {
        fn get_clock64(&self) -> u64 {
            self.0.fetch_add(1, Ordering::Relaxed) + 1
        }
        fn ticks_per_second(&self) -> u64 {
            1_000_000_000
        }
    }

    // Started protocol layer with timestamp check and a strictly increasing clock
    fn tick_clock_xcp(capabilities: XcpCapabilities) -> Xcp {
        test_setup();
        let config = XcpConfig {
            queue_size: 1024,
            capabilities: XcpCapabilities::default() | XcpCapabilities::TIMESTAMP_CHECK | capabilities,
            ..XcpConfig::default()
        };
        let xcp = XcpBuilder::new("test").set_config(config).set_clock(Box::new(TickClock(AtomicU64::new(0)))).build().unwrap();
        xcp.start();
        xcp
    }

    #[test]
    fn test_trigger_not_running() {
        let xcp = test_xcp(XcpConfig::default(), Box::new(XcpDefaultAppl));
        let event = xcp.create_event("e", 0, XcpEventPriority::Queued, 1, 0);
        event.trigger(&xcp);
        assert!(!event.trigger_ext(&xcp, &XcpMemoryWindow::empty()));
        assert_eq!(xcp.queue.level(), 0);
        assert_eq!(xcp.get_daq_overflow_count(), 0);
    }

    #[test]
    fn test_trigger_sample() {
        let xcp = test_xcp(XcpConfig::default(), Box::new(XcpDefaultAppl));
        let event = xcp.create_event("e", 0, XcpEventPriority::Queued, 1, 0);
        xcp.window.write(0x10, &[1, 2, 3, 4]).unwrap();
        // Unreadable entry is sampled as zero
        start_daq(&xcp, event.get_id(), &[(1, 0x10, 4), (0, 0x1000, 2), (1, 0x12, 1)]);
        assert!(xcp.is_daq_event_running(event.get_id()));

        event.trigger_at(&xcp, 0x1_2345_6789);
        let p = xcp.queue.pop_packet().unwrap();
        assert_eq!(p, vec![0, 0xAA, 0, 0, 0x89, 0x67, 0x45, 0x23, 1, 2, 3, 4, 0, 0, 3]);
        assert!(xcp.queue.pop_packet().is_none());
    }

    #[test]
    fn test_trigger_ext() {
        let xcp = test_xcp(XcpConfig::default(), Box::new(XcpDefaultAppl));
        let event = xcp.create_event("e", 0, XcpEventPriority::Pushing, 1, 0);
        start_daq(&xcp, event.get_id(), &[(1, 4, 2)]);

        let mem: &'static mut [u8] = Box::leak(vec![7u8, 6, 5, 4, 3, 2, 1, 0].into_boxed_slice());
        let window = XcpMemoryWindow::from_static_mut(mem);
        assert!(event.trigger_ext(&xcp, &window));
        assert!(xcp.queue.is_flush_requested());
        let p = xcp.queue.pop_packet().unwrap();
        assert_eq!(&p[8..], &[3, 2]);
    }

    #[test]
    fn test_overflow() {
        let config = XcpConfig {
            queue_size: 8,
            ..XcpConfig::default()
        };
        let xcp = test_xcp(config, Box::new(XcpDefaultAppl));
        let event = xcp.create_event("e", 0, XcpEventPriority::Queued, 1, 0);
        start_daq(&xcp, event.get_id(), &[(1, 0, 4)]);

        let mut queued = 0;
        for _ in 0..10 {
            if event.trigger_ext(&xcp, &xcp.window) {
                queued += 1;
            }
        }
        assert_eq!(queued, 8);
        assert_eq!(xcp.get_daq_overflow_count(), 2);
        assert!(xcp.get_session_status().contains(XcpSessionStatus::SS_OVERFLOW));
    }

    #[test]
    fn test_timestamp_anomaly() {
        let config = XcpConfig {
            capabilities: XcpCapabilities::default() | XcpCapabilities::TIMESTAMP_CHECK,
            ..XcpConfig::default()
        };
        let xcp = test_xcp(config, Box::new(XcpDefaultAppl));
        let event = xcp.create_event("e", 0, XcpEventPriority::Queued, 1, 0);
        start_daq(&xcp, event.get_id(), &[(1, 0, 1)]);
        event.trigger_at(&xcp, 100);
        event.trigger_at(&xcp, 200);
        event.trigger_at(&xcp, 150);
        assert_eq!(xcp.get_timestamp_anomaly_count(), 1);
        // Anomalies do not block sampling
        assert_eq!(xcp.queue.level(), 3);
    }

    #[test]
    fn test_concurrent_triggers() {
        let config = XcpConfig {
            queue_size: 64,
            capabilities: XcpCapabilities::default() | XcpCapabilities::MULTITHREAD_EVENTS,
            ..XcpConfig::default()
        };
        let xcp = Arc::new(test_xcp(config, Box::new(XcpDefaultAppl)));
        let event = xcp.create_event("e", 0, XcpEventPriority::Queued, 1, 0);
        start_daq(&xcp, event.get_id(), &[(1, 0, 8)]);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let xcp = xcp.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        event.trigger(&xcp);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        // Every trigger is either queued or counted as overflow
        assert_eq!(xcp.queue.level() + xcp.get_daq_overflow_count() as usize, 200);
        assert_eq!(xcp.queue.level(), 64);
    }

    #[test]
    fn test_same_event_order_single_thread() {
        let xcp = tick_clock_xcp(XcpCapabilities::empty());
        let event = xcp.create_event("e", 0, XcpEventPriority::Queued, 1, 0);
        start_daq(&xcp, event.get_id(), &[(1, 0, 4)]);
        for i in 0..100u32 {
            xcp.window.write(0, &i.to_le_bytes()).unwrap();
            event.trigger(&xcp);
        }

        let mut last_timestamp = 0;
        for i in 0..100u32 {
            let p = xcp.queue.pop_packet().unwrap();
            let (daq, timestamp, data) = decode_dto(&p);
            assert_eq!(daq, 0);
            assert_eq!(data, &i.to_le_bytes());
            assert!(timestamp > last_timestamp);
            last_timestamp = timestamp;
        }
        assert!(xcp.queue.pop_packet().is_none());
        assert_eq!(xcp.get_timestamp_anomaly_count(), 0);
        assert_eq!(xcp.get_daq_overflow_count(), 0);
    }

    #[test]
    fn test_same_event_order_multi_thread() {
        const THREADS: u8 = 4;
        const TRIGGERS: u32 = 100;

        let xcp = Arc::new(tick_clock_xcp(XcpCapabilities::MULTITHREAD_EVENTS));
        let event = xcp.create_event("e", 0, XcpEventPriority::Queued, 1, 0);
        // Thread id at 0, thread local trigger counter at 4
        start_daq(&xcp, event.get_id(), &[(1, 0, 1), (1, 4, 4)]);

        let threads: Vec<_> = (0..THREADS)
            .map(|id| {
                let xcp = Arc::clone(&xcp);
                thread::spawn(move || {
                    let mem: &'static mut [u8] = Box::leak(vec![0u8; 8].into_boxed_slice());
                    let window = XcpMemoryWindow::from_static_mut(mem);
                    window.write(0, &[id]).unwrap();
                    for i in 0..TRIGGERS {
                        window.write(4, &i.to_le_bytes()).unwrap();
                        assert!(event.trigger_ext(&xcp, &window));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // Per thread trigger order is kept, timestamps never decrease in queue order
        let mut next = [0u32; THREADS as usize];
        let mut last_timestamp = 0;
        while let Some(p) = xcp.queue.pop_packet() {
            let (_, timestamp, data) = decode_dto(&p);
            let id = data[0] as usize;
            let counter = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
            assert_eq!(counter, next[id]);
            next[id] += 1;
            assert!(timestamp >= last_timestamp);
            last_timestamp = timestamp;
        }
        assert_eq!(next, [TRIGGERS; THREADS as usize]);
        assert_eq!(xcp.get_timestamp_anomaly_count(), 0);
        assert_eq!(xcp.get_daq_overflow_count(), 0);
    }

    #[test]
    fn test_realtime_near_capacity() {
        // 2 of 16 packets are reserved for non realtime producers
        let config = XcpConfig {
            queue_size: 16,
            ..XcpConfig::default()
        };
        let xcp = test_xcp(config, Box::new(XcpDefaultAppl));
        let realtime = xcp.create_event("rt", 0, XcpEventPriority::Realtime, 1, 0);
        let queued = xcp.create_event("q", 0, XcpEventPriority::Queued, 1, 0);
        // Two DAQ lists on the realtime event, one packet each
        start_daq_lists(&xcp, &[(realtime.get_id(), &[(1, 0, 4)]), (realtime.get_id(), &[(1, 4, 4)]), (queued.get_id(), &[(1, 0, 1)])]);

        let ok = (0..10).filter(|_| realtime.trigger_ext(&xcp, &xcp.window)).count();
        assert_eq!(ok, 7);
        assert_eq!(xcp.queue.level(), 14);
        // One overflow per lost trigger
        assert_eq!(xcp.get_daq_overflow_count(), 3);

        // The reserve is left for queued events
        assert!(queued.trigger_ext(&xcp, &xcp.window));
        assert!(queued.trigger_ext(&xcp, &xcp.window));
        assert!(!queued.trigger_ext(&xcp, &xcp.window));
        assert_eq!(xcp.get_daq_overflow_count(), 4);

        // A realtime trigger does not wait for a DAQ table writer
        xcp.queue.clear();
        {
            let _daq = xcp.daq.write();
            assert!(!realtime.trigger_ext(&xcp, &xcp.window));
        }
        assert_eq!(xcp.get_daq_overflow_count(), 5);
        assert!(realtime.trigger_ext(&xcp, &xcp.window));
        assert_eq!(xcp.queue.level(), 2);
    }

    // Application which triggers events from within read_memory, while another thread waits to create an event
    #[derive(Default)]
    struct NestingState {
        xcp: OnceCell<Weak<Xcp>>,
        nested: AtomicBool,
        writer: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
    }

    struct NestingAppl(Arc<NestingState>);

    impl XcpAppl for NestingAppl {
        fn read_memory(&self, _addr: u32, dst: &mut [u8]) -> Result<(), XcpCmdError> {
            dst.fill(0x55);
            if self.0.nested.swap(true, Ordering::Relaxed) {
                return Ok(());
            }
            if let Some(xcp) = self.0.xcp.get().and_then(Weak::upgrade) {
                let writer = {
                    let xcp = Arc::clone(&xcp);
                    thread::spawn(move || {
                        xcp.create_event("late", 0, XcpEventPriority::Queued, 1, 0);
                    })
                };
                // Give the writer time to park on the event list lock
                thread::sleep(Duration::from_millis(50));
                xcp.trigger_event(1);
                xcp.trigger_event(0);
                *self.0.writer.lock() = Some(writer);
            }
            Ok(())
        }
    }

    #[test]
    fn test_nested_trigger() {
        let config = XcpConfig {
            capabilities: XcpCapabilities::default() | XcpCapabilities::MULTITHREAD_EVENTS,
            ..XcpConfig::default()
        };
        let state = Arc::new(NestingState::default());
        let xcp = Arc::new(test_xcp(config, Box::new(NestingAppl(Arc::clone(&state)))));
        assert!(state.xcp.set(Arc::downgrade(&xcp)).is_ok());
        let outer = xcp.create_event("outer", 0, XcpEventPriority::Queued, 1, 0);
        let inner = xcp.create_event("inner", 0, XcpEventPriority::Queued, 1, 0);
        xcp.window.write(0, &[1, 2, 3, 4]).unwrap();
        // Outer event samples application memory, inner event the memory window
        start_daq_lists(&xcp, &[(outer.get_id(), &[(0, 0, 2)]), (inner.get_id(), &[(1, 0, 4)])]);

        // Nested triggers of another event and of the same event complete
        assert!(outer.trigger_ext(&xcp, &xcp.window));
        let writer = state.writer.lock().take().unwrap();
        writer.join().unwrap();
        assert_eq!(xcp.get_event_list().len(), 3);

        let p = xcp.queue.pop_packet().unwrap();
        let (daq, _, data) = decode_dto(&p);
        assert_eq!((daq, data), (1, &[1u8, 2, 3, 4][..]));
        for _ in 0..2 {
            let p = xcp.queue.pop_packet().unwrap();
            let (daq, _, data) = decode_dto(&p);
            assert_eq!((daq, data), (0, &[0x55u8, 0x55][..]));
        }
        assert!(xcp.queue.pop_packet().is_none());
        assert_eq!(xcp.get_daq_overflow_count(), 0);
    }
}
