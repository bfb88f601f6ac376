//----------------------------------------------------------------------------------------------
// Module event
// Event registry, fixed capacity table of measurement events

use log::{debug, error};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use super::XcpEvent;

//----------------------------------------------------------------------------------------------
// XcpEventPriority

/// Queueing discipline of the DAQ packets of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XcpEventPriority {
    /// Packets are buffered for coalesced transmission
    Queued = 0,
    /// Transmission is requested immediately after the packets are queued
    Pushing = 1,
    /// Lock free and loss tolerant, samples are dropped instead of waiting
    Realtime = 2,
}

impl From<u8> for XcpEventPriority {
    fn from(value: u8) -> Self {
        match value {
            0 => XcpEventPriority::Queued,
            1 => XcpEventPriority::Pushing,
            _ => XcpEventPriority::Realtime,
        }
    }
}

//----------------------------------------------------------------------------------------------
// Cycle time

/// Normalize a cycle time in ns to a XCP cycle time (count, unit)
/// The unit is a power of 10 multiplier of 1ns, count = 0 means sporadic
pub fn cycle_time_from_ns(cycle_time_ns: u32) -> (u8, u8) {
    let mut ns = cycle_time_ns;
    let mut unit: u8 = 0;
    while ns >= 256 {
        ns /= 10;
        unit += 1;
    }
    (ns as u8, unit)
}

//----------------------------------------------------------------------------------------------
// XcpEventInfo

/// Snapshot of the properties of an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XcpEventInfo {
    pub id: u16,
    pub name: String,
    /// Size of externally supplied sample payload
    pub size: u32,
    /// Cycle time count, 0 = sporadic
    pub cycle_time_count: u8,
    /// Cycle time unit, 10^unit ns
    pub cycle_time_unit: u8,
    /// Number of samples packed into one event (burst)
    pub sample_count: u16,
    /// First DAQ list bound to this event or XCP_UNDEFINED_DAQ_LIST
    pub daq_list: u16,
    pub priority: XcpEventPriority,
}

impl XcpEventInfo {
    /// Decoded cycle time in ns, 0 = sporadic
    pub fn cycle_time_ns(&self) -> u64 {
        self.cycle_time_count as u64 * 10u64.pow(self.cycle_time_unit as u32)
    }
}

//----------------------------------------------------------------------------------------------
// EventSync
// Serialization of concurrent triggers of the same event
// Reentrant, a read_memory callback may trigger the same event again on this thread

pub(crate) enum EventSync {
    Unsynchronized,
    Mutex(ReentrantMutex<()>),
}

impl EventSync {
    #[inline]
    pub fn lock(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        match self {
            EventSync::Unsynchronized => None,
            EventSync::Mutex(m) => Some(m.lock()),
        }
    }
}

//----------------------------------------------------------------------------------------------
// EventEntry

pub(crate) struct EventEntry {
    pub name: String,
    pub size: u32,
    pub cycle_time_count: u8,
    pub cycle_time_unit: u8,
    pub sample_count: u16,
    pub priority: XcpEventPriority,
    // Head of the chain of DAQ lists bound to this event
    pub daq_list: AtomicU16,
    pub sync: EventSync,
    // Last trigger timestamp + 1, 0 before the first trigger
    pub last_timestamp: AtomicU64,
}

impl EventEntry {
    fn info(&self, id: u16) -> XcpEventInfo {
        XcpEventInfo {
            id,
            name: self.name.clone(),
            size: self.size,
            cycle_time_count: self.cycle_time_count,
            cycle_time_unit: self.cycle_time_unit,
            sample_count: self.sample_count,
            daq_list: self.daq_list.load(Ordering::Relaxed),
            priority: self.priority,
        }
    }

    /// Record a trigger timestamp, returns false if the timestamp is not increasing
    #[inline]
    pub fn check_timestamp(&self, timestamp: u64) -> bool {
        let next = timestamp.saturating_add(1);
        let last = self.last_timestamp.fetch_max(next, Ordering::Relaxed);
        next > last
    }
}

//----------------------------------------------------------------------------------------------
// EventList

pub(crate) struct EventList {
    events: Vec<EventEntry>,
    capacity: u16,
    max_name: usize,
    multithread: bool,
}

impl EventList {
    pub const XCP_UNDEFINED_DAQ_LIST: u16 = 0xFFFF;

    pub fn new(capacity: u16, max_name: usize, multithread: bool) -> EventList {
        EventList {
            events: Vec::with_capacity(capacity as usize),
            capacity,
            max_name,
            multithread,
        }
    }

    pub fn clear(&mut self) {
        debug!("Clear event list");
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn get(&self, id: u16) -> Option<&EventEntry> {
        self.events.get(id as usize)
    }

    pub fn get_info(&self, id: u16) -> Option<XcpEventInfo> {
        self.get(id).map(|e| e.info(id))
    }

    pub fn get_info_list(&self) -> Vec<XcpEventInfo> {
        self.events.iter().enumerate().map(|(i, e)| e.info(i as u16)).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EventEntry> {
        self.events.iter()
    }

    /// Create a new event in the next free slot
    /// Returns XcpEvent::XCP_UNDEFINED_EVENT if the registry is full
    pub fn create_event(&mut self, name: &str, cycle_time_ns: u32, priority: XcpEventPriority, sample_count: u16, size: u32) -> XcpEvent {
        if self.events.len() >= self.capacity as usize {
            error!("Maximum number of events ({}) exceeded, event {} not created", self.capacity, name);
            return XcpEvent::XCP_UNDEFINED_EVENT;
        }
        let id = self.events.len() as u16;

        // Truncate the name at a char boundary
        let mut len = name.len().min(self.max_name);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let name = &name[..len];

        let (cycle_time_count, cycle_time_unit) = cycle_time_from_ns(cycle_time_ns);
        debug!(
            "Create event {} id={}, cycle={}*10^{}ns, priority={:?}, size={}",
            name, id, cycle_time_count, cycle_time_unit, priority, size
        );

        self.events.push(EventEntry {
            name: name.to_string(),
            size,
            cycle_time_count,
            cycle_time_unit,
            sample_count,
            priority,
            daq_list: AtomicU16::new(EventList::XCP_UNDEFINED_DAQ_LIST),
            sync: if self.multithread { EventSync::Mutex(ReentrantMutex::new(())) } else { EventSync::Unsynchronized },
            last_timestamp: AtomicU64::new(0),
        });
        XcpEvent::new(id)
    }

    /// Unbind all DAQ lists and reset the timestamp history
    pub fn reset_daq_lists(&self) {
        for e in &self.events {
            e.daq_list.store(EventList::XCP_UNDEFINED_DAQ_LIST, Ordering::Relaxed);
            e.last_timestamp.store(0, Ordering::Relaxed);
        }
    }
}

//-------------------------------------------------------------------------------------------------
// Test module
