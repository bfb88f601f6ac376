//----------------------------------------------------------------------------------------------
// Module daq
// DAQ lists, ODTs and ODT entries, dynamic allocation and event binding

use bitflags::bitflags;
use log::{debug, info, trace};
use std::sync::atomic::{AtomicU8, Ordering};

use super::addr::XcpAddrExt;
use super::config::XcpConfig;
use super::event::EventList;
use super::protocol::*;

// Submodule daq_event
pub(crate) mod daq_event;

//----------------------------------------------------------------------------------------------
// DAQ memory accounting

const DAQ_LIST_MEM_SIZE: usize = 16;
const ODT_MEM_SIZE: usize = 4;
const ODT_ENTRY_MEM_SIZE: usize = 5;

// DTO header: odt u8, fill u8, daq u16
pub(crate) const DTO_HEADER_SIZE: usize = 4;
// DTO header with 32 bit timestamp in the first ODT of a sample
pub(crate) const DTO_HEADER_SIZE_TS: usize = DTO_HEADER_SIZE + 4;

// Bit offset of a WRITE_DAQ entry without bit stimulation
const WRITE_DAQ_NO_BIT_OFFSET: u8 = 0xFF;

bitflags! {
    /// State of a DAQ list, reported together with the mode by GET_DAQ_LIST_MODE
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DaqListState: u8 {
        const SELECTED = 0x01;
        const RUNNING  = 0x40;
    }
}

//----------------------------------------------------------------------------------------------
// DaqList, Odt, OdtEntry

#[derive(Debug, Clone, Copy)]
pub(crate) struct OdtEntry {
    pub ext: XcpAddrExt,
    pub addr: u32,
    pub size: u8,
}

#[derive(Debug)]
pub(crate) struct Odt {
    pub entries: Vec<OdtEntry>,
    pub size: usize, // Payload size
}

#[derive(Debug)]
pub(crate) struct DaqList {
    pub odts: Vec<Odt>,
    pub event: u16,
    pub mode: u8,
    pub state: DaqListState,
    pub prescaler: u8,
    pub prescaler_ctr: AtomicU8,
    pub priority: u8,
    // Next DAQ list bound to the same event
    pub next: u16,
}

impl DaqList {
    fn new() -> DaqList {
        DaqList {
            odts: Vec::new(),
            event: EventList::XCP_UNDEFINED_DAQ_LIST,
            mode: DAQ_MODE_TIMESTAMP,
            state: DaqListState::empty(),
            prescaler: 1,
            prescaler_ctr: AtomicU8::new(0),
            priority: 0,
            next: EventList::XCP_UNDEFINED_DAQ_LIST,
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state.contains(DaqListState::RUNNING)
    }

    /// Prescaler check, true if this event cycle is sampled
    #[inline]
    pub fn prescale(&self) -> bool {
        if self.prescaler <= 1 {
            return true;
        }
        // Unsynchronized triggers may race past the prescaler, the counter wraps
        let ctr = self.prescaler_ctr.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if ctr >= self.prescaler {
            self.prescaler_ctr.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Size of a complete sample of this DAQ list in bytes, including headers
    pub fn sample_size(&self) -> usize {
        self.odts
            .iter()
            .enumerate()
            .map(|(i, odt)| odt.size + if i == 0 { DTO_HEADER_SIZE_TS } else { DTO_HEADER_SIZE })
            .sum()
    }
}

//----------------------------------------------------------------------------------------------
// DaqTables

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocState {
    Freed,
    Daq,
    Odt,
    OdtEntry,
}

#[derive(Debug, Clone, Copy)]
struct DaqPtr {
    daq: u16,
    odt: u8,
    idx: u8,
}

/// Dynamic DAQ configuration
/// Written by the command processor, read by the DAQ event engine
pub(crate) struct DaqTables {
    lists: Vec<DaqList>,
    alloc: AllocState,
    mem_used: usize,
    mem_size: usize,
    max_daq: u16,
    max_dto: usize,
    ptr: Option<DaqPtr>,
    running: bool,
    prepared: bool,
}

impl DaqTables {
    pub fn new(config: &XcpConfig) -> DaqTables {
        DaqTables {
            lists: Vec::new(),
            alloc: AllocState::Freed,
            mem_used: 0,
            mem_size: config.daq_mem_size,
            max_daq: config.max_daq,
            max_dto: config.max_dto as usize,
            ptr: None,
            running: false,
            prepared: false,
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[inline]
    pub fn get_list(&self, daq: u16) -> Option<&DaqList> {
        self.lists.get(daq as usize)
    }

    pub fn get_list_count(&self) -> u16 {
        self.lists.len() as u16
    }

    pub fn get_mem_used(&self) -> usize {
        self.mem_used
    }

    fn get_list_mut(&mut self, daq: u16) -> Result<&mut DaqList, XcpCmdError> {
        self.lists.get_mut(daq as usize).ok_or(XcpCmdError::OutOfRange)
    }

    fn alloc_mem(&mut self, size: usize) -> Result<(), XcpCmdError> {
        if self.mem_used + size > self.mem_size {
            info!("DAQ memory overflow, {} of {} bytes used, {} requested", self.mem_used, self.mem_size, size);
            return Err(XcpCmdError::MemoryOverflow);
        }
        self.mem_used += size;
        Ok(())
    }

    //------------------------------------------------------------------------------------------
    // Allocation

    /// FREE_DAQ, the event bindings must be reset by the caller
    pub fn free(&mut self) {
        debug!("Free DAQ tables");
        self.lists.clear();
        self.alloc = AllocState::Freed;
        self.mem_used = 0;
        self.ptr = None;
        self.running = false;
        self.prepared = false;
    }

    /// ALLOC_DAQ
    pub fn alloc_daq(&mut self, count: u16) -> Result<(), XcpCmdError> {
        if self.alloc != AllocState::Freed {
            return Err(XcpCmdError::Sequence);
        }
        if count > self.max_daq {
            return Err(XcpCmdError::MemoryOverflow);
        }
        self.alloc_mem(count as usize * DAQ_LIST_MEM_SIZE)?;
        debug!("Alloc DAQ lists: count={}", count);
        self.lists = (0..count).map(|_| DaqList::new()).collect();
        self.alloc = AllocState::Daq;
        Ok(())
    }

    /// ALLOC_ODT
    pub fn alloc_odt(&mut self, daq: u16, count: u8) -> Result<(), XcpCmdError> {
        if self.alloc != AllocState::Daq && self.alloc != AllocState::Odt {
            return Err(XcpCmdError::Sequence);
        }
        if count == 0 || daq as usize >= self.lists.len() {
            return Err(XcpCmdError::OutOfRange);
        }
        if !self.lists[daq as usize].odts.is_empty() {
            return Err(XcpCmdError::Sequence);
        }
        self.alloc_mem(count as usize * ODT_MEM_SIZE)?;
        trace!("Alloc ODTs: daq={}, count={}", daq, count);
        self.lists[daq as usize].odts = (0..count).map(|_| Odt { entries: Vec::new(), size: 0 }).collect();
        self.alloc = AllocState::Odt;
        Ok(())
    }

    /// ALLOC_ODT_ENTRY
    pub fn alloc_odt_entry(&mut self, daq: u16, odt: u8, count: u8) -> Result<(), XcpCmdError> {
        if self.alloc != AllocState::Odt && self.alloc != AllocState::OdtEntry {
            return Err(XcpCmdError::Sequence);
        }
        if count == 0 {
            return Err(XcpCmdError::OutOfRange);
        }
        let o = self
            .lists
            .get(daq as usize)
            .and_then(|l| l.odts.get(odt as usize))
            .ok_or(XcpCmdError::OutOfRange)?;
        if !o.entries.is_empty() {
            return Err(XcpCmdError::Sequence);
        }
        self.alloc_mem(count as usize * ODT_ENTRY_MEM_SIZE)?;
        trace!("Alloc ODT entries: daq={}, odt={}, count={}", daq, odt, count);
        let entry = OdtEntry {
            ext: XcpAddrExt::Abs,
            addr: 0,
            size: 0,
        };
        self.lists[daq as usize].odts[odt as usize].entries = vec![entry; count as usize];
        self.alloc = AllocState::OdtEntry;
        Ok(())
    }

    //------------------------------------------------------------------------------------------
    // ODT entry configuration

    /// SET_DAQ_PTR
    pub fn set_daq_ptr(&mut self, daq: u16, odt: u8, idx: u8) -> Result<(), XcpCmdError> {
        let l = self.lists.get(daq as usize).ok_or(XcpCmdError::OutOfRange)?;
        if l.is_running() {
            return Err(XcpCmdError::DaqActive);
        }
        let o = l.odts.get(odt as usize).ok_or(XcpCmdError::OutOfRange)?;
        if idx as usize >= o.entries.len() {
            return Err(XcpCmdError::OutOfRange);
        }
        self.ptr = Some(DaqPtr { daq, odt, idx });
        Ok(())
    }

    /// WRITE_DAQ, write the ODT entry at the DAQ pointer and advance the pointer
    /// The address extension is validated here, not when sampling
    pub fn write_daq(&mut self, bit_offset: u8, size: u8, ext: u8, addr: u32) -> Result<(), XcpCmdError> {
        let ext = XcpAddrExt::try_from(ext)?;
        if bit_offset != WRITE_DAQ_NO_BIT_OFFSET && bit_offset != 0 {
            return Err(XcpCmdError::OutOfRange);
        }
        if size == 0 {
            return Err(XcpCmdError::OutOfRange);
        }
        let ptr = self.ptr.ok_or(XcpCmdError::Sequence)?;
        let max_dto = self.max_dto;
        let o = &mut self.lists[ptr.daq as usize].odts[ptr.odt as usize];
        let entry = o.entries.get(ptr.idx as usize).ok_or(XcpCmdError::OutOfRange)?;

        let header = if ptr.odt == 0 { DTO_HEADER_SIZE_TS } else { DTO_HEADER_SIZE };
        let new_size = o.size - entry.size as usize + size as usize;
        if header + new_size > max_dto {
            return Err(XcpCmdError::DaqConfig);
        }

        trace!("Write DAQ: daq={}, odt={}, idx={}, {:?}:0x{:08X}, size={}", ptr.daq, ptr.odt, ptr.idx, ext, addr, size);
        o.size = new_size;
        o.entries[ptr.idx as usize] = OdtEntry { ext, addr, size };
        self.ptr = Some(DaqPtr { idx: ptr.idx + 1, ..ptr });
        Ok(())
    }

    //------------------------------------------------------------------------------------------
    // DAQ list mode and event binding

    /// SET_DAQ_LIST_MODE, event_count is the number of events in the registry
    pub fn set_daq_list_mode(&mut self, daq: u16, mode: u8, event: u16, prescaler: u8, priority: u8, event_count: usize) -> Result<(), XcpCmdError> {
        let l = self.get_list_mut(daq)?;
        if l.is_running() {
            return Err(XcpCmdError::DaqActive);
        }
        if mode & (DAQ_MODE_DIRECTION | DAQ_MODE_PID_OFF) != 0 {
            return Err(XcpCmdError::OutOfRange); // STIM and PID off not supported
        }
        if event as usize >= event_count {
            return Err(XcpCmdError::OutOfRange);
        }
        debug!("Set DAQ list mode: daq={}, mode={:02X}, event={}, prescaler={}, priority={}", daq, mode, event, prescaler, priority);
        l.mode = mode | DAQ_MODE_TIMESTAMP;
        l.event = event;
        l.prescaler = prescaler.max(1);
        l.prescaler_ctr.store(0, Ordering::Relaxed);
        l.priority = priority;
        Ok(())
    }

    /// GET_DAQ_LIST_MODE, returns (mode, event, prescaler, priority)
    pub fn get_daq_list_mode(&self, daq: u16) -> Result<(u8, u16, u8, u8), XcpCmdError> {
        let l = self.lists.get(daq as usize).ok_or(XcpCmdError::OutOfRange)?;
        Ok((l.mode | l.state.bits(), l.event, l.prescaler, l.priority))
    }

    /// CLEAR_DAQ_LIST, stop and unbind the list and clear its ODT entries
    pub fn clear_daq_list(&mut self, daq: u16) -> Result<(), XcpCmdError> {
        let l = self.get_list_mut(daq)?;
        for o in &mut l.odts {
            for e in &mut o.entries {
                e.size = 0;
            }
            o.size = 0;
        }
        l.state = DaqListState::empty();
        l.event = EventList::XCP_UNDEFINED_DAQ_LIST;
        Ok(())
    }

    /// Rebuild the chains of DAQ lists of all events
    pub fn bind_events(&mut self, events: &EventList) {
        events.reset_daq_lists();
        for daq in (0..self.lists.len()).rev() {
            let event = self.lists[daq].event;
            if let Some(e) = events.get(event) {
                let head = e.daq_list.swap(daq as u16, Ordering::Relaxed);
                self.lists[daq].next = head;
            } else {
                self.lists[daq].next = EventList::XCP_UNDEFINED_DAQ_LIST;
            }
        }
    }

    //------------------------------------------------------------------------------------------
    // Start and stop

    /// Check a DAQ list can be started
    fn check_startable(&self, daq: usize, event_count: usize) -> Result<(), XcpCmdError> {
        let l = &self.lists[daq];
        if l.event as usize >= event_count || l.odts.is_empty() {
            return Err(XcpCmdError::DaqConfig);
        }
        Ok(())
    }

    /// START_STOP_DAQ_LIST select or unselect
    pub fn select(&mut self, daq: u16, selected: bool) -> Result<(), XcpCmdError> {
        let l = self.get_list_mut(daq)?;
        l.state.set(DaqListState::SELECTED, selected);
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn set_prepared(&mut self, prepared: bool) {
        self.prepared = prepared;
    }

    /// Indices of the selected DAQ lists
    pub fn get_selected(&self) -> Vec<u16> {
        (0..self.lists.len())
            .filter(|&i| self.lists[i].state.contains(DaqListState::SELECTED))
            .map(|i| i as u16)
            .collect()
    }

    /// Validate the given DAQ lists before start
    pub fn check_start(&self, lists: &[u16], event_count: usize) -> Result<(), XcpCmdError> {
        for &daq in lists {
            if daq as usize >= self.lists.len() {
                return Err(XcpCmdError::OutOfRange);
            }
            self.check_startable(daq as usize, event_count)?;
        }
        Ok(())
    }

    /// Set the given DAQ lists running, unselect them
    pub fn start_lists(&mut self, lists: &[u16]) {
        for &daq in lists {
            let l = &mut self.lists[daq as usize];
            l.state.remove(DaqListState::SELECTED);
            l.state.insert(DaqListState::RUNNING);
            l.prescaler_ctr.store(0, Ordering::Relaxed);
        }
        self.running = true;
    }

    /// Stop the given DAQ lists, returns true if no list is running anymore
    pub fn stop_lists(&mut self, lists: &[u16]) -> bool {
        for &daq in lists {
            if let Some(l) = self.lists.get_mut(daq as usize) {
                l.state.remove(DaqListState::RUNNING | DaqListState::SELECTED);
            }
        }
        let any_running = self.lists.iter().any(DaqList::is_running);
        if !any_running {
            self.running = false;
        }
        !any_running
    }

    /// Stop all DAQ lists
    pub fn stop_all(&mut self) {
        for l in &mut self.lists {
            l.state = DaqListState::empty();
        }
        self.running = false;
        self.prepared = false;
    }
}

//-------------------------------------------------------------------------------------------------
// Test module
