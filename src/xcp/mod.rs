//----------------------------------------------------------------------------------------------
// Module xcp

use bitflags::bitflags;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

//-----------------------------------------------------------------------------
// Submodules

// Protocol constants and error codes
pub mod protocol;
use protocol::*;

pub(crate) mod addr;
use addr::XcpMemoryWindow;

pub(crate) mod appl;
use appl::{XcpAppl, XcpDefaultAppl};

pub(crate) mod clock;
use clock::{ClockSubsystem, XcpClock, XcpSystemClock};

pub(crate) mod config;
use config::{XcpCapabilities, XcpConfig};

pub(crate) mod event;
use event::{EventList, XcpEventInfo, XcpEventPriority};

pub(crate) mod queue;
use queue::XcpTlQueue;

mod cal;
use cal::CalPageManager;

mod cmd;
use cmd::CmdState;

mod daq;
use daq::DaqTables;

mod session;
use session::Session;

//----------------------------------------------------------------------------------------------
// XCP error

use thiserror::Error;

#[derive(Error, Debug)]
pub enum XcpError {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "serde")]
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: `{0}`")]
    Config(&'static str),

    #[error("DAQ is running")]
    DaqRunning,

    #[error("clock state transition not allowed")]
    ClockState,

    #[error("protocol layer not started")]
    NotStarted,
}

//----------------------------------------------------------------------------------------------
// Log level

/// Log level of the XCP protocol layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XcpLogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl From<u8> for XcpLogLevel {
    fn from(item: u8) -> XcpLogLevel {
        match item {
            0 => XcpLogLevel::Off,
            1 => XcpLogLevel::Error,
            2 => XcpLogLevel::Warn,
            3 => XcpLogLevel::Info,
            4 => XcpLogLevel::Debug,
            5 => XcpLogLevel::Trace,
            _ => XcpLogLevel::Warn,
        }
    }
}

impl XcpLogLevel {
    /// Convert XcpLogLevel to log::LevelFilter
    pub fn to_log_level_filter(self) -> log::LevelFilter {
        match self {
            XcpLogLevel::Off => log::LevelFilter::Off,
            XcpLogLevel::Error => log::LevelFilter::Error,
            XcpLogLevel::Warn => log::LevelFilter::Warn,
            XcpLogLevel::Info => log::LevelFilter::Info,
            XcpLogLevel::Debug => log::LevelFilter::Debug,
            XcpLogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

//----------------------------------------------------------------------------------------------
// Session status

bitflags! {
    /// Represents a set of flags for the XCP session status
    /// The low byte is the session status reported by GET_STATUS
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct XcpSessionStatus: u16 {
        const SS_STORE_CAL_REQ      = 0x0001; // Freeze requested
        const SS_CLEAR_DAQ_REQ      = 0x0008;
        const SS_DAQ                = 0x0040; // DAQ running
        const SS_RESUME             = 0x0080;
        const SS_SYNCH_IN_PROGRESS  = 0x0400; // Clock synchronization in progress
        const SS_OVERFLOW           = 0x0800; // DAQ queue overflow since DAQ start
        const SS_CONNECTED          = 0x2000;
        const SS_STARTED            = 0x4000;
        const SS_INITIALIZED        = 0x8000;
    }
}

//----------------------------------------------------------------------------------------------
// XcpEvent

/// Represents a measurement event
/// Holds the raw u16 event number used in the XCP protocol and in A2L IF_DATA to identify an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XcpEvent {
    id: u16, // Number used in A2L and XCP protocol
}

impl XcpEvent {
    /// Undefined event id number
    pub const XCP_UNDEFINED_EVENT_ID: u16 = 0xFFFF;

    /// Uninitialized event, returned when the event registry is full
    pub const XCP_UNDEFINED_EVENT: XcpEvent = XcpEvent {
        id: XcpEvent::XCP_UNDEFINED_EVENT_ID,
    };

    pub fn new(id: u16) -> XcpEvent {
        XcpEvent { id }
    }

    pub fn get_id(self) -> u16 {
        self.id
    }

    /// Trigger the event, timestamp from the DAQ clock
    #[inline]
    pub fn trigger(self, xcp: &Xcp) {
        xcp.trigger_event(self.id);
    }

    /// Trigger the event with an explicit timestamp
    #[inline]
    pub fn trigger_at(self, xcp: &Xcp, timestamp: u64) {
        xcp.trigger_event_at(self.id, timestamp);
    }

    /// Trigger the event, absolute addresses of this sample are relative to window
    /// Returns true if a sample was queued
    #[inline]
    pub fn trigger_ext(self, xcp: &Xcp, window: &XcpMemoryWindow) -> bool {
        xcp.trigger_event_ext(self.id, window)
    }
}

impl Default for XcpEvent {
    fn default() -> Self {
        XcpEvent::XCP_UNDEFINED_EVENT
    }
}

//------------------------------------------------------------------------------------------
// XcpBuilder

/// Builder for the XCP protocol layer
pub struct XcpBuilder {
    config: XcpConfig,
    appl: Option<Box<dyn XcpAppl>>,
    clock: Option<Box<dyn XcpClock>>,
    window: Option<XcpMemoryWindow>,
    log_level: Option<XcpLogLevel>,
}

impl XcpBuilder {
    /// Create a builder with the default configuration
    pub fn new(name: &str) -> XcpBuilder {
        XcpBuilder {
            config: XcpConfig {
                name: name.to_string(),
                ..XcpConfig::default()
            },
            appl: None,
            clock: None,
            window: None,
            log_level: None,
        }
    }

    /// Set the maximum log level, applied when the protocol layer is built
    /// The log level is left unchanged if not set
    #[must_use]
    pub fn set_log_level(mut self, log_level: XcpLogLevel) -> Self {
        self.log_level = Some(log_level);
        self
    }

    /// Replace the configuration, the name given to new is kept if the configuration has none
    #[must_use]
    pub fn set_config(mut self, config: XcpConfig) -> Self {
        let name = std::mem::take(&mut self.config.name);
        self.config = config;
        if self.config.name.is_empty() {
            self.config.name = name;
        }
        self
    }

    /// Set the application callbacks
    #[must_use]
    pub fn set_appl(mut self, appl: Box<dyn XcpAppl>) -> Self {
        self.appl = Some(appl);
        self
    }

    /// Set the DAQ clock source, the default is the system clock
    #[must_use]
    pub fn set_clock(mut self, clock: Box<dyn XcpClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the memory window for absolute addressing
    #[must_use]
    pub fn set_memory_window(mut self, window: XcpMemoryWindow) -> Self {
        self.window = Some(window);
        self
    }

    /// Create the protocol layer
    pub fn build(self) -> Result<Xcp, XcpError> {
        if let Some(log_level) = self.log_level {
            log::set_max_level(log_level.to_log_level_filter());
        }
        self.config.validate()?;
        let config = self.config;
        let appl = self.appl.unwrap_or_else(|| Box::new(XcpDefaultAppl));
        let source = self.clock.unwrap_or_else(|| Box::new(XcpSystemClock::new(config.timestamp_unit)));
        let window = self.window.unwrap_or_else(XcpMemoryWindow::empty);

        info!(
            "Create XCP protocol layer {}, max_cto={}, max_dto={}, queue_size={}, {:?}",
            config.name, config.max_cto, config.max_dto, config.queue_size, config.capabilities
        );
        debug!("{:?}", window);

        let max_packet_size = (config.max_dto as usize).max(config.max_cto as usize);
        Ok(Xcp {
            session: Session::new(),
            clock: ClockSubsystem::new(source, config.timestamp_unit, config.cluster_id),
            events: RwLock::new(EventList::new(
                config.max_events,
                config.max_event_name,
                config.capabilities.contains(XcpCapabilities::MULTITHREAD_EVENTS),
            )),
            daq: RwLock::new(DaqTables::new(&config)),
            cal: CalPageManager::new(&config),
            queue: XcpTlQueue::new(config.queue_size, max_packet_size),
            cmd: Mutex::new(CmdState::new()),
            window,
            appl,
            config,
        })
    }
}

//------------------------------------------------------------------------------------------
// Xcp

/// XCP protocol layer
/// Holds all session, DAQ, calibration and clock state of the XCP slave
/// The transport layer feeds commands with command or tl_command and consumes packets from the transmit queue
pub struct Xcp {
    config: XcpConfig,
    appl: Box<dyn XcpAppl>,
    session: Session,
    clock: ClockSubsystem,
    // Lock order: cmd, events, daq, queue
    events: RwLock<EventList>,
    daq: RwLock<DaqTables>,
    cal: CalPageManager,
    window: XcpMemoryWindow,
    queue: XcpTlQueue,
    cmd: Mutex<CmdState>,
}

impl Xcp {
    //------------------------------------------------------------------------------------------
    // Lifecycle

    /// Start the protocol layer, commands are ignored before
    pub fn start(&self) {
        info!("Start XCP protocol layer {}", self.config.name);
        self.session.set(XcpSessionStatus::SS_STARTED);
    }

    /// Stop the protocol layer
    /// A connected client is notified with a session terminated event and disconnected
    pub fn stop(&self) -> Result<(), XcpError> {
        if !self.is_started() {
            return Err(XcpError::NotStarted);
        }
        info!("Stop XCP protocol layer {}", self.config.name);
        let connected = self.is_connected();
        self.disconnect();
        // Disconnect discards all pending packets, the terminate event is queued afterwards
        if connected {
            self.push_event(EVC_SESSION_TERMINATED, &[]);
        }
        self.session.clear(XcpSessionStatus::SS_STARTED);
        Ok(())
    }

    /// Reset to the state after creation
    /// Stops DAQ, clears DAQ tables, transmit queue, calibration page state and the event list
    pub fn reset(&self) {
        info!("Reset XCP protocol layer {}", self.config.name);
        let mut cmd = self.cmd.lock();
        let mut events = self.events.write();
        let mut daq = self.daq.write();
        self.stop_daq_locked(&mut daq);
        daq.free();
        events.clear();
        self.queue.clear();
        self.cal.reset();
        cmd.reset();
        self.session.reset();
    }

    /// Disconnect the client, may be called from the command processor or from the application
    /// Stops and clears DAQ and discards all pending packets, no DAQ packet of this session is queued afterwards
    pub fn disconnect(&self) {
        let events = self.events.read();
        let mut daq = self.daq.write();
        if !self.session.is(XcpSessionStatus::SS_CONNECTED) {
            return;
        }
        info!("XCP client disconnected");
        self.stop_daq_locked(&mut daq);
        daq.free();
        events.reset_daq_lists();
        self.queue.clear();
        self.session.clear(XcpSessionStatus::SS_CONNECTED | XcpSessionStatus::SS_STORE_CAL_REQ | XcpSessionStatus::SS_CLEAR_DAQ_REQ);
        drop(daq);
        drop(events);
        self.appl.on_disconnect();
    }

    // Stop all DAQ lists, the DAQ tables are write locked by the caller
    fn stop_daq_locked(&self, daq: &mut DaqTables) {
        let was_running = daq.is_running();
        daq.stop_all();
        self.session.stop_daq();
        if was_running {
            info!("DAQ stopped, overflow_count={}", self.session.get_daq_overflow_count());
            self.appl.on_stop_daq();
        }
    }

    //------------------------------------------------------------------------------------------
    // Accessors

    pub fn config(&self) -> &XcpConfig {
        &self.config
    }

    /// Transmit queue, consumed by the transport layer
    pub fn queue(&self) -> &XcpTlQueue {
        &self.queue
    }

    /// DAQ clock
    pub fn clock(&self) -> &ClockSubsystem {
        &self.clock
    }

    /// Current DAQ clock value
    pub fn get_clock(&self) -> u64 {
        self.clock.get_clock64()
    }

    /// Active calibration page of a segment for the ECU
    pub fn get_ecu_cal_page(&self, segment: u8) -> Option<u8> {
        self.cal.get_cal_page(segment, CAL_PAGE_MODE_ECU).ok()
    }

    /// Active calibration page of a segment for XCP access
    pub fn get_xcp_cal_page(&self, segment: u8) -> Option<u8> {
        self.cal.get_cal_page(segment, CAL_PAGE_MODE_XCP).ok()
    }

    //------------------------------------------------------------------------------------------
    // Session state

    /// Session status, including clock synchronization in progress
    pub fn get_session_status(&self) -> XcpSessionStatus {
        let mut status = self.session.get_status();
        if self.clock.is_synch_in_progress() {
            status |= XcpSessionStatus::SS_SYNCH_IN_PROGRESS;
        }
        status
    }

    pub fn is_started(&self) -> bool {
        self.session.is(XcpSessionStatus::SS_STARTED)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is(XcpSessionStatus::SS_CONNECTED)
    }

    pub fn is_daq_running(&self) -> bool {
        self.session.is(XcpSessionStatus::SS_DAQ)
    }

    /// Check if at least one running DAQ list is bound to the event
    pub fn is_daq_event_running(&self, event: u16) -> bool {
        if !self.is_daq_running() {
            return false;
        }
        let events = self.events.read();
        let daq = self.daq.read();
        let Some(e) = events.get(event) else {
            return false;
        };
        let mut daq_list = e.daq_list.load(std::sync::atomic::Ordering::Relaxed);
        while let Some(l) = daq.get_list(daq_list) {
            if l.is_running() {
                return true;
            }
            daq_list = l.next;
        }
        false
    }

    /// DAQ clock value at the last DAQ start
    pub fn get_daq_start_time(&self) -> u64 {
        self.session.get_daq_start_time()
    }

    /// Number of samples lost since the last DAQ start
    pub fn get_daq_overflow_count(&self) -> u32 {
        self.session.get_daq_overflow_count()
    }

    /// Number of non increasing event timestamps since the last DAQ start
    pub fn get_timestamp_anomaly_count(&self) -> u32 {
        self.session.get_timestamp_anomaly_count()
    }

    pub fn get_cluster_id(&self) -> u16 {
        self.clock.get_cluster_id()
    }

    //------------------------------------------------------------------------------------------
    // Event registry

    /// Create an event
    /// Returns XcpEvent::XCP_UNDEFINED_EVENT if the maximum number of events is exceeded
    pub fn create_event(&self, name: &str, cycle_time_ns: u32, priority: XcpEventPriority, sample_count: u16, size: u32) -> XcpEvent {
        self.events.write().create_event(name, cycle_time_ns, priority, sample_count, size)
    }

    /// Clear the event list, DAQ lists bound to events are freed
    pub fn clear_event_list(&self) -> Result<(), XcpError> {
        let mut events = self.events.write();
        let mut daq = self.daq.write();
        if daq.is_running() {
            warn!("clear_event_list refused, DAQ is running");
            return Err(XcpError::DaqRunning);
        }
        daq.free();
        events.clear();
        Ok(())
    }

    /// Get a snapshot of an event
    pub fn get_event(&self, id: u16) -> Option<XcpEventInfo> {
        self.events.read().get_info(id)
    }

    /// Get a snapshot of all events
    pub fn get_event_list(&self) -> Vec<XcpEventInfo> {
        self.events.read().get_info_list()
    }

    //------------------------------------------------------------------------------------------
    // Service requests

    /// Print a text message to the XCP client tool console
    pub fn print(&self, msg: &str) {
        if !self.is_connected() || !self.config.capabilities.contains(XcpCapabilities::SERV_TEXT) {
            return;
        }
        let max = self.config.max_cto as usize - 3;
        let mut packet = Vec::with_capacity(self.config.max_cto as usize);
        for chunk in msg.as_bytes().chunks(max) {
            packet.clear();
            packet.push(PID_SERV);
            packet.push(SERV_TEXT);
            packet.extend_from_slice(chunk);
            packet.push(0);
            if !self.queue.push(&packet, true) {
                warn!("print: transmit queue full, text discarded");
                return;
            }
        }
    }

    /// Send an event packet (EV) with event code and payload to the client
    /// Returns false if not connected, if the payload exceeds max_cto or if the transmit queue is full
    pub fn send_event(&self, code: u8, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.push_event(code, payload)
    }

    /// Request the client to terminate the session
    pub fn send_terminate_session_event(&self) {
        self.send_event(EVC_SESSION_TERMINATED, &[]);
    }

    fn push_event(&self, code: u8, payload: &[u8]) -> bool {
        if payload.len() + 2 > self.config.max_cto as usize {
            warn!("Event 0x{:02X} not sent, payload of {} bytes exceeds max_cto", code, payload.len());
            return false;
        }
        debug!("Send event 0x{:02X}", code);
        let mut packet = Vec::with_capacity(payload.len() + 2);
        packet.push(PID_EV);
        packet.push(code);
        packet.extend_from_slice(payload);
        if !self.queue.push(&packet, true) {
            warn!("Event 0x{:02X} not sent, transmit queue full", code);
            return false;
        }
        true
    }
}

//-------------------------------------------------------------------------------------------------
//-------------------------------------------------------------------------------------------------
// Test module
