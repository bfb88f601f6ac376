//----------------------------------------------------------------------------------------------
// Module config
// Protocol layer configuration, capacities and optional capabilities

use bitflags::bitflags;

use super::XcpError;

//----------------------------------------------------------------------------------------------
// Capabilities

bitflags! {
    /// Optional protocol layer capabilities
    /// A command which depends on a disabled capability is answered with CRC_CMD_UNKNOWN
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct XcpCapabilities: u32 {
        const CAL_PAGE              = 0x0001; // SET_CAL_PAGE, GET_CAL_PAGE, GET_PAG_PROCESSOR_INFO
        const COPY_CAL_PAGE         = 0x0002; // COPY_CAL_PAGE
        const FREEZE_CAL_PAGE       = 0x0004; // SET_SEGMENT_MODE, GET_SEGMENT_MODE, SET_REQUEST STORE_CAL
        const CHECKSUM              = 0x0008; // BUILD_CHECKSUM
        const USER_CMD              = 0x0010; // USER_CMD
        const A2L_UPLOAD            = 0x0020; // GET_ID IDT_ASAM_UPLOAD
        const EVENT_INFO            = 0x0040; // GET_DAQ_EVENT_INFO
        const MULTITHREAD_EVENTS    = 0x0080; // Per event lock, one event may be triggered from different threads
        const TIMESTAMP_CHECK       = 0x0100; // Check event timestamps are increasing
        const DAQ_CLOCK_64BIT       = 0x0200; // Extended GET_DAQ_CLOCK response with 64 bit slave clock
        const DAQ_CLOCK_MULTICAST   = 0x0400; // GET_DAQ_CLOCK_MULTICAST
        const TIME_CORRELATION      = 0x0800; // TIME_CORRELATION_PROPERTIES
        const PTP                   = 0x1000; // Grandmaster clock information available
        const SERV_TEXT             = 0x2000; // SERV_TEXT print service
    }
}

impl Default for XcpCapabilities {
    fn default() -> Self {
        XcpCapabilities::CAL_PAGE
            | XcpCapabilities::COPY_CAL_PAGE
            | XcpCapabilities::FREEZE_CAL_PAGE
            | XcpCapabilities::CHECKSUM
            | XcpCapabilities::USER_CMD
            | XcpCapabilities::A2L_UPLOAD
            | XcpCapabilities::SERV_TEXT
    }
}

//----------------------------------------------------------------------------------------------
// Timestamp unit

/// Resolution of the DAQ timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum XcpTimestampUnit {
    /// 1 ns per tick
    Ns1,
    /// 1 us per tick
    Us1,
}

impl XcpTimestampUnit {
    /// Number of nanoseconds per clock tick
    pub fn ns_per_tick(self) -> u64 {
        match self {
            XcpTimestampUnit::Ns1 => 1,
            XcpTimestampUnit::Us1 => 1000,
        }
    }

    /// Unit code for GET_DAQ_RESOLUTION_INFO
    pub(crate) fn resolution_code(self) -> u8 {
        match self {
            XcpTimestampUnit::Ns1 => super::protocol::DAQ_TIMESTAMP_UNIT_1NS,
            XcpTimestampUnit::Us1 => super::protocol::DAQ_TIMESTAMP_UNIT_1US,
        }
    }
}

//----------------------------------------------------------------------------------------------
// XcpConfig

/// Protocol layer configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct XcpConfig {
    /// Application name, reported by GET_ID IDT_ASCII if the application does not provide one
    pub name: String,

    /// Maximum command and response packet size
    pub max_cto: u8,
    /// Maximum DAQ packet size
    pub max_dto: u16,
    /// Transmit queue size in packets
    pub queue_size: usize,

    /// Memory for DAQ tables in bytes
    pub daq_mem_size: usize,
    /// Maximum number of DAQ lists
    pub max_daq: u16,

    /// Event registry capacity
    pub max_events: u16,
    /// Maximum length of an event name
    pub max_event_name: usize,

    /// Number of calibration segments
    pub cal_segments: u8,
    /// Number of pages per calibration segment
    pub cal_pages: u8,

    pub timestamp_unit: XcpTimestampUnit,
    /// Initial cluster identifier for clock synchronization
    pub cluster_id: u16,

    pub capabilities: XcpCapabilities,
}

impl XcpConfig {
    pub const DEFAULT_MAX_CTO: u8 = 248;
    pub const DEFAULT_MAX_DTO: u16 = 1460;
    pub const DEFAULT_QUEUE_SIZE: usize = 256;
    pub const DEFAULT_DAQ_MEM_SIZE: usize = 10000 * 5; // Each ODT entry needs 5 bytes
    pub const DEFAULT_MAX_DAQ: u16 = 1024;
    pub const DEFAULT_MAX_EVENTS: u16 = 16;
    pub const DEFAULT_MAX_EVENT_NAME: usize = 8;

    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<(), XcpError> {
        if self.max_cto < 8 {
            return Err(XcpError::Config("max_cto must be at least 8"));
        }
        if self.max_dto < 8 || self.max_dto < self.max_cto as u16 {
            return Err(XcpError::Config("max_dto must be at least 8 and not less than max_cto"));
        }
        if self.queue_size < 8 {
            return Err(XcpError::Config("queue_size must be at least 8"));
        }
        if self.max_events == 0 || self.max_events == 0xFFFF {
            return Err(XcpError::Config("max_events out of range"));
        }
        if self.max_daq == 0 || self.max_daq == 0xFFFF {
            return Err(XcpError::Config("max_daq out of range"));
        }
        if self.cal_pages == 0 || self.cal_segments == 0 {
            return Err(XcpError::Config("at least one calibration segment and page required"));
        }
        Ok(())
    }

    /// Load a configuration from a json file
    #[cfg(feature = "serde")]
    pub fn load_json<P: AsRef<std::path::Path>>(path: P) -> Result<XcpConfig, XcpError> {
        let path = path.as_ref();
        log::info!("Load XCP configuration from {}", path.display());
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let config: XcpConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a json file
    #[cfg(feature = "serde")]
    pub fn save_json<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), XcpError> {
        let path = path.as_ref();
        log::info!("Save XCP configuration to {}", path.display());
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

impl Default for XcpConfig {
    fn default() -> Self {
        XcpConfig {
            name: String::from("xcp_core"),
            max_cto: XcpConfig::DEFAULT_MAX_CTO,
            max_dto: XcpConfig::DEFAULT_MAX_DTO,
            queue_size: XcpConfig::DEFAULT_QUEUE_SIZE,
            daq_mem_size: XcpConfig::DEFAULT_DAQ_MEM_SIZE,
            max_daq: XcpConfig::DEFAULT_MAX_DAQ,
            max_events: XcpConfig::DEFAULT_MAX_EVENTS,
            max_event_name: XcpConfig::DEFAULT_MAX_EVENT_NAME,
            cal_segments: 1,
            cal_pages: 2,
            timestamp_unit: XcpTimestampUnit::Ns1,
            cluster_id: 1,
            capabilities: XcpCapabilities::default(),
        }
    }
}

//-------------------------------------------------------------------------------------------------
// Test module
