//----------------------------------------------------------------------------------------------
// Module protocol
// XCP protocol definitions, command codes, response codes and packet identifiers

use thiserror::Error;

//----------------------------------------------------------------------------------------------
// Packet identifiers

pub const PID_RES: u8 = 0xFF; // Positive command response
pub const PID_ERR: u8 = 0xFE; // Negative command response
pub const PID_EV: u8 = 0xFD; // Event packet
pub const PID_SERV: u8 = 0xFC; // Service request packet

// Event codes
pub const EVC_STORE_CAL: u8 = 0x03;
pub const EVC_DAQ_OVERLOAD: u8 = 0x06;
pub const EVC_SESSION_TERMINATED: u8 = 0x07;
pub const EVC_TIME_SYNC: u8 = 0x08;
pub const EVC_USER: u8 = 0xFE;

// Service request codes
pub const SERV_TEXT: u8 = 0x01;

//----------------------------------------------------------------------------------------------
// Command codes

pub const CC_CONNECT: u8 = 0xFF;
pub const CC_DISCONNECT: u8 = 0xFE;
pub const CC_GET_STATUS: u8 = 0xFD;
pub const CC_SYNCH: u8 = 0xFC;
pub const CC_GET_COMM_MODE_INFO: u8 = 0xFB;
pub const CC_GET_ID: u8 = 0xFA;
pub const CC_SET_REQUEST: u8 = 0xF9;
pub const CC_SET_MTA: u8 = 0xF6;
pub const CC_UPLOAD: u8 = 0xF5;
pub const CC_SHORT_UPLOAD: u8 = 0xF4;
pub const CC_BUILD_CHECKSUM: u8 = 0xF3;
pub const CC_TRANSPORT_LAYER_CMD: u8 = 0xF2;
pub const CC_USER_CMD: u8 = 0xF1;
pub const CC_DOWNLOAD: u8 = 0xF0;
pub const CC_SHORT_DOWNLOAD: u8 = 0xED;
pub const CC_SET_CAL_PAGE: u8 = 0xEB;
pub const CC_GET_CAL_PAGE: u8 = 0xEA;
pub const CC_GET_PAG_PROCESSOR_INFO: u8 = 0xE9;
pub const CC_SET_SEGMENT_MODE: u8 = 0xE6;
pub const CC_GET_SEGMENT_MODE: u8 = 0xE5;
pub const CC_COPY_CAL_PAGE: u8 = 0xE4;
pub const CC_CLEAR_DAQ_LIST: u8 = 0xE3;
pub const CC_SET_DAQ_PTR: u8 = 0xE2;
pub const CC_WRITE_DAQ: u8 = 0xE1;
pub const CC_SET_DAQ_LIST_MODE: u8 = 0xE0;
pub const CC_GET_DAQ_LIST_MODE: u8 = 0xDF;
pub const CC_START_STOP_DAQ_LIST: u8 = 0xDE;
pub const CC_START_STOP_SYNCH: u8 = 0xDD;
pub const CC_GET_DAQ_CLOCK: u8 = 0xDC;
pub const CC_GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
pub const CC_GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
pub const CC_GET_DAQ_EVENT_INFO: u8 = 0xD7;
pub const CC_FREE_DAQ: u8 = 0xD6;
pub const CC_ALLOC_DAQ: u8 = 0xD5;
pub const CC_ALLOC_ODT: u8 = 0xD4;
pub const CC_ALLOC_ODT_ENTRY: u8 = 0xD3;
pub const CC_WRITE_DAQ_MULTIPLE: u8 = 0xC7;
pub const CC_TIME_CORRELATION_PROPERTIES: u8 = 0xC6;
pub const CC_LEVEL_1_COMMAND: u8 = 0xC0;

// Level 1 sub commands
pub const CC_GET_VERSION: u8 = 0x00;

// Transport layer sub commands
pub const CC_TL_GET_DAQ_CLOCK_MULTICAST: u8 = 0xFA;

//----------------------------------------------------------------------------------------------
// Command parameters

// CONNECT resource bits
pub const RM_CAL_PAG: u8 = 0x01;
pub const RM_DAQ: u8 = 0x04;

// CONNECT comm mode basic
pub const CMB_OPTIONAL: u8 = 0x80;

// Protocol and transport layer version
pub const XCP_PROTOCOL_LAYER_VERSION: u16 = 0x0104;
pub const XCP_TRANSPORT_LAYER_VERSION: u16 = 0x0104;
pub const XCP_DRIVER_VERSION: u8 = 0x01;

// GET_ID id types
pub const IDT_ASCII: u8 = 0;
pub const IDT_ASAM_NAME: u8 = 1;
pub const IDT_ASAM_PATH: u8 = 2;
pub const IDT_ASAM_URL: u8 = 3;
pub const IDT_ASAM_UPLOAD: u8 = 4;
pub const IDT_ASAM_EPK: u8 = 5;

// SET_REQUEST modes
pub const SET_REQUEST_STORE_CAL_REQ: u8 = 0x01;
pub const SET_REQUEST_CLEAR_DAQ_REQ: u8 = 0x08;

// Calibration page modes
pub const CAL_PAGE_MODE_ECU: u8 = 0x01;
pub const CAL_PAGE_MODE_XCP: u8 = 0x02;
pub const CAL_PAGE_MODE_ALL: u8 = 0x80;

// Segment mode and paging properties
pub const SEGMENT_FLAG_FREEZE: u8 = 0x01;
pub const PAG_PROPERTY_FREEZE: u8 = 0x01;

// Checksum types
pub const XCP_CHECKSUM_TYPE_ADD44: u8 = 0x06;

// START_STOP_DAQ_LIST modes
pub const DAQ_LIST_STOP: u8 = 0;
pub const DAQ_LIST_START: u8 = 1;
pub const DAQ_LIST_SELECT: u8 = 2;

// START_STOP_SYNCH modes
pub const DAQ_STOP_ALL: u8 = 0;
pub const DAQ_START_SELECTED: u8 = 1;
pub const DAQ_STOP_SELECTED: u8 = 2;
pub const DAQ_PREPARE_START_SELECTED: u8 = 3;

// DAQ list mode bits (SET_DAQ_LIST_MODE and GET_DAQ_LIST_MODE)
pub const DAQ_MODE_DIRECTION: u8 = 0x02;
pub const DAQ_MODE_TIMESTAMP: u8 = 0x10;
pub const DAQ_MODE_PID_OFF: u8 = 0x20;

// DAQ processor properties
pub const DAQ_PROPERTY_CONFIG_TYPE: u8 = 0x01; // dynamic
pub const DAQ_PROPERTY_PRESCALER: u8 = 0x04;
pub const DAQ_PROPERTY_TIMESTAMP: u8 = 0x10;
pub const DAQ_PROPERTY_OVERLOAD_INDICATION_EVENT: u8 = 0x80;

// DAQ key byte: identification field relative odt, absolute daq, word aligned
pub const DAQ_HDR_ODT_FIL_DAQW: u8 = 0xC0;
pub const DAQ_HDR_FILL: u8 = 0xAA;

// DAQ resolution info
pub const DAQ_TIMESTAMP_DWORD: u8 = 0x04;
pub const DAQ_TIMESTAMP_FIXED: u8 = 0x08;
pub const DAQ_TIMESTAMP_UNIT_1NS: u8 = 0x00;
pub const DAQ_TIMESTAMP_UNIT_1US: u8 = 0x30;
pub const DAQ_MAX_ODT_ENTRY_SIZE: u8 = 0xFF;

// DAQ event properties
pub const DAQ_EVENT_PROPERTIES_DAQ: u8 = 0x04;
pub const DAQ_EVENT_PROPERTIES_EVENT_CONSISTENCY: u8 = 0x80;

// GET_DAQ_CLOCK extended response
pub const DAQ_CLOCK_TRIGGER_INFO_SAMPLED_ON_RECEPTION: u8 = 0x18;
pub const DAQ_CLOCK_PAYLOAD_FMT_SLV_32: u8 = 0x01;
pub const DAQ_CLOCK_PAYLOAD_FMT_SLV_64: u8 = 0x02;

// TIME_CORRELATION_PROPERTIES
pub const TIME_SYNC_SET_CLUSTER_ID: u8 = 0x08;
pub const TIME_SYNC_GET_CLK_INFO: u8 = 0x01;
pub const SLAVE_CLOCK_FREE_RUNNING: u8 = 0x00;
pub const SLAVE_GRANDM_CLOCK_READABLE: u8 = 0x04;
pub const CLOCK_INFO_SLAVE: u8 = 0x01;
pub const CLOCK_INFO_SLAVE_GRANDM: u8 = 0x02;

//----------------------------------------------------------------------------------------------
// Command return codes

pub const CRC_CMD_OK: u8 = 0x00;
pub const CRC_CMD_SYNCH: u8 = 0x00;
pub const CRC_CMD_PENDING: u8 = 0x01;
pub const CRC_CMD_IGNORED: u8 = 0x02;
pub const CRC_CMD_BUSY: u8 = 0x10;
pub const CRC_DAQ_ACTIVE: u8 = 0x11;
pub const CRC_PRM_ACTIVE: u8 = 0x12;
pub const CRC_CMD_UNKNOWN: u8 = 0x20;
pub const CRC_CMD_SYNTAX: u8 = 0x21;
pub const CRC_OUT_OF_RANGE: u8 = 0x22;
pub const CRC_WRITE_PROTECTED: u8 = 0x23;
pub const CRC_ACCESS_DENIED: u8 = 0x24;
pub const CRC_ACCESS_LOCKED: u8 = 0x25;
pub const CRC_PAGE_NOT_VALID: u8 = 0x26;
pub const CRC_PAGE_MODE_NOT_VALID: u8 = 0x27;
pub const CRC_SEGMENT_NOT_VALID: u8 = 0x28;
pub const CRC_SEQUENCE: u8 = 0x29;
pub const CRC_DAQ_CONFIG: u8 = 0x2A;
pub const CRC_MEMORY_OVERFLOW: u8 = 0x30;
pub const CRC_GENERIC: u8 = 0x31;
pub const CRC_VERIFY: u8 = 0x32;
pub const CRC_RESOURCE_TEMPORARY_NOT_ACCESSIBLE: u8 = 0x33;
pub const CRC_SUBCMD_UNKNOWN: u8 = 0x34;
pub const CRC_TIMECORR_STATE_CHANGE: u8 = 0x35;

/// Negative result of a XCP command
/// Each variant maps to a XCP command return code, which is sent as error response packet
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum XcpCmdError {
    #[error("SYNCH")]
    CmdSynch,

    #[error("command ignored")]
    CmdIgnored,

    #[error("command busy")]
    CmdBusy,

    #[error("DAQ active")]
    DaqActive,

    #[error("command unknown")]
    CmdUnknown,

    #[error("command syntax")]
    CmdSyntax,

    #[error("parameter out of range")]
    OutOfRange,

    #[error("write protected")]
    WriteProtected,

    #[error("access denied")]
    AccessDenied,

    #[error("invalid page")]
    PageNotValid,

    #[error("invalid page mode")]
    PageModeNotValid,

    #[error("invalid segment")]
    SegmentNotValid,

    #[error("wrong sequence")]
    Sequence,

    #[error("DAQ configuration error")]
    DaqConfig,

    #[error("memory overflow")]
    MemoryOverflow,

    #[error("generic error")]
    Generic,

    #[error("resource temporary not accessible")]
    ResourceTemporaryNotAccessible,

    #[error("unknown sub command")]
    SubcmdUnknown,
}

impl XcpCmdError {
    /// XCP command return code of this error
    pub fn code(self) -> u8 {
        match self {
            XcpCmdError::CmdSynch => CRC_CMD_SYNCH,
            XcpCmdError::CmdIgnored => CRC_CMD_IGNORED,
            XcpCmdError::CmdBusy => CRC_CMD_BUSY,
            XcpCmdError::DaqActive => CRC_DAQ_ACTIVE,
            XcpCmdError::CmdUnknown => CRC_CMD_UNKNOWN,
            XcpCmdError::CmdSyntax => CRC_CMD_SYNTAX,
            XcpCmdError::OutOfRange => CRC_OUT_OF_RANGE,
            XcpCmdError::WriteProtected => CRC_WRITE_PROTECTED,
            XcpCmdError::AccessDenied => CRC_ACCESS_DENIED,
            XcpCmdError::PageNotValid => CRC_PAGE_NOT_VALID,
            XcpCmdError::PageModeNotValid => CRC_PAGE_MODE_NOT_VALID,
            XcpCmdError::SegmentNotValid => CRC_SEGMENT_NOT_VALID,
            XcpCmdError::Sequence => CRC_SEQUENCE,
            XcpCmdError::DaqConfig => CRC_DAQ_CONFIG,
            XcpCmdError::MemoryOverflow => CRC_MEMORY_OVERFLOW,
            XcpCmdError::Generic => CRC_GENERIC,
            XcpCmdError::ResourceTemporaryNotAccessible => CRC_RESOURCE_TEMPORARY_NOT_ACCESSIBLE,
            XcpCmdError::SubcmdUnknown => CRC_SUBCMD_UNKNOWN,
        }
    }

    /// An ignored command produces no response packet
    pub fn has_response(self) -> bool {
        self != XcpCmdError::CmdIgnored
    }
}

//-------------------------------------------------------------------------------------------------
// Test module
