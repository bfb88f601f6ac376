//----------------------------------------------------------------------------------------------
// Module appl
// Application callbacks of the protocol layer

use log::trace;

use super::protocol::XcpCmdError;

/// Identification data provided by the application for GET_ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XcpIdentifier {
    /// Identification bytes, sent in the response or by upload, depending on size
    Data(Vec<u8>),
    /// Size of uploadable content (the A2L file), read in chunks with XcpAppl::read_a2l
    Upload(u32),
}

/// Callbacks from the protocol layer to the application
///
/// All callbacks may be called concurrently from the command processor and from any context triggering events.
/// read_memory is called by the DAQ event engine for application addressed ODT entries.
pub trait XcpAppl: Send + Sync {
    /// Connect request, return false to refuse the connection
    fn on_connect(&self) -> bool {
        true
    }

    /// Disconnect, always succeeds
    fn on_disconnect(&self) {}

    /// Prepare DAQ start, return false to refuse
    fn on_prepare_daq(&self) -> bool {
        true
    }

    /// DAQ start, return false to refuse
    fn on_start_daq(&self) -> bool {
        true
    }

    /// DAQ stop, unconditional
    fn on_stop_daq(&self) {}

    /// Read memory with application specific addressing (XCP_ADDR_EXT_APP)
    fn read_memory(&self, addr: u32, dst: &mut [u8]) -> Result<(), XcpCmdError> {
        trace!("read_memory: addr=0x{:08X}, len={} not supported", addr, dst.len());
        Err(XcpCmdError::AccessDenied)
    }

    /// Write memory with application specific addressing (XCP_ADDR_EXT_APP)
    fn write_memory(&self, addr: u32, src: &[u8]) -> Result<(), XcpCmdError> {
        trace!("write_memory: addr=0x{:08X}, len={} not supported", addr, src.len());
        Err(XcpCmdError::AccessDenied)
    }

    /// Calibration page switch, called after segment, page and mode have been validated
    /// Return an error to refuse the switch
    fn set_cal_page(&self, _segment: u8, _page: u8, _mode: u8) -> Result<(), XcpCmdError> {
        Ok(())
    }

    /// Copy a calibration page
    fn copy_cal_page(&self, _src_segment: u8, _src_page: u8, _dst_segment: u8, _dst_page: u8) -> Result<(), XcpCmdError> {
        Ok(())
    }

    /// Persist the active page of a segment as its new default
    fn freeze_cal_page(&self, _segment: u8) -> Result<(), XcpCmdError> {
        Ok(())
    }

    /// Identification for GET_ID, None if the id type is not supported
    fn get_id(&self, _id_type: u8) -> Option<XcpIdentifier> {
        None
    }

    /// Read a chunk of the A2L file, return false if offset and size are out of bounds
    fn read_a2l(&self, _offset: u32, _dst: &mut [u8]) -> bool {
        false
    }

    /// User defined command, the complete command packet is given
    /// Response bytes appended to response follow the positive response PID
    fn user_command(&self, _cmd: &[u8], _response: &mut Vec<u8>) -> Result<(), XcpCmdError> {
        Err(XcpCmdError::CmdUnknown)
    }
}

/// Application without any memory access, accepting connect and DAQ start
#[derive(Debug, Default)]
pub struct XcpDefaultAppl;

impl XcpAppl for XcpDefaultAppl {}
