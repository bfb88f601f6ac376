//----------------------------------------------------------------------------------------------
// Module cmd
// XCP command processor

use log::{debug, error, info, trace, warn};

use super::addr::{read_memory, write_memory, XcpAddrExt, XCP_ADDR_EXT_A2L, XCP_ADDR_EXT_PTR};
use super::appl::XcpIdentifier;
use super::config::XcpCapabilities;
use super::daq::DaqTables;
use super::protocol::*;
use super::{Xcp, XcpSessionStatus};

// Undefined MTA address extension, any memory access is denied
const XCP_ADDR_EXT_UNDEFINED: u8 = 0xFF;

// Maximum block size of BUILD_CHECKSUM
const XCP_MAX_CHECKSUM_BLOCK_SIZE: u32 = 0x10_0000;

// UUID of the slave clock reported by TIME_CORRELATION_PROPERTIES
const XCP_SLAVE_CLOCK_UUID: [u8; 8] = [0xDC, 0xA6, 0x32, 0xFF, 0xFE, 0x7E, 0x66, 0xDC];

//----------------------------------------------------------------------------------------------
// CmdState

/// State of the command processor, owned by the single command context
pub(crate) struct CmdState {
    mta_ext: u8,
    mta_addr: u32,
    // Memory space XCP_ADDR_EXT_PTR, holds GET_ID data, event names and clock info for upload
    buffer: Vec<u8>,
    // Response packet buffer
    response: Vec<u8>,
}

impl CmdState {
    pub fn new() -> CmdState {
        CmdState {
            mta_ext: XCP_ADDR_EXT_UNDEFINED,
            mta_addr: 0,
            buffer: Vec::new(),
            response: Vec::with_capacity(256),
        }
    }

    pub fn reset(&mut self) {
        self.mta_ext = XCP_ADDR_EXT_UNDEFINED;
        self.mta_addr = 0;
        self.buffer.clear();
    }

    fn set_mta(&mut self, ext: u8, addr: u32) {
        trace!("MTA = {:02X}:{:08X}", ext, addr);
        self.mta_ext = ext;
        self.mta_addr = addr;
    }
}

//----------------------------------------------------------------------------------------------
// Command packet decoding

#[inline]
fn check_len(cro: &[u8], len: usize) -> Result<(), XcpCmdError> {
    if cro.len() < len {
        return Err(XcpCmdError::CmdSyntax);
    }
    Ok(())
}

#[inline]
fn get_u16(cro: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([cro[i], cro[i + 1]])
}

#[inline]
fn get_u32(cro: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([cro[i], cro[i + 1], cro[i + 2], cro[i + 3]])
}

//----------------------------------------------------------------------------------------------
// Command processor

impl Xcp {
    /// Process a XCP transport layer message (dlc u16, ctr u16, command packet)
    /// While disconnected, only a CONNECT command is accepted, anything else is refused without response
    pub fn tl_command(&self, msg: &[u8]) -> Result<(), XcpCmdError> {
        if msg.len() < 4 {
            warn!("tl_command: message too short, len={}", msg.len());
            return Err(XcpCmdError::CmdSyntax);
        }
        let dlc = get_u16(msg, 0) as usize;
        if dlc == 0 || dlc > self.config.max_cto as usize || dlc + 4 > msg.len() {
            warn!("tl_command: invalid dlc={}, len={}", dlc, msg.len());
            return Err(XcpCmdError::CmdSyntax);
        }
        let cro = &msg[4..4 + dlc];
        if cro[0] == CC_CONNECT && dlc == 2 {
            // Discard everything of a previous session
            self.queue.clear();
        } else if !self.is_connected() {
            debug!("tl_command: command {:02X} ignored, not connected", cro[0]);
            return Err(XcpCmdError::CmdSyntax);
        }
        self.command(cro)
    }

    /// Process a XCP command packet
    /// The response is queued in the transmit queue, errors are also returned to the caller
    pub fn command(&self, cro: &[u8]) -> Result<(), XcpCmdError> {
        let mut state = self.cmd.lock();
        let mut crm = std::mem::take(&mut state.response);
        crm.clear();
        crm.push(PID_RES);

        let mut res = self.dispatch(&mut state, cro, &mut crm);
        match res {
            Ok(()) => {
                if !self.queue.push(&crm, true) {
                    error!("Command response for {:02X} lost, transmit queue full", cro[0]);
                    res = Err(XcpCmdError::CmdBusy);
                }
            }
            Err(e) => {
                if e.has_response() {
                    debug!("Command {:02X} error: {} (0x{:02X})", cro.first().copied().unwrap_or(0), e, e.code());
                    if !self.queue.push(&[PID_ERR, e.code()], true) {
                        error!("Error response lost, transmit queue full");
                    }
                }
            }
        }
        state.response = crm;
        res
    }

    fn dispatch(&self, state: &mut CmdState, cro: &[u8], crm: &mut Vec<u8>) -> Result<(), XcpCmdError> {
        check_len(cro, 1)?;
        let cc = cro[0];
        if !self.is_started() {
            debug!("Command {:02X} ignored, protocol layer not started", cc);
            return Err(XcpCmdError::CmdIgnored);
        }
        if cc != CC_CONNECT && !self.is_connected() {
            debug!("Command {:02X} ignored, not connected", cc);
            return Err(XcpCmdError::CmdIgnored);
        }
        trace!("Command {:02X}, len={}", cc, cro.len());

        match cc {
            CC_CONNECT => self.cmd_connect(state, cro, crm),
            CC_DISCONNECT => {
                self.disconnect();
                Ok(())
            }
            CC_GET_STATUS => {
                crm.push(self.get_session_status().bits() as u8);
                crm.push(0); // Protection status
                crm.push(0); // State number
                crm.extend_from_slice(&0u16.to_le_bytes()); // Session configuration id
                Ok(())
            }
            CC_SYNCH => Err(XcpCmdError::CmdSynch),
            CC_GET_COMM_MODE_INFO => {
                crm.extend_from_slice(&[0, 0, 0, 0, 0, 0, XCP_DRIVER_VERSION]);
                Ok(())
            }
            CC_GET_ID => self.cmd_get_id(state, cro, crm),
            CC_SET_REQUEST => self.cmd_set_request(cro),
            CC_SET_MTA => {
                check_len(cro, 8)?;
                let ext = XcpAddrExt::try_from(cro[3])?;
                state.set_mta(ext as u8, get_u32(cro, 4));
                Ok(())
            }
            CC_UPLOAD => {
                check_len(cro, 2)?;
                let n = cro[1] as usize;
                if n > self.config.max_cto as usize - 1 {
                    return Err(XcpCmdError::OutOfRange);
                }
                crm.resize(1 + n, 0);
                self.read_mta(state, &mut crm[1..])?;
                state.mta_addr = state.mta_addr.wrapping_add(n as u32);
                Ok(())
            }
            CC_SHORT_UPLOAD => {
                check_len(cro, 8)?;
                let n = cro[1] as usize;
                if n > self.config.max_cto as usize - 1 {
                    return Err(XcpCmdError::OutOfRange);
                }
                let ext = XcpAddrExt::try_from(cro[3])?;
                let addr = get_u32(cro, 4);
                crm.resize(1 + n, 0);
                read_memory(self.appl.as_ref(), &self.window, ext, addr, &mut crm[1..])?;
                state.set_mta(ext as u8, addr.wrapping_add(n as u32));
                Ok(())
            }
            CC_BUILD_CHECKSUM => self.cmd_build_checksum(state, cro, crm),
            CC_TRANSPORT_LAYER_CMD => self.cmd_transport_layer(cro, crm),
            CC_USER_CMD => {
                if !self.config.capabilities.contains(XcpCapabilities::USER_CMD) {
                    return Err(XcpCmdError::CmdUnknown);
                }
                self.appl.user_command(cro, crm)?;
                if crm.len() > self.config.max_cto as usize {
                    warn!("User command response exceeds max_cto");
                    return Err(XcpCmdError::Generic);
                }
                Ok(())
            }
            CC_DOWNLOAD => {
                check_len(cro, 2)?;
                let n = cro[1] as usize;
                if n > self.config.max_cto as usize - 2 {
                    return Err(XcpCmdError::OutOfRange);
                }
                check_len(cro, 2 + n)?;
                self.write_mta(state, &cro[2..2 + n])?;
                state.mta_addr = state.mta_addr.wrapping_add(n as u32);
                Ok(())
            }
            CC_SHORT_DOWNLOAD => {
                check_len(cro, 8)?;
                let n = cro[1] as usize;
                if n > self.config.max_cto as usize - 8 {
                    return Err(XcpCmdError::OutOfRange);
                }
                check_len(cro, 8 + n)?;
                let ext = XcpAddrExt::try_from(cro[3])?;
                let addr = get_u32(cro, 4);
                write_memory(self.appl.as_ref(), &self.window, ext, addr, &cro[8..8 + n])?;
                state.set_mta(ext as u8, addr.wrapping_add(n as u32));
                Ok(())
            }

            // Calibration page commands
            CC_SET_CAL_PAGE => {
                check_len(cro, 4)?;
                self.cal.set_cal_page(self.appl.as_ref(), cro[2], cro[3], cro[1])
            }
            CC_GET_CAL_PAGE => {
                check_len(cro, 3)?;
                let page = self.cal.get_cal_page(cro[2], cro[1])?;
                crm.extend_from_slice(&[0, 0, page]);
                Ok(())
            }
            CC_GET_PAG_PROCESSOR_INFO => {
                if !self.cal.is_enabled() {
                    return Err(XcpCmdError::CmdUnknown);
                }
                crm.push(self.cal.get_segment_count());
                crm.push(if self.cal.is_freeze_enabled() { PAG_PROPERTY_FREEZE } else { 0 });
                Ok(())
            }
            CC_SET_SEGMENT_MODE => {
                check_len(cro, 3)?;
                self.cal.set_segment_mode(cro[2], cro[1])
            }
            CC_GET_SEGMENT_MODE => {
                check_len(cro, 3)?;
                let mode = self.cal.get_segment_mode(cro[2])?;
                crm.extend_from_slice(&[0, mode]);
                Ok(())
            }
            CC_COPY_CAL_PAGE => {
                check_len(cro, 5)?;
                self.cal.copy_cal_page(self.appl.as_ref(), cro[1], cro[2], cro[3], cro[4])
            }

            // DAQ commands
            CC_GET_DAQ_CLOCK => {
                let t = self.clock.get_clock64();
                if self.config.capabilities.contains(XcpCapabilities::DAQ_CLOCK_64BIT) {
                    crm.extend_from_slice(&[0, DAQ_CLOCK_TRIGGER_INFO_SAMPLED_ON_RECEPTION, DAQ_CLOCK_PAYLOAD_FMT_SLV_64]);
                    crm.extend_from_slice(&t.to_le_bytes());
                } else {
                    crm.extend_from_slice(&[0, 0, 0]);
                    crm.extend_from_slice(&(t as u32).to_le_bytes());
                }
                Ok(())
            }
            CC_GET_DAQ_PROCESSOR_INFO => {
                let events = self.events.read();
                let daq = self.daq.read();
                let event_count = if self.config.capabilities.contains(XcpCapabilities::EVENT_INFO) { events.len() as u16 } else { 0 };
                crm.push(DAQ_PROPERTY_CONFIG_TYPE | DAQ_PROPERTY_PRESCALER | DAQ_PROPERTY_TIMESTAMP);
                crm.extend_from_slice(&daq.get_list_count().to_le_bytes());
                crm.extend_from_slice(&event_count.to_le_bytes());
                crm.push(0); // No predefined DAQ lists
                crm.push(DAQ_HDR_ODT_FIL_DAQW);
                Ok(())
            }
            CC_GET_DAQ_RESOLUTION_INFO => {
                crm.extend_from_slice(&[1, DAQ_MAX_ODT_ENTRY_SIZE, 1, 0]);
                crm.push(DAQ_TIMESTAMP_DWORD | DAQ_TIMESTAMP_FIXED | self.clock.get_unit().resolution_code());
                crm.extend_from_slice(&1u16.to_le_bytes());
                Ok(())
            }
            CC_GET_DAQ_EVENT_INFO => {
                if !self.config.capabilities.contains(XcpCapabilities::EVENT_INFO) {
                    return Err(XcpCmdError::CmdUnknown);
                }
                check_len(cro, 4)?;
                let info = self.events.read().get_info(get_u16(cro, 2)).ok_or(XcpCmdError::OutOfRange)?;
                crm.push(DAQ_EVENT_PROPERTIES_DAQ | DAQ_EVENT_PROPERTIES_EVENT_CONSISTENCY);
                crm.push(0xFF); // Max DAQ lists
                crm.push(info.name.len() as u8);
                crm.push(info.cycle_time_count);
                crm.push(info.cycle_time_unit);
                crm.push(info.priority as u8);
                state.buffer = info.name.into_bytes();
                state.set_mta(XCP_ADDR_EXT_PTR, 0);
                Ok(())
            }
            CC_CLEAR_DAQ_LIST
            | CC_SET_DAQ_PTR
            | CC_WRITE_DAQ
            | CC_WRITE_DAQ_MULTIPLE
            | CC_SET_DAQ_LIST_MODE
            | CC_GET_DAQ_LIST_MODE
            | CC_START_STOP_DAQ_LIST
            | CC_START_STOP_SYNCH
            | CC_FREE_DAQ
            | CC_ALLOC_DAQ
            | CC_ALLOC_ODT
            | CC_ALLOC_ODT_ENTRY => self.cmd_daq(cro, crm),

            CC_TIME_CORRELATION_PROPERTIES => self.cmd_time_correlation_properties(state, cro, crm),
            CC_LEVEL_1_COMMAND => {
                check_len(cro, 2)?;
                match cro[1] {
                    CC_GET_VERSION => {
                        crm.push(0);
                        crm.extend_from_slice(&XCP_PROTOCOL_LAYER_VERSION.to_be_bytes());
                        crm.extend_from_slice(&XCP_TRANSPORT_LAYER_VERSION.to_be_bytes());
                        Ok(())
                    }
                    _ => Err(XcpCmdError::SubcmdUnknown),
                }
            }
            _ => {
                debug!("Unknown command {:02X}", cc);
                Err(XcpCmdError::CmdUnknown)
            }
        }
    }

    //------------------------------------------------------------------------------------------
    // Session commands

    fn cmd_connect(&self, state: &mut CmdState, cro: &[u8], crm: &mut Vec<u8>) -> Result<(), XcpCmdError> {
        check_len(cro, 2)?;
        if self.is_connected() {
            info!("XCP client reconnect");
            self.disconnect();
        }
        if !self.appl.on_connect() {
            warn!("Connect refused by application");
            return Err(XcpCmdError::AccessDenied);
        }
        state.reset();
        self.session.set(XcpSessionStatus::SS_CONNECTED);
        info!("XCP client connected, mode={}", cro[1]);

        let resource = if self.cal.is_enabled() { RM_CAL_PAG | RM_DAQ } else { RM_DAQ };
        crm.push(resource);
        crm.push(CMB_OPTIONAL);
        crm.push(self.config.max_cto);
        crm.extend_from_slice(&self.config.max_dto.to_le_bytes());
        crm.push((XCP_PROTOCOL_LAYER_VERSION >> 8) as u8);
        crm.push((XCP_TRANSPORT_LAYER_VERSION >> 8) as u8);
        Ok(())
    }

    fn cmd_get_id(&self, state: &mut CmdState, cro: &[u8], crm: &mut Vec<u8>) -> Result<(), XcpCmdError> {
        check_len(cro, 2)?;
        let id_type = cro[1];
        let id = self.appl.get_id(id_type).or_else(|| match id_type {
            IDT_ASCII | IDT_ASAM_NAME => Some(XcpIdentifier::Data(self.config.name.as_bytes().to_vec())),
            _ => None,
        });
        debug!("GET_ID type={}: {:?}", id_type, id);

        let (mode, len) = match id {
            None => (0, 0),
            Some(XcpIdentifier::Data(data)) => {
                let len = data.len() as u32;
                if data.len() <= self.config.max_cto as usize - 8 {
                    crm.extend_from_slice(&[1, 0, 0]);
                    crm.extend_from_slice(&len.to_le_bytes());
                    crm.extend_from_slice(&data);
                    return Ok(());
                }
                state.buffer = data;
                state.set_mta(XCP_ADDR_EXT_PTR, 0);
                (0, len)
            }
            Some(XcpIdentifier::Upload(size)) => {
                if self.config.capabilities.contains(XcpCapabilities::A2L_UPLOAD) {
                    state.set_mta(XCP_ADDR_EXT_A2L, 0);
                    (0, size)
                } else {
                    (0, 0)
                }
            }
        };
        crm.extend_from_slice(&[mode, 0, 0]);
        crm.extend_from_slice(&len.to_le_bytes());
        Ok(())
    }

    fn cmd_set_request(&self, cro: &[u8]) -> Result<(), XcpCmdError> {
        check_len(cro, 2)?;
        let mode = cro[1];
        if mode & SET_REQUEST_STORE_CAL_REQ != 0 {
            self.session.set(XcpSessionStatus::SS_STORE_CAL_REQ);
            let res = self.cal.freeze_selected(self.appl.as_ref());
            self.session.clear(XcpSessionStatus::SS_STORE_CAL_REQ);
            res?;
        }
        if mode & SET_REQUEST_CLEAR_DAQ_REQ != 0 {
            // DAQ configurations are not persisted
            self.session.clear(XcpSessionStatus::SS_CLEAR_DAQ_REQ);
        }
        Ok(())
    }

    //------------------------------------------------------------------------------------------
    // Memory access

    // Read from the memory transfer address
    fn read_mta(&self, state: &CmdState, dst: &mut [u8]) -> Result<(), XcpCmdError> {
        match state.mta_ext {
            XCP_ADDR_EXT_A2L => {
                if !self.appl.read_a2l(state.mta_addr, dst) {
                    return Err(XcpCmdError::AccessDenied);
                }
                Ok(())
            }
            XCP_ADDR_EXT_PTR => {
                let start = state.mta_addr as usize;
                let src = state.buffer.get(start..start + dst.len()).ok_or(XcpCmdError::AccessDenied)?;
                dst.copy_from_slice(src);
                Ok(())
            }
            ext => read_memory(self.appl.as_ref(), &self.window, XcpAddrExt::try_from(ext)?, state.mta_addr, dst),
        }
    }

    // Write to the memory transfer address, the internal memory spaces are read only
    fn write_mta(&self, state: &CmdState, src: &[u8]) -> Result<(), XcpCmdError> {
        let ext = XcpAddrExt::try_from(state.mta_ext)?;
        write_memory(self.appl.as_ref(), &self.window, ext, state.mta_addr, src)
    }

    fn cmd_build_checksum(&self, state: &mut CmdState, cro: &[u8], crm: &mut Vec<u8>) -> Result<(), XcpCmdError> {
        if !self.config.capabilities.contains(XcpCapabilities::CHECKSUM) {
            return Err(XcpCmdError::CmdUnknown);
        }
        check_len(cro, 8)?;
        let size = get_u32(cro, 4);
        if size % 4 != 0 || size > XCP_MAX_CHECKSUM_BLOCK_SIZE {
            return Err(XcpCmdError::OutOfRange);
        }

        // ADD_44, sum of little endian u32 words
        let mut checksum: u32 = 0;
        let mut block = [0u8; 256];
        let mut remaining = size as usize;
        while remaining > 0 {
            let n = remaining.min(block.len());
            self.read_mta(state, &mut block[..n])?;
            for w in block[..n].chunks_exact(4) {
                checksum = checksum.wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
            }
            state.mta_addr = state.mta_addr.wrapping_add(n as u32);
            remaining -= n;
        }
        debug!("BUILD_CHECKSUM size={}, checksum=0x{:08X}", size, checksum);

        crm.extend_from_slice(&[XCP_CHECKSUM_TYPE_ADD44, 0, 0]);
        crm.extend_from_slice(&checksum.to_le_bytes());
        Ok(())
    }

    //------------------------------------------------------------------------------------------
    // Clock commands

    fn cmd_transport_layer(&self, cro: &[u8], crm: &mut Vec<u8>) -> Result<(), XcpCmdError> {
        check_len(cro, 2)?;
        match cro[1] {
            CC_TL_GET_DAQ_CLOCK_MULTICAST => {
                if !self.config.capabilities.contains(XcpCapabilities::DAQ_CLOCK_MULTICAST) {
                    return Err(XcpCmdError::CmdUnknown);
                }
                check_len(cro, 5)?;
                let cluster_id = get_u16(cro, 2);
                let counter = cro[4];
                if cluster_id != self.clock.get_cluster_id() {
                    debug!("GET_DAQ_CLOCK_MULTICAST for cluster {} ignored", cluster_id);
                    return Err(XcpCmdError::CmdIgnored);
                }
                // Answered with a time sync event instead of a command response
                let t = self.clock.get_clock64();
                crm.clear();
                crm.extend_from_slice(&[PID_EV, EVC_TIME_SYNC]);
                if self.config.capabilities.contains(XcpCapabilities::DAQ_CLOCK_64BIT) {
                    crm.extend_from_slice(&[DAQ_CLOCK_TRIGGER_INFO_SAMPLED_ON_RECEPTION, DAQ_CLOCK_PAYLOAD_FMT_SLV_64]);
                    crm.extend_from_slice(&t.to_le_bytes());
                } else {
                    crm.extend_from_slice(&[DAQ_CLOCK_TRIGGER_INFO_SAMPLED_ON_RECEPTION, DAQ_CLOCK_PAYLOAD_FMT_SLV_32]);
                    crm.extend_from_slice(&(t as u32).to_le_bytes());
                }
                crm.extend_from_slice(&cluster_id.to_le_bytes());
                crm.push(counter);
                Ok(())
            }
            sub => {
                debug!("Unknown transport layer command {:02X}", sub);
                Err(XcpCmdError::SubcmdUnknown)
            }
        }
    }

    fn cmd_time_correlation_properties(&self, state: &mut CmdState, cro: &[u8], crm: &mut Vec<u8>) -> Result<(), XcpCmdError> {
        if !self.config.capabilities.contains(XcpCapabilities::TIME_CORRELATION) {
            return Err(XcpCmdError::CmdUnknown);
        }
        check_len(cro, 6)?;
        let set_properties = cro[1];
        let get_properties_request = cro[2];
        if set_properties & TIME_SYNC_SET_CLUSTER_ID != 0 {
            self.clock.set_cluster_id(get_u16(cro, 4));
        }

        let grandmaster = self.config.capabilities.contains(XcpCapabilities::PTP) && self.clock.get_grandmaster_info().is_some();
        crm.push(0); // Slave config
        crm.push(if grandmaster { SLAVE_GRANDM_CLOCK_READABLE } else { SLAVE_CLOCK_FREE_RUNNING });
        crm.push(self.clock.get_state() as u8);
        crm.push(if grandmaster { CLOCK_INFO_SLAVE | CLOCK_INFO_SLAVE_GRANDM } else { CLOCK_INFO_SLAVE });
        crm.push(0);
        crm.extend_from_slice(&self.clock.get_cluster_id().to_le_bytes());

        if get_properties_request & TIME_SYNC_GET_CLK_INFO != 0 {
            state.buffer = self.clock.get_clock_info(XCP_SLAVE_CLOCK_UUID, grandmaster);
            state.set_mta(XCP_ADDR_EXT_PTR, 0);
        }
        Ok(())
    }

    //------------------------------------------------------------------------------------------
    // DAQ configuration and start/stop

    fn cmd_daq(&self, cro: &[u8], crm: &mut Vec<u8>) -> Result<(), XcpCmdError> {
        let events = self.events.read();
        let mut daq = self.daq.write();
        let cc = cro[0];

        // Allocation and ODT entry configuration is not possible while DAQ is running
        if daq.is_running() && matches!(cc, CC_FREE_DAQ | CC_ALLOC_DAQ | CC_ALLOC_ODT | CC_ALLOC_ODT_ENTRY | CC_WRITE_DAQ | CC_WRITE_DAQ_MULTIPLE) {
            return Err(XcpCmdError::DaqActive);
        }

        match cc {
            CC_FREE_DAQ => {
                daq.free();
                events.reset_daq_lists();
                Ok(())
            }
            CC_ALLOC_DAQ => {
                check_len(cro, 4)?;
                daq.alloc_daq(get_u16(cro, 2))
            }
            CC_ALLOC_ODT => {
                check_len(cro, 5)?;
                daq.alloc_odt(get_u16(cro, 2), cro[4])
            }
            CC_ALLOC_ODT_ENTRY => {
                check_len(cro, 6)?;
                daq.alloc_odt_entry(get_u16(cro, 2), cro[4], cro[5])
            }
            CC_SET_DAQ_PTR => {
                check_len(cro, 6)?;
                daq.set_daq_ptr(get_u16(cro, 2), cro[4], cro[5])
            }
            CC_WRITE_DAQ => {
                check_len(cro, 8)?;
                daq.write_daq(cro[1], cro[2], cro[3], get_u32(cro, 4))
            }
            CC_WRITE_DAQ_MULTIPLE => {
                check_len(cro, 2)?;
                let n = cro[1] as usize;
                if 2 + n * 8 > self.config.max_cto as usize {
                    return Err(XcpCmdError::OutOfRange);
                }
                check_len(cro, 2 + n * 8)?;
                for e in cro[2..2 + n * 8].chunks_exact(8) {
                    daq.write_daq(e[0], e[1], e[6], get_u32(e, 2))?;
                }
                Ok(())
            }
            CC_SET_DAQ_LIST_MODE => {
                check_len(cro, 8)?;
                daq.set_daq_list_mode(get_u16(cro, 2), cro[1], get_u16(cro, 4), cro[6], cro[7], events.len())?;
                daq.bind_events(&events);
                Ok(())
            }
            CC_GET_DAQ_LIST_MODE => {
                check_len(cro, 4)?;
                let (mode, event, prescaler, priority) = daq.get_daq_list_mode(get_u16(cro, 2))?;
                crm.extend_from_slice(&[mode, 0, 0]);
                crm.extend_from_slice(&event.to_le_bytes());
                crm.push(prescaler);
                crm.push(priority);
                Ok(())
            }
            CC_CLEAR_DAQ_LIST => {
                check_len(cro, 4)?;
                let n = get_u16(cro, 2);
                let running = daq.get_list(n).ok_or(XcpCmdError::OutOfRange)?.is_running();
                if running {
                    self.stop_lists(&mut daq, &[n]);
                }
                daq.clear_daq_list(n)?;
                daq.bind_events(&events);
                Ok(())
            }
            CC_START_STOP_DAQ_LIST => {
                check_len(cro, 4)?;
                let n = get_u16(cro, 2);
                if daq.get_list(n).is_none() {
                    return Err(XcpCmdError::OutOfRange);
                }
                match cro[1] {
                    DAQ_LIST_STOP => self.stop_lists(&mut daq, &[n]),
                    DAQ_LIST_START => self.start_lists(&mut daq, &[n], events.len())?,
                    DAQ_LIST_SELECT => daq.select(n, true)?,
                    _ => return Err(XcpCmdError::OutOfRange),
                }
                crm.push(0); // First PID, relative ODT numbers
                Ok(())
            }
            CC_START_STOP_SYNCH => {
                check_len(cro, 2)?;
                match cro[1] {
                    DAQ_STOP_ALL => {
                        let running = daq.is_running();
                        daq.stop_all();
                        if running {
                            self.session.stop_daq();
                            info!("DAQ stopped, overflow_count={}", self.session.get_daq_overflow_count());
                            self.appl.on_stop_daq();
                        }
                        Ok(())
                    }
                    DAQ_START_SELECTED => {
                        let lists = daq.get_selected();
                        self.start_lists(&mut daq, &lists, events.len())
                    }
                    DAQ_STOP_SELECTED => {
                        let lists = daq.get_selected();
                        self.stop_lists(&mut daq, &lists);
                        Ok(())
                    }
                    DAQ_PREPARE_START_SELECTED => {
                        let lists = daq.get_selected();
                        daq.check_start(&lists, events.len())?;
                        if !self.appl.on_prepare_daq() {
                            warn!("DAQ prepare refused by application");
                            return Err(XcpCmdError::ResourceTemporaryNotAccessible);
                        }
                        daq.set_prepared(true);
                        Ok(())
                    }
                    _ => Err(XcpCmdError::OutOfRange),
                }
            }
            _ => Err(XcpCmdError::CmdUnknown),
        }
    }

    // Start DAQ lists, prepare and start may be refused by the application
    fn start_lists(&self, daq: &mut DaqTables, lists: &[u16], event_count: usize) -> Result<(), XcpCmdError> {
        daq.check_start(lists, event_count)?;
        if lists.is_empty() {
            return Ok(());
        }
        let first = !daq.is_running();
        if first {
            if !daq.is_prepared() && !self.appl.on_prepare_daq() {
                warn!("DAQ prepare refused by application");
                return Err(XcpCmdError::ResourceTemporaryNotAccessible);
            }
            if !self.appl.on_start_daq() {
                warn!("DAQ start refused by application");
                daq.set_prepared(false);
                return Err(XcpCmdError::ResourceTemporaryNotAccessible);
            }
        }
        daq.set_prepared(false);
        daq.start_lists(lists);
        if first {
            let t = self.clock.get_clock64();
            self.session.start_daq(t);
            info!("DAQ started, {} DAQ lists, {} bytes DAQ memory used", daq.get_list_count(), daq.get_mem_used());
        }
        Ok(())
    }

    // Stop DAQ lists, DAQ stops when no list is running anymore
    fn stop_lists(&self, daq: &mut DaqTables, lists: &[u16]) {
        if daq.stop_lists(lists) && self.session.is(XcpSessionStatus::SS_DAQ) {
            self.session.stop_daq();
            info!("DAQ stopped, overflow_count={}", self.session.get_daq_overflow_count());
            self.appl.on_stop_daq();
        }
    }
}

//-------------------------------------------------------------------------------------------------
// Test module
