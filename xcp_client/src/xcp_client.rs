//--------------------------------------------------------------------------------------------------------------------------------------------------
// Module xcp_client
// Simplified implementation of an in process XCP client for integration testing
// Commands are passed to the protocol layer as transport layer messages, responses and DAQ packets are taken from its transmit queue

#![allow(dead_code)] // because of all the unused XCP definitions

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{timeout, Duration};

use xcp_core::protocol::*;
use xcp_core::Xcp;

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XCP Parameters

pub const CMD_TIMEOUT: Duration = Duration::from_secs(4);

pub const XCPTL_MAX_SEGMENT_SIZE: usize = 2048 * 2;

// Poll cycle of the receive task
const RECEIVE_POLL_CYCLE: Duration = Duration::from_micros(500);

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XCP client error type

// Client specific error codes, beyond the XCP command return codes
pub const ERROR_CMD_TIMEOUT: u8 = 0xF0;
pub const ERROR_TL_HEADER: u8 = 0xF1;
pub const ERROR_LIMIT: u8 = 0xF3;
pub const ERROR_ODT_SIZE: u8 = 0xF4;
pub const ERROR_NOT_CONNECTED: u8 = 0xF5;

pub struct XcpClientError {
    code: u8,
}

impl XcpClientError {
    pub fn new(code: u8) -> XcpClientError {
        XcpClientError { code }
    }
    pub fn get_error_code(&self) -> u8 {
        self.code
    }
}

impl std::fmt::Display for XcpClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.code {
            ERROR_CMD_TIMEOUT => {
                write!(f, "Command response timeout")
            }
            ERROR_TL_HEADER => {
                write!(f, "Transport layer header error")
            }
            ERROR_LIMIT => {
                write!(f, "Calibration value limit exceeded")
            }
            ERROR_ODT_SIZE => {
                write!(f, "ODT max size exceeded")
            }
            ERROR_NOT_CONNECTED => {
                write!(f, "Not connected")
            }
            CRC_CMD_SYNCH => {
                write!(f, "SYNCH")
            }
            CRC_CMD_BUSY => {
                write!(f, "XCP command BUSY")
            }
            CRC_DAQ_ACTIVE => {
                write!(f, "XCP DAQ ACTIVE")
            }
            CRC_CMD_UNKNOWN => {
                write!(f, "XCP command UNKNOWN")
            }
            CRC_CMD_SYNTAX => {
                write!(f, "XCP command SYNTAX")
            }
            CRC_OUT_OF_RANGE => {
                write!(f, "Parameter out of range")
            }
            CRC_ACCESS_DENIED => {
                write!(f, "Access denied")
            }
            CRC_PAGE_NOT_VALID => {
                write!(f, "Invalid page")
            }
            CRC_PAGE_MODE_NOT_VALID => {
                write!(f, "Invalid page mode")
            }
            CRC_SEGMENT_NOT_VALID => {
                write!(f, "Invalid segment")
            }
            CRC_SEQUENCE => {
                write!(f, "Wrong sequence")
            }
            CRC_DAQ_CONFIG => {
                write!(f, "DAQ configuration error")
            }
            CRC_MEMORY_OVERFLOW => {
                write!(f, "Memory overflow")
            }
            CRC_GENERIC => {
                write!(f, "XCP generic error")
            }
            CRC_RESOURCE_TEMPORARY_NOT_ACCESSIBLE => {
                write!(f, "Resource temporary not accessible")
            }
            CRC_SUBCMD_UNKNOWN => {
                write!(f, "Unknown sub command")
            }
            _ => {
                write!(f, "XCP error code = 0x{:0X}", self.code)
            }
        }
    }
}

impl std::fmt::Debug for XcpClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "XcpClientError 0x{:02X} - {}", self.code, self)
    }
}

impl std::error::Error for XcpClientError {}

/// Get the XCP error code of a client error, None for other errors
pub fn get_error_code(e: &(dyn Error + 'static)) -> Option<u8> {
    e.downcast_ref::<XcpClientError>().map(XcpClientError::get_error_code)
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Build XCP commands with transport layer header

pub struct XcpCommandBuilder {
    data: BytesMut,
}

impl XcpCommandBuilder {
    pub fn new(command_code: u8) -> XcpCommandBuilder {
        let mut cmd = XcpCommandBuilder { data: BytesMut::with_capacity(12) };
        cmd.data.put_u16_le(0);
        cmd.data.put_u16_le(0);
        cmd.data.put_u8(command_code);
        cmd
    }
    pub fn add_u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    pub fn add_u8_slice(&mut self, value: &[u8]) -> &mut Self {
        self.data.put_slice(value);
        self
    }

    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        assert!(self.data.len() & 1 == 0, "add_u16: unaligned");
        self.data.put_u16_le(value);
        self
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        assert!(self.data.len() & 3 == 0, "add_u32: unaligned");
        self.data.put_u32_le(value);
        self
    }

    pub fn build(&mut self) -> &[u8] {
        let len = self.data.len() as u16;
        assert!(len >= 5);
        LittleEndian::write_u16(&mut self.data[0..2], len - 4);
        self.data.as_ref()
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// CalibrationObject
// Describes a calibration object with name, address, size, limits and caches its actual value

#[derive(Debug, Clone, Copy)]
pub struct XcpCalibrationObjectHandle(usize);

#[derive(Debug)]
pub struct XcpCalibrationObject {
    name: String,
    ext: u8,
    addr: u32,
    size: u8,
    limits: (f64, f64),
    value: Vec<u8>,
}

impl XcpCalibrationObject {
    pub fn new(name: &str, ext: u8, addr: u32, size: u8, limits: (f64, f64)) -> XcpCalibrationObject {
        XcpCalibrationObject {
            name: name.to_string(),
            ext,
            addr,
            size,
            limits,
            value: Vec::new(),
        }
    }

    pub fn set_value(&mut self, bytes: &[u8]) {
        self.value = bytes.to_vec();
    }

    pub fn get_value_u64(&self) -> u64 {
        let mut value = 0u64;
        for i in (0..self.size).rev() {
            value <<= 8;
            value += self.value[i as usize] as u64;
        }
        value
    }

    pub fn get_value_i64(&self) -> i64 {
        let size: usize = self.size as usize;
        let mut value = 0;
        if self.value[size - 1] & 0x80 != 0 {
            value = -1;
        }
        for i in (0..size).rev() {
            value <<= 8;
            value |= self.value[i] as i64;
        }
        value
    }

    fn check_limits(&self, value: f64) -> Result<(), XcpClientError> {
        if value > self.limits.1 || value < self.limits.0 {
            warn!("Calibration object {}: value {} out of limits {:?}", self.name, value, self.limits);
            return Err(XcpClientError::new(ERROR_LIMIT));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// MeasurementObject
// Describes a measurement object with name, address, size and event

#[derive(Debug, Clone, Copy)]
pub struct XcpMeasurementObjectHandle(usize);

#[derive(Debug, Clone)]
pub struct XcpMeasurementObject {
    name: String,
    pub ext: u8,
    pub addr: u32,
    pub size: u8,
    pub event: u16,
    pub daq: u16,
    pub odt: u8,
    pub offset: u16, // Offset in the DAQ packet payload
}

impl XcpMeasurementObject {
    pub fn new(name: &str, ext: u8, addr: u32, size: u8, event: u16) -> XcpMeasurementObject {
        XcpMeasurementObject {
            name: name.to_string(),
            ext,
            addr,
            size,
            event,
            daq: 0,
            odt: 0,
            offset: 0,
        }
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Default printf decoder for XCP SERV_TEXT data

pub trait XcpTextDecoder {
    fn decode(&self, data: &[u8]);
}

pub struct DefaultTextDecoder;

impl XcpTextDecoder for DefaultTextDecoder {
    fn decode(&self, data: &[u8]) {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        info!("SERV_TEXT: {}", String::from_utf8_lossy(&data[..end]));
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Default decoder for XCP DAQ data

pub trait XcpDaqDecoder {
    /// Handle incomming DAQ data from XCP server
    fn decode(&mut self, lost: u32, daq: u16, odt: u8, timestamp: u32, data: &[u8]);
}

pub struct DefaultDaqDecoder;

impl XcpDaqDecoder for DefaultDaqDecoder {
    fn decode(&mut self, lost: u32, daq: u16, odt: u8, timestamp: u32, data: &[u8]) {
        trace!("DAQ: lost = {}, daq = {}, odt = {} timestamp = {} data={:?})", lost, daq, odt, timestamp, data);
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Type to control the receive task sent over the receive task control channel

#[derive(Debug, Copy, Clone)]
pub struct XcpTaskControl {
    running: bool,
    connected: bool,
}

impl XcpTaskControl {
    #[allow(clippy::new_without_default)]
    pub fn new() -> XcpTaskControl {
        XcpTaskControl { running: false, connected: false }
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XcpClient type

/// XCP client
pub struct XcpClient {
    xcp: Arc<Xcp>,
    rx_cmd_resp: Option<mpsc::Receiver<Vec<u8>>>,
    tx_task_control: Option<mpsc::Sender<XcpTaskControl>>,
    task_control: XcpTaskControl,
    max_cto_size: u8,
    max_dto_size: u16,
    calibration_objects: Vec<XcpCalibrationObject>,
    measurement_objects: Vec<XcpMeasurementObject>,
}

impl XcpClient {
    //------------------------------------------------------------------------
    // receiver task
    // Handle incomming data from the transmit queue of the XCP server
    async fn receive_task(
        xcp: Arc<Xcp>,
        tx_resp: Sender<Vec<u8>>,
        mut rx_task_control: Receiver<XcpTaskControl>,
        decode_serv_text: impl XcpTextDecoder,
        decode_daq: Arc<Mutex<impl XcpDaqDecoder>>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut ctr_last: u16 = 0;
        let mut ctr_first: bool = true;
        let mut ctr_lost: u32 = 0;

        let mut task_control: Option<XcpTaskControl> = None;
        let mut poll = tokio::time::interval(RECEIVE_POLL_CYCLE);

        loop {
            select! {

                // Handle the data from rx_task_control
                res = rx_task_control.recv() => {
                    match res {
                        Some(c) => {
                            debug!("receive_task: task control status changed: connected={} running={}", c.connected, c.running);

                            // Disconnect
                            if !c.connected {
                                info!("receive_task: stop, disconnect");
                                return Ok(());
                            }

                            // Start DAQ
                            if c.running {
                                info!("receive_task: start DAQ");
                                ctr_first = true;
                                ctr_last = 0;
                                ctr_lost = 0;
                            }

                            task_control = Some(c);
                        }
                        None => { // The sender has been dropped
                            info!("receive_task: stop, channel closed");
                            return Ok(());
                        }
                    }
                } // rx_task_control.recv

                // Poll the transmit queue
                _ = poll.tick() => {
                    while let Some(buf) = xcp.queue().pop_segment(XCPTL_MAX_SEGMENT_SIZE) {
                        let size = buf.len();
                        let mut i: usize = 0;
                        while i < size {
                            // Decode the next transport layer message header in the segment
                            if size - i < 5 {
                                return Err(Box::new(XcpClientError::new(ERROR_TL_HEADER)));
                            }
                            let len = LittleEndian::read_u16(&buf[i..i + 2]) as usize;
                            if len > size - i - 4 || len == 0 { // Corrupt segment or no content
                                return Err(Box::new(XcpClientError::new(ERROR_TL_HEADER)));
                            }
                            let ctr = LittleEndian::read_u16(&buf[i + 2..i + 4]);
                            if ctr_first {
                                ctr_first = false;
                            } else if ctr != ctr_last.wrapping_add(1) {
                                ctr_lost += ctr.wrapping_sub(ctr_last).wrapping_sub(1) as u32;
                            }
                            ctr_last = ctr;
                            let data = &buf[i + 4..i + 4 + len];
                            let pid = data[0];
                            trace!("RX: i = {}, len = {}, pid = {}", i, len, pid,);
                            match pid {
                                PID_RES => {
                                    // Command response
                                    trace!("xcp_receive: XCP response = {:?}", data);
                                    tx_resp.send(data.to_vec()).await?;
                                }
                                PID_ERR => {
                                    // Command error response
                                    debug!("xcp_receive: XCP errorcode = {}", XcpClientError::new(data[1]));
                                    tx_resp.send(data[0..2].to_vec()).await?;
                                }
                                PID_EV => {
                                    // Event
                                    let event_code = data[1];
                                    if event_code == EVC_TIME_SYNC {
                                        // Response to GET_DAQ_CLOCK_MULTICAST
                                        tx_resp.send(data.to_vec()).await?;
                                    } else {
                                        info!("xcp_receive: XCP event = 0x{:0X}", event_code);
                                    }
                                }
                                PID_SERV => {
                                    // Service
                                    let service_code = data[1];
                                    if service_code == SERV_TEXT {
                                        decode_serv_text.decode(&data[2..]);
                                    } else {
                                        warn!("xcp_receive: unknown service request code = 0x{:0X} ignored", service_code);
                                    }
                                }
                                _ => {
                                    // Handle DAQ data if DAQ running
                                    if let Some(c) = &task_control {
                                        if c.running {
                                            if len < 4 || data[1] != DAQ_HDR_FILL {
                                                return Err(Box::new(XcpClientError::new(ERROR_TL_HEADER)));
                                            }
                                            let odt: u8 = data[0];
                                            let daq = LittleEndian::read_u16(&data[2..4]);
                                            let mut m = decode_daq.lock().map_err(|_| XcpClientError::new(ERROR_TL_HEADER))?;
                                            if odt == 0 {
                                                if len < 8 {
                                                    return Err(Box::new(XcpClientError::new(ERROR_TL_HEADER)));
                                                }
                                                let timestamp = LittleEndian::read_u32(&data[4..8]);
                                                m.decode(ctr_lost, daq, odt, timestamp, &data[8..]);
                                            } else {
                                                m.decode(ctr_lost, daq, odt, 0, &data[4..]);
                                            }
                                            ctr_lost = 0;
                                        }
                                    }
                                }
                            } // match pid
                            i = i + len + 4;
                        } // while message in segment
                    } // while segment
                } // poll.tick
            }
        } // loop
    }

    //------------------------------------------------------------------------
    // XCP command service
    // Send a XCP command and wait for the response
    async fn send_command(&mut self, cmd_bytes: &[u8]) -> Result<Vec<u8>, Box<dyn Error>> {
        let Some(rx_cmd_resp) = self.rx_cmd_resp.as_mut() else {
            return Err(Box::new(XcpClientError::new(ERROR_NOT_CONNECTED)));
        };

        // Send command, the response is received by the receive task
        if let Err(e) = self.xcp.tl_command(cmd_bytes) {
            trace!("xcp_command: {:?}", e);
        }

        // Wait for response channel with timeout
        let res = timeout(CMD_TIMEOUT, rx_cmd_resp.recv()).await;
        match res {
            Ok(Some(data)) => {
                trace!("xcp_command: res = {:?}", data);
                match data[0] {
                    PID_RES | PID_EV => Ok(data),
                    // XCP negative response, return error code with XcpClientError
                    _ => Err(Box::new(XcpClientError::new(data[1]))),
                }
            }
            Ok(None) => {
                // Channel has been closed, the receive task terminated
                error!("xcp_command: receive_task channel closed");
                Err(Box::new(XcpClientError::new(ERROR_CMD_TIMEOUT)))
            }
            Err(_) => Err(Box::new(XcpClientError::new(ERROR_CMD_TIMEOUT))),
        }
    }

    async fn send_task_control(&mut self) -> Result<(), Box<dyn Error>> {
        if let Some(tx) = self.tx_task_control.as_ref() {
            tx.send(self.task_control).await?;
        }
        Ok(())
    }

    //------------------------------------------------------------------------
    // Connect/disconnect to server, create receive task

    pub async fn connect<D, T>(&mut self, daq_decoder: Arc<Mutex<D>>, text_decoder: T) -> Result<(), Box<dyn Error>>
    where
        T: XcpTextDecoder + Send + 'static,
        D: XcpDaqDecoder + Send + 'static,
    {
        // Spawn a task to handle incomming data
        {
            let xcp = Arc::clone(&self.xcp);
            let (tx_resp, rx_resp) = mpsc::channel(1);
            self.rx_cmd_resp = Some(rx_resp); // rx XCP command response channel
            let (tx_control, rx_control) = mpsc::channel(3);
            self.tx_task_control = Some(tx_control); // tx XCP task control channel
            tokio::spawn(async move {
                if let Err(e) = XcpClient::receive_task(xcp, tx_resp, rx_control, text_decoder, daq_decoder).await {
                    error!("receive_task: {}", e);
                }
            });
        }

        let data = self.send_command(XcpCommandBuilder::new(CC_CONNECT).add_u8(0).build()).await?;
        assert!(data.len() >= 8);
        let max_cto_size: u8 = data[3];
        let max_dto_size: u16 = LittleEndian::read_u16(&data[4..6]);
        info!("XCP client connected, max_cto_size = {}, max_dto_size = {}", max_cto_size, max_dto_size);
        self.max_cto_size = max_cto_size;
        self.max_dto_size = max_dto_size;

        self.task_control.connected = true; // the task will end, when it gets connected = false over the task control channel
        self.task_control.running = false;
        self.send_task_control().await?;

        Ok(())
    }

    //------------------------------------------------------------------------
    pub async fn disconnect(&mut self) -> Result<(), Box<dyn Error>> {
        let res = self.send_command(XcpCommandBuilder::new(CC_DISCONNECT).build()).await;

        self.task_control.connected = false;
        self.task_control.running = false;
        self.send_task_control().await?;
        self.rx_cmd_resp = None;
        self.tx_task_control = None;

        res.map(|_| ())
    }

    //------------------------------------------------------------------------
    pub fn is_connected(&self) -> bool {
        self.task_control.connected
    }

    pub fn get_max_cto_size(&self) -> u8 {
        self.max_cto_size
    }

    //------------------------------------------------------------------------
    // Get server identification
    // Returns the size of the identification and the data, if it was transferred in the response
    pub async fn get_id(&mut self, id_type: u8) -> Result<(u32, Option<Vec<u8>>), Box<dyn Error>> {
        let data = self.send_command(XcpCommandBuilder::new(CC_GET_ID).add_u8(id_type).build()).await?;
        let mode = data[1]; // 0 = data by upload, 1 = data in response
        let size = LittleEndian::read_u32(&data[4..8]);
        debug!("GET_ID type={} -> mode={} size = {}", id_type, mode, size);

        if mode == 0 {
            // Data ready for upload
            Ok((size, None))
        } else {
            // Data in response
            Ok((size, Some(data[8..(size as usize + 8)].to_vec())))
        }
    }

    /// Get server identification, transparently uploaded if it does not fit into the response
    pub async fn get_id_data(&mut self, id_type: u8) -> Result<Vec<u8>, Box<dyn Error>> {
        match self.get_id(id_type).await? {
            (_, Some(data)) => Ok(data),
            (size, None) => {
                let mut data = Vec::with_capacity(size as usize);
                let mut remaining = size;
                let max = self.max_cto_size as u32 - 1;
                while remaining > 0 {
                    let n = remaining.min(max) as u8;
                    remaining -= n as u32;
                    let resp = self.upload(n).await?;
                    data.extend_from_slice(&resp[1..=n as usize]);
                }
                Ok(data)
            }
        }
    }

    //------------------------------------------------------------------------
    // Execute a XCP command with no other parameters
    pub async fn command(&mut self, command_code: u8) -> Result<Vec<u8>, Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(command_code).build()).await
    }

    pub async fn get_status(&mut self) -> Result<u8, Box<dyn Error>> {
        let data = self.command(CC_GET_STATUS).await?;
        Ok(data[1])
    }

    //------------------------------------------------------------------------
    // Calibration segment and page control

    pub async fn get_ecu_page(&mut self, segment: u8) -> Result<u8, Box<dyn Error>> {
        let data = self
            .send_command(XcpCommandBuilder::new(CC_GET_CAL_PAGE).add_u8(CAL_PAGE_MODE_ECU).add_u8(segment).build())
            .await?;
        Ok(data[3])
    }

    pub async fn get_xcp_page(&mut self, segment: u8) -> Result<u8, Box<dyn Error>> {
        let data = self
            .send_command(XcpCommandBuilder::new(CC_GET_CAL_PAGE).add_u8(CAL_PAGE_MODE_XCP).add_u8(segment).build())
            .await?;
        Ok(data[3])
    }

    pub async fn set_ecu_page(&mut self, page: u8) -> Result<(), Box<dyn Error>> {
        let mode = CAL_PAGE_MODE_ECU | CAL_PAGE_MODE_ALL;
        self.send_command(XcpCommandBuilder::new(CC_SET_CAL_PAGE).add_u8(mode).add_u8(0).add_u8(page).build()).await?;
        Ok(())
    }

    pub async fn set_xcp_page(&mut self, page: u8) -> Result<(), Box<dyn Error>> {
        let mode = CAL_PAGE_MODE_XCP | CAL_PAGE_MODE_ALL;
        self.send_command(XcpCommandBuilder::new(CC_SET_CAL_PAGE).add_u8(mode).add_u8(0).add_u8(page).build()).await?;
        Ok(())
    }

    //------------------------------------------------------------------------
    // XCP memory access services (calibration and polling of measurement values)

    pub async fn short_download(&mut self, addr: u32, ext: u8, data_bytes: &[u8]) -> Result<(), Box<dyn Error>> {
        let len = data_bytes.len() as u8;
        trace!("short_download addr={}:{:08X},{} data={:?}", ext, addr, len, data_bytes);
        self.send_command(
            XcpCommandBuilder::new(CC_SHORT_DOWNLOAD)
                .add_u8(len)
                .add_u8(0)
                .add_u8(ext)
                .add_u32(addr)
                .add_u8_slice(data_bytes)
                .build(),
        )
        .await?;
        Ok(())
    }

    pub async fn short_upload(&mut self, addr: u32, ext: u8, size: u8) -> Result<Vec<u8>, Box<dyn Error>> {
        let data = self
            .send_command(XcpCommandBuilder::new(CC_SHORT_UPLOAD).add_u8(size).add_u8(0).add_u8(ext).add_u32(addr).build())
            .await?;
        Ok(data)
    }

    pub async fn set_mta(&mut self, addr: u32, ext: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_SET_MTA).add_u8(0).add_u8(0).add_u8(ext).add_u32(addr).build())
            .await?;
        Ok(())
    }

    pub async fn upload(&mut self, size: u8) -> Result<Vec<u8>, Box<dyn Error>> {
        let data = self.send_command(XcpCommandBuilder::new(CC_UPLOAD).add_u8(size).build()).await?;
        Ok(data)
    }

    pub async fn download(&mut self, data_bytes: &[u8]) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_DOWNLOAD).add_u8(data_bytes.len() as u8).add_u8_slice(data_bytes).build())
            .await?;
        Ok(())
    }

    pub async fn build_checksum(&mut self, size: u32) -> Result<u32, Box<dyn Error>> {
        let data = self
            .send_command(XcpCommandBuilder::new(CC_BUILD_CHECKSUM).add_u8(0).add_u8(0).add_u8(0).add_u32(size).build())
            .await?;
        Ok(LittleEndian::read_u32(&data[4..8]))
    }

    //------------------------------------------------------------------------
    // XCP clock services

    pub async fn get_daq_clock(&mut self) -> Result<u64, Box<dyn Error>> {
        let data = self.command(CC_GET_DAQ_CLOCK).await?;
        if data.len() >= 12 && data[3] == DAQ_CLOCK_PAYLOAD_FMT_SLV_64 {
            Ok(LittleEndian::read_u64(&data[4..12]))
        } else {
            Ok(LittleEndian::read_u32(&data[4..8]) as u64)
        }
    }

    pub async fn get_daq_clock_multicast(&mut self, cluster_id: u16, counter: u8) -> Result<u64, Box<dyn Error>> {
        let data = self
            .send_command(
                XcpCommandBuilder::new(CC_TRANSPORT_LAYER_CMD)
                    .add_u8(CC_TL_GET_DAQ_CLOCK_MULTICAST)
                    .add_u16(cluster_id)
                    .add_u8(counter)
                    .build(),
            )
            .await?;
        if data[3] == DAQ_CLOCK_PAYLOAD_FMT_SLV_64 {
            Ok(LittleEndian::read_u64(&data[4..12]))
        } else {
            Ok(LittleEndian::read_u32(&data[4..8]) as u64)
        }
    }

    //------------------------------------------------------------------------
    // XCP DAQ services

    pub async fn free_daq(&mut self) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_FREE_DAQ).build()).await?;
        Ok(())
    }

    pub async fn alloc_daq(&mut self, count: u16) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_ALLOC_DAQ).add_u8(0).add_u16(count).build()).await?;
        Ok(())
    }

    pub async fn alloc_odt(&mut self, daq: u16, odt: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_ALLOC_ODT).add_u8(0).add_u16(daq).add_u8(odt).build()).await?;
        Ok(())
    }

    pub async fn alloc_odt_entries(&mut self, daq: u16, odt: u8, count: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_ALLOC_ODT_ENTRY).add_u8(0).add_u16(daq).add_u8(odt).add_u8(count).build())
            .await?;
        Ok(())
    }

    pub async fn set_daq_ptr(&mut self, daq: u16, odt: u8, idx: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_SET_DAQ_PTR).add_u8(0).add_u16(daq).add_u8(odt).add_u8(idx).build()).await?;
        Ok(())
    }

    pub async fn write_daq(&mut self, ext: u8, addr: u32, len: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(
            XcpCommandBuilder::new(CC_WRITE_DAQ)
                .add_u8(0xFF) // bit offset
                .add_u8(len)
                .add_u8(ext)
                .add_u32(addr)
                .build(),
        )
        .await?;
        Ok(())
    }

    pub async fn set_daq_list_mode(&mut self, daq: u16, event: u16, prescaler: u8) -> Result<(), Box<dyn Error>> {
        let mode: u8 = DAQ_MODE_TIMESTAMP; // Timestamp always on
        let priority = 0x00;
        self.send_command(
            XcpCommandBuilder::new(CC_SET_DAQ_LIST_MODE)
                .add_u8(mode)
                .add_u16(daq)
                .add_u16(event)
                .add_u8(prescaler)
                .add_u8(priority)
                .build(),
        )
        .await?;
        Ok(())
    }

    pub async fn start_stop_daq_list(&mut self, mode: u8, daq: u16) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_START_STOP_DAQ_LIST).add_u8(mode).add_u16(daq).build()).await?;
        Ok(())
    }

    pub async fn start_stop_sync(&mut self, mode: u8) -> Result<(), Box<dyn Error>> {
        self.send_command(XcpCommandBuilder::new(CC_START_STOP_SYNCH).add_u8(mode).build()).await?;
        Ok(())
    }

    //------------------------------------------------------------------------
    // XcpCalibrationObject, XcpCalibrationObjectHandle (index pointer to XcpCalibrationObject)
    // The actual value is cached

    pub async fn create_calibration_object(&mut self, name: &str, ext: u8, addr: u32, size: u8, limits: (f64, f64)) -> Result<XcpCalibrationObjectHandle, Box<dyn Error>> {
        let mut o = XcpCalibrationObject::new(name, ext, addr, size, limits);
        let resp = self.short_upload(addr, ext, size).await?;
        o.value = resp[1..=size as usize].to_vec();
        debug!("Create calibration object {}: addr = {}:0x{:08X} size = {} value={:?}", name, ext, addr, size, o.value);
        self.calibration_objects.push(o);
        Ok(XcpCalibrationObjectHandle(self.calibration_objects.len() - 1))
    }

    pub async fn set_value_u64(&mut self, handle: XcpCalibrationObjectHandle, value: u64) -> Result<(), Box<dyn Error>> {
        let obj = &self.calibration_objects[handle.0];
        obj.check_limits(value as f64)?;
        let (ext, addr, size) = (obj.ext, obj.addr, obj.size as usize);
        let slice = &value.to_le_bytes()[0..size];
        self.short_download(addr, ext, slice).await?;
        self.calibration_objects[handle.0].set_value(slice);
        Ok(())
    }

    pub async fn set_value_i64(&mut self, handle: XcpCalibrationObjectHandle, value: i64) -> Result<(), Box<dyn Error>> {
        let obj = &self.calibration_objects[handle.0];
        obj.check_limits(value as f64)?;
        let (ext, addr, size) = (obj.ext, obj.addr, obj.size as usize);
        let slice = &value.to_le_bytes()[0..size];
        self.short_download(addr, ext, slice).await?;
        self.calibration_objects[handle.0].set_value(slice);
        Ok(())
    }

    pub async fn set_value_f64(&mut self, handle: XcpCalibrationObjectHandle, value: f64) -> Result<(), Box<dyn Error>> {
        let obj = &self.calibration_objects[handle.0];
        obj.check_limits(value)?;
        let (ext, addr) = (obj.ext, obj.addr);
        let bytes = value.to_le_bytes();
        self.short_download(addr, ext, &bytes).await?;
        self.calibration_objects[handle.0].set_value(&bytes);
        Ok(())
    }

    pub async fn read_value_u64(&mut self, handle: XcpCalibrationObjectHandle) -> Result<u64, Box<dyn Error>> {
        let obj = &self.calibration_objects[handle.0];
        let (ext, addr, size) = (obj.ext, obj.addr, obj.size);
        let resp = self.short_upload(addr, ext, size).await?;
        self.calibration_objects[handle.0].value = resp[1..=size as usize].to_vec();
        Ok(self.get_value_u64(handle))
    }

    pub fn get_value_u64(&self, handle: XcpCalibrationObjectHandle) -> u64 {
        self.calibration_objects[handle.0].get_value_u64()
    }

    pub fn get_value_i64(&self, handle: XcpCalibrationObjectHandle) -> i64 {
        self.calibration_objects[handle.0].get_value_i64()
    }

    pub fn get_value_f64(&self, handle: XcpCalibrationObjectHandle) -> f64 {
        f64::from_bits(self.calibration_objects[handle.0].get_value_u64())
    }

    //------------------------------------------------------------------------
    // XcpMeasurementObject, XcpMeasurementObjectHandle (index pointer to XcpMeasurementObject)

    pub fn create_measurement_object(&mut self, name: &str, ext: u8, addr: u32, size: u8, event: u16) -> XcpMeasurementObjectHandle {
        let o = XcpMeasurementObject::new(name, ext, addr, size, event);
        debug!("Create measurement object {}: addr = {}:0x{:08X} size = {} event = {}", name, ext, addr, size, event);
        self.measurement_objects.push(o);
        XcpMeasurementObjectHandle(self.measurement_objects.len() - 1)
    }

    pub fn get_measurement_object(&self, handle: XcpMeasurementObjectHandle) -> &XcpMeasurementObject {
        &self.measurement_objects[handle.0]
    }

    //------------------------------------------------------------------------
    // DAQ start, stop
    // One DAQ list with a single ODT per event

    pub async fn start_measurement(&mut self) -> Result<(), Box<dyn Error>> {
        // Find all events and their number of signals
        let mut event_map: HashMap<u16, u16> = HashMap::new();
        for o in &self.measurement_objects {
            *event_map.entry(o.event).or_insert(0) += 1;
        }

        // Transform to a sorted array
        let mut event_list: Vec<(u16, u16)> = event_map.into_iter().collect();
        event_list.sort_by(|a, b| a.0.cmp(&b.0));
        let daq_count: u16 = event_list.len() as u16;
        info!("event/daq count = {}", daq_count);

        // Alloc DAQ lists, ODTs and ODT entries
        self.free_daq().await?;
        self.alloc_daq(daq_count).await?;
        for daq in 0..daq_count {
            self.alloc_odt(daq, 1).await?;
        }
        for daq in 0..daq_count {
            let odt_entry_count = event_list[daq as usize].1;
            assert!(odt_entry_count < 0x7C, "odt_entry_count >= 0x7C");
            self.alloc_odt_entries(daq, 0, odt_entry_count as u8).await?;
            debug!("Alloc daq={}, odt_entry_count={}", daq, odt_entry_count);
        }

        // Write ODT entries
        for daq in 0..daq_count {
            let odt = 0;
            let event = event_list[daq as usize].0;
            let mut odt_entry: u8 = 0;
            let mut odt_size: u16 = 0;
            for i in 0..self.measurement_objects.len() {
                let o = &self.measurement_objects[i];
                if o.event != event {
                    continue;
                }
                let (ext, addr, size) = (o.ext, o.addr, o.size);
                trace!("Measurement object {} -> daq={}", o.name, daq);
                if odt_size + size as u16 > self.max_dto_size - 8 {
                    return Err(Box::new(XcpClientError::new(ERROR_ODT_SIZE)));
                }
                self.set_daq_ptr(daq, odt, odt_entry).await?;
                self.write_daq(ext, addr, size).await?;
                let o = &mut self.measurement_objects[i];
                o.daq = daq;
                o.odt = odt;
                o.offset = odt_size;
                debug!("Write daq={}, odt_entry={}, addr={}:0x{:08X}, size={}, offset={}", daq, odt_entry, ext, addr, size, odt_size);
                odt_entry += 1;
                odt_size += size as u16;
            }
        }

        // Set DAQ list events and select all DAQ lists
        for daq in 0..daq_count {
            let event = event_list[daq as usize].0;
            self.set_daq_list_mode(daq, event, 1).await?;
            self.start_stop_daq_list(DAQ_LIST_SELECT, daq).await?;
        }

        // Send running=true through the task control channel to the receive task
        self.task_control.running = true;
        self.send_task_control().await?;

        // Start DAQ
        self.start_stop_sync(DAQ_PREPARE_START_SELECTED).await?;
        self.start_stop_sync(DAQ_START_SELECTED).await?;

        Ok(())
    }

    pub async fn stop_measurement(&mut self) -> Result<(), Box<dyn Error>> {
        // Stop DAQ
        let res = self.start_stop_sync(DAQ_STOP_ALL).await;

        // Send running=false through the task control channel to the receive task
        self.task_control.running = false;
        self.send_task_control().await?;

        res
    }

    //------------------------------------------------------------------------
    // new

    pub fn new(xcp: Arc<Xcp>) -> XcpClient {
        XcpClient {
            xcp,
            max_cto_size: 0,
            max_dto_size: 0,
            rx_cmd_resp: None,
            tx_task_control: None,
            task_control: XcpTaskControl::new(),
            calibration_objects: Vec::new(),
            measurement_objects: Vec::new(),
        }
    }
}
