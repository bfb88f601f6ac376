//-----------------------------------------------------------------------------
// Module test_executor
// Runs calibration and measurement tests against a XCP protocol layer in the same process
// Shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use parking_lot::RwLock;
use tokio::time::{Duration, Instant};

use xcp_client::xcp_client::*;
use xcp_core::protocol::*;
use xcp_core::*;

pub const OPTION_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

//-----------------------------------------------------------------------------
// Logging

pub fn test_setup() {
    // Several tests may run in the same process
    let _ = env_logger::Builder::new()
        .target(env_logger::Target::Stdout)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .filter_level(OPTION_LOG_LEVEL)
        .try_init();
}

//-----------------------------------------------------------------------------
// Calibration parameters
// Two pages in the application address space (XCP_ADDR_EXT_APP), page 0 is the working page, page 1 the read only reference page

pub const CAL_PAGE_SIZE: usize = 32;

pub const CAL_RUN: u32 = 0; // u8, task loops terminate when 0
pub const CAL_COUNTER_MAX: u32 = 4; // u32
pub const CAL_CYCLE_TIME_US: u32 = 8; // u32
pub const CAL_TEST: u32 = 16; // u64, pattern (x>>32)^0x55555555 == x&0xFFFFFFFF

pub const CAL_PAGE_RAM: u8 = 0;
pub const CAL_PAGE_FLASH: u8 = 1;

const EPK: &str = "EPK_TEST";
const A2L: &str = "ASAP2_VERSION 1 71\n/begin PROJECT xcp_core_test \"\"\n/end PROJECT\n";

fn default_cal_page() -> [u8; CAL_PAGE_SIZE] {
    let mut page = [0u8; CAL_PAGE_SIZE];
    page[CAL_RUN as usize] = 1;
    page[CAL_COUNTER_MAX as usize..CAL_COUNTER_MAX as usize + 4].copy_from_slice(&255u32.to_le_bytes());
    page[CAL_CYCLE_TIME_US as usize..CAL_CYCLE_TIME_US as usize + 4].copy_from_slice(&1000u32.to_le_bytes());
    page[CAL_TEST as usize..CAL_TEST as usize + 8].copy_from_slice(&0x5555555500000000u64.to_le_bytes());
    page
}

pub struct CalPages {
    pages: [RwLock<[u8; CAL_PAGE_SIZE]>; 2],
    ecu_page: AtomicU8,
    xcp_page: AtomicU8,
}

impl CalPages {
    pub fn new() -> Arc<CalPages> {
        Arc::new(CalPages {
            pages: [RwLock::new(default_cal_page()), RwLock::new(default_cal_page())],
            ecu_page: AtomicU8::new(CAL_PAGE_RAM),
            xcp_page: AtomicU8::new(CAL_PAGE_RAM),
        })
    }

    // Read a parameter from the page active for the application
    fn read<const N: usize>(&self, offset: u32) -> [u8; N] {
        let page = self.pages[self.ecu_page.load(Ordering::Acquire) as usize].read();
        let mut value = [0u8; N];
        value.copy_from_slice(&page[offset as usize..offset as usize + N]);
        value
    }

    pub fn run(&self) -> bool {
        self.read::<1>(CAL_RUN)[0] != 0
    }

    pub fn counter_max(&self) -> u32 {
        u32::from_le_bytes(self.read::<4>(CAL_COUNTER_MAX))
    }

    pub fn cycle_time_us(&self) -> u64 {
        u32::from_le_bytes(self.read::<4>(CAL_CYCLE_TIME_US)) as u64
    }

    pub fn cal_test(&self) -> u64 {
        u64::from_le_bytes(self.read::<8>(CAL_TEST))
    }

    /// Stop all test tasks, used if the test executor failed
    pub fn stop(&self) {
        self.pages[CAL_PAGE_RAM as usize].write()[CAL_RUN as usize] = 0;
        self.ecu_page.store(CAL_PAGE_RAM, Ordering::Release);
    }
}

//-----------------------------------------------------------------------------
// Test application callbacks

pub struct TestAppl {
    cal: Arc<CalPages>,
}

impl TestAppl {
    pub fn new(cal: Arc<CalPages>) -> TestAppl {
        TestAppl { cal }
    }
}

impl XcpAppl for TestAppl {
    fn read_memory(&self, addr: u32, dst: &mut [u8]) -> Result<(), XcpCmdError> {
        let page = self.cal.pages[self.cal.xcp_page.load(Ordering::Acquire) as usize].read();
        let src = page.get(addr as usize..addr as usize + dst.len()).ok_or(XcpCmdError::AccessDenied)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_memory(&self, addr: u32, src: &[u8]) -> Result<(), XcpCmdError> {
        let xcp_page = self.cal.xcp_page.load(Ordering::Acquire);
        if xcp_page == CAL_PAGE_FLASH {
            return Err(XcpCmdError::WriteProtected);
        }
        let mut page = self.cal.pages[xcp_page as usize].write();
        let dst = page.get_mut(addr as usize..addr as usize + src.len()).ok_or(XcpCmdError::AccessDenied)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn set_cal_page(&self, _segment: u8, page: u8, mode: u8) -> Result<(), XcpCmdError> {
        if mode & CAL_PAGE_MODE_ECU != 0 {
            self.cal.ecu_page.store(page, Ordering::Release);
        }
        if mode & CAL_PAGE_MODE_XCP != 0 {
            self.cal.xcp_page.store(page, Ordering::Release);
        }
        Ok(())
    }

    fn copy_cal_page(&self, _src_segment: u8, src_page: u8, _dst_segment: u8, dst_page: u8) -> Result<(), XcpCmdError> {
        if dst_page == CAL_PAGE_FLASH {
            return Err(XcpCmdError::WriteProtected);
        }
        let src = *self.cal.pages[src_page as usize].read();
        *self.cal.pages[dst_page as usize].write() = src;
        Ok(())
    }

    fn get_id(&self, id_type: u8) -> Option<XcpIdentifier> {
        match id_type {
            IDT_ASAM_EPK => Some(XcpIdentifier::Data(EPK.as_bytes().to_vec())),
            IDT_ASAM_UPLOAD => Some(XcpIdentifier::Upload(A2L.len() as u32)),
            _ => None,
        }
    }

    fn read_a2l(&self, offset: u32, dst: &mut [u8]) -> bool {
        match A2L.as_bytes().get(offset as usize..offset as usize + dst.len()) {
            Some(src) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }
}

//-----------------------------------------------------------------------------
// Measurement signals of a test task
// Absolute addresses are offsets in this struct

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct TaskSignals {
    pub counter: u32,
    pub counter_max: u32,
    pub cal_test: u64,
    pub loop_counter: u64,
}

impl TaskSignals {
    pub const COUNTER: u32 = 0;
    pub const COUNTER_MAX: u32 = 4;
    pub const CAL_TEST: u32 = 8;
    pub const LOOP_COUNTER: u32 = 16;

    /// One cycle of a test task
    pub fn step(&mut self, cal: &CalPages) {
        self.loop_counter += 1;
        self.counter_max = cal.counter_max();
        self.counter += 1;
        if self.counter > self.counter_max {
            self.counter = 0;
        }
        self.cal_test = cal.cal_test();
    }

    /// Memory window on this signal struct, valid as long as self is not moved
    ///
    /// # Safety
    /// The window must not be used after self has been moved or dropped
    pub unsafe fn window(&mut self) -> XcpMemoryWindow {
        // @@@@ UNSAFE - Window on a struct of the caller
        unsafe { XcpMemoryWindow::new(std::ptr::from_mut(self).cast::<u8>(), std::mem::size_of::<TaskSignals>()).unwrap() }
    }
}

//------------------------------------------------------------------------
// Handle incomming SERV_TEXT data

#[derive(Debug, Clone, Copy)]
struct ServTextDecoder;

impl XcpTextDecoder for ServTextDecoder {
    fn decode(&self, data: &[u8]) {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        info!("SERV_TEXT: {}", String::from_utf8_lossy(&data[..end]));
    }
}

//------------------------------------------------------------------------
// Handle incomming DAQ data
// Check the task signals and collect statistics

const MAX_DAQ: usize = 64;

#[derive(Debug)]
pub struct DaqDecoder {
    pub tot_events: u64,
    pub tot_lost: u64,
    pub counter_errors: u32,
    pub timestamp_errors: u32,
    pub daq_events: [u64; MAX_DAQ],
    pub max_counter_max: [u32; MAX_DAQ],
    last_counter: [u32; MAX_DAQ],
    last_timestamp: [u32; MAX_DAQ],
}

impl DaqDecoder {
    pub fn new() -> DaqDecoder {
        DaqDecoder {
            tot_events: 0,
            tot_lost: 0,
            counter_errors: 0,
            timestamp_errors: 0,
            daq_events: [0; MAX_DAQ],
            max_counter_max: [0; MAX_DAQ],
            last_counter: [0; MAX_DAQ],
            last_timestamp: [0; MAX_DAQ],
        }
    }
}

impl XcpDaqDecoder for DaqDecoder {
    fn decode(&mut self, lost: u32, daq: u16, odt: u8, timestamp: u32, data: &[u8]) {
        let daq = daq as usize;
        assert!(daq < MAX_DAQ, "daq={}", daq);
        assert_eq!(odt, 0, "Only one ODT per DAQ list expected");
        assert!(data.len() >= 16, "DAQ packet too short, len={}", data.len());
        self.tot_lost += lost as u64;

        let counter = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let counter_max = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let cal_test = u64::from_le_bytes([data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15]]);
        trace!("DAQ: daq={} timestamp={} counter={} counter_max={}", daq, timestamp, counter, counter_max);

        assert!(counter <= counter_max, "counter={} counter_max={}", counter, counter_max);
        assert_eq!((cal_test >> 32) ^ 0x55555555, cal_test & 0xFFFFFFFF, "cal_test corrupted");
        if counter_max > self.max_counter_max[daq] {
            self.max_counter_max[daq] = counter_max;
        }

        if self.daq_events[daq] != 0 {
            // Each counter is incrementing, if no packet was lost
            if lost == 0 && counter != self.last_counter[daq] + 1 && counter != 0 {
                warn!("counter error: daq={} counter={} last_counter={}", daq, counter, self.last_counter[daq]);
                self.counter_errors += 1;
            }
            // 32 bit timestamps wrap around
            let dt = timestamp.wrapping_sub(self.last_timestamp[daq]);
            if dt > 0x8000_0000 {
                error!("declining timestamp: daq={} timestamp={} last={}", daq, timestamp, self.last_timestamp[daq]);
                self.timestamp_errors += 1;
            }
        }
        self.last_counter[daq] = counter;
        self.last_timestamp[daq] = timestamp;
        self.daq_events[daq] += 1;
        self.tot_events += 1;
    }
}

//-----------------------------------------------------------------------
// Execute tests

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TestMode {
    ConnectOnly,
    Cal,
    CalDaq,
}

fn expect_error_code<T: std::fmt::Debug>(res: Result<T, Box<dyn std::error::Error>>, code: u8) {
    match res {
        Ok(r) => panic!("Error 0x{:02X} expected, got {:?}", code, r),
        Err(e) => assert_eq!(get_error_code(e.as_ref()), Some(code), "unexpected error {}", e),
    }
}

/// Run the tests, events 0..task_count belong to the test tasks with TaskSignals
pub async fn test_executor(xcp: Arc<Xcp>, cal: Arc<CalPages>, test_mode: TestMode, task_count: usize, duration_ms: u64) {
    info!("Start test executor in {:?}", test_mode);

    //-------------------------------------------------------------------------------------------------------------------------------------
    // Create xcp_client and connect the XCP protocol layer
    info!("XCP CONNECT");
    let mut xcp_client = XcpClient::new(Arc::clone(&xcp));
    let daq_decoder = Arc::new(Mutex::new(DaqDecoder::new()));
    xcp_client.connect(Arc::clone(&daq_decoder), ServTextDecoder).await.unwrap();
    info!("  session status: {:?}", xcp.get_session_status());
    assert!(xcp.get_session_status().contains(XcpSessionStatus::SS_CONNECTED));
    assert_eq!(xcp_client.get_max_cto_size(), xcp.config().max_cto);

    //-------------------------------------------------------------------------------------------------------------------------------------
    // Check error responses
    info!("Check error response handling");
    expect_error_code(xcp_client.command(CC_SYNCH).await, CRC_CMD_SYNCH);
    expect_error_code(xcp_client.command(0xCF).await, CRC_CMD_UNKNOWN);
    let status = xcp_client.get_status().await.unwrap();
    assert_eq!(status & (XcpSessionStatus::SS_DAQ.bits() as u8), 0);

    // Service request text
    xcp_println!(xcp, "Hello from {}", xcp.config().name);

    //-------------------------------------------------------------------------------------------------------------------------------------
    // Identification
    let epk = xcp_client.get_id_data(IDT_ASAM_EPK).await.unwrap();
    assert_eq!(epk, EPK.as_bytes());
    let name = xcp_client.get_id_data(IDT_ASCII).await.unwrap();
    assert_eq!(name, xcp.config().name.as_bytes());
    let a2l = xcp_client.get_id_data(IDT_ASAM_UPLOAD).await.unwrap();
    assert_eq!(a2l, A2L.as_bytes());
    info!("  EPK = {}, A2L upload {} bytes", EPK, a2l.len());

    if test_mode != TestMode::ConnectOnly {
        //-------------------------------------------------------------------------------------------------------------------------------------
        // Calibration
        info!("Start calibration test");
        let counter_max = xcp_client
            .create_calibration_object("counter_max", XcpAddrExt::App as u8, CAL_COUNTER_MAX, 4, (0.0, 255.0))
            .await
            .unwrap();
        let cycle_time_us = xcp_client
            .create_calibration_object("cycle_time_us", XcpAddrExt::App as u8, CAL_CYCLE_TIME_US, 4, (0.0, 100000.0))
            .await
            .unwrap();
        let run = xcp_client.create_calibration_object("run", XcpAddrExt::App as u8, CAL_RUN, 1, (0.0, 1.0)).await.unwrap();
        assert_eq!(xcp_client.get_value_u64(run), 1);
        assert_eq!(xcp_client.get_value_u64(counter_max), 255);

        // Limit check by the client
        expect_error_code(xcp_client.set_value_u64(counter_max, 1000).await, ERROR_LIMIT);

        // Calibrate and check the application sees the new value
        xcp_client.set_value_u64(counter_max, 15).await.unwrap();
        assert_eq!(cal.counter_max(), 15);
        xcp_client.set_value_u64(cycle_time_us, 250).await.unwrap();
        assert_eq!(xcp_client.read_value_u64(cycle_time_us).await.unwrap(), 250);

        // Page switching, the reference page still holds the default values and is read only
        xcp_client.set_xcp_page(CAL_PAGE_FLASH).await.unwrap();
        assert_eq!(xcp_client.get_xcp_page(0).await.unwrap(), CAL_PAGE_FLASH);
        assert_eq!(xcp_client.get_ecu_page(0).await.unwrap(), CAL_PAGE_RAM);
        assert_eq!(xcp_client.read_value_u64(counter_max).await.unwrap(), 255);
        expect_error_code(xcp_client.set_value_u64(counter_max, 10).await, CRC_WRITE_PROTECTED);
        xcp_client.set_xcp_page(CAL_PAGE_RAM).await.unwrap();
        assert_eq!(xcp_client.read_value_u64(counter_max).await.unwrap(), 15);
        assert_eq!(xcp.get_xcp_cal_page(0), Some(CAL_PAGE_RAM));

        // Invalid page
        expect_error_code(xcp_client.set_ecu_page(2).await, CRC_PAGE_NOT_VALID);

        //-------------------------------------------------------------------------------------------------------------------------------------
        // Measurement
        if test_mode == TestMode::CalDaq {
            info!("Start data acquisition test, {} tasks", task_count);
            for event in 0..task_count as u16 {
                let abs = XcpAddrExt::Abs as u8;
                xcp_client.create_measurement_object("counter", abs, TaskSignals::COUNTER, 4, event);
                xcp_client.create_measurement_object("counter_max", abs, TaskSignals::COUNTER_MAX, 4, event);
                xcp_client.create_measurement_object("cal_test", abs, TaskSignals::CAL_TEST, 8, event);
                xcp_client.create_measurement_object("loop_counter", abs, TaskSignals::LOOP_COUNTER, 8, event);
            }
            xcp_client.start_measurement().await.unwrap();
            assert!(xcp.is_daq_running());
            let daq_start_time = xcp.get_daq_start_time();

            // DAQ configuration is refused while running
            expect_error_code(xcp_client.free_daq().await, CRC_DAQ_ACTIVE);

            // Calibrate while measuring
            let cal_test = xcp_client
                .create_calibration_object("cal_test", XcpAddrExt::App as u8, CAL_TEST, 8, (0.0, f64::MAX))
                .await
                .unwrap();
            let start = Instant::now();
            let mut i: u64 = 0;
            while start.elapsed() < Duration::from_millis(duration_ms) {
                tokio::time::sleep(Duration::from_millis(10)).await;
                i += 1;
                let v = (((i & 0xFFFFFFFF) ^ 0x55555555) << 32) | (i & 0xFFFFFFFF);
                xcp_client.set_value_u64(cal_test, v).await.unwrap();
                if i % 16 == 0 {
                    xcp_client.set_value_u64(counter_max, 15 + (i / 16) % 200).await.unwrap();
                }
            }

            // Server clock is ahead of the DAQ start
            let clock = xcp_client.get_daq_clock().await.unwrap();
            debug!("DAQ clock = {}, DAQ start = {}", clock, daq_start_time);

            xcp_client.stop_measurement().await.unwrap();
            assert!(!xcp.is_daq_running());
            tokio::time::sleep(Duration::from_millis(50)).await;

            // Check the measurement results
            let d = daq_decoder.lock().unwrap();
            info!(
                "DAQ test results: events={}, lost={}, counter_errors={}, timestamp_errors={}, overflows={}",
                d.tot_events,
                d.tot_lost,
                d.counter_errors,
                d.timestamp_errors,
                xcp.get_daq_overflow_count()
            );
            assert!(d.tot_events > 0, "No DAQ data received");
            for daq in 0..task_count {
                assert!(d.daq_events[daq] > 0, "No DAQ data received for daq {}", daq);
                assert!(d.max_counter_max[daq] >= 15);
            }
            assert_eq!(d.timestamp_errors, 0);
            if d.tot_lost == 0 {
                assert_eq!(d.counter_errors, 0);
            }
        }

        // Stop the test tasks
        xcp_client.set_value_u64(run, 0).await.unwrap();
        assert!(!cal.run());
    }

    //-------------------------------------------------------------------------------------------------------------------------------------
    // Disconnect
    info!("XCP DISCONNECT");
    xcp_client.disconnect().await.unwrap();
    assert!(!xcp.is_connected());
    assert!(!xcp.is_daq_running());
}
