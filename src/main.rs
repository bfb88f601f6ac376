// main
// xcp_core demo application
//
// Runs a XCP protocol layer with some measurement tasks and calibration parameters
// A scripted tool thread plays the part of the XCP client, a transport thread drains the transmit queue

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::{
    f64::consts::PI,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::RwLock;

//-----------------------------------------------------------------------------
// xcp_core lib

use xcp_core::protocol::*;
use xcp_core::*;

//-----------------------------------------------------------------------------
// Parameters

const APP_NAME: &str = "xcp_core_demo";

const TASK1_CYCLE_TIME_US: u32 = 10000; // 10ms
const MAINLOOP_CYCLE_TIME_MS: u64 = 100; // 100ms
const MAX_SEGMENT_SIZE: usize = 1460; // Ethernet MTU payload

//-----------------------------------------------------------------------------
// Command line arguments

const DEFAULT_LOG_LEVEL: u8 = 3; // (Off=0, Error=1, Warn=2, Info=3, Debug=4, Trace=5)
const DEFAULT_DURATION_S: u64 = 5;
const DEFAULT_QUEUE_SIZE: usize = 1024;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (Off=0, Error=1, Warn=2, Info=3, Debug=4, Trace=5)
    #[arg(short, long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: u8,

    /// Measurement duration of the scripted tool session in seconds
    #[arg(short, long, default_value_t = DEFAULT_DURATION_S)]
    duration: u64,

    /// Transmit queue size in packets
    #[arg(short, long, default_value_t = DEFAULT_QUEUE_SIZE)]
    queue_size: usize,

    /// Application name
    #[arg(short, long, default_value_t = String::from(APP_NAME))]
    name: String,

    /// Load the protocol layer configuration from a json file
    #[cfg(feature = "serde")]
    #[arg(short, long)]
    config: Option<String>,
}

//-----------------------------------------------------------------------------
// Calibration parameters
// Application addressing (XCP_ADDR_EXT_APP), the address is the offset in CalPage
// Page 0 is the working page, page 1 the read only default page

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct CalPage {
    run: u8, // Stop all tasks
    _fill: [u8; 3],
    period: f32, // Period of the sine signal in s
    ampl: f64, // Amplitude of the sine signal
    offset: f64,
}

const CAL_PAGE: CalPage = CalPage {
    run: 1,
    _fill: [0; 3],
    period: 5.0,
    ampl: 100.0,
    offset: 0.0,
};

const ADDR_AMPL: u32 = 8;

impl CalPage {
    fn as_bytes(&self) -> &[u8] {
        // @@@@ UNSAFE - CalPage is repr(C) plain old data without padding
        unsafe { std::slice::from_raw_parts(std::ptr::from_ref(self).cast::<u8>(), std::mem::size_of::<CalPage>()) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // @@@@ UNSAFE - Any byte pattern is a valid CalPage
        unsafe { std::slice::from_raw_parts_mut(std::ptr::from_mut(self).cast::<u8>(), std::mem::size_of::<CalPage>()) }
    }
}

lazy_static::lazy_static! {

    // Application start time
    static ref START_TIME: Instant = Instant::now();

    // Working page
    static ref CAL_RAM: RwLock<CalPage> = RwLock::new(CAL_PAGE);

    // Stop all tasks if false
    static ref RUN: AtomicBool = AtomicBool::new(true);
}

//-----------------------------------------------------------------------------
// Application callbacks

struct DemoAppl {
    epk: &'static str,
    ecu_page: Arc<AtomicU8>, // Shared with the application tasks
    xcp_page: AtomicU8,
}

impl DemoAppl {
    fn new(ecu_page: Arc<AtomicU8>) -> DemoAppl {
        DemoAppl {
            // Create new EPK from build info timestamp
            epk: build_info::format!("{}", $.timestamp),
            ecu_page,
            xcp_page: AtomicU8::new(0),
        }
    }
}

// Calibration parameters visible to the application tasks, depending on the ECU page
fn cal_page(appl_page: &AtomicU8) -> CalPage {
    if appl_page.load(Ordering::Relaxed) == 0 {
        *CAL_RAM.read()
    } else {
        CAL_PAGE
    }
}

impl XcpAppl for DemoAppl {
    fn on_start_daq(&self) -> bool {
        info!("DAQ start, ECU page {}", self.ecu_page.load(Ordering::Relaxed));
        true
    }

    fn read_memory(&self, addr: u32, dst: &mut [u8]) -> Result<(), XcpCmdError> {
        let page = cal_page(&self.xcp_page);
        let src = page.as_bytes().get(addr as usize..addr as usize + dst.len()).ok_or(XcpCmdError::AccessDenied)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_memory(&self, addr: u32, src: &[u8]) -> Result<(), XcpCmdError> {
        if self.xcp_page.load(Ordering::Relaxed) != 0 {
            return Err(XcpCmdError::WriteProtected);
        }
        let mut page = CAL_RAM.write();
        let dst = page.as_bytes_mut().get_mut(addr as usize..addr as usize + src.len()).ok_or(XcpCmdError::AccessDenied)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn set_cal_page(&self, _segment: u8, page: u8, mode: u8) -> Result<(), XcpCmdError> {
        if mode & CAL_PAGE_MODE_ECU != 0 {
            self.ecu_page.store(page, Ordering::Relaxed);
        }
        if mode & CAL_PAGE_MODE_XCP != 0 {
            self.xcp_page.store(page, Ordering::Relaxed);
        }
        Ok(())
    }

    fn copy_cal_page(&self, _src_segment: u8, src_page: u8, _dst_segment: u8, dst_page: u8) -> Result<(), XcpCmdError> {
        match (src_page, dst_page) {
            (1, 0) => {
                *CAL_RAM.write() = CAL_PAGE;
                Ok(())
            }
            (_, 1) => Err(XcpCmdError::WriteProtected),
            _ => Ok(()),
        }
    }

    fn get_id(&self, id_type: u8) -> Option<XcpIdentifier> {
        match id_type {
            IDT_ASAM_EPK => Some(XcpIdentifier::Data(self.epk.as_bytes().to_vec())),
            _ => None,
        }
    }
}

//-----------------------------------------------------------------------------
// Demo application cyclic tasks in threads

// Measurement signals of task1 on stack, addressed relative to the struct
#[derive(Debug, Default)]
#[repr(C)]
struct Task1Signals {
    counter: u32,
    _fill: u32,
    channel: f64,
}

fn task1(xcp: Arc<Xcp>, appl_page: Arc<AtomicU8>, event: XcpEvent) {
    info!("task1 started");
    let mut signals = Task1Signals::default();
    while RUN.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_micros(TASK1_CYCLE_TIME_US as u64));
        let cal = cal_page(&appl_page);
        if cal.run == 0 {
            break;
        }

        // Calculate a sine signal depending on the calibration parameters
        let time = START_TIME.elapsed().as_micros() as f64 * 0.000001; // s
        signals.counter = signals.counter.wrapping_add(1);
        signals.channel = cal.offset + cal.ampl * (PI * time / cal.period as f64).sin();

        // @@@@ UNSAFE - The window is used only during this trigger
        let window = unsafe { XcpMemoryWindow::new(std::ptr::from_mut(&mut signals).cast::<u8>(), std::mem::size_of::<Task1Signals>()) };
        match window {
            Ok(window) => {
                event.trigger_ext(&xcp, &window);
            }
            Err(e) => error!("task1: {}", e),
        }
    }
    info!("task1 stopped");
}

// Transport, drains the transmit queue and counts the DAQ packets
fn transport(xcp: Arc<Xcp>) {
    let mut dto_count: u64 = 0;
    let mut bytes: u64 = 0;
    while RUN.load(Ordering::Relaxed) {
        if !xcp.queue().wait_for_packets(Duration::from_millis(100)) {
            continue;
        }
        while let Some(segment) = xcp.queue().pop_segment(MAX_SEGMENT_SIZE) {
            bytes += segment.len() as u64;
            let mut i = 0;
            while i + 4 < segment.len() {
                let len = u16::from_le_bytes([segment[i], segment[i + 1]]) as usize;
                let data = &segment[i + 4..i + 4 + len];
                match data[0] {
                    PID_RES => debug!("CRM: {:?}", data),
                    PID_ERR => warn!("CRM: error 0x{:02X}", data[1]),
                    PID_EV => info!("EV: 0x{:02X}", data[1]),
                    PID_SERV => {
                        let end = data.iter().skip(2).position(|&b| b == 0).map_or(data.len(), |p| p + 2);
                        info!("SERV_TEXT: {}", String::from_utf8_lossy(&data[2..end]));
                    }
                    _ => dto_count += 1,
                }
                i += 4 + len;
            }
        }
    }
    info!("transport stopped, {} DAQ packets, {} bytes", dto_count, bytes);
}

//-----------------------------------------------------------------------------
// Scripted tool session

struct Tool {
    xcp: Arc<Xcp>,
    ctr: u16,
}

impl Tool {
    fn command(&mut self, cro: &[u8]) {
        let mut msg = Vec::with_capacity(cro.len() + 4);
        msg.extend_from_slice(&(cro.len() as u16).to_le_bytes());
        msg.extend_from_slice(&self.ctr.to_le_bytes());
        msg.extend_from_slice(cro);
        self.ctr = self.ctr.wrapping_add(1);
        if let Err(e) = self.xcp.tl_command(&msg) {
            warn!("Command 0x{:02X} failed: {:?}", cro[0], e);
        }
    }

    fn write_daq(&mut self, ext: XcpAddrExt, addr: u32, size: u8) {
        let mut cro = vec![CC_WRITE_DAQ, 0xFF, size, ext as u8];
        cro.extend_from_slice(&addr.to_le_bytes());
        self.command(&cro);
    }

    fn run(&mut self, task1: XcpEvent, mainloop: XcpEvent, duration: Duration) {
        info!("Tool session starts");
        self.command(&[CC_CONNECT, 0]);
        self.command(&[CC_GET_ID, IDT_ASAM_EPK]);

        // DAQ list 0: task1 signals, DAQ list 1: mainloop signals
        self.command(&[CC_FREE_DAQ]);
        self.command(&[CC_ALLOC_DAQ, 0, 2, 0]);
        self.command(&[CC_ALLOC_ODT, 0, 0, 0, 1]);
        self.command(&[CC_ALLOC_ODT, 0, 1, 0, 1]);
        self.command(&[CC_ALLOC_ODT_ENTRY, 0, 0, 0, 0, 2]);
        self.command(&[CC_ALLOC_ODT_ENTRY, 0, 1, 0, 0, 2]);
        self.command(&[CC_SET_DAQ_PTR, 0, 0, 0, 0, 0]);
        self.write_daq(XcpAddrExt::Abs, 0, 4); // counter
        self.write_daq(XcpAddrExt::Abs, 8, 8); // channel
        self.command(&[CC_SET_DAQ_PTR, 0, 1, 0, 0, 0]);
        self.write_daq(XcpAddrExt::Abs, 0, 8); // mainloop counter
        self.write_daq(XcpAddrExt::App, ADDR_AMPL, 8); // ampl
        for (daq, event) in [(0u16, task1), (1u16, mainloop)] {
            let mut cro = vec![CC_SET_DAQ_LIST_MODE, DAQ_MODE_TIMESTAMP];
            cro.extend_from_slice(&daq.to_le_bytes());
            cro.extend_from_slice(&event.get_id().to_le_bytes());
            cro.extend_from_slice(&[1, 0]);
            self.command(&cro);
            let d = daq.to_le_bytes();
            self.command(&[CC_START_STOP_DAQ_LIST, DAQ_LIST_SELECT, d[0], d[1]]);
        }
        self.command(&[CC_START_STOP_SYNCH, DAQ_PREPARE_START_SELECTED]);
        self.command(&[CC_START_STOP_SYNCH, DAQ_START_SELECTED]);

        // Calibrate ampl once per second
        let start = Instant::now();
        let mut ampl = CAL_PAGE.ampl;
        while start.elapsed() < duration && RUN.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs(1));
            ampl += 10.0;
            let mut cro = vec![CC_SHORT_DOWNLOAD, 8, 0, XcpAddrExt::App as u8];
            cro.extend_from_slice(&ADDR_AMPL.to_le_bytes());
            cro.extend_from_slice(&ampl.to_le_bytes());
            self.command(&cro);
        }

        self.command(&[CC_START_STOP_SYNCH, DAQ_STOP_ALL]);
        info!("Tool session ends, DAQ overflows: {}", self.xcp.get_daq_overflow_count());
        self.command(&[CC_DISCONNECT]);
    }
}

//-----------------------------------------------------------------------------
// Demo application main

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("XCP protocol layer demo");

    // Args
    let args = Args::parse();
    let log_level = XcpLogLevel::from(args.log_level);

    // Logging
    env_logger::Builder::new()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level.to_log_level_filter())
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    // Configuration
    #[cfg(feature = "serde")]
    let config = match &args.config {
        Some(path) => XcpConfig::load_json(path)?,
        None => XcpConfig::default(),
    };
    #[cfg(not(feature = "serde"))]
    let config = XcpConfig::default();
    let config = XcpConfig {
        queue_size: args.queue_size,
        capabilities: config.capabilities | XcpCapabilities::EVENT_INFO | XcpCapabilities::TIME_CORRELATION,
        ..config
    };

    // Measurement signals of the main loop in the absolute addressing window of the protocol layer
    static MAINLOOP_COUNTER: static_cell::StaticCell<u64> = static_cell::StaticCell::new();
    let mainloop_counter = MAINLOOP_COUNTER.init(0);
    // @@@@ UNSAFE - The counter is static and modified only by the main loop, which triggers its event
    let window = unsafe { XcpMemoryWindow::new(std::ptr::from_mut(&mut *mainloop_counter).cast::<u8>(), std::mem::size_of::<u64>())? };

    // Create and start the protocol layer
    let appl_page = Arc::new(AtomicU8::new(0));
    let appl = DemoAppl::new(Arc::clone(&appl_page));
    info!("EPK = {}", appl.epk);
    let xcp = Arc::new(
        XcpBuilder::new(&args.name)
            .set_config(config)
            .set_appl(Box::new(appl))
            .set_memory_window(window)
            .set_log_level(log_level)
            .build()?,
    );
    xcp.start();

    // Events
    let task1_event = xcp.create_event("task1", TASK1_CYCLE_TIME_US * 1000, XcpEventPriority::Queued, 1, std::mem::size_of::<Task1Signals>() as u32);
    let mainloop_event = xcp.create_event("mainloop", (MAINLOOP_CYCLE_TIME_MS * 1_000_000) as u32, XcpEventPriority::Pushing, 1, 8);

    // Tasks
    let t1 = thread::spawn({
        let (xcp, appl_page) = (Arc::clone(&xcp), Arc::clone(&appl_page));
        move || task1(xcp, appl_page, task1_event)
    });
    let t2 = thread::spawn({
        let xcp = Arc::clone(&xcp);
        move || transport(xcp)
    });
    let t3 = thread::spawn({
        let xcp = Arc::clone(&xcp);
        let duration = Duration::from_secs(args.duration);
        move || {
            Tool { xcp, ctr: 0 }.run(task1_event, mainloop_event, duration);
            RUN.store(false, Ordering::Relaxed);
        }
    });

    // Mainloop
    xcp_println!(xcp, "Main task starts");
    while RUN.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(MAINLOOP_CYCLE_TIME_MS));
        *mainloop_counter += 1;
        mainloop_event.trigger(&xcp);
    }
    info!("Main task finished, mainloop_counter = {}", mainloop_counter);

    // Wait for the tasks to finish
    t1.join().map_err(|_| "task1 panicked")?;
    t3.join().map_err(|_| "tool panicked")?;
    xcp.stop()?;
    t2.join().map_err(|_| "transport panicked")?;
    info!("All tasks finished");

    Ok(())
}
