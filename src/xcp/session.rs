//----------------------------------------------------------------------------------------------
// Module session
// Session status and DAQ statistics, readable at any time without side effects

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use super::XcpSessionStatus;

pub(crate) struct Session {
    status: AtomicU16,
    daq_start_time: AtomicU64,
    daq_overflow_count: AtomicU32,
    timestamp_anomaly_count: AtomicU32,
}

impl Session {
    pub fn new() -> Session {
        Session {
            status: AtomicU16::new(XcpSessionStatus::SS_INITIALIZED.bits()),
            daq_start_time: AtomicU64::new(0),
            daq_overflow_count: AtomicU32::new(0),
            timestamp_anomaly_count: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn get_status(&self) -> XcpSessionStatus {
        XcpSessionStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is(&self, flags: XcpSessionStatus) -> bool {
        self.get_status().contains(flags)
    }

    pub fn set(&self, flags: XcpSessionStatus) {
        self.status.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear(&self, flags: XcpSessionStatus) {
        self.status.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Reinitialize to the state after creation
    pub fn reset(&self) {
        self.status.store(XcpSessionStatus::SS_INITIALIZED.bits(), Ordering::Release);
        self.daq_start_time.store(0, Ordering::Relaxed);
        self.daq_overflow_count.store(0, Ordering::Relaxed);
        self.timestamp_anomaly_count.store(0, Ordering::Relaxed);
    }

    pub fn get_daq_start_time(&self) -> u64 {
        self.daq_start_time.load(Ordering::Relaxed)
    }

    /// DAQ start, reset the statistics
    pub fn start_daq(&self, time: u64) {
        self.daq_start_time.store(time, Ordering::Relaxed);
        self.daq_overflow_count.store(0, Ordering::Relaxed);
        self.timestamp_anomaly_count.store(0, Ordering::Relaxed);
        self.clear(XcpSessionStatus::SS_OVERFLOW);
        self.set(XcpSessionStatus::SS_DAQ);
    }

    pub fn stop_daq(&self) {
        self.clear(XcpSessionStatus::SS_DAQ);
    }

    #[inline]
    pub fn overflow(&self) {
        self.daq_overflow_count.fetch_add(1, Ordering::Relaxed);
        if !self.is(XcpSessionStatus::SS_OVERFLOW) {
            self.set(XcpSessionStatus::SS_OVERFLOW);
        }
    }

    pub fn get_daq_overflow_count(&self) -> u32 {
        self.daq_overflow_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn timestamp_anomaly(&self) {
        self.timestamp_anomaly_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_timestamp_anomaly_count(&self) -> u32 {
        self.timestamp_anomaly_count.load(Ordering::Relaxed)
    }
}

//-------------------------------------------------------------------------------------------------
// Test module
