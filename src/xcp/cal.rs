//----------------------------------------------------------------------------------------------
// Module cal
// Calibration page state of the memory segments

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use super::appl::XcpAppl;
use super::config::{XcpCapabilities, XcpConfig};
use super::protocol::*;

//----------------------------------------------------------------------------------------------
// CalSegment

// Active pages of a calibration segment
// The ECU page is the page the application runs on, the XCP page is the page the tool accesses
struct CalSegment {
    ecu_page: AtomicU8,
    xcp_page: AtomicU8,
    freeze: AtomicBool,
}

impl CalSegment {
    fn new() -> CalSegment {
        CalSegment {
            ecu_page: AtomicU8::new(0),
            xcp_page: AtomicU8::new(0),
            freeze: AtomicBool::new(false),
        }
    }
}

//----------------------------------------------------------------------------------------------
// CalPageManager

/// Calibration page manager
/// Mutated only by the command processor, the page state may be read from any context
pub struct CalPageManager {
    segments: Vec<CalSegment>,
    page_count: u8,
    enabled: bool,
    copy_enabled: bool,
    freeze_enabled: bool,
}

impl CalPageManager {
    pub fn new(config: &XcpConfig) -> CalPageManager {
        CalPageManager {
            segments: (0..config.cal_segments).map(|_| CalSegment::new()).collect(),
            page_count: config.cal_pages,
            enabled: config.capabilities.contains(XcpCapabilities::CAL_PAGE),
            copy_enabled: config.capabilities.contains(XcpCapabilities::COPY_CAL_PAGE),
            freeze_enabled: config.capabilities.contains(XcpCapabilities::FREEZE_CAL_PAGE),
        }
    }

    /// Number of segments
    pub fn get_segment_count(&self) -> u8 {
        self.segments.len() as u8
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_freeze_enabled(&self) -> bool {
        self.enabled && self.freeze_enabled
    }

    /// Reset all segments to page 0
    pub fn reset(&self) {
        for s in &self.segments {
            s.ecu_page.store(0, Ordering::Relaxed);
            s.xcp_page.store(0, Ordering::Relaxed);
            s.freeze.store(false, Ordering::Relaxed);
        }
    }

    fn check_segment(&self, segment: u8) -> Result<&CalSegment, XcpCmdError> {
        self.segments.get(segment as usize).ok_or(XcpCmdError::SegmentNotValid)
    }

    fn check_page(&self, page: u8) -> Result<(), XcpCmdError> {
        if page >= self.page_count {
            return Err(XcpCmdError::PageNotValid);
        }
        Ok(())
    }

    /// Set the active page of a segment for the ECU view, the XCP view or both
    /// CAL_PAGE_MODE_ALL applies the switch to all segments
    /// The application is notified and may refuse the switch, the state is only changed if it accepts
    pub fn set_cal_page(&self, appl: &dyn XcpAppl, segment: u8, page: u8, mode: u8) -> Result<(), XcpCmdError> {
        if !self.enabled {
            return Err(XcpCmdError::CmdUnknown);
        }
        if mode & (CAL_PAGE_MODE_ECU | CAL_PAGE_MODE_XCP) == 0 {
            return Err(XcpCmdError::PageModeNotValid);
        }
        self.check_page(page)?;
        let all = (mode & CAL_PAGE_MODE_ALL) != 0;
        if !all {
            self.check_segment(segment)?;
        }

        appl.set_cal_page(segment, page, mode)?;

        debug!("Set cal page: segment={}, page={}, mode={:02X}", segment, page, mode);
        for (i, s) in self.segments.iter().enumerate() {
            if all || i == segment as usize {
                if (mode & CAL_PAGE_MODE_ECU) != 0 {
                    s.ecu_page.store(page, Ordering::Release);
                }
                if (mode & CAL_PAGE_MODE_XCP) != 0 {
                    s.xcp_page.store(page, Ordering::Release);
                }
            }
        }
        Ok(())
    }

    /// Get the active page of a segment for the ECU view or the XCP view
    pub fn get_cal_page(&self, segment: u8, mode: u8) -> Result<u8, XcpCmdError> {
        if !self.enabled {
            return Err(XcpCmdError::CmdUnknown);
        }
        let s = self.check_segment(segment)?;
        match mode & (CAL_PAGE_MODE_ECU | CAL_PAGE_MODE_XCP) {
            CAL_PAGE_MODE_ECU => Ok(s.ecu_page.load(Ordering::Acquire)),
            CAL_PAGE_MODE_XCP => Ok(s.xcp_page.load(Ordering::Acquire)),
            _ => Err(XcpCmdError::PageModeNotValid),
        }
    }

    /// Copy a calibration page, the copy itself is done by the application
    pub fn copy_cal_page(&self, appl: &dyn XcpAppl, src_segment: u8, src_page: u8, dst_segment: u8, dst_page: u8) -> Result<(), XcpCmdError> {
        if !self.enabled || !self.copy_enabled {
            return Err(XcpCmdError::CmdUnknown);
        }
        self.check_segment(src_segment)?;
        self.check_segment(dst_segment)?;
        self.check_page(src_page)?;
        self.check_page(dst_page)?;
        if src_segment == dst_segment && src_page == dst_page {
            return Err(XcpCmdError::PageNotValid);
        }
        info!("Copy cal page: {}:{} -> {}:{}", src_segment, src_page, dst_segment, dst_page);
        appl.copy_cal_page(src_segment, src_page, dst_segment, dst_page)
    }

    /// Persist the active page of a segment as new default
    pub fn freeze_cal_page(&self, appl: &dyn XcpAppl, segment: u8) -> Result<(), XcpCmdError> {
        if !self.is_freeze_enabled() {
            return Err(XcpCmdError::CmdUnknown);
        }
        self.check_segment(segment)?;
        info!("Freeze cal page: segment={}", segment);
        appl.freeze_cal_page(segment)
    }

    /// Set the segment mode, SEGMENT_FLAG_FREEZE selects the segment for freeze on STORE_CAL_REQ
    pub fn set_segment_mode(&self, segment: u8, mode: u8) -> Result<(), XcpCmdError> {
        if !self.is_freeze_enabled() {
            return Err(XcpCmdError::CmdUnknown);
        }
        let s = self.check_segment(segment)?;
        if mode & !SEGMENT_FLAG_FREEZE != 0 {
            return Err(XcpCmdError::OutOfRange);
        }
        s.freeze.store((mode & SEGMENT_FLAG_FREEZE) != 0, Ordering::Relaxed);
        Ok(())
    }

    pub fn get_segment_mode(&self, segment: u8) -> Result<u8, XcpCmdError> {
        if !self.is_freeze_enabled() {
            return Err(XcpCmdError::CmdUnknown);
        }
        let s = self.check_segment(segment)?;
        Ok(if s.freeze.load(Ordering::Relaxed) { SEGMENT_FLAG_FREEZE } else { 0 })
    }

    /// Freeze all segments selected with SET_SEGMENT_MODE
    pub fn freeze_selected(&self, appl: &dyn XcpAppl) -> Result<(), XcpCmdError> {
        if !self.is_freeze_enabled() {
            return Err(XcpCmdError::CmdUnknown);
        }
        for (i, s) in self.segments.iter().enumerate() {
            if s.freeze.load(Ordering::Relaxed) {
                if let Err(e) = self.freeze_cal_page(appl, i as u8) {
                    warn!("Freeze of segment {} failed: {}", i, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

//-------------------------------------------------------------------------------------------------
// Test module
