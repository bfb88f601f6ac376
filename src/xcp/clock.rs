//----------------------------------------------------------------------------------------------
// Module clock
// DAQ clock, synchronization state and grandmaster information

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use super::config::XcpTimestampUnit;
use super::XcpError;

//----------------------------------------------------------------------------------------------
// Clock state and grandmaster information

/// Stratum level unknown
pub const XCP_STRATUM_LEVEL_UNKNOWN: u8 = 255;
/// Stratum level of an arbitrary, unsynchronized clock
pub const XCP_STRATUM_LEVEL_ARB: u8 = 16;
/// Stratum level of a clock synchronized to UTC
pub const XCP_STRATUM_LEVEL_UTC: u8 = 0;

/// Synchronization state of the DAQ clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XcpClockState {
    SynchInProgress = 0,
    Synch = 1,
    FreeRunning = 7,
    GrandmasterSynch = 1 << 3,
}

impl XcpClockState {
    // Degree of synchronization, used to validate state transitions
    fn rank(self) -> u8 {
        match self {
            XcpClockState::FreeRunning => 0,
            XcpClockState::SynchInProgress => 1,
            XcpClockState::Synch => 2,
            XcpClockState::GrandmasterSynch => 3,
        }
    }
}

impl From<u8> for XcpClockState {
    fn from(value: u8) -> Self {
        match value {
            0 => XcpClockState::SynchInProgress,
            1 => XcpClockState::Synch,
            8 => XcpClockState::GrandmasterSynch,
            _ => XcpClockState::FreeRunning,
        }
    }
}

/// Epoch of the grandmaster clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XcpClockEpoch {
    Tai = 0,
    Utc = 1,
    Arbitrary = 2,
}

/// Grandmaster clock identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XcpGrandmasterInfo {
    pub uuid: [u8; 8],
    pub epoch: XcpClockEpoch,
    pub stratum: u8,
}

//----------------------------------------------------------------------------------------------
// Clock source

/// Clock source for DAQ timestamps
/// Must be callable from any context which triggers events
pub trait XcpClock: Send + Sync {
    /// Current 64 bit clock value in ticks
    fn get_clock64(&self) -> u64;

    /// Clock resolution
    fn ticks_per_second(&self) -> u64 {
        1_000_000_000
    }

    /// Grandmaster clock identity, None if there is no grandmaster
    fn get_grandmaster_info(&self) -> Option<XcpGrandmasterInfo> {
        None
    }
}

// Start of the system clock
static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic system clock with arbitrary epoch (application start)
#[derive(Debug, Clone, Copy)]
pub struct XcpSystemClock {
    unit: XcpTimestampUnit,
}

impl XcpSystemClock {
    pub fn new(unit: XcpTimestampUnit) -> XcpSystemClock {
        Lazy::force(&CLOCK_EPOCH);
        XcpSystemClock { unit }
    }
}

impl XcpClock for XcpSystemClock {
    fn get_clock64(&self) -> u64 {
        let ns = CLOCK_EPOCH.elapsed().as_nanos() as u64;
        ns / self.unit.ns_per_tick()
    }

    fn ticks_per_second(&self) -> u64 {
        1_000_000_000 / self.unit.ns_per_tick()
    }
}

//----------------------------------------------------------------------------------------------
// Clock subsystem

/// DAQ clock of the protocol layer
/// Guarantees monotonic timestamps and validates synchronization state transitions
pub struct ClockSubsystem {
    source: Box<dyn XcpClock>,
    unit: XcpTimestampUnit,
    last: AtomicU64,
    state: AtomicU8,
    cluster_id: AtomicU16,
}

impl ClockSubsystem {
    pub fn new(source: Box<dyn XcpClock>, unit: XcpTimestampUnit, cluster_id: u16) -> ClockSubsystem {
        ClockSubsystem {
            source,
            unit,
            last: AtomicU64::new(0),
            state: AtomicU8::new(XcpClockState::FreeRunning as u8),
            cluster_id: AtomicU16::new(cluster_id),
        }
    }

    /// Current clock value, never less than any value returned before
    #[inline]
    pub fn get_clock64(&self) -> u64 {
        let t = self.source.get_clock64();
        let last = self.last.fetch_max(t, Ordering::Relaxed);
        t.max(last)
    }

    pub fn get_unit(&self) -> XcpTimestampUnit {
        self.unit
    }

    pub fn ticks_per_second(&self) -> u64 {
        self.source.ticks_per_second()
    }

    pub fn get_state(&self) -> XcpClockState {
        XcpClockState::from(self.state.load(Ordering::Acquire))
    }

    /// Change the synchronization state
    /// The state may only move towards a more synchronized state or restart synchronization
    /// A failed synchronization attempt may fall back to free running
    /// Losing synchronization requires lose_sync
    pub fn set_state(&self, state: XcpClockState) -> Result<(), XcpError> {
        let current = self.get_state();
        let allowed = state == XcpClockState::SynchInProgress
            || state.rank() >= current.rank()
            || (current == XcpClockState::SynchInProgress && state == XcpClockState::FreeRunning);
        if !allowed {
            warn!("Clock state transition {:?} -> {:?} refused", current, state);
            return Err(XcpError::ClockState);
        }
        if state != current {
            info!("Clock state {:?} -> {:?}", current, state);
        }
        self.state.store(state as u8, Ordering::Release);
        Ok(())
    }

    /// Clock synchronization lost, move to free running
    pub fn lose_sync(&self) {
        let current = self.get_state();
        warn!("Clock synchronization lost, {:?} -> FreeRunning", current);
        self.state.store(XcpClockState::FreeRunning as u8, Ordering::Release);
    }

    pub fn is_synch_in_progress(&self) -> bool {
        self.get_state() == XcpClockState::SynchInProgress
    }

    pub fn get_cluster_id(&self) -> u16 {
        self.cluster_id.load(Ordering::Relaxed)
    }

    pub fn set_cluster_id(&self, cluster_id: u16) {
        debug!("Set cluster id {}", cluster_id);
        self.cluster_id.store(cluster_id, Ordering::Relaxed);
    }

    pub fn get_grandmaster_info(&self) -> Option<XcpGrandmasterInfo> {
        self.source.get_grandmaster_info()
    }

    /// Clock information for upload after TIME_CORRELATION_PROPERTIES
    /// 24 bytes slave clock info, followed by 24 bytes grandmaster clock info if available
    pub fn get_clock_info(&self, uuid: [u8; 8], with_grandmaster: bool) -> Vec<u8> {
        let mut info = Vec::with_capacity(48);
        let (unit, ticks) = match self.unit {
            XcpTimestampUnit::Ns1 => (0u8, 1u16),
            XcpTimestampUnit::Us1 => (3u8, 1u16),
        };

        // Slave clock
        let gm = if with_grandmaster { self.get_grandmaster_info() } else { None };
        let stratum = gm.map_or(XCP_STRATUM_LEVEL_ARB, |gm| gm.stratum);
        info.extend_from_slice(&uuid);
        info.extend_from_slice(&ticks.to_le_bytes());
        info.push(unit);
        info.push(stratum);
        info.push(8); // native timestamp size
        info.extend_from_slice(&[0u8; 3]);
        info.extend_from_slice(&u64::MAX.to_le_bytes()); // value before wrap around

        // Grandmaster clock
        if let Some(gm) = gm {
            info.extend_from_slice(&gm.uuid);
            info.extend_from_slice(&ticks.to_le_bytes());
            info.push(unit);
            info.push(gm.stratum);
            info.push(8);
            info.push(gm.epoch as u8);
            info.extend_from_slice(&[0u8; 2]);
            info.extend_from_slice(&u64::MAX.to_le_bytes());
        }
        info
    }
}

//-------------------------------------------------------------------------------------------------
// Test module

#[cfg(test)]
mod clock_tests {
    use super::*;

    // Clock source which can be set backwards
    struct TestClock(AtomicU64);

    impl XcpClock for TestClock {
        fn get_clock64(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
        fn get_grandmaster_info(&self) -> Option<XcpGrandmasterInfo> {
            Some(XcpGrandmasterInfo {
                uuid: [1, 2, 3, 4, 5, 6, 7, 8],
                epoch: XcpClockEpoch::Tai,
                stratum: XCP_STRATUM_LEVEL_UTC,
            })
        }
    }

    #[test]
    fn test_monotonic_clock() {
        let source = TestClock(AtomicU64::new(1000));
        let clock = ClockSubsystem::new(Box::new(source), XcpTimestampUnit::Ns1, 1);
        assert_eq!(clock.get_clock64(), 1000);
        let t = clock.get_clock64();
        assert!(t >= 1000);

        let clock2 = ClockSubsystem::new(Box::new(XcpSystemClock::new(XcpTimestampUnit::Us1)), XcpTimestampUnit::Us1, 1);
        let t1 = clock2.get_clock64();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t2 = clock2.get_clock64();
        assert!(t2 > t1);
        assert_eq!(clock2.ticks_per_second(), 1_000_000);
    }

    #[test]
    fn test_clock_backwards() {
        struct Shared(std::sync::Arc<AtomicU64>);
        impl XcpClock for Shared {
            fn get_clock64(&self) -> u64 {
                self.0.load(Ordering::Relaxed)
            }
        }
        let t = std::sync::Arc::new(AtomicU64::new(5000));
        let clock = ClockSubsystem::new(Box::new(Shared(t.clone())), XcpTimestampUnit::Ns1, 1);
        assert_eq!(clock.get_clock64(), 5000);
        t.store(4000, Ordering::Relaxed);
        assert_eq!(clock.get_clock64(), 5000);
        t.store(6000, Ordering::Relaxed);
        assert_eq!(clock.get_clock64(), 6000);
    }

    #[test]
    fn test_clock_state_transitions() {
        let clock = ClockSubsystem::new(Box::new(XcpSystemClock::new(XcpTimestampUnit::Ns1)), XcpTimestampUnit::Ns1, 1);
        assert_eq!(clock.get_state(), XcpClockState::FreeRunning);

        // Towards synchronization
        clock.set_state(XcpClockState::SynchInProgress).unwrap();
        assert!(clock.is_synch_in_progress());
        clock.set_state(XcpClockState::Synch).unwrap();
        clock.set_state(XcpClockState::GrandmasterSynch).unwrap();

        // No silent regression
        assert!(clock.set_state(XcpClockState::FreeRunning).is_err());
        assert!(clock.set_state(XcpClockState::Synch).is_err());
        assert_eq!(clock.get_state(), XcpClockState::GrandmasterSynch);

        // Resynchronization
        clock.set_state(XcpClockState::SynchInProgress).unwrap();
        // Failed synchronization attempt
        clock.set_state(XcpClockState::FreeRunning).unwrap();

        // Explicit loss of synchronization
        clock.set_state(XcpClockState::Synch).unwrap();
        clock.lose_sync();
        assert_eq!(clock.get_state(), XcpClockState::FreeRunning);
    }

    #[test]
    fn test_clock_info() {
        let clock = ClockSubsystem::new(Box::new(TestClock(AtomicU64::new(0))), XcpTimestampUnit::Ns1, 7);
        assert_eq!(clock.get_cluster_id(), 7);
        clock.set_cluster_id(9);
        assert_eq!(clock.get_cluster_id(), 9);

        let info = clock.get_clock_info([0; 8], false);
        assert_eq!(info.len(), 24);
        assert_eq!(info[11], XCP_STRATUM_LEVEL_ARB);
        let info = clock.get_clock_info([0; 8], true);
        assert_eq!(info.len(), 48);
        assert_eq!(&info[24..32], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(info[11], XCP_STRATUM_LEVEL_UTC);
        assert_eq!(info[24 + 13], XcpClockEpoch::Tai as u8);
    }
}
