//-----------------------------------------------------------------------------
// Crate xcp_core
// Path: src/lib.rs

//
// Use cargo test --features=serde -- --nocapture

// This crate is a library
#![crate_type = "lib"]
// The library crate is named "xcp_core"
#![crate_name = "xcp_core"]
//
//
// Disabled clippy lints
#![allow(dead_code)]
//
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::if_not_else)]
#![allow(clippy::wildcard_imports)]
#![allow(clippy::cast_lossless)]
//
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::trivially_copy_pass_by_ref)]
//
#![cfg(not(doctest))]
/*
//! XCP protocol layer
//! The 'xcp_core' crate provides the session state machine, command processor, DAQ event engine,
//! calibration page handling and clock bookkeeping of an XCP slave.
//! Network transport is not part of this crate, it ends at the transmit queue.
//!
//! ## Example
//!
//! ```
//!
//! use xcp_core::*;
//!
//! static mut SIGNALS: [u8; 1024] = [0; 1024];
//!
//! // Create the protocol layer, measurement variables live in an absolute addressing window
//! let window = XcpMemoryWindow::from_static_mut(unsafe { &mut *std::ptr::addr_of_mut!(SIGNALS) });
//! let xcp = XcpBuilder::new("hello_xcp").set_memory_window(window).build()?;
//! xcp.start();
//!
//! // Create an event
//! let event = xcp.create_event("task1", 10_000_000, XcpEventPriority::Queued, 1, 0);
//!
//! loop {
//!     // Trigger event "task1" for data acquisition
//!     event.trigger(&xcp);
//!
//!     // Hand packets to the transport
//!     while let Some(segment) = xcp.queue().pop_segment(1460) { /* send */ }
//! }
//!
//! ```
*/
//-----------------------------------------------------------------------------

// Submodule xcp
mod xcp;
pub use xcp::addr::XcpAddrExt;
pub use xcp::addr::XcpMemoryWindow;
pub use xcp::appl::XcpAppl;
pub use xcp::appl::XcpDefaultAppl;
pub use xcp::appl::XcpIdentifier;
pub use xcp::clock::ClockSubsystem;
pub use xcp::clock::XcpClock;
pub use xcp::clock::XcpClockEpoch;
pub use xcp::clock::XcpClockState;
pub use xcp::clock::XcpGrandmasterInfo;
pub use xcp::clock::XcpSystemClock;
pub use xcp::config::XcpCapabilities;
pub use xcp::config::XcpConfig;
pub use xcp::config::XcpTimestampUnit;
pub use xcp::event::XcpEventInfo;
pub use xcp::event::XcpEventPriority;
pub use xcp::protocol;
pub use xcp::protocol::XcpCmdError;
pub use xcp::queue::XcpTlQueue;
pub use xcp::Xcp;
pub use xcp::XcpBuilder;
pub use xcp::XcpError;
pub use xcp::XcpLogLevel;
pub use xcp::XcpEvent;
pub use xcp::XcpSessionStatus;

//-----------------------------------------------------------------------------
// XCP println macro

/// Print formated text to the XCP client tool console
#[allow(unused_macros)]
#[macro_export]
macro_rules! xcp_println {
    ( $xcp:expr, $fmt:expr ) => {
        $xcp.print(&format!($fmt));
    };
    ( $xcp:expr, $fmt:expr, $( $arg:expr ),* ) => {
        $xcp.print(&format!($fmt, $( $arg ),*));
    };
}
