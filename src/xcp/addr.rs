//----------------------------------------------------------------------------------------------
// Module addr
// Address extensions, absolute addressing window and address resolution

use log::trace;
use std::ptr::NonNull;

use super::appl::XcpAppl;
use super::protocol::XcpCmdError;
use super::XcpError;

//----------------------------------------------------------------------------------------------
// Address extensions

/// Internal address extension of the A2L upload memory space
pub(crate) const XCP_ADDR_EXT_A2L: u8 = 0xFD;
/// Internal address extension of the response buffer memory space (GET_ID, event info, clock info)
pub(crate) const XCP_ADDR_EXT_PTR: u8 = 0xFE;

/// Address extensions accepted from the XCP client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XcpAddrExt {
    /// Application specific addressing, memory access by XcpAppl read_memory and write_memory
    App = 0x00,
    /// Absolute addressing, address is an offset in the memory window
    Abs = 0x01,
}

impl TryFrom<u8> for XcpAddrExt {
    type Error = XcpCmdError;

    /// Any other address extension is access denied
    fn try_from(ext: u8) -> Result<Self, Self::Error> {
        match ext {
            0x00 => Ok(XcpAddrExt::App),
            0x01 => Ok(XcpAddrExt::Abs),
            _ => Err(XcpCmdError::AccessDenied),
        }
    }
}

//----------------------------------------------------------------------------------------------
// XcpMemoryWindow

/// Memory region accessible with absolute addressing
/// An absolute address is the offset to the base of the window, the window is limited to 4 GiB
pub struct XcpMemoryWindow {
    base: NonNull<u8>,
    len: usize,
}

// @@@@ UNSAFE - Memory window shared between threads
// The window owner guarantees validity for its lifetime, concurrent access by the tool and the application is inherent to XCP
unsafe impl Send for XcpMemoryWindow {}
unsafe impl Sync for XcpMemoryWindow {}

impl XcpMemoryWindow {
    /// Maximum size of a window, addresses are 32 bit
    pub const MAX_LEN: u64 = 1 << 32;

    /// Create a window from a raw memory region
    ///
    /// # Safety
    /// base must be valid for reads and writes of len bytes as long as the window or any protocol layer using it exists
    pub unsafe fn new(base: *mut u8, len: usize) -> Result<XcpMemoryWindow, XcpError> {
        if len as u64 > XcpMemoryWindow::MAX_LEN {
            return Err(XcpError::Config("memory window exceeds 4 GiB"));
        }
        let base = NonNull::new(base).ok_or(XcpError::Config("memory window base is null"))?;
        Ok(XcpMemoryWindow { base, len })
    }

    /// Create a window on a static buffer
    pub fn from_static_mut(mem: &'static mut [u8]) -> XcpMemoryWindow {
        let len = (mem.len() as u64).min(XcpMemoryWindow::MAX_LEN) as usize;
        XcpMemoryWindow {
            base: NonNull::from(mem).cast::<u8>(),
            len,
        }
    }

    /// Empty window, every absolute access is denied
    pub fn empty() -> XcpMemoryWindow {
        XcpMemoryWindow { base: NonNull::dangling(), len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the window
    pub fn get_base_addr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Pointer to the absolute address addr, if addr..addr+size is inside the window
    #[inline]
    pub fn get_pointer(&self, addr: u32, size: usize) -> Option<*mut u8> {
        let offset = addr as usize;
        if offset.checked_add(size)? > self.len {
            return None;
        }
        // @@@@ UNSAFE - Pointer arithmetic inside the bounds checked above
        Some(unsafe { self.base.as_ptr().add(offset) })
    }

    /// Absolute address of a pointer into the window
    pub fn get_addr(&self, p: *const u8) -> Option<u32> {
        let offset = (p as usize).checked_sub(self.base.as_ptr() as usize)?;
        if offset >= self.len {
            return None;
        }
        u32::try_from(offset).ok()
    }

    /// Read dst.len() bytes from address addr
    #[inline]
    pub fn read(&self, addr: u32, dst: &mut [u8]) -> Result<(), XcpCmdError> {
        let src = self.get_pointer(addr, dst.len()).ok_or(XcpCmdError::AccessDenied)?;
        // @@@@ UNSAFE - Copy from the window, bounds are checked by get_pointer
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Write src to address addr
    pub fn write(&self, addr: u32, src: &[u8]) -> Result<(), XcpCmdError> {
        let dst = self.get_pointer(addr, src.len()).ok_or(XcpCmdError::AccessDenied)?;
        // @@@@ UNSAFE - Copy to the window, bounds are checked by get_pointer
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        }
        Ok(())
    }
}

impl std::fmt::Debug for XcpMemoryWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "XcpMemoryWindow {{ base: {:p}, len: {} }}", self.base.as_ptr(), self.len)
    }
}

//----------------------------------------------------------------------------------------------
// Address resolution

/// Read memory at (ext, addr), absolute addresses are resolved in window
#[inline]
pub(crate) fn read_memory(appl: &dyn XcpAppl, window: &XcpMemoryWindow, ext: XcpAddrExt, addr: u32, dst: &mut [u8]) -> Result<(), XcpCmdError> {
    match ext {
        XcpAddrExt::Abs => window.read(addr, dst),
        XcpAddrExt::App => appl.read_memory(addr, dst),
    }
}

/// Write memory at (ext, addr)
pub(crate) fn write_memory(appl: &dyn XcpAppl, window: &XcpMemoryWindow, ext: XcpAddrExt, addr: u32, src: &[u8]) -> Result<(), XcpCmdError> {
    trace!("write_memory: {:?}:0x{:08X}, len={}", ext, addr, src.len());
    match ext {
        XcpAddrExt::Abs => window.write(addr, src),
        XcpAddrExt::App => appl.write_memory(addr, src),
    }
}

//-------------------------------------------------------------------------------------------------
// Test module

#[cfg(test)]
mod addr_tests {
    use super::*;
    use crate::xcp::appl::XcpDefaultAppl;

    #[test]
    fn test_addr_ext() {
        assert_eq!(XcpAddrExt::try_from(0), Ok(XcpAddrExt::App));
        assert_eq!(XcpAddrExt::try_from(1), Ok(XcpAddrExt::Abs));
        for ext in 2..=255u8 {
            assert_eq!(XcpAddrExt::try_from(ext), Err(XcpCmdError::AccessDenied));
        }
    }

    #[test]
    fn test_memory_window() {
        let mem: &'static mut [u8] = Box::leak(vec![0u8; 64].into_boxed_slice());
        let window = XcpMemoryWindow::from_static_mut(mem);
        assert_eq!(window.len(), 64);

        window.write(8, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        window.read(8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        // Bounds
        assert!(window.read(60, &mut buf).is_ok());
        assert_eq!(window.read(61, &mut buf), Err(XcpCmdError::AccessDenied));
        assert_eq!(window.write(0xFFFF_FFFF, &[0]), Err(XcpCmdError::AccessDenied));
        assert!(window.get_pointer(64, 0).is_some());
        assert!(window.get_pointer(64, 1).is_none());

        // Address translation
        let p = window.get_pointer(10, 1).unwrap();
        assert_eq!(window.get_addr(p), Some(10));
        assert_eq!(window.get_addr(window.get_base_addr()), Some(0));
        assert_eq!(window.get_addr(std::ptr::null()), None);

        let empty = XcpMemoryWindow::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.read(0, &mut buf), Err(XcpCmdError::AccessDenied));
    }

    #[test]
    fn test_resolve() {
        let mem: &'static mut [u8] = Box::leak(vec![0u8; 16].into_boxed_slice());
        let window = XcpMemoryWindow::from_static_mut(mem);
        let appl = XcpDefaultAppl;
        write_memory(&appl, &window, XcpAddrExt::Abs, 0, &[0x55]).unwrap();
        let mut buf = [0u8; 1];
        read_memory(&appl, &window, XcpAddrExt::Abs, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x55);
        assert_eq!(read_memory(&appl, &window, XcpAddrExt::App, 0, &mut buf), Err(XcpCmdError::AccessDenied));
    }
}
