//! Process priority and system sleep control during long syncs.
//!
//! Both resources are best effort: failure to acquire them is reported as
//! information, never as an error.

use crate::errors::{SyncError, SyncResult};

/// Lowers the process priority for the lifetime of the guard.
pub struct BackgroundPriority;

#[cfg(unix)]
extern "C" {
    fn nice(incr: std::os::raw::c_int) -> std::os::raw::c_int;
}

impl BackgroundPriority {
    #[cfg(unix)]
    pub fn new() -> SyncResult<Self> {
        // lowering priority cannot be undone without privileges; the guard
        // lives until the process exits anyway
        let rc = unsafe { nice(10) };
        if rc == -1 {
            return Err(SyncError::Other(
                "Cannot lower the process priority".to_string(),
            ));
        }
        Ok(BackgroundPriority)
    }

    #[cfg(not(unix))]
    pub fn new() -> SyncResult<Self> {
        Err(SyncError::Other(
            "Background priority is not supported on this platform".to_string(),
        ))
    }
}

/// Prevents the system from sleeping while a sync is running.
pub struct PreventStandby {
    #[cfg(target_os = "macos")]
    assertion_id: u32,
}

#[cfg(target_os = "macos")]
mod iokit {
    pub type IoReturn = i32;
    pub const K_IO_RETURN_SUCCESS: IoReturn = 0;
    pub const K_IOPM_ASSERTION_LEVEL_ON: u32 = 255;

    #[link(name = "IOKit", kind = "framework")]
    extern "C" {
        pub fn IOPMAssertionCreateWithName(
            assertion_type: *const std::ffi::c_void,
            assertion_level: u32,
            assertion_name: *const std::ffi::c_void,
            assertion_id: *mut u32,
        ) -> IoReturn;
        pub fn IOPMAssertionRelease(assertion_id: u32) -> IoReturn;
    }

    #[link(name = "CoreFoundation", kind = "framework")]
    extern "C" {
        pub fn CFStringCreateWithCString(
            allocator: *const std::ffi::c_void,
            c_str: *const std::os::raw::c_char,
            encoding: u32,
        ) -> *const std::ffi::c_void;
        pub fn CFRelease(cf: *const std::ffi::c_void);
    }

    pub const K_CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;
}

impl PreventStandby {
    #[cfg(target_os = "macos")]
    pub fn new() -> SyncResult<Self> {
        use std::ffi::CString;

        let assertion_type = CString::new("PreventUserIdleSystemSleep")
            .map_err(|e| SyncError::Other(e.to_string()))?;
        let assertion_name =
            CString::new("File synchronization in progress").map_err(|e| SyncError::Other(e.to_string()))?;
        unsafe {
            let cf_type = iokit::CFStringCreateWithCString(
                std::ptr::null(),
                assertion_type.as_ptr(),
                iokit::K_CF_STRING_ENCODING_UTF8,
            );
            let cf_name = iokit::CFStringCreateWithCString(
                std::ptr::null(),
                assertion_name.as_ptr(),
                iokit::K_CF_STRING_ENCODING_UTF8,
            );
            let mut assertion_id: u32 = 0;
            let rc = iokit::IOPMAssertionCreateWithName(
                cf_type,
                iokit::K_IOPM_ASSERTION_LEVEL_ON,
                cf_name,
                &mut assertion_id,
            );
            iokit::CFRelease(cf_type);
            iokit::CFRelease(cf_name);
            if rc != iokit::K_IO_RETURN_SUCCESS {
                return Err(SyncError::Other(format!(
                    "Cannot create power assertion: {}",
                    rc
                )));
            }
            Ok(PreventStandby { assertion_id })
        }
    }

    #[cfg(not(target_os = "macos"))]
    pub fn new() -> SyncResult<Self> {
        Err(SyncError::Other(
            "Standby prevention is not supported on this platform".to_string(),
        ))
    }
}

#[cfg(target_os = "macos")]
impl Drop for PreventStandby {
    fn drop(&mut self) {
        unsafe {
            let _ = iokit::IOPMAssertionRelease(self.assertion_id);
        }
    }
}
