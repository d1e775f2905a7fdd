//! Windows implementation of the activity probe.
//!
//! Uses the foreground window's owning process for the application name and
//! `GetLastInputInfo` for idle time. Both are plain Win32 calls, so no
//! helper processes are involved.

use crate::collector::types::Backend;
use crate::collector::{CollectorError, ForegroundProbe};
use std::path::Path;
use std::time::Duration;
use windows::core::PWSTR;
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::System::SystemInformation::GetTickCount;
use windows::Win32::System::Threading::{
    OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
    PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows::Win32::UI::Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO};
use windows::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

/// The Windows activity probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsProbe;

impl WindowsProbe {
    pub fn new() -> Self {
        Self
    }
}

impl ForegroundProbe for WindowsProbe {
    fn backend(&self) -> Backend {
        Backend::Windows
    }

    fn query_application(&self) -> Result<String, CollectorError> {
        let mut pid = 0u32;
        unsafe {
            let hwnd = GetForegroundWindow();
            if hwnd.0.is_null() {
                return Err(CollectorError::Os("no foreground window".to_string()));
            }
            GetWindowThreadProcessId(hwnd, Some(&mut pid));
        }
        if pid == 0 {
            return Err(CollectorError::Os("foreground window has no process".to_string()));
        }

        let mut buf = [0u16; 1024];
        let mut len = buf.len() as u32;
        unsafe {
            let process = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid)
                .map_err(|e| CollectorError::Os(e.to_string()))?;
            let result = QueryFullProcessImageNameW(
                process,
                PROCESS_NAME_WIN32,
                PWSTR(buf.as_mut_ptr()),
                &mut len,
            );
            let _ = CloseHandle(process);
            result.map_err(|e| CollectorError::Os(e.to_string()))?;
        }

        let path = String::from_utf16_lossy(&buf[..len as usize]);
        executable_stem(&path)
    }

    fn query_idle(&self) -> Result<Duration, CollectorError> {
        let mut info = LASTINPUTINFO {
            cbSize: std::mem::size_of::<LASTINPUTINFO>() as u32,
            dwTime: 0,
        };
        let now = unsafe {
            if !GetLastInputInfo(&mut info).as_bool() {
                return Err(CollectorError::Os("GetLastInputInfo failed".to_string()));
            }
            GetTickCount()
        };
        // Both counters wrap after ~49.7 days; wrapping_sub keeps the delta right.
        Ok(Duration::from_millis(u64::from(now.wrapping_sub(info.dwTime))))
    }
}

/// `C:\Program Files\Mozilla Firefox\firefox.exe` → `firefox`
fn executable_stem(path: &str) -> Result<String, CollectorError> {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| CollectorError::Parse(format!("no executable name in {path:?}")))
}
