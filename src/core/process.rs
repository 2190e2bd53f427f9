/// Windows process control and debug-event plumbing: attaching/launching a
/// target, pumping `WaitForDebugEvent`, suspending threads to read their
/// context, and walking a stack with `StackWalk64`. The sampler owns the
/// event loop; this module only wraps the raw OS calls it needs.
use thiserror::Error;

use crate::core::types::PointerSize;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to enable debug privilege: {0}")]
    EnableDebugPrivilege(String),
    #[error("failed to launch process: {0}")]
    Launch(String),
    #[error("failed to attach to process {pid}: {message}")]
    Attach { pid: u32, message: String },
    #[error("debug event wait failed: {0}")]
    Wait(String),
    #[error("not supported on this platform")]
    Unsupported,
}

/// A decoded debug event plus the process/thread id it was raised on.
/// `ContinueDebugEvent` needs the exact pair back regardless of which kind
/// of event this was, so it travels alongside every variant rather than
/// being duplicated into each one.
#[derive(Debug, Clone)]
pub struct DebugEventRecord {
    pub pid: u32,
    pub tid: u32,
    pub kind: DebugEvent,
}

/// One decoded `DEBUG_EVENT`. Carries only the fields the sampler and
/// command router actually consume; everything else in the OS struct's
/// union is dropped at decode time.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    CreateProcess {
        pid: u32,
        tid: u32,
        process_handle: usize,
        thread_handle: usize,
        image_base: u64,
        image_file_handle: Option<usize>,
        image_name_pointer: Option<u64>,
        image_name_is_unicode: bool,
    },
    CreateThread {
        tid: u32,
        thread_handle: usize,
        start_address: u64,
    },
    ExitThread {
        tid: u32,
        exit_code: u32,
    },
    ExitProcess {
        exit_code: u32,
    },
    LoadDll {
        base: u64,
        file_handle: Option<usize>,
        name_pointer: Option<u64>,
        name_is_unicode: bool,
    },
    UnloadDll {
        base: u64,
    },
    Exception {
        first_chance: bool,
    },
    OutputDebugString,
    Rip,
}

/// What the caller must pass back to `ContinueDebugEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueStatus {
    Handled,
    NotHandled,
}

/// One validated stack frame: the instruction pointer and the stack
/// pointer it was captured at (used only to detect runaway walks; it is
/// not reported on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    pub pc: u64,
    pub sp: u64,
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;
    use std::ptr;

    use winapi::shared::minwindef::{DWORD, FALSE, MAX_PATH, TRUE};
    use winapi::shared::winerror::{ERROR_SEM_TIMEOUT, WAIT_TIMEOUT};
    use winapi::um::debugapi::{
        ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, DebugSetProcessKillOnExit,
        WaitForDebugEvent,
    };
    use winapi::um::dbghelp::{StackWalk64, AddrModeFlat, IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386};
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::fileapi::GetFinalPathNameByHandleW;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::libloaderapi::{GetModuleHandleA, GetProcAddress};
    use winapi::um::memoryapi::ReadProcessMemory;
    use winapi::um::minwinbase::{
        CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT,
        EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT, OUTPUT_DEBUG_STRING_EVENT,
        RIP_EVENT, UNLOAD_DLL_DEBUG_EVENT,
    };
    use winapi::um::processthreadsapi::{
        CreateProcessW, GetThreadContext, OpenProcessToken, ResumeThread, SetThreadContext, SuspendThread,
        TerminateProcess, PROCESS_INFORMATION, STARTUPINFOW,
    };
    use winapi::um::securitybaseapi::AdjustTokenPrivileges;
    use winapi::um::winbase::{LookupPrivilegeValueW, DEBUG_ONLY_THIS_PROCESS, DEBUG_PROCESS};
    use winapi::um::winnt::{
        CONTEXT, CONTEXT_CONTROL, CONTEXT_INTEGER, HANDLE, LUID, SE_DEBUG_NAME, SE_PRIVILEGE_ENABLED,
        TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY, WOW64_CONTEXT, WOW64_CONTEXT_CONTROL,
        WOW64_CONTEXT_INTEGER,
    };
    use winapi::um::wow64apiset::{IsWow64Process, Wow64GetThreadContext};

    fn wide(s: &str) -> Vec<u16> {
        let mut v: Vec<u16> = s.encode_utf16().collect();
        v.push(0);
        v
    }

    fn last_error_message() -> String {
        format!("os error {}", unsafe { GetLastError() })
    }

    /// Enable `SeDebugPrivilege` on the current process token, required to
    /// attach to or read the memory of a process we didn't launch.
    pub fn enable_debug_privilege() -> Result<(), ProcessError> {
        unsafe {
            let mut token: HANDLE = ptr::null_mut();
            let process = winapi::um::processthreadsapi::GetCurrentProcess();
            if OpenProcessToken(process, TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY, &mut token) == 0 {
                return Err(ProcessError::EnableDebugPrivilege(last_error_message()));
            }

            let mut luid = LUID {
                LowPart: 0,
                HighPart: 0,
            };
            let name = wide(SE_DEBUG_NAME);
            if LookupPrivilegeValueW(ptr::null(), name.as_ptr(), &mut luid) == 0 {
                CloseHandle(token);
                return Err(ProcessError::EnableDebugPrivilege(last_error_message()));
            }

            let mut privileges = TOKEN_PRIVILEGES {
                PrivilegeCount: 1,
                Privileges: [winapi::um::winnt::LUID_AND_ATTRIBUTES {
                    Luid: luid,
                    Attributes: SE_PRIVILEGE_ENABLED,
                }],
            };
            let ok = AdjustTokenPrivileges(
                token,
                FALSE,
                &mut privileges,
                0,
                ptr::null_mut(),
                ptr::null_mut(),
            );
            CloseHandle(token);
            if ok == 0 {
                return Err(ProcessError::EnableDebugPrivilege(last_error_message()));
            }
        }
        Ok(())
    }

    /// Launch `command` with the debug flags set so the OS routes its debug
    /// events to us. Returns the new process's pid.
    pub fn launch_process(command: &str, arguments: &str, folder: &str) -> Result<u32, ProcessError> {
        let mut cmdline = wide(&format!("{} {}", command, arguments));
        let folder_w = if folder.is_empty() {
            None
        } else {
            Some(wide(folder))
        };

        let mut startup_info: STARTUPINFOW = unsafe { std::mem::zeroed() };
        startup_info.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
        let mut process_info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        let ok = unsafe {
            CreateProcessW(
                ptr::null(),
                cmdline.as_mut_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                FALSE,
                DEBUG_PROCESS | DEBUG_ONLY_THIS_PROCESS,
                ptr::null_mut(),
                folder_w.as_ref().map(|f| f.as_ptr()).unwrap_or(ptr::null()),
                &mut startup_info,
                &mut process_info,
            )
        };
        if ok == 0 {
            return Err(ProcessError::Launch(last_error_message()));
        }

        let pid = process_info.dwProcessId;
        unsafe {
            DebugSetProcessKillOnExit(TRUE);
            CloseHandle(process_info.hProcess);
            CloseHandle(process_info.hThread);
        }
        Ok(pid)
    }

    /// Attach to an already-running process by pid.
    pub fn attach_process(pid: u32) -> Result<(), ProcessError> {
        unsafe {
            if DebugActiveProcess(pid) == 0 {
                return Err(ProcessError::Attach {
                    pid,
                    message: last_error_message(),
                });
            }
            DebugSetProcessKillOnExit(TRUE);
        }
        Ok(())
    }

    type WaitForDebugEventExFn = unsafe extern "system" fn(*mut DEBUG_EVENT, DWORD) -> i32;

    /// `WaitForDebugEventEx` (UTF-8 `OutputDebugString` support) is resolved
    /// dynamically since it's absent before Windows 10 1607; older targets
    /// fall back to the always-present ANSI-only `WaitForDebugEvent`.
    fn resolve_wait_for_debug_event_ex() -> Option<WaitForDebugEventExFn> {
        unsafe {
            let module = GetModuleHandleA(b"kernel32.dll\0".as_ptr() as *const i8);
            if module.is_null() {
                return None;
            }
            let proc = GetProcAddress(module, b"WaitForDebugEventEx\0".as_ptr() as *const i8);
            if proc.is_null() {
                return None;
            }
            Some(std::mem::transmute(proc))
        }
    }

    /// Block until a debug event arrives or `timeout_ms` elapses, returning
    /// `None` on timeout rather than an error (the sampler's normal "take a
    /// sampling tick" path).
    pub fn wait_for_debug_event(timeout_ms: u32) -> Result<Option<DebugEventRecord>, ProcessError> {
        let mut raw: DEBUG_EVENT = unsafe { std::mem::zeroed() };
        let wait_ex = resolve_wait_for_debug_event_ex();

        let ok = unsafe {
            match wait_ex {
                Some(f) => f(&mut raw, timeout_ms),
                None => WaitForDebugEvent(&mut raw, timeout_ms),
            }
        };

        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err == WAIT_TIMEOUT || err == ERROR_SEM_TIMEOUT {
                return Ok(None);
            }
            return Err(ProcessError::Wait(format!("os error {}", err)));
        }

        Ok(Some(DebugEventRecord {
            pid: raw.dwProcessId,
            tid: raw.dwThreadId,
            kind: decode_event(&raw),
        }))
    }

    fn decode_event(raw: &DEBUG_EVENT) -> DebugEvent {
        let pid = raw.dwProcessId;
        let tid = raw.dwThreadId;
        unsafe {
            match raw.dwDebugEventCode {
                CREATE_PROCESS_DEBUG_EVENT => {
                    let info = raw.u.CreateProcessInfo();
                    DebugEvent::CreateProcess {
                        pid,
                        tid,
                        process_handle: info.hProcess as usize,
                        thread_handle: info.hThread as usize,
                        image_base: info.lpBaseOfImage as u64,
                        image_file_handle: if info.hFile.is_null() {
                            None
                        } else {
                            Some(info.hFile as usize)
                        },
                        image_name_pointer: if info.lpImageName.is_null() {
                            None
                        } else {
                            Some(info.lpImageName as u64)
                        },
                        image_name_is_unicode: info.fUnicode != 0,
                    }
                }
                CREATE_THREAD_DEBUG_EVENT => {
                    let info = raw.u.CreateThread();
                    DebugEvent::CreateThread {
                        tid,
                        thread_handle: info.hThread as usize,
                        start_address: info
                            .lpStartAddress
                            .map(|f| f as usize as u64)
                            .unwrap_or(0),
                    }
                }
                EXIT_THREAD_DEBUG_EVENT => {
                    let info = raw.u.ExitThread();
                    DebugEvent::ExitThread {
                        tid,
                        exit_code: info.dwExitCode,
                    }
                }
                EXIT_PROCESS_DEBUG_EVENT => {
                    let info = raw.u.ExitProcess();
                    DebugEvent::ExitProcess {
                        exit_code: info.dwExitCode,
                    }
                }
                LOAD_DLL_DEBUG_EVENT => {
                    let info = raw.u.LoadDll();
                    DebugEvent::LoadDll {
                        base: info.lpBaseOfDll as u64,
                        file_handle: if info.hFile.is_null() {
                            None
                        } else {
                            Some(info.hFile as usize)
                        },
                        name_pointer: if info.lpImageName.is_null() {
                            None
                        } else {
                            Some(info.lpImageName as u64)
                        },
                        name_is_unicode: info.fUnicode != 0,
                    }
                }
                UNLOAD_DLL_DEBUG_EVENT => {
                    let info = raw.u.UnloadDll();
                    DebugEvent::UnloadDll {
                        base: info.lpBaseOfDll as u64,
                    }
                }
                EXCEPTION_DEBUG_EVENT => {
                    let info = raw.u.Exception();
                    DebugEvent::Exception {
                        first_chance: info.dwFirstChance != 0,
                    }
                }
                OUTPUT_DEBUG_STRING_EVENT => DebugEvent::OutputDebugString,
                RIP_EVENT => DebugEvent::Rip,
                other => {
                    log::warn!("unrecognized debug event code {}", other);
                    DebugEvent::Rip
                }
            }
        }
    }

    /// Resume the target after handling (or declining to handle) a debug
    /// event. Second-chance exceptions forward as `NotHandled`, matching
    /// the platform default of letting the target's own handler run first.
    pub fn continue_debug_event(pid: u32, tid: u32, status: ContinueStatus) {
        let code = match status {
            ContinueStatus::Handled => winapi::um::winnt::DBG_CONTINUE,
            ContinueStatus::NotHandled => winapi::um::winnt::DBG_EXCEPTION_NOT_HANDLED,
        };
        unsafe {
            ContinueDebugEvent(pid, tid, code);
        }
    }

    /// Detach (if attached) or kill (if launched) the target and stop
    /// receiving its debug events.
    pub fn stop_debugging(pid: u32, was_attached: bool, process_handle: Option<usize>) {
        unsafe {
            if was_attached {
                DebugActiveProcessStop(pid);
            } else if let Some(handle) = process_handle {
                TerminateProcess(handle as HANDLE, 1);
            }
        }
    }

    pub fn close_handle(handle: usize) {
        unsafe {
            CloseHandle(handle as HANDLE);
        }
    }

    /// Whether `process_handle` is a WOW64 (32-bit-on-64-bit) process.
    pub fn is_wow64_process(process_handle: usize) -> bool {
        let mut result: i32 = 0;
        unsafe {
            IsWow64Process(process_handle as HANDLE, &mut result);
        }
        result != 0
    }

    /// Suspend `thread_handle`, read its register context, and walk its
    /// call stack with `StackWalk64`. Frames are rejected (the walk is
    /// terminated early) once the program counter is null or the stack
    /// pointer fails to strictly increase or loses pointer alignment —
    /// the standard guards against a corrupted or self-modifying stack
    /// sending the walker into a loop.
    pub fn capture_stack(
        process_handle: usize,
        thread_handle: usize,
        is_wow64: bool,
        ptr_size: PointerSize,
    ) -> Option<Vec<StackFrame>> {
        if unsafe { SuspendThread(thread_handle as HANDLE) } == u32::MAX {
            return None;
        }
        let frames = unsafe { capture_stack_suspended(process_handle, thread_handle, is_wow64, ptr_size) };
        unsafe {
            ResumeThread(thread_handle as HANDLE);
        }
        frames
    }

    unsafe fn capture_stack_suspended(
        process_handle: usize,
        thread_handle: usize,
        is_wow64: bool,
        ptr_size: PointerSize,
    ) -> Option<Vec<StackFrame>> {
        let mut frame: winapi::um::dbghelp::STACKFRAME64 = std::mem::zeroed();
        frame.AddrPC.Mode = AddrModeFlat;
        frame.AddrFrame.Mode = AddrModeFlat;
        frame.AddrStack.Mode = AddrModeFlat;

        let machine;
        let mut ctx32: WOW64_CONTEXT = std::mem::zeroed();
        let mut ctx64: CONTEXT = std::mem::zeroed();

        if is_wow64 {
            machine = IMAGE_FILE_MACHINE_I386;
            ctx32.ContextFlags = WOW64_CONTEXT_CONTROL | WOW64_CONTEXT_INTEGER;
            if Wow64GetThreadContext(thread_handle as HANDLE, &mut ctx32) == 0 {
                return None;
            }
            frame.AddrPC.Offset = ctx32.Eip as u64;
            frame.AddrFrame.Offset = ctx32.Ebp as u64;
            frame.AddrStack.Offset = ctx32.Esp as u64;
        } else {
            machine = IMAGE_FILE_MACHINE_AMD64;
            ctx64.ContextFlags = CONTEXT_CONTROL | CONTEXT_INTEGER;
            if GetThreadContext(thread_handle as HANDLE, &mut ctx64) == 0 {
                return None;
            }
            frame.AddrPC.Offset = ctx64.Rip;
            frame.AddrFrame.Offset = ctx64.Rbp;
            frame.AddrStack.Offset = ctx64.Rsp;
        }

        let mut frames = Vec::new();
        let mut last_sp: Option<u64> = None;
        let align = ptr_size.bytes() as u64;

        loop {
            let ctx_ptr: *mut std::ffi::c_void = if is_wow64 {
                &mut ctx32 as *mut _ as *mut _
            } else {
                &mut ctx64 as *mut _ as *mut _
            };
            let ok = StackWalk64(
                machine as u32,
                process_handle as HANDLE,
                thread_handle as HANDLE,
                &mut frame,
                ctx_ptr,
                None,
                Some(winapi::um::dbghelp::SymFunctionTableAccess64),
                Some(winapi::um::dbghelp::SymGetModuleBase64),
                None,
            );
            if ok == 0 {
                break;
            }

            let pc = frame.AddrPC.Offset;
            let sp = frame.AddrStack.Offset;
            if pc == 0 {
                break;
            }
            if sp % align != 0 {
                break;
            }
            if let Some(prev_sp) = last_sp {
                if sp <= prev_sp {
                    break;
                }
            }
            last_sp = Some(sp);
            frames.push(StackFrame { pc, sp });
        }

        Some(frames)
    }

    /// Resolve a loaded module's path from the `HFILE` the OS handed us in
    /// its `LOAD_DLL`/`CREATE_PROCESS` debug event.
    pub fn get_filename_from_handle(file_handle: usize) -> Option<String> {
        let mut buf = [0u16; MAX_PATH * 2];
        let len = unsafe {
            GetFinalPathNameByHandleW(
                file_handle as HANDLE,
                buf.as_mut_ptr(),
                buf.len() as u32,
                winapi::um::fileapi::FILE_NAME_NORMALIZED,
            )
        };
        if len == 0 || len as usize >= buf.len() {
            return None;
        }
        let raw = OsString::from_wide(&buf[..len as usize]);
        let s = raw.to_string_lossy().into_owned();
        Some(s.strip_prefix(r"\\?\").map(str::to_string).unwrap_or(s))
    }

    /// Resolve a loaded module's path from the pointer the debug event
    /// carries instead of a file handle (seen for statically linked or
    /// otherwise handle-less images). `pointer` may itself point at a
    /// pointer to the string (common for `CREATE_PROCESS`'s `lpImageName`);
    /// both layers are read with `ReadProcessMemory`.
    pub fn get_filename_from_pointer(
        process_handle: usize,
        pointer: u64,
        is_unicode: bool,
        is_wow64: bool,
    ) -> Option<String> {
        let ptr_size = if is_wow64 { 4usize } else { 8usize };
        let mut indirect = [0u8; 8];
        if !read_process_memory(process_handle, pointer, &mut indirect[..ptr_size]) {
            return None;
        }
        let string_address = if ptr_size == 4 {
            u32::from_ne_bytes(indirect[0..4].try_into().unwrap()) as u64
        } else {
            u64::from_ne_bytes(indirect)
        };
        if string_address == 0 {
            return None;
        }

        const MAX_NAME_BYTES: usize = 1024;
        let mut raw = vec![0u8; MAX_NAME_BYTES];
        if !read_process_memory(process_handle, string_address, &mut raw) {
            return None;
        }

        if is_unicode {
            let words: Vec<u16> = raw
                .chunks_exact(2)
                .map(|c| u16::from_ne_bytes([c[0], c[1]]))
                .take_while(|&w| w != 0)
                .collect();
            Some(OsString::from_wide(&words).to_string_lossy().into_owned())
        } else {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            Some(String::from_utf8_lossy(&raw[..end]).into_owned())
        }
    }

    /// Read `SizeOfImage` out of the module's own PE headers: the debug
    /// event that announces a module gives us its base address but not its
    /// size, so the module registry's address-range bookkeeping has to
    /// fetch it itself. `e_lfanew` at offset `0x3C` locates the NT headers;
    /// `SizeOfImage` sits at the same `0x38` offset into the optional
    /// header in both the PE32 and PE32+ layouts (`BaseOfData` is absent
    /// from PE32+ but `ImageBase` grows from 4 to 8 bytes, so the two
    /// differences cancel out).
    pub fn get_module_size(process_handle: usize, base: u64) -> Option<u32> {
        let mut e_lfanew_buf = [0u8; 4];
        if !read_process_memory(process_handle, base + 0x3C, &mut e_lfanew_buf) {
            return None;
        }
        let e_lfanew = u32::from_le_bytes(e_lfanew_buf) as u64;

        let mut size_buf = [0u8; 4];
        let optional_header = base + e_lfanew + 4 + 20;
        if !read_process_memory(process_handle, optional_header + 0x38, &mut size_buf) {
            return None;
        }
        Some(u32::from_le_bytes(size_buf))
    }

    fn read_process_memory(process_handle: usize, address: u64, out: &mut [u8]) -> bool {
        let mut read = 0usize;
        unsafe {
            ReadProcessMemory(
                process_handle as HANDLE,
                address as *const std::ffi::c_void,
                out.as_mut_ptr() as *mut std::ffi::c_void,
                out.len(),
                &mut read,
            ) != 0
        }
    }
}

#[cfg(windows)]
pub use windows_impl::*;

#[cfg(not(windows))]
mod stub {
    use super::*;

    pub fn enable_debug_privilege() -> Result<(), ProcessError> {
        Err(ProcessError::Unsupported)
    }

    pub fn launch_process(_command: &str, _arguments: &str, _folder: &str) -> Result<u32, ProcessError> {
        Err(ProcessError::Unsupported)
    }

    pub fn attach_process(_pid: u32) -> Result<(), ProcessError> {
        Err(ProcessError::Unsupported)
    }

    pub fn wait_for_debug_event(_timeout_ms: u32) -> Result<Option<DebugEventRecord>, ProcessError> {
        Err(ProcessError::Unsupported)
    }

    pub fn continue_debug_event(_pid: u32, _tid: u32, _status: ContinueStatus) {}

    pub fn stop_debugging(_pid: u32, _was_attached: bool, _process_handle: Option<usize>) {}

    pub fn close_handle(_handle: usize) {}

    pub fn is_wow64_process(_process_handle: usize) -> bool {
        false
    }

    pub fn capture_stack(
        _process_handle: usize,
        _thread_handle: usize,
        _is_wow64: bool,
        _ptr_size: PointerSize,
    ) -> Option<Vec<StackFrame>> {
        None
    }

    pub fn get_filename_from_handle(_file_handle: usize) -> Option<String> {
        None
    }

    pub fn get_module_size(_process_handle: usize, _base: u64) -> Option<u32> {
        None
    }

    pub fn get_filename_from_pointer(
        _process_handle: usize,
        _pointer: u64,
        _is_unicode: bool,
        _is_wow64: bool,
    ) -> Option<String> {
        None
    }
}

#[cfg(not(windows))]
pub use stub::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_status_maps_to_distinct_values() {
        assert_ne!(ContinueStatus::Handled, ContinueStatus::NotHandled);
    }

    #[test]
    fn stack_frame_equality_is_by_value() {
        let a = StackFrame { pc: 1, sp: 2 };
        let b = StackFrame { pc: 1, sp: 2 };
        assert_eq!(a, b);
    }

    #[cfg(not(windows))]
    #[test]
    fn stub_reports_unsupported() {
        assert!(matches!(enable_debug_privilege(), Err(ProcessError::Unsupported)));
        assert!(capture_stack(0, 0, false, PointerSize::Bits64).is_none());
    }
}
