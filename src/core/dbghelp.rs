/// DbgHelp-backed `SymbolResolver`: the Windows platform layer that turns
/// an address into a `ResolvedSymbol`, with the side effects (symbol
/// server download progress, public/private/export classification)
/// surfaced through `classify_symbol_status` on debug-info callback text.
use thiserror::Error;

use crate::core::modules::Module;
use crate::core::symbols::{ResolvedSymbol, SymbolLoadStatus, SymbolResolver};

#[derive(Debug, Error)]
pub enum DbgHelpError {
    #[error("SymInitializeW failed: {0}")]
    Initialize(String),
    #[error("SymLoadModuleExW failed for {name}: {message}")]
    LoadModule { name: String, message: String },
    #[error("not supported on this platform")]
    Unsupported,
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::path::PathBuf;
    use std::ptr;
    use std::sync::{Arc, Mutex};

    use winapi::shared::minwindef::FALSE;
    use winapi::um::dbghelp::{
        SymCleanup, SymFromAddrW, SymGetLineFromAddrW64, SymInitializeW, SymLoadModuleExW,
        SymRegisterCallbackW64, SymSetOptions, SymUnloadModule64, IMAGEHLP_LINEW64, MAX_SYM_NAME,
        SYMOPT_DEBUG, SYMOPT_FAVOR_COMPRESSED, SYMOPT_IGNORE_NT_SYMPATH, SYMOPT_INCLUDE_32BIT_MODULES,
        SYMOPT_LOAD_LINES, SYMOPT_UNDNAME,
    };
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::winnt::HANDLE;

    const SYMBOL_INFO_SIZE: usize = std::mem::size_of::<winapi::um::dbghelp::SYMBOL_INFOW>()
        + (MAX_SYM_NAME - 1) * std::mem::size_of::<u16>();

    fn wide(s: &str) -> Vec<u16> {
        OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
    }

    fn last_error_message() -> String {
        format!("os error {}", unsafe { GetLastError() })
    }

    /// Per the DbgHelp callback contract (`CBA_DEBUG_INFO = 0x10000010`):
    /// fired once per line of debug-info text the symbol loader emits,
    /// which is where download/load-status progress is observable.
    const CBA_DEBUG_INFO: u32 = 0x10000010;

    /// Context handed back through `SymRegisterCallbackW64`'s opaque `user`
    /// parameter: a raw pointer to the resolver's pending-status queue,
    /// kept alive by the extra strong count `DbgHelpResolver::new` leaks
    /// into it and reclaims on `Drop`.
    unsafe extern "system" fn debug_info_callback(_process: HANDLE, action: u32, data: u64, user: u64) -> i32 {
        if action != CBA_DEBUG_INFO {
            return FALSE;
        }
        let wide_str = data as *const u16;
        if wide_str.is_null() || user == 0 {
            return TRUE_RESULT;
        }
        let len = (0..).take_while(|&i| *wide_str.add(i) != 0).count();
        let slice = std::slice::from_raw_parts(wide_str, len);
        let text = String::from_utf16_lossy(slice);
        if let Some(status) = crate::core::symbols::classify_symbol_status(&text) {
            let queue = user as *const Mutex<Vec<SymbolLoadStatus>>;
            if let Ok(mut pending) = (*queue).lock() {
                pending.push(status);
            }
        }
        TRUE_RESULT
    }

    const TRUE_RESULT: i32 = 1;

    /// A live DbgHelp session for one debuggee process handle. Owns the
    /// `SymInitializeW`/`SymCleanup` lifetime; one instance per target.
    pub struct DbgHelpResolver {
        process_handle: usize,
        is_wow64: bool,
        pending: Arc<Mutex<Vec<SymbolLoadStatus>>>,
        callback_ctx: u64,
    }

    impl DbgHelpResolver {
        /// Initialize DbgHelp against `process_handle`. `download_symbols`
        /// picks a symbol-server search path over a cache-only one;
        /// `is_wow64` additionally admits 32-bit modules in a 64-bit host
        /// process.
        pub fn new(
            process_handle: usize,
            download_symbols: bool,
            is_wow64: bool,
        ) -> Result<DbgHelpResolver, DbgHelpError> {
            let mut options = SYMOPT_UNDNAME | SYMOPT_LOAD_LINES | SYMOPT_DEBUG;
            if download_symbols {
                options |= SYMOPT_FAVOR_COMPRESSED | SYMOPT_IGNORE_NT_SYMPATH;
            }
            if is_wow64 {
                options |= SYMOPT_INCLUDE_32BIT_MODULES;
            }
            unsafe {
                SymSetOptions(options);
            }

            let app_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("."));
            let app_dir = app_dir.to_string_lossy();
            let search_path = if download_symbols {
                format!(
                    "SRV*{}\\symbols*https://msdl.microsoft.com/download/symbols",
                    app_dir
                )
            } else {
                format!("CACHE*{}\\symbols", app_dir)
            };
            let search_path_w = wide(&search_path);

            let ok = unsafe { SymInitializeW(process_handle as HANDLE, search_path_w.as_ptr(), FALSE) };
            if ok == 0 {
                return Err(DbgHelpError::Initialize(last_error_message()));
            }

            let pending = Arc::new(Mutex::new(Vec::new()));
            let callback_ctx = Arc::into_raw(pending.clone()) as u64;
            unsafe {
                SymRegisterCallbackW64(process_handle as HANDLE, Some(debug_info_callback), callback_ctx);
            }

            Ok(DbgHelpResolver {
                process_handle,
                is_wow64,
                pending,
                callback_ctx,
            })
        }

        pub fn is_wow64(&self) -> bool {
            self.is_wow64
        }

        /// Load `name`'s symbols for a module freshly mapped at `base`.
        /// `file_handle`, if available from the debug event, lets DbgHelp
        /// open the image itself rather than re-resolving the path.
        pub fn load_module(
            &mut self,
            file_handle: Option<usize>,
            name: &str,
            base: u64,
            size: u32,
        ) -> Result<(), DbgHelpError> {
            let name_w = wide(name);
            let handle = file_handle.map(|h| h as HANDLE).unwrap_or(ptr::null_mut());
            let loaded = unsafe {
                SymLoadModuleExW(
                    self.process_handle as HANDLE,
                    handle,
                    name_w.as_ptr(),
                    ptr::null(),
                    base,
                    size,
                    ptr::null_mut(),
                    0,
                )
            };
            if loaded == 0 {
                return Err(DbgHelpError::LoadModule {
                    name: name.to_string(),
                    message: last_error_message(),
                });
            }
            Ok(())
        }

        pub fn unload_module(&mut self, base: u64) {
            unsafe {
                SymUnloadModule64(self.process_handle as HANDLE, base);
            }
        }
    }

    impl Drop for DbgHelpResolver {
        fn drop(&mut self) {
            unsafe {
                SymCleanup(self.process_handle as HANDLE);
                drop(Arc::from_raw(self.callback_ctx as *const Mutex<Vec<SymbolLoadStatus>>));
            }
        }
    }

    impl SymbolResolver for DbgHelpResolver {
        fn drain_status_events(&mut self) -> Vec<SymbolLoadStatus> {
            match self.pending.lock() {
                Ok(mut pending) => pending.drain(..).collect(),
                Err(_) => Vec::new(),
            }
        }

        fn resolve(&mut self, _module: &Module, address: u64) -> Option<ResolvedSymbol> {
            let mut info_buf = vec![0u8; SYMBOL_INFO_SIZE];
            let info = info_buf.as_mut_ptr() as *mut winapi::um::dbghelp::SYMBOL_INFOW;
            unsafe {
                (*info).SizeOfStruct = std::mem::size_of::<winapi::um::dbghelp::SYMBOL_INFOW>() as u32;
                (*info).MaxNameLen = MAX_SYM_NAME as u32;
            }

            let mut displacement: u64 = 0;
            let ok = unsafe {
                SymFromAddrW(self.process_handle as HANDLE, address, &mut displacement, info)
            };
            if ok == 0 {
                return None;
            }

            let (sym_address, sym_size, name) = unsafe {
                let name_ptr = (*info).Name.as_ptr();
                let name_len = (*info).NameLen as usize;
                let name_slice = std::slice::from_raw_parts(name_ptr, name_len);
                (
                    (*info).Address,
                    (*info).Size,
                    String::from_utf16_lossy(name_slice),
                )
            };

            let mut line_info: IMAGEHLP_LINEW64 = unsafe { std::mem::zeroed() };
            line_info.SizeOfStruct = std::mem::size_of::<IMAGEHLP_LINEW64>() as u32;
            let mut offset: u32 = 0;

            let mut file = Vec::new();
            let mut line = 0u32;
            let mut line_last = 0u32;

            if unsafe {
                SymGetLineFromAddrW64(self.process_handle as HANDLE, sym_address, &mut offset, &mut line_info)
            } != 0
            {
                line = line_info.LineNumber;
                line_last = line_info.LineNumber;
                file = unsafe { wide_cstr_to_bytes(line_info.FileName) };
            }

            if sym_size != 0 {
                if unsafe {
                    SymGetLineFromAddrW64(
                        self.process_handle as HANDLE,
                        sym_address + sym_size as u64 - 1,
                        &mut offset,
                        &mut line_info,
                    )
                } != 0
                {
                    line_last = line_info.LineNumber;
                }
            }

            Some(ResolvedSymbol {
                name: name.into_bytes(),
                file,
                address: sym_address,
                size: sym_size,
                line,
                line_last,
            })
        }
    }

    unsafe fn wide_cstr_to_bytes(ptr: *const u16) -> Vec<u8> {
        if ptr.is_null() {
            return Vec::new();
        }
        let len = (0..).take_while(|&i| *ptr.add(i) != 0).count();
        let slice = std::slice::from_raw_parts(ptr, len);
        String::from_utf16_lossy(slice).into_bytes()
    }
}

#[cfg(windows)]
pub use windows_impl::DbgHelpResolver;

#[cfg(not(windows))]
pub struct DbgHelpResolver;

#[cfg(not(windows))]
impl DbgHelpResolver {
    pub fn new(_process_handle: usize, _download_symbols: bool, _is_wow64: bool) -> Result<Self, DbgHelpError> {
        Err(DbgHelpError::Unsupported)
    }

    pub fn is_wow64(&self) -> bool {
        false
    }

    pub fn load_module(
        &mut self,
        _file_handle: Option<usize>,
        _name: &str,
        _base: u64,
        _size: u32,
    ) -> Result<(), DbgHelpError> {
        Err(DbgHelpError::Unsupported)
    }

    pub fn unload_module(&mut self, _base: u64) {}
}

#[cfg(not(windows))]
impl SymbolResolver for DbgHelpResolver {
    fn resolve(&mut self, _module: &Module, _address: u64) -> Option<ResolvedSymbol> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    #[test]
    fn stub_resolver_reports_unsupported_on_construction() {
        assert!(matches!(
            DbgHelpResolver::new(0, false, false),
            Err(DbgHelpError::Unsupported)
        ));
    }
}
