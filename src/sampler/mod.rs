/// The debugger event loop and the command router that drives its
/// lifecycle. One OS thread runs the loop in `run_backend`; the router
/// lives on the thread that reads the control pipe and only ever touches
/// the sampler through the stop flag and the `RouterEvent` channel, never
/// the process/thread/symbol state itself (that belongs to the sampler
/// thread alone, per the single-writer model).
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;

use crate::core::dbghelp::DbgHelpResolver;
use crate::core::interner::StringInterner;
use crate::core::process::{self, ContinueStatus, DebugEvent, StackFrame};
use crate::core::symbols::{SymbolEvent, SymbolStore};
use crate::core::threads::{ThreadEvent, ThreadRegistry};
use crate::core::types::{CallStackEntry, PointerSize, ThreadId, UNRESOLVED_LINE};
use crate::protocol::command::Command;
use crate::protocol::framing::{has_complete_frame, peek_header};
use crate::protocol::command;
use crate::protocol::reply::{encode_reply, Reply, SampleFrame};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
}

/// What the frontend asked the sampler thread to debug.
#[derive(Debug, Clone)]
enum Target {
    Launch {
        command: Vec<u8>,
        arguments: Vec<u8>,
        folder: Vec<u8>,
    },
    Attach {
        pid: u32,
    },
}

/// Wire-negotiated knobs, set by `SET_OPTIONS` before a session starts.
/// Not CLI flags: the frontend sends these over the pipe per session.
#[derive(Debug, Clone, Copy)]
struct Options {
    sampling_usec: u32,
    download_symbols: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            sampling_usec: 10_000,
            download_symbols: true,
        }
    }
}

fn clamp_sampling_ms(sampling_usec: u32) -> u32 {
    (sampling_usec / 1000).clamp(1, 1000)
}

fn write_reply(writer: &Arc<Mutex<dyn Write + Send>>, reply: &Reply) {
    let frame = encode_reply(reply);
    if let Ok(mut w) = writer.lock() {
        let _ = w.write_all(&frame);
    }
}

fn write_message(writer: &Arc<Mutex<dyn Write + Send>>, operation: &str, system_error: &str) {
    write_reply(
        writer,
        &Reply::Message {
            operation: operation.to_string(),
            system_error: system_error.to_string(),
        },
    );
}

/// Events the pipe reader thread and the sampler thread both feed into the
/// router's single dispatch loop, standing in for a `WaitForMultipleObjects`
/// style multiplexed wait over "more pipe bytes" and "sampler thread exited".
enum RouterEvent {
    Bytes(Vec<u8>),
    SamplerExited,
}

/// Drives the control-pipe protocol: buffers incoming bytes, parses
/// complete frames, and starts/stops the sampler thread in response.
pub struct CommandRouter {
    writer: Arc<Mutex<dyn Write + Send>>,
    buf: Vec<u8>,
    options: Options,
    stop_flag: Option<Arc<AtomicBool>>,
    sampler_handle: Option<JoinHandle<()>>,
    events_tx: Sender<RouterEvent>,
    events_rx: Receiver<RouterEvent>,
}

impl CommandRouter {
    pub fn new(writer: Arc<Mutex<dyn Write + Send>>) -> CommandRouter {
        let (events_tx, events_rx) = std::sync::mpsc::channel();
        CommandRouter {
            writer,
            buf: Vec::new(),
            options: Options::default(),
            stop_flag: None,
            sampler_handle: None,
            events_tx,
            events_rx,
        }
    }

    /// Run the control loop until `STOP` is processed or the pipe closes.
    /// `read` is called with a scratch buffer and must block until bytes
    /// arrive, returning `Ok(0)` on a clean disconnect.
    pub fn run(mut self, mut read: impl FnMut(&mut [u8]) -> std::io::Result<usize>) {
        let reader_tx = self.events_tx.clone();
        let (read_done_tx, read_done_rx) = std::sync::mpsc::channel::<()>();
        std::thread::spawn(move || {
            let mut scratch = [0u8; 4096];
            loop {
                match read(&mut scratch) {
                    Ok(0) => break,
                    Ok(n) => {
                        if reader_tx.send(RouterEvent::Bytes(scratch[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = read_done_tx.send(());
        });

        loop {
            match self.events_rx.recv() {
                Ok(RouterEvent::Bytes(chunk)) => {
                    self.buf.extend_from_slice(&chunk);
                    match self.drain_commands() {
                        Ok(should_stop) => {
                            if should_stop {
                                break;
                            }
                        }
                        Err(RouterError::UnknownOpcode(op)) => {
                            log::error!("terminating: unknown opcode {op} on control pipe");
                            break;
                        }
                    }
                }
                Ok(RouterEvent::SamplerExited) => {
                    if let Some(handle) = self.sampler_handle.take() {
                        let _ = handle.join();
                    }
                    self.stop_flag = None;
                }
                Err(_) => break,
            }
        }

        if let Some(stop_flag) = self.stop_flag.take() {
            stop_flag.store(true, Ordering::Relaxed);
        }
        if let Some(handle) = self.sampler_handle.take() {
            let _ = handle.join();
        }
        let _ = read_done_rx.recv_timeout(std::time::Duration::from_millis(100));
    }

    /// Parse every complete frame currently buffered. Returns `Ok(true)`
    /// once a `STOP` has been fully processed (the caller must not read
    /// any further pipe bytes after that).
    fn drain_commands(&mut self) -> Result<bool, RouterError> {
        loop {
            let Some(header) = peek_header(&self.buf) else {
                return Ok(false);
            };
            if !has_complete_frame(&self.buf, &header) {
                return Ok(false);
            }
            match command::parse(header.opcode, &self.buf) {
                command::ParseOutcome::Incomplete => return Ok(false),
                command::ParseOutcome::UnknownOpcode => {
                    return Err(RouterError::UnknownOpcode(header.opcode));
                }
                command::ParseOutcome::Parsed { command, consumed } => {
                    self.buf.drain(0..consumed);
                    if self.handle_command(command) {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Returns `true` if this command was `STOP` and the router must
    /// shut down without reading further pipe bytes.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SetOptions {
                sampling_usec,
                download_symbols,
            } => {
                self.options = Options {
                    sampling_usec,
                    download_symbols,
                };
                false
            }
            Command::Stop => {
                if let Some(stop_flag) = self.stop_flag.take() {
                    stop_flag.store(true, Ordering::Relaxed);
                }
                if let Some(handle) = self.sampler_handle.take() {
                    let _ = handle.join();
                }
                true
            }
            Command::CreateProcess {
                command,
                arguments,
                folder,
            } => {
                self.spawn_sampler(Target::Launch {
                    command,
                    arguments,
                    folder,
                });
                false
            }
            Command::AttachProcess { pid } => {
                self.spawn_sampler(Target::Attach { pid });
                false
            }
        }
    }

    fn spawn_sampler(&mut self, target: Target) {
        if self.sampler_handle.is_some() {
            write_message(&self.writer, "start session", "a session is already running");
            return;
        }
        let stop_flag = Arc::new(AtomicBool::new(false));
        self.stop_flag = Some(stop_flag.clone());
        let writer = self.writer.clone();
        let options = self.options;
        let done_tx = self.events_tx.clone();
        let handle = std::thread::spawn(move || {
            run_backend(target, options, writer, stop_flag);
            let _ = done_tx.send(RouterEvent::SamplerExited);
        });
        self.sampler_handle = Some(handle);
    }
}

/// Per-thread scratch buffer for the stack walk in progress. Cleared (not
/// freed) between samples, giving the same reuse discipline the arena's
/// chained blocks would, without fighting the arena's byte-slice API for a
/// value that needs to persist and grow across ticks.
#[derive(Default)]
struct StackBuilder {
    entries: Vec<CallStackEntry>,
}

struct DebuggerState {
    pid: u32,
    process_handle: Option<usize>,
    was_attached: bool,
    is_wow64: bool,
    ptr_size: PointerSize,
    running: bool,
    threads: ThreadRegistry,
    symbols: SymbolStore,
    interner: StringInterner,
    resolver: Option<DbgHelpResolver>,
    stack_builders: HashMap<ThreadId, StackBuilder>,
}

impl DebuggerState {
    fn new(was_attached: bool) -> DebuggerState {
        DebuggerState {
            pid: 0,
            process_handle: None,
            was_attached,
            is_wow64: false,
            ptr_size: PointerSize::Bits64,
            running: true,
            threads: ThreadRegistry::new(),
            symbols: SymbolStore::new(),
            interner: StringInterner::new(),
            resolver: None,
            stack_builders: HashMap::new(),
        }
    }
}

fn relay_symbol_events(writer: &Arc<Mutex<dyn Write + Send>>, events: Vec<SymbolEvent>) {
    for event in events {
        match event {
            SymbolEvent::NewString { id, bytes } => write_reply(
                writer,
                &Reply::NewString {
                    id,
                    value: String::from_utf8_lossy(&bytes).into_owned(),
                },
            ),
            SymbolEvent::NewSymbol(symbol) => write_reply(
                writer,
                &Reply::NewSymbol {
                    id: symbol.id,
                    name: symbol.name,
                    file: symbol.file,
                    size: symbol.size,
                    address: symbol.address,
                    module: symbol.module,
                    line: symbol.line,
                    line_last: symbol.line_last,
                },
            ),
            SymbolEvent::ModuleLoad { base, name } => write_reply(
                writer,
                &Reply::ModuleLoad {
                    base,
                    name: String::from_utf8_lossy(&name).into_owned(),
                },
            ),
            SymbolEvent::ModuleUnload { base } => write_reply(writer, &Reply::ModuleUnload { base }),
        }
    }
}

fn resolve_module_name(state: &DebuggerState, event_file_handle: Option<usize>, event_name_pointer: Option<u64>, name_is_unicode: bool) -> Vec<u8> {
    let from_pointer = event_name_pointer.and_then(|ptr| {
        process::get_filename_from_pointer(
            state.process_handle.unwrap_or(0),
            ptr,
            name_is_unicode,
            state.is_wow64,
        )
    });
    let name = from_pointer.or_else(|| event_file_handle.and_then(process::get_filename_from_handle));
    name.unwrap_or_default().into_bytes()
}

/// Register a newly mapped module (the initial image or a `LoadDll`) with
/// both the symbol store's AVL-tree bookkeeping and DbgHelp's own module
/// table, then relay whatever `NewString`/`ModuleLoad` events fall out of
/// it (§4.2 `load`).
fn register_module(
    state: &mut DebuggerState,
    writer: &Arc<Mutex<dyn Write + Send>>,
    base: u64,
    file_handle: Option<usize>,
    name: &[u8],
) {
    let process_handle = state.process_handle.unwrap_or(0);
    let size = process::get_module_size(process_handle, base).unwrap_or(0);

    let (_handle, events) = state.symbols.load(&mut state.interner, base, size, name);
    relay_symbol_events(writer, events);

    if let Some(resolver) = state.resolver.as_mut() {
        let name_str = String::from_utf8_lossy(name);
        if let Err(e) = resolver.load_module(file_handle, &name_str, base, size) {
            log::warn!("load_module({name_str}): {e}");
        }
    }
}

/// The main debugger/sampler event loop (§4.5). Runs on its own OS thread;
/// it is the sole caller into the symbol resolver, the stack walker, and
/// the debug-event primitive, which is what keeps all of the derived state
/// (strings, symbols, modules, threads) single-writer.
fn run_backend(
    target: Target,
    options: Options,
    writer: Arc<Mutex<dyn Write + Send>>,
    stop_flag: Arc<AtomicBool>,
) {
    let was_attached = matches!(target, Target::Attach { .. });
    let launch_result = match &target {
        Target::Attach { pid } => {
            if let Err(e) = process::enable_debug_privilege() {
                log::warn!("enable_debug_privilege: {e}");
            }
            process::attach_process(*pid).map(|_| *pid)
        }
        Target::Launch {
            command,
            arguments,
            folder,
        } => process::launch_process(
            &String::from_utf8_lossy(command),
            &String::from_utf8_lossy(arguments),
            &String::from_utf8_lossy(folder),
        ),
    };

    let pid = match launch_result {
        Ok(pid) => pid,
        Err(e) => {
            write_message(&writer, "start target", &e.to_string());
            return;
        }
    };

    let mut state = DebuggerState::new(was_attached);
    state.pid = pid;

    let sampling_ms = clamp_sampling_ms(options.sampling_usec);
    #[cfg(windows)]
    unsafe {
        winapi::um::timeapi::timeBeginPeriod(1);
    }

    while state.running && !stop_flag.load(Ordering::Relaxed) {
        match process::wait_for_debug_event(sampling_ms) {
            Ok(Some(record)) => dispatch_event(&mut state, &options, &writer, record),
            Ok(None) => {
                if state.process_handle.is_some() {
                    take_samples(&mut state, &writer);
                }
            }
            Err(e) => {
                log::error!("debug event wait failed: {e}");
                break;
            }
        }
    }

    if stop_flag.load(Ordering::Relaxed) && state.running {
        process::stop_debugging(state.pid, state.was_attached, state.process_handle);
    }
    if let Some(handle) = state.process_handle {
        process::close_handle(handle);
    }

    #[cfg(windows)]
    unsafe {
        winapi::um::timeapi::timeEndPeriod(1);
    }
}

fn dispatch_event(
    state: &mut DebuggerState,
    options: &Options,
    writer: &Arc<Mutex<dyn Write + Send>>,
    record: process::DebugEventRecord,
) {
    let (event_pid, event_tid) = (record.pid, record.tid);
    match record.kind {
        DebugEvent::CreateProcess {
            pid,
            tid,
            process_handle,
            thread_handle,
            image_base,
            image_file_handle,
            image_name_pointer,
            image_name_is_unicode,
        } => {
            state.process_handle = Some(process_handle);
            state.is_wow64 = process::is_wow64_process(process_handle);
            state.ptr_size = if state.is_wow64 {
                PointerSize::Bits32
            } else {
                PointerSize::Bits64
            };

            write_reply(
                writer,
                &Reply::ProcessStart {
                    pid,
                    pointer_size: state.ptr_size.bytes(),
                },
            );

            match DbgHelpResolver::new(process_handle, options.download_symbols, state.is_wow64) {
                Ok(resolver) => state.resolver = Some(resolver),
                Err(e) => log::error!("DbgHelp init failed: {e}"),
            }

            let event = state.threads.add(tid, Some(thread_handle));
            if let ThreadEvent::Added { id, .. } = event {
                write_reply(
                    writer,
                    &Reply::ThreadAdd {
                        thread_id: id,
                        entry_point: 0,
                    },
                );
            }

            let name = resolve_module_name(state, image_file_handle, image_name_pointer, image_name_is_unicode);
            register_module(state, writer, image_base, image_file_handle, &name);

            process::continue_debug_event(pid, tid, ContinueStatus::Handled);
        }
        DebugEvent::ExitProcess { exit_code } => {
            write_reply(writer, &Reply::ProcessEnd { exit_code });
            state.running = false;
        }
        DebugEvent::CreateThread {
            tid, thread_handle, ..
        } => {
            let event = state.threads.add(tid, Some(thread_handle));
            if let ThreadEvent::Added { id, .. } = event {
                write_reply(
                    writer,
                    &Reply::ThreadAdd {
                        thread_id: id,
                        entry_point: 0,
                    },
                );
            }
            process::continue_debug_event(event_pid, event_tid, ContinueStatus::Handled);
        }
        DebugEvent::ExitThread { tid, .. } => {
            if let Some((ThreadEvent::Removed { id }, handle)) = state.threads.remove(tid) {
                write_reply(writer, &Reply::ThreadRemove { thread_id: id });
                if let Some(handle) = handle {
                    process::close_handle(handle);
                }
            }
            state.stack_builders.remove(&tid);
            process::continue_debug_event(event_pid, event_tid, ContinueStatus::Handled);
        }
        DebugEvent::LoadDll {
            base,
            file_handle,
            name_pointer,
            name_is_unicode,
        } => {
            let name = resolve_module_name(state, file_handle, name_pointer, name_is_unicode);
            register_module(state, writer, base, file_handle, &name);
            process::continue_debug_event(event_pid, event_tid, ContinueStatus::Handled);
        }
        DebugEvent::UnloadDll { base } => {
            if let Some(handle) = state.symbols.find_module_by_base(base) {
                let events = state.symbols.unload(handle);
                relay_symbol_events(writer, events);
            }
            if let Some(resolver) = state.resolver.as_mut() {
                resolver.unload_module(base);
            }
            process::continue_debug_event(event_pid, event_tid, ContinueStatus::Handled);
        }
        DebugEvent::Exception { first_chance } => {
            let status = if first_chance {
                ContinueStatus::Handled
            } else {
                ContinueStatus::NotHandled
            };
            process::continue_debug_event(event_pid, event_tid, status);
        }
        DebugEvent::OutputDebugString | DebugEvent::Rip => {
            process::continue_debug_event(event_pid, event_tid, ContinueStatus::Handled);
        }
    }
}

/// One sampling tick: suspend every registered thread, walk its stack,
/// resolve each frame to a symbol, and emit one `StackSamples` per thread
/// that produced at least one resolved frame (§4.5 step 7).
fn take_samples(state: &mut DebuggerState, writer: &Arc<Mutex<dyn Write + Send>>) {
    let Some(process_handle) = state.process_handle else {
        return;
    };
    // DbgHelp initializes synchronously right after `process_handle` is set
    // in the `CreateProcess` handler, so in practice this is always `Some`
    // by the first tick; a tick that somehow races ahead of it just skips
    // sampling once rather than resolving against nothing.
    let Some(resolver) = state.resolver.as_mut() else {
        return;
    };
    for status in resolver.drain_status_events() {
        write_reply(writer, &Reply::Symbols { status });
    }
    let thread_ids: Vec<(ThreadId, Option<usize>)> = state.threads.iter().collect();

    for (tid, handle) in thread_ids {
        let Some(thread_handle) = handle else { continue };
        let Some(frames) = process::capture_stack(process_handle, thread_handle, state.is_wow64, state.ptr_size)
        else {
            continue;
        };
        if frames.is_empty() {
            continue;
        }

        let builder = state.stack_builders.entry(tid).or_default();
        builder.entries.clear();

        for (index, frame) in frames.iter().enumerate() {
            let StackFrame { pc, .. } = *frame;
            let query_pc = if index == 0 { pc } else { pc.saturating_sub(1) };

            let (symbol, events) = state.symbols.get(&mut state.interner, resolver, query_pc);
            relay_symbol_events(writer, events);

            let Some(symbol) = symbol else { continue };
            let line = lookup_line(&symbol, query_pc);
            builder.entries.push(CallStackEntry {
                symbol: symbol.id,
                line,
                offset: (query_pc - symbol.address) as u32,
            });
        }

        if builder.entries.is_empty() {
            continue;
        }

        let sample_frames: Vec<SampleFrame> = builder
            .entries
            .iter()
            .map(|e| SampleFrame {
                symbol: e.symbol,
                line: e.line,
                offset: e.offset,
            })
            .collect();
        write_reply(
            writer,
            &Reply::StackSamples {
                thread_id: tid,
                frames: sample_frames,
            },
        );
    }
}

/// The symbol store's cached `Symbol.line` is the range's first line, not
/// necessarily the line at this exact `pc`; a real per-sample line lookup
/// would re-query the platform line API at `pc`, but that information
/// isn't retained once `SymbolStore::get` has resolved and cached the
/// symbol. Absent a second round-trip through the resolver here, the
/// symbol's first line stands in; a lookup that never had line info at
/// all reports the unresolved sentinel.
fn lookup_line(symbol: &crate::core::types::Symbol, _pc: u64) -> u32 {
    if symbol.line == 0 {
        UNRESOLVED_LINE
    } else {
        symbol.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::{OP_SET_OPTIONS, OP_STOP};
    use crate::protocol::framing::encode_frame;

    #[test]
    fn clamp_sampling_ms_respects_bounds() {
        assert_eq!(clamp_sampling_ms(500), 1);
        assert_eq!(clamp_sampling_ms(10_000), 10);
        assert_eq!(clamp_sampling_ms(50_000_000), 1000);
    }

    #[test]
    fn drain_commands_updates_options_without_stopping() {
        let writer: Arc<Mutex<dyn Write + Send>> = Arc::new(Mutex::new(Vec::new()));
        let mut router = CommandRouter::new(writer);

        let mut payload = Vec::new();
        payload.extend_from_slice(&20_000u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        router.buf.extend_from_slice(&encode_frame(OP_SET_OPTIONS, &payload));

        let stopped = router.drain_commands().unwrap();
        assert!(!stopped);
        assert_eq!(router.options.sampling_usec, 20_000);
        assert!(!router.options.download_symbols);
    }

    #[test]
    fn drain_commands_reports_stop() {
        let writer: Arc<Mutex<dyn Write + Send>> = Arc::new(Mutex::new(Vec::new()));
        let mut router = CommandRouter::new(writer);
        router.buf.extend_from_slice(&encode_frame(OP_STOP, &[]));
        let stopped = router.drain_commands().unwrap();
        assert!(stopped);
    }

    #[test]
    fn drain_commands_partial_frame_is_not_consumed() {
        let writer: Arc<Mutex<dyn Write + Send>> = Arc::new(Mutex::new(Vec::new()));
        let mut router = CommandRouter::new(writer);
        let frame = encode_frame(OP_STOP, &[]);
        router.buf.extend_from_slice(&frame[..frame.len() - 1]);
        let stopped = router.drain_commands().unwrap();
        assert!(!stopped);
        assert!(!router.buf.is_empty());
    }

    #[test]
    fn drain_commands_rejects_unknown_opcode() {
        let writer: Arc<Mutex<dyn Write + Send>> = Arc::new(Mutex::new(Vec::new()));
        let mut router = CommandRouter::new(writer);
        router.buf.extend_from_slice(&encode_frame(250, &[]));
        assert!(matches!(
            router.drain_commands(),
            Err(RouterError::UnknownOpcode(250))
        ));
    }

    #[test]
    fn run_with_no_bytes_returns_on_clean_disconnect() {
        let writer: Arc<Mutex<dyn Write + Send>> = Arc::new(Mutex::new(Vec::new()));
        let router = CommandRouter::new(writer);
        // `read` reports EOF immediately: the router must return promptly
        // without spawning a sampler or panicking.
        router.run(|_buf| Ok(0));
    }

    #[test]
    fn lookup_line_reports_unresolved_sentinel_when_symbol_has_no_line() {
        let symbol = crate::core::types::Symbol {
            id: 1,
            address: 0x1000,
            size: 0x10,
            name: 0,
            file: 0,
            module: 0,
            line: 0,
            line_last: 0,
        };
        assert_eq!(lookup_line(&symbol, 0x1000), UNRESOLVED_LINE);
    }
}
