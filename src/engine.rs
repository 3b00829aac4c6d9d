//! C10 — Engine bootstrap & CLI (§4.10): turns `argv[1..]` into a running
//! guest.

use crate::dispatcher::{self, DispatchContext};
use crate::emit::{emit_jalr, emit_pop, emit_push, emit_set_reg, Cursor, RegMask};
use crate::error::{EngineError, EngineResult};
use crate::flags::EngineFlags;
use crate::guest::ProcessMemory;
use crate::isa::{A0, RA, T6, X0};
use crate::log::{write_line, LogDebug, LogFatal, LogInfo};
use crate::plugin::PluginRegistry;
use crate::plugins::TracerPlugin;
use crate::signals;
use crate::thread::registry::ENGINE;
use crate::thread::ThreadState;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use structopt::StructOpt;

/// A resolved guest image: where its code sits and where to start (§4.10).
#[derive(Copy, Clone, Debug)]
pub struct GuestImage {
    pub entry: u64,
    pub base: u64,
}

/// Seam between the engine and whatever loads a guest ELF into memory.
/// Full ELF/auxv handling is explicitly out of scope for the translation
/// core, so a real loader and a fixed in-process test image both implement
/// this trait rather than the engine reaching into `goblin` directly.
pub trait GuestLoader {
    fn load(&self, path: &Path) -> EngineResult<GuestImage>;
}

/// `goblin`-backed loader for real ELF guests.
pub struct ElfLoader;

impl GuestLoader for ElfLoader {
    fn load(&self, path: &Path) -> EngineResult<GuestImage> {
        let bytes = std::fs::read(path)
            .map_err(|e| EngineError::Fatal(format!("failed to read {}: {}", path.display(), e)))?;
        let elf = goblin::elf::Elf::parse(&bytes)
            .map_err(|e| EngineError::Fatal(format!("failed to parse {}: {}", path.display(), e)))?;
        Ok(GuestImage { entry: elf.entry, base: 0 })
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "rvdbm", about = "A dynamic binary modification engine for 64-bit RISC-V guests")]
pub struct Options {
    /// Path to the guest executable.
    pub guest: PathBuf,

    /// Arguments passed through to the guest.
    pub guest_args: Vec<String>,

    /// Disable the inline hash-lookup probe at indirect branches, always
    /// falling into the dispatcher instead (C6).
    #[structopt(long)]
    pub no_inline_hash: bool,

    /// Write a binary TraceEntry trace to this path (C13).
    #[structopt(long)]
    pub trace_file: Option<PathBuf>,

    /// Write the line-oriented image-load/testcase-boundary debug log to
    /// this path (§6 "File formats").
    #[structopt(long)]
    pub debug_log: Option<PathBuf>,

    /// Increase logging verbosity (repeatable).
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,

    /// Decrease logging verbosity to errors only.
    #[structopt(short, long)]
    pub quiet: bool,
}

/// Parses CLI options, loads the guest, and runs it to completion,
/// returning the guest's own exit code (§6 "CLI").
pub fn run() -> i32 {
    let opts = Options::from_args();
    if opts.verbose > 0 {
        std::env::set_var("RVDBM_LOG", "debug");
    } else if opts.quiet {
        std::env::set_var("RVDBM_LOG", "error");
    }
    crate::log::init_from_env();

    let trace_file = opts.trace_file.clone();
    let debug_log_path = opts.debug_log.clone();
    crate::flags::install(EngineFlags::from_options(opts.no_inline_hash, opts.trace_file, opts.debug_log));

    let mut debug_log = match &debug_log_path {
        Some(path) => match crate::debug_log::DebugLog::create(path) {
            Ok(log) => Some(log),
            Err(e) => {
                write_line(LogFatal, format_args!("failed to open debug log {}: {}", path.display(), e));
                return 1;
            }
        },
        None => None,
    };

    let image = match ElfLoader.load(&opts.guest) {
        Ok(image) => image,
        Err(e) => {
            write_line(LogFatal, format_args!("failed to load {}: {}", opts.guest.display(), e));
            return 1;
        }
    };
    write_line(LogInfo, format_args!("loaded {} at entry {:#x}", opts.guest.display(), image.entry));
    if let Some(log) = debug_log.as_mut() {
        // A single CLI invocation runs exactly one guest to completion
        // (§6 "single invocation form"), so the image load and the
        // testcase boundary coincide at the same guest path.
        let _ = log.log_image(&opts.guest);
        let _ = log.log_testcase(&opts.guest);
    }

    match run_guest(image, trace_file) {
        Ok(code) => code,
        Err(e) => {
            write_line(LogFatal, format_args!("{}", e));
            1
        }
    }
}

/// Constructs the initial thread, installs the signal handler, resolves the
/// guest's entry point, and transfers control. Exists separately from `run`
/// so integration tests can drive bootstrap against a `SliceMemory`/fake
/// `GuestLoader` without touching argv or process exit.
fn run_guest(image: GuestImage, trace_file: Option<PathBuf>) -> EngineResult<i32> {
    lazy_static::initialize(&ENGINE);

    let mut state = ThreadState::new(std::process::id())?;
    let mut plugins = PluginRegistry::new();
    if let Some(path) = trace_file {
        let plugin = TracerPlugin::new(&path, crate::plugins::tracer::record_event as u64)
            .map_err(|e| EngineError::Fatal(format!("failed to open trace file {}: {}", path.display(), e)))?;
        plugins.register(Box::new(plugin));
    }

    let trampolines = Trampolines::build(dispatch_trampoline_entry as u64, syscall_trampoline_entry as u64)
        .map_err(|e| EngineError::Fatal(format!("failed to build native trampolines: {}", e)))?;
    state.dispatcher_addr = trampolines.dispatcher_addr;
    state.syscall_wrapper_addr = trampolines.syscall_wrapper_addr;

    bind_thread(&mut state, &mut plugins);
    signals::install().map_err(|e| EngineError::Fatal(format!("failed to install signal handlers: {}", e)))?;
    signals::set_current_thread(&mut state);
    signals::set_config(signals::SignalConfig {
        dispatcher_addr: trampolines.dispatcher_addr,
        send_self_signal_addr: trampolines.send_self_signal_addr,
        syscall_wrapper_addr: trampolines.syscall_wrapper_addr,
    });

    let guest = ProcessMemory;
    let tpc = {
        let mut ctx = DispatchContext {
            arena: &mut state.code_cache,
            hash_table: &mut state.hash_table,
            plugins: &mut plugins,
            guest: &guest,
            dispatcher_addr: trampolines.dispatcher_addr,
            syscall_wrapper_addr: trampolines.syscall_wrapper_addr,
        };
        dispatcher::dispatch_entry(&mut ctx, image.entry)?
    };

    // Keep the trampolines and bound thread-locals alive for the guest's
    // whole run; `enter_guest` never returns on a real riscv64 host.
    std::mem::forget(trampolines);
    enter_guest(tpc)
}

thread_local! {
    static ENGINE_THREAD_STATE: Cell<*mut ThreadState> = Cell::new(std::ptr::null_mut());
    static ENGINE_PLUGINS: Cell<*mut PluginRegistry> = Cell::new(std::ptr::null_mut());
}

fn bind_thread(state: &mut ThreadState, plugins: &mut PluginRegistry) {
    ENGINE_THREAD_STATE.with(|c| c.set(state as *mut ThreadState));
    ENGINE_PLUGINS.with(|c| c.set(plugins as *mut PluginRegistry));
}

/// The Rust side of the dispatcher trampoline (§4.5): a translated block's
/// exit stub tail-jumps into a tiny hand-assembled glue stub, which calls
/// here with `(target_spc, source_fragment_id)` already in `a0`/`a1` per
/// the dispatcher transport convention, then tail-jumps to whatever `tpc`
/// this returns.
extern "C" fn dispatch_trampoline_entry(target_spc: u64, source_fragment_id: u64) -> u64 {
    let state_ptr = ENGINE_THREAD_STATE.with(|c| c.get());
    let plugins_ptr = ENGINE_PLUGINS.with(|c| c.get());
    if state_ptr.is_null() || plugins_ptr.is_null() {
        write_line(LogFatal, format_args!("dispatcher trampoline entered before thread setup"));
        std::process::abort();
    }
    let state = unsafe { &mut *state_ptr };
    let plugins = unsafe { &mut *plugins_ptr };
    let guest = ProcessMemory;
    let mut ctx = DispatchContext {
        arena: &mut state.code_cache,
        hash_table: &mut state.hash_table,
        plugins,
        guest: &guest,
        dispatcher_addr: state.dispatcher_addr,
        syscall_wrapper_addr: state.syscall_wrapper_addr,
    };
    match dispatcher::dispatch_from_stub(&mut ctx, target_spc, source_fragment_id as usize) {
        Ok(tpc) => tpc,
        Err(e) => {
            write_line(LogFatal, format_args!("dispatch failed: {}", e));
            std::process::abort();
        }
    }
}

/// The Rust side of the syscall-wrapper trampoline: the scanner's `ecall`
/// translation calls here with the guest's post-syscall resume address
/// already in `a0`. Full passthrough syscall execution is intentionally
/// not modeled (see DESIGN.md); its role here is to give the signal
/// handler's §4.8 step 1 a real, distinguishable PC to recognize.
extern "C" fn syscall_trampoline_entry(resume_pc: u64) {
    write_line(LogDebug, format_args!("syscall trampoline reached, resume {:#x}", resume_pc));
}

/// A small mmap'd, executable region holding the two hand-assembled glue
/// stubs translated code calls into: one per native entry point the
/// scanner emits addresses for.
struct Trampolines {
    base: NonNull<u8>,
    len: usize,
    dispatcher_addr: u64,
    syscall_wrapper_addr: u64,
    send_self_signal_addr: u64,
}

impl Trampolines {
    fn build(dispatch_fn: u64, syscall_fn: u64) -> nix::Result<Trampolines> {
        let len = 4096;
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
        let map_flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        let ptr = unsafe { mmap(std::ptr::null_mut(), len, prot, map_flags, -1, 0) }?;
        let base = NonNull::new(ptr as *mut u8).expect("mmap returned null");
        let slot = unsafe { std::slice::from_raw_parts_mut(base.as_ptr(), len) };
        let mut c = Cursor::new(slot, base.as_ptr() as u64);

        let dispatcher_addr = c.addr();
        emit_dispatcher_glue(&mut c, dispatch_fn).expect("dispatcher glue always fits a fresh page");

        let syscall_wrapper_addr = c.addr();
        emit_syscall_glue(&mut c, syscall_fn).expect("syscall glue always fits a fresh page");

        // The delayed-signal relay isn't exercised beyond giving the
        // handler a PC to recognize (§4.8 step 1); it's an immediate
        // return.
        let send_self_signal_addr = c.addr();
        emit_jalr(&mut c, X0, RA, 0).expect("return-only stub always fits");

        Ok(Trampolines { base, len, dispatcher_addr, syscall_wrapper_addr, send_self_signal_addr })
    }
}

impl Drop for Trampolines {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// `t6 = dispatch_fn; call t6; jr a0` — calls into Rust with the dispatcher
/// transport registers untouched, then tail-jumps to the resolved `tpc` the
/// call returned in `a0`.
fn emit_dispatcher_glue(c: &mut Cursor, dispatch_fn: u64) -> Result<(), crate::error::EncodeError> {
    emit_set_reg(c, T6, dispatch_fn as i64)?;
    emit_jalr(c, RA, T6, 0)?;
    emit_jalr(c, X0, A0, 0)?;
    Ok(())
}

/// `push ra; t6 = syscall_fn; call t6; pop ra; ret` — entered via a linked
/// call (`emit_fcall`), so unlike the dispatcher glue it has to preserve
/// its own return address across the nested call.
fn emit_syscall_glue(c: &mut Cursor, syscall_fn: u64) -> Result<(), crate::error::EncodeError> {
    let mask = RegMask::of(&[RA]);
    emit_push(c, mask)?;
    emit_set_reg(c, T6, syscall_fn as i64)?;
    emit_jalr(c, RA, T6, 0)?;
    emit_pop(c, mask)?;
    emit_jalr(c, X0, RA, 0)?;
    Ok(())
}

/// Transfers control to translated code at `tpc`. On the engine's own
/// target architecture this is a plain tail jump; on any other host (e.g.
/// running the test suite on the developer's machine) jumping into
/// RISC-V-encoded bytes would be meaningless, so it's a fatal error.
#[cfg(target_arch = "riscv64")]
fn enter_guest(tpc: u64) -> EngineResult<i32> {
    unsafe {
        std::arch::asm!("jalr x0, 0({0})", in(reg) tpc, options(noreturn));
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn enter_guest(tpc: u64) -> EngineResult<i32> {
    Err(EngineError::Fatal(format!(
        "cannot enter translated riscv64 code (tpc {:#x}) on this host architecture",
        tpc
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampolines_are_distinct_addresses_within_the_mapped_page() {
        let t = Trampolines::build(dispatch_trampoline_entry as u64, syscall_trampoline_entry as u64).unwrap();
        assert_ne!(t.dispatcher_addr, t.syscall_wrapper_addr);
        assert_ne!(t.syscall_wrapper_addr, t.send_self_signal_addr);
        assert!(t.dispatcher_addr >= t.base.as_ptr() as u64);
        assert!(t.send_self_signal_addr < t.base.as_ptr() as u64 + t.len as u64);
    }
}
