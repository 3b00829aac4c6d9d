//! C8 — Signal handler entry point and installation (§4.8).
//!
//! Wires SIGSEGV/SIGBUS/SIGFPE/SIGILL/SIGTRAP/SIGSYS to the unlink-and-
//! redirect logic in `unlink.rs`, following the same sigreturn trick the
//! original engine's `sigret_dispatcher_call` uses: rather than calling the
//! dispatcher from inside the signal frame, the handler rewrites the saved
//! registers and PC so the kernel's own `sigreturn` resumes execution
//! exactly as if a direct jump into the dispatcher's native entry point had
//! happened.

use crate::cache::BranchType;
use crate::isa::{A0, A1, SP};
use crate::log::{write_line, LogFatal};
use crate::signals::context::UContext;
use crate::signals::unlink::{self, TRAP_DB, TRAP_IB};
use crate::thread::registry::ENGINE;
use crate::thread::ThreadState;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::cell::Cell;
use std::os::raw::{c_int, c_void};

thread_local! {
    static CURRENT: Cell<*mut ThreadState> = Cell::new(std::ptr::null_mut());
}

/// Registers `state` as the target this thread's handler invocations read
/// and mutate. Must run once per worker before it starts executing
/// translated code; the pointer has to stay valid for as long as the
/// thread does, since `ThreadState` owns its arena for the thread's whole
/// lifetime (§5).
pub fn set_current_thread(state: &mut ThreadState) {
    CURRENT.with(|c| c.set(state as *mut ThreadState));
}

pub fn clear_current_thread() {
    CURRENT.with(|c| c.set(std::ptr::null_mut()));
}

/// Host addresses the engine's own machinery lives at, so the handler can
/// tell a trap on the delayed-signal/syscall relay apart from a trap inside
/// ordinary translated guest code (§4.8 step 1).
#[derive(Copy, Clone)]
pub struct SignalConfig {
    pub dispatcher_addr: u64,
    pub send_self_signal_addr: u64,
    pub syscall_wrapper_addr: u64,
}

thread_local! {
    static CONFIG: Cell<SignalConfig> = Cell::new(SignalConfig {
        dispatcher_addr: 0,
        send_self_signal_addr: 0,
        syscall_wrapper_addr: 0,
    });
}

pub fn set_config(config: SignalConfig) {
    CONFIG.with(|c| c.set(config));
}

const HANDLED: &[Signal] = &[
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

/// Installs the shared trampoline on every signal the engine intercepts.
/// Each worker thread still needs its own `set_current_thread`/`set_config`
/// before executing translated code.
pub fn install() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigAction(trampoline), SaFlags::SA_SIGINFO, SigSet::empty());
    for sig in HANDLED {
        unsafe { signal::sigaction(*sig, &action)? };
    }
    Ok(())
}

extern "C" fn trampoline(signum: c_int, _info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let ucontext = unsafe { &mut *(ctx as *mut UContext) };
    handle(signum, ucontext);
}

fn handle(signum: c_int, ctx: &mut UContext) {
    let state_ptr = CURRENT.with(|c| c.get());
    if state_ptr.is_null() {
        fatal_abort(signum, ctx.pc());
    }
    let state = unsafe { &mut *state_ptr };
    let pc = ctx.pc();

    if ENGINE.is_exiting() {
        if let Some(id) = state.code_cache.fragment_id_for_addr(pc) {
            arm_unlink(state, id);
        }
        state.note_pending_signal(signum);
        return;
    }

    let config = CONFIG.with(|c| c.get());
    if pc == config.send_self_signal_addr || pc == config.syscall_wrapper_addr {
        redirect_to_guest_handler(ctx, signum);
        return;
    }

    if let Some(id) = state.code_cache.fragment_id_for_addr(pc) {
        match read_trap_word(pc) {
            Some(TRAP_IB) => {
                handle_trap_ib(state, ctx, id);
                return;
            }
            Some(TRAP_DB) => {
                handle_trap_db(state, ctx, id);
                return;
            }
            _ => {}
        }
        // A genuine fault in translated code: arm unlinking so the next
        // natural exit observes it, then deliver straight to whatever the
        // guest itself installed for this signal.
        arm_unlink(state, id);
        redirect_to_guest_handler(ctx, signum);
        return;
    }

    fatal_abort(signum, pc);
}

fn read_trap_word(pc: u64) -> Option<u32> {
    Some(unsafe { *(pc as *const u32) })
}

fn arm_unlink(state: &mut ThreadState, id: usize) {
    match state.code_cache.fragment(id).exit_branch_type {
        BranchType::UncondImm => unlink::unlink_uncond_imm(&mut state.code_cache, id),
        BranchType::CondImm => unlink::unlink_cond_imm(&mut state.code_cache, id),
        BranchType::UncondReg => unlink::unlink_uncond_reg(&mut state.code_cache, id),
        BranchType::TraceExit | BranchType::Unknown => {}
    }
}

/// §4.8 step 3: the inline hash lookup's `jr` trapped. `a0` already holds
/// the resolved `tpc` (the `ld` before it ran before the trap), so it's
/// read as the redirect target before being clobbered.
fn handle_trap_ib(state: &mut ThreadState, ctx: &mut UContext, id: usize) {
    unlink::restore_indirect_jump(&mut state.code_cache, id);
    let target = ctx.reg(A0);
    pop_ihl_scratch(ctx);
    sigret_dispatcher_call(ctx, target, 0);
}

/// Mirrors `restore_ihl_regs`: the inline lookup pushed `a0`/`a1`/`a2` on
/// entry and only popped `a2` on its way to the (now trapped) `jr`, so the
/// other two words are still sitting on top of the guest stack.
fn pop_ihl_scratch(ctx: &mut UContext) {
    let sp = ctx.sp();
    let slot = sp as *const u64;
    let (a0, a1) = unsafe { (*slot, *slot.add(1)) };
    ctx.set_reg(A0, a0);
    ctx.set_reg(A1, a1);
    ctx.set_reg(SP, sp + 16);
}

/// §4.8 step 4: a linked direct exit trapped. Restores the original bytes,
/// deterministically works out which side it exits to, and redirects there.
fn handle_trap_db(state: &mut ThreadState, ctx: &mut UContext, id: usize) {
    unlink::restore_direct(&mut state.code_cache, id);
    let frag = state.code_cache.fragment(id).clone();
    let taken = match frag.exit_branch_type {
        BranchType::CondImm => {
            let cond = frag
                .branch_condition
                .expect("cond_imm fragment always carries a branch condition");
            cond.cond.eval(ctx.reg(cond.r1), ctx.reg(cond.r2))
        }
        _ => true,
    };
    let target = if taken { frag.branch_taken_addr } else { frag.branch_skipped_addr };
    sigret_dispatcher_call(ctx, target, 0);
}

fn redirect_to_guest_handler(ctx: &mut UContext, signum: c_int) {
    let handler = ENGINE.signal_handler(signum as usize);
    if handler == 0 {
        fatal_abort(signum, ctx.pc());
    }
    sigret_dispatcher_call(ctx, handler, 0);
}

/// Rewrites `ctx` so the kernel's `sigreturn` resumes execution at the
/// dispatcher's native entry point with `(target, source_fragment_id)`
/// already in place, exactly as a direct call from an exit stub would have
/// left them.
fn sigret_dispatcher_call(ctx: &mut UContext, target: u64, source_fragment_id: u64) {
    let sp = ctx.sp() - 16;
    unsafe {
        let slot = sp as *mut u64;
        *slot = ctx.reg(A0);
        *slot.add(1) = ctx.reg(A1);
    }
    ctx.set_reg(A0, target);
    ctx.set_reg(A1, source_fragment_id);
    ctx.set_reg(SP, sp);
    ctx.set_pc(CONFIG.with(|c| c.get().dispatcher_addr));
}

fn fatal_abort(signum: c_int, pc: u64) -> ! {
    write_line(
        LogFatal,
        format_args!("synchronous signal {} outside the code cache at {:#x}", signum, pc),
    );
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_ctx() -> UContext {
        UContext {
            uc_flags: 0,
            uc_link: std::ptr::null_mut(),
            uc_stack: unsafe { std::mem::zeroed() },
            uc_mcontext: crate::signals::context::MContext { gregs: [0; 32] },
        }
    }

    #[test]
    fn pop_ihl_scratch_restores_a0_a1_and_advances_sp() {
        let stack: [u64; 4] = [0x1111, 0x2222, 0, 0];
        let mut ctx = blank_ctx();
        let base = stack.as_ptr() as u64;
        ctx.set_reg(SP, base);

        pop_ihl_scratch(&mut ctx);

        assert_eq!(ctx.reg(A0), 0x1111);
        assert_eq!(ctx.reg(A1), 0x2222);
        assert_eq!(ctx.sp(), base + 16);
    }

    #[test]
    fn sigret_dispatcher_call_sets_up_dispatcher_entry() {
        set_config(SignalConfig {
            dispatcher_addr: 0x9000,
            send_self_signal_addr: 0,
            syscall_wrapper_addr: 0,
        });
        let stack: [u64; 8] = [0; 8];
        let mut ctx = blank_ctx();
        ctx.set_reg(SP, stack.as_ptr() as u64 + 32);
        ctx.set_reg(A0, 0xaaaa);
        ctx.set_reg(A1, 0xbbbb);

        sigret_dispatcher_call(&mut ctx, 0x4000, 7);

        assert_eq!(ctx.reg(A0), 0x4000);
        assert_eq!(ctx.reg(A1), 7);
        assert_eq!(ctx.pc(), 0x9000);
        assert_eq!(ctx.sp(), stack.as_ptr() as u64 + 32 - 16);
        let saved = ctx.sp() as *const u64;
        unsafe {
            assert_eq!(*saved, 0xaaaa);
            assert_eq!(*saved.add(1), 0xbbbb);
        }
    }
}
