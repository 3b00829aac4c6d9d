//! C4 — Scanner: the guest-to-cache translation loop (§4.4).

pub mod stub;

use crate::cache::{Arena, BlockType, BranchCondition, BranchType};
use crate::emit::{
    emit_addi, emit_branch_guard, emit_fcall, emit_ld, emit_lr_d, emit_lr_w, emit_lw, emit_pop,
    emit_raw, emit_sc_d, emit_sc_w, emit_set_reg, BranchHandle, Cursor, RegMask, Reservations,
};
use crate::error::{EngineError, EngineResult};
use crate::guest::GuestMemory;
use crate::isa::{decode, BranchCond, DecodedInsn, Mnemonic, Reg, A0, A1, A2, T6, X0};
use crate::log::{write_line, LogWarn};
use crate::plugin::{PluginContext, PluginEvent, PluginRegistry};

pub use crate::flags::MIN_FSPACE;

/// Everything the scanner needs beyond the guest address itself (§4.4
/// "Inputs").
pub struct ScanRequest {
    pub read_p: u64,
    pub fragment_id: usize,
    pub block_type: BlockType,
    pub dispatcher_addr: u64,
    pub syscall_wrapper_addr: u64,
    /// Base address and index mask of the scanning thread's hash table,
    /// needed only when `flags::get().inline_hash` is set.
    pub hash_table_addr: u64,
    pub hash_mask: usize,
}

/// Gets a writable cursor over `id`'s slot without holding a borrow of
/// `arena` — the scanner needs to call other `Arena` methods
/// (`needs_new_slot`, `allocate_bb`) while still writing into the slot, and
/// the arena's backing memory is a stable `mmap` region for the thread's
/// whole lifetime, so detaching the slice from the borrow checker here is
/// sound.
fn cursor_for(arena: &Arena, id: usize) -> Cursor<'static> {
    let ptr = arena.slot_ptr(id);
    let len = arena.slot_size();
    let slot = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
    Cursor::new(slot, arena.slot_addr(id))
}

/// Translates guest instructions starting at `req.read_p` into
/// `req.fragment_id`'s slot (and, if it overflows, into freshly allocated
/// continuation slots) until a block-ending construct is reached, sealing
/// exit-stub metadata into `arena.fragments[]`. Returns the total bytes
/// written across every slot touched.
pub fn scan_block(
    arena: &mut Arena,
    plugins: &mut PluginRegistry,
    guest: &dyn GuestMemory,
    req: &ScanRequest,
) -> EngineResult<usize> {
    let mut current_id = req.fragment_id;
    let mut c = cursor_for(arena, current_id);
    let mut reservations = Reservations::new();
    let mut total = 0usize;

    if req.block_type != BlockType::Trace {
        // The calling exit stub spilled x10/x11/x12 before computing
        // (target, fragment_id) into x10/x11; restore all three before any
        // guest code resumes (§4.4 prologue).
        emit_pop(&mut c, RegMask::of(&[A0, A1, A2]))?;
    }

    let mut read_p = req.read_p;

    let mut bb_ctx = PluginContext {
        read_p,
        write_pos: c.pos(),
        insn: None,
        fragment_id: current_id,
        block_type: req.block_type,
        replace: false,
        pushed_regs: RegMask::default(),
        cursor: &mut c,
    };
    plugins.dispatch(PluginEvent::PreBbC, &mut bb_ctx)?;

    loop {
        let bytes = guest.read(read_p, 4);
        if bytes.len() < 2 {
            return Err(EngineError::Fatal(format!(
                "guest read at {:#x} returned fewer than 2 bytes",
                read_p
            )));
        }
        let insn = decode::decode(bytes, read_p);

        let mut ctx = PluginContext {
            read_p,
            write_pos: c.pos(),
            insn: Some(insn),
            fragment_id: current_id,
            block_type: req.block_type,
            replace: false,
            pushed_regs: RegMask::default(),
            cursor: &mut c,
        };
        plugins.dispatch(PluginEvent::PreInstC, &mut ctx)?;
        let replace = ctx.replace;

        let outcome = if replace {
            Outcome::Continue
        } else {
            translate_one(&mut c, &mut reservations, current_id, req, &mut read_p, insn)?
        };

        let mut ctx = PluginContext {
            read_p,
            write_pos: c.pos(),
            insn: Some(insn),
            fragment_id: current_id,
            block_type: req.block_type,
            replace: false,
            pushed_regs: RegMask::default(),
            cursor: &mut c,
        };
        plugins.dispatch(PluginEvent::PostInstC, &mut ctx)?;

        match outcome {
            Outcome::Sealed(meta) => {
                apply_exit_metadata(arena, current_id, meta);
                total += c.pos();
                break;
            }
            Outcome::Continue => {
                if arena.needs_new_slot(c.pos(), MIN_FSPACE) {
                    total += c.pos();
                    let new_id = arena.allocate_bb()?;
                    arena.fragment_mut(new_id).actual_id = Some(req.fragment_id);
                    let new_addr = arena.slot_addr(new_id);
                    crate::emit::emit_large_jump(&mut c, new_addr, X0, T6)?;
                    current_id = new_id;
                    c = cursor_for(arena, current_id);
                }
            }
        }
    }

    let mut end_ctx = PluginContext {
        read_p,
        write_pos: c.pos(),
        insn: None,
        fragment_id: current_id,
        block_type: req.block_type,
        replace: false,
        pushed_regs: RegMask::default(),
        cursor: &mut c,
    };
    plugins.dispatch(PluginEvent::PostBbC, &mut end_ctx)?;

    reservations.seal()?;
    Ok(total)
}

enum Outcome {
    Continue,
    Sealed(ExitMeta),
}

struct ExitMeta {
    branch_type: BranchType,
    exit_branch_addr: usize,
    branch_taken_addr: u64,
    branch_skipped_addr: u64,
    branch_condition: Option<BranchCondition>,
    rn: Option<Reg>,
    indirect_jump_addr: Option<u64>,
    skipped_handle: Option<BranchHandle>,
    taken_handle: Option<BranchHandle>,
    dispatcher_call_handle: Option<BranchHandle>,
}

fn apply_exit_metadata(arena: &mut Arena, id: usize, meta: ExitMeta) {
    let frag = arena.fragment_mut(id);
    frag.exit_branch_type = meta.branch_type;
    frag.exit_branch_addr = meta.exit_branch_addr;
    frag.branch_taken_addr = meta.branch_taken_addr;
    frag.branch_skipped_addr = meta.branch_skipped_addr;
    frag.branch_condition = meta.branch_condition;
    frag.rn = meta.rn;
    frag.indirect_jump_addr = meta.indirect_jump_addr;
    frag.skipped_link_handle = meta.skipped_handle;
    frag.taken_link_handle = meta.taken_handle;
    frag.dispatcher_call_handle = meta.dispatcher_call_handle;
}

/// Handles one decoded guest instruction. `Outcome::Sealed` means the block
/// ends here.
fn translate_one(
    c: &mut Cursor,
    reservations: &mut Reservations,
    fragment_id: usize,
    req: &ScanRequest,
    read_p: &mut u64,
    insn: DecodedInsn,
) -> EngineResult<Outcome> {
    let pc = *read_p;
    let len = insn.length as u64;
    let exit_branch_addr = c.pos();

    match insn.mnemonic {
        Mnemonic::Auipc => {
            emit_set_reg(c, insn.fields.rd, (pc as i64).wrapping_add(insn.fields.imm))?;
            *read_p += len;
            Ok(Outcome::Continue)
        }

        Mnemonic::Jal => {
            let target = (pc as i64 + insn.fields.imm) as u64;
            if insn.fields.rd != X0 {
                emit_set_reg(c, insn.fields.rd, pc as i64 + len as i64)?;
            }
            let (_, handle) = stub::emit_uncond_imm_stub(
                c,
                reservations,
                target,
                fragment_id,
                req.dispatcher_addr,
            )?;
            Ok(Outcome::Sealed(ExitMeta {
                branch_type: BranchType::UncondImm,
                exit_branch_addr,
                branch_taken_addr: target,
                branch_skipped_addr: 0,
                branch_condition: None,
                rn: None,
                indirect_jump_addr: None,
                skipped_handle: Some(handle),
                taken_handle: None,
                dispatcher_call_handle: None,
            }))
        }

        Mnemonic::Branch => {
            let cond = insn.fields.cond.expect("decoded Branch always carries a condition");
            let taken = (pc as i64 + insn.fields.imm) as u64;
            let fallthrough = pc + len;
            let stub_result = stub::emit_cond_imm_stub(
                c,
                reservations,
                cond,
                insn.fields.rs1,
                insn.fields.rs2,
                fallthrough,
                taken,
                fragment_id,
                req.dispatcher_addr,
            )?;
            Ok(Outcome::Sealed(ExitMeta {
                branch_type: BranchType::CondImm,
                exit_branch_addr,
                branch_taken_addr: taken,
                branch_skipped_addr: fallthrough,
                branch_condition: Some(BranchCondition {
                    r1: insn.fields.rs1,
                    r2: insn.fields.rs2,
                    cond,
                }),
                rn: None,
                indirect_jump_addr: None,
                skipped_handle: Some(stub_result.skipped_handle),
                taken_handle: Some(stub_result.taken_handle),
                dispatcher_call_handle: Some(stub_result.dispatcher_call_handle),
            }))
        }

        Mnemonic::Jalr => {
            if insn.fields.rd != X0 {
                emit_set_reg(c, insn.fields.rd, pc as i64 + len as i64)?;
            }
            let indirect_jump_addr = if crate::flags::get().inline_hash {
                let result = crate::inline_lookup::emit_inline_lookup(
                    c,
                    insn.fields.rs1,
                    insn.fields.imm,
                    fragment_id,
                    req.dispatcher_addr,
                    req.hash_table_addr,
                    req.hash_mask,
                )?;
                Some(result.hit_jump_addr)
            } else {
                stub::emit_indirect_stub(
                    c,
                    insn.fields.rs1,
                    insn.fields.imm,
                    fragment_id,
                    req.dispatcher_addr,
                )?;
                None
            };
            Ok(Outcome::Sealed(ExitMeta {
                branch_type: BranchType::UncondReg,
                exit_branch_addr,
                branch_taken_addr: 0,
                branch_skipped_addr: 0,
                branch_condition: None,
                // The inline lookup's hit-path `jr` always operates on `a0`
                // (it holds the resolved tpc by the time it runs), regardless
                // of which register the guest's own indirect branch used.
                rn: indirect_jump_addr.map(|_| A0),
                indirect_jump_addr,
                skipped_handle: None,
                taken_handle: None,
                dispatcher_call_handle: None,
            }))
        }

        Mnemonic::Ecall => {
            emit_set_reg(c, A0, (pc + 4) as i64)?;
            emit_fcall(c, req.syscall_wrapper_addr)?;
            *read_p += len;
            Ok(Outcome::Continue)
        }

        Mnemonic::LrW => {
            // Plain, non-reserving load (§4.4 worked example: "LW x5,0(x10);
            // MV x31,x5") — the reservation is reconstructed at the matching
            // SC instead, via a reloading LR there.
            emit_lw(c, insn.fields.rd, insn.fields.rs1, 0)?;
            emit_addi(c, T6, insn.fields.rd, 0)?;
            *read_p += len;
            Ok(Outcome::Continue)
        }
        Mnemonic::LrD => {
            emit_ld(c, insn.fields.rd, insn.fields.rs1, 0)?;
            emit_addi(c, T6, insn.fields.rd, 0)?;
            *read_p += len;
            Ok(Outcome::Continue)
        }

        Mnemonic::ScW => {
            emit_lr_w(c, insn.fields.rd, insn.fields.rs1)?;
            emit_reservation_guard(c, insn.fields.rd)?;
            emit_sc_w(c, insn.fields.rd, insn.fields.rs2, insn.fields.rs1)?;
            *read_p += len;
            Ok(Outcome::Continue)
        }
        Mnemonic::ScD => {
            emit_lr_d(c, insn.fields.rd, insn.fields.rs1)?;
            emit_reservation_guard(c, insn.fields.rd)?;
            emit_sc_d(c, insn.fields.rd, insn.fields.rs2, insn.fields.rs1)?;
            *read_p += len;
            Ok(Outcome::Continue)
        }

        Mnemonic::Unknown => {
            if c.pos() > 0 {
                let (_, handle) =
                    stub::emit_uncond_imm_stub(c, reservations, pc, fragment_id, req.dispatcher_addr)?;
                Ok(Outcome::Sealed(ExitMeta {
                    branch_type: BranchType::UncondImm,
                    exit_branch_addr,
                    branch_taken_addr: pc,
                    branch_skipped_addr: 0,
                    branch_condition: None,
                    rn: None,
                    indirect_jump_addr: None,
                    skipped_handle: Some(handle),
                    taken_handle: None,
                    dispatcher_call_handle: None,
                }))
            } else {
                write_line(LogWarn, format_args!("unrecognized opcode at {:#x}, copying verbatim", pc));
                copy_raw(c, insn)?;
                *read_p += len;
                Ok(Outcome::Continue)
            }
        }

        Mnemonic::Other => {
            copy_raw(c, insn)?;
            *read_p += len;
            Ok(Outcome::Continue)
        }
    }
}

fn copy_raw(c: &mut Cursor, insn: DecodedInsn) -> EngineResult<()> {
    emit_raw(c, insn.raw, insn.length)?;
    Ok(())
}

/// `BNE x31, rd, +8` guard preceding the rewritten SC (§4.4): the LR was
/// just re-issued rather than reusing a translated-away original, so this
/// detects a reservation already broken between that LR and here and
/// forces the SC to observe failure the same way the untranslated pair
/// would.
fn emit_reservation_guard(c: &mut Cursor, rd: Reg) -> EngineResult<()> {
    emit_branch_guard(c, BranchCond::Ne, T6, rd, 8)?;
    Ok(())
}
