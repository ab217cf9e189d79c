//! Linear-scan register allocation.
//!
//! Walks live intervals in start order, keeping an active list sorted by
//! end point.  Expired intervals return their register to the free pool;
//! under pressure the interval with the furthest end is evicted to a spill
//! slot.  Intervals that are live across a call point are confined to
//! callee-saved registers, so nothing needs saving around calls.

use alloc::vec::Vec;

use super::callconv::CallConv;
use super::liveness::{LiveInterval, Liveness};
use crate::error::JitError;
use crate::operand::Register;

/// Where a virtual register lives for its whole lifetime.
///
/// Intervals are not split: a value is either in one register throughout
/// or in one stack slot throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// A physical register, in canonical 64-bit form.
    Reg(Register),
    /// The n-th 8-byte spill slot in the frame.
    Spill(u32),
}

/// Allocation result for one function.
#[derive(Debug)]
pub struct Allocation {
    /// Location per virtual register; `None` for registers that are never
    /// live.
    pub locs: Vec<Option<Loc>>,
    /// Callee-saved registers handed out, in convention order.  The
    /// prologue must save exactly these.
    pub used_callee_saved: Vec<Register>,
    /// Number of 8-byte spill slots the frame needs.
    pub spill_slots: u32,
}

impl Allocation {
    /// Location of a virtual register.
    ///
    /// # Panics
    ///
    /// Panics if the register was never live (the lowering pass only asks
    /// about registers that appear in the instruction stream).
    #[must_use]
    pub fn loc(&self, vreg: super::func::VReg) -> Loc {
        self.locs[vreg.index() as usize].expect("vreg appears in the instruction stream")
    }
}

struct Active {
    interval: LiveInterval,
    reg: Register,
}

/// Run linear scan over the liveness result.
pub fn allocate(
    liveness: &Liveness,
    conv: &CallConv,
    num_vregs: u32,
) -> Result<Allocation, JitError> {
    if conv.callee_saved.is_empty() {
        return Err(JitError::NoAllocatableRegister { class: "gp" });
    }

    // The free pool.  Caller-saved registers join it only when the
    // function makes no calls at all; otherwise every allocated value
    // must survive an arbitrary call.
    let mut free: Vec<Register> = conv.callee_saved.to_vec();
    if liveness.call_points.is_empty() {
        free.extend_from_slice(conv.caller_saved);
    }

    let crosses_call = |iv: &LiveInterval| {
        liveness.call_points.iter().any(|&p| iv.crosses(p))
    };
    let allowed = |iv: &LiveInterval, reg: Register| {
        !crosses_call(iv) || conv.is_callee_saved(reg)
    };

    let mut active: Vec<Active> = Vec::new(); // sorted by interval.end
    let mut locs: Vec<Option<Loc>> = alloc::vec![None; num_vregs as usize];
    let mut spill_slots: u32 = 0;
    let mut used: Vec<Register> = Vec::new();

    let mut spill_next = |locs: &mut Vec<Option<Loc>>, vreg: super::func::VReg| {
        let slot = spill_slots;
        spill_slots += 1;
        locs[vreg.index() as usize] = Some(Loc::Spill(slot));
    };

    for &iv in &liveness.intervals {
        // Expire intervals that ended before this one starts; their
        // registers go back to the pool.
        let mut i = 0;
        while i < active.len() {
            if active[i].interval.end < iv.start {
                free.push(active.remove(i).reg);
            } else {
                i += 1;
            }
        }

        // Prefer a free register this interval may use.
        if let Some(pos) = free.iter().position(|&r| allowed(&iv, r)) {
            let reg = free.remove(pos);
            locs[iv.vreg.index() as usize] = Some(Loc::Reg(reg));
            if !used.contains(&reg) {
                used.push(reg);
            }
            let at = active
                .iter()
                .position(|a| a.interval.end > iv.end)
                .unwrap_or(active.len());
            active.insert(at, Active { interval: iv, reg });
            continue;
        }

        // Pressure: evict the furthest-ending active interval whose
        // register this one may take, unless we ourselves end later.
        let victim_idx = active
            .iter()
            .rposition(|a| allowed(&iv, a.reg))
            .filter(|&idx| active[idx].interval.end > iv.end);
        match victim_idx {
            Some(idx) => {
                let victim = active.remove(idx);
                spill_next(&mut locs, victim.interval.vreg);
                locs[iv.vreg.index() as usize] = Some(Loc::Reg(victim.reg));
                let at = active
                    .iter()
                    .position(|a| a.interval.end > iv.end)
                    .unwrap_or(active.len());
                active.insert(
                    at,
                    Active {
                        interval: iv,
                        reg: victim.reg,
                    },
                );
            }
            None => spill_next(&mut locs, iv.vreg),
        }
    }

    // Report used callee-saved registers in convention order, so the
    // prologue/epilogue push order is deterministic.
    let used_callee_saved = conv
        .callee_saved
        .iter()
        .copied()
        .filter(|r| used.contains(r))
        .collect();

    Ok(Allocation {
        locs,
        used_callee_saved,
        spill_slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::func::VReg;

    fn iv(vreg: u32, start: u32, end: u32) -> LiveInterval {
        LiveInterval {
            start,
            end,
            vreg: VReg(vreg),
        }
    }

    fn liveness(intervals: Vec<LiveInterval>, call_points: Vec<u32>) -> Liveness {
        let num_points = intervals.iter().map(|i| i.end + 1).max().unwrap_or(0);
        Liveness {
            intervals,
            num_points,
            call_points,
        }
    }

    #[test]
    fn disjoint_intervals_share_a_register() {
        let l = liveness(alloc::vec![iv(0, 0, 2), iv(1, 3, 5)], alloc::vec![]);
        let a = allocate(&l, CallConv::systemv(), 2).unwrap();
        assert_eq!(a.loc(VReg(0)), a.loc(VReg(1)));
        assert_eq!(a.spill_slots, 0);
    }

    #[test]
    fn overlapping_intervals_get_distinct_registers() {
        let l = liveness(
            alloc::vec![iv(0, 0, 9), iv(1, 1, 9), iv(2, 2, 9)],
            alloc::vec![],
        );
        let a = allocate(&l, CallConv::systemv(), 3).unwrap();
        let regs: Vec<_> = (0..3).map(|i| a.loc(VReg(i))).collect();
        for i in 0..3 {
            for j in i + 1..3 {
                assert_ne!(regs[i], regs[j]);
            }
        }
    }

    #[test]
    fn pressure_spills_furthest_end() {
        // Fill every register with long intervals, then add a short one:
        // the short interval deserves a register, one long one spills.
        let conv = CallConv::systemv();
        let n = (conv.callee_saved.len() + conv.caller_saved.len()) as u32;
        let mut ivs: Vec<_> = (0..n).map(|i| iv(i, i, 1000)).collect();
        ivs.push(iv(n, n, n + 1));
        let l = liveness(ivs, alloc::vec![]);
        let a = allocate(&l, conv, n + 1).unwrap();
        assert!(matches!(a.loc(VReg(n)), Loc::Reg(_)));
        assert_eq!(a.spill_slots, 1);
        let spilled = (0..=n)
            .filter(|&i| matches!(a.loc(VReg(i)), Loc::Spill(_)))
            .count();
        assert_eq!(spilled, 1);
    }

    #[test]
    fn call_crossing_interval_gets_callee_saved() {
        let conv = CallConv::systemv();
        let l = liveness(alloc::vec![iv(0, 0, 10)], alloc::vec![5]);
        let a = allocate(&l, conv, 1).unwrap();
        match a.loc(VReg(0)) {
            Loc::Reg(r) => assert!(conv.is_callee_saved(r)),
            Loc::Spill(_) => panic!("should fit in a register"),
        }
        assert_eq!(a.used_callee_saved.len(), 1);
    }

    #[test]
    fn no_overlapping_pair_shares_a_register() {
        // Dense pressure test: many overlapping windows.
        let ivs: Vec<_> = (0..24u32).map(|i| iv(i, i, i + 10)).collect();
        let l = liveness(ivs.clone(), alloc::vec![]);
        let a = allocate(&l, CallConv::systemv(), 24).unwrap();
        for x in &ivs {
            for y in &ivs {
                if x.vreg == y.vreg || x.end < y.start || y.end < x.start {
                    continue;
                }
                if let (Loc::Reg(rx), Loc::Reg(ry)) = (a.loc(x.vreg), a.loc(y.vreg)) {
                    assert_ne!(rx, ry, "{} and {} overlap", x.vreg, y.vreg);
                }
            }
        }
    }

    #[test]
    fn empty_callee_saved_pool_is_rejected() {
        // A convention that preserves nothing across calls leaves linear
        // scan with no primary pool at all.
        let conv = CallConv {
            name: "bare",
            arg_regs: &[Register::Rdi],
            ret_reg: Register::Rax,
            callee_saved: &[],
            caller_saved: &[Register::Rcx, Register::Rdx],
            scratch: [Register::R10, Register::R11],
            stack_align: 16,
            shadow_space: 0,
        };
        let l = liveness(alloc::vec![iv(0, 0, 2)], alloc::vec![]);
        let err = allocate(&l, &conv, 1).unwrap_err();
        assert_eq!(err, JitError::NoAllocatableRegister { class: "gp" });
    }

    #[test]
    fn used_callee_saved_in_convention_order() {
        let conv = CallConv::systemv();
        let l = liveness(
            alloc::vec![iv(0, 0, 9), iv(1, 1, 9), iv(2, 2, 9)],
            alloc::vec![4],
        );
        let a = allocate(&l, conv, 3).unwrap();
        let order: Vec<_> = conv
            .callee_saved
            .iter()
            .filter(|r| a.used_callee_saved.contains(r))
            .copied()
            .collect();
        assert_eq!(a.used_callee_saved, order);
    }
}
