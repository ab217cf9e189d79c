//! Live-interval computation over a linear program-point numbering.
//!
//! Backward fixed-point dataflow with per-block gen/kill bitsets:
//!
//! - `live_in[B]  = gen[B] ∪ (live_out[B] − kill[B])`
//! - `live_out[B] = ∪ live_in[S]` over successors `S`
//!
//! Loops are handled by iterating to a fixpoint; a value live across a
//! back-edge has its interval extended over every block it is live-in to.
//! Bitsets are dense `u64` words (virtual-register ids are already dense),
//! so the inner loop is word-wide OR/AND-NOT with no per-iteration
//! allocation.

use alloc::vec;
use alloc::vec::Vec;

use super::func::{for_each_term_use, for_each_use, inst_def, Func, Inst, VReg};
use crate::error::JitError;

/// Half-open live range `[start, end]` of one virtual register, in program
/// points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    /// First point at which the value is live (its definition, or the
    /// start of the earliest block it is live-in to).
    pub start: u32,
    /// Last point at which the value may be read.
    pub end: u32,
    /// The virtual register this interval belongs to.
    pub vreg: VReg,
}

impl LiveInterval {
    /// Whether the interval is live across the program point `p` (strictly
    /// inside: a use at `p` or a definition at `p` does not count).
    #[must_use]
    pub fn crosses(&self, p: u32) -> bool {
        self.start < p && p < self.end
    }
}

/// Liveness analysis output.
#[derive(Debug)]
pub struct Liveness {
    /// Intervals sorted by start point, as linear scan requires.
    pub intervals: Vec<LiveInterval>,
    /// Total number of program points.
    pub num_points: u32,
    /// Program points occupied by call instructions.  The allocator keeps
    /// values live across these in callee-saved registers.
    pub call_points: Vec<u32>,
}

/// Dense bitset over `u64` words.
#[derive(Clone, PartialEq, Eq)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn new(num_bits: usize) -> Self {
        Self {
            words: vec![0u64; num_bits.div_ceil(64)],
        }
    }

    #[inline]
    fn insert(&mut self, idx: usize) {
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    #[inline]
    fn remove(&mut self, idx: usize) {
        self.words[idx / 64] &= !(1u64 << (idx % 64));
    }

    #[inline]
    fn contains(&self, idx: usize) -> bool {
        (self.words[idx / 64] >> (idx % 64)) & 1 != 0
    }

    fn union_with(&mut self, other: &BitSet) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= *o;
        }
    }

    /// `self = gen ∪ (out − kill)`, reporting whether anything changed.
    fn assign_in(&mut self, gen: &BitSet, out: &BitSet, kill: &BitSet) -> bool {
        let mut changed = false;
        for i in 0..self.words.len() {
            let new = gen.words[i] | (out.words[i] & !kill.words[i]);
            changed |= new != self.words[i];
            self.words[i] = new;
        }
        changed
    }

    fn clear(&mut self) {
        self.words.fill(0);
    }

    fn for_each(&self, mut f: impl FnMut(usize)) {
        for (wi, &word) in self.words.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let tz = w.trailing_zeros() as usize;
                f(wi * 64 + tz);
                w &= w - 1;
            }
        }
    }

    fn first_set(&self) -> Option<usize> {
        for (wi, &word) in self.words.iter().enumerate() {
            if word != 0 {
                return Some(wi * 64 + word.trailing_zeros() as usize);
            }
        }
        None
    }
}

/// Compute live intervals for every virtual register in `func`.
///
/// A register that is live into the entry block without being a parameter
/// has a path from entry to a use that passes no definition; that is
/// [`JitError::UseBeforeDef`].
pub fn compute(func: &Func) -> Result<Liveness, JitError> {
    let num_blocks = func.blocks.len();
    let num_vregs = func.vreg_count() as usize;
    if num_vregs == 0 {
        return Ok(Liveness {
            intervals: Vec::new(),
            num_points: points_in(func),
            call_points: Vec::new(),
        });
    }

    // Phase 1: program points, def/last-use tracking, per-block gen/kill.
    let mut point: u32 = 0;
    let mut block_start = Vec::with_capacity(num_blocks);
    let mut block_end = Vec::with_capacity(num_blocks);
    let mut def_point = vec![u32::MAX; num_vregs];
    let mut last_use = vec![u32::MAX; num_vregs];
    let mut gen_sets = Vec::with_capacity(num_blocks);
    let mut kill_sets = Vec::with_capacity(num_blocks);
    let mut call_points = Vec::new();

    // Parameters are defined on entry, before any instruction runs.
    for p in &func.params {
        def_point[p.0 as usize] = 0;
    }

    for block in &func.blocks {
        block_start.push(point);
        let mut gen = BitSet::new(num_vregs);
        let mut kill = BitSet::new(num_vregs);

        for inst in &block.insts {
            if matches!(inst, Inst::Call { .. }) {
                call_points.push(point);
            }
            for_each_use(inst, |v| {
                let i = v.0 as usize;
                if last_use[i] == u32::MAX || point > last_use[i] {
                    last_use[i] = point;
                }
                if !kill.contains(i) {
                    gen.insert(i);
                }
            });
            if let Some(dst) = inst_def(inst) {
                let i = dst.0 as usize;
                if def_point[i] == u32::MAX {
                    def_point[i] = point;
                }
                kill.insert(i);
            }
            point += 1;
        }
        for_each_term_use(&block.term, |v| {
            let i = v.0 as usize;
            if last_use[i] == u32::MAX || point > last_use[i] {
                last_use[i] = point;
            }
            if !kill.contains(i) {
                gen.insert(i);
            }
        });
        block_end.push(point);
        point += 1;

        gen_sets.push(gen);
        kill_sets.push(kill);
    }
    let num_points = point;

    // Phase 2: successor lists.
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); num_blocks];
    for (idx, block) in func.blocks.iter().enumerate() {
        for succ in block.term.successors() {
            successors[idx].push(succ.index());
        }
    }

    // Phase 3: backward dataflow to a fixpoint.
    let mut live_in: Vec<BitSet> = (0..num_blocks).map(|_| BitSet::new(num_vregs)).collect();
    let mut live_out: Vec<BitSet> = (0..num_blocks).map(|_| BitSet::new(num_vregs)).collect();
    let mut tmp = BitSet::new(num_vregs);
    let mut changed = true;
    while changed {
        changed = false;
        for idx in (0..num_blocks).rev() {
            tmp.clear();
            for &succ in &successors[idx] {
                tmp.union_with(&live_in[succ]);
            }
            if tmp != live_out[idx] {
                live_out[idx].words.copy_from_slice(&tmp.words);
                changed = true;
            }
            changed |= live_in[idx].assign_in(&gen_sets[idx], &live_out[idx], &kill_sets[idx]);
        }
    }

    // A non-parameter value live into the entry block is used before any
    // definition reaches it.
    let mut entry_in = live_in[0].clone();
    for p in &func.params {
        entry_in.remove(p.0 as usize);
    }
    if let Some(i) = entry_in.first_set() {
        return Err(JitError::UseBeforeDef { vreg: i as u32 });
    }

    // Phase 4: extend intervals over blocks the value is live-in/out of,
    // in both directions (back-edges can place a use before the def in
    // program-point order).
    for idx in 0..num_blocks {
        let (start, end) = (block_start[idx], block_end[idx]);
        let mut extend = |i: usize| {
            if start < def_point[i] {
                def_point[i] = start;
            }
            if last_use[i] == u32::MAX || end > last_use[i] {
                last_use[i] = end;
            }
        };
        live_in[idx].for_each(&mut extend);
        live_out[idx].for_each(&mut extend);
    }

    // Phase 5: build and sort.
    let mut intervals = Vec::new();
    for i in 0..num_vregs {
        let start = def_point[i];
        if start == u32::MAX {
            continue;
        }
        let end = if last_use[i] == u32::MAX {
            start
        } else {
            last_use[i].max(start)
        };
        intervals.push(LiveInterval {
            start,
            end,
            vreg: VReg(i as u32),
        });
    }
    intervals.sort_unstable_by_key(|iv| iv.start);

    Ok(Liveness {
        intervals,
        num_points,
        call_points,
    })
}

fn points_in(func: &Func) -> u32 {
    func.blocks
        .iter()
        .map(|b| b.insts.len() as u32 + 1)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::func::{BinOp, CallTarget, Cond, Term};

    fn interval(l: &Liveness, v: VReg) -> LiveInterval {
        *l.intervals.iter().find(|iv| iv.vreg == v).unwrap()
    }

    #[test]
    fn straight_line_intervals() {
        // v0 = 1; v1 = 2; v2 = v0 + v1; ret v2
        let mut f = Func::new("f", 0);
        let e = f.entry();
        let (a, b, c) = (f.new_vreg(), f.new_vreg(), f.new_vreg());
        f.push(e, Inst::Const { dst: a, value: 1 });
        f.push(e, Inst::Const { dst: b, value: 2 });
        f.push(e, Inst::Bin { op: BinOp::Add, dst: c, lhs: a, rhs: b });
        f.set_term(e, Term::Ret(Some(c)));

        let l = compute(&f).unwrap();
        assert_eq!(l.num_points, 4);
        assert_eq!(interval(&l, a), LiveInterval { start: 0, end: 2, vreg: a });
        assert_eq!(interval(&l, b), LiveInterval { start: 1, end: 2, vreg: b });
        assert_eq!(interval(&l, c), LiveInterval { start: 2, end: 3, vreg: c });
    }

    #[test]
    fn loop_extends_interval_over_back_edge() {
        // entry: v1 = 0; jmp head
        // head:  branch v1 < v0 ? body : exit
        // body:  v1 = v1 + v2(=1); jmp head
        // exit:  ret v1
        let mut f = Func::new("f", 1);
        let n = f.param(0);
        let e = f.entry();
        let head = f.new_block();
        let body = f.new_block();
        let exit = f.new_block();
        let i = f.new_vreg();
        let one = f.new_vreg();
        f.push(e, Inst::Const { dst: i, value: 0 });
        f.push(e, Inst::Const { dst: one, value: 1 });
        f.set_term(e, Term::Jump(head));
        f.set_term(
            head,
            Term::Branch { cond: Cond::Lt, lhs: i, rhs: n, then_block: body, else_block: exit },
        );
        f.push(body, Inst::Bin { op: BinOp::Add, dst: i, lhs: i, rhs: one });
        f.set_term(body, Term::Jump(head));
        f.set_term(exit, Term::Ret(Some(i)));

        let l = compute(&f).unwrap();
        // `one` is defined at point 1 and used in the loop body; it must
        // stay live through the whole loop (head ∪ body).
        let one_iv = interval(&l, one);
        let body_end = 5; // points: e=0,1,2(term); head=3(term); body=4,5(term); exit=6
        assert!(one_iv.end >= body_end);
        // The induction variable is live from its def through the exit use.
        let i_iv = interval(&l, i);
        assert_eq!(i_iv.start, 0);
        assert_eq!(i_iv.end, 6);
    }

    #[test]
    fn call_points_recorded() {
        let mut f = Func::new("f", 0);
        let e = f.entry();
        let v = f.new_vreg();
        f.push(e, Inst::Const { dst: v, value: 1 });
        f.push(e, Inst::Call { target: CallTarget::Addr(0x1000), args: alloc::vec![], ret: None });
        let dst = f.new_vreg();
        f.push(e, Inst::Copy { dst, src: v });
        f.set_term(e, Term::Ret(None));
        let l = compute(&f).unwrap();
        assert_eq!(l.call_points, [1]);
        assert!(interval(&l, v).crosses(1));
    }

    #[test]
    fn use_before_def_detected() {
        let mut f = Func::new("f", 0);
        let e = f.entry();
        let v = VReg(0);
        f.vreg_count = 1;
        f.set_term(e, Term::Ret(Some(v)));
        assert_eq!(compute(&f).unwrap_err(), JitError::UseBeforeDef { vreg: 0 });
    }

    #[test]
    fn params_are_defined_on_entry() {
        let mut f = Func::new("f", 1);
        let e = f.entry();
        f.set_term(e, Term::Ret(Some(f.param(0))));
        let l = compute(&f).unwrap();
        assert_eq!(interval(&l, f.param(0)), LiveInterval { start: 0, end: 0, vreg: f.param(0) });
    }

    #[test]
    fn conditional_def_still_flags_unreached_path() {
        // entry: branch v0 ? a : b; a: v1 = 1; jmp b; b: ret v1
        // v1 is live-in at b on the path entry→b with no def.
        let mut f = Func::new("f", 1);
        let p = f.param(0);
        let zero = f.new_vreg();
        let e = f.entry();
        let a = f.new_block();
        let b = f.new_block();
        let v1 = f.new_vreg();
        f.push(e, Inst::Const { dst: zero, value: 0 });
        f.set_term(
            e,
            Term::Branch { cond: Cond::Ne, lhs: p, rhs: zero, then_block: a, else_block: b },
        );
        f.push(a, Inst::Const { dst: v1, value: 1 });
        f.set_term(a, Term::Jump(b));
        f.set_term(b, Term::Ret(Some(v1)));
        assert_eq!(
            compute(&f).unwrap_err(),
            JitError::UseBeforeDef { vreg: v1.index() }
        );
    }
}
