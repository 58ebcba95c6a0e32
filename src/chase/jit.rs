use iced_x86::code_asm::*;
use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};
use memmap2::{Mmap, MmapMut};

use super::{ChaseLoop, JitError, PrefetchHint};
use crate::chain::{Link, NEXT_OFFSET};

/// Registers holding the chain cursors, in chain order. `rax` counts steps,
/// `rsp` holds the head of chain 0. `rdi` carries the heads pointer and is
/// overwritten last.
const CURSORS: [AsmRegister64; 14] = [
    rcx, rdx, rsi, r8, r9, r10, r11, rbx, rbp, r12, r13, r14, r15, rdi,
];

const CALLEE_SAVED: [AsmRegister64; 6] = [rbx, rbp, r12, r13, r14, r15];

pub const MAX_JIT_CHAINS: usize = CURSORS.len();

type LapFn = unsafe extern "sysv64" fn(heads: *const *const Link) -> u64;

/// A chase loop generated for a fixed number of chains.
pub struct JitChase {
    code: Mmap,
    chains: usize,
}

impl JitChase {
    /// Generates a lap routine over `chains` chains. After every step each
    /// cursor is prefetched with `prefetch`, followed by `loop_length` nops.
    pub fn compile(
        chains: usize,
        prefetch: PrefetchHint,
        loop_length: usize,
    ) -> Result<Self, JitError> {
        if chains == 0 || chains > MAX_JIT_CHAINS {
            return Err(JitError::TooManyChains {
                chains,
                max: MAX_JIT_CHAINS,
            });
        }
        let cursors = &CURSORS[..chains];
        let saved: Vec<AsmRegister64> = CALLEE_SAVED
            .iter()
            .copied()
            .filter(|r| cursors.contains(r))
            .collect();

        let mut a = CodeAssembler::new(64)?;
        for &reg in &saved {
            a.push(reg)?;
        }
        // rdi is the last cursor, so the heads pointer survives all loads
        for (i, &cursor) in cursors.iter().enumerate() {
            a.mov(cursor, qword_ptr(rdi + (i * 8) as i32))?;
        }
        a.push(rcx)?;
        a.xor(rax, rax)?;

        let mut step = a.create_label();
        a.set_label(&mut step)?;
        for &cursor in cursors {
            a.mov(cursor, qword_ptr(cursor + NEXT_OFFSET as i32))?;
            match prefetch {
                PrefetchHint::None => {}
                PrefetchHint::T0 => a.prefetcht0(byte_ptr(cursor))?,
                PrefetchHint::T1 => a.prefetcht1(byte_ptr(cursor))?,
                PrefetchHint::T2 => a.prefetcht2(byte_ptr(cursor))?,
                PrefetchHint::Nta => a.prefetchnta(byte_ptr(cursor))?,
            }
        }
        for _ in 0..loop_length {
            a.nop()?;
        }
        a.add(rax, 1)?;
        a.cmp(rcx, qword_ptr(rsp))?;
        a.jne(step)?;

        a.add(rsp, 8)?;
        for &reg in saved.iter().rev() {
            a.pop(reg)?;
        }
        a.ret()?;

        // only relative branches, the code runs at any address
        let bytes = a.assemble(0)?;
        let mut buffer = MmapMut::map_anon(bytes.len())?;
        buffer[..bytes.len()].copy_from_slice(&bytes);
        let code = buffer.make_exec()?;
        debug!(
            "Generated {} byte chase loop for {} chain(s) at {:p}",
            bytes.len(),
            chains,
            code.as_ptr()
        );
        log_disassembly(&code[..bytes.len()], code.as_ptr() as u64);
        #[cfg(feature = "jitter_dump")]
        dump(&code[..bytes.len()], chains);

        Ok(JitChase { code, chains })
    }
}

impl ChaseLoop for JitChase {
    fn name(&self) -> &'static str {
        "jit"
    }

    unsafe fn lap(&self, heads: &[*const Link]) -> u64 {
        assert_eq!(heads.len(), self.chains, "chain count mismatch");
        let lap: LapFn = std::mem::transmute(self.code.as_ptr());
        lap(heads.as_ptr())
    }
}

fn log_disassembly(code: &[u8], ip: u64) {
    if !log_enabled!(log::Level::Trace) {
        return;
    }
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    let mut line = String::new();
    for instruction in &mut decoder {
        line.clear();
        formatter.format(&instruction, &mut line);
        trace!("{:016x} {}", instruction.ip(), line);
    }
}

#[cfg(feature = "jitter_dump")]
fn dump(code: &[u8], chains: usize) {
    let path = format!("chase_{}.bin", chains);
    match std::fs::write(&path, code) {
        Ok(()) => info!("Wrote chase loop to {}", path),
        Err(e) => warn!("Failed to write {}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::{JitChase, MAX_JIT_CHAINS};
    use crate::chase::tests::{check_equivalence, make_chains};
    use crate::chase::{ChaseLoop, GenericChase, JitError, PrefetchHint};

    #[test]
    fn test_steps_match_chain_length() -> anyhow::Result<()> {
        for chains in 1..=MAX_JIT_CHAINS {
            check_equivalence(&JitChase::compile(chains, PrefetchHint::None, 0)?, chains);
        }
        Ok(())
    }

    #[test]
    fn test_prefetch_and_padding() -> anyhow::Result<()> {
        for hint in [
            PrefetchHint::T0,
            PrefetchHint::T1,
            PrefetchHint::T2,
            PrefetchHint::Nta,
        ] {
            check_equivalence(&JitChase::compile(2, hint, 4)?, 2);
        }
        Ok(())
    }

    #[test]
    fn test_matches_generic() -> anyhow::Result<()> {
        let (_memory, roots) = make_chains(8, 512);
        let heads: Vec<_> = roots.iter().map(|r| r.root).collect();
        let jit = JitChase::compile(8, PrefetchHint::T0, 1)?;
        let generic = GenericChase::new(8);
        assert_eq!(unsafe { jit.chase(&heads, 5) }, unsafe {
            generic.chase(&heads, 5)
        });
        Ok(())
    }

    #[test]
    fn test_rejects_register_overflow() {
        assert!(matches!(
            JitChase::compile(MAX_JIT_CHAINS + 1, PrefetchHint::None, 0),
            Err(JitError::TooManyChains { chains: 15, max: 14 })
        ));
        assert!(JitChase::compile(0, PrefetchHint::None, 0).is_err());
    }
}
