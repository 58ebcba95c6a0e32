use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ChaseLoop;
use crate::chain::Link;
use crate::util::MAX_CHAINS;

/// Counts final cursors that turned out null. Never expected to move; it only
/// gives the optimiser a use for the chased values.
static NULL_CURSORS: AtomicU64 = AtomicU64::new(0);

#[inline(always)]
fn mem_check(link: *const Link) {
    if black_box(link).is_null() {
        NULL_CURSORS.fetch_add(1, Ordering::Relaxed);
    }
}

/// One lap over `N` chains. `N` is a constant so the cursor array stays in
/// registers and the inner loop is fully unrolled.
#[inline(never)]
unsafe fn lap_n<const N: usize>(heads: &[*const Link]) -> u64 {
    let mut cursors: [*const Link; N] = std::array::from_fn(|i| heads[i]);
    let head = cursors[0];
    let mut steps = 0;
    loop {
        for cursor in cursors.iter_mut() {
            *cursor = (**cursor).next;
        }
        steps += 1;
        if cursors[0] == head {
            break;
        }
    }
    for cursor in cursors {
        mem_check(cursor);
    }
    steps
}

macro_rules! lap {
    ($heads:expr, $chains:expr, [$($n:literal),+]) => {
        match $chains {
            $($n => lap_n::<$n>($heads),)+
            _ => unreachable!("chain count checked on construction"),
        }
    };
}

/// The portable chase loop, available for 1 to `MAX_CHAINS` chains.
#[derive(Debug, Clone, Copy)]
pub struct GenericChase {
    chains: usize,
}

impl GenericChase {
    pub fn new(chains: usize) -> Self {
        assert!(
            (1..=MAX_CHAINS).contains(&chains),
            "GenericChase supports 1 to {} chains, got {}",
            MAX_CHAINS,
            chains
        );
        GenericChase { chains }
    }
}

impl ChaseLoop for GenericChase {
    fn name(&self) -> &'static str {
        "generic"
    }

    unsafe fn lap(&self, heads: &[*const Link]) -> u64 {
        debug_assert_eq!(heads.len(), self.chains);
        lap!(heads, self.chains, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16])
    }
}

#[cfg(test)]
mod tests {
    use super::GenericChase;
    use crate::chase::tests::{check_equivalence, make_chains};
    use crate::chase::ChaseLoop;
    use crate::util::MAX_CHAINS;

    #[test]
    fn test_steps_match_chain_length() {
        for chains in 1..=MAX_CHAINS {
            check_equivalence(&GenericChase::new(chains), chains);
        }
    }

    #[test]
    fn test_lap_returns_to_heads() {
        let (_memory, roots) = make_chains(3, 64);
        let heads: Vec<_> = roots.iter().map(|r| r.root).collect();
        let chase = GenericChase::new(3);
        assert_eq!(unsafe { chase.lap(&heads) }, 64);
        assert_eq!(unsafe { chase.lap(&heads) }, 64);
    }

    #[test]
    #[should_panic]
    fn test_rejects_too_many_chains() {
        GenericChase::new(MAX_CHAINS + 1);
    }
}
