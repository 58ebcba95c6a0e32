use crate::experiment::ChainGeometry;
use crate::util::{gcd, Rng};

/// Multipliers for the page and line permutations: odd primes without the
/// Mersenne primes (3, 7, 31, 127), which would give short cycles modulo
/// powers of two.
pub const PRIME_TABLE: [usize; 29] = [
    5, 11, 13, 17, 19, 23, 37, 41, 43, 47, 53, 61, 71, 73, 79, 83, 89, 97, 101, 103, 109, 113, 131,
    137, 139, 149, 151, 157, 163,
];

/// `i -> (factor * i + offset) mod modulus`, a bijection on `0..modulus`
/// whenever `factor` and `modulus` are coprime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permutation {
    factor: usize,
    offset: usize,
    modulus: usize,
}

impl Permutation {
    pub fn new(factor: usize, offset: usize, modulus: usize) -> Self {
        Permutation {
            factor,
            offset,
            modulus,
        }
    }

    /// Draws a factor coprime to `modulus` from [`PRIME_TABLE`] and a random
    /// offset. Falls back to factor 1 if no table entry qualifies.
    pub fn draw(modulus: usize, rng: &mut Rng) -> Self {
        let factors: Vec<usize> = PRIME_TABLE
            .iter()
            .copied()
            .filter(|&p| gcd(p, modulus) == 1)
            .collect();
        let factor = if factors.is_empty() {
            1
        } else {
            factors[rng.below(factors.len())]
        };
        Permutation::new(factor, rng.below(modulus), modulus)
    }

    pub fn apply(&self, i: usize) -> usize {
        (self.factor * i + self.offset) % self.modulus
    }
}

/// Two-level random traversal: pages in permuted order, and within each
/// page its lines in an independently permuted order. Yields the first link
/// slot of each visited line.
pub struct RandomSlots<'a> {
    geometry: ChainGeometry,
    rng: &'a mut Rng,
    pages: Permutation,
    lines: Permutation,
    page: usize,
    line: usize,
}

impl<'a> RandomSlots<'a> {
    pub fn new(geometry: &ChainGeometry, rng: &'a mut Rng) -> Self {
        let pages = Permutation::draw(geometry.pages_per_chain, rng);
        let lines = Permutation::draw(geometry.lines_per_page, rng);
        RandomSlots {
            geometry: *geometry,
            rng,
            pages,
            lines,
            page: 0,
            line: 0,
        }
    }
}

impl Iterator for RandomSlots<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let g = &self.geometry;
        if self.page == g.pages_per_chain {
            return None;
        }
        let page = self.pages.apply(self.page);
        let line = self.lines.apply(self.line);
        let slot = page * g.links_per_page + line * g.links_per_line;

        self.line += 1;
        if self.line == g.lines_per_page {
            self.line = 0;
            self.page += 1;
            if self.page < g.pages_per_chain {
                self.lines = Permutation::draw(g.lines_per_page, self.rng);
            }
        }
        Some(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let g = &self.geometry;
        let left = (g.pages_per_chain - self.page) * g.lines_per_page - self.line;
        (left, Some(left))
    }
}
