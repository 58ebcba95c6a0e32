mod constants;
mod rng;
mod util;

pub use self::constants::*;
pub use self::rng::{thread_seed, Rng};
pub use self::util::{gcd, init_logging_with_progress, make_vec, named_bar};
