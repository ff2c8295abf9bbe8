pub struct Settings {
    /// Number of peephole optimizer passes to run after assembly
    ///
    /// Passes stop early once one of them doesn't change anything. `0` disables the optimizer.
    pub peephole_passes: usize,

    /// Limits on the size of values produced by constant folding
    pub fold_limits: FoldLimits,

    /// Append `LOAD_CONST None; RETURN_VALUE` when execution can fall off the end of the code
    ///
    /// When this is off, falling off the end is an error.
    pub implicit_return: bool,
}

impl Settings {
    pub fn new() -> Settings {
        Settings {
            peephole_passes: 1,
            fold_limits: FoldLimits::default(),
            implicit_return: true,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

/// Ceilings past which constant folding declines to produce a value
///
/// These exist to bound the time and memory the compiler spends folding expressions such as
/// `2 ** 10000000` or `"x" * 10 ** 9`, which are better left to run time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FoldLimits {
    /// Most bits in a folded integer
    pub max_int_bits: u64,

    /// Most elements in a folded tuple or frozen set
    pub max_collection_size: usize,

    /// Most characters (or bytes) in a folded string
    pub max_str_size: usize,

    /// Most elements in a folded collection, counting nested elements
    pub max_total_items: usize,
}

impl Default for FoldLimits {
    fn default() -> Self {
        FoldLimits {
            max_int_bits: 128,
            max_collection_size: 256,
            max_str_size: 4096,
            max_total_items: 1024,
        }
    }
}
