use std::fmt;

/// Opaque reference to a block of a [`super::FlowGraph`]
///
/// Ids are handed out by the graph in creation order and are only meaningful for the graph that
/// created them.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct BlockId(usize);

impl BlockId {
    pub(crate) fn new(index: usize) -> BlockId {
        BlockId(index)
    }

    /// Position of the block in creation order
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("b{}", self.0))
    }
}
