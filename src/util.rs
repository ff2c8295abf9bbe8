use std::ops::Sub;

/// Elements with an encoded width in bytes (eg. instructions, or whole basic blocks)
pub trait Width {
    fn width(&self) -> usize;
}

/// Byte offset into a flattened instruction stream
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Offset(pub usize);

impl Sub for Offset {
    type Output = isize;

    fn sub(self, other: Offset) -> isize {
        (self.0 as isize) - (other.0 as isize)
    }
}

impl<T: Width> Width for [T] {
    fn width(&self) -> usize {
        self.iter().map(Width::width).sum()
    }
}

impl<T: Width> Width for Vec<T> {
    fn width(&self) -> usize {
        self.as_slice().width()
    }
}
