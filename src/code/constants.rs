use crate::code::CodeObject;
use indexmap::IndexSet;
use num_bigint::BigInt;
use num_traits::Zero;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Compile-time constant value
///
/// Equality (and hashing) is keyed on both the type and the value: `1`, `1.0` and `True` are all
/// distinct constants, as are `0.0` and `-0.0` (floats are compared by their bits). Nested code
/// objects compare by identity.
#[derive(Clone, Debug)]
pub enum Constant {
    None,
    Ellipsis,
    Bool(bool),
    Int(BigInt),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Constant>),

    /// Elements are unique and kept in insertion order
    FrozenSet(Vec<Constant>),

    /// Independently assembled nested unit (function body, class body, ...)
    Code(Rc<CodeObject>),
}

impl Constant {
    pub fn int(value: impl Into<BigInt>) -> Constant {
        Constant::Int(value.into())
    }

    pub fn str(value: &str) -> Constant {
        Constant::Str(value.to_owned())
    }

    /// Truthiness of the value, as a conditional jump would test it
    pub fn is_truthy(&self) -> bool {
        match self {
            Constant::None => false,
            Constant::Ellipsis => true,
            Constant::Bool(b) => *b,
            Constant::Int(i) => !i.is_zero(),
            Constant::Float(f) => *f != 0.0,
            Constant::Str(s) => !s.is_empty(),
            Constant::Bytes(b) => !b.is_empty(),
            Constant::Tuple(elems) | Constant::FrozenSet(elems) => !elems.is_empty(),
            Constant::Code(_) => true,
        }
    }

    /// Build a frozen set, dropping duplicate elements
    pub fn frozenset(elems: impl IntoIterator<Item = Constant>) -> Constant {
        let unique: IndexSet<Constant> = elems.into_iter().collect();
        Constant::FrozenSet(unique.into_iter().collect())
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::None, Constant::None) => true,
            (Constant::Ellipsis, Constant::Ellipsis) => true,
            (Constant::Bool(b1), Constant::Bool(b2)) => b1 == b2,
            (Constant::Int(i1), Constant::Int(i2)) => i1 == i2,
            (Constant::Float(f1), Constant::Float(f2)) => f1.to_bits() == f2.to_bits(),
            (Constant::Str(s1), Constant::Str(s2)) => s1 == s2,
            (Constant::Bytes(b1), Constant::Bytes(b2)) => b1 == b2,
            (Constant::Tuple(t1), Constant::Tuple(t2)) => t1 == t2,
            (Constant::FrozenSet(s1), Constant::FrozenSet(s2)) => s1 == s2,
            (Constant::Code(c1), Constant::Code(c2)) => Rc::ptr_eq(c1, c2),
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Constant::None | Constant::Ellipsis => (),
            Constant::Bool(b) => b.hash(state),
            Constant::Int(i) => i.hash(state),
            Constant::Float(f) => f.to_bits().hash(state),
            Constant::Str(s) => s.hash(state),
            Constant::Bytes(b) => b.hash(state),
            Constant::Tuple(elems) | Constant::FrozenSet(elems) => elems.hash(state),
            Constant::Code(code) => (Rc::as_ptr(code) as usize).hash(state),
        }
    }
}

/// Constant pool builder
///
/// Constants are de-duplicated and numbered in order of first use.
#[derive(Debug, Default)]
pub struct ConstantPool {
    constants: IndexSet<Constant>,
}

impl ConstantPool {
    pub fn new() -> ConstantPool {
        ConstantPool {
            constants: IndexSet::new(),
        }
    }

    /// Pool holding an existing constant table, with every constant keeping its index
    ///
    /// Returns `None` if the table has duplicates, since those cannot keep their indices.
    pub(crate) fn from_constants(constants: Vec<Constant>) -> Option<ConstantPool> {
        let len = constants.len();
        let constants: IndexSet<Constant> = constants.into_iter().collect();
        if constants.len() != len {
            return None;
        }
        Some(ConstantPool { constants })
    }

    /// Index of the constant, inserting it if it isn't already in the pool
    pub fn get_or_insert(&mut self, constant: Constant) -> usize {
        self.constants.insert_full(constant).0
    }

    pub fn index_of(&self, constant: &Constant) -> Option<usize> {
        self.constants.get_index_of(constant)
    }

    pub fn get(&self, index: usize) -> Option<&Constant> {
        self.constants.get_index(index)
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn into_vec(self) -> Vec<Constant> {
        self.constants.into_iter().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_is_keyed_on_type_and_value() {
        let mut pool = ConstantPool::new();
        assert_eq!(pool.get_or_insert(Constant::int(1)), 0);
        assert_eq!(pool.get_or_insert(Constant::Float(1.0)), 1);
        assert_eq!(pool.get_or_insert(Constant::Bool(true)), 2);
        assert_eq!(pool.get_or_insert(Constant::Float(0.0)), 3);
        assert_eq!(pool.get_or_insert(Constant::Float(-0.0)), 4);
        assert_eq!(pool.get_or_insert(Constant::int(1)), 0);
        assert_eq!(pool.get_or_insert(Constant::Float(1.0)), 1);
        assert_eq!(pool.len(), 5);
        assert_eq!(pool.index_of(&Constant::Bool(true)), Some(2));
        assert_eq!(pool.index_of(&Constant::Bool(false)), None);
        assert_eq!(pool.get(4), Some(&Constant::Float(-0.0)));
    }

    #[test]
    fn existing_tables_keep_their_indices() {
        let mut pool =
            ConstantPool::from_constants(vec![Constant::None, Constant::int(7)]).unwrap();
        assert_eq!(pool.index_of(&Constant::int(7)), Some(1));
        assert_eq!(pool.get_or_insert(Constant::int(8)), 2);
        assert!(ConstantPool::from_constants(vec![Constant::int(7), Constant::int(7)]).is_none());
    }

    #[test]
    fn nested_values() {
        let mut pool = ConstantPool::new();
        let tuple = Constant::Tuple(vec![Constant::int(1), Constant::str("a")]);
        let idx = pool.get_or_insert(tuple.clone());
        assert_eq!(pool.get_or_insert(Constant::None), idx + 1);
        assert_eq!(pool.get_or_insert(tuple), idx);
        assert_eq!(
            pool.into_vec(),
            vec![
                Constant::Tuple(vec![Constant::int(1), Constant::str("a")]),
                Constant::None,
            ]
        );
    }

    #[test]
    fn truthiness() {
        assert!(!Constant::None.is_truthy());
        assert!(!Constant::int(0).is_truthy());
        assert!(Constant::int(-3).is_truthy());
        assert!(!Constant::Float(-0.0).is_truthy());
        assert!(!Constant::Tuple(vec![]).is_truthy());
        assert!(Constant::str("x").is_truthy());
        assert!(Constant::Ellipsis.is_truthy());
    }

    #[test]
    fn frozensets_drop_duplicates() {
        assert_eq!(
            Constant::frozenset(vec![Constant::int(2), Constant::int(1), Constant::int(2)]),
            Constant::FrozenSet(vec![Constant::int(2), Constant::int(1)])
        );
    }
}
