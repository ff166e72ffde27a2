//! Structural sharing: keep the previous value's shared subtrees when they are deeply
//! equal to the incoming ones, so identity checks (`Rc::ptr_eq`) downstream keep working.

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    rc::Rc,
    sync::Arc,
};

/// Merges a freshly fetched value into the previously cached one.
///
/// The default keeps `prev` when it is equal to `next`. Containers recurse into their
/// elements, and `Rc`/`Arc` reuse the previous pointer for every equal subtree.
pub trait StructuralShare: Clone + PartialEq {
    /// Returns `next`, reusing parts of `prev` that are deeply equal.
    fn replace_equal_deep(prev: &Self, next: Self) -> Self {
        if *prev == next {
            prev.clone()
        } else {
            next
        }
    }
}

macro_rules! leaf_share {
    ($($ty:ty),* $(,)?) => {
        $(impl StructuralShare for $ty {})*
    };
}

leaf_share!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    serde_json::Value,
);

impl<T: StructuralShare> StructuralShare for Option<T> {
    fn replace_equal_deep(prev: &Self, next: Self) -> Self {
        match (prev, next) {
            (Some(prev), Some(next)) => Some(T::replace_equal_deep(prev, next)),
            (_, next) => next,
        }
    }
}

impl<T: StructuralShare> StructuralShare for Vec<T> {
    fn replace_equal_deep(prev: &Self, next: Self) -> Self {
        next.into_iter()
            .enumerate()
            .map(|(i, item)| match prev.get(i) {
                Some(prev) => T::replace_equal_deep(prev, item),
                None => item,
            })
            .collect()
    }
}

impl<K, T> StructuralShare for BTreeMap<K, T>
where
    K: Ord + Clone,
    T: StructuralShare,
{
    fn replace_equal_deep(prev: &Self, next: Self) -> Self {
        next.into_iter()
            .map(|(key, item)| {
                let item = match prev.get(&key) {
                    Some(prev) => T::replace_equal_deep(prev, item),
                    None => item,
                };
                (key, item)
            })
            .collect()
    }
}

impl<K, T> StructuralShare for HashMap<K, T>
where
    K: Eq + Hash + Clone,
    T: StructuralShare,
{
    fn replace_equal_deep(prev: &Self, next: Self) -> Self {
        next.into_iter()
            .map(|(key, item)| {
                let item = match prev.get(&key) {
                    Some(prev) => T::replace_equal_deep(prev, item),
                    None => item,
                };
                (key, item)
            })
            .collect()
    }
}

impl<T: StructuralShare> StructuralShare for Rc<T> {
    fn replace_equal_deep(prev: &Self, next: Self) -> Self {
        if Rc::ptr_eq(prev, &next) || **prev == *next {
            return prev.clone();
        }
        let next = Rc::try_unwrap(next).unwrap_or_else(|shared| (*shared).clone());
        Rc::new(T::replace_equal_deep(prev, next))
    }
}

impl<T: StructuralShare> StructuralShare for Arc<T> {
    fn replace_equal_deep(prev: &Self, next: Self) -> Self {
        if Arc::ptr_eq(prev, &next) || **prev == *next {
            return prev.clone();
        }
        let next = Arc::try_unwrap(next).unwrap_or_else(|shared| (*shared).clone());
        Arc::new(T::replace_equal_deep(prev, next))
    }
}

macro_rules! tuple_share {
    ($(($($name:ident : $idx:tt),+)),* $(,)?) => {
        $(
            impl<$($name: StructuralShare),+> StructuralShare for ($($name,)+) {
                fn replace_equal_deep(prev: &Self, next: Self) -> Self {
                    ($($name::replace_equal_deep(&prev.$idx, next.$idx),)+)
                }
            }
        )*
    };
}

tuple_share!((A: 0), (A: 0, B: 1), (A: 0, B: 1, C: 2), (A: 0, B: 1, C: 2, D: 3));
