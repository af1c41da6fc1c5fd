/*
 * A handful of small helper macros: cut down on boilerplate at call sites
 * without hiding control flow behind a proc-macro crate we have no other
 * use for.
 */

/// `sizeof!(T)` as a `usize` constant expression, for byte-offset arithmetic
/// over on-disk fixed-width fields.
macro_rules! sizeof {
    ($t:ty) => {
        ::core::mem::size_of::<$t>()
    };
}

/// Bail out of the current function with `Err(Error::Corrupt)` if a condition
/// doesn't hold; used at rbyd/mdir validation points where "this precondition
/// failing means the on-disk bytes are bad", as opposed to a `debug_assert!`
/// for "this precondition failing means *our* code is bad".
macro_rules! corrupt_unless {
    ($cond:expr) => {
        if !($cond) {
            return Err($crate::error::Error::Corrupt);
        }
    };
}

pub(crate) use corrupt_unless;
pub(crate) use sizeof;
