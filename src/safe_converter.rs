//! Conversions between the wire's `u16` payload lengths and `usize`.

/// Widening casts that cannot fail on any supported platform
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where the value was checked against the MTU before, and the MTU is
///  bounded by `u16::MAX` when the link is configured.
/// NB: The implementations panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: the length should have been checked against the MTU")
    }
}
