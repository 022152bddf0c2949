//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two instrument
/// links carrying the same fields are the same link, whichever snapshot they
/// came from.
///
/// The trait requires:
/// - **Clone**: values are copied into payloads and read models
/// - **PartialEq**: comparison is by attribute values
/// - **Debug**: helpful for logging and test assertions
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
