//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Lots, reservations and movements are entities: two values with the same
/// id describe the same real-world thing, even when their other fields differ
/// (e.g. a lot before and after QC).
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
