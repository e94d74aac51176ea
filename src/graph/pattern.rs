use std::fmt;

/// Fusion pattern of an operator, from most to least fusible.
///
/// The order is meaningful: the dominant pattern of a set of nodes is the
/// maximum of their patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatternKind {
    /// Output element depends on the input element at the same index.
    ElementWise,
    /// Input elements are replicated along new or size-one axes.
    Broadcast,
    /// Any other one-to-one index remapping (reshape, transpose).
    Injective,
    /// Output elements combine several input elements along reduced axes.
    Reduce,
    /// Never fused with anything.
    Opaque,
}

impl PatternKind {
    /// Dominant pattern of a set, or `None` for an empty set.
    pub fn dominant(patterns: impl IntoIterator<Item = PatternKind>) -> Option<PatternKind> {
        patterns.into_iter().max()
    }

    /// ElementWise, Broadcast and Injective.
    pub fn is_injective_like(&self) -> bool {
        *self <= PatternKind::Injective
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PatternKind::ElementWise => "elementwise",
            PatternKind::Broadcast => "broadcast",
            PatternKind::Injective => "injective",
            PatternKind::Reduce => "reduce",
            PatternKind::Opaque => "opaque",
        };
        f.write_str(s)
    }
}
