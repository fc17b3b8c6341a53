//! Three-valued match results.

/// The result of testing a predicate against a flow.
///
/// `Uncertain` means the flow does not carry the data needed to decide,
/// not that the answer is "maybe".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    False,
    True,
    Uncertain,
}

impl MatchType {
    pub fn from_bool(matched: bool) -> Self {
        if matched {
            MatchType::True
        } else {
            MatchType::False
        }
    }

    /// Conjunction: `False` wins, then `Uncertain`, and `True` only if both
    /// operands are `True`.
    pub fn and(self, other: MatchType) -> MatchType {
        match (self, other) {
            (MatchType::False, _) | (_, MatchType::False) => MatchType::False,
            (MatchType::True, MatchType::True) => MatchType::True,
            _ => MatchType::Uncertain,
        }
    }

    /// Negation. `Uncertain` stays uncertain.
    pub fn negate(self) -> MatchType {
        match self {
            MatchType::True => MatchType::False,
            MatchType::False => MatchType::True,
            MatchType::Uncertain => MatchType::Uncertain,
        }
    }

    /// Fold a sequence of alternatives: `True` if any is `True`, otherwise
    /// `Uncertain` if any is `Uncertain`, otherwise `False`.
    pub fn any(results: impl IntoIterator<Item = MatchType>) -> MatchType {
        let mut out = MatchType::False;
        for r in results {
            match r {
                MatchType::True => return MatchType::True,
                MatchType::Uncertain => out = MatchType::Uncertain,
                MatchType::False => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::MatchType::{self, False, True, Uncertain};

    #[test]
    fn conjunction_table() {
        for (a, b, want) in [
            (True, True, True),
            (True, Uncertain, Uncertain),
            (Uncertain, Uncertain, Uncertain),
            (False, Uncertain, False),
            (Uncertain, False, False),
            (True, False, False),
        ] {
            assert_eq!(a.and(b), want, "{a:?} && {b:?}");
        }
    }

    #[test]
    fn any_prefers_true_then_uncertain() {
        assert_eq!(MatchType::any([False, Uncertain, True]), True);
        assert_eq!(MatchType::any([False, Uncertain]), Uncertain);
        assert_eq!(MatchType::any([False, False]), False);
        assert_eq!(MatchType::any([]), False);
    }
}
