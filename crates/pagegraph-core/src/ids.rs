use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Symbols of the base-31 id scheme, in ascending order. No vowels.
pub const ID_ALPHABET: &str = "0123456789bcdfghjklmnpqrstvwxyz";

/// Identifier shared by pages, users, marks and domains.
///
/// The wrapper does not validate on construction: rows read from a store are
/// taken as-is, and the registry refuses ids that fail [`Id::is_valid`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns `Some` only for ids that name an entity.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if Self::is_valid_str(raw) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    /// A valid id is non-empty and starts with a digit in `1..=9`. Both `""`
    /// and `"0"` mean "unset".
    #[must_use]
    pub fn is_valid_str(raw: &str) -> bool {
        matches!(raw.as_bytes().first(), Some(b'1'..=b'9'))
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        Self::is_valid_str(&self.0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self(value)
    }
}

fn digit_of(ch: char) -> Option<usize> {
    ID_ALPHABET.chars().position(|candidate| candidate == ch)
}

fn symbol_at(index: usize) -> char {
    ID_ALPHABET.chars().nth(index).unwrap_or('0')
}

/// Orders ids the way the allocator counts: a longer id is always larger, ids
/// of equal length compare symbol by symbol.
#[must_use]
pub fn compare_ids(lhs: &Id, rhs: &Id) -> Ordering {
    lhs.0.len().cmp(&rhs.0.len()).then_with(|| lhs.0.cmp(&rhs.0))
}

/// Compute the id that follows `current_max`, or `"1"` when nothing has been
/// allocated yet.
///
/// # Errors
/// Returns [`GraphError::Validation`] when `current_max` is not a valid id or
/// contains symbols outside [`ID_ALPHABET`].
pub fn next_id(current_max: Option<&Id>) -> Result<Id, GraphError> {
    let Some(current) = current_max else {
        return Ok(Id::new("1"));
    };
    if !current.is_valid() {
        return Err(GraphError::Validation(format!(
            "cannot increment invalid id `{current}`"
        )));
    }

    let mut digits = Vec::with_capacity(current.0.len() + 1);
    for ch in current.0.chars() {
        let digit = digit_of(ch).ok_or_else(|| {
            GraphError::Validation(format!("id `{current}` contains `{ch}` outside the id alphabet"))
        })?;
        digits.push(digit);
    }

    let top = ID_ALPHABET.len() - 1;
    let mut carry = true;
    for position in (0..digits.len()).rev() {
        if !carry {
            break;
        }
        // The leading symbol is restricted to decimal digits.
        let limit = if position == 0 { 9 } else { top };
        if digits[position] == limit {
            digits[position] = 0;
        } else {
            digits[position] += 1;
            carry = false;
        }
    }
    if carry {
        digits.insert(0, 1);
    }

    Ok(Id(digits.into_iter().map(symbol_at).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next(raw: &str) -> String {
        match next_id(Some(&Id::new(raw))) {
            Ok(id) => id.0,
            Err(err) => panic!("next_id({raw}) failed: {err}"),
        }
    }

    #[test]
    fn validity_requires_leading_non_zero_digit() {
        assert!(Id::is_valid_str("1"));
        assert!(Id::is_valid_str("5k"));
        assert!(Id::is_valid_str("2a"));
        assert!(!Id::is_valid_str(""));
        assert!(!Id::is_valid_str("0"));
        assert!(!Id::is_valid_str("07"));
        assert!(!Id::is_valid_str("k5"));
        assert!(Id::parse("0").is_none());
    }

    #[test]
    fn alphabet_has_thirty_one_vowel_free_symbols() {
        assert_eq!(ID_ALPHABET.len(), 31);
        assert!(!ID_ALPHABET.chars().any(|ch| "aeiou".contains(ch)));
    }

    #[test]
    fn increments_rightmost_symbol() {
        assert_eq!(next("1"), "2");
        assert_eq!(next("5k"), "5l");
        assert_eq!(next("19"), "1b");
        assert_eq!(next("1y"), "1z");
    }

    #[test]
    fn carries_into_leading_digit_and_grows() {
        assert_eq!(next("1z"), "20");
        assert_eq!(next("8zz"), "900");
        assert_eq!(next("9"), "10");
        assert_eq!(next("9z"), "100");
        assert_eq!(next("9zz"), "1000");
    }

    #[test]
    fn empty_store_starts_at_one() -> Result<(), GraphError> {
        assert_eq!(next_id(None)?.as_str(), "1");
        Ok(())
    }

    #[test]
    fn rejects_ids_outside_alphabet() {
        assert!(next_id(Some(&Id::new("2a"))).is_err());
        assert!(next_id(Some(&Id::new("0"))).is_err());
    }

    #[test]
    fn compare_prefers_length_then_alphabet() {
        assert_eq!(compare_ids(&Id::new("z"), &Id::new("10")), Ordering::Less);
        assert_eq!(compare_ids(&Id::new("1b"), &Id::new("19")), Ordering::Greater);
        assert_eq!(compare_ids(&Id::new("5k"), &Id::new("5k")), Ordering::Equal);
    }

    #[test]
    fn successive_ids_strictly_increase() -> Result<(), GraphError> {
        let mut current = next_id(None)?;
        for _ in 0..2_000 {
            let following = next_id(Some(&current))?;
            assert_eq!(compare_ids(&current, &following), Ordering::Less);
            current = following;
        }
        Ok(())
    }
}
