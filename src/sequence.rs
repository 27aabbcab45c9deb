use crate::id::Id;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::cmp::{max, min, Ordering};

pub const DIGIT_MIN: u64 = 0;
pub const DIGIT_MAX: u64 = u64::MAX;

/// Cap on how far above the left neighbour a fresh digit may land. Without
/// it a run of appends halves the remaining digit space on every character.
const BOUNDARY: u64 = 1 << 20;

/// The variable-length position identifier that totally orders characters
/// in a document. Sequences are non-empty and no two characters in the same
/// document may share one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Sequence(pub Vec<Id>);

impl Ord for Sequence {
    fn cmp(&self, other: &Self) -> Ordering {
        let (len1, len2) = (self.0.len(), other.0.len());

        for i in 0..min(len1, len2) {
            let ord = self.0[i].cmp(&other.0[i]);
            if ord != Ordering::Equal {
                return ord;
            }
        }

        len1.cmp(&len2)
    }
}

impl PartialOrd for Sequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Idx> std::ops::Index<Idx> for Sequence
where
    Idx: std::slice::SliceIndex<[Id]>,
{
    type Output = Idx::Output;

    fn index(&self, index: Idx) -> &Self::Output {
        &self.0[index]
    }
}

impl Sequence {
    pub fn new(ids: &[Id]) -> Self {
        Self(ids.to_vec())
    }

    /// Creates a new sequence strictly between `before` and `after` based on
    /// the following cases. An empty slice stands for the virtual document
    /// boundary on that side.
    /// # Case 1: Digits differ by exactly 1
    /// In this case, we can't find an integer that lies between the two digits.
    /// Therefore, we must continue onto the next `Id`.
    /// ```text
    ///   prev  (0.1311) : [1,1] -> *[3,1]* -> [1,1] -> [1,1] -> ..
    ///   next  (0.1411) : [1,1] -> *[4,1]* -> [1,1] -> [1,1] -> ..
    /// ```
    /// # Case 2: Digits differ by more than 1
    /// We can create a new identifier between the two digits.
    /// Note that the length of `between` will not be larger than `prev` or
    /// `next` in this case.
    /// ```text
    ///   prev  (0.1359) : [1,1] -> *[3,1]* -> [5,3] -> [9,2]
    ///   next  (0.1610) : [1,1] -> *[6,1]* -> [10,1]
    /// between (0.1500) : [1,1] ->  [5,1]
    /// ```
    /// # Case 3: Same digits, different site
    /// ```text
    ///   prev  (0.13590) : [1,1] -> *[3,1]* -> [5,3] -> [9,2]
    ///   next  (0.13800) : [1,1] -> *[3,3]* -> [8,1]
    /// between (0.13591) : [1,1] ->  [3,1]  -> [5,3] -> [9,2] -> [1,1]
    /// ```
    pub fn between(site: u32, before: &[Id], after: &[Id]) -> Self {
        let (virtual_min, virtual_max) = (Id::new(DIGIT_MIN, site), Id::new(DIGIT_MAX, site));
        let max_len = max(before.len(), after.len());
        let mut new_seq = Vec::new();
        let mut is_same_prefix = true;
        let mut did_change = false;

        for i in 0..max_len {
            let id1 = before.get(i).unwrap_or(&virtual_min);
            let id2 = after
                .get(i)
                .filter(|_| is_same_prefix)
                .unwrap_or(&virtual_max);
            let diff = id2.digit - id1.digit;

            if diff > 1 {
                // A gap exists at this level, so pick a fresh digit inside it.
                new_seq.push(Id::new(Self::random_digit(id1.digit, id2.digit), site));
                did_change = true;
                break;
            } else {
                // Digits differ by at most 1; carry the left id and descend.
                new_seq.push(id1.to_owned());
                is_same_prefix = id1.cmp(id2) == Ordering::Equal;
            }
        }

        if !did_change {
            // Every level differed by at most one, so the carried prefix alone
            // would collide with `before`. Open a new level below it.
            new_seq.push(Id::new(Self::random_digit(DIGIT_MIN, DIGIT_MAX), site));
        }

        Sequence(new_seq)
    }

    /// Uniform digit in the open interval `(lower, upper)`, clamped to at
    /// most `BOUNDARY` above `lower`.
    fn random_digit(lower: u64, upper: u64) -> u64 {
        let ceiling = upper.min(lower.saturating_add(BOUNDARY));
        thread_rng().gen_range(lower + 1..ceiling.max(lower + 2))
    }
}
