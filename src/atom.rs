use crate::{id::Id, sequence::Sequence};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// This is the smallest unit of change in a document: one codepoint plus
/// the identifier sequence that fixes its place in the total order. A
/// newline is an ordinary atom; it happens to terminate a line.
///
/// On the wire an atom is `{"value": "<utf8>", "idArray": [...]}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct Atom {
    pub value: char,
    #[serde(rename = "idArray")]
    pub ids: Sequence,
}

impl Ord for Atom {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ids.cmp(&other.ids)
    }
}

impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Atom {
    pub fn new(value: char, ids: Sequence) -> Self {
        Self { value, ids }
    }

    /// Mints an atom ordered strictly between two neighbour sequences.
    /// Empty slices stand for the document boundaries.
    pub fn create(c: char, site: u32, before: &[Id], after: &[Id]) -> Self {
        Self {
            value: c,
            ids: Sequence::between(site, before, after),
        }
    }

    /// The site that owns this atom: the site of the terminal identifier.
    pub fn site(&self) -> Option<u32> {
        self.ids.0.last().map(|id| id.site)
    }

    /// Whether every identifier in the sequence carries the owning site.
    /// A mismatch is tolerated on receipt but worth a warning.
    pub fn site_consistent(&self) -> bool {
        match self.site() {
            Some(site) => self.ids.0.iter().all(|id| id.site == site),
            None => false,
        }
    }

    pub fn is_newline(&self) -> bool {
        self.value == '\n'
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_by_sequence() {
        let a = Atom::new('a', Sequence::new(&[Id::new(2, 1)]));
        let b = Atom::new('b', Sequence::new(&[Id::new(5, 1)]));
        assert!(a < b);
    }

    #[test]
    fn test_wire_shape() {
        let atom = Atom::new('x', Sequence::new(&[Id::new(4, 2)]));
        let json = serde_json::to_string(&atom).unwrap();
        assert_eq!(json, r#"{"value":"x","idArray":[{"value":4,"siteId":2}]}"#);

        let back: Atom = serde_json::from_str(&json).unwrap();
        assert_eq!(back, atom);
    }

    #[test]
    fn test_site_consistency() {
        let good = Atom::new('a', Sequence::new(&[Id::new(1, 2), Id::new(3, 2)]));
        let odd = Atom::new('a', Sequence::new(&[Id::new(1, 1), Id::new(3, 2)]));
        assert!(good.site_consistent());
        assert!(!odd.site_consistent());
        assert_eq!(odd.site(), Some(2));
    }
}
