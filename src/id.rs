use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One element of a position identifier: a digit paired with the site that
/// minted it. Sites break ties between equal digits, so two replicas can
/// never produce the same identifier for concurrent inserts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Id {
    #[serde(rename = "value")]
    pub digit: u64,
    #[serde(rename = "siteId")]
    pub site: u32,
}

impl Id {
    pub fn new(digit: u64, site: u32) -> Self {
        Id { digit, site }
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.digit < other.digit {
            Ordering::Less
        } else if self.digit > other.digit {
            Ordering::Greater
        } else if self.site < other.site {
            Ordering::Less
        } else if self.site > other.site {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::Id;

    #[test]
    fn test_order_by_digit_then_site() {
        assert!(Id::new(1, 5) < Id::new(2, 1));
        assert!(Id::new(3, 1) < Id::new(3, 2));
        assert!(Id::new(4, 2) == Id::new(4, 2));
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_string(&Id::new(7, 2)).unwrap();
        assert_eq!(json, r#"{"value":7,"siteId":2}"#);
    }
}
