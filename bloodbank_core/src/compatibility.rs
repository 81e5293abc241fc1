//! Donor/recipient compatibility table.
//!
//! Each recipient group maps to the ordered list of donor groups it may
//! receive from. The recipient's own group always comes first, followed by
//! the substitutes in a fixed priority order.

use crate::BloodGroup::{self, *};
use once_cell::sync::Lazy;

/// Cached default table, built once and shared by every engine
static DEFAULT_TABLE: Lazy<CompatibilityTable> = Lazy::new(CompatibilityTable::build);

/// Get a reference to the shared compatibility table
pub fn get_default_table() -> &'static CompatibilityTable {
    &DEFAULT_TABLE
}

/// Ordered lookup from recipient group to acceptable donor groups
#[derive(Clone, Debug)]
pub struct CompatibilityTable {
    rows: [Vec<BloodGroup>; 8],
}

impl CompatibilityTable {
    fn build() -> Self {
        let mut rows: [Vec<BloodGroup>; 8] = Default::default();
        for recipient in BloodGroup::ALL {
            let donors: &[BloodGroup] = match recipient {
                ONeg => &[ONeg],
                OPos => &[ONeg, OPos],
                ANeg => &[ONeg, ANeg],
                APos => &[ONeg, OPos, ANeg, APos],
                BNeg => &[ONeg, BNeg],
                BPos => &[ONeg, OPos, BNeg, BPos],
                AbNeg => &[ONeg, ANeg, BNeg, AbNeg],
                AbPos => &[ONeg, OPos, ANeg, APos, BNeg, BPos, AbNeg, AbPos],
            };
            // Exact match leads; substitutes keep their table order.
            let mut ordered = Vec::with_capacity(donors.len());
            ordered.push(recipient);
            ordered.extend(donors.iter().copied().filter(|g| *g != recipient));
            rows[recipient.index()] = ordered;
        }
        Self { rows }
    }

    /// Donor groups `requested` may receive, exact match first
    pub fn compatible_donors(&self, requested: BloodGroup) -> &[BloodGroup] {
        &self.rows[requested.index()]
    }

    /// Whether a `requested` recipient may receive `donor` blood
    pub fn allows(&self, requested: BloodGroup, donor: BloodGroup) -> bool {
        self.compatible_donors(requested).contains(&donor)
    }

    /// Check the table's structural rules, returning every violation found
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for recipient in BloodGroup::ALL {
            let row = self.compatible_donors(recipient);

            if row.first() != Some(&recipient) {
                errors.push(format!("{} row does not lead with itself", recipient));
            }
            if !row.contains(&ONeg) {
                errors.push(format!("{} row is missing universal donor O-", recipient));
            }
            let mut seen = row.to_vec();
            seen.sort();
            seen.dedup();
            if seen.len() != row.len() {
                errors.push(format!("{} row lists a donor group twice", recipient));
            }
        }

        if self.compatible_donors(AbPos).len() != BloodGroup::ALL.len() {
            errors.push("AB+ must accept every group".to_string());
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_validates() {
        let errors = get_default_table().validate();
        assert!(
            errors.is_empty(),
            "Default table has validation errors: {:?}",
            errors
        );
    }

    #[test]
    fn test_exact_match_first() {
        let table = get_default_table();
        for g in BloodGroup::ALL {
            assert_eq!(table.compatible_donors(g)[0], g);
        }
    }

    #[test]
    fn test_substitute_order() {
        let table = get_default_table();
        assert_eq!(table.compatible_donors(ONeg), &[ONeg]);
        assert_eq!(table.compatible_donors(APos), &[APos, ONeg, OPos, ANeg]);
        assert_eq!(table.compatible_donors(AbNeg), &[AbNeg, ONeg, ANeg, BNeg]);
        assert_eq!(
            table.compatible_donors(AbPos),
            &[AbPos, ONeg, OPos, ANeg, APos, BNeg, BPos, AbNeg]
        );
    }

    #[test]
    fn test_allows() {
        let table = get_default_table();
        assert!(table.allows(AbPos, ONeg));
        assert!(table.allows(BPos, OPos));
        assert!(!table.allows(ONeg, OPos));
        assert!(!table.allows(ANeg, BNeg));
    }
}
