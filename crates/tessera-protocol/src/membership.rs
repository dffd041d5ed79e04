//! Seat membership validation

use tessera_core::{MemberIndex, OperatorAddress};

/// Checks that a message sender really holds the seat it claims
pub trait MembershipValidator: Send + Sync {
    fn is_valid_membership(&self, member: MemberIndex, public_key: &[u8]) -> bool;
}

/// Validator backed by the group's operator roster
#[derive(Debug, Clone)]
pub struct StaticMembershipValidator {
    operators: Vec<OperatorAddress>,
}

impl StaticMembershipValidator {
    /// `operators[i]` holds seat `i + 1`
    pub fn new(operators: Vec<OperatorAddress>) -> Self {
        Self { operators }
    }
}

impl MembershipValidator for StaticMembershipValidator {
    fn is_valid_membership(&self, member: MemberIndex, public_key: &[u8]) -> bool {
        if member.0 == 0 {
            return false;
        }
        self.operators
            .get(member.position())
            .is_some_and(|operator| *operator == OperatorAddress::from_public_key(public_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validates_seat_owner() {
        let alice = b"alice".to_vec();
        let bob = b"bob".to_vec();
        let validator = StaticMembershipValidator::new(vec![
            OperatorAddress::from_public_key(&alice),
            OperatorAddress::from_public_key(&bob),
            OperatorAddress::from_public_key(&alice),
        ]);

        assert!(validator.is_valid_membership(MemberIndex(1), &alice));
        assert!(validator.is_valid_membership(MemberIndex(3), &alice));
        assert!(validator.is_valid_membership(MemberIndex(2), &bob));
        assert!(!validator.is_valid_membership(MemberIndex(2), &alice));
        assert!(!validator.is_valid_membership(MemberIndex(0), &alice));
        assert!(!validator.is_valid_membership(MemberIndex(4), &alice));
    }
}
