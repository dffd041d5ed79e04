//! Participant selection for retried attempts.
//!
//! Both selectors take the seat list of the ready members (one operator
//! address per seat, operators may repeat) and return the seats that stay in
//! the attempt. Results depend only on the inputs, the run seed and the retry
//! counter.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::group::seat_counts;
use crate::rng::SelectionRng;
use crate::types::OperatorAddress;

/// Pick the smallest set of whole operators reaching `required_seats` for a
/// signing retry.
///
/// Operators are shuffled with `seed + retry_count` and accepted in order
/// until their seats cover `required_seats`. The returned list keeps the
/// order of `group_members`.
pub fn evaluate_retry_participants_for_signing(
    group_members: &[OperatorAddress],
    seed: i64,
    retry_count: u64,
    required_seats: usize,
) -> Result<Vec<OperatorAddress>> {
    ensure_enough_seats(group_members, required_seats)?;
    let seats = seat_counts(group_members);

    let mut operators: Vec<&OperatorAddress> = seats.keys().copied().collect();
    let mut rng = SelectionRng::new(seed.wrapping_add(retry_count as i64));
    rng.shuffle(&mut operators);

    let mut seat_count = 0;
    let mut accepted = BTreeSet::new();
    for operator in operators {
        if seat_count >= required_seats {
            break;
        }
        seat_count += seats[operator];
        accepted.insert(operator);
    }

    Ok(group_members
        .iter()
        .filter(|operator| accepted.contains(operator))
        .cloned()
        .collect())
}

/// Drop whole operators from a key generation retry while keeping at least
/// `required_seats` seats.
///
/// Candidates are single operators, then pairs, then triplets. Within the
/// first category that has more than the remaining retry count candidates,
/// the candidate list is shuffled with `seed` and `retry_count` picks the one
/// to exclude.
pub fn evaluate_retry_participants_for_key_generation(
    group_members: &[OperatorAddress],
    seed: i64,
    retry_count: u64,
    required_seats: usize,
) -> Result<Vec<OperatorAddress>> {
    ensure_enough_seats(group_members, required_seats)?;
    let seats = seat_counts(group_members);
    let mut rng = SelectionRng::new(seed);

    let remaining_after = |excluded: &[&OperatorAddress]| -> usize {
        let removed: usize = excluded.iter().map(|operator| seats[*operator]).sum();
        group_members.len().saturating_sub(removed)
    };

    let operators: Vec<&OperatorAddress> = seats
        .keys()
        .copied()
        .filter(|operator| remaining_after(&[*operator]) >= required_seats)
        .collect();

    let mut remaining = retry_count;
    for size in 1..=3 {
        let mut candidates = exclusion_candidates(&operators, size, |candidate| {
            remaining_after(candidate) >= required_seats
        });
        let count = candidates.len() as u64;
        if remaining < count {
            rng.shuffle(&mut candidates);
            let excluded: BTreeSet<&OperatorAddress> =
                candidates[remaining as usize].iter().copied().collect();
            return Ok(group_members
                .iter()
                .filter(|operator| !excluded.contains(operator))
                .cloned()
                .collect());
        }
        remaining -= count;
    }

    Err(Error::RetryExhausted {
        retry_count,
        remaining,
    })
}

fn ensure_enough_seats(group_members: &[OperatorAddress], required_seats: usize) -> Result<()> {
    if required_seats > group_members.len() {
        return Err(Error::TooManySeats {
            requested: required_seats,
            available: group_members.len(),
        });
    }
    Ok(())
}

/// Every `size`-combination of `operators` (in lexicographic index order)
/// accepted by `keep`, which sees all operators of the combination.
fn exclusion_candidates<'a>(
    operators: &[&'a OperatorAddress],
    size: usize,
    keep: impl Fn(&[&'a OperatorAddress]) -> bool,
) -> Vec<Vec<&'a OperatorAddress>> {
    let n = operators.len();
    let mut candidates = Vec::new();
    match size {
        1 => candidates.extend(operators.iter().map(|operator| vec![*operator])),
        2 => {
            for i in 0..n {
                for j in i + 1..n {
                    candidates.push(vec![operators[i], operators[j]]);
                }
            }
        }
        3 => {
            for i in 0..n {
                for j in i + 1..n {
                    for k in j + 1..n {
                        candidates.push(vec![operators[i], operators[j], operators[k]]);
                    }
                }
            }
        }
        _ => {}
    }
    candidates.retain(|candidate| keep(candidate.as_slice()));
    candidates
}
