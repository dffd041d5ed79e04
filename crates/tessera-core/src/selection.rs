//! Excluded seats of an attempt, derived from the ready seats.
//!
//! The operator selectors in [`crate::retry`] work on operators. A selected
//! operator may still hold seats that did not announce readiness, so the
//! excluded list is rebuilt from both the selected operators and the ready
//! seats.

use std::collections::BTreeSet;

use crate::attempt::ProtocolRun;
use crate::error::{Error, Result};
use crate::retry::{
    evaluate_retry_participants_for_key_generation, evaluate_retry_participants_for_signing,
};
use crate::rng::SelectionRng;
use crate::types::{MemberIndex, OperatorAddress};

/// Seats excluded from a signing attempt.
///
/// The included set always has exactly `honest_threshold` seats: when the
/// selected operators hold more ready seats than that, the surplus is picked
/// with a generator seeded by `seed + attempt_number` and excluded too.
pub fn signing_excluded_members(
    run: &ProtocolRun,
    ready: &[MemberIndex],
    attempt_number: u32,
) -> Result<Vec<MemberIndex>> {
    let retry_count = retry_count(attempt_number)?;
    let ready_operators = ready_operators(run, ready)?;
    let qualified: BTreeSet<OperatorAddress> = evaluate_retry_participants_for_signing(
        &ready_operators,
        run.seed(),
        retry_count,
        run.parameters.honest_threshold,
    )?
    .into_iter()
    .collect();

    let (mut included, mut excluded) = partition(run, ready, &qualified);

    let threshold = run.parameters.honest_threshold;
    if included.len() > threshold {
        included.sort();
        let mut rng = SelectionRng::new(run.seed().wrapping_add(i64::from(attempt_number)));
        rng.shuffle(&mut included);
        excluded.extend_from_slice(&included[threshold..]);
        excluded.sort();
    }

    Ok(excluded)
}

/// Seats excluded from a key generation attempt.
///
/// The first attempt keeps every ready seat; later attempts drop single
/// operators, then pairs, then triplets, as long as the group quorum holds.
pub fn key_generation_excluded_members(
    run: &ProtocolRun,
    ready: &[MemberIndex],
    attempt_number: u32,
) -> Result<Vec<MemberIndex>> {
    let retry_count = retry_count(attempt_number)?;
    let ready_operators = ready_operators(run, ready)?;

    let qualified: BTreeSet<OperatorAddress> = if attempt_number == 1 {
        ready_operators.into_iter().collect()
    } else {
        evaluate_retry_participants_for_key_generation(
            &ready_operators,
            run.seed(),
            retry_count,
            run.parameters.group_quorum,
        )?
        .into_iter()
        .collect()
    };

    let (_, excluded) = partition(run, ready, &qualified);
    Ok(excluded)
}

fn retry_count(attempt_number: u32) -> Result<u64> {
    if attempt_number == 0 {
        return Err(Error::InvalidAttempt(attempt_number));
    }
    Ok(u64::from(attempt_number - 1))
}

fn ready_operators(run: &ProtocolRun, ready: &[MemberIndex]) -> Result<Vec<OperatorAddress>> {
    ready
        .iter()
        .map(|member| {
            run.operator_of(*member).cloned().ok_or_else(|| {
                Error::InvalidMemberIndex(format!(
                    "ready member {} is outside the group of {}",
                    member,
                    run.operators.len()
                ))
            })
        })
        .collect()
}

/// Split the group into (included, excluded) seats, both ascending
fn partition(
    run: &ProtocolRun,
    ready: &[MemberIndex],
    qualified: &BTreeSet<OperatorAddress>,
) -> (Vec<MemberIndex>, Vec<MemberIndex>) {
    let ready: BTreeSet<MemberIndex> = ready.iter().copied().collect();
    MemberIndex::all(run.operators.len()).partition(|member| {
        ready.contains(member)
            && run
                .operator_of(*member)
                .is_some_and(|operator| qualified.contains(operator))
    })
}
