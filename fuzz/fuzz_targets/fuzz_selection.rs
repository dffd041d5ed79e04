#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tessera_core::{
    key_generation_excluded_members, signing_excluded_members, GroupParameters, MemberIndex,
    OperatorAddress, ProtocolRun, RunId,
};

#[derive(Debug, Arbitrary)]
struct Input {
    run_id: Vec<u8>,
    /// Operator of every seat, as a small operator number
    seat_owners: Vec<u8>,
    /// Bitmap of ready seats
    ready: Vec<bool>,
    quorum: u8,
    threshold: u8,
    attempt: u8,
}

fuzz_target!(|input: Input| {
    let group_size = input.seat_owners.len().clamp(1, 64);
    let operators: Vec<OperatorAddress> = (0..group_size)
        .map(|i| {
            let owner = input.seat_owners.get(i).copied().unwrap_or_default() % 16;
            OperatorAddress::new(format!("0xop{owner}"))
        })
        .collect();

    let quorum = usize::from(input.quorum) % group_size + 1;
    let threshold = usize::from(input.threshold) % quorum + 1;
    let run = match ProtocolRun::new(
        RunId::from_be_bytes(&input.run_id),
        operators,
        GroupParameters::new(group_size, quorum, threshold),
        0,
    ) {
        Ok(run) => run,
        Err(_) => return,
    };

    let ready: Vec<MemberIndex> = (1..=group_size)
        .filter(|i| input.ready.get(i - 1).copied().unwrap_or(true))
        .map(|i| MemberIndex(i as u8))
        .collect();
    let attempt = u32::from(input.attempt) + 1;

    // Selection never panics and is a pure function of its inputs
    if let Ok(excluded) = signing_excluded_members(&run, &ready, attempt) {
        assert_eq!(excluded, signing_excluded_members(&run, &ready, attempt).unwrap());
        let included = group_size - excluded.len();
        assert!(included <= threshold);
        assert!(excluded.windows(2).all(|pair| pair[0] < pair[1]));
    }

    if let Ok(excluded) = key_generation_excluded_members(&run, &ready, attempt) {
        assert_eq!(
            excluded,
            key_generation_excluded_members(&run, &ready, attempt).unwrap()
        );
        if ready.len() >= quorum {
            assert!(group_size - excluded.len() >= quorum);
        }
    }
});
