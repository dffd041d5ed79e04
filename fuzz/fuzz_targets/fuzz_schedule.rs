#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_core::AttemptSchedule;

fuzz_target!(|input: (u64, u32)| {
    let (initial_start_block, attempt) = input;

    for schedule in [AttemptSchedule::KEY_GENERATION, AttemptSchedule::SIGNING] {
        let Ok(window) = schedule.window(initial_start_block, attempt) else {
            continue;
        };
        assert!(window.start_block <= window.announcement_start_block);
        assert!(window.announcement_start_block <= window.announcement_end_block);
        assert!(window.announcement_end_block <= window.timeout_block);

        if let Ok(next) = schedule.window(initial_start_block, attempt.saturating_add(1)) {
            if attempt < u32::MAX {
                assert!(next.start_block > window.start_block);
            }
        }
    }
});
