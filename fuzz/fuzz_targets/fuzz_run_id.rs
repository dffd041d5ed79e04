#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_core::RunId;

fuzz_target!(|data: &[u8]| {
    // Arbitrary strings never panic the hex parser
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(run_id) = RunId::from_hex(s) {
            let again = RunId::from_hex(&run_id.to_hex()).unwrap();
            assert_eq!(run_id, again);
        }
    }

    // Leading zeros never change the identifier
    let run_id = RunId::from_be_bytes(data);
    let mut padded = vec![0u8; 3];
    padded.extend_from_slice(data);
    assert_eq!(run_id, RunId::from_be_bytes(&padded));
    assert!(run_id.session_id(1).ends_with("-1"));
});
