//! End-to-end signing tests for Tessera groups
//!
//! These tests run whole groups on the in-process devnet and check that
//! every operator comes out of a signing with the same view.

use std::sync::Arc;

use tessera_core::{GroupParameters, MemberIndex, OperatorAddress, ProtocolRun, RunId};
use tessera_node::{Devnet, NodeConfig, OperatorConfig, SimulatedSigner, TimingConfig};
use tessera_protocol::{
    GroupContext, LocalBlockCounter, LocalNetwork, MessagingConfig, ProtocolError, Retransmission,
    SigningGroupController, StaticMembershipValidator,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

fn fast_timing() -> TimingConfig {
    TimingConfig {
        block_time_ms: 5,
        round_blocks: 2,
        announcement_retransmission_ms: 5,
        done_poll_interval_ms: 5,
        done_retransmission_initial_ms: 5,
        done_retransmission_max_ms: 40,
        stop_signal_delay_ms: 50,
        stop_signal_retransmission_ms: 10,
    }
}

fn roster(config: &NodeConfig) -> Vec<OperatorAddress> {
    config
        .seat_assignments()
        .into_iter()
        .flat_map(|(operator, seats)| {
            let address = OperatorAddress::from_public_key(operator.name.as_bytes());
            seats.into_iter().map(move |_| address.clone())
        })
        .collect()
}

/// First attempt whose selection leaves every seat in `faulty` out
fn first_attempt_excluding(run: &ProtocolRun, faulty: &[MemberIndex]) -> u32 {
    let ready: Vec<MemberIndex> = (1..=run.parameters.group_size as u8).map(MemberIndex).collect();
    (1..=100)
        .find(|attempt| {
            let excluded = tessera_core::signing_excluded_members(run, &ready, *attempt).unwrap();
            faulty.iter().all(|seat| excluded.contains(seat))
        })
        .unwrap()
}

/// A faulty operator breaks rounds until the selection leaves it out
#[tokio::test]
async fn test_signing_retries_past_faulty_operator() {
    // ==========================================
    // STEP 1: Configure a group with one faulty operator
    // ==========================================
    let mut config = NodeConfig::default();
    config.timing = fast_timing();
    config.signing_attempts_limit = 100;
    config.operators[2].faulty = true;
    let faulty = config.faulty_members().into_iter().collect::<Vec<_>>();
    assert_eq!(faulty, vec![MemberIndex(6)]);

    let message = RunId::from_hex("deadbeef").unwrap();
    let run = ProtocolRun::new(message.clone(), roster(&config), config.group_parameters(), 0)
        .unwrap();
    let expected_attempt = first_attempt_excluding(&run, &faulty);

    // ==========================================
    // STEP 2: Sign on every operator
    // ==========================================
    let devnet = Devnet::new(config).unwrap();
    let ctx = CancellationToken::new();
    devnet.start_chain(&ctx);

    let reports = devnet
        .run_signing(&ctx, b"group-key", &[message])
        .await
        .unwrap();

    // ==========================================
    // STEP 3: Everyone agrees, including the faulty operator
    // ==========================================
    assert_eq!(reports.len(), 7);
    let first = &reports[0];
    assert!(first.error.is_none(), "signing failed: {:?}", first.error);
    assert_eq!(first.signatures.len(), 1);
    assert_eq!(first.signatures[0].attempt, expected_attempt);
    assert_eq!(first.signatures[0].active_members, 10);
    for report in &reports {
        assert_eq!(report.signatures, first.signatures);
    }

    ctx.cancel();
}

/// Signatures of a batch chain their start blocks off the previous end block
#[tokio::test]
async fn test_signing_batch_with_offline_operator() {
    let mut config = NodeConfig::default();
    config.timing = fast_timing();
    config.operators[1].offline = true;

    let devnet = Devnet::new(config.clone()).unwrap();
    let ctx = CancellationToken::new();
    devnet.start_chain(&ctx);

    let messages = config.messages().unwrap();
    let reports = devnet.run_signing(&ctx, b"group-key", &messages).await.unwrap();

    assert_eq!(reports.len(), 6);
    for report in &reports {
        assert!(report.error.is_none());
        let signatures = &report.signatures;
        assert_eq!(signatures.len(), 2);
        assert_eq!(signatures[0].active_members, 8);
        assert_eq!(signatures[1].start_block, signatures[0].end_block + 2);
        assert_ne!(signatures[0].signature, signatures[1].signature);
    }

    ctx.cancel();
}

/// Configuration written to disk drives the same devnet
#[tokio::test]
async fn test_devnet_from_saved_config() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("tessera.json");

    let mut config = NodeConfig::default();
    config.timing = fast_timing();
    config.scenario.messages = vec!["01".to_string()];
    config.save(&path).unwrap();

    let devnet = Devnet::new(NodeConfig::load(&path).unwrap()).unwrap();
    let ctx = CancellationToken::new();
    let report = devnet.run(&ctx).await.unwrap();

    assert_eq!(report.group_public_key.len(), 64);
    assert!(report
        .signing
        .iter()
        .all(|signing| signing.error.is_none() && signing.signatures.len() == 1));
    ctx.cancel();
}

/// Participants computing different signatures abort the signing
#[tokio::test]
async fn test_signature_mismatch_is_fatal() {
    // ==========================================
    // STEP 1: Three operators, every seat needed
    // ==========================================
    let operators: Vec<OperatorConfig> = ["a", "b", "c"]
        .iter()
        .map(|name| OperatorConfig {
            name: name.to_string(),
            seats: 1,
            offline: false,
            faulty: false,
        })
        .collect();
    let addresses: Vec<OperatorAddress> = operators
        .iter()
        .map(|o| OperatorAddress::from_public_key(o.name.as_bytes()))
        .collect();
    let network = LocalNetwork::new("mismatch");
    let blocks = LocalBlockCounter::new(0);
    let ctx = CancellationToken::new();
    blocks.spawn_ticker(std::time::Duration::from_millis(5), ctx.clone());

    let messaging = MessagingConfig {
        announcement_retransmission: Retransmission::Fixed(std::time::Duration::from_millis(5)),
        done_retransmission: Retransmission::Fixed(std::time::Duration::from_millis(10)),
        done_poll_interval: std::time::Duration::from_millis(5),
        ..MessagingConfig::default()
    };

    // ==========================================
    // STEP 2: Operator "c" signs under another key
    // ==========================================
    let mut tasks = JoinSet::new();
    for (i, operator) in operators.iter().enumerate() {
        let group_key: &[u8] = if i == 2 { b"other-key" } else { b"group-key" };
        let executor = Arc::new(SimulatedSigner::new(
            blocks.clone(),
            2,
            Default::default(),
            group_key.to_vec(),
        ));
        let context = GroupContext {
            operators: addresses.clone(),
            parameters: GroupParameters::new(3, 3, 3),
            local_members: vec![MemberIndex(i as u8 + 1)],
            channel: network.channel(operator.name.as_bytes().to_vec()),
            membership: Arc::new(StaticMembershipValidator::new(addresses.clone())),
            blocks: blocks.clone(),
        };
        let controller = SigningGroupController::new(context, executor)
            .with_messaging(messaging)
            .with_attempts_limit(3);
        let ctx = ctx.clone();
        tasks.spawn(async move { controller.sign(&ctx, RunId::from_u64(5), 5).await });
    }

    // ==========================================
    // STEP 3: Nobody retries after the mismatch
    // ==========================================
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Err(ProtocolError::SignersFailed(message)) => {
                assert!(message.contains("Not matching signatures"), "{message}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert!(blocks.height() < 5 + 41);

    ctx.cancel();
}
