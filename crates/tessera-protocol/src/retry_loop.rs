//! Block-scheduled attempt retry loop
//!
//! Every member of a group runs the same loop. Attempt windows are derived
//! from the run's initial block only, so members that fail an attempt simply
//! wait for the next window without telling anyone. One attempt goes through:
//!
//! 1. wait for the announcement start block
//! 2. announce readiness until the announcement end block
//! 3. give up the attempt if fewer seats than the quorum are ready
//! 4. select the excluded seats from the ready ones
//! 5. execute the round unless the local seat is excluded
//! 6. conclude: confirm completion (signing) or accept the result (key
//!    generation)
//!
//! Everything but cancellation, selection errors and safety violations
//! moves on to the next attempt.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::{
    key_generation_excluded_members, signing_excluded_members, unready_members, AttemptParams,
    AttemptSchedule, AttemptWindow, GroupParameters, MemberIndex, ProtocolRun, RetryLoopResult,
    RunId, Signature,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::announcer::Announcer;
use crate::chain::{cancel_at_block, wait_for_block, BlockSource};
use crate::done_check::DoneCheckStrategy;
use crate::error::{ProtocolError, Result};
use crate::stop_signal::StopSignaller;

/// Inputs of one round of the underlying cryptographic protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRequest {
    /// DKG seed or message being signed
    pub run_id: RunId,
    pub session_id: String,
    pub member: MemberIndex,
    pub group_size: usize,
    pub dishonest_threshold: usize,
    pub attempt: AttemptParams,
}

/// Executes one key generation or signing round
#[async_trait]
pub trait RoundExecutor: Send + Sync {
    type Output: Send + Sync + 'static;

    /// Run the round; `ctx` is cancelled at the attempt's timeout block
    async fn execute(&self, ctx: &CancellationToken, request: RoundRequest) -> Result<Self::Output>;
}

/// Round output of the local seat
#[derive(Debug, Clone)]
pub struct Executed<O> {
    pub output: O,
    /// Block observed right after the round finished
    pub end_block: u64,
}

/// Result agreed on by an attempt
#[derive(Debug, Clone)]
pub struct Concluded<R> {
    pub result: R,
    pub latest_end_block: u64,
}

/// How an attempt ended
#[derive(Debug)]
pub enum Conclusion<R> {
    Done(R),
    Retry(String),
    Fatal(ProtocolError),
}

/// View of an attempt handed to the protocol hooks
pub struct AttemptScope<'a> {
    pub run: &'a ProtocolRun,
    pub member: MemberIndex,
    pub params: &'a AttemptParams,
    /// Seats taking part in the round, ascending
    pub included: &'a [MemberIndex],
    /// Cancelled at the attempt's timeout block
    pub attempt_ctx: &'a CancellationToken,
}

/// Protocol specific parts of the retry loop
#[async_trait]
pub trait AttemptProtocol: Send + Sync {
    /// Output of a round
    type Output: Send + Sync + 'static;
    /// Result of the loop
    type Result: Send + 'static;

    fn name(&self) -> &'static str;

    fn schedule(&self) -> AttemptSchedule;

    /// Skip attempts whose announcement window already closed
    fn skips_stale_attempts(&self) -> bool;

    /// Ready seats needed for an attempt to proceed
    fn ready_quorum(&self, parameters: &GroupParameters) -> usize;

    fn excluded_members(
        &self,
        run: &ProtocolRun,
        ready: &[MemberIndex],
        attempt_number: u32,
    ) -> tessera_core::Result<Vec<MemberIndex>>;

    /// Called before the round starts, also for excluded seats
    async fn prepare(&self, scope: &AttemptScope<'_>);

    /// Turn the local round output (`None` when excluded) into a conclusion
    async fn conclude(
        &self,
        scope: &AttemptScope<'_>,
        executed: Option<Executed<Self::Output>>,
    ) -> Conclusion<Concluded<Self::Result>>;
}

/// Retry loop of one local seat
pub struct RetryLoop<P, E> {
    run: Arc<ProtocolRun>,
    member: MemberIndex,
    announcer: Arc<dyn Announcer>,
    blocks: Arc<dyn BlockSource>,
    executor: Arc<E>,
    protocol: P,
    current_attempt: Arc<AtomicU32>,
}

impl<P, E> RetryLoop<P, E>
where
    P: AttemptProtocol,
    E: RoundExecutor<Output = P::Output>,
{
    pub fn new(
        run: Arc<ProtocolRun>,
        member: MemberIndex,
        announcer: Arc<dyn Announcer>,
        blocks: Arc<dyn BlockSource>,
        executor: Arc<E>,
        protocol: P,
    ) -> Self {
        Self {
            run,
            member,
            announcer,
            blocks,
            executor,
            protocol,
            current_attempt: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Attempt the loop is currently in, 0 before the first one
    pub fn current_attempt(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.current_attempt)
    }

    pub fn run_context(&self) -> &ProtocolRun {
        &self.run
    }

    pub fn member(&self) -> MemberIndex {
        self.member
    }

    /// Run attempts until one succeeds, a fatal error occurs or `ctx` is
    /// cancelled
    pub async fn start(&self, ctx: &CancellationToken) -> Result<RetryLoopResult<P::Result>> {
        let schedule = self.protocol.schedule();
        let mut attempt_number = 0u32;

        loop {
            attempt_number += 1;
            if ctx.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            self.current_attempt.store(attempt_number, Ordering::SeqCst);

            let window = schedule.window(self.run.initial_start_block, attempt_number)?;
            match self.attempt(ctx, window).await {
                Conclusion::Done(result) => return Ok(result),
                Conclusion::Fatal(err) => return Err(err),
                Conclusion::Retry(reason) => {
                    warn!(
                        member = %self.member,
                        attempt = attempt_number,
                        "{} attempt abandoned: {}; starting next attempt",
                        self.protocol.name(),
                        reason
                    );
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn attempt(
        &self,
        ctx: &CancellationToken,
        window: AttemptWindow,
    ) -> Conclusion<RetryLoopResult<P::Result>> {
        let number = window.attempt_number;
        let member = self.member;
        let parameters = &self.run.parameters;

        if self.protocol.skips_stale_attempts() {
            let current_block = match self.blocks.current_block().await {
                Ok(block) => block,
                Err(e) => return Conclusion::Retry(format!("cannot get the current block: {e}")),
            };
            if window.announcement_end_block <= current_block {
                info!(
                    member = %member,
                    attempt = number,
                    "Skipping attempt; current block {} is past the announcement end block {}",
                    current_block,
                    window.announcement_end_block
                );
                return Conclusion::Retry("announcement window in the past".to_string());
            }
        }

        debug!(member = %member, attempt = number, "Waiting for attempt start signal");
        if let Err(e) =
            wait_for_block(ctx, self.blocks.as_ref(), window.announcement_start_block).await
        {
            return Conclusion::Retry(format!(
                "failed waiting for announcement start block {}: {e}",
                window.announcement_start_block
            ));
        }

        info!(member = %member, attempt = number, "Starting announcement phase");
        let announce_ctx = cancel_at_block(
            ctx,
            Arc::clone(&self.blocks),
            window.announcement_end_block,
        );
        let ready = self
            .announcer
            .announce(&announce_ctx, member, &self.run.session_id(number))
            .await;
        announce_ctx.cancel();
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => return Conclusion::Retry(format!("announcement failed: {e}")),
        };

        if ctx.is_cancelled() {
            return Conclusion::Fatal(ProtocolError::Cancelled);
        }

        let unready = unready_members(&ready, parameters.group_size);
        let quorum = self.protocol.ready_quorum(parameters);
        if ready.len() < quorum {
            return Conclusion::Retry(format!(
                "only {} of {} required members ready; not ready: {:?}",
                ready.len(),
                quorum,
                unready
            ));
        }
        info!(
            member = %member,
            attempt = number,
            ready = ready.len(),
            "Completed announcement phase; not ready: {:?}",
            unready
        );

        let excluded = match self.protocol.excluded_members(&self.run, &ready, number) {
            Ok(excluded) => excluded,
            Err(e) => return Conclusion::Fatal(ProtocolError::Selection(e)),
        };
        let params = AttemptParams {
            number,
            start_block: window.announcement_end_block,
            timeout_block: window.timeout_block,
            excluded_members: excluded,
        };
        let included = params.included_members(parameters.group_size);

        let attempt_ctx = cancel_at_block(ctx, Arc::clone(&self.blocks), params.timeout_block);
        let scope = AttemptScope {
            run: &self.run,
            member,
            params: &params,
            included: &included,
            attempt_ctx: &attempt_ctx,
        };
        self.protocol.prepare(&scope).await;

        let executed = if params.is_excluded(member) {
            info!(
                member = %member,
                attempt = number,
                "Not eligible for attempt; waiting for the outcome"
            );
            None
        } else {
            info!(
                member = %member,
                attempt = number,
                "Starting {} round with {} members (excluded: {:?})",
                self.protocol.name(),
                included.len(),
                params.excluded_members
            );
            let request = RoundRequest {
                run_id: self.run.run_id.clone(),
                session_id: self.run.session_id(number),
                member,
                group_size: parameters.group_size,
                dishonest_threshold: parameters.dishonest_threshold(),
                attempt: params.clone(),
            };
            let output = match self.executor.execute(&attempt_ctx, request).await {
                Ok(output) => output,
                Err(e) => return Conclusion::Retry(format!("round failed: {e}")),
            };
            let end_block = match self.blocks.current_block().await {
                Ok(block) => block,
                Err(e) => return Conclusion::Retry(format!("cannot get the end block: {e}")),
            };
            Some(Executed { output, end_block })
        };

        match self.protocol.conclude(&scope, executed).await {
            Conclusion::Done(concluded) => Conclusion::Done(RetryLoopResult {
                result: concluded.result,
                attempt_number: number,
                attempt_timeout_block: params.timeout_block,
                latest_end_block: concluded.latest_end_block,
                active_members_count: ready.len(),
            }),
            Conclusion::Retry(reason) => Conclusion::Retry(reason),
            Conclusion::Fatal(err) => Conclusion::Fatal(err),
        }
    }
}

/// Signing attempts confirmed through a done check
pub struct SigningAttempts {
    done_check: Arc<dyn DoneCheckStrategy>,
}

impl SigningAttempts {
    pub fn new(done_check: Arc<dyn DoneCheckStrategy>) -> Self {
        Self { done_check }
    }
}

#[async_trait]
impl AttemptProtocol for SigningAttempts {
    type Output = Signature;
    type Result = Signature;

    fn name(&self) -> &'static str {
        "signing"
    }

    fn schedule(&self) -> AttemptSchedule {
        AttemptSchedule::SIGNING
    }

    fn skips_stale_attempts(&self) -> bool {
        true
    }

    fn ready_quorum(&self, parameters: &GroupParameters) -> usize {
        parameters.honest_threshold
    }

    fn excluded_members(
        &self,
        run: &ProtocolRun,
        ready: &[MemberIndex],
        attempt_number: u32,
    ) -> tessera_core::Result<Vec<MemberIndex>> {
        signing_excluded_members(run, ready, attempt_number)
    }

    async fn prepare(&self, scope: &AttemptScope<'_>) {
        self.done_check
            .listen(
                scope.attempt_ctx,
                &scope.run.run_id,
                scope.params.number,
                scope.params.timeout_block,
                scope.included,
            )
            .await;
    }

    async fn conclude(
        &self,
        scope: &AttemptScope<'_>,
        executed: Option<Executed<Signature>>,
    ) -> Conclusion<Concluded<Signature>> {
        if let Some(executed) = executed {
            debug!(
                member = %scope.member,
                attempt = scope.params.number,
                "Exchanging signing done checks"
            );
            if let Err(e) = self
                .done_check
                .signal_done(
                    scope.attempt_ctx,
                    scope.member,
                    &scope.run.run_id,
                    scope.params.number,
                    executed.output,
                    executed.end_block,
                )
                .await
            {
                return Conclusion::Retry(format!("cannot send signing done signal: {e}"));
            }
        }

        match self.done_check.wait_until_all_done(scope.attempt_ctx).await {
            Ok((signature, latest_end_block)) => Conclusion::Done(Concluded {
                result: signature,
                latest_end_block,
            }),
            Err(err @ ProtocolError::SignaturesMismatch { .. }) => Conclusion::Fatal(err),
            Err(e) => Conclusion::Retry(format!("cannot wait for signing done checks: {e}")),
        }
    }
}

/// Key generation attempts; the local result is final
pub struct KeyGenerationAttempts<R> {
    _result: std::marker::PhantomData<fn() -> R>,
}

impl<R> KeyGenerationAttempts<R> {
    pub fn new() -> Self {
        Self {
            _result: std::marker::PhantomData,
        }
    }
}

impl<R> Default for KeyGenerationAttempts<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Send + Sync + 'static> AttemptProtocol for KeyGenerationAttempts<R> {
    type Output = R;
    type Result = R;

    fn name(&self) -> &'static str {
        "key generation"
    }

    fn schedule(&self) -> AttemptSchedule {
        AttemptSchedule::KEY_GENERATION
    }

    fn skips_stale_attempts(&self) -> bool {
        false
    }

    fn ready_quorum(&self, parameters: &GroupParameters) -> usize {
        parameters.group_quorum
    }

    fn excluded_members(
        &self,
        run: &ProtocolRun,
        ready: &[MemberIndex],
        attempt_number: u32,
    ) -> tessera_core::Result<Vec<MemberIndex>> {
        key_generation_excluded_members(run, ready, attempt_number)
    }

    async fn prepare(&self, _scope: &AttemptScope<'_>) {}

    async fn conclude(
        &self,
        scope: &AttemptScope<'_>,
        executed: Option<Executed<R>>,
    ) -> Conclusion<Concluded<R>> {
        match executed {
            Some(executed) => Conclusion::Done(Concluded {
                result: executed.output,
                latest_end_block: executed.end_block,
            }),
            None => {
                info!(member = %scope.member, attempt = scope.params.number, "Attempt skipped");
                Conclusion::Retry("local member excluded".to_string())
            }
        }
    }
}

/// Signing loop of one seat
pub type SigningRetryLoop<E> = RetryLoop<SigningAttempts, E>;

/// Key generation loop of one seat, stoppable by peers' stop signals
pub struct DkgRetryLoop<E: RoundExecutor> {
    inner: RetryLoop<KeyGenerationAttempts<E::Output>, E>,
    stop: StopSignaller,
}

impl<E: RoundExecutor> DkgRetryLoop<E> {
    pub fn new(
        run: Arc<ProtocolRun>,
        member: MemberIndex,
        announcer: Arc<dyn Announcer>,
        blocks: Arc<dyn BlockSource>,
        executor: Arc<E>,
        stop: StopSignaller,
    ) -> Self {
        Self {
            inner: RetryLoop::new(
                run,
                member,
                announcer,
                blocks,
                executor,
                KeyGenerationAttempts::new(),
            ),
            stop,
        }
    }

    /// Run the loop.
    ///
    /// Returns `Ok(None)` when another member's stop signal ended the run
    /// before the local seat produced a result.
    pub async fn start(
        &self,
        ctx: &CancellationToken,
    ) -> Result<Option<RetryLoopResult<E::Output>>> {
        let run = self.inner.run_context();
        let stopped = self
            .stop
            .listen(ctx, &run.run_id, self.inner.current_attempt());

        let outcome = self.inner.start(&stopped).await;
        let stopped_by_peer = stopped.is_cancelled() && !ctx.is_cancelled();
        stopped.cancel();

        match outcome {
            Ok(result) => {
                let until_block = result.attempt_timeout_block
                    + AttemptSchedule::KEY_GENERATION.max_attempt_blocks();
                self.stop.schedule(
                    ctx,
                    Arc::clone(&self.inner.blocks),
                    self.inner.member(),
                    &run.run_id,
                    result.attempt_number,
                    until_block,
                );
                Ok(Some(result))
            }
            Err(ProtocolError::Cancelled) if stopped_by_peer => {
                info!(
                    member = %self.inner.member(),
                    "Key generation finished by other members"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::local::LocalBlockCounter;
    use tessera_core::OperatorAddress;

    // ------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------

    /// Announcer returning scripted ready sets once the window closes
    struct MockAnnouncer {
        ready: Mutex<HashMap<String, Vec<MemberIndex>>>,
        default_ready: Vec<MemberIndex>,
    }

    impl MockAnnouncer {
        fn new(default_ready: Vec<MemberIndex>) -> Self {
            Self {
                ready: Mutex::new(HashMap::new()),
                default_ready,
            }
        }

        fn script(self, session_id: &str, ready: Vec<MemberIndex>) -> Self {
            self.ready
                .lock()
                .unwrap()
                .insert(session_id.to_string(), ready);
            self
        }
    }

    #[async_trait]
    impl Announcer for MockAnnouncer {
        async fn announce(
            &self,
            ctx: &CancellationToken,
            member: MemberIndex,
            session_id: &str,
        ) -> Result<Vec<MemberIndex>> {
            ctx.cancelled().await;
            let mut ready: BTreeSet<MemberIndex> = self
                .ready
                .lock()
                .unwrap()
                .get(session_id)
                .cloned()
                .unwrap_or_else(|| self.default_ready.clone())
                .into_iter()
                .collect();
            ready.insert(member);
            Ok(ready.into_iter().collect())
        }
    }

    /// Done check recording calls and returning a scripted outcome
    struct MockDoneCheck {
        outcomes: Mutex<HashMap<u32, std::result::Result<(Signature, u64), String>>>,
        current: Mutex<u32>,
        signalled: Mutex<Vec<(u32, u64)>>,
    }

    impl MockDoneCheck {
        fn new() -> Self {
            Self {
                outcomes: Mutex::new(HashMap::new()),
                current: Mutex::new(0),
                signalled: Mutex::new(Vec::new()),
            }
        }

        fn outcome(self, attempt: u32, outcome: std::result::Result<(Signature, u64), String>) -> Self {
            self.outcomes.lock().unwrap().insert(attempt, outcome);
            self
        }
    }

    #[async_trait]
    impl DoneCheckStrategy for MockDoneCheck {
        async fn listen(
            &self,
            _ctx: &CancellationToken,
            _message: &RunId,
            attempt_number: u32,
            _timeout_block: u64,
            _participants: &[MemberIndex],
        ) {
            *self.current.lock().unwrap() = attempt_number;
        }

        async fn signal_done(
            &self,
            _ctx: &CancellationToken,
            _member: MemberIndex,
            _message: &RunId,
            attempt_number: u32,
            _signature: Signature,
            end_block: u64,
        ) -> Result<()> {
            self.signalled.lock().unwrap().push((attempt_number, end_block));
            Ok(())
        }

        async fn wait_until_all_done(&self, ctx: &CancellationToken) -> Result<(Signature, u64)> {
            let attempt = *self.current.lock().unwrap();
            let outcome = self.outcomes.lock().unwrap().get(&attempt).cloned();
            match outcome {
                Some(Ok(done)) => Ok(done),
                Some(Err(e)) if e == "mismatch" => Err(ProtocolError::SignaturesMismatch {
                    expected: "a".to_string(),
                    found: "b".to_string(),
                }),
                _ => {
                    ctx.cancelled().await;
                    Err(ProtocolError::DoneCheckIncomplete { missing: vec![] })
                }
            }
        }
    }

    /// Executor failing the scripted attempts
    struct MockExecutor {
        failing_attempts: Vec<u32>,
        calls: Mutex<Vec<RoundRequest>>,
    }

    impl MockExecutor {
        fn new(failing_attempts: Vec<u32>) -> Arc<Self> {
            Arc::new(Self {
                failing_attempts,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RoundExecutor for MockExecutor {
        type Output = Signature;

        async fn execute(&self, _ctx: &CancellationToken, request: RoundRequest) -> Result<Signature> {
            let number = request.attempt.number;
            self.calls.lock().unwrap().push(request);
            if self.failing_attempts.contains(&number) {
                return Err(ProtocolError::Execution("invalid share".to_string()));
            }
            Ok(test_signature())
        }
    }

    fn test_signature() -> Signature {
        Signature::new([1u8; 32], [2u8; 32], 0)
    }

    fn members(indexes: &[u8]) -> Vec<MemberIndex> {
        indexes.iter().map(|i| MemberIndex(*i)).collect()
    }

    fn signing_run(initial_start_block: u64) -> Arc<ProtocolRun> {
        // Operators 2 and 8 hold several seats
        let operators = [1, 2, 8, 4, 2, 6, 7, 8, 9, 8]
            .iter()
            .map(|i| OperatorAddress::new(format!("address-{i}")))
            .collect();
        Arc::new(
            ProtocolRun::new(
                RunId::from_u64(100),
                operators,
                GroupParameters::new(10, 8, 6),
                initial_start_block,
            )
            .unwrap(),
        )
    }

    /// Advance the chain one block at a time in the background
    fn drive_blocks(blocks: &Arc<LocalBlockCounter>, ctx: &CancellationToken) {
        blocks.spawn_ticker(Duration::from_millis(1), ctx.clone());
    }

    fn signing_loop(
        run: Arc<ProtocolRun>,
        member: u8,
        announcer: MockAnnouncer,
        blocks: Arc<LocalBlockCounter>,
        executor: Arc<MockExecutor>,
        done_check: MockDoneCheck,
    ) -> SigningRetryLoop<MockExecutor> {
        RetryLoop::new(
            run,
            MemberIndex(member),
            Arc::new(announcer),
            blocks,
            executor,
            SigningAttempts::new(Arc::new(done_check)),
        )
    }

    /// Seat selected for every given attempt when all seats are ready
    fn included_member(run: &ProtocolRun, attempts: &[u32]) -> u8 {
        let all = members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let excluded: Vec<MemberIndex> = attempts
            .iter()
            .flat_map(|attempt| signing_excluded_members(run, &all, *attempt).unwrap())
            .collect();
        (1..=10u8)
            .find(|i| !excluded.contains(&MemberIndex(*i)))
            .unwrap()
    }

    fn excluded_member(run: &ProtocolRun, attempt: u32) -> u8 {
        let excluded = signing_excluded_members(run, &members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]), attempt)
            .unwrap();
        excluded[0].0
    }

    // ------------------------------------------------------------------
    // Signing scenarios
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_signing_succeeds_on_initial_attempt() {
        let run = signing_run(200);
        let member = included_member(&run, &[1]);
        let blocks = LocalBlockCounter::new(190);
        let ctx = CancellationToken::new();
        drive_blocks(&blocks, &ctx);

        let executor = MockExecutor::new(vec![]);
        let retry_loop = signing_loop(
            Arc::clone(&run),
            member,
            MockAnnouncer::new(members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])),
            blocks,
            Arc::clone(&executor),
            MockDoneCheck::new().outcome(1, Ok((test_signature(), 210))),
        );

        let result = retry_loop.start(&ctx).await.unwrap();
        assert_eq!(result.result, test_signature());
        assert_eq!(result.attempt_number, 1);
        assert_eq!(result.attempt_timeout_block, 236);
        assert_eq!(result.latest_end_block, 210);
        assert_eq!(result.active_members_count, 10);

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].attempt.start_block, 206);
        assert_eq!(calls[0].attempt.timeout_block, 236);
        assert_eq!(calls[0].attempt.excluded_members, members(&[3, 7, 8, 10]));
        assert_eq!(calls[0].dishonest_threshold, 4);
        assert_eq!(calls[0].session_id, "64-1");
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_signing_with_missing_announcements() {
        let run = signing_run(200);
        let blocks = LocalBlockCounter::new(190);
        let ctx = CancellationToken::new();
        drive_blocks(&blocks, &ctx);

        // Seats 3 and 9 never announce
        let ready = members(&[1, 2, 4, 5, 6, 7, 8, 10]);
        let excluded = signing_excluded_members(&run, &ready, 1).unwrap();
        assert!(excluded.contains(&MemberIndex(3)));
        assert!(excluded.contains(&MemberIndex(9)));
        let member = (1..=10u8)
            .find(|i| !excluded.contains(&MemberIndex(*i)))
            .unwrap();

        let executor = MockExecutor::new(vec![]);
        let retry_loop = signing_loop(
            Arc::clone(&run),
            member,
            MockAnnouncer::new(ready),
            blocks,
            Arc::clone(&executor),
            MockDoneCheck::new().outcome(1, Ok((test_signature(), 211))),
        );

        let result = retry_loop.start(&ctx).await.unwrap();
        assert_eq!(result.attempt_number, 1);
        assert_eq!(result.active_members_count, 8);
        assert_eq!(executor.calls.lock().unwrap()[0].attempt.excluded_members, excluded);
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_signing_excluded_member_learns_outcome() {
        let run = signing_run(200);
        let member = excluded_member(&run, 1);
        let blocks = LocalBlockCounter::new(190);
        let ctx = CancellationToken::new();
        drive_blocks(&blocks, &ctx);

        let executor = MockExecutor::new(vec![]);
        let retry_loop = signing_loop(
            Arc::clone(&run),
            member,
            MockAnnouncer::new(members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])),
            blocks,
            Arc::clone(&executor),
            MockDoneCheck::new().outcome(1, Ok((test_signature(), 215))),
        );

        let result = retry_loop.start(&ctx).await.unwrap();
        assert_eq!(result.attempt_number, 1);
        assert_eq!(result.latest_end_block, 215);
        assert!(executor.calls.lock().unwrap().is_empty());
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_signing_retries_after_failed_round() {
        let run = signing_run(200);
        let member = included_member(&run, &[1, 2]);
        let blocks = LocalBlockCounter::new(190);
        let ctx = CancellationToken::new();
        drive_blocks(&blocks, &ctx);

        let executor = MockExecutor::new(vec![1]);
        let done_check = MockDoneCheck::new().outcome(2, Ok((test_signature(), 250)));
        let retry_loop = signing_loop(
            Arc::clone(&run),
            member,
            MockAnnouncer::new(members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])),
            blocks,
            Arc::clone(&executor),
            done_check,
        );

        let result = retry_loop.start(&ctx).await.unwrap();
        assert_eq!(result.attempt_number, 2);
        assert_eq!(result.attempt_timeout_block, 277);

        let calls = executor.calls.lock().unwrap();
        let last = calls.last().unwrap();
        assert_eq!(last.attempt.number, 2);
        assert_eq!(last.attempt.start_block, 247);
        assert_eq!(
            last.attempt.start_block - calls[0].attempt.start_block,
            AttemptSchedule::SIGNING.max_attempt_blocks()
        );
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_signing_done_check_timeout_moves_to_next_attempt() {
        let run = signing_run(200);
        let member = included_member(&run, &[2]);
        let blocks = LocalBlockCounter::new(190);
        let ctx = CancellationToken::new();
        drive_blocks(&blocks, &ctx);

        // No outcome scripted for attempt 1: the done check waits out the window
        let retry_loop = signing_loop(
            Arc::clone(&run),
            member,
            MockAnnouncer::new(members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])),
            blocks,
            MockExecutor::new(vec![]),
            MockDoneCheck::new().outcome(2, Ok((test_signature(), 260))),
        );

        let result = retry_loop.start(&ctx).await.unwrap();
        assert_eq!(result.attempt_number, 2);
        assert_eq!(result.latest_end_block, 260);
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_signing_quorum_miss_retries() {
        let run = signing_run(200);
        let blocks = LocalBlockCounter::new(190);
        let ctx = CancellationToken::new();
        drive_blocks(&blocks, &ctx);

        let session_2 = run.session_id(2);
        let announcer = MockAnnouncer::new(members(&[1, 2, 3]))
            .script(&session_2, members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
        let member = included_member(&run, &[2]);
        assert_eq!(member, 3);
        let executor = MockExecutor::new(vec![]);
        let retry_loop = signing_loop(
            Arc::clone(&run),
            member,
            announcer,
            blocks,
            Arc::clone(&executor),
            MockDoneCheck::new().outcome(2, Ok((test_signature(), 250))),
        );

        let result = retry_loop.start(&ctx).await.unwrap();
        assert_eq!(result.attempt_number, 2);
        assert_eq!(result.attempt_timeout_block, 277);

        // Operators address-1 and address-2 are left out, then seat 9 is trimmed
        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].attempt.start_block, 247);
        assert_eq!(calls[0].attempt.excluded_members, members(&[1, 2, 5, 9]));
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_signing_mismatch_is_fatal() {
        let run = signing_run(200);
        let member = included_member(&run, &[1]);
        let blocks = LocalBlockCounter::new(190);
        let ctx = CancellationToken::new();
        drive_blocks(&blocks, &ctx);

        let retry_loop = signing_loop(
            Arc::clone(&run),
            member,
            MockAnnouncer::new(members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])),
            blocks,
            MockExecutor::new(vec![]),
            MockDoneCheck::new().outcome(1, Err("mismatch".to_string())),
        );

        assert!(matches!(
            retry_loop.start(&ctx).await,
            Err(ProtocolError::SignaturesMismatch { .. })
        ));
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_signing_loop_context_cancelled() {
        let run = signing_run(200);
        let blocks = LocalBlockCounter::new(190);
        let ctx = CancellationToken::new();

        let retry_loop = signing_loop(
            Arc::clone(&run),
            1,
            MockAnnouncer::new(members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])),
            blocks,
            MockExecutor::new(vec![]),
            MockDoneCheck::new(),
        );

        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ctx.cancel();
            })
        };
        assert!(matches!(
            retry_loop.start(&ctx).await,
            Err(ProtocolError::Cancelled)
        ));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_signing_in_the_past_until_cancelled() {
        let run = signing_run(200);
        let blocks = LocalBlockCounter::new(u64::MAX);
        let ctx = CancellationToken::new();

        let executor = MockExecutor::new(vec![]);
        let retry_loop = signing_loop(
            Arc::clone(&run),
            1,
            MockAnnouncer::new(members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])),
            blocks,
            Arc::clone(&executor),
            MockDoneCheck::new(),
        );

        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ctx.cancel();
            })
        };
        assert!(matches!(
            retry_loop.start(&ctx).await,
            Err(ProtocolError::Cancelled)
        ));
        assert!(executor.calls.lock().unwrap().is_empty());
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_signing_first_attempt_in_the_past() {
        let run = signing_run(200);
        let member = included_member(&run, &[2]);
        // Attempt 1 announcement ends at block 206
        let blocks = LocalBlockCounter::new(206);
        let ctx = CancellationToken::new();
        drive_blocks(&blocks, &ctx);

        let executor = MockExecutor::new(vec![]);
        let retry_loop = signing_loop(
            Arc::clone(&run),
            member,
            MockAnnouncer::new(members(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])),
            blocks,
            Arc::clone(&executor),
            MockDoneCheck::new().outcome(2, Ok((test_signature(), 255))),
        );

        let result = retry_loop.start(&ctx).await.unwrap();
        assert_eq!(result.attempt_number, 2);
        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].attempt.number, 2);
        ctx.cancel();
    }

    // ------------------------------------------------------------------
    // Key generation scenarios
    // ------------------------------------------------------------------

    struct CountingExecutor {
        failing_attempts: Vec<u32>,
    }

    #[async_trait]
    impl RoundExecutor for CountingExecutor {
        type Output = u32;

        async fn execute(&self, _ctx: &CancellationToken, request: RoundRequest) -> Result<u32> {
            if self.failing_attempts.contains(&request.attempt.number) {
                return Err(ProtocolError::Execution("dkg failed".to_string()));
            }
            Ok(request.attempt.number)
        }
    }

    fn dkg_run() -> Arc<ProtocolRun> {
        let operators = (1..=5)
            .map(|i| OperatorAddress::new(format!("0xdkg{i}")))
            .collect();
        Arc::new(
            ProtocolRun::new(
                RunId::from_u64(0xdead),
                operators,
                GroupParameters::new(5, 4, 3),
                10,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_key_generation_retries_with_one_operator_excluded() {
        let run = dkg_run();
        let blocks = LocalBlockCounter::new(0);
        let ctx = CancellationToken::new();
        drive_blocks(&blocks, &ctx);

        let all = members(&[1, 2, 3, 4, 5]);
        let excluded_on_second = key_generation_excluded_members(&run, &all, 2).unwrap();
        assert_eq!(excluded_on_second.len(), 1);
        let member = (1..=5u8)
            .find(|i| !excluded_on_second.contains(&MemberIndex(*i)))
            .unwrap();

        let retry_loop = RetryLoop::new(
            Arc::clone(&run),
            MemberIndex(member),
            Arc::new(MockAnnouncer::new(all)),
            blocks,
            Arc::new(CountingExecutor {
                failing_attempts: vec![1],
            }),
            KeyGenerationAttempts::new(),
        );

        let result = retry_loop.start(&ctx).await.unwrap();
        assert_eq!(result.result, 2);
        assert_eq!(result.attempt_number, 2);
        assert_eq!(
            result.attempt_timeout_block,
            10 + AttemptSchedule::KEY_GENERATION.max_attempt_blocks() + 1 + 5 + 200
        );
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_key_generation_exhaustion_is_fatal() {
        // Quorum equal to group size: no operator can ever be excluded
        let operators = (1..=3)
            .map(|i| OperatorAddress::new(format!("0xdkg{i}")))
            .collect();
        let run = Arc::new(
            ProtocolRun::new(
                RunId::from_u64(1),
                operators,
                GroupParameters::new(3, 3, 2),
                0,
            )
            .unwrap(),
        );
        let blocks = LocalBlockCounter::new(0);
        let ctx = CancellationToken::new();
        drive_blocks(&blocks, &ctx);

        let retry_loop = RetryLoop::new(
            run,
            MemberIndex(1),
            Arc::new(MockAnnouncer::new(members(&[1, 2, 3]))),
            blocks,
            Arc::new(CountingExecutor {
                failing_attempts: vec![1],
            }),
            KeyGenerationAttempts::new(),
        );

        assert!(matches!(
            retry_loop.start(&ctx).await,
            Err(ProtocolError::Selection(tessera_core::Error::RetryExhausted { .. }))
        ));
        ctx.cancel();
    }
}
