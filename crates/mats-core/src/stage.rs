// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stages and their processor pools.
//!
//! Each processor is a named OS thread owning one broker session. It loops:
//! receive, process inside one transaction, commit, repeat. Message-level
//! failures roll back and continue; session-level failures crash the session,
//! chill for a randomized few seconds and start over with a fresh one.
//!
//! Stopping runs four phases across all processors of a stage:
//!
//! 0. clear the run flag; a processor blocked in receive gets its session
//!    closed, which makes the receive return `None`;
//! 1. wait up to the graceful budget for the threads to exit;
//! 2. interrupt the stragglers (wakes them from chill-waits);
//! 3. wait a little more, then force-close their sessions and report an
//!    unclean stop.

use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, field, info, info_span, warn};

use crate::broker::{BrokerMessage, BrokerSession, Destination};
use crate::context::{ProcessContext, ProcessOutcome};
use crate::envelope::{IncomingMessage, read_incoming, send_outgoing};
use crate::error::{BrokerError, TransactionError};
use crate::factory::FactoryShared;
use crate::initiate::run_after_commit;
use crate::serializer::{deserialize_object, deserialize_state, millis_since};
use crate::trace::MessagingModel;
use crate::transaction::TransactionScope;

const IN_RECEIVE_POLLS: u32 = 100;
const IN_RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(1);
const EXTRA_GRACE: Duration = Duration::from_millis(500);
const CHILL_JITTER_MILLIS: u64 = 1000;
const CHILL_SLICE: Duration = Duration::from_millis(50);

/// Static identity of a stage.
#[derive(Debug, Clone)]
pub(crate) struct StageInfo {
    pub(crate) endpoint_id: String,
    pub(crate) stage_id: String,
    pub(crate) next_stage_id: Option<String>,
    pub(crate) model: MessagingModel,
    /// Subscription stages run exactly one processor per node.
    pub(crate) subscription: bool,
}

/// Type-erased stage lambda.
pub(crate) trait StageHandler: Send + Sync {
    fn handle(
        &self,
        stage: &StageInfo,
        shared: &FactoryShared,
        incoming: &IncomingMessage,
        scope: &TransactionScope<'_>,
    ) -> anyhow::Result<ProcessOutcome>;
}

/// A stage lambda with its reply, state and incoming types.
pub(crate) struct TypedStage<R, S, I, F> {
    lambda: F,
    _types: PhantomData<fn() -> (R, S, I)>,
}

impl<R, S, I, F> TypedStage<R, S, I, F> {
    pub(crate) fn new(lambda: F) -> Self {
        Self {
            lambda,
            _types: PhantomData,
        }
    }
}

impl<R, S, I, F> StageHandler for TypedStage<R, S, I, F>
where
    S: Serialize + DeserializeOwned + Default,
    I: DeserializeOwned,
    F: Fn(&mut ProcessContext<'_, R>, &mut S, I) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(
        &self,
        stage: &StageInfo,
        shared: &FactoryShared,
        incoming: &IncomingMessage,
        scope: &TransactionScope<'_>,
    ) -> anyhow::Result<ProcessOutcome> {
        let mut state: S = deserialize_state(incoming.trace.current_state())?;
        let dto: I = deserialize_object(
            incoming
                .trace
                .current_call()
                .and_then(|call| call.data.as_deref()),
        )?;
        let mut ctx = ProcessContext::<R>::new(stage, shared, incoming, scope);
        (self.lambda)(&mut ctx, &mut state, dto)?;
        Ok(ctx.finish(&state)?)
    }
}

/// A last-stage lambda whose return value is sent as the endpoint's reply.
pub(crate) struct ReplyingStage<R, S, I, F> {
    lambda: F,
    _types: PhantomData<fn() -> (R, S, I)>,
}

impl<R, S, I, F> ReplyingStage<R, S, I, F> {
    pub(crate) fn new(lambda: F) -> Self {
        Self {
            lambda,
            _types: PhantomData,
        }
    }
}

impl<R, S, I, F> StageHandler for ReplyingStage<R, S, I, F>
where
    R: Serialize,
    S: Serialize + DeserializeOwned + Default,
    I: DeserializeOwned,
    F: Fn(&mut ProcessContext<'_, R>, &mut S, I) -> anyhow::Result<R> + Send + Sync,
{
    fn handle(
        &self,
        stage: &StageInfo,
        shared: &FactoryShared,
        incoming: &IncomingMessage,
        scope: &TransactionScope<'_>,
    ) -> anyhow::Result<ProcessOutcome> {
        let mut state: S = deserialize_state(incoming.trace.current_state())?;
        let dto: I = deserialize_object(
            incoming
                .trace
                .current_call()
                .and_then(|call| call.data.as_deref()),
        )?;
        let mut ctx = ProcessContext::<R>::new(stage, shared, incoming, scope);
        let reply = (self.lambda)(&mut ctx, &mut state, dto)?;
        ctx.reply(&reply)?;
        Ok(ctx.finish(&state)?)
    }
}

/// Lifecycle state of one processor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Starting = 0,
    Receiving = 1,
    Processing = 2,
    Crashed = 3,
    Stopping = 4,
    Stopped = 5,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Receiving,
            2 => Self::Processing,
            3 => Self::Crashed,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One stage of an endpoint, owning its processor pool.
pub struct MatsStage {
    info: Arc<StageInfo>,
    handler: Arc<dyn StageHandler>,
    shared: Arc<FactoryShared>,
    concurrency: AtomicUsize,
    processors: Mutex<Vec<StageProcessor>>,
    consumer_ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for MatsStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatsStage")
            .field("stage_id", &self.info.stage_id)
            .field("concurrency", &self.concurrency())
            .finish()
    }
}

impl MatsStage {
    pub(crate) fn new(
        info: StageInfo,
        handler: Arc<dyn StageHandler>,
        shared: Arc<FactoryShared>,
        concurrency: usize,
    ) -> Self {
        let concurrency = if info.subscription { 1 } else { concurrency.max(1) };
        Self {
            info: Arc::new(info),
            handler,
            shared,
            concurrency: AtomicUsize::new(concurrency),
            processors: Mutex::new(Vec::new()),
            consumer_ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stage_id(&self) -> &str {
        &self.info.stage_id
    }

    pub fn endpoint_id(&self) -> &str {
        &self.info.endpoint_id
    }

    pub fn next_stage_id(&self) -> Option<&str> {
        self.info.next_stage_id.as_deref()
    }

    pub fn messaging_model(&self) -> MessagingModel {
        self.info.model
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::SeqCst)
    }

    pub fn is_subscription(&self) -> bool {
        self.info.subscription
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.processors).is_empty()
    }

    pub fn processor_states(&self) -> Vec<ProcessorState> {
        lock(&self.processors)
            .iter()
            .map(StageProcessor::state)
            .collect()
    }

    /// Spawns the processors, unless already running.
    pub fn start(&self) {
        let mut processors = lock(&self.processors);
        if !processors.is_empty() {
            return;
        }
        self.consumer_ready.store(false, Ordering::SeqCst);
        let count = self.concurrency();
        info!(stage_id = %self.info.stage_id, concurrency = count, "Starting stage");
        for number in 0..count {
            match StageProcessor::spawn(self, number) {
                Ok(processor) => processors.push(processor),
                Err(e) => error!(
                    stage_id = %self.info.stage_id,
                    error = %e,
                    "Could not spawn stage processor thread"
                ),
            }
        }
    }

    /// Stops all processors. Returns `true` if every thread exited within the budget.
    pub fn stop(&self, graceful: Duration) -> bool {
        let processors = std::mem::take(&mut *lock(&self.processors));
        if processors.is_empty() {
            return true;
        }
        info!(
            stage_id = %self.info.stage_id,
            processors = processors.len(),
            graceful_millis = graceful.as_millis() as u64,
            "Stopping stage"
        );

        for processor in &processors {
            processor.phase0_signal();
        }
        let deadline = Instant::now() + graceful;
        for processor in &processors {
            processor.phase1_await(deadline.saturating_duration_since(Instant::now()));
        }
        for processor in &processors {
            processor.phase2_interrupt();
        }
        let mut clean = true;
        for processor in processors {
            clean &= processor.phase3_finish(&self.info.stage_id);
        }
        if !clean {
            warn!(stage_id = %self.info.stage_id, "Stage did not stop cleanly");
        }
        clean
    }

    /// Changes the processor count, restarting the stage if it runs.
    ///
    /// Subscription stages keep their single processor: more would handle
    /// every published message more than once on this node.
    pub fn set_concurrency(&self, concurrency: usize) {
        if self.info.subscription {
            if concurrency != 1 {
                warn!(
                    stage_id = %self.info.stage_id,
                    requested = concurrency,
                    "Subscription stage runs one processor per node, ignoring concurrency change"
                );
            }
            return;
        }
        self.concurrency.store(concurrency.max(1), Ordering::SeqCst);
        if self.is_running() {
            self.stop(self.shared.config.graceful_shutdown);
            self.start();
        }
    }

    /// Waits until at least one processor has its consumer in place.
    pub fn wait_for_receiving(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.consumer_ready.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

/// Flags shared between a processor thread and whoever stops it.
struct ProcessorShared {
    run_flag: AtomicBool,
    in_receive: AtomicBool,
    interrupted: AtomicBool,
    state: AtomicU8,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
}

impl ProcessorShared {
    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn running(&self) -> bool {
        self.run_flag.load(Ordering::SeqCst)
    }

    fn close_session(&self) {
        if let Some(session) = lock(&self.session).take() {
            session.close();
        }
    }
}

struct StageProcessor {
    ident: String,
    shared: Arc<ProcessorShared>,
    thread: JoinHandle<()>,
    exited: Receiver<()>,
}

impl StageProcessor {
    fn spawn(stage: &MatsStage, number: usize) -> std::io::Result<Self> {
        let ident = format!("{}:{}#{}", stage.shared.config.name, stage.info.stage_id, number);
        let shared = Arc::new(ProcessorShared {
            run_flag: AtomicBool::new(true),
            in_receive: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            state: AtomicU8::new(ProcessorState::Starting as u8),
            session: Mutex::new(None),
        });
        let (exit_guard, exited) = channel::bounded::<()>(0);
        let runner = ProcessorRunner {
            ident: ident.clone(),
            number,
            processor: shared.clone(),
            info: stage.info.clone(),
            handler: stage.handler.clone(),
            factory: stage.shared.clone(),
            consumer_ready: stage.consumer_ready.clone(),
            _exit_guard: exit_guard,
        };
        let thread = thread::Builder::new()
            .name(ident.clone())
            .spawn(move || runner.run())?;
        Ok(Self {
            ident,
            shared,
            thread,
            exited,
        })
    }

    fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    fn is_alive(&self) -> bool {
        matches!(self.exited.try_recv(), Err(TryRecvError::Empty))
    }

    fn phase0_signal(&self) {
        self.shared.run_flag.store(false, Ordering::SeqCst);
        if !self.is_alive() {
            return;
        }
        for _ in 0..IN_RECEIVE_POLLS {
            if self.shared.in_receive.load(Ordering::SeqCst) {
                info!(processor = %self.ident, "Processor is in receive, closing its session to unblock it");
                self.shared.close_session();
                return;
            }
            thread::sleep(IN_RECEIVE_POLL_INTERVAL);
        }
        info!(processor = %self.ident, "Processor is not in receive, letting it finish its work");
    }

    fn phase1_await(&self, budget: Duration) {
        if let Err(RecvTimeoutError::Timeout) = self.exited.recv_timeout(budget) {
            warn!(processor = %self.ident, "Processor did not exit within the graceful budget");
        }
    }

    fn phase2_interrupt(&self) {
        if self.is_alive() {
            info!(processor = %self.ident, "Interrupting processor");
            self.shared.interrupted.store(true, Ordering::SeqCst);
            self.thread.thread().unpark();
        }
    }

    fn phase3_finish(self, stage_id: &str) -> bool {
        if self.is_alive() && matches!(self.exited.recv_timeout(EXTRA_GRACE), Err(RecvTimeoutError::Timeout)) {
            warn!(
                processor = %self.ident,
                "Processor is still alive after interrupt, force-closing its session"
            );
            self.shared.close_session();
            // The thread is detached, not joined: it exits whenever its lambda returns.
            warn!(
                stage_id,
                processor = %self.ident,
                thread = ?self.thread.thread().id(),
                "Leaking processor thread of stopped stage"
            );
            return false;
        }
        if self.thread.join().is_err() {
            warn!(processor = %self.ident, "Processor thread panicked");
        }
        true
    }
}

enum LoopExit {
    Shutdown,
    SessionLost,
}

struct ProcessorRunner {
    ident: String,
    number: usize,
    processor: Arc<ProcessorShared>,
    info: Arc<StageInfo>,
    handler: Arc<dyn StageHandler>,
    factory: Arc<FactoryShared>,
    consumer_ready: Arc<AtomicBool>,
    /// Dropped when the thread ends, which disconnects the `exited` channel.
    _exit_guard: Sender<()>,
}

impl ProcessorRunner {
    fn run(self) {
        let span = info_span!(
            "mats.processor",
            stage_id = %self.info.stage_id,
            processor = self.number
        );
        let _entered = span.enter();
        info!(processor = %self.ident, "Processor started");

        while self.processor.running() {
            self.processor.set_state(ProcessorState::Starting);
            let session = match self.factory.broker.create_session() {
                Ok(session) => session,
                Err(e) => {
                    self.crash(&e);
                    continue;
                }
            };
            {
                let mut slot = lock(&self.processor.session);
                if !self.processor.running() {
                    session.close();
                    break;
                }
                *slot = Some(session.clone());
            }

            match self.receive_loop(session.as_ref()) {
                Ok(LoopExit::Shutdown) => break,
                Ok(LoopExit::SessionLost) => {
                    warn!(processor = %self.ident, "Session was closed while running, creating a new one");
                    self.processor.close_session();
                }
                Err(e) => {
                    if !self.processor.running() {
                        info!(processor = %self.ident, error = %e, "Broker error during shutdown");
                        break;
                    }
                    self.crash(&e);
                }
            }
        }

        self.processor.set_state(ProcessorState::Stopping);
        self.processor.close_session();
        self.processor.set_state(ProcessorState::Stopped);
        info!(processor = %self.ident, "Processor exited");
    }

    fn crash(&self, error: &BrokerError) {
        self.processor.set_state(ProcessorState::Crashed);
        self.processor.close_session();
        let chill = self.factory.config.chill_wait
            + Duration::from_millis(rand::thread_rng().gen_range(0..CHILL_JITTER_MILLIS));
        warn!(
            processor = %self.ident,
            error = %error,
            chill_millis = chill.as_millis() as u64,
            "Broker session crashed, chilling before retrying"
        );
        self.chill_wait(chill);
    }

    fn chill_wait(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if !self.processor.running() || self.processor.interrupted.load(Ordering::SeqCst) {
                return;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            thread::park_timeout(left.min(CHILL_SLICE));
        }
    }

    fn receive_loop(&self, session: &dyn BrokerSession) -> Result<LoopExit, BrokerError> {
        let destination = Destination::new(
            format!("{}{}", self.factory.config.destination_prefix, self.info.stage_id),
            self.info.model,
        );
        let consumer = session.create_consumer(&destination)?;
        self.consumer_ready.store(true, Ordering::SeqCst);

        while self.processor.running() {
            self.processor.set_state(ProcessorState::Receiving);
            self.processor.in_receive.store(true, Ordering::SeqCst);
            let received = consumer.receive();
            self.processor.in_receive.store(false, Ordering::SeqCst);

            let message = match received? {
                Some(message) => message,
                None if self.processor.running() => return Ok(LoopExit::SessionLost),
                None => return Ok(LoopExit::Shutdown),
            };
            self.processor.set_state(ProcessorState::Processing);
            self.process(session, &message)?;
        }
        Ok(LoopExit::Shutdown)
    }

    /// Handles one message. Only session-level failures come back as `Err`.
    fn process(&self, session: &dyn BrokerSession, message: &BrokerMessage) -> Result<(), BrokerError> {
        let started = Instant::now();
        let span = info_span!(
            "mats.message",
            trace_id = field::Empty,
            flow_id = field::Empty,
            from = field::Empty,
            message_id = field::Empty,
        );
        let _entered = span.enter();

        let factory = self.factory.as_ref();
        let result = factory.transactions.do_transaction(session, |scope| {
            let incoming = read_incoming(factory, message, &self.info.stage_id)?;
            if let Some(call) = incoming.trace.current_call() {
                span.record("trace_id", incoming.trace.trace_id());
                span.record("flow_id", incoming.trace.flow_id());
                span.record("from", call.from.as_str());
                span.record("message_id", call.message_id.as_str());
                info!(
                    call_type = %call.call_type,
                    system_message_id = %incoming.system_message_id,
                    redelivery_count = incoming.redelivery_count,
                    size = incoming.trace_bytes.len(),
                    millis_deserialization = incoming.millis_deserialization,
                    "RECEIVED message"
                );
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.handler.handle(&self.info, factory, &incoming, scope)
            }))
            .unwrap_or_else(|panic| Err(anyhow::anyhow!("stage lambda panicked: {}", panic_message(&*panic))))?;

            send_outgoing(factory, session, outcome.messages)?;
            Ok(outcome.after_commit)
        });

        match result {
            Ok(after_commit) => {
                run_after_commit(after_commit);
                info!(millis_total = millis_since(started), "PROCESSED message");
                Ok(())
            }
            Err(TransactionError::Refused(refuse)) => {
                error!(reason = %refuse.reason, "Message REFUSED, rolled back without redelivery");
                Ok(())
            }
            Err(err) if err.is_session_failure() => {
                error!(error = %err, "Transaction failed on the broker session");
                Err(match err {
                    TransactionError::Commit(e)
                    | TransactionError::Rollback(e)
                    | TransactionError::MessageSend(e) => e,
                    other => BrokerError::Io {
                        operation: "process",
                        details: other.to_string(),
                    },
                })
            }
            Err(err) => {
                info!(error = %err, "Processing failed, rolled back, looping to receive the next message");
                Ok(())
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
