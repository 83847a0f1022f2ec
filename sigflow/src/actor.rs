//! Exclusive access to a block, between scheduler threads and external
//! callers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, TryLockError};
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::block::{Block, PortKind, PortLayout, WorkInfo, WorkIo};
use crate::errors::{Error, Result};
use crate::label::Label;
use crate::logging::{SchedulerEvent, SchedulerLogger};
use crate::ports::{InputPort, OutputPort};
use crate::value::Value;

/// How long acquisition waits sleep before rechecking their condition.
const ACQUIRE_WAIT: Duration = Duration::from_millis(1);

/// The wake-and-exclusion half of a worker actor, shared with the input
/// ports that flag it and with the scheduler that polls it.
///
/// The change flag coalesces readiness notifications; the external counter
/// lets the worker thread yield to configuration callers instead of racing
/// them for the lock.
pub(crate) struct ActorInterface {
    /// A state change occurred; the next successful claim clears it.
    change_flagged: AtomicBool,
    /// Threads inside or waiting on an external call. Non-zero means the
    /// worker must stand aside.
    external_acquired: AtomicU32,
    acquire_mutex: Mutex<()>,
    acquire_cond: Condvar,
    /// A worker thread is blocked on the condvar and wants a notify.
    acquire_waiting: AtomicBool,
    cancelled: AtomicBool,
}

impl ActorInterface {
    fn new() -> ActorInterface {
        ActorInterface {
            change_flagged: AtomicBool::new(false),
            external_acquired: AtomicU32::new(0),
            acquire_mutex: Mutex::new(()),
            acquire_cond: Condvar::new(),
            acquire_waiting: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Marks a state change from outside the worker context and wakes a
    /// blocked worker thread to observe it.
    pub(crate) fn flag_external_change(&self) {
        self.change_flagged.store(true, Ordering::Release);
        if self.acquire_waiting.load(Ordering::Acquire) {
            self.acquire_cond.notify_one();
        }
    }

    /// Marks a state change from within the worker context; the worker is
    /// already active or about to re-poll, so no wake is needed.
    pub(crate) fn flag_internal_change(&self) {
        self.change_flagged.store(true, Ordering::Release);
    }

    /// Wakes any blocked thread without flagging a change; used at
    /// shutdown so acquisitions observe cancellation.
    pub(crate) fn wake_no_change(&self) {
        self.acquire_cond.notify_all();
    }

    pub(crate) fn in_external_call(&self) -> bool {
        self.external_acquired.load(Ordering::Acquire) != 0
    }

    fn claim_change(&self) -> bool {
        self.change_flagged.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.acquire_cond.notify_all();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Exclusive state of one block: the block itself and its ports.
pub(crate) struct ActorCore {
    pub(crate) block: Box<dyn Block>,
    pub(crate) inputs: Vec<InputPort>,
    pub(crate) outputs: Vec<OutputPort>,
    pub(crate) active: bool,
    pub(crate) error_count: u64,
}

impl ActorCore {
    pub(crate) fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|port| port.name() == name)
    }

    pub(crate) fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|port| port.name() == name)
    }
}

enum Outcome {
    NotReady,
    Worked { consumed: u64, produced: u64, progress: bool },
}

/// Owns one block: grants exclusive access, evaluates readiness, runs
/// `work()`, and performs end-of-work propagation.
pub(crate) struct WorkerActor {
    pub(crate) name: String,
    pub(crate) uid: u64,
    iface: Arc<ActorInterface>,
    core: Mutex<ActorCore>,
    work_events: AtomicU64,
    errors: AtomicU64,
    created: Instant,
    /// Deadline of a pending `yield_for`, in nanos since `created`; zero
    /// when no yield is outstanding.
    yield_until_ns: AtomicU64,
    logger: Option<SchedulerLogger>,
}

impl WorkerActor {
    pub(crate) fn new(
        name: String,
        uid: u64,
        block: Box<dyn Block>,
        layout: &PortLayout,
        logger: Option<SchedulerLogger>,
    ) -> Arc<WorkerActor> {
        let iface = Arc::new(ActorInterface::new());

        let inputs: Vec<InputPort> = layout
            .inputs
            .iter()
            .map(|decl| {
                let port = InputPort::new(
                    &decl.name,
                    decl.numeric_index(),
                    decl.dtype,
                    &decl.domain,
                    decl.kind == PortKind::Slot,
                );
                port.shared.bind_actor(&iface);
                port
            })
            .collect();

        let outputs: Vec<OutputPort> = layout
            .outputs
            .iter()
            .map(|decl| {
                OutputPort::new(
                    &decl.name,
                    decl.numeric_index(),
                    decl.dtype,
                    &decl.domain,
                    decl.kind == PortKind::Signal,
                    decl.circular,
                )
            })
            .collect();

        Arc::new(WorkerActor {
            name,
            uid,
            iface,
            core: Mutex::new(ActorCore { block, inputs, outputs, active: false, error_count: 0 }),
            work_events: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            created: Instant::now(),
            yield_until_ns: AtomicU64::new(0),
            logger,
        })
    }

    pub(crate) fn iface(&self) -> &Arc<ActorInterface> {
        &self.iface
    }

    /// Count of completed work sessions; the activity signal behind
    /// `wait_inactive`.
    pub(crate) fn work_events(&self) -> u64 {
        self.work_events.load(Ordering::Acquire)
    }

    pub(crate) fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub(crate) fn external_pending(&self) -> bool {
        self.iface.in_external_call()
    }

    /// Acquires exclusive access for a caller outside the scheduler.
    ///
    /// Waits in bounded intervals rather than trusting notification alone;
    /// the worker thread sees the pending-external counter and stands
    /// aside. Returns `Cancelled` once the runtime is shutting down.
    pub(crate) fn external_call<R>(&self, f: impl FnOnce(&mut ActorCore) -> Result<R>) -> Result<R> {
        self.iface.external_acquired.fetch_add(1, Ordering::AcqRel);
        let mut guard = loop {
            if self.iface.is_cancelled() {
                self.iface.external_acquired.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::Cancelled);
            }
            match self.core.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(_)) => {
                    self.iface.external_acquired.fetch_sub(1, Ordering::AcqRel);
                    return Err(Error::Cancelled);
                }
                Err(TryLockError::WouldBlock) => {
                    let lock = self.iface.acquire_mutex.lock().unwrap();
                    let _ = self.iface.acquire_cond.wait_timeout(lock, ACQUIRE_WAIT).unwrap();
                }
            }
        };

        let result = f(&mut guard);
        drop(guard);

        // The call may have changed block state; let the worker re-evaluate.
        self.iface.external_acquired.fetch_sub(1, Ordering::AcqRel);
        self.iface.flag_internal_change();
        self.iface.acquire_cond.notify_all();
        result
    }

    /// One scheduler visit: claim the change flag, take the lock, and run
    /// a work session if the block is ready. Returns true when the actor
    /// was acquired.
    pub(crate) fn step(&self, wait_enabled: bool) -> bool {
        if !self.acquire_change(wait_enabled) {
            return false;
        }
        let mut guard = match self.core.try_lock() {
            Ok(guard) => guard,
            // Busy in an external call: give it priority and re-flag.
            Err(_) => {
                self.iface.flag_internal_change();
                return false;
            }
        };
        self.run(&mut guard);
        drop(guard);
        if self.iface.in_external_call() {
            self.iface.acquire_cond.notify_all();
        }
        true
    }

    /// Claims the change notification, optionally blocking on the condvar
    /// for a bounded interval. External callers always win: while one is
    /// pending the claim is refused.
    fn acquire_change(&self, wait_enabled: bool) -> bool {
        if !wait_enabled {
            if self.iface.in_external_call() {
                return false;
            }
            return self.iface.claim_change();
        }

        self.iface.acquire_waiting.store(true, Ordering::Relaxed);
        let mut claimed = false;
        {
            let guard = self.iface.acquire_mutex.lock().unwrap();
            let _ = self
                .iface
                .acquire_cond
                .wait_timeout_while(guard, ACQUIRE_WAIT, |_| {
                    if self.iface.is_cancelled() {
                        return false;
                    }
                    if self.iface.in_external_call() {
                        return true;
                    }
                    claimed = self.iface.claim_change();
                    !claimed
                })
                .unwrap();
        }
        self.iface.acquire_waiting.store(false, Ordering::Relaxed);
        claimed
    }

    fn run(&self, core: &mut ActorCore) {
        if !core.active {
            return;
        }
        match self.run_inner(core) {
            Ok(Outcome::NotReady) => {}
            Ok(Outcome::Worked { consumed, produced, progress }) => {
                if progress {
                    self.work_events.fetch_add(1, Ordering::Release);
                    if let Some(logger) = &self.logger {
                        logger.log(SchedulerEvent::Work { block: self.uid, consumed, produced });
                    }
                    // More may be possible immediately; revisit.
                    self.iface.flag_internal_change();
                }
            }
            Err(err) => {
                core.error_count += 1;
                self.errors.fetch_add(1, Ordering::Relaxed);
                if let Some(logger) = &self.logger {
                    logger.log(SchedulerEvent::BlockError { block: self.uid, message: err.to_string() });
                }
                // The rest of the topology keeps running without it.
                let _ = core.block.deactivate();
                core.active = false;
            }
        }
    }

    fn run_inner(&self, core: &mut ActorCore) -> Result<Outcome> {
        let slot_progress = self.dispatch_slots(core);

        for input in core.inputs.iter_mut() {
            input.stage()?;
        }
        for output in core.outputs.iter_mut() {
            output.stage();
        }

        // Read-before-write: expose the input's front buffer as the write
        // buffer when it is uniquely held and element sizes agree.
        for at in 0..core.outputs.len() {
            let Some(input_index) = core.outputs[at].read_before_write_index() else { continue };
            let Some(input) = core.inputs.get(input_index) else { continue };
            let eligible = input.dtype().size() == core.outputs[at].dtype().size()
                && input.buffer().length > 0
                // The accumulator front and the staged view are the only
                // two references.
                && input.buffer().managed().map_or(false, |m| m.use_count() <= 2);
            if eligible {
                let front = input.buffer().clone();
                core.outputs[at].substitute_buffer(front);
            }
        }

        // A dispatched slot call may have armed the block; give work() the
        // chance to react even when no stream input is ready.
        if !slot_progress && !self.runnable(core) {
            return Ok(Outcome::NotReady);
        }
        self.yield_until_ns.store(0, Ordering::Relaxed);

        let info = work_info(core);
        let messages_before: u64 = core.outputs.iter().map(OutputPort::total_messages).sum::<u64>()
            + core.inputs.iter().map(InputPort::total_messages).sum::<u64>();
        let yield_request;
        {
            let mut io = WorkIo {
                inputs: &mut core.inputs,
                outputs: &mut core.outputs,
                info,
                yield_for_ns: None,
            };
            core.block.work(&mut io)?;
            yield_request = io.yield_for_ns;
        }

        // Apply deferred consumption and gather labels for propagation.
        let mut consumed_total = 0u64;
        let mut propagations: SmallVec<[(usize, SmallVec<[Label; 4]>); 2]> = SmallVec::new();
        for (at, input) in core.inputs.iter_mut().enumerate() {
            let (labels, consumed) = input.commit_work(&self.name)?;
            consumed_total += consumed;
            if !labels.is_empty() {
                propagations.push((at, labels));
            }
        }
        for (at, labels) in &propagations {
            let mut io = WorkIo {
                inputs: &mut core.inputs,
                outputs: &mut core.outputs,
                info,
                yield_for_ns: None,
            };
            core.block.propagate_labels(*at, labels, &mut io)?;
        }

        let mut produced_total = 0u64;
        for output in core.outputs.iter_mut() {
            produced_total += output.flush(&self.name)?;
        }

        if let Some(timeout_ns) = yield_request {
            self.set_yield(timeout_ns);
        }
        let messages_after: u64 = core.outputs.iter().map(OutputPort::total_messages).sum::<u64>()
            + core.inputs.iter().map(InputPort::total_messages).sum::<u64>();
        let progress =
            slot_progress || consumed_total > 0 || produced_total > 0 || messages_after > messages_before;
        Ok(Outcome::Worked { consumed: consumed_total, produced: produced_total, progress })
    }

    /// Pops queued slot calls and dispatches them into the block's
    /// callable registry. Call failures count against the block but do
    /// not deactivate it.
    fn dispatch_slots(&self, core: &mut ActorCore) -> bool {
        let mut progressed = false;
        let block = &mut core.block;
        for input in core.inputs.iter_mut().filter(|input| input.is_slot()) {
            while let Some(message) = input.pop_message() {
                progressed = true;
                let args_storage;
                let args: &[Value] = match &message {
                    Value::List(items) => items,
                    other => {
                        args_storage = [other.clone()];
                        &args_storage
                    }
                };
                if let Err(err) = block.call(input.name(), args) {
                    core.error_count += 1;
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(logger) = &self.logger {
                        logger.log(SchedulerEvent::BlockError {
                            block: self.uid,
                            message: err.attribute(&self.name).to_string(),
                        });
                    }
                }
            }
        }
        progressed
    }

    /// The readiness predicate evaluated against staged port state.
    fn runnable(&self, core: &ActorCore) -> bool {
        // Async messages and front-anchored labels always wake a block.
        for input in core.inputs.iter().filter(|input| !input.is_slot()) {
            if input.has_message() || input.has_label_at_front() {
                return true;
            }
        }

        if self.yield_expired() {
            return true;
        }

        let mut has_stream_input = false;
        let mut any_ready = false;
        let mut reserves_met = true;
        for input in core.inputs.iter().filter(|input| !input.is_slot()) {
            has_stream_input = true;
            if input.elements() >= 1 && input.elements() >= input.reserve() {
                any_ready = true;
            }
            if input.reserve() > 0 && input.elements() < input.reserve() {
                reserves_met = false;
            }
        }
        if has_stream_input {
            return any_ready && reserves_met;
        }

        // A source paces itself on downstream space; a block with no
        // stream ports at all (pure signal/slot) runs whenever flagged.
        let mut has_stream_output = false;
        let mut output_space = false;
        for output in core.outputs.iter().filter(|output| !output.is_signal()) {
            has_stream_output = true;
            if output.elements() > 0 {
                output_space = true;
            }
        }
        !has_stream_output || output_space
    }

    fn set_yield(&self, timeout_ns: u64) {
        let deadline = (self.created.elapsed().as_nanos() as u64).saturating_add(timeout_ns).max(1);
        self.yield_until_ns.store(deadline, Ordering::Relaxed);
    }

    fn yield_expired(&self) -> bool {
        let deadline = self.yield_until_ns.load(Ordering::Relaxed);
        deadline != 0 && self.created.elapsed().as_nanos() as u64 >= deadline
    }

    /// Scheduler-side poll: re-flag the actor once a pending yield
    /// deadline passes.
    pub(crate) fn poll_yield(&self) {
        if self.yield_expired() {
            self.iface.flag_external_change();
        }
    }
}

/// Derives the convenience element counts for `work()`.
fn work_info(core: &ActorCore) -> WorkInfo {
    let min_in = core
        .inputs
        .iter()
        .filter(|input| !input.is_slot())
        .map(InputPort::elements)
        .min();
    let min_out = core
        .outputs
        .iter()
        .filter(|output| !output.is_signal())
        .map(OutputPort::elements)
        .min();
    WorkInfo {
        min_elements: match (min_in, min_out) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => 0,
        },
        min_in_elements: min_in.unwrap_or(0),
        min_out_elements: min_out.unwrap_or(0),
        max_timeout_ns: ACQUIRE_WAIT.as_nanos() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::PortLayout;
    use sigflow_buffer::{DType, GenericPool};
    use std::sync::atomic::AtomicBool;
    use std::thread;

    /// Produces one element per work call; setter asserts it never runs
    /// inside work.
    struct SlowProducer {
        in_work: Arc<AtomicBool>,
        value: Arc<AtomicU64>,
        seen_by_work: Arc<AtomicU64>,
    }

    impl Block for SlowProducer {
        fn work(&mut self, io: &mut WorkIo) -> Result<()> {
            self.in_work.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.seen_by_work.store(self.value.load(Ordering::SeqCst), Ordering::SeqCst);
            self.in_work.store(false, Ordering::SeqCst);
            if io.outputs[0].elements() > 0 {
                io.outputs[0].produce(1);
            }
            Ok(())
        }

        fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
            match name {
                "setValue" => {
                    assert!(!self.in_work.load(Ordering::SeqCst), "setter interleaved with work");
                    self.value.store(args[0].as_u64()?, Ordering::SeqCst);
                    Ok(Value::Null)
                }
                other => Err(Error::CallNotFound { block: String::new(), call: other.to_owned() }),
            }
        }
    }

    fn activated_producer() -> (Arc<WorkerActor>, Arc<AtomicBool>, Arc<AtomicU64>, Arc<AtomicU64>) {
        let in_work = Arc::new(AtomicBool::new(false));
        let value = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(AtomicU64::new(0));
        let block = SlowProducer {
            in_work: in_work.clone(),
            value: value.clone(),
            seen_by_work: seen.clone(),
        };
        let layout = PortLayout::new().output("0", DType::from_markup("uint8").unwrap());
        let actor = WorkerActor::new("producer".into(), 1, Box::new(block), &layout, None);
        actor
            .external_call(|core| {
                core.outputs[0].set_manager(Some(GenericPool::new(4, 16).unwrap()));
                core.active = true;
                Ok(())
            })
            .unwrap();
        (actor, in_work, value, seen)
    }

    #[test]
    fn external_setter_never_interleaves_with_work() {
        let (actor, in_work, _value, seen) = activated_producer();

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let actor = actor.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    actor.iface().flag_external_change();
                    actor.step(false);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        // Wait until a work call is in flight, then set mid-work.
        while !in_work.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        let handle = crate::block::BlockHandle { actor: actor.clone() };
        handle.call("setValue", &[Value::from(7u64)]).unwrap();

        // The setter completed only after work released; the next work
        // call observes the new value.
        for _ in 0..2000 {
            if seen.load(Ordering::SeqCst) == 7 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(actor.work_events() >= 1);
    }

    #[test]
    fn worker_yields_to_pending_external_calls() {
        let (actor, _in_work, _value, _seen) = activated_producer();

        // Simulate a pending external caller.
        actor.iface().external_acquired.fetch_add(1, Ordering::AcqRel);
        actor.iface().flag_external_change();
        assert!(!actor.step(false), "worker should stand aside for external callers");
        actor.iface().external_acquired.fetch_sub(1, Ordering::AcqRel);

        // Flag still pending: the worker claims it once the caller leaves.
        assert!(actor.step(false));
    }

    #[test]
    fn cancelled_actor_rejects_external_calls() {
        let (actor, _in_work, _value, _seen) = activated_producer();
        actor.iface().cancel();
        let err = actor.external_call(|_core| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn inactive_blocks_do_not_run() {
        let (actor, _in_work, _value, _seen) = activated_producer();
        actor.external_call(|core| {
            core.active = false;
            Ok(())
        })
        .unwrap();
        actor.iface().flag_external_change();
        actor.step(false);
        assert_eq!(actor.work_events(), 0);
    }

    #[test]
    fn source_paces_on_output_space() {
        let (actor, _in_work, _value, _seen) = activated_producer();
        // Pool of 4 x 16-byte slabs, one element produced per work call:
        // the source runs while slabs remain and parks when exhausted.
        for _ in 0..200 {
            actor.iface().flag_external_change();
            actor.step(false);
        }
        // All four slabs were produced into and forwarded nowhere: with no
        // subscribers the chunks dropped and recycled, so work continues.
        assert!(actor.work_events() > 4);
    }
}
