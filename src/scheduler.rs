//! The commit pipeline of a sink session.
//!
//! Every frame travels through three slots:
//!
//! - *pending*: the transaction is built but waits, because another commit is outstanding,
//! - *queued*: the transaction was committed and waits for the hardware to apply it,
//! - *active*: the transaction is on screen.
//!
//! Each slot holds at most one transaction and transactions only ever move left to right.
//! A new frame is committed right away if nothing is queued, parked in the pending slot
//! otherwise, and dropped if the pending slot is already taken. When the queued commit
//! completes it becomes active, the previously active frame is released to its producer
//! and the pending transaction, if any, is committed.
//!
//! All slot transitions happen under a single lock. Commits never block, so completion
//! notifications can be delivered from any thread without stalling the producer.

use std::sync::{Arc, Mutex, MutexGuard};

use calloop::channel::Sender;
use tracing::{debug, error, info_span, trace, warn};

use crate::{
    buffer::{BufferId, FrameBuffer},
    device::{AtomicRequest, CommitFlags, DisplayDevice, PropertyTarget, PropertyValue, TransactionId},
    error::{CommitError, ProtocolViolation, SubmitError},
    topology::ObjectId,
    utils::Size,
};

/// Hardware objects a session displays on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPath {
    /// Connector showing the frames
    pub connector: ObjectId,
    /// Crtc driving the connector
    pub crtc: ObjectId,
    /// Primary plane scanning out the frames
    pub plane: ObjectId,
    /// Blob of the selected mode
    pub mode_blob: u64,
    /// Frame size, equal to the mode size
    pub size: Size,
}

/// An atomic request and the frame it presents
#[derive(Debug)]
pub struct Transaction<B> {
    request: AtomicRequest,
    flags: CommitFlags,
    buffer: B,
}

impl<B> Transaction<B> {
    /// Identity of the request
    pub fn id(&self) -> TransactionId {
        self.request.id()
    }

    /// The request committed for this frame
    pub fn request(&self) -> &AtomicRequest {
        &self.request
    }

    /// Flags the request is committed with
    pub fn flags(&self) -> CommitFlags {
        self.flags
    }
}

/// Outcome of a frame submission
#[derive(Debug)]
pub enum FrameStatus<B> {
    /// The frame was committed and waits for the hardware
    Queued,
    /// The frame waits for the outstanding commit to complete
    Pending,
    /// The frame was dropped, because another one is already waiting.
    ///
    /// The buffer was never displayed and is handed straight back.
    Dropped(B),
}

impl<B> FrameStatus<B> {
    /// Check if the frame will be displayed
    pub fn is_accepted(&self) -> bool {
        !matches!(self, FrameStatus::Dropped(_))
    }
}

/// Transactions and buffers occupying the slots at a given time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotSnapshot {
    /// Transaction waiting to be committed
    pub pending: Option<(TransactionId, BufferId)>,
    /// Transaction waiting for the hardware
    pub queued: Option<(TransactionId, BufferId)>,
    /// Transaction on screen
    pub active: Option<(TransactionId, BufferId)>,
}

#[derive(Debug)]
struct State<B> {
    pending: Option<Transaction<B>>,
    queued: Option<Transaction<B>>,
    active: Option<Transaction<B>>,
    next_id: u64,
    // transactions with a lower id belong to an earlier session
    session_start: u64,
    poisoned: Option<ProtocolViolation>,
    // pending frames stay parked while the output is being torn down
    suspended: bool,
    released: Sender<B>,
}

/// Owner of the pending, queued and active transactions
#[derive(Debug)]
pub struct CommitScheduler<D, B> {
    device: Arc<D>,
    state: Mutex<State<B>>,
    span: tracing::Span,
}

impl<D, B> CommitScheduler<D, B>
where
    D: DisplayDevice,
    B: FrameBuffer,
{
    /// Create a scheduler committing to `device`.
    ///
    /// Buffers replaced on screen are sent through `released`.
    pub fn new(device: Arc<D>, released: Sender<B>) -> Self {
        CommitScheduler {
            device,
            state: Mutex::new(State {
                pending: None,
                queued: None,
                active: None,
                next_id: 1,
                session_start: 1,
                poisoned: None,
                suspended: false,
                released,
            }),
            span: info_span!("commit_scheduler"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<B>> {
        // a panic while holding the lock can only leave fully formed slots behind
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Check if a frame waits in the pending slot
    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// The violation that stopped the scheduler, if any
    pub fn poisoned(&self) -> Option<ProtocolViolation> {
        self.lock().poisoned
    }

    /// Identities currently occupying the slots
    pub fn snapshot(&self) -> SlotSnapshot {
        let state = self.lock();
        let ids = |slot: &Option<Transaction<B>>| slot.as_ref().map(|t| (t.id(), t.buffer.id()));
        SlotSnapshot {
            pending: ids(&state.pending),
            queued: ids(&state.queued),
            active: ids(&state.active),
        }
    }

    /// Present `buffer`, imported as `framebuffer`, on `output`.
    ///
    /// The first frame of a session additionally activates the whole output path and is
    /// committed with [`CommitFlags::ALLOW_MODESET`]. A rejected commit leaves the slots
    /// untouched and hands the buffer back inside the error.
    #[profiling::function]
    pub fn submit(
        &self,
        buffer: B,
        framebuffer: ObjectId,
        output: &OutputPath,
    ) -> Result<FrameStatus<B>, SubmitError<B>> {
        let _guard = self.span.enter();
        let mut state = self.lock();

        if let Some(violation) = state.poisoned {
            return Err(SubmitError::new(buffer, violation));
        }
        if state.pending.is_some() {
            debug!(buffer = buffer.id().0, "Frame already pending, dropping frame");
            return Ok(FrameStatus::Dropped(buffer));
        }

        let id = TransactionId(state.next_id);
        state.next_id += 1;

        let mut request = AtomicRequest::new(id);
        let mut flags = CommitFlags::ASYNC;
        request.add_property(
            PropertyTarget::Plane(output.plane),
            "FB_ID",
            PropertyValue::Object(Some(framebuffer)),
        );
        if state.active.is_none() && state.queued.is_none() {
            activate_output(&mut request, output);
            flags |= CommitFlags::ALLOW_MODESET;
        }
        let transaction = Transaction {
            request,
            flags,
            buffer,
        };

        if state.queued.is_some() {
            trace!(transaction = %id, "Commit outstanding, parking frame");
            state.pending = Some(transaction);
            return Ok(FrameStatus::Pending);
        }

        match self.device.commit(&transaction.request, flags) {
            Ok(()) => {
                trace!(transaction = %id, ?flags, "Frame committed");
                state.queued = Some(transaction);
                Ok(FrameStatus::Queued)
            }
            Err(source) => {
                warn!(transaction = %id, "Frame commit failed: {}", source);
                Err(SubmitError::new(
                    transaction.buffer,
                    CommitError {
                        errmsg: "Error committing frame",
                        transaction: id,
                        source,
                    },
                ))
            }
        }
    }

    /// Advance the pipeline after the hardware applied transaction `id`.
    ///
    /// `id` has to be the queued transaction. Anything else means the device broke its
    /// ordering guarantee, which stops the scheduler from accepting frames until it is
    /// cleared. Completions of transactions from before the last [`clear`](Self::clear)
    /// are ignored.
    #[profiling::function]
    pub fn commit_completed(&self, id: TransactionId) -> Result<(), ProtocolViolation> {
        let _guard = self.span.enter();
        let mut state = self.lock();

        if id.0 < state.session_start {
            debug!(transaction = %id, "Ignoring completion of a previous session");
            return Ok(());
        }
        if let Some(violation) = state.poisoned {
            return Err(violation);
        }

        let expected = state.queued.as_ref().map(Transaction::id);
        if expected != Some(id) {
            let violation = ProtocolViolation { expected, got: id };
            error!("{}", violation);
            state.poisoned = Some(violation);
            return Err(violation);
        }

        if let Some(previous) = state.active.take() {
            trace!(buffer = previous.buffer.id().0, "Releasing buffer");
            release(&state.released, previous.buffer);
        }
        state.active = state.queued.take();

        if state.suspended {
            trace!("Scheduler suspended, keeping pending frame parked");
        } else {
            self.commit_pending(&mut state);
        }

        Ok(())
    }

    /// Stop committing pending frames on completion.
    ///
    /// Used while the output is being disabled, so no frame is committed onto it in the
    /// meantime. Undone by [`resume`](Self::resume) or [`clear`](Self::clear).
    pub fn suspend(&self) {
        self.lock().suspended = true;
    }

    /// Commit pending frames again, including one that got parked while suspended
    pub fn resume(&self) {
        let _guard = self.span.enter();
        let mut state = self.lock();
        state.suspended = false;
        if state.queued.is_none() {
            self.commit_pending(&mut state);
        }
    }

    fn commit_pending(&self, state: &mut State<B>) {
        if let Some(pending) = state.pending.take() {
            match self.device.commit(&pending.request, pending.flags) {
                Ok(()) => {
                    trace!(transaction = %pending.id(), "Pending frame committed");
                    state.queued = Some(pending);
                }
                Err(err) => {
                    warn!(transaction = %pending.id(), "Pending frame commit failed, dropping frame: {}", err);
                    release(&state.released, pending.buffer);
                }
            }
        }
    }

    /// Discard all transactions without releasing their buffers.
    ///
    /// Completions still in flight for the discarded transactions are ignored afterwards.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.pending = None;
        state.queued = None;
        state.active = None;
        state.poisoned = None;
        state.suspended = false;
        state.session_start = state.next_id;
    }
}

fn activate_output(request: &mut AtomicRequest, output: &OutputPath) {
    let connector = PropertyTarget::Connector(output.connector);
    let crtc = PropertyTarget::Crtc(output.crtc);
    let plane = PropertyTarget::Plane(output.plane);
    let (w, h) = (output.size.w as u64, output.size.h as u64);

    request.add_property(connector, "CRTC_ID", PropertyValue::Object(Some(output.crtc)));
    request.add_property(crtc, "MODE_ID", PropertyValue::Blob(output.mode_blob));
    request.add_property(crtc, "ACTIVE", PropertyValue::Boolean(true));
    request.add_property(plane, "CRTC_ID", PropertyValue::Object(Some(output.crtc)));
    // source coordinates are 16.16 fixed point
    request.add_property(plane, "SRC_X", PropertyValue::Unsigned(0));
    request.add_property(plane, "SRC_Y", PropertyValue::Unsigned(0));
    request.add_property(plane, "SRC_W", PropertyValue::Unsigned(w << 16));
    request.add_property(plane, "SRC_H", PropertyValue::Unsigned(h << 16));
    request.add_property(plane, "CRTC_X", PropertyValue::Signed(0));
    request.add_property(plane, "CRTC_Y", PropertyValue::Signed(0));
    request.add_property(plane, "CRTC_W", PropertyValue::Unsigned(w));
    request.add_property(plane, "CRTC_H", PropertyValue::Unsigned(h));
}

fn release<B: FrameBuffer>(sender: &Sender<B>, buffer: B) {
    if let Err(err) = sender.send(buffer) {
        debug!(buffer = err.0.id().0, "Release channel closed, dropping buffer");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use calloop::{channel, EventLoop};

    use super::*;
    use crate::device::test::{DummyBuffer, DummyDisplay};
    use crate::Fourcc;

    const OUTPUT: OutputPath = OutputPath {
        connector: ObjectId(10),
        crtc: ObjectId(30),
        plane: ObjectId(40),
        mode_blob: 99,
        size: Size { w: 64, h: 32 },
    };

    struct Harness {
        device: Arc<DummyDisplay>,
        scheduler: CommitScheduler<DummyDisplay, DummyBuffer>,
        event_loop: EventLoop<'static, Vec<BufferId>>,
        released: Vec<BufferId>,
    }

    impl Harness {
        fn new() -> Harness {
            let device = Arc::new(DummyDisplay::single_output(&[Fourcc::Xrgb8888], &[(64, 32)]));
            let (sender, channel) = channel::channel::<DummyBuffer>();
            let event_loop = EventLoop::try_new().unwrap();
            event_loop
                .handle()
                .insert_source(channel, |event, _, released: &mut Vec<BufferId>| {
                    if let channel::Event::Msg(buffer) = event {
                        released.push(buffer.id());
                    }
                })
                .unwrap();
            Harness {
                scheduler: CommitScheduler::new(device.clone(), sender),
                device,
                event_loop,
                released: Vec::new(),
            }
        }

        fn submit(&self, id: u64) -> FrameStatus<DummyBuffer> {
            let buffer = DummyBuffer::new(id, 64 * 4 * 32).unwrap();
            self.scheduler
                .submit(buffer, ObjectId(id as u32 + 500), &OUTPUT)
                .unwrap()
        }

        fn complete(&self) -> TransactionId {
            let id = self.device.complete_next().expect("nothing in flight");
            self.scheduler.commit_completed(id).unwrap();
            id
        }

        fn released(&mut self) -> Vec<BufferId> {
            self.event_loop
                .dispatch(Some(Duration::ZERO), &mut self.released)
                .unwrap();
            std::mem::take(&mut self.released)
        }

        fn buffers(&self) -> [Option<BufferId>; 3] {
            let snapshot = self.scheduler.snapshot();
            [snapshot.pending, snapshot.queued, snapshot.active].map(|slot| slot.map(|(_, buffer)| buffer))
        }
    }

    #[test]
    fn submit_complete_release() {
        let mut harness = Harness::new();
        let (a, b) = (BufferId(1), BufferId(2));

        assert!(matches!(harness.submit(1), FrameStatus::Queued));
        assert_eq!(harness.buffers(), [None, Some(a), None]);

        assert!(matches!(harness.submit(2), FrameStatus::Pending));
        assert_eq!(harness.buffers(), [Some(b), Some(a), None]);
        assert_eq!(harness.device.commits().len(), 1);

        harness.complete();
        assert_eq!(harness.buffers(), [None, Some(b), Some(a)]);
        assert_eq!(harness.device.commits().len(), 2);
        assert!(harness.released().is_empty());

        harness.complete();
        assert_eq!(harness.buffers(), [None, None, Some(b)]);
        assert_eq!(harness.released(), vec![a]);
    }

    /// A frame submitted while a frame is pending is dropped and handed back immediately,
    /// without going through the release channel.
    #[test]
    fn frame_dropped_when_pending_taken() {
        let mut harness = Harness::new();
        harness.submit(1);
        harness.submit(2);
        let before = harness.scheduler.snapshot();

        match harness.submit(3) {
            FrameStatus::Dropped(buffer) => assert_eq!(buffer.id(), BufferId(3)),
            status => panic!("Frame not dropped: {:?}", status),
        }
        assert_eq!(harness.scheduler.snapshot(), before);
        assert_eq!(harness.device.commits().len(), 1);
        assert!(harness.released().is_empty());
    }

    #[test]
    fn first_frame_activates_output() {
        let harness = Harness::new();
        harness.submit(1);
        let (request, flags) = harness.device.last_commit().unwrap();
        assert_eq!(flags, CommitFlags::ASYNC | CommitFlags::ALLOW_MODESET);

        let plane = PropertyTarget::Plane(ObjectId(40));
        assert_eq!(
            request.get(PropertyTarget::Connector(ObjectId(10)), "CRTC_ID"),
            Some(PropertyValue::Object(Some(ObjectId(30))))
        );
        assert_eq!(
            request.get(PropertyTarget::Crtc(ObjectId(30)), "MODE_ID"),
            Some(PropertyValue::Blob(99))
        );
        assert_eq!(
            request.get(PropertyTarget::Crtc(ObjectId(30)), "ACTIVE"),
            Some(PropertyValue::Boolean(true))
        );
        assert_eq!(request.get(plane, "FB_ID"), Some(PropertyValue::Object(Some(ObjectId(501)))));
        assert_eq!(request.get(plane, "SRC_W"), Some(PropertyValue::Unsigned(64 << 16)));
        assert_eq!(request.get(plane, "CRTC_H"), Some(PropertyValue::Unsigned(32)));
    }

    #[test]
    fn later_frames_only_swap_framebuffer() {
        let harness = Harness::new();
        harness.submit(1);
        harness.complete();
        harness.submit(2);
        let (request, flags) = harness.device.last_commit().unwrap();
        assert_eq!(flags, CommitFlags::ASYNC);
        assert_eq!(request.properties().len(), 1);
        assert_eq!(
            request.get(PropertyTarget::Plane(ObjectId(40)), "FB_ID"),
            Some(PropertyValue::Object(Some(ObjectId(502))))
        );
    }

    #[test]
    fn every_active_buffer_released_once() {
        let mut harness = Harness::new();
        let mut released = Vec::new();
        for id in 1..=20 {
            harness.submit(id);
            if id % 3 == 0 {
                while !harness.device.inflight().is_empty() {
                    harness.complete();
                }
            }
            released.extend(harness.released());

            let snapshot = harness.scheduler.snapshot();
            assert!(harness.device.inflight().len() <= 1);
            if let Some((_, active)) = snapshot.active {
                assert!(!released.contains(&active));
            }
        }
        while !harness.device.inflight().is_empty() {
            harness.complete();
        }
        released.extend(harness.released());

        let active = harness.scheduler.snapshot().active.unwrap().1;
        let mut sorted = released.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), released.len());
        assert!(!released.contains(&active));
    }

    #[test]
    fn failed_commit_leaves_state_untouched() {
        let harness = Harness::new();
        harness.device.reject_next_commit();
        let buffer = DummyBuffer::new(1, 64 * 4 * 32).unwrap();
        let err = harness.scheduler.submit(buffer, ObjectId(501), &OUTPUT).unwrap_err();
        assert_eq!(err.buffer.id(), BufferId(1));
        assert_eq!(harness.scheduler.snapshot(), SlotSnapshot::default());

        // the retry still carries the modeset
        harness.submit(2);
        let (_, flags) = harness.device.last_commit().unwrap();
        assert!(flags.contains(CommitFlags::ALLOW_MODESET));
    }

    #[test]
    fn failed_pending_commit_releases_buffer() {
        let mut harness = Harness::new();
        harness.submit(1);
        harness.submit(2);
        harness.device.reject_next_commit();
        harness.complete();

        assert_eq!(harness.buffers(), [None, None, Some(BufferId(1))]);
        assert_eq!(harness.released(), vec![BufferId(2)]);
        assert!(matches!(harness.submit(3), FrameStatus::Queued));
    }

    #[test]
    fn out_of_order_completion_poisons() {
        let harness = Harness::new();
        harness.submit(1);
        let queued = harness.scheduler.snapshot().queued.unwrap().0;
        let bogus = TransactionId(queued.0 + 7);

        assert_eq!(harness.scheduler.poisoned(), None);
        let violation = harness.scheduler.commit_completed(bogus).unwrap_err();
        assert_eq!(harness.scheduler.poisoned(), Some(violation));
        assert_eq!(
            violation,
            ProtocolViolation {
                expected: Some(queued),
                got: bogus
            }
        );

        let buffer = DummyBuffer::new(2, 64 * 4 * 32).unwrap();
        let err = harness.scheduler.submit(buffer, ObjectId(502), &OUTPUT).unwrap_err();
        assert!(matches!(err.source, crate::error::Error::Protocol(_)));

        harness.scheduler.clear();
        assert!(matches!(harness.submit(3), FrameStatus::Queued));
    }

    #[test]
    fn completion_without_queued_commit_is_a_violation() {
        let harness = Harness::new();
        assert!(harness.scheduler.commit_completed(TransactionId(1)).is_err());
    }

    #[test]
    fn clear_discards_without_release() {
        let mut harness = Harness::new();
        harness.submit(1);
        harness.complete();
        harness.submit(2);
        harness.submit(3);
        let stale = harness.device.inflight();

        harness.scheduler.clear();
        assert_eq!(harness.scheduler.snapshot(), SlotSnapshot::default());
        assert!(!harness.scheduler.has_pending());

        // late completions of the previous session are ignored
        for id in stale {
            harness.scheduler.commit_completed(id).unwrap();
        }
        assert!(harness.released().is_empty());

        harness.submit(4);
        let (_, flags) = harness.device.last_commit().unwrap();
        assert!(flags.contains(CommitFlags::ALLOW_MODESET));
    }

    #[test]
    fn suspended_scheduler_keeps_pending_parked() {
        let mut harness = Harness::new();
        harness.submit(1);
        harness.submit(2);

        harness.scheduler.suspend();
        harness.complete();
        assert_eq!(harness.buffers(), [Some(BufferId(2)), None, Some(BufferId(1))]);
        assert_eq!(harness.device.commits().len(), 1);
        assert!(harness.device.inflight().is_empty());

        harness.scheduler.resume();
        assert_eq!(harness.buffers(), [None, Some(BufferId(2)), Some(BufferId(1))]);
        assert_eq!(harness.device.commits().len(), 2);

        harness.complete();
        assert_eq!(harness.released(), vec![BufferId(1)]);
    }

    #[test]
    fn resume_waits_for_queued_commit() {
        let harness = Harness::new();
        harness.submit(1);
        harness.submit(2);

        harness.scheduler.suspend();
        harness.scheduler.resume();
        assert_eq!(harness.buffers(), [Some(BufferId(2)), Some(BufferId(1)), None]);
        assert_eq!(harness.device.commits().len(), 1);
    }

    #[test]
    fn completion_from_another_thread() {
        let mut harness = Harness::new();
        harness.submit(1);
        harness.submit(2);

        let scheduler = &harness.scheduler;
        let device = harness.device.clone();
        std::thread::scope(|s| {
            s.spawn(|| {
                let id = device.complete_next().unwrap();
                scheduler.commit_completed(id).unwrap();
            });
        });
        harness.complete();
        assert_eq!(harness.released(), vec![BufferId(1)]);
    }
}
