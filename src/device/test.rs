//! In-memory display device.
//!
//! [`DummyDisplay`] records everything the sink asks of it instead of touching hardware,
//! which makes the behaviour of the sink observable in tests. Asynchronous commits are
//! kept in flight until [`DummyDisplay::complete_next`] is called.
#![allow(missing_docs)]

use std::{
    collections::{HashSet, VecDeque},
    io,
    os::unix::io::{AsFd, OwnedFd},
    sync::{Arc, Mutex, MutexGuard},
};

use smallvec::{smallvec, SmallVec};

use crate::{
    buffer::{BufferId, BufferLayout, FrameBuffer, FramePlane},
    device::{AtomicRequest, CommitFlags, DisplayDevice, Framebuffer, TransactionId},
    error::AccessError,
    topology::{ConnectorStatus, Mode, ObjectId, PlaneType, Topology},
    Fourcc,
};

#[derive(Debug, Default)]
struct DummyState {
    commits: Vec<(AtomicRequest, CommitFlags)>,
    inflight: VecDeque<TransactionId>,
    imports: Vec<BufferId>,
    blobs: HashSet<u64>,
    next_object: u32,
    reject_commit: bool,
    reject_import: bool,
}

#[derive(Debug)]
pub struct DummyDisplay {
    topology: Topology,
    state: Mutex<DummyState>,
    live: Arc<Mutex<HashSet<ObjectId>>>,
}

impl DummyDisplay {
    pub fn new(topology: Topology) -> DummyDisplay {
        DummyDisplay {
            topology,
            state: Mutex::new(DummyState {
                next_object: 1000,
                ..Default::default()
            }),
            live: Default::default(),
        }
    }

    /// A device with a connected `HDMI-A-1` connector driven by a single crtc.
    ///
    /// The crtc owns an overlay plane supporting every format and a primary plane
    /// supporting `formats`. A second, disconnected `DP-1` connector has no encoders.
    pub fn single_output(formats: &[Fourcc], modes: &[(u32, u32)]) -> DummyDisplay {
        let mut builder = Topology::builder();
        let overlay = builder.add_plane(
            ObjectId(41),
            PlaneType::Overlay,
            [Fourcc::Argb8888, Fourcc::Xrgb8888, Fourcc::Nv12],
        );
        let primary = builder.add_plane(ObjectId(40), PlaneType::Primary, formats.iter().copied());
        let crtc = builder.add_crtc(ObjectId(30), [overlay, primary]);
        let encoder = builder.add_encoder(ObjectId(20), [crtc]);
        builder.add_connector(
            ObjectId(10),
            "HDMI-A-1",
            ConnectorStatus::Connected,
            [encoder],
            modes
                .iter()
                .map(|&(w, h)| Mode::new(format!("{}x{}", w, h), (w, h), 60)),
        );
        builder.add_connector(ObjectId(11), "DP-1", ConnectorStatus::Disconnected, [], []);
        DummyDisplay::new(builder.build())
    }

    fn state(&self) -> MutexGuard<'_, DummyState> {
        self.state.lock().unwrap()
    }

    /// Every successful commit with its flags, in order
    pub fn commits(&self) -> Vec<(AtomicRequest, CommitFlags)> {
        self.state().commits.clone()
    }

    pub fn last_commit(&self) -> Option<(AtomicRequest, CommitFlags)> {
        self.state().commits.last().cloned()
    }

    /// Asynchronous commits not completed yet, oldest first
    pub fn inflight(&self) -> Vec<TransactionId> {
        self.state().inflight.iter().copied().collect()
    }

    /// Pops the oldest in-flight commit, as the hardware would when applying it
    pub fn complete_next(&self) -> Option<TransactionId> {
        self.state().inflight.pop_front()
    }

    /// Buffers imported so far, in order
    pub fn imports(&self) -> Vec<BufferId> {
        self.state().imports.clone()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn live_blobs(&self) -> usize {
        self.state().blobs.len()
    }

    pub fn reject_next_commit(&self) {
        self.state().reject_commit = true;
    }

    pub fn reject_next_import(&self) {
        self.state().reject_import = true;
    }
}

#[derive(Debug)]
pub struct DummyFramebuffer {
    id: ObjectId,
    live: Arc<Mutex<HashSet<ObjectId>>>,
}

impl AsRef<ObjectId> for DummyFramebuffer {
    fn as_ref(&self) -> &ObjectId {
        &self.id
    }
}

impl Drop for DummyFramebuffer {
    fn drop(&mut self) {
        self.live.lock().unwrap().remove(&self.id);
    }
}

impl Framebuffer for DummyFramebuffer {}

fn rejected(errmsg: &'static str) -> AccessError {
    AccessError {
        errmsg,
        dev: None,
        source: io::Error::from(rustix::io::Errno::INVAL),
    }
}

impl DisplayDevice for DummyDisplay {
    type Framebuffer = DummyFramebuffer;

    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn import_buffer<B: FrameBuffer>(
        &self,
        buffer: &B,
        _layout: &BufferLayout,
    ) -> Result<DummyFramebuffer, AccessError> {
        let mut state = self.state();
        if std::mem::take(&mut state.reject_import) {
            return Err(rejected("Import rejected"));
        }
        state.imports.push(buffer.id());
        state.next_object += 1;
        let id = ObjectId(state.next_object);
        self.live.lock().unwrap().insert(id);
        Ok(DummyFramebuffer {
            id,
            live: self.live.clone(),
        })
    }

    fn create_mode_blob(&self, _connector: ObjectId, _mode: &Mode) -> Result<u64, AccessError> {
        let mut state = self.state();
        state.next_object += 1;
        let blob = state.next_object as u64;
        state.blobs.insert(blob);
        Ok(blob)
    }

    fn destroy_mode_blob(&self, blob: u64) -> Result<(), AccessError> {
        if self.state().blobs.remove(&blob) {
            Ok(())
        } else {
            Err(AccessError {
                errmsg: "Unknown blob",
                dev: None,
                source: io::Error::from(rustix::io::Errno::NOENT),
            })
        }
    }

    fn commit(&self, request: &AtomicRequest, flags: CommitFlags) -> Result<(), AccessError> {
        let mut state = self.state();
        if std::mem::take(&mut state.reject_commit) {
            return Err(rejected("Atomic commit rejected"));
        }
        state.commits.push((request.clone(), flags));
        if flags.contains(CommitFlags::ASYNC) {
            state.inflight.push_back(request.id());
        }
        Ok(())
    }
}

/// A frame buffer backed by an empty memfd
#[derive(Debug)]
pub struct DummyBuffer {
    id: BufferId,
    length: u32,
    fd: OwnedFd,
}

impl DummyBuffer {
    pub fn new(id: u64, length: u32) -> io::Result<DummyBuffer> {
        let fd = rustix::fs::memfd_create("dummy-frame", rustix::fs::MemfdFlags::CLOEXEC)?;
        Ok(DummyBuffer {
            id: BufferId(id),
            length,
            fd,
        })
    }
}

impl FrameBuffer for DummyBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn planes(&self) -> SmallVec<[FramePlane<'_>; 4]> {
        if self.length == 0 {
            return SmallVec::new();
        }
        smallvec![FramePlane {
            fd: self.fd.as_fd(),
            offset: 0,
            length: self.length,
        }]
    }
}
