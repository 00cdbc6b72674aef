//! Frame buffers handed to the sink by a producer.
//!
//! The sink does not care how a frame buffer was allocated. It only needs a stable
//! identity, used to cache the display object created for it, and the dmabuf planes
//! backing the memory.

use std::os::unix::io::BorrowedFd;

use smallvec::SmallVec;

use crate::{utils::Size, Fourcc};

/// Stable identity of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// A memory plane of a frame buffer
#[derive(Debug, Clone, Copy)]
pub struct FramePlane<'a> {
    /// Dmabuf file descriptor of the plane
    pub fd: BorrowedFd<'a>,
    /// Offset of the plane data inside the dmabuf
    pub offset: u32,
    /// Length of the plane data in bytes
    pub length: u32,
}

/// A buffer produced upstream that can be displayed by the sink.
///
/// Two buffers returning the same [`BufferId`] are assumed to share the same memory.
pub trait FrameBuffer: Send + 'static {
    /// Identity of the buffer
    fn id(&self) -> BufferId;
    /// Memory planes of the buffer
    fn planes(&self) -> SmallVec<[FramePlane<'_>; 4]>;
}

/// Layout every frame of a stream is imported with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Format scanned out by the plane
    pub format: Fourcc,
    /// Frame size in pixels
    pub size: Size,
    /// Length of a line in bytes
    pub stride: u32,
}

impl BufferLayout {
    /// Minimal number of bytes a frame needs
    pub fn frame_len(&self) -> u64 {
        self.stride as u64 * self.size.h as u64
    }
}
