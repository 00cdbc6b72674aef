//! Caching of display framebuffers per frame buffer.
//!
//! Producers usually cycle through a small pool of buffers. Importing a buffer into the
//! display device is expensive, so every buffer is imported on first use only and the
//! resulting framebuffer is kept until the session ends.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::{
    buffer::{BufferId, BufferLayout, FrameBuffer},
    device::DisplayDevice,
    error::ImportError,
    topology::ObjectId,
    utils::Size,
};

/// A frame buffer imported into the display device
#[derive(Debug)]
pub struct BoundBuffer<F> {
    framebuffer: F,
    stride: u32,
    size: Size,
}

impl<F: AsRef<ObjectId>> BoundBuffer<F> {
    /// Object id of the framebuffer
    pub fn framebuffer(&self) -> ObjectId {
        *self.framebuffer.as_ref()
    }

    /// Stride the buffer was imported with
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Size the buffer was imported with
    pub fn size(&self) -> Size {
        self.size
    }
}

/// Cache of [`BoundBuffer`]s keyed by buffer identity
#[derive(Debug)]
pub struct BufferBinder<F> {
    bound: HashMap<BufferId, BoundBuffer<F>>,
}

impl<F> Default for BufferBinder<F> {
    fn default() -> Self {
        BufferBinder {
            bound: HashMap::new(),
        }
    }
}

impl<F: AsRef<ObjectId>> BufferBinder<F> {
    /// Create an empty binder
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the framebuffer bound to `buffer`, importing it first if necessary.
    ///
    /// A buffer that fails to import is not cached, so it will be imported again the
    /// next time it is encountered.
    #[profiling::function]
    pub fn bind<D, B>(
        &mut self,
        device: &D,
        buffer: &B,
        layout: &BufferLayout,
    ) -> Result<&BoundBuffer<F>, ImportError>
    where
        D: DisplayDevice<Framebuffer = F>,
        B: FrameBuffer,
    {
        let id = buffer.id();
        if self.bound.contains_key(&id) {
            trace!(buffer = id.0, "Reusing bound framebuffer");
        } else {
            let framebuffer = import(device, buffer, layout)?;
            debug!(buffer = id.0, framebuffer = %framebuffer.as_ref(), "Bound new buffer");
            self.bound.insert(
                id,
                BoundBuffer {
                    framebuffer,
                    stride: layout.stride,
                    size: layout.size,
                },
            );
        }
        Ok(&self.bound[&id])
    }

    /// Check if a buffer is already bound
    pub fn contains(&self, buffer: BufferId) -> bool {
        self.bound.contains_key(&buffer)
    }

    /// Number of bound buffers
    pub fn len(&self) -> usize {
        self.bound.len()
    }

    /// Check if no buffer is bound
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    /// Drop every bound framebuffer
    pub fn clear(&mut self) {
        if !self.bound.is_empty() {
            debug!("Releasing {} bound framebuffers", self.bound.len());
        }
        self.bound.clear();
    }
}

fn import<D, B>(device: &D, buffer: &B, layout: &BufferLayout) -> Result<D::Framebuffer, ImportError>
where
    D: DisplayDevice,
    B: FrameBuffer,
{
    let id = buffer.id();
    let planes = buffer.planes();
    let first = planes.first().ok_or(ImportError::NoPlanes(id))?;
    if (first.length as u64) < layout.frame_len() {
        return Err(ImportError::BufferTooSmall {
            buffer: id,
            length: first.length,
            size: layout.size,
            stride: layout.stride,
        });
    }

    device
        .import_buffer(buffer, layout)
        .map_err(|source| ImportError::Device { buffer: id, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test::{DummyBuffer, DummyDisplay};
    use crate::Fourcc;

    fn layout() -> BufferLayout {
        BufferLayout {
            format: Fourcc::Xrgb8888,
            size: Size::new(64, 32),
            stride: 256,
        }
    }

    fn display() -> DummyDisplay {
        DummyDisplay::single_output(&[Fourcc::Xrgb8888], &[(64, 32)])
    }

    #[test]
    fn imports_once_per_identity() {
        let device = display();
        let mut binder = BufferBinder::new();
        let a = DummyBuffer::new(1, 256 * 32).unwrap();
        let b = DummyBuffer::new(2, 256 * 32).unwrap();

        let fb_a = binder.bind(&device, &a, &layout()).unwrap().framebuffer();
        let fb_b = binder.bind(&device, &b, &layout()).unwrap().framebuffer();
        let again = binder.bind(&device, &a, &layout()).unwrap();

        assert_eq!(again.framebuffer(), fb_a);
        assert_eq!(again.stride(), 256);
        assert_eq!(again.size(), Size::new(64, 32));
        assert_ne!(fb_a, fb_b);
        assert_eq!(device.imports(), vec![BufferId(1), BufferId(2)]);
        assert_eq!(binder.len(), 2);
    }

    #[test]
    fn clear_releases_framebuffers() {
        let device = display();
        let mut binder = BufferBinder::new();
        for id in 0..3 {
            let buffer = DummyBuffer::new(id, 256 * 32).unwrap();
            binder.bind(&device, &buffer, &layout()).unwrap();
        }
        assert_eq!(device.live_framebuffers(), 3);

        binder.clear();
        assert!(binder.is_empty());
        assert_eq!(device.live_framebuffers(), 0);
    }

    #[test]
    fn rejected_import_is_not_cached() {
        let device = display();
        let mut binder = BufferBinder::new();
        let buffer = DummyBuffer::new(7, 256 * 32).unwrap();

        device.reject_next_import();
        assert!(matches!(
            binder.bind(&device, &buffer, &layout()),
            Err(ImportError::Device { buffer: BufferId(7), .. })
        ));
        assert!(!binder.contains(BufferId(7)));

        binder.bind(&device, &buffer, &layout()).unwrap();
        assert!(binder.contains(BufferId(7)));
    }

    #[test]
    fn undersized_buffers_are_rejected() {
        let device = display();
        let mut binder = BufferBinder::new();
        let small = DummyBuffer::new(1, 256 * 31).unwrap();
        let empty = DummyBuffer::new(2, 0).unwrap();

        assert!(matches!(
            binder.bind(&device, &small, &layout()),
            Err(ImportError::BufferTooSmall { length, .. }) if length == 256 * 31
        ));
        assert!(matches!(
            binder.bind(&device, &empty, &layout()),
            Err(ImportError::NoPlanes(BufferId(2)))
        ));
        assert!(binder.is_empty());
        assert!(device.imports().is_empty());
    }
}
