//! Framebuffers created from imported frame buffers

use drm::{
    buffer::{Handle as GemHandle, PlanarBuffer},
    control::{framebuffer, Device as ControlDevice, FbCmd2Flags},
};
use drm_fourcc::DrmModifier;
use tracing::{trace, warn};

use super::DrmCard;
use crate::{
    buffer::{BufferLayout, FrameBuffer},
    device::Framebuffer,
    error::AccessError,
    topology::ObjectId,
    Fourcc,
};

/// A framebuffer backed by an imported frame buffer, destroyed on drop
#[derive(Debug)]
pub struct DrmFramebuffer {
    fb: framebuffer::Handle,
    id: ObjectId,
    card: DrmCard,
}

impl Drop for DrmFramebuffer {
    fn drop(&mut self) {
        trace!(fb = ?self.fb, "destroying framebuffer");
        if let Err(err) = self.card.destroy_framebuffer(self.fb) {
            warn!(fb = ?self.fb, ?err, "failed to destroy framebuffer");
        }
    }
}

impl AsRef<ObjectId> for DrmFramebuffer {
    fn as_ref(&self) -> &ObjectId {
        &self.id
    }
}

impl AsRef<framebuffer::Handle> for DrmFramebuffer {
    fn as_ref(&self) -> &framebuffer::Handle {
        &self.fb
    }
}

impl Framebuffer for DrmFramebuffer {}

struct ImportedBuffer {
    layout: BufferLayout,
    handles: [Option<GemHandle>; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
}

impl PlanarBuffer for ImportedBuffer {
    fn size(&self) -> (u32, u32) {
        (self.layout.size.w, self.layout.size.h)
    }

    fn format(&self) -> Fourcc {
        self.layout.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<GemHandle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

/// Attach a [`framebuffer::Handle`] to a frame buffer.
///
/// Every dmabuf plane is imported through prime, the gem handles are closed again once the
/// framebuffer holds a reference to the memory.
#[profiling::function]
pub fn framebuffer_from_frame_buffer<B: FrameBuffer>(
    card: &DrmCard,
    buffer: &B,
    layout: &BufferLayout,
) -> Result<DrmFramebuffer, AccessError> {
    let mut imported = ImportedBuffer {
        layout: *layout,
        handles: [None; 4],
        pitches: [0; 4],
        offsets: [0; 4],
    };

    let mut result = Ok(());
    for (i, plane) in buffer.planes().iter().enumerate().take(4) {
        match card.prime_fd_to_buffer(plane.fd) {
            Ok(handle) => {
                imported.handles[i] = Some(handle);
                imported.offsets[i] = plane.offset;
                imported.pitches[i] = layout.stride;
            }
            Err(source) => {
                result = Err(AccessError {
                    errmsg: "Failed to import dmabuf",
                    dev: card.dev_path(),
                    source,
                });
                break;
            }
        }
    }

    let fb = result.and_then(|()| {
        card.add_planar_framebuffer(&imported, FbCmd2Flags::empty())
            .map_err(|source| AccessError {
                errmsg: "Failed to add framebuffer",
                dev: card.dev_path(),
                source,
            })
    });

    // identical gem handles are only closed once
    let mut closed: Vec<GemHandle> = Vec::with_capacity(4);
    for handle in imported.handles.into_iter().flatten() {
        if closed.contains(&handle) {
            continue;
        }
        if let Err(err) = card.close_buffer(handle) {
            warn!(?err, "failed to close gem handle");
        }
        closed.push(handle);
    }

    let fb = fb?;
    trace!(?fb, "added framebuffer");
    Ok(DrmFramebuffer {
        fb,
        id: ObjectId(fb.into()),
        card: card.clone(),
    })
}
