//! Display devices the sink renders to.
//!
//! The sink does not talk to the hardware directly. Everything it needs is described by
//! the [`DisplayDevice`] trait:
//!
//! - a [`Topology`] snapshot to resolve a pipeline from,
//! - importing [`FrameBuffer`]s as scan-out capable framebuffers,
//! - creating mode blobs,
//! - committing [`AtomicRequest`]s.
//!
//! Atomic requests address properties by name, the device is responsible for translating
//! those to its own property handles. A request committed with [`CommitFlags::ASYNC`]
//! returns immediately and the device reports its completion later as a
//! [`DisplayEvent::CommitComplete`] carrying the [`TransactionId`] of the request.
//! Completions have to be reported exactly once per successful commit and in submission
//! order.
//!
//! With the `backend_drm` feature, [`drm::DrmDisplay`] implements the trait on top of a
//! DRM device node using the atomic modesetting api.

use std::fmt;

use smallvec::SmallVec;

use crate::{
    buffer::{BufferLayout, FrameBuffer},
    error::AccessError,
    topology::{Mode, ObjectId, Topology},
};

#[cfg(feature = "backend_drm")]
pub mod drm;
#[cfg(any(test, feature = "device_test"))]
pub mod test;

/// Identity of an atomic request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Object a property belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyTarget {
    /// A connector property
    Connector(ObjectId),
    /// A crtc property
    Crtc(ObjectId),
    /// A plane property
    Plane(ObjectId),
}

impl PropertyTarget {
    /// Object id of the target
    pub fn id(&self) -> ObjectId {
        match self {
            PropertyTarget::Connector(id) | PropertyTarget::Crtc(id) | PropertyTarget::Plane(id) => *id,
        }
    }
}

/// Value of a property in an atomic request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyValue {
    /// Reference to another object, or none
    Object(Option<ObjectId>),
    /// Boolean value
    Boolean(bool),
    /// Unsigned range value
    Unsigned(u64),
    /// Signed range value
    Signed(i64),
    /// Blob id, `0` for none
    Blob(u64),
}

impl PropertyValue {
    /// Encoding of the value as sent to the kernel
    pub fn raw(&self) -> u64 {
        match *self {
            PropertyValue::Object(id) => id.map(|id| id.0 as u64).unwrap_or(0),
            PropertyValue::Boolean(b) => b as u64,
            PropertyValue::Unsigned(v) => v,
            PropertyValue::Signed(v) => v as u64,
            PropertyValue::Blob(id) => id,
        }
    }
}

/// A property change contained in an [`AtomicRequest`]
pub type PropertyChange = (PropertyTarget, &'static str, PropertyValue);

/// A set of property changes applied at once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicRequest {
    id: TransactionId,
    properties: SmallVec<[PropertyChange; 16]>,
}

impl AtomicRequest {
    /// Create an empty request
    pub fn new(id: TransactionId) -> AtomicRequest {
        AtomicRequest {
            id,
            properties: SmallVec::new(),
        }
    }

    /// Set a property.
    ///
    /// Setting the same property twice overrides the earlier value.
    pub fn add_property(&mut self, target: PropertyTarget, name: &'static str, value: PropertyValue) {
        if let Some(existing) = self
            .properties
            .iter_mut()
            .find(|(t, n, _)| *t == target && *n == name)
        {
            existing.2 = value;
        } else {
            self.properties.push((target, name, value));
        }
    }

    /// Identity of the request
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// All property changes in insertion order
    pub fn properties(&self) -> &[PropertyChange] {
        &self.properties
    }

    /// Look up the value set for a property
    pub fn get(&self, target: PropertyTarget, name: &str) -> Option<PropertyValue> {
        self.properties
            .iter()
            .find(|(t, n, _)| *t == target && *n == name)
            .map(|(_, _, v)| *v)
    }
}

bitflags::bitflags! {
    /// Flags of an atomic commit
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        /// Allow a full modeset, only used to activate and tear down the output
        const ALLOW_MODESET = 0b01;
        /// Do not block and report completion through a [`DisplayEvent`]
        const ASYNC = 0b10;
    }
}

/// Events generated by a display device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    /// An asynchronous commit has been applied by the hardware
    CommitComplete(TransactionId),
}

/// A device-side framebuffer, released on drop
pub trait Framebuffer: AsRef<ObjectId> + Send + fmt::Debug {}

/// Display hardware the sink renders to
pub trait DisplayDevice: Send + Sync + fmt::Debug {
    /// Framebuffer type created by [`DisplayDevice::import_buffer`]
    type Framebuffer: Framebuffer;

    /// Snapshot of the display hardware
    fn topology(&self) -> &Topology;

    /// Import a frame buffer for scan-out with the given layout
    fn import_buffer<B: FrameBuffer>(
        &self,
        buffer: &B,
        layout: &BufferLayout,
    ) -> Result<Self::Framebuffer, AccessError>;

    /// Create a blob describing `mode` of `connector`
    fn create_mode_blob(&self, connector: ObjectId, mode: &Mode) -> Result<u64, AccessError>;

    /// Destroy a blob created with [`DisplayDevice::create_mode_blob`]
    fn destroy_mode_blob(&self, blob: u64) -> Result<(), AccessError>;

    /// Commit an atomic request
    fn commit(&self, request: &AtomicRequest, flags: CommitFlags) -> Result<(), AccessError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_property_overrides() {
        let mut req = AtomicRequest::new(TransactionId(3));
        let plane = PropertyTarget::Plane(ObjectId(40));
        req.add_property(plane, "FB_ID", PropertyValue::Object(Some(ObjectId(1))));
        req.add_property(PropertyTarget::Crtc(ObjectId(30)), "ACTIVE", PropertyValue::Boolean(true));
        req.add_property(plane, "FB_ID", PropertyValue::Object(Some(ObjectId(2))));
        assert_eq!(req.properties().len(), 2);
        assert_eq!(req.get(plane, "FB_ID"), Some(PropertyValue::Object(Some(ObjectId(2)))));
        assert_eq!(req.get(plane, "CRTC_ID"), None);
    }

    #[test]
    fn raw_values() {
        assert_eq!(PropertyValue::Object(None).raw(), 0);
        assert_eq!(PropertyValue::Object(Some(ObjectId(7))).raw(), 7);
        assert_eq!(PropertyValue::Boolean(true).raw(), 1);
        assert_eq!(PropertyValue::Signed(-1).raw(), u64::MAX);
        assert_eq!(PropertyValue::Unsigned(1920 << 16).raw(), 1920 << 16);
    }
}
