//! Read-only snapshot of the display hardware.
//!
//! The kms objects form a graph: a connector can be driven by a set of encoders, every
//! encoder can be fed by a set of crtcs and every crtc can scan out a set of planes.
//! [`Topology`] stores each kind of object in its own arena and expresses these relations
//! as lists of typed indices, in the order the device enumerated them. That order is what
//! makes [`resolve_pipeline`](crate::pipeline::resolve_pipeline) deterministic.
//!
//! A topology is built once through a [`TopologyBuilder`], usually by a
//! [`DisplayDevice`](crate::device::DisplayDevice), and never changes afterwards.
//!
//! ```
//! # use kms_sink::Fourcc;
//! # use kms_sink::topology::*;
//! let mut builder = Topology::builder();
//! let plane = builder.add_plane(ObjectId(40), PlaneType::Primary, [Fourcc::Xrgb8888]);
//! let crtc = builder.add_crtc(ObjectId(30), [plane]);
//! let encoder = builder.add_encoder(ObjectId(20), [crtc]);
//! builder.add_connector(
//!     ObjectId(10),
//!     "HDMI-A-1",
//!     ConnectorStatus::Connected,
//!     [encoder],
//!     [Mode::new("1920x1080", (1920u32, 1080u32), 60)],
//! );
//! let topology = builder.build();
//! assert_eq!(topology.connectors().count(), 1);
//! ```

use std::fmt;

use indexmap::IndexSet;

use crate::{utils::Size, Fourcc};

/// Device-wide identifier of a kms object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! arena_index {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            /// Position of the object in its arena
            #[inline]
            pub fn index(&self) -> usize {
                self.0
            }
        }
    };
}

arena_index!(
    /// Index of a [`Connector`] inside a [`Topology`]
    ConnectorIdx
);
arena_index!(
    /// Index of an [`Encoder`] inside a [`Topology`]
    EncoderIdx
);
arena_index!(
    /// Index of a [`Crtc`] inside a [`Topology`]
    CrtcIdx
);
arena_index!(
    /// Index of a [`Plane`] inside a [`Topology`]
    PlaneIdx
);

/// Connection state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorStatus {
    /// A display is attached
    Connected,
    /// Nothing is attached
    Disconnected,
    /// The driver cannot tell
    Unknown,
}

/// Type of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Full-frame plane every crtc has
    Primary,
    /// Plane composited on top of the primary plane
    Overlay,
    /// Plane dedicated to cursor images
    Cursor,
}

/// A display timing offered by a connector
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mode {
    name: String,
    size: Size,
    refresh: u32,
}

impl Mode {
    /// Create a new mode description
    pub fn new(name: impl Into<String>, size: impl Into<Size>, refresh: u32) -> Mode {
        Mode {
            name: name.into(),
            size: size.into(),
            refresh,
        }
    }

    /// Name of the mode, e.g. `1920x1080`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active area of the mode
    pub fn size(&self) -> Size {
        self.size
    }

    /// Vertical refresh rate in Hz
    pub fn refresh(&self) -> u32 {
        self.refresh
    }
}

/// A connector with the encoders able to drive it and its modes
#[derive(Debug, Clone)]
pub struct Connector {
    id: ObjectId,
    name: String,
    status: ConnectorStatus,
    encoders: Vec<EncoderIdx>,
    modes: Vec<Mode>,
}

impl Connector {
    /// Object id of the connector
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Name of the connector, e.g. `HDMI-A-1`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection state at enumeration time
    pub fn status(&self) -> ConnectorStatus {
        self.status
    }

    /// Encoders able to drive this connector
    pub fn encoders(&self) -> &[EncoderIdx] {
        &self.encoders
    }

    /// Modes supported by this connector
    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }
}

/// An encoder with the crtcs able to feed it
#[derive(Debug, Clone)]
pub struct Encoder {
    id: ObjectId,
    crtcs: Vec<CrtcIdx>,
}

impl Encoder {
    /// Object id of the encoder
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Crtcs able to feed this encoder
    pub fn possible_crtcs(&self) -> &[CrtcIdx] {
        &self.crtcs
    }
}

/// A crtc with the planes it can scan out
#[derive(Debug, Clone)]
pub struct Crtc {
    id: ObjectId,
    planes: Vec<PlaneIdx>,
}

impl Crtc {
    /// Object id of the crtc
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Planes usable with this crtc, of any type
    pub fn planes(&self) -> &[PlaneIdx] {
        &self.planes
    }
}

/// A plane and the formats it can scan out
#[derive(Debug, Clone)]
pub struct Plane {
    id: ObjectId,
    kind: PlaneType,
    formats: IndexSet<Fourcc>,
}

impl Plane {
    /// Object id of the plane
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Type of the plane
    pub fn kind(&self) -> PlaneType {
        self.kind
    }

    /// Formats supported by the plane, in driver order
    pub fn formats(&self) -> impl Iterator<Item = Fourcc> + '_ {
        self.formats.iter().copied()
    }

    /// Checks if the plane can scan out buffers of the given format
    pub fn supports_format(&self, format: Fourcc) -> bool {
        self.formats.contains(&format)
    }
}

/// Arena of all kms objects of a device
#[derive(Debug, Clone, Default)]
pub struct Topology {
    connectors: Vec<Connector>,
    encoders: Vec<Encoder>,
    crtcs: Vec<Crtc>,
    planes: Vec<Plane>,
}

impl Topology {
    /// Start building a new topology
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Iterate over all connectors in enumeration order
    pub fn connectors(&self) -> impl Iterator<Item = (ConnectorIdx, &Connector)> + '_ {
        self.connectors.iter().enumerate().map(|(i, c)| (ConnectorIdx(i), c))
    }

    /// Iterate over all crtcs in enumeration order
    pub fn crtcs(&self) -> impl Iterator<Item = (CrtcIdx, &Crtc)> + '_ {
        self.crtcs.iter().enumerate().map(|(i, c)| (CrtcIdx(i), c))
    }

    /// Iterate over all planes in enumeration order
    pub fn planes(&self) -> impl Iterator<Item = (PlaneIdx, &Plane)> + '_ {
        self.planes.iter().enumerate().map(|(i, p)| (PlaneIdx(i), p))
    }

    /// Access a connector
    pub fn connector(&self, idx: ConnectorIdx) -> &Connector {
        &self.connectors[idx.0]
    }

    /// Access an encoder
    pub fn encoder(&self, idx: EncoderIdx) -> &Encoder {
        &self.encoders[idx.0]
    }

    /// Access a crtc
    pub fn crtc(&self, idx: CrtcIdx) -> &Crtc {
        &self.crtcs[idx.0]
    }

    /// Access a plane
    pub fn plane(&self, idx: PlaneIdx) -> &Plane {
        &self.planes[idx.0]
    }

    /// Look up a connector by name
    pub fn find_connector(&self, name: &str) -> Option<ConnectorIdx> {
        self.connectors()
            .find(|(_, conn)| conn.name == name)
            .map(|(idx, _)| idx)
    }

    /// Pick the connector to display on.
    ///
    /// The first connector not known to be disconnected is chosen, but a connector with
    /// [`ConnectorStatus::Connected`] is preferred over one with [`ConnectorStatus::Unknown`].
    pub fn default_connector(&self) -> Option<ConnectorIdx> {
        let mut selected: Option<(ConnectorIdx, ConnectorStatus)> = None;
        for (idx, conn) in self.connectors() {
            match (conn.status, selected) {
                (ConnectorStatus::Disconnected, _) => {}
                (status, None) => selected = Some((idx, status)),
                (ConnectorStatus::Connected, Some((_, ConnectorStatus::Unknown))) => {
                    selected = Some((idx, ConnectorStatus::Connected))
                }
                _ => {}
            }
        }
        selected.map(|(idx, _)| idx)
    }
}

/// Incrementally assembles a [`Topology`].
///
/// Objects have to be added bottom-up (planes, crtcs, encoders, connectors), so every
/// relation refers to an object that already exists.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    topology: Topology,
}

impl TopologyBuilder {
    /// Add a plane
    pub fn add_plane(
        &mut self,
        id: ObjectId,
        kind: PlaneType,
        formats: impl IntoIterator<Item = Fourcc>,
    ) -> PlaneIdx {
        self.topology.planes.push(Plane {
            id,
            kind,
            formats: formats.into_iter().collect(),
        });
        PlaneIdx(self.topology.planes.len() - 1)
    }

    /// Add a crtc able to scan out the given planes
    pub fn add_crtc(&mut self, id: ObjectId, planes: impl IntoIterator<Item = PlaneIdx>) -> CrtcIdx {
        self.topology.crtcs.push(Crtc {
            id,
            planes: planes.into_iter().collect(),
        });
        CrtcIdx(self.topology.crtcs.len() - 1)
    }

    /// Make a plane usable by an already added crtc
    pub fn link_plane(&mut self, crtc: CrtcIdx, plane: PlaneIdx) {
        let planes = &mut self.topology.crtcs[crtc.0].planes;
        if !planes.contains(&plane) {
            planes.push(plane);
        }
    }

    /// Add an encoder that can be fed by the given crtcs
    pub fn add_encoder(&mut self, id: ObjectId, crtcs: impl IntoIterator<Item = CrtcIdx>) -> EncoderIdx {
        self.topology.encoders.push(Encoder {
            id,
            crtcs: crtcs.into_iter().collect(),
        });
        EncoderIdx(self.topology.encoders.len() - 1)
    }

    /// Add a connector
    pub fn add_connector(
        &mut self,
        id: ObjectId,
        name: impl Into<String>,
        status: ConnectorStatus,
        encoders: impl IntoIterator<Item = EncoderIdx>,
        modes: impl IntoIterator<Item = Mode>,
    ) -> ConnectorIdx {
        self.topology.connectors.push(Connector {
            id,
            name: name.into(),
            status,
            encoders: encoders.into_iter().collect(),
            modes: modes.into_iter().collect(),
        });
        ConnectorIdx(self.topology.connectors.len() - 1)
    }

    /// Finish building
    pub fn build(self) -> Topology {
        self.topology
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connectors(statuses: &[(&str, ConnectorStatus)]) -> Topology {
        let mut builder = Topology::builder();
        for (i, (name, status)) in statuses.iter().enumerate() {
            builder.add_connector(ObjectId(i as u32 + 1), *name, *status, [], []);
        }
        builder.build()
    }

    #[test]
    fn default_connector_skips_disconnected() {
        let topology = connectors(&[
            ("DP-1", ConnectorStatus::Disconnected),
            ("HDMI-A-1", ConnectorStatus::Connected),
        ]);
        let idx = topology.default_connector().unwrap();
        assert_eq!(topology.connector(idx).name(), "HDMI-A-1");
    }

    #[test]
    fn default_connector_prefers_connected_over_unknown() {
        let topology = connectors(&[
            ("VGA-1", ConnectorStatus::Unknown),
            ("DP-1", ConnectorStatus::Connected),
            ("HDMI-A-1", ConnectorStatus::Connected),
        ]);
        let idx = topology.default_connector().unwrap();
        assert_eq!(topology.connector(idx).name(), "DP-1");
    }

    #[test]
    fn default_connector_falls_back_to_unknown() {
        let topology = connectors(&[
            ("DP-1", ConnectorStatus::Disconnected),
            ("VGA-1", ConnectorStatus::Unknown),
        ]);
        let idx = topology.default_connector().unwrap();
        assert_eq!(topology.connector(idx).name(), "VGA-1");
    }

    #[test]
    fn no_default_connector() {
        let topology = connectors(&[("DP-1", ConnectorStatus::Disconnected)]);
        assert_eq!(topology.default_connector(), None);
        assert_eq!(Topology::default().default_connector(), None);
    }

    #[test]
    fn find_connector_by_name() {
        let topology = connectors(&[
            ("DP-1", ConnectorStatus::Disconnected),
            ("HDMI-A-1", ConnectorStatus::Connected),
        ]);
        let idx = topology.find_connector("DP-1").unwrap();
        assert_eq!(topology.connector(idx).id(), ObjectId(1));
        assert_eq!(topology.find_connector("eDP-1"), None);
    }

    #[test]
    fn linking_planes_keeps_order_and_ignores_duplicates() {
        let mut builder = Topology::builder();
        let primary = builder.add_plane(ObjectId(1), PlaneType::Primary, [Fourcc::Xrgb8888]);
        let cursor = builder.add_plane(ObjectId(2), PlaneType::Cursor, [Fourcc::Argb8888]);
        let crtc = builder.add_crtc(ObjectId(3), []);
        builder.link_plane(crtc, primary);
        builder.link_plane(crtc, cursor);
        builder.link_plane(crtc, primary);
        let topology = builder.build();
        assert_eq!(topology.crtc(crtc).planes(), &[primary, cursor]);
        assert!(topology.plane(cursor).supports_format(Fourcc::Argb8888));
        assert!(!topology.plane(cursor).supports_format(Fourcc::Xrgb8888));
    }
}
