//! Selection of the hardware path displaying a stream.
//!
//! [`resolve_pipeline`] walks the topology from a connector to its encoders, from every
//! encoder to the crtcs able to feed it and from every crtc to its primary planes. The
//! first plane accepting the requested format, or its opaque fallback, is selected. There
//! is no scoring, so the outcome only depends on the enumeration order of the topology.
//!
//! The display mode is looked up independently and has to match the frame size exactly.

use tracing::{debug, trace};

use crate::{
    format::{resolve_format, FormatCandidates},
    topology::{ConnectorIdx, CrtcIdx, Mode, PlaneIdx, PlaneType, Topology},
    utils::Size,
    Fourcc,
};

/// A compatible output path for a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    /// Connector the stream is shown on
    pub connector: ConnectorIdx,
    /// Crtc driving the connector
    pub crtc: CrtcIdx,
    /// Primary plane of the crtc carrying the frames
    pub plane: PlaneIdx,
    /// Mode matching the frame size
    pub mode: Mode,
    /// Format the plane scans out, either the requested one or its fallback
    pub format: Fourcc,
}

/// No output path is able to carry the stream
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineNotFound {
    /// No reachable primary plane supports the format or its fallback
    #[error("No primary plane supports {format} (fallback: {fallback:?})")]
    NoCompatiblePlane {
        /// Requested format
        format: Fourcc,
        /// Opaque fallback that was tried as well
        fallback: Option<Fourcc>,
    },
    /// The connector has no mode of the frame size
    #[error("No mode of size {0}")]
    NoMatchingMode(Size),
}

/// Find the first crtc and primary plane reachable from `connector` able to display
/// `format`, and the connector mode of exactly `size`.
#[profiling::function]
pub fn resolve_pipeline(
    topology: &Topology,
    connector: ConnectorIdx,
    format: Fourcc,
    size: Size,
) -> Result<Pipeline, PipelineNotFound> {
    let candidates = resolve_format(format);
    let (crtc, plane, format) =
        find_plane(topology, connector, &candidates).ok_or(PipelineNotFound::NoCompatiblePlane {
            format: candidates.primary,
            fallback: candidates.fallback,
        })?;

    let mode = topology
        .connector(connector)
        .modes()
        .iter()
        .find(|mode| mode.size() == size)
        .cloned()
        .ok_or(PipelineNotFound::NoMatchingMode(size))?;

    debug!(
        connector = topology.connector(connector).name(),
        crtc = %topology.crtc(crtc).id(),
        plane = %topology.plane(plane).id(),
        %format,
        mode = mode.name(),
        "Selected pipeline"
    );

    Ok(Pipeline {
        connector,
        crtc,
        plane,
        mode,
        format,
    })
}

fn find_plane(
    topology: &Topology,
    connector: ConnectorIdx,
    candidates: &FormatCandidates,
) -> Option<(CrtcIdx, PlaneIdx, Fourcc)> {
    for &encoder in topology.connector(connector).encoders() {
        for &crtc in topology.encoder(encoder).possible_crtcs() {
            for &plane_idx in topology.crtc(crtc).planes() {
                let plane = topology.plane(plane_idx);
                if plane.kind() != PlaneType::Primary {
                    continue;
                }

                if let Some(format) = candidates.iter().find(|f| plane.supports_format(*f)) {
                    return Some((crtc, plane_idx, format));
                }
                trace!(plane = %plane.id(), "Plane supports none of {:?}", candidates);
            }
        }
    }
    None
}
