//! Display device backed by a DRM device node.
//!
//! [`DrmDisplay`] drives the hardware through the atomic modesetting api. On creation it
//! enables the atomic and universal planes capabilities, snapshots the connectors,
//! encoders, crtcs and planes of the device into a [`Topology`] and caches the property
//! handles of every object, so atomic requests can be translated quickly.
//!
//! Asynchronous commits request a page-flip event. Those events are read by the
//! [`DrmEventSource`] returned from [`DrmDisplay::event_source`], which has to be inserted
//! into a calloop event loop. It reports every flip as a [`DisplayEvent::CommitComplete`]
//! of the oldest commit still in flight.

use std::{
    collections::{HashMap, VecDeque},
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    path::Path,
    sync::{Arc, Mutex},
};

use calloop::{
    generic::Generic, EventSource, Interest, Mode as PollMode, Poll, PostAction, Readiness, Token,
    TokenFactory,
};
use drm::{
    control::{
        atomic::AtomicModeReq, connector, AtomicCommitFlags, Device as ControlDevice, Event,
        Mode as DrmMode, PlaneType as DrmPlaneType,
    },
    ClientCapability, Device as BasicDevice,
};
use tracing::{debug, info, info_span, trace, warn};

use super::{AtomicRequest, CommitFlags, DisplayDevice, DisplayEvent, TransactionId};
use crate::{
    buffer::{BufferLayout, FrameBuffer},
    error::AccessError,
    topology::{ConnectorStatus, Mode, ObjectId, PlaneType, Topology},
    Fourcc,
};

mod card;
mod framebuffer;
mod props;

pub use self::card::DrmCard;
pub use self::framebuffer::DrmFramebuffer;
use self::props::{map_props, prop_value, PropMapping};

/// A display device using the DRM atomic api
#[derive(Debug)]
pub struct DrmDisplay {
    card: DrmCard,
    privileged: bool,
    topology: Topology,
    modes: HashMap<ObjectId, Vec<DrmMode>>,
    props: PropMapping,
    inflight: Arc<Mutex<VecDeque<TransactionId>>>,
    span: tracing::Span,
}

impl DrmDisplay {
    /// Open the DRM device node at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<DrmDisplay, AccessError> {
        let path = path.as_ref();
        let card = DrmCard::open(path).map_err(|source| AccessError {
            errmsg: "Failed to open device node",
            dev: Some(path.to_path_buf()),
            source,
        })?;
        DrmDisplay::from_card(card)
    }

    /// Create a display from an open DRM device node
    pub fn new(fd: OwnedFd) -> Result<DrmDisplay, AccessError> {
        let card = DrmCard::new(fd).map_err(|source| AccessError {
            errmsg: "Not a drm device",
            dev: None,
            source,
        })?;
        DrmDisplay::from_card(card)
    }

    fn from_card(card: DrmCard) -> Result<DrmDisplay, AccessError> {
        let span = info_span!("drm_display", device = ?card.dev_path());
        let _guard = span.enter();
        let access = |errmsg: &'static str| {
            let dev = card.dev_path();
            move |source| AccessError { errmsg, dev, source }
        };

        // We want to modeset, so we better be the master, if we run via a tty session.
        // Newer kernels grant this permission, if no other process is already the master.
        let privileged = match card.acquire_master_lock() {
            Ok(()) => true,
            Err(err) => {
                warn!("Unable to become drm master ({}), assuming unprivileged mode", err);
                false
            }
        };

        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(access("Error enabling UniversalPlanes"))?;
        card.set_client_capability(ClientCapability::Atomic, true)
            .map_err(access("Error enabling AtomicModesetting"))?;

        let (topology, modes) = load_topology(&card).map_err(access("Error loading drm resources"))?;

        let mut props = PropMapping::default();
        let res_handles = card.resource_handles().map_err(access("Error loading drm resources"))?;
        let planes = card.plane_handles().map_err(access("Error loading planes"))?;
        map_props(&card, res_handles.connectors(), &mut props.connectors)
            .map_err(access("Error reading properties"))?;
        map_props(&card, res_handles.crtcs(), &mut props.crtcs)
            .map_err(access("Error reading properties"))?;
        map_props(&card, &planes, &mut props.planes).map_err(access("Error reading properties"))?;
        trace!("Mapping: {:#?}", props);

        info!(
            connectors = topology.connectors().count(),
            crtcs = topology.crtcs().count(),
            planes = topology.planes().count(),
            "Display device initialized"
        );

        drop(_guard);
        Ok(DrmDisplay {
            card,
            privileged,
            topology,
            modes,
            props,
            inflight: Default::default(),
            span,
        })
    }

    /// The underlying device node
    pub fn card(&self) -> &DrmCard {
        &self.card
    }

    /// Create an event source reporting completed asynchronous commits.
    ///
    /// Only one event source should exist per display, as every page-flip event is only
    /// delivered once.
    pub fn event_source(&self) -> DrmEventSource {
        DrmEventSource {
            source: Generic::new(self.card.clone(), Interest::READ, PollMode::Level),
            card: self.card.clone(),
            inflight: self.inflight.clone(),
            span: self.span.clone(),
        }
    }

    fn access_error(&self, errmsg: &'static str, source: io::Error) -> AccessError {
        AccessError {
            errmsg,
            dev: self.card.dev_path(),
            source,
        }
    }
}

impl AsFd for DrmDisplay {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }
}

impl Drop for DrmDisplay {
    fn drop(&mut self) {
        if self.privileged {
            if let Err(err) = self.card.release_master_lock() {
                tracing::error!(parent: &self.span, "Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl DisplayDevice for DrmDisplay {
    type Framebuffer = DrmFramebuffer;

    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn import_buffer<B: FrameBuffer>(
        &self,
        buffer: &B,
        layout: &BufferLayout,
    ) -> Result<DrmFramebuffer, AccessError> {
        let _guard = self.span.enter();
        framebuffer::framebuffer_from_frame_buffer(&self.card, buffer, layout)
    }

    fn create_mode_blob(&self, connector: ObjectId, mode: &Mode) -> Result<u64, AccessError> {
        let raw_mode = self
            .topology
            .connectors()
            .find(|(_, conn)| conn.id() == connector)
            .and_then(|(_, conn)| conn.modes().iter().position(|m| m == mode))
            .and_then(|index| self.modes.get(&connector)?.get(index))
            .ok_or_else(|| {
                self.access_error(
                    "Mode not supported by connector",
                    io::Error::from(io::ErrorKind::InvalidInput),
                )
            })?;
        let blob = self
            .card
            .create_property_blob(raw_mode)
            .map_err(|source| self.access_error("Failed to create Property Blob for mode", source))?;
        Ok(blob.into())
    }

    fn destroy_mode_blob(&self, blob: u64) -> Result<(), AccessError> {
        self.card
            .destroy_property_blob(blob)
            .map_err(|source| self.access_error("Failed to destroy Property Blob", source))
    }

    #[profiling::function]
    fn commit(&self, request: &AtomicRequest, flags: CommitFlags) -> Result<(), AccessError> {
        let _guard = self.span.enter();

        let mut req = AtomicModeReq::new();
        for &(target, name, value) in request.properties() {
            let (object, prop) = self.props.prop_handle(target, name).map_err(|err| {
                self.access_error(
                    "Unknown property",
                    io::Error::new(io::ErrorKind::InvalidInput, err),
                )
            })?;
            req.add_raw_property(object, prop, value.raw());
        }

        let drm_flags = drm_flags(flags);

        trace!(transaction = %request.id(), ?drm_flags, "Committing {:?}", req);
        // the in-flight entry has to exist before the page-flip event can be read
        let mut inflight = self.inflight.lock().unwrap();
        self.card
            .atomic_commit(drm_flags, req)
            .map_err(|source| self.access_error("Error committing atomic request", source))?;
        if flags.contains(CommitFlags::ASYNC) {
            inflight.push_back(request.id());
        }
        Ok(())
    }
}

fn drm_flags(flags: CommitFlags) -> AtomicCommitFlags {
    let mut drm_flags = AtomicCommitFlags::empty();
    if flags.contains(CommitFlags::ALLOW_MODESET) {
        drm_flags |= AtomicCommitFlags::ALLOW_MODESET;
    }
    // asynchronous commits are reported through page-flip events
    if flags.contains(CommitFlags::ASYNC) {
        drm_flags |= AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT;
    }
    drm_flags
}

fn load_topology(card: &DrmCard) -> io::Result<(Topology, HashMap<ObjectId, Vec<DrmMode>>)> {
    let res_handles = card.resource_handles()?;
    let mut builder = Topology::builder();

    let mut planes = Vec::new();
    for handle in card.plane_handles()? {
        let info = card.get_plane(handle)?;
        let kind = match prop_value(card, handle, "type")? {
            Some(val) if val == DrmPlaneType::Primary as u64 => PlaneType::Primary,
            Some(val) if val == DrmPlaneType::Cursor as u64 => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        };
        let formats = info
            .formats()
            .iter()
            .filter_map(|code| Fourcc::try_from(*code).ok())
            .collect::<Vec<_>>();
        let idx = builder.add_plane(ObjectId(handle.into()), kind, formats);
        planes.push((idx, res_handles.filter_crtcs(info.possible_crtcs())));
    }

    let mut crtcs = HashMap::new();
    for &crtc in res_handles.crtcs() {
        let idx = builder.add_crtc(ObjectId(crtc.into()), []);
        for (plane, possible) in &planes {
            if possible.contains(&crtc) {
                builder.link_plane(idx, *plane);
            }
        }
        crtcs.insert(crtc, idx);
    }

    let mut encoders = HashMap::new();
    for &encoder in res_handles.encoders() {
        let info = card.get_encoder(encoder)?;
        let possible = res_handles
            .filter_crtcs(info.possible_crtcs())
            .into_iter()
            .filter_map(|crtc| crtcs.get(&crtc).copied());
        encoders.insert(encoder, builder.add_encoder(ObjectId(encoder.into()), possible));
    }

    let mut modes = HashMap::new();
    for &conn in res_handles.connectors() {
        let info = card.get_connector(conn, false)?;
        let id = ObjectId(conn.into());
        let name = format!("{}-{}", interface_name(info.interface()), info.interface_id());
        let status = match info.state() {
            connector::State::Connected => ConnectorStatus::Connected,
            connector::State::Disconnected => ConnectorStatus::Disconnected,
            connector::State::Unknown => ConnectorStatus::Unknown,
        };
        debug!(connector = %name, ?status, "Found connector");

        let conn_encoders = info
            .encoders()
            .iter()
            .filter_map(|encoder| encoders.get(encoder).copied())
            .collect::<Vec<_>>();
        let conn_modes = info.modes().iter().map(|mode| {
            let (w, h) = mode.size();
            Mode::new(mode.name().to_string_lossy(), (w, h), mode.vrefresh())
        });
        builder.add_connector(id, name, status, conn_encoders, conn_modes);
        modes.insert(id, info.modes().to_vec());
    }

    Ok((builder.build(), modes))
}

fn interface_name(interface: connector::Interface) -> String {
    match interface {
        connector::Interface::DVII => "DVI-I".into(),
        connector::Interface::DVID => "DVI-D".into(),
        connector::Interface::DVIA => "DVI-A".into(),
        connector::Interface::SVideo => "S-VIDEO".into(),
        connector::Interface::DisplayPort => "DP".into(),
        connector::Interface::HDMIA => "HDMI-A".into(),
        connector::Interface::HDMIB => "HDMI-B".into(),
        connector::Interface::EmbeddedDisplayPort => "eDP".into(),
        other => format!("{:?}", other),
    }
}

/// Event source reading page-flip events of a [`DrmDisplay`]
#[derive(Debug)]
pub struct DrmEventSource {
    source: Generic<DrmCard>,
    card: DrmCard,
    inflight: Arc<Mutex<VecDeque<TransactionId>>>,
    span: tracing::Span,
}

impl EventSource for DrmEventSource {
    type Event = DisplayEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<C>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: C,
    ) -> Result<PostAction, Self::Error>
    where
        C: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let card = &self.card;
        let inflight = &self.inflight;
        let span = &self.span;
        self.source.process_events(readiness, token, |_, _| {
            let _guard = span.enter();
            for event in card.receive_events()? {
                if let Event::PageFlip(event) = event {
                    let id = inflight.lock().unwrap().pop_front();
                    match id {
                        Some(id) => {
                            trace!(crtc = ?event.crtc, transaction = %id, "Got a page-flip event");
                            callback(DisplayEvent::CommitComplete(id), &mut ());
                        }
                        None => warn!(crtc = ?event.crtc, "Page-flip event without commit in flight"),
                    }
                }
            }
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)
    }
}
