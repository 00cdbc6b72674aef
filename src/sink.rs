//! The display sink.
//!
//! A [`KmsSink`] shows a stream of frame buffers on one connector of a display device.
//! Its lifecycle is:
//!
//! 1. [`KmsSink::new`] selects the connector and returns the sink together with the
//!    channel released buffers are sent through,
//! 2. [`KmsSink::configure`] negotiates format and mode for a [`StreamConfig`],
//! 3. [`KmsSink::start`] resets the device to a known state and starts a session,
//! 4. [`KmsSink::submit_frame`] is called for every frame,
//! 5. [`KmsSink::stop`] disables the output and ends the session.
//!
//! Completion events of the device have to be forwarded to the [`CompletionHandle`] of the
//! sink, which can be moved to whatever thread or event loop receives them.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use kms_sink::{Fourcc, device::DisplayEvent, sink::{KmsSink, StreamConfig}, utils::Size};
//! # use kms_sink::device::drm::DrmDisplay;
//! # use kms_sink::buffer::{BufferId, FrameBuffer, FramePlane};
//! # struct Frame;
//! # impl FrameBuffer for Frame {
//! #     fn id(&self) -> BufferId { BufferId(0) }
//! #     fn planes(&self) -> smallvec::SmallVec<[FramePlane<'_>; 4]> { Default::default() }
//! # }
//! # fn next_frame() -> Frame { Frame }
//! let device = Arc::new(DrmDisplay::open("/dev/dri/card0")?);
//! let (mut sink, released) = KmsSink::<_, Frame>::new(device.clone(), None)?;
//! sink.configure(&StreamConfig {
//!     format: Fourcc::Argb8888,
//!     size: Size::new(1920, 1080),
//!     stride: 1920 * 4,
//! })?;
//! sink.start()?;
//!
//! let completion = sink.completion_handle();
//! let mut event_loop = calloop::EventLoop::<()>::try_new()?;
//! event_loop
//!     .handle()
//!     .insert_source(device.event_source(), move |event, _, _| {
//!         if let Err(err) = completion.on_event(event) {
//!             tracing::error!("{}", err);
//!         }
//!     })
//!     .map_err(|err| err.error)?;
//!
//! match sink.submit_frame(next_frame()) {
//!     Ok(status) => { /* the frame is displayed unless it was dropped */ }
//!     Err(err) => { /* the frame is returned in `err.buffer` */ }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::sync::Arc;

use calloop::channel::{self, Channel};
use tracing::{debug, info, info_span, instrument, warn};

use crate::{
    binder::BufferBinder,
    buffer::{BufferLayout, FrameBuffer},
    device::{AtomicRequest, CommitFlags, DisplayDevice, DisplayEvent, PropertyTarget, PropertyValue, TransactionId},
    error::{CommitError, ConfigurationError, Error, ProtocolViolation, SubmitError},
    format::get_bpp,
    pipeline::{resolve_pipeline, Pipeline},
    scheduler::{CommitScheduler, FrameStatus, OutputPath, SlotSnapshot},
    topology::{Connector, ConnectorIdx, Topology},
    utils::Size,
    Fourcc,
};

/// Environment variable naming the connector to use, if none is given explicitly
pub const CONNECTOR_ENV: &str = "KMS_SINK_CONNECTOR";

// Synchronous modesets never complete asynchronously, frame transactions start at 1.
const MODESET_TRANSACTION: TransactionId = TransactionId(0);

/// Stream parameters the sink is configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Pixel format of the frames
    pub format: Fourcc,
    /// Frame size in pixels
    pub size: Size,
    /// Length of a line in bytes
    pub stride: u32,
}

#[derive(Debug)]
struct Session {
    output: OutputPath,
    layout: BufferLayout,
}

/// Displays frame buffers on the primary plane of a connector
#[derive(Debug)]
pub struct KmsSink<D: DisplayDevice, B: FrameBuffer> {
    device: Arc<D>,
    connector: ConnectorIdx,
    pipeline: Option<(Pipeline, u32)>,
    session: Option<Session>,
    binder: BufferBinder<D::Framebuffer>,
    scheduler: Arc<CommitScheduler<D, B>>,
    span: tracing::Span,
}

impl<D, B> KmsSink<D, B>
where
    D: DisplayDevice,
    B: FrameBuffer,
{
    /// Create a sink displaying on `connector`.
    ///
    /// Without a name the connector is taken from the `KMS_SINK_CONNECTOR` environment
    /// variable, or else the first connector with a display attached is used.
    ///
    /// Buffers replaced on screen are sent through the returned channel.
    pub fn new(device: Arc<D>, connector: Option<&str>) -> Result<(Self, Channel<B>), Error> {
        let span = info_span!("kms_sink", connector = tracing::field::Empty);
        let _guard = span.enter();

        let name = connector_name(connector, std::env::var(CONNECTOR_ENV).ok());
        let topology = device.topology();
        let connector = select_connector(topology, name)?;
        span.record("connector", topology.connector(connector).name());
        info!("Using connector {}", topology.connector(connector).name());

        let (sender, channel) = channel::channel();
        let scheduler = Arc::new(CommitScheduler::new(device.clone(), sender));
        drop(_guard);

        Ok((
            KmsSink {
                device,
                connector,
                pipeline: None,
                session: None,
                binder: BufferBinder::new(),
                scheduler,
                span,
            },
            channel,
        ))
    }

    /// The connector frames are displayed on
    pub fn connector(&self) -> &Connector {
        self.device.topology().connector(self.connector)
    }

    /// The pipeline selected by the last successful [`configure`](Self::configure)
    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.pipeline.as_ref().map(|(pipeline, _)| pipeline)
    }

    /// Check if a session is running
    pub fn is_started(&self) -> bool {
        self.session.is_some()
    }

    /// Number of frame buffers imported during the current session
    pub fn bound_buffers(&self) -> usize {
        self.binder.len()
    }

    /// Transactions currently in flight
    pub fn slots(&self) -> SlotSnapshot {
        self.scheduler.snapshot()
    }

    /// Handle to forward completion events of the device to
    pub fn completion_handle(&self) -> CompletionHandle<D, B> {
        CompletionHandle {
            scheduler: self.scheduler.clone(),
        }
    }

    /// Select the pipeline for a stream.
    ///
    /// Formats with an alpha channel fall back to their opaque variant if no plane supports
    /// them directly. The connector needs a mode of exactly the frame size.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn configure(&mut self, config: &StreamConfig) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::AlreadyStarted);
        }
        self.pipeline = None;

        if let Some(bpp) = get_bpp(config.format) {
            let min_stride = config.size.w as u64 * bpp as u64 / 8;
            if (config.stride as u64) < min_stride {
                return Err(ConfigurationError::InvalidStride {
                    format: config.format,
                    width: config.size.w,
                    stride: config.stride,
                }
                .into());
            }
        }

        let pipeline = resolve_pipeline(self.device.topology(), self.connector, config.format, config.size)
            .map_err(ConfigurationError::from)?;
        if pipeline.format != config.format {
            info!(
                "Format {} not supported by any plane, using {}",
                config.format, pipeline.format
            );
        }
        info!(
            format = %pipeline.format,
            mode = pipeline.mode.name(),
            "Sink configured"
        );
        self.pipeline = Some((pipeline, config.stride));
        Ok(())
    }

    /// Start a session.
    ///
    /// All connectors, crtcs and planes of the device are disabled first, so the first frame
    /// can activate the output regardless of what was displayed before.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn start(&mut self) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let (pipeline, stride) = self.pipeline.as_ref().ok_or(Error::NotConfigured)?;
        let topology = self.device.topology();

        let mut request = AtomicRequest::new(MODESET_TRANSACTION);
        for (_, conn) in topology.connectors() {
            request.add_property(
                PropertyTarget::Connector(conn.id()),
                "CRTC_ID",
                PropertyValue::Object(None),
            );
        }
        for (_, plane) in topology.planes() {
            let target = PropertyTarget::Plane(plane.id());
            request.add_property(target, "CRTC_ID", PropertyValue::Object(None));
            request.add_property(target, "FB_ID", PropertyValue::Object(None));
        }
        for (_, crtc) in topology.crtcs() {
            let target = PropertyTarget::Crtc(crtc.id());
            request.add_property(target, "ACTIVE", PropertyValue::Boolean(false));
            request.add_property(target, "MODE_ID", PropertyValue::Blob(0));
        }
        debug!("Resetting display device to known state");
        self.device
            .commit(&request, CommitFlags::ALLOW_MODESET)
            .map_err(|source| CommitError {
                errmsg: "Error resetting display state",
                transaction: request.id(),
                source,
            })?;

        let connector = topology.connector(pipeline.connector);
        let mode_blob = self
            .device
            .create_mode_blob(connector.id(), &pipeline.mode)
            .map_err(ConfigurationError::ModeBlob)?;

        self.session = Some(Session {
            output: OutputPath {
                connector: connector.id(),
                crtc: topology.crtc(pipeline.crtc).id(),
                plane: topology.plane(pipeline.plane).id(),
                mode_blob,
                size: pipeline.mode.size(),
            },
            layout: BufferLayout {
                format: pipeline.format,
                size: pipeline.mode.size(),
                stride: *stride,
            },
        });
        info!("Sink started");
        Ok(())
    }

    /// Display a frame.
    ///
    /// The frame is committed if no other commit is outstanding, parked until the
    /// outstanding commit completes otherwise. If a frame is already parked, the new frame
    /// is dropped and returned as [`FrameStatus::Dropped`]. On error the frame is returned
    /// inside the [`SubmitError`] and the session continues.
    #[profiling::function]
    pub fn submit_frame(&mut self, buffer: B) -> Result<FrameStatus<B>, SubmitError<B>> {
        let _guard = self.span.enter();
        let Some(session) = &self.session else {
            return Err(SubmitError::new(buffer, Error::NotStarted));
        };

        if let Some(violation) = self.scheduler.poisoned() {
            return Err(SubmitError::new(buffer, violation));
        }
        if self.scheduler.has_pending() {
            debug!(buffer = buffer.id().0, "Frame already pending, dropping frame");
            return Ok(FrameStatus::Dropped(buffer));
        }

        let framebuffer = match self.binder.bind(&*self.device, &buffer, &session.layout) {
            Ok(bound) => bound.framebuffer(),
            Err(err) => {
                warn!("Skipping frame: {}", err);
                return Err(SubmitError::new(buffer, err));
            }
        };

        self.scheduler.submit(buffer, framebuffer, &session.output)
    }

    /// Disable the output and end the session.
    ///
    /// Frames still in flight are discarded without being released and every imported
    /// buffer is freed. No pending frame is committed while the output is being disabled.
    /// If the device rejects the disabling commit the session keeps running.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn stop(&mut self) -> Result<(), Error> {
        let session = self.session.as_ref().ok_or(Error::NotStarted)?;
        let output = session.output;

        let mut request = AtomicRequest::new(MODESET_TRANSACTION);
        request.add_property(
            PropertyTarget::Connector(output.connector),
            "CRTC_ID",
            PropertyValue::Object(None),
        );
        request.add_property(PropertyTarget::Crtc(output.crtc), "ACTIVE", PropertyValue::Boolean(false));
        request.add_property(PropertyTarget::Crtc(output.crtc), "MODE_ID", PropertyValue::Blob(0));
        request.add_property(PropertyTarget::Plane(output.plane), "CRTC_ID", PropertyValue::Object(None));
        request.add_property(PropertyTarget::Plane(output.plane), "FB_ID", PropertyValue::Object(None));
        self.scheduler.suspend();
        if let Err(source) = self.device.commit(&request, CommitFlags::ALLOW_MODESET) {
            self.scheduler.resume();
            return Err(CommitError {
                errmsg: "Error disabling output",
                transaction: request.id(),
                source,
            }
            .into());
        }

        self.scheduler.clear();
        self.binder.clear();
        if let Err(err) = self.device.destroy_mode_blob(output.mode_blob) {
            warn!("Failed to destroy mode blob: {}", err);
        }
        self.session = None;
        info!("Sink stopped");
        Ok(())
    }
}

/// Connector name to look for: an explicit name wins over the environment, an empty
/// environment value counts as unset.
fn connector_name(explicit: Option<&str>, env: Option<String>) -> Option<String> {
    explicit
        .map(str::to_owned)
        .or_else(|| env.filter(|name| !name.is_empty()))
}

fn select_connector(topology: &Topology, name: Option<String>) -> Result<ConnectorIdx, ConfigurationError> {
    match name {
        Some(name) => topology
            .find_connector(&name)
            .ok_or(ConfigurationError::ConnectorNotFound(name)),
        None => topology
            .default_connector()
            .ok_or(ConfigurationError::NoConnectedConnector),
    }
}

impl<D: DisplayDevice, B: FrameBuffer> Drop for KmsSink<D, B> {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(err) = self.stop() {
                warn!(parent: &self.span, "Failed to stop sink on drop: {}", err);
            }
        }
    }
}

/// Forwards completion events to a sink.
///
/// The handle can be cloned and moved to other threads.
#[derive(Debug)]
pub struct CompletionHandle<D, B> {
    scheduler: Arc<CommitScheduler<D, B>>,
}

impl<D, B> Clone for CompletionHandle<D, B> {
    fn clone(&self) -> Self {
        CompletionHandle {
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<D, B> CompletionHandle<D, B>
where
    D: DisplayDevice,
    B: FrameBuffer,
{
    /// Notify the sink that transaction `id` has been applied by the hardware
    pub fn commit_completed(&self, id: TransactionId) -> Result<(), ProtocolViolation> {
        self.scheduler.commit_completed(id)
    }

    /// Process an event of the display device
    pub fn on_event(&self, event: DisplayEvent) -> Result<(), ProtocolViolation> {
        match event {
            DisplayEvent::CommitComplete(id) => self.commit_completed(id),
        }
    }
}
