#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like CRTC
#![allow(clippy::upper_case_acronyms)]

//! # kms-sink: present camera frames on a KMS plane
//!
//! This crate takes frame buffers produced by a camera pipeline and scans them out on the
//! primary plane of a display, using the DRM atomic modesetting API.
//!
//! ## Structure of the crate
//!
//! - [`format`] knows which pixel formats have an opaque alternative, so a format with an
//!   alpha channel can still be displayed by planes that only scan out the `X` variant.
//! - [`topology`] is a read-only snapshot of the display hardware: connectors, encoders,
//!   crtcs, planes and modes, linked by index.
//! - [`pipeline`] searches that topology for a crtc and primary plane able to carry a format,
//!   and for a mode matching the frame size.
//! - [`binder`] turns frame buffers into display framebuffers on first use and caches them.
//! - [`scheduler`] owns the pending/queued/active commit pipeline.
//! - [`sink`] ties everything together behind [`KmsSink`](sink::KmsSink).
//! - [`device`] describes what the crate needs from the display hardware
//!   ([`DisplayDevice`](device::DisplayDevice)) and, with the `backend_drm` feature, implements
//!   it on top of a DRM device node.
//!
//! ## Frame lifecycle
//!
//! A frame handed to [`KmsSink::submit_frame`](sink::KmsSink::submit_frame) is committed right
//! away if no other commit is outstanding, parked if one is, or dropped if a frame is already
//! parked. Hardware confirmation arrives asynchronously and has to be forwarded to the
//! [`CompletionHandle`](sink::CompletionHandle) of the sink. Once a frame is replaced on screen,
//! its buffer is sent back to the producer through the release channel returned by
//! [`KmsSink::new`](sink::KmsSink::new).
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//! Every sink and drm device carries its own span, so output of multiple sinks can be told
//! apart.

pub mod binder;
pub mod buffer;
pub mod device;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod scheduler;
pub mod sink;
pub mod topology;
pub mod utils;

pub use drm_fourcc::DrmFourcc as Fourcc;
