//! Format info tables and format negotiation.
//!
//! Camera pipelines commonly produce formats carrying an alpha channel, while primary planes
//! often only scan out the opaque `X` variant of the same layout. Since the alpha channel is
//! meaningless for a full screen primary plane, the opaque variant is an acceptable stand-in.
//!
//! [`get_opaque`] returns the opaque alternative of a format with an alpha channel.
//!
//! ```
//! # use kms_sink::Fourcc;
//! # use kms_sink::format::get_opaque;
//! assert_eq!(Some(Fourcc::Xrgb8888), get_opaque(Fourcc::Argb8888));
//! assert_eq!(None, get_opaque(Fourcc::Nv12));
//! ```
//!
//! [`resolve_format`] bundles a requested format with its fallback:
//!
//! ```
//! # use kms_sink::Fourcc;
//! # use kms_sink::format::resolve_format;
//! let candidates = resolve_format(Fourcc::Abgr8888);
//! assert_eq!(candidates.primary, Fourcc::Abgr8888);
//! assert_eq!(candidates.fallback, Some(Fourcc::Xbgr8888));
//! ```

use crate::Fourcc;

/// Macro to generate table lookup functions for formats.
macro_rules! format_tables {
    (
        $($fourcc: ident {
            $(opaque: $opaque: ident,)?
            alpha: $alpha: expr,
            bpp: $bpp: expr $(,)?
        }),* $(,)?
    ) => {
        /// Returns the opaque alternative of the specified format.
        ///
        /// Formats without an alpha channel, or without a known opaque counterpart,
        /// return [`None`].
        pub const fn get_opaque(fourcc: Fourcc) -> Option<Fourcc> {
            match fourcc {
                $($(
                    Fourcc::$fourcc => Some(Fourcc::$opaque),
                )?)*
                _ => None,
            }
        }

        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats will always return `false`.
        pub const fn has_alpha(fourcc: Fourcc) -> bool {
            match fourcc {
                $(
                    Fourcc::$fourcc => $alpha,
                )*
                _ => false,
            }
        }

        /// Returns the bits per pixel of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_bpp(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        #[cfg(test)]
        fn known_formats() -> &'static [Fourcc] {
            &[
                $(
                    Fourcc::$fourcc,
                )*
            ]
        }
    };
}

format_tables! {
    // 16-bit bpp RGB, 4 bits per channel
    Argb4444 { opaque: Xrgb4444, alpha: true, bpp: 16 },
    Xrgb4444 { alpha: false, bpp: 16 },
    Abgr4444 { opaque: Xbgr4444, alpha: true, bpp: 16 },
    Xbgr4444 { alpha: false, bpp: 16 },
    Rgba4444 { opaque: Rgbx4444, alpha: true, bpp: 16 },
    Rgbx4444 { alpha: false, bpp: 16 },
    Bgra4444 { opaque: Bgrx4444, alpha: true, bpp: 16 },
    Bgrx4444 { alpha: false, bpp: 16 },

    // 16-bit bpp RGB, 5 bits per color channel, 1 bit for alpha channel
    Argb1555 { opaque: Xrgb1555, alpha: true, bpp: 16 },
    Xrgb1555 { alpha: false, bpp: 16 },
    Abgr1555 { opaque: Xbgr1555, alpha: true, bpp: 16 },
    Xbgr1555 { alpha: false, bpp: 16 },
    Rgba5551 { opaque: Rgbx5551, alpha: true, bpp: 16 },
    Rgbx5551 { alpha: false, bpp: 16 },
    Bgra5551 { opaque: Bgrx5551, alpha: true, bpp: 16 },
    Bgrx5551 { alpha: false, bpp: 16 },

    Rgb565 { alpha: false, bpp: 16 },
    Bgr565 { alpha: false, bpp: 16 },

    Rgb888 { alpha: false, bpp: 24 },
    Bgr888 { alpha: false, bpp: 24 },

    // 32-bit bpp RGB, 8 bits per channel
    Argb8888 { opaque: Xrgb8888, alpha: true, bpp: 32 },
    Xrgb8888 { alpha: false, bpp: 32 },
    Abgr8888 { opaque: Xbgr8888, alpha: true, bpp: 32 },
    Xbgr8888 { alpha: false, bpp: 32 },
    Rgba8888 { opaque: Rgbx8888, alpha: true, bpp: 32 },
    Rgbx8888 { alpha: false, bpp: 32 },
    Bgra8888 { opaque: Bgrx8888, alpha: true, bpp: 32 },
    Bgrx8888 { alpha: false, bpp: 32 },

    // 32-bit bpp RGB with 10-bits per color channel
    Argb2101010 { opaque: Xrgb2101010, alpha: true, bpp: 32 },
    Xrgb2101010 { alpha: false, bpp: 32 },
    Abgr2101010 { opaque: Xbgr2101010, alpha: true, bpp: 32 },
    Xbgr2101010 { alpha: false, bpp: 32 },
    Rgba1010102 { opaque: Rgbx1010102, alpha: true, bpp: 32 },
    Rgbx1010102 { alpha: false, bpp: 32 },
    Bgra1010102 { opaque: Bgrx1010102, alpha: true, bpp: 32 },
    Bgrx1010102 { alpha: false, bpp: 32 },

    // Floating point 64bpp RGB
    Argb16161616f { opaque: Xrgb16161616f, alpha: true, bpp: 64 },
    Xrgb16161616f { alpha: false, bpp: 64 },
    Abgr16161616f { opaque: Xbgr16161616f, alpha: true, bpp: 64 },
    Xbgr16161616f { alpha: false, bpp: 64 },

    // packed YUV, commonly produced by camera sensors
    Yuyv { alpha: false, bpp: 16 },
    Yvyu { alpha: false, bpp: 16 },
    Uyvy { alpha: false, bpp: 16 },
    Vyuy { alpha: false, bpp: 16 },
}

/// Formats to try, in order, when looking for a plane able to display a requested format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatCandidates {
    /// The format as requested
    pub primary: Fourcc,
    /// The opaque variant of [`primary`](FormatCandidates::primary), if it has one
    pub fallback: Option<Fourcc>,
}

impl FormatCandidates {
    /// Iterate over the candidates, primary first
    pub fn iter(&self) -> impl Iterator<Item = Fourcc> {
        std::iter::once(self.primary).chain(self.fallback)
    }
}

/// Derive the formats that may be used to display `requested`.
pub fn resolve_format(requested: Fourcc) -> FormatCandidates {
    FormatCandidates {
        primary: requested,
        fallback: get_opaque(requested),
    }
}
