use std::fmt;

/// A size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    /// Width
    pub w: u32,
    /// Height
    pub h: u32,
}

impl Size {
    /// Create a new size from its width and height
    #[inline]
    pub const fn new(w: u32, h: u32) -> Self {
        Size { w, h }
    }

    /// Checks if the size covers no pixels
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

impl From<(u32, u32)> for Size {
    #[inline]
    fn from((w, h): (u32, u32)) -> Self {
        Size { w, h }
    }
}

impl From<(u16, u16)> for Size {
    #[inline]
    fn from((w, h): (u16, u16)) -> Self {
        Size {
            w: w as u32,
            h: h as u32,
        }
    }
}

impl From<Size> for (u32, u32) {
    #[inline]
    fn from(size: Size) -> Self {
        (size.w, size.h)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}
