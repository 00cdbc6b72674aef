use std::{
    fs::OpenOptions,
    io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    sync::Arc,
};

use rustix::fs::{fstat, major, minor, stat, FileType};

/// Ref-counted file descriptor of an open drm device node
#[derive(Debug, Clone)]
pub struct DrmCard {
    fd: Arc<OwnedFd>,
}

impl DrmCard {
    /// Open the device node at `path`
    pub fn open(path: impl AsRef<Path>) -> io::Result<DrmCard> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        DrmCard::new(file.into())
    }

    /// Wrap an already opened device node.
    ///
    /// Fails if `fd` does not refer to a drm character device.
    pub fn new(fd: OwnedFd) -> io::Result<DrmCard> {
        let stat = fstat(&fd)?;
        if FileType::from_raw_mode(stat.st_mode) != FileType::CharacterDevice || !is_device_drm(stat.st_rdev)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}:{} is no DRM device", major(stat.st_rdev), minor(stat.st_rdev)),
            ));
        }
        Ok(DrmCard { fd: Arc::new(fd) })
    }

    /// Path of the device node, if it can be determined
    pub fn dev_path(&self) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{}", self.fd.as_raw_fd())).ok()
    }
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl drm::Device for DrmCard {}
impl drm::control::Device for DrmCard {}

/// Returns if the given device by major:minor pair is a drm device
fn is_device_drm(dev: rustix::fs::Dev) -> bool {
    let path = format!("/sys/dev/char/{}:{}/device/drm", major(dev), minor(dev));
    stat(path.as_str()).is_ok()
}
