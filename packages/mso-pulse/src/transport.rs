// Byte-level link to the scope
//
// The engine sees the instrument only through the `Transport` trait: write one
// command, read one reply. `CharDeviceTransport` talks to a character device
// such as /dev/usbtmc0. Tests and simulators plug in their own transport via
// an `Opener`.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DaqError, Result};

pub trait Transport: Send {
    /// Send one command to the device.
    fn write_command(&mut self, command: &[u8]) -> Result<()>;

    /// Read one reply into `buf`, returning the number of bytes received.
    ///
    /// With a `timeout`, a device that stays silent yields
    /// [`DaqError::Timeout`] instead of blocking forever.
    fn read_frame(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;
}

/// Factory the worker uses to open the device of a run.
pub type Opener = Arc<dyn Fn(&Path) -> Result<Box<dyn Transport>> + Send + Sync>;

/// Opener for character devices.
pub fn char_device_opener() -> Opener {
    Arc::new(|path: &Path| {
        let transport = CharDeviceTransport::open(path)?;
        Ok(Box::new(transport) as Box<dyn Transport>)
    })
}

/// Character device opened for reading and writing
pub struct CharDeviceTransport {
    path: PathBuf,
    file: File,
}

impl CharDeviceTransport {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| DaqError::Device(format!("Failed to open {}: {}", path.display(), e)))?;

        log::info!("Opened device {}", path.display());

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        use std::os::unix::io::AsRawFd;

        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: pfd is a valid pollfd for the duration of the call and the
        // descriptor stays open as long as `self.file` lives.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(rc > 0)
    }

    #[cfg(not(unix))]
    fn wait_readable(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }
}

impl Transport for CharDeviceTransport {
    fn write_command(&mut self, command: &[u8]) -> Result<()> {
        self.file.write_all(command).map_err(|e| {
            DaqError::Device(format!("Write to {} failed: {}", self.path.display(), e))
        })
    }

    fn read_frame(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if let Some(timeout) = timeout {
            if !self.wait_readable(timeout)? {
                return Err(DaqError::Timeout(timeout.as_millis() as u64));
            }
        }

        let received = loop {
            match self.file.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // the usbtmc driver reports its own transfer timeout as ETIMEDOUT
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(DaqError::Timeout(
                        timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                    ));
                }
                Err(e) => {
                    return Err(DaqError::Device(format!(
                        "Read from {} failed: {}",
                        self.path.display(),
                        e
                    )));
                }
            }
        };

        if received == 0 && !buf.is_empty() {
            return Err(DaqError::Device(format!(
                "{} reached end of stream",
                self.path.display()
            )));
        }
        Ok(received)
    }
}

impl Drop for CharDeviceTransport {
    fn drop(&mut self) {
        log::info!("Closed device {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let result = CharDeviceTransport::open("/nonexistent/usbtmc0");
        assert!(matches!(result, Err(DaqError::Device(_))));

        let opener = char_device_opener();
        assert!(opener(Path::new("/nonexistent/usbtmc0")).is_err());
    }

    #[test]
    fn test_regular_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope");
        std::fs::write(&path, b"0123456789REPLY").unwrap();

        let mut transport = CharDeviceTransport::open(&path).unwrap();
        assert_eq!(transport.path(), path.as_path());

        // the command overwrites the first ten bytes, the read continues after it
        transport.write_command(b":WAV:DATA?").unwrap();
        let mut buf = [0u8; 64];
        let n = transport
            .read_frame(&mut buf, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(&buf[..n], b"REPLY");

        drop(transport);
        assert_eq!(std::fs::read(&path).unwrap(), b":WAV:DATA?REPLY");
    }

    #[test]
    fn test_end_of_stream_is_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drained");
        std::fs::write(&path, b"").unwrap();

        let mut transport = CharDeviceTransport::open(&path).unwrap();
        let mut buf = [0u8; 16];
        let err = transport.read_frame(&mut buf, None).unwrap_err();
        assert!(matches!(err, DaqError::Device(_)));
        assert!(!err.is_frame_level());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_timeout_on_silent_device() {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent");
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        // SAFETY: c_path is a valid NUL-terminated string.
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        // Linux allows a FIFO to be opened read-write without a peer
        let mut transport = CharDeviceTransport::open(&path).unwrap();
        let mut buf = [0u8; 16];
        let err = transport
            .read_frame(&mut buf, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, DaqError::Timeout(20)));
        assert!(err.is_frame_level());

        transport.write_command(b"ping").unwrap();
        let n = transport
            .read_frame(&mut buf, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
