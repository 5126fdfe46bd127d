use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt,
    path::Path,
    time::Duration,
};

use tracing::{debug, warn};

use crate::{SerialError, SerialPort};

/// RS-232/USB serial port driver over raw termios.
///
/// The device is opened non-blocking in raw 8N1 mode with exclusive access
/// (TIOCEXCL); readiness waits go through `poll(2)`.
pub struct PosixSerialPort {
    fd: libc::c_int,
}

impl PosixSerialPort {
    pub fn open(device: &Path, baud: u32) -> Result<Self, SerialError> {
        let cpath = CString::new(device.as_os_str().as_bytes())
            .map_err(|_| SerialError::InvalidPort)?;

        let fd = unsafe {
            libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK)
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            warn!(?device, %err, "serial open failed");
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::ENOTDIR) | Some(libc::ENXIO) => {
                    SerialError::InvalidPort
                }
                Some(libc::EBUSY) | Some(libc::EACCES) => SerialError::PortInUse,
                _ => SerialError::Unspecified,
            });
        }

        let mut port = Self { fd };

        // Reject a second opener even where O_EXCL has no effect on ttys.
        if unsafe { libc::ioctl(fd, libc::TIOCEXCL) } != 0 {
            debug!(?device, "TIOCEXCL not supported");
        }

        if !unsafe { libc::isatty(fd) == 1 } {
            port.close();
            return Err(SerialError::InvalidPort);
        }

        port.configure(baud)?;
        Ok(port)
    }

    fn configure(&mut self, baud: u32) -> Result<(), SerialError> {
        let speed = baud_constant(baud).ok_or(SerialError::InvalidSettings)?;

        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(self.fd, &mut tio) != 0 {
                return Err(SerialError::InvalidSettings);
            }

            libc::cfmakeraw(&mut tio);
            // 8N1, receiver on, modem-control lines ignored.
            tio.c_cflag &= !(libc::CSIZE | libc::PARENB | libc::CSTOPB);
            tio.c_cflag |= libc::CS8 | libc::CREAD | libc::CLOCAL;
            tio.c_cc[libc::VMIN] = 0;
            tio.c_cc[libc::VTIME] = 0;

            if libc::cfsetispeed(&mut tio, speed) != 0
                || libc::cfsetospeed(&mut tio, speed) != 0
            {
                return Err(SerialError::InvalidSettings);
            }
            if libc::tcsetattr(self.fd, libc::TCSANOW, &tio) != 0 {
                return Err(SerialError::InvalidSettings);
            }
            libc::tcflush(self.fd, libc::TCIOFLUSH);
        }
        Ok(())
    }

    fn wait_ready(&self, events: libc::c_short, timeout: Duration) -> Result<(), SerialError> {
        let mut pfd = libc::pollfd { fd: self.fd, events, revents: 0 };
        let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        match rc {
            0 => Err(SerialError::Timeout),
            n if n < 0 => Err(SerialError::Unspecified),
            _ if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 => {
                Err(SerialError::ReceiveError)
            }
            _ => Ok(()),
        }
    }
}

impl SerialPort for PosixSerialPort {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize, SerialError> {
        self.wait_ready(libc::POLLOUT, timeout).map_err(|e| match e {
            SerialError::ReceiveError => SerialError::TransmitError,
            other => other,
        })?;
        let n = unsafe {
            libc::write(self.fd, data.as_ptr().cast::<libc::c_void>(), data.len())
        };
        if n < 0 {
            warn!(err = %io::Error::last_os_error(), "serial write failed");
            return Err(SerialError::TransmitError);
        }
        Ok(n as usize)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError> {
        self.wait_ready(libc::POLLIN, timeout)?;
        let n = unsafe {
            libc::read(self.fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len())
        };
        match n {
            0 => Err(SerialError::Timeout),
            n if n < 0 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Err(SerialError::Timeout);
                }
                warn!(%err, "serial read failed");
                Err(SerialError::ReceiveError)
            }
            n => Ok(n as usize),
        }
    }

    fn set_data_rate(&mut self, baud: u32) -> Result<(), SerialError> {
        unsafe {
            libc::tcdrain(self.fd);
        }
        self.configure(baud)
    }

    fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

impl Drop for PosixSerialPort {
    fn drop(&mut self) {
        self.close();
    }
}

fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115_200 => libc::B115200,
        _ => return None,
    })
}
