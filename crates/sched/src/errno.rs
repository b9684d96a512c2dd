//! Error codes returned to user space.

/// A POSIX errno. System calls return `-(errno as isize)` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(i32)]
pub enum Errno {
    #[error("operation not permitted")]
    EPERM = 1,
    #[error("no such file or directory")]
    ENOENT = 2,
    #[error("no such process")]
    ESRCH = 3,
    #[error("interrupted system call")]
    EINTR = 4,
    #[error("input/output error")]
    EIO = 5,
    #[error("argument list too long")]
    E2BIG = 7,
    #[error("bad file descriptor")]
    EBADF = 9,
    #[error("no child processes")]
    ECHILD = 10,
    #[error("resource temporarily unavailable")]
    EAGAIN = 11,
    #[error("cannot allocate memory")]
    ENOMEM = 12,
    #[error("bad address")]
    EFAULT = 14,
    #[error("device or resource busy")]
    EBUSY = 16,
    #[error("no such device")]
    ENODEV = 19,
    #[error("invalid argument")]
    EINVAL = 22,
    #[error("too many open files")]
    EMFILE = 24,
    #[error("inappropriate ioctl for device")]
    ENOTTY = 25,
    #[error("no space left on device")]
    ENOSPC = 28,
    #[error("illegal seek")]
    ESPIPE = 29,
}

impl Errno {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// The raw system-call return value.
    pub const fn as_return(self) -> isize {
        -(self as i32 as isize)
    }
}

impl From<mm::MapError> for Errno {
    fn from(err: mm::MapError) -> Self {
        match err {
            mm::MapError::NotMapped(_) => Errno::EFAULT,
            _ => Errno::ENOMEM,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_are_negative_codes() {
        assert_eq!(Errno::EBADF.as_return(), -9);
        assert_eq!(Errno::EMFILE.code(), 24);
        assert_eq!(Errno::ECHILD.to_string(), "no child processes");
    }

    #[test]
    fn map_errors_become_enomem_or_efault() {
        assert_eq!(Errno::from(mm::MapError::OutOfFrames), Errno::ENOMEM);
        assert_eq!(
            Errno::from(mm::MapError::NotMapped(mm::VirtualAddress::new(0x1000))),
            Errno::EFAULT
        );
    }
}
