//! Per-process file-descriptor tables.

use alloc::{sync::Arc, vec::Vec};

use bitflags::bitflags;
use ksync::IrqSpinlock;

use crate::{Device, Errno, Waker};

/// Descriptors per process.
pub const MAX_FILES: usize = 64;

pub type Fd = usize;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const NONBLOCK = 1 << 2;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FdError {
    #[error("file-descriptor table full")]
    Exhausted,
    #[error("descriptor {0} is not open")]
    BadDescriptor(Fd),
}

impl From<FdError> for Errno {
    fn from(err: FdError) -> Self {
        match err {
            FdError::Exhausted => Errno::EMFILE,
            FdError::BadDescriptor(_) => Errno::EBADF,
        }
    }
}

/// An open device plus the file position. Shared by `dup` and `fork`.
#[derive(Debug)]
pub struct OpenFile {
    device: Device,
    flags: OpenFlags,
    offset: IrqSpinlock<u64>,
}

impl OpenFile {
    pub fn new(device: Device, flags: OpenFlags) -> Self {
        Self {
            device,
            flags,
            offset: IrqSpinlock::new(0),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(Errno::EBADF);
        }
        match &self.device {
            Device::Block(dev) => {
                let mut offset = self.offset.lock();
                let count = dev.read(buf, *offset)?;
                *offset += count as u64;
                Ok(count)
            }
            Device::Char(dev) => dev.read(buf),
        }
    }

    pub fn write(&self, buf: &[u8], waker: &dyn Waker) -> Result<usize, Errno> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(Errno::EBADF);
        }
        match &self.device {
            Device::Block(dev) => {
                let mut offset = self.offset.lock();
                let count = dev.write(buf, *offset)?;
                *offset += count as u64;
                Ok(count)
            }
            Device::Char(dev) => dev.write(buf, waker),
        }
    }

    /// Whether a read would return data right now. Block devices always can.
    pub fn is_readable(&self) -> bool {
        match &self.device {
            Device::Block(_) => true,
            Device::Char(dev) => dev.notification().value() > 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileTable {
    slots: Vec<Option<Arc<OpenFile>>>,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            slots: alloc::vec![None; MAX_FILES],
        }
    }

    /// Installs `file` in the lowest free slot.
    pub fn install(&mut self, file: Arc<OpenFile>) -> Result<Fd, FdError> {
        let fd = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FdError::Exhausted)?;
        self.slots[fd] = Some(file);
        Ok(fd)
    }

    pub fn get(&self, fd: Fd) -> Result<Arc<OpenFile>, FdError> {
        self.slots
            .get(fd)
            .and_then(Option::clone)
            .ok_or(FdError::BadDescriptor(fd))
    }

    pub fn close(&mut self, fd: Fd) -> Result<(), FdError> {
        self.slots
            .get_mut(fd)
            .and_then(Option::take)
            .map(drop)
            .ok_or(FdError::BadDescriptor(fd))
    }

    pub fn dup(&mut self, fd: Fd) -> Result<Fd, FdError> {
        let file = self.get(fd)?;
        self.install(file)
    }

    pub fn close_all(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
