//! The narrow contracts the core uses to talk to drivers.

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

use ksync::IrqSpinlock;

use crate::{Errno, Notification, Waker};

/// A random-access device addressed in bytes.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;

    /// Reads up to `buf.len()` bytes at `offset`; returns how many were read
    /// (zero at the end of the device).
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, Errno>;

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize, Errno>;

    fn ioctl(&self, _cmd: u32, _arg: u64) -> Result<usize, Errno> {
        Err(Errno::ENOTTY)
    }

    /// Returns the physical base of `length` bytes starting at `offset`, for
    /// devices whose contents live in memory.
    fn mmap(&self, _offset: u64, _length: usize) -> Result<mm::PhysicalAddress, Errno> {
        Err(Errno::ENODEV)
    }
}

/// A byte stream device.
pub trait CharDevice: Send + Sync {
    /// Reads whatever is available; `EAGAIN` when nothing is.
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno>;

    /// Writes bytes, waking whoever waits on the device's notification.
    fn write(&self, buf: &[u8], waker: &dyn Waker) -> Result<usize, Errno>;

    fn ioctl(&self, _cmd: u32, _arg: u64) -> Result<usize, Errno> {
        Err(Errno::ENOTTY)
    }

    /// Bumped whenever data becomes readable.
    fn notification(&self) -> &Notification;
}

#[derive(Clone)]
pub enum Device {
    Block(Arc<dyn BlockDevice>),
    Char(Arc<dyn CharDevice>),
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Device::Block(_) => f.write_str("Device::Block"),
            Device::Char(_) => f.write_str("Device::Char"),
        }
    }
}

/// A bounded byte queue exposed as a character device. Writes beyond the
/// capacity are dropped, as a UART receive FIFO would drop them.
pub struct RingBuffer {
    data: IrqSpinlock<VecDeque<u8>>,
    capacity: usize,
    ready: Notification,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer needs a nonzero capacity");
        Self {
            data: IrqSpinlock::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notification::new(),
        }
    }

    /// Producer side, typically called from an interrupt handler. Returns
    /// how many bytes fit.
    pub fn push(&self, bytes: &[u8], waker: &dyn Waker) -> usize {
        let accepted = {
            let mut data = self.data.lock();
            let room = self.capacity - data.len();
            let accepted = bytes.len().min(room);
            data.extend(&bytes[..accepted]);
            accepted
        };
        if accepted < bytes.len() {
            log::trace!("ring buffer full, dropped {} bytes", bytes.len() - accepted);
        }
        if accepted > 0 {
            self.ready.signal(waker);
        }
        accepted
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CharDevice for RingBuffer {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut data = self.data.lock();
        if data.is_empty() {
            return Err(Errno::EAGAIN);
        }
        let count = buf.len().min(data.len());
        for (dst, src) in buf.iter_mut().zip(data.drain(..count)) {
            *dst = src;
        }
        if data.is_empty() {
            self.ready.consume();
        }
        Ok(count)
    }

    fn write(&self, buf: &[u8], waker: &dyn Waker) -> Result<usize, Errno> {
        match self.push(buf, waker) {
            0 if !buf.is_empty() => Err(Errno::EAGAIN),
            n => Ok(n),
        }
    }

    fn notification(&self) -> &Notification {
        &self.ready
    }
}

/// A block device backed by kernel memory.
pub struct RamDisk {
    data: IrqSpinlock<Vec<u8>>,
    block_size: usize,
}

impl RamDisk {
    pub fn new(size: usize, block_size: usize) -> Self {
        Self {
            data: IrqSpinlock::new(alloc::vec![0; size]),
            block_size,
        }
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
        let data = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| Errno::EINVAL)?;
        if start >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize, Errno> {
        let mut data = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| Errno::EINVAL)?;
        if start >= data.len() {
            return if buf.is_empty() { Ok(0) } else { Err(Errno::ENOSPC) };
        }
        let count = buf.len().min(data.len() - start);
        data[start..start + count].copy_from_slice(&buf[..count]);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThreadHandle;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingWaker(Cell<usize>);

    impl Waker for CountingWaker {
        fn wake(&self, _thread: ThreadHandle) {
            self.0.set(self.0.get() + 1);
        }
    }

    mod ring_buffer {
        use super::*;

        #[test]
        fn push_signals_and_read_drains() {
            let ring = RingBuffer::new(8);
            let waker = CountingWaker::default();
            assert_eq!(ring.read(&mut [0; 4]), Err(Errno::EAGAIN));

            assert_eq!(ring.push(b"hello", &waker), 5);
            assert_eq!(ring.notification().value(), 1);

            let mut buf = [0; 3];
            assert_eq!(ring.read(&mut buf), Ok(3));
            assert_eq!(&buf, b"hel");
            assert_eq!(ring.notification().value(), 1);

            assert_eq!(ring.read(&mut buf), Ok(2));
            assert_eq!(&buf[..2], b"lo");
            assert_eq!(ring.notification().value(), 0);
        }

        #[test]
        fn overflow_is_dropped() {
            let ring = RingBuffer::new(4);
            let waker = CountingWaker::default();
            assert_eq!(ring.push(b"abcdef", &waker), 4);
            assert_eq!(ring.push(b"g", &waker), 0);
            assert_eq!(CharDevice::write(&ring, b"g", &waker), Err(Errno::EAGAIN));
            assert_eq!(ring.len(), 4);
        }

        #[test]
        fn registered_reader_is_woken() {
            let ring = RingBuffer::new(4);
            let waker = CountingWaker::default();
            let mut arena = crate::Arena::new();
            let reader = arena.insert(());
            ring.notification().register(reader);
            ring.push(b"x", &waker);
            assert_eq!(waker.0.get(), 1);
        }
    }

    mod ram_disk {
        use super::*;

        #[test]
        fn reads_and_writes_at_offsets() {
            let disk = RamDisk::new(1024, 512);
            assert_eq!(disk.write(b"tern", 510), Ok(4));
            let mut buf = [0; 6];
            assert_eq!(disk.read(&mut buf, 508), Ok(6));
            assert_eq!(&buf, b"\0\0tern");
        }

        #[test]
        fn end_of_device() {
            let disk = RamDisk::new(16, 16);
            assert_eq!(disk.read(&mut [0; 4], 16), Ok(0));
            assert_eq!(disk.write(b"abcd", 14), Ok(2));
            assert_eq!(disk.write(b"abcd", 16), Err(Errno::ENOSPC));
            assert_eq!(disk.ioctl(1, 0), Err(Errno::ENOTTY));
            assert_eq!(disk.mmap(0, 16), Err(Errno::ENODEV));
        }
    }
}
