//! Frame usage tags.

/// What a mapped physical frame is used for.
///
/// The tag travels with every leaf mapping (in the entry's software bits) and
/// decides what fork and teardown do with the frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameUsage {
    Kernel = 0,
    UserPrivate = 1,
    Shared = 2,
    PageTable = 3,
    Cache = 4,
    Device = 5,
}

impl FrameUsage {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::UserPrivate,
            2 => Self::Shared,
            3 => Self::PageTable,
            4 => Self::Cache,
            5 => Self::Device,
            _ => Self::Kernel,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Whether the mapping owns its frame, so that tearing the mapping down
    /// must return the frame to the physical allocator.
    pub const fn owns_frame(self) -> bool {
        matches!(self, Self::Kernel | Self::UserPrivate | Self::Cache)
    }

    /// Whether fork gives the child its own copy of the frame.
    pub const fn copied_on_fork(self) -> bool {
        matches!(self, Self::UserPrivate | Self::Cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_round_trip() {
        for usage in [
            FrameUsage::Kernel,
            FrameUsage::UserPrivate,
            FrameUsage::Shared,
            FrameUsage::PageTable,
            FrameUsage::Cache,
            FrameUsage::Device,
        ] {
            assert_eq!(FrameUsage::from_bits(usage.bits()), usage);
        }
    }

    #[test]
    fn device_and_shared_frames_are_not_owned() {
        assert!(!FrameUsage::Device.owns_frame());
        assert!(!FrameUsage::Shared.copied_on_fork());
        assert!(FrameUsage::UserPrivate.copied_on_fork());
    }
}
