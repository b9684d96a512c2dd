//! Checked copies between the kernel and a user address space.

use mm::{AddressSpace, USER_SPACE_END, USER_SPACE_START, VirtualAddress};

use crate::Errno;

/// Validates that `addr..addr + len` lies entirely in the user half.
pub fn user_range(addr: u64, len: usize) -> Result<VirtualAddress, Errno> {
    let start = usize::try_from(addr).map_err(|_| Errno::EFAULT)?;
    let end = start.checked_add(len).ok_or(Errno::EFAULT)?;
    if start < USER_SPACE_START.as_usize() || end > USER_SPACE_END.as_usize() {
        return Err(Errno::EFAULT);
    }
    Ok(VirtualAddress::new(start))
}

pub fn copy_from_user(space: &AddressSpace, addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
    let virt = user_range(addr, buf.len())?;
    Ok(space.read_bytes(virt, buf)?)
}

pub fn copy_to_user(space: &AddressSpace, addr: u64, data: &[u8]) -> Result<(), Errno> {
    let virt = user_range(addr, data.len())?;
    Ok(space.write_bytes(virt, data)?)
}

pub fn read_u64(space: &AddressSpace, addr: u64) -> Result<u64, Errno> {
    let mut bytes = [0; 8];
    copy_from_user(space, addr, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn write_u64(space: &AddressSpace, addr: u64, value: u64) -> Result<(), Errno> {
    copy_to_user(space, addr, &value.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_must_stay_in_the_user_half() {
        assert_eq!(user_range(0x1000, 16).unwrap().as_usize(), 0x1000);
        assert_eq!(user_range(0, 8), Err(Errno::EFAULT));
        assert_eq!(user_range(USER_SPACE_END.as_u64() - 8, 16), Err(Errno::EFAULT));
        assert_eq!(user_range(0xFFFF_8000_0000_0000, 1), Err(Errno::EFAULT));
        assert_eq!(user_range(u64::MAX, 2), Err(Errno::EFAULT));
    }
}
