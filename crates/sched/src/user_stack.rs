//! Initial user stacks in the System V layout.
//!
//! From the final stack pointer upwards: `argc`, the `argv` pointers and a
//! null, the `envp` pointers and a null, an empty auxiliary vector, then the
//! strings themselves at the top of the stack.

use alloc::vec::Vec;

use mm::{
    AddressSpace, FrameUsage, MemoryManager, PAGE_SIZE, PageFlags, USER_SPACE_END, VirtualAddress,
};

use crate::Errno;

/// Stacks are placed at the lowest free range at or above this address.
pub const STACK_REGION_START: VirtualAddress = VirtualAddress::new(0x7000_0000_0000);

const AT_NULL: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStack {
    pub base: VirtualAddress,
    pub top: VirtualAddress,
    /// Initial `rsp`, pointing at `argc`.
    pub sp: u64,
    pub argv: u64,
    pub envp: u64,
}

/// Maps a `pages`-page stack into `space` and lays out the program arguments.
pub fn build_user_stack(
    space: &AddressSpace,
    mm: &MemoryManager,
    argv: &[&str],
    envp: &[&str],
    pages: usize,
) -> Result<UserStack, Errno> {
    let base = space.find_free_range(STACK_REGION_START, USER_SPACE_END, pages)?;
    let size = pages * PAGE_SIZE;
    let top = base.as_u64() + size as u64;

    let mut strings: Vec<(u64, &str)> = Vec::new();
    let mut cursor = top;
    for s in argv.iter().chain(envp) {
        cursor -= s.len() as u64 + 1;
        strings.push((cursor, *s));
    }
    let (argv_strings, envp_strings) = strings.split_at(argv.len());

    let mut words = Vec::new();
    words.push(argv.len() as u64);
    words.extend(argv_strings.iter().map(|&(addr, _)| addr));
    words.push(0);
    words.extend(envp_strings.iter().map(|&(addr, _)| addr));
    words.push(0);
    words.extend([AT_NULL, 0]);

    let sp = (cursor - words.len() as u64 * 8) & !0xF;
    if top - sp > size as u64 {
        return Err(Errno::E2BIG);
    }
    let argv_addr = sp + 8;
    let envp_addr = argv_addr + (argv.len() as u64 + 1) * 8;

    let mut image = alloc::vec![0u8; (top - sp) as usize];
    for (index, word) in words.iter().enumerate() {
        image[index * 8..index * 8 + 8].copy_from_slice(&word.to_le_bytes());
    }
    for &(addr, s) in &strings {
        let offset = (addr - sp) as usize;
        image[offset..offset + s.len()].copy_from_slice(s.as_bytes());
    }

    space.map_anonymous(
        mm,
        base,
        pages,
        PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_EXECUTE,
        FrameUsage::UserPrivate,
    )?;
    if let Err(err) = space.write_bytes(VirtualAddress::new(sp as usize), &image) {
        space.unmap_range(mm, base, size);
        return Err(err.into());
    }
    log::trace!("user stack {base}..{top:#x}, sp {sp:#x}, {} args", argv.len());

    Ok(UserStack {
        base,
        top: VirtualAddress::new(top as usize),
        sp,
        argv: argv_addr,
        envp: envp_addr,
    })
}
