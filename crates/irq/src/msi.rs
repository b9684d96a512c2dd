//! Message-signalled interrupts.
//!
//! MSI vectors come from their own small range and are never shared: each
//! allocation gets exactly one handler. All MSIs target one CPU chosen by
//! the caller; there is no balancing across CPUs.

use ksync::IrqSpinlock;

use crate::{Dispatch, Handler, HandlerTable, IrqError, MSI_VECTOR_BASE, MSI_VECTORS, VectorAllocator};

const MSI_ADDRESS_BASE: u64 = 0xFEE0_0000;

/// The address/data pair a device writes to raise its interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u32,
}

impl MsiMessage {
    /// Fixed delivery, edge triggered, physical destination `apic_id`.
    pub const fn new(apic_id: u8, vector: u8) -> Self {
        Self {
            address: MSI_ADDRESS_BASE | (apic_id as u64) << 12,
            data: vector as u32,
        }
    }

    pub const fn vector(&self) -> u8 {
        self.data as u8
    }

    pub const fn destination(&self) -> u8 {
        (self.address >> 12) as u8
    }
}

struct MsiState {
    vectors: VectorAllocator,
    handlers: HandlerTable<MSI_VECTORS>,
}

pub struct MsiTable {
    state: IrqSpinlock<MsiState>,
}

impl Default for MsiTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MsiTable {
    pub const fn new() -> Self {
        Self {
            state: IrqSpinlock::new(MsiState {
                vectors: VectorAllocator::new(MSI_VECTOR_BASE, MSI_VECTORS),
                handlers: HandlerTable::new(MSI_VECTOR_BASE),
            }),
        }
    }

    pub fn allocate(&self, handler: Handler, apic_id: u8) -> Result<MsiMessage, IrqError> {
        let mut state = self.state.lock();
        let vector = state.vectors.allocate().ok_or(IrqError::Exhausted)?;
        state
            .handlers
            .chain_mut(vector)
            .expect("MSI vector inside the MSI table")
            .push(handler);
        log::debug!("MSI vector {vector:#x} -> APIC {apic_id}");
        Ok(MsiMessage::new(apic_id, vector))
    }

    /// # Panics
    ///
    /// Panics if `vector` was not allocated from this table.
    pub fn free(&self, vector: u8) {
        let mut state = self.state.lock();
        state.vectors.free(vector);
        *state
            .handlers
            .chain_mut(vector)
            .expect("MSI vector inside the MSI table") = crate::HandlerChain::EMPTY;
    }

    pub fn contains(&self, vector: u8) -> bool {
        self.state.lock().vectors.contains(vector)
    }

    pub fn handle(&self, vector: u8) -> Dispatch {
        let chain = self.state.lock().handlers.chain(vector).copied();
        let result = chain.map_or(Dispatch::Empty, |c| c.dispatch());
        if !matches!(result, Dispatch::Handled(_)) {
            log::debug!("unhandled MSI on vector {vector:#x}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IrqReturn;

    fn handled(_: usize) -> IrqReturn {
        IrqReturn::Handled
    }

    #[test]
    fn message_encoding() {
        let msg = MsiMessage::new(2, 0x51);
        assert_eq!(msg.address, 0xFEE0_2000);
        assert_eq!(msg.data, 0x51);
        assert_eq!(msg.destination(), 2);
        assert_eq!(msg.vector(), 0x51);
    }

    #[test]
    fn allocations_come_from_the_msi_range() {
        let table = MsiTable::new();
        for i in 0..MSI_VECTORS {
            let msg = table.allocate(Handler::new(handled, i), 0).unwrap();
            assert_eq!(msg.vector(), MSI_VECTOR_BASE + i as u8);
        }
        assert_eq!(table.allocate(Handler::new(handled, 0), 0), Err(IrqError::Exhausted));
    }

    #[test]
    fn freed_vector_drops_its_handler() {
        let table = MsiTable::new();
        let msg = table.allocate(Handler::new(handled, 0), 1).unwrap();
        assert_eq!(table.handle(msg.vector()), Dispatch::Handled(0));
        table.free(msg.vector());
        assert_eq!(table.handle(msg.vector()), Dispatch::Empty);
        assert_eq!(table.handle(0x30), Dispatch::Empty);
    }

    #[test]
    #[should_panic(expected = "double free of interrupt vector")]
    fn double_free_panics() {
        let table = MsiTable::new();
        let msg = table.allocate(Handler::new(handled, 0), 1).unwrap();
        table.free(msg.vector());
        table.free(msg.vector());
    }
}
