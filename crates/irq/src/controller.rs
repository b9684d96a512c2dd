use crate::IrqError;

/// The piece of hardware that turns a global system interrupt into a vector.
pub trait IrqController {
    /// Vector the hardware always raises for `gsi`, if it cannot be chosen.
    fn fixed_vector(&self, gsi: u32) -> Option<u8>;

    /// Programs `gsi` to raise `vector` and unmasks it.
    fn route(&mut self, gsi: u32, vector: u8) -> Result<(), IrqError>;

    /// Masks `gsi`.
    fn unroute(&mut self, gsi: u32);

    fn eoi(&mut self, vector: u8);
}
