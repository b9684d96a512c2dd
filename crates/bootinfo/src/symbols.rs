//! Minimal ELF64 symbol table for turning return addresses into names.

/// `Elf64_Sym` exactly as it appears in `.symtab`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Elf64Symbol {
    pub name: u32,
    pub info: u8,
    pub other: u8,
    pub section: u16,
    pub value: u64,
    pub size: u64,
}

const STT_FUNC: u8 = 2;

impl Elf64Symbol {
    pub fn is_function(&self) -> bool {
        self.info & 0xF == STT_FUNC && self.value != 0
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.value && addr - self.value < self.size.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol<'a> {
    pub name: &'a str,
    pub address: u64,
    /// Distance of the looked-up address from the symbol start.
    pub offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SymbolTable<'a> {
    symbols: &'a [Elf64Symbol],
    strings: &'a [u8],
}

impl<'a> SymbolTable<'a> {
    pub const fn new(symbols: &'a [Elf64Symbol], strings: &'a [u8]) -> Self {
        Self { symbols, strings }
    }

    pub const fn empty() -> Self {
        Self::new(&[], &[])
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Finds the function containing `addr`. Symbols without a recorded
    /// size are treated as extending to the next one, so the closest
    /// preceding function is used when nothing contains `addr` exactly.
    pub fn lookup(&self, addr: u64) -> Option<Symbol<'a>> {
        let functions = self.symbols.iter().filter(|s| s.is_function() && s.value <= addr);
        let best = functions
            .clone()
            .filter(|s| s.contains(addr))
            .max_by_key(|s| s.value)
            .or_else(|| functions.filter(|s| s.size == 0).max_by_key(|s| s.value))?;
        Some(Symbol {
            name: self.name(best.name),
            address: best.value,
            offset: addr - best.value,
        })
    }

    fn name(&self, offset: u32) -> &'a str {
        let Some(tail) = self.strings.get(offset as usize..) else {
            return "<bad name>";
        };
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        core::str::from_utf8(&tail[..end]).unwrap_or("<bad name>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(name: u32, value: u64, size: u64) -> Elf64Symbol {
        Elf64Symbol {
            name,
            info: 0x10 | STT_FUNC,
            value,
            size,
            ..Default::default()
        }
    }

    const STRINGS: &[u8] = b"\0kernel_main\0schedule\0trap_entry\0";

    fn table(symbols: &[Elf64Symbol]) -> SymbolTable<'_> {
        SymbolTable::new(symbols, STRINGS)
    }

    #[test]
    fn symbol_layout_matches_elf() {
        assert_eq!(core::mem::size_of::<Elf64Symbol>(), 24);
    }

    #[test]
    fn finds_containing_function() {
        let symbols = [function(1, 0x1000, 0x100), function(13, 0x1100, 0x80)];
        let table = table(&symbols);
        assert_eq!(
            table.lookup(0x1120),
            Some(Symbol {
                name: "schedule",
                address: 0x1100,
                offset: 0x20
            })
        );
        assert_eq!(table.lookup(0x1000).unwrap().name, "kernel_main");
    }

    #[test]
    fn gaps_between_sized_functions_resolve_to_nothing() {
        let symbols = [function(1, 0x1000, 0x10)];
        assert_eq!(table(&symbols).lookup(0x1010), None);
        assert_eq!(table(&symbols).lookup(0x0FFF), None);
    }

    #[test]
    fn unsized_symbols_extend_forward() {
        let symbols = [function(22, 0x2000, 0), function(1, 0x1000, 0x10)];
        let found = table(&symbols).lookup(0x2345).unwrap();
        assert_eq!(found.name, "trap_entry");
        assert_eq!(found.offset, 0x345);
    }

    #[test]
    fn non_function_symbols_are_skipped() {
        let mut object = function(1, 0x1000, 0x100);
        object.info = 0x11;
        assert_eq!(table(&[object]).lookup(0x1010), None);
    }

    #[test]
    fn bad_name_offsets_do_not_panic() {
        let symbols = [function(999, 0x1000, 0x10)];
        assert_eq!(table(&symbols).lookup(0x1000).unwrap().name, "<bad name>");
    }
}
