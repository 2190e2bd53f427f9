/// Core data types shared by the symbol store, wire protocol, and
/// aggregator: strings, symbols, and the small value types that travel
/// between them.
use thiserror::Error;

/// Sentinel id for "no symbol" / "no string". Dense ids start at 1.
pub const NULL_ID: u32 = 0;

/// Sentinel value for "line lookup failed for this sample". Distinct from
/// `Symbol::line`/`Symbol::line_last`, which use `0` for "never resolved".
pub const UNRESOLVED_LINE: u32 = u32::MAX;

pub type StringId = u32;
pub type SymbolId = u32;
pub type ThreadId = u32;

/// An interned UTF-8 string. Id 0 is reserved for the empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternedString {
    pub id: StringId,
    pub bytes: Vec<u8>,
}

impl InternedString {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

/// A resolved symbol: a contiguous instruction range with a name and
/// optional source location, owned by the module whose arena allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub id: SymbolId,
    pub address: u64,
    pub size: u32,
    pub name: StringId,
    pub file: StringId,
    pub module: StringId,
    /// First source line for the range, 0 if unknown.
    pub line: u32,
    /// Last source line for the range, 0 if unknown. `line_last >= line`.
    pub line_last: u32,
}

impl Symbol {
    pub fn contains(&self, address: u64) -> bool {
        if self.size == 0 {
            self.address == address
        } else {
            address >= self.address && address < self.address + self.size as u64
        }
    }

    pub fn end(&self) -> u64 {
        self.address + self.size as u64
    }
}

/// One entry of a stack sample, as carried on the wire and in the
/// persisted profile format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStackEntry {
    pub symbol: SymbolId,
    pub line: u32,
    pub offset: u32,
}

impl CallStackEntry {
    pub const SENTINEL: CallStackEntry = CallStackEntry {
        symbol: NULL_ID,
        line: 0,
        offset: 0,
    };

    pub fn is_sentinel(&self) -> bool {
        self.symbol == NULL_ID
    }
}

/// Per-thread, per-symbol sample counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlatSymbol {
    pub self_count: u32,
    pub total_count: u32,
}

/// Pointer width of the profiled process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerSize {
    Bits32,
    Bits64,
}

impl PointerSize {
    pub fn bytes(self) -> u32 {
        match self {
            PointerSize::Bits32 => 4,
            PointerSize::Bits64 => 8,
        }
    }

    pub fn from_bytes(bytes: u32) -> Result<Self, TypesError> {
        match bytes {
            4 => Ok(PointerSize::Bits32),
            8 => Ok(PointerSize::Bits64),
            other => Err(TypesError::InvalidPointerSize(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum TypesError {
    #[error("invalid pointer size: {0}")]
    InvalidPointerSize(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_contains_normal_range() {
        let s = Symbol {
            id: 1,
            address: 0x1000,
            size: 0x10,
            name: 0,
            file: 0,
            module: 0,
            line: 0,
            line_last: 0,
        };
        assert!(s.contains(0x1000));
        assert!(s.contains(0x100f));
        assert!(!s.contains(0x1010));
        assert!(!s.contains(0x0fff));
    }

    #[test]
    fn symbol_contains_zero_size_is_exact() {
        let s = Symbol {
            id: 1,
            address: 0x2000,
            size: 0,
            name: 0,
            file: 0,
            module: 0,
            line: 0,
            line_last: 0,
        };
        assert!(s.contains(0x2000));
        assert!(!s.contains(0x2001));
    }

    #[test]
    fn sentinel_entry_is_detected() {
        assert!(CallStackEntry::SENTINEL.is_sentinel());
        let e = CallStackEntry {
            symbol: 5,
            line: 1,
            offset: 2,
        };
        assert!(!e.is_sentinel());
    }

    #[test]
    fn pointer_size_round_trips() {
        assert_eq!(PointerSize::from_bytes(4).unwrap(), PointerSize::Bits32);
        assert_eq!(PointerSize::from_bytes(8).unwrap(), PointerSize::Bits64);
        assert!(PointerSize::from_bytes(6).is_err());
    }
}
