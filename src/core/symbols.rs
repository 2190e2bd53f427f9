/// Symbol store: per-module AVL trees of resolved symbols over arena
/// memory, lazily resolved through a pluggable `SymbolResolver`. Owns the
/// module registry; unrelated to I/O — callers turn the returned `Event`s
/// into wire replies.
use crate::core::interner::{InternEvent, StringInterner};
use crate::core::modules::{Module, ModuleHandle, ModuleRegistry};
use crate::core::types::{Symbol, NULL_ID};

/// What the platform debug-information facility reports for a previously
/// unseen address.
#[derive(Debug, Clone)]
pub struct ResolvedSymbol {
    pub name: Vec<u8>,
    pub file: Vec<u8>,
    pub address: u64,
    pub size: u32,
    pub line: u32,
    pub line_last: u32,
}

/// Implemented by the platform layer (DbgHelp on Windows); kept separate
/// so the store's lookup/caching/AVL logic is testable without touching
/// the OS.
pub trait SymbolResolver {
    fn resolve(&mut self, module: &Module, address: u64) -> Option<ResolvedSymbol>;

    /// Drain any symbol-loading status classified since the last drain
    /// (§4.2: the platform's debug-output callback yields progress lines
    /// classified into `{Downloading, LoadedPrivate, LoadedPublic,
    /// LoadedExport}`, one `Symbols` reply per classified event). Resolvers
    /// with no such side channel return an empty vec.
    fn drain_status_events(&mut self) -> Vec<SymbolLoadStatus> {
        Vec::new()
    }
}

/// Human-readable progress classification for the platform's symbol
/// loading callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLoadStatus {
    Downloading = 0,
    LoadedPrivate = 1,
    LoadedPublic = 2,
    LoadedExport = 3,
}

/// Classify a debug-output line from the platform's symbol loader.
/// Lines matching none of the known patterns are not classified (`None`).
pub fn classify_symbol_status(line: &str) -> Option<SymbolLoadStatus> {
    if line.starts_with("SYMSRV: ")
        && line.contains(" from https://msdl.microsoft.com/download/symbols: ")
    {
        return Some(SymbolLoadStatus::Downloading);
    }
    if line.starts_with("DBGHELP: ") {
        if line.contains(" - private symbols & lines") {
            return Some(SymbolLoadStatus::LoadedPrivate);
        }
        if line.contains(" - public symbol") {
            return Some(SymbolLoadStatus::LoadedPublic);
        }
        if line.contains(" - export symbols") {
            return Some(SymbolLoadStatus::LoadedExport);
        }
    }
    None
}

/// A caller-visible effect of a symbol store operation. The debugger loop
/// turns these into wire replies in the order they're returned.
#[derive(Debug, Clone)]
pub enum SymbolEvent {
    NewString { id: u32, bytes: Vec<u8> },
    NewSymbol(Symbol),
    ModuleLoad { base: u64, name: Vec<u8> },
    ModuleUnload { base: u64 },
}

pub struct SymbolStore {
    modules: ModuleRegistry,
    next_symbol_id: u32,
}

impl SymbolStore {
    pub fn new() -> SymbolStore {
        SymbolStore {
            modules: ModuleRegistry::new(),
            next_symbol_id: 1,
        }
    }

    pub fn load(
        &mut self,
        interner: &mut StringInterner,
        base: u64,
        size: u32,
        name: &[u8],
    ) -> (ModuleHandle, Vec<SymbolEvent>) {
        let mut events = Vec::new();
        let (name_id, intern_event) = interner.intern(name);
        if let InternEvent::New = intern_event {
            events.push(SymbolEvent::NewString {
                id: name_id,
                bytes: name.to_vec(),
            });
        }
        events.push(SymbolEvent::ModuleLoad {
            base,
            name: name.to_vec(),
        });

        let handle = self.modules.load(base, size, name_id);
        (handle, events)
    }

    pub fn unload(&mut self, handle: ModuleHandle) -> Vec<SymbolEvent> {
        let base = self.modules.get(handle).map(|m| m.base);
        if self.modules.unload(handle) {
            vec![SymbolEvent::ModuleUnload {
                base: base.unwrap_or(0),
            }]
        } else {
            Vec::new()
        }
    }

    /// Resolve `address` to a `Symbol`, consulting the cache first and
    /// falling back to `resolver` on a cache miss. Returns `None` if no
    /// module covers the address, or if the resolver can't resolve it.
    pub fn get(
        &mut self,
        interner: &mut StringInterner,
        resolver: &mut dyn SymbolResolver,
        address: u64,
    ) -> (Option<Symbol>, Vec<SymbolEvent>) {
        let mut events = Vec::new();

        let Some((handle, module)) = self.modules.find_by_address(address) else {
            return (None, events);
        };

        if let Some(symbol) = module.symbols.get(address) {
            return (Some(*symbol), events);
        }

        let module = self.modules.get(handle).expect("handle just resolved");
        let Some(resolved) = resolver.resolve(module, address) else {
            return (None, events);
        };

        // special case: a zero-size result is looked up by its own resolved
        // address rather than the query address, since the resolver may
        // have already cached a symbol there under a prior query. Only if
        // nothing is cached at that address do we fall through and create
        // one.
        if resolved.size == 0 {
            if let Some(symbol) = module.symbols.get(resolved.address) {
                return (Some(*symbol), events);
            }
        } else if address < resolved.address || address >= resolved.address + resolved.size as u64
        {
            return (None, events);
        }

        let (name_id, name_new) = interner.intern(&resolved.name);
        if let InternEvent::New = name_new {
            events.push(SymbolEvent::NewString {
                id: name_id,
                bytes: resolved.name.clone(),
            });
        }
        let (file_id, file_new) = interner.intern(&resolved.file);
        if let InternEvent::New = file_new {
            events.push(SymbolEvent::NewString {
                id: file_id,
                bytes: resolved.file.clone(),
            });
        }

        let module_mut = self.modules.get_mut(handle).expect("handle just resolved");
        let symbol = Symbol {
            id: self.next_symbol_id,
            address: resolved.address,
            size: resolved.size,
            name: name_id,
            file: file_id,
            module: module_mut.name,
            line: resolved.line,
            line_last: resolved.line_last,
        };
        self.next_symbol_id += 1;
        module_mut.symbols.insert(symbol);

        events.push(SymbolEvent::NewSymbol(symbol));
        (Some(symbol), events)
    }

    pub fn module(&self, handle: ModuleHandle) -> Option<&Module> {
        self.modules.get(handle)
    }

    pub fn find_module_by_base(&self, base: u64) -> Option<ModuleHandle> {
        self.modules.find_by_base(base)
    }
}

impl Default for SymbolStore {
    fn default() -> Self {
        Self::new()
    }
}

/// `id == NULL_ID` marks the "no symbol" sentinel, never a real resolution.
pub fn is_null_symbol(id: u32) -> bool {
    id == NULL_ID
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeResolver {
        symbols: Vec<ResolvedSymbol>,
    }

    impl SymbolResolver for FakeResolver {
        fn resolve(&mut self, _module: &Module, address: u64) -> Option<ResolvedSymbol> {
            self.symbols
                .iter()
                .find(|s| {
                    address >= s.address && (s.size == 0 || address < s.address + s.size as u64)
                })
                .cloned()
        }
    }

    #[test]
    fn load_emits_new_string_and_module_load() {
        let mut store = SymbolStore::new();
        let mut interner = StringInterner::new();
        let (_, events) = store.load(&mut interner, 0x1000, 0x1000, b"test.exe");
        assert!(matches!(events[0], SymbolEvent::NewString { .. }));
        assert!(matches!(events[1], SymbolEvent::ModuleLoad { .. }));
    }

    #[test]
    fn get_resolves_and_caches() {
        let mut store = SymbolStore::new();
        let mut interner = StringInterner::new();
        store.load(&mut interner, 0x1000, 0x1000, b"test.exe");

        let mut resolver = FakeResolver {
            symbols: vec![ResolvedSymbol {
                name: b"main".to_vec(),
                file: b"main.c".to_vec(),
                address: 0x1100,
                size: 0x20,
                line: 10,
                line_last: 20,
            }],
        };

        let (symbol, events) = store.get(&mut interner, &mut resolver, 0x1110);
        let symbol = symbol.expect("should resolve");
        assert_eq!(symbol.address, 0x1100);
        assert!(events.iter().any(|e| matches!(e, SymbolEvent::NewSymbol(_))));

        // second lookup within range must hit the AVL cache, not the resolver
        let (symbol2, events2) = store.get(&mut interner, &mut resolver, 0x1115);
        assert_eq!(symbol2.unwrap().id, symbol.id);
        assert!(events2.is_empty());
    }

    #[test]
    fn get_returns_none_outside_any_module() {
        let mut store = SymbolStore::new();
        let mut interner = StringInterner::new();
        let mut resolver = FakeResolver { symbols: vec![] };
        let (symbol, events) = store.get(&mut interner, &mut resolver, 0xdead);
        assert!(symbol.is_none());
        assert!(events.is_empty());
    }

    #[test]
    fn unload_makes_symbols_unreachable() {
        let mut store = SymbolStore::new();
        let mut interner = StringInterner::new();
        let (handle, _) = store.load(&mut interner, 0x1000, 0x1000, b"test.exe");

        let mut resolver = FakeResolver {
            symbols: vec![
                ResolvedSymbol {
                    name: b"a".to_vec(),
                    file: b"a.c".to_vec(),
                    address: 0x1100,
                    size: 0x10,
                    line: 1,
                    line_last: 1,
                },
                ResolvedSymbol {
                    name: b"b".to_vec(),
                    file: b"b.c".to_vec(),
                    address: 0x1200,
                    size: 0x10,
                    line: 2,
                    line_last: 2,
                },
            ],
        };
        store.get(&mut interner, &mut resolver, 0x1100);
        store.get(&mut interner, &mut resolver, 0x1200);

        let events = store.unload(handle);
        assert!(matches!(events[0], SymbolEvent::ModuleUnload { .. }));
        assert!(store.module(handle).is_none());

        let (symbol, _) = store.get(&mut interner, &mut resolver, 0x1100);
        assert!(symbol.is_none());
    }

    #[test]
    fn classify_known_status_lines() {
        assert_eq!(
            classify_symbol_status(
                "SYMSRV: foo.pdb from https://msdl.microsoft.com/download/symbols: downloading"
            ),
            Some(SymbolLoadStatus::Downloading)
        );
        assert_eq!(
            classify_symbol_status("DBGHELP: foo.pdb - private symbols & lines"),
            Some(SymbolLoadStatus::LoadedPrivate)
        );
        assert_eq!(
            classify_symbol_status("DBGHELP: foo.dll - public symbol"),
            Some(SymbolLoadStatus::LoadedPublic)
        );
        assert_eq!(
            classify_symbol_status("DBGHELP: foo.dll - export symbols"),
            Some(SymbolLoadStatus::LoadedExport)
        );
    }

    #[test]
    fn classify_unmatched_lines_as_none() {
        assert_eq!(classify_symbol_status("some unrelated debug spew"), None);
    }

    #[test]
    fn zero_size_resolution_requires_exact_address() {
        let mut store = SymbolStore::new();
        let mut interner = StringInterner::new();
        store.load(&mut interner, 0x1000, 0x1000, b"test.exe");
        let mut resolver = FakeResolver {
            symbols: vec![ResolvedSymbol {
                name: b"thunk".to_vec(),
                file: Vec::new(),
                address: 0x1050,
                size: 0,
                line: 0,
                line_last: 0,
            }],
        };
        let (symbol, _) = store.get(&mut interner, &mut resolver, 0x1050);
        assert!(symbol.is_some());
    }

    #[test]
    fn zero_size_resolution_falls_through_when_query_differs_from_resolved_address() {
        let mut store = SymbolStore::new();
        let mut interner = StringInterner::new();
        store.load(&mut interner, 0x1000, 0x1000, b"test.exe");
        let mut resolver = FakeResolver {
            symbols: vec![ResolvedSymbol {
                name: b"thunk".to_vec(),
                file: Vec::new(),
                address: 0x1050,
                size: 0,
                line: 0,
                line_last: 0,
            }],
        };

        // query address (0x1055) differs from the resolved symbol's own
        // address (0x1050); with no cache hit at 0x1050 yet this must still
        // create and cache the symbol rather than dropping the frame.
        let (symbol, events) = store.get(&mut interner, &mut resolver, 0x1055);
        let symbol = symbol.expect("should resolve despite address mismatch");
        assert_eq!(symbol.address, 0x1050);
        assert!(events.iter().any(|e| matches!(e, SymbolEvent::NewSymbol(_))));

        // a second query that resolves to the same thunk must hit the cache
        // at the resolved address, not the query address, and emit nothing.
        let (symbol2, events2) = store.get(&mut interner, &mut resolver, 0x1060);
        assert_eq!(symbol2.unwrap().id, symbol.id);
        assert!(events2.is_empty());
    }
}
