/// Rebuilds flat profiles, call graphs, and per-file sample tables from a
/// decoded stack stream. A pure function over `storage`'s parsed records:
/// no I/O, no platform calls, so it is exercised directly by its own
/// encode/decode round trips.
use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::core::types::{CallStackEntry, PointerSize, NULL_ID};
use crate::storage::{self, DecodedProfile, StorageError};

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A symbol's profile-relevant fields, resolved out of the blob's string
/// and symbol tables. `module` isn't needed by any aggregation below, so
/// it's dropped here even though the wire/storage symbol record carries it.
#[derive(Debug, Clone, Default)]
pub struct SymbolInfo {
    pub name: String,
    pub file: String,
    pub line: u32,
    pub line_last: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlatCounts {
    pub self_count: u32,
    pub total_count: u32,
}

#[derive(Debug, Clone)]
pub struct FlatThread {
    pub name: String,
    pub symbols: HashMap<u32, FlatCounts>,
}

/// One call-graph node, keyed by the caller into it via `(symbol,
/// parent_line)` so two call sites into the same callee stay distinct.
#[derive(Debug, Clone, Default)]
pub struct CallGraphNode {
    pub self_count: u32,
    pub total_count: u32,
    pub children: HashMap<(u32, u32), CallGraphNode>,
}

#[derive(Debug, Clone)]
pub struct CallGraphThread {
    pub name: String,
    pub root: CallGraphNode,
}

#[derive(Debug, Clone, Default)]
pub struct FileSamples {
    /// `line -> symbol` for every known symbol defined at that line.
    pub def_line_to_symbol: BTreeMap<u32, u32>,
    /// `caller_line -> callee_symbol` for bottom-up consecutive pairs.
    pub line_to_symbol: HashMap<u32, u32>,
    pub per_line: HashMap<u32, u32>,
    pub per_address: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub flat_threads: Vec<FlatThread>,
    pub call_graph_threads: Vec<CallGraphThread>,
    pub file_profile: HashMap<String, FileSamples>,
    pub total_samples: u32,
}

/// Decode `bytes` (the inner blob, already gzip-inflated by `storage`) and
/// rebuild every view over it. `show_empty_file_frames` controls whether
/// frames whose symbol has no known source file are kept or trimmed.
pub fn create_profile(
    ptr_size: PointerSize,
    show_empty_file_frames: bool,
    bytes: &[u8],
) -> Result<Profile, AggregatorError> {
    let decoded = storage::decode_blob(bytes, ptr_size)?;
    let strings = build_string_table(&decoded);
    let symbols = build_symbol_table(&decoded, &strings);

    let mut profile = Profile::default();

    for (index, raw_entries) in decoded.threads.iter().enumerate() {
        let name = thread_name(index);
        let stacks = split_stacks(raw_entries, show_empty_file_frames, &symbols);
        profile.total_samples += stacks.len() as u32;

        if let Some(flat) = flat_profile(&stacks) {
            profile.flat_threads.push(FlatThread {
                name: name.clone(),
                symbols: flat,
            });
        }

        if let Some(root) = call_graph(&stacks) {
            profile.call_graph_threads.push(CallGraphThread {
                name: name.clone(),
                root,
            });
        }

        accumulate_file_samples(&stacks, &symbols, &mut profile.file_profile);
    }

    for (id, info) in &symbols {
        if !info.file.is_empty() {
            profile
                .file_profile
                .entry(info.file.clone())
                .or_default()
                .def_line_to_symbol
                .insert(info.line, *id);
        }
    }

    Ok(profile)
}

fn build_string_table(decoded: &DecodedProfile) -> HashMap<u32, String> {
    let mut table = HashMap::new();
    table.insert(NULL_ID, String::new());
    for (id, bytes) in &decoded.strings {
        table.insert(*id, String::from_utf8_lossy(bytes).into_owned());
    }
    table
}

fn build_symbol_table(decoded: &DecodedProfile, strings: &HashMap<u32, String>) -> HashMap<u32, SymbolInfo> {
    let mut table = HashMap::new();
    for record in &decoded.symbols {
        let file = strings.get(&record.file).cloned().unwrap_or_default();
        table.insert(
            record.id,
            SymbolInfo {
                name: String::from_utf8_lossy(&record.name).into_owned(),
                file,
                line: record.line,
                line_last: record.line_last,
            },
        );
    }
    table
}

fn thread_name(index: usize) -> String {
    if index == 0 {
        "Main Thread".to_string()
    } else {
        format!("Thread #{}", index)
    }
}

fn entry_file_is_empty(symbols: &HashMap<u32, SymbolInfo>, entry: &CallStackEntry) -> bool {
    symbols.get(&entry.symbol).map(|s| s.file.is_empty()).unwrap_or(true)
}

/// Split one thread's raw, sentinel-delimited entry stream into completed
/// stacks, applying the empty-file-frame filtering and once-per-stack
/// outermost-frame injection described for the aggregator.
fn split_stacks(
    entries: &[CallStackEntry],
    show_empty_file_frames: bool,
    symbols: &HashMap<u32, SymbolInfo>,
) -> Vec<Vec<CallStackEntry>> {
    let mut stacks = Vec::new();
    let mut current: Vec<CallStackEntry> = Vec::new();
    let mut starting_with_empty = true;
    let mut last_empty_frame: Option<CallStackEntry> = None;

    let finish_stack = |current: &mut Vec<CallStackEntry>, stacks: &mut Vec<Vec<CallStackEntry>>| {
        if !show_empty_file_frames {
            while current
                .last()
                .map(|e| entry_file_is_empty(symbols, e))
                .unwrap_or(false)
            {
                current.pop();
            }
        }
        if !current.is_empty() {
            stacks.push(std::mem::take(current));
        } else {
            current.clear();
        }
    };

    for &entry in entries {
        if entry.is_sentinel() {
            finish_stack(&mut current, &mut stacks);
            starting_with_empty = true;
            last_empty_frame = None;
            continue;
        }

        if starting_with_empty {
            if entry_file_is_empty(symbols, &entry) {
                if show_empty_file_frames {
                    current.push(entry);
                } else {
                    last_empty_frame = Some(entry);
                }
            } else {
                starting_with_empty = false;
                if !show_empty_file_frames {
                    if let Some(prev) = last_empty_frame.take() {
                        current.push(prev);
                    }
                }
                current.push(entry);
            }
        } else {
            current.push(entry);
        }
    }
    // A well-formed stream always ends on a sentinel; finish defensively in
    // case a thread's section was truncated.
    finish_stack(&mut current, &mut stacks);

    stacks
}

fn flat_profile(stacks: &[Vec<CallStackEntry>]) -> Option<HashMap<u32, FlatCounts>> {
    if stacks.is_empty() {
        return None;
    }
    let mut flat: HashMap<u32, FlatCounts> = HashMap::new();
    for stack in stacks {
        let mut iter = stack.iter();
        let Some(first) = iter.next() else { continue };
        let counts = flat.entry(first.symbol).or_default();
        counts.self_count += 1;
        counts.total_count += 1;

        let mut prev = first.symbol;
        for entry in iter {
            if entry.symbol != prev {
                flat.entry(entry.symbol).or_default().total_count += 1;
                prev = entry.symbol;
            }
        }
    }
    Some(flat)
}

/// Descend each stack from the outermost (bottom) frame to the innermost,
/// keying each level by `(symbol, parent_line)`.
fn call_graph(stacks: &[Vec<CallStackEntry>]) -> Option<CallGraphNode> {
    if stacks.is_empty() {
        return None;
    }
    let mut root = CallGraphNode::default();

    for stack in stacks {
        let mut node = &mut root;
        let mut parent_line = 0u32;
        for entry in stack.iter().rev() {
            node = node.children.entry((entry.symbol, parent_line)).or_default();
            node.total_count += 1;
            parent_line = entry.line;
        }
        node.self_count += 1;
    }

    Some(root)
}

fn accumulate_file_samples(
    stacks: &[Vec<CallStackEntry>],
    symbols: &HashMap<u32, SymbolInfo>,
    file_profile: &mut HashMap<String, FileSamples>,
) {
    for stack in stacks {
        for entry in stack {
            if let Some(info) = symbols.get(&entry.symbol) {
                if !info.file.is_empty() {
                    let samples = file_profile.entry(info.file.clone()).or_default();
                    if entry.line != 0 {
                        *samples.per_line.entry(entry.line).or_default() += 1;
                    }
                    *samples.per_address.entry(entry.offset).or_default() += 1;
                }
            }
        }

        let mut parent_line = 0u32;
        let mut parent_file: Option<String> = None;
        for entry in stack.iter().rev() {
            if let Some(file) = &parent_file {
                if !file.is_empty() && parent_line != 0 {
                    file_profile
                        .entry(file.clone())
                        .or_default()
                        .line_to_symbol
                        .insert(parent_line, entry.symbol);
                }
            }
            parent_line = entry.line;
            parent_file = symbols.get(&entry.symbol).map(|s| s.file.clone());
        }
    }
}
