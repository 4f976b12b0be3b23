use std::borrow::{Borrow, Cow};

use ahash::AHashMap;
use symbolic::{
    common::{Language, Name, NameMangling},
    demangle::{Demangle, DemangleOptions},
};

use crate::entry::Entry;

/// One executable line of a `/proc/<pid>/maps` dump.
#[derive(Debug)]
pub struct ParsedModule {
    start_addr: u64,
    end_addr: u64,
    file_offset: u64,
    name: String,
}

impl ParsedModule {
    pub fn parse(line: &str) -> Option<Self> {
        let mut components = line.split_whitespace();
        let (start_addr, end_addr) = components.next().and_then(|c| c.split_once('-'))?;
        let (start_addr, end_addr) = (
            u64::from_str_radix(start_addr, 16).ok()?,
            u64::from_str_radix(end_addr, 16).ok()?,
        );

        if !components.next().map(|c| c.contains('x')).unwrap_or(false) {
            // not an executable page ignore it
            return None;
        }

        let file_offset = components
            .next()
            .and_then(|c| u64::from_str_radix(c, 16).ok())?;
        // Skip dev version
        components.next()?;
        // Skip inode
        components.next()?;
        let name = components.next()?.to_string();

        if !is_mapping_file_backed(&name) {
            return None;
        }

        Some(ParsedModule {
            start_addr,
            end_addr,
            file_offset,
            name,
        })
    }
}

fn is_mapping_file_backed(name: &str) -> bool {
    const ANONYMOUS: [&str; 7] = [
        "//anon",
        "/dev/zero",
        "/anon_hugepage",
        "[stack",
        "/SYSV",
        "[heap]",
        "[vsyscall]",
    ];
    !ANONYMOUS.iter().any(|prefix| name.starts_with(prefix))
}

#[derive(Debug)]
struct Range {
    start: u64,
    end: u64,
    offset: u64,
}

#[derive(Debug)]
struct Module {
    name: String,
    ranges: Vec<Range>,
}

impl Module {
    /// File offset of `addr` if it falls into one of this module's ranges.
    fn contains(&self, addr: u64) -> Option<u64> {
        self.ranges
            .iter()
            .find(|range| addr >= range.start && addr < range.end)
            .map(|range| addr - range.start + range.offset)
    }
}

/// Executable mappings recorded by the logger at start-up.
#[derive(Debug, Default)]
pub struct MemoryMap {
    modules: Vec<Module>,
}

impl MemoryMap {
    pub fn add_module(&mut self, parsed_module: ParsedModule) {
        tracing::debug!("Adding: {}", parsed_module.name);

        let range = Range {
            start: parsed_module.start_addr,
            end: parsed_module.end_addr,
            offset: parsed_module.file_offset,
        };
        if let Some(module) = self
            .modules
            .iter_mut()
            .find(|module| module.name == parsed_module.name)
        {
            module.ranges.push(range);
        } else {
            self.modules.push(Module {
                name: parsed_module.name,
                ranges: vec![range],
            });
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Finds the module mapping `addr` and the file offset within it.
    pub fn find_module_offset(&self, addr: u64) -> Option<(&str, u64)> {
        self.modules
            .iter()
            .find_map(|module| module.contains(addr).map(|offset| (module.name.as_str(), offset)))
    }
}

fn print_name<'a, N: Borrow<Name<'a>>>(name: Option<&'a N>, demangle: bool) -> Cow<'a, str> {
    match name.map(Borrow::borrow) {
        None => Cow::Owned(String::from("??")),
        Some(name) if name.as_str().is_empty() => Cow::Owned(String::from("??")),
        Some(name) if demangle => name.try_demangle(DemangleOptions::name_only()),
        Some(name) => Cow::Borrowed(name.as_str()),
    }
}

/// A `backtrace_symbols` frame: `module(symbol+0xoff)[0xaddr]`.
struct Frame<'a> {
    module: &'a str,
    symbol: &'a str,
    symbol_offset: &'a str,
    addr: u64,
}

impl<'a> Frame<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let (head, addr) = line.strip_suffix(']')?.rsplit_once('[')?;
        let addr = u64::from_str_radix(addr.trim_start_matches("0x"), 16).ok()?;

        let (module, symbol, symbol_offset) = match head.split_once('(') {
            Some((module, location)) => {
                let location = location.strip_suffix(')')?;
                let (symbol, offset) = location.rsplit_once('+').unwrap_or((location, ""));
                (module, symbol, offset)
            }
            None => (head, "", ""),
        };

        Some(Frame {
            module,
            symbol,
            symbol_offset,
            addr,
        })
    }
}

/// Rewrites backtrace frames into something readable.
#[derive(Debug, Default)]
pub struct Symbolizer {
    demangle: bool,
    resolve_maps: bool,
    cache: AHashMap<String, String>,
}

impl Symbolizer {
    pub fn new(demangle: bool, resolve_maps: bool) -> Self {
        Self {
            demangle,
            resolve_maps,
            cache: AHashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.demangle || self.resolve_maps
    }

    pub fn symbolize(&mut self, mut entry: Entry, maps: &MemoryMap) -> Entry {
        if !self.is_enabled() {
            return entry;
        }
        for frame in entry.backtrace.iter_mut() {
            if let Some(cached) = self.cache.get(frame.as_str()) {
                *frame = cached.clone();
                continue;
            }
            if let Some(resolved) = self.resolve_frame(frame.as_str(), maps) {
                self.cache.insert(frame.clone(), resolved.clone());
                *frame = resolved;
            }
        }
        entry
    }

    fn resolve_frame(&self, line: &str, maps: &MemoryMap) -> Option<String> {
        let frame = Frame::parse(line)?;

        if !frame.symbol.is_empty() {
            if !self.demangle {
                return None;
            }
            let name = Name::new(frame.symbol, NameMangling::Unknown, Language::Unknown);
            let name = print_name(Some(&name), true);
            let offset = if frame.symbol_offset.is_empty() {
                String::new()
            } else {
                format!("+{}", frame.symbol_offset)
            };
            return Some(format!(
                "{}({name}{offset})[{:#x}]",
                frame.module, frame.addr
            ));
        }

        if !self.resolve_maps {
            return None;
        }
        match maps.find_module_offset(frame.addr) {
            Some((module, offset)) => Some(format!("{module}+{offset:#x}")),
            None => {
                tracing::trace!("Failed to find module for {:x}", frame.addr);
                None
            }
        }
    }
}
