use std::fmt;

/// What a log record means to the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Allocation,
    Free,
    /// Recognized record that neither allocates nor frees, e.g. `INIT` or `free(NULL)`.
    Marker,
    Unknown,
}

impl EntryKind {
    /// Classifies a trace caption written by the malloc logger.
    pub fn from_method(method: &str) -> Self {
        match method {
            "malloc" | "calloc" | "realloc-malloc" | "realloc-realloc" | "realloc-inplace"
            | "memalign" | "posix_memalign" | "valloc" | "pvalloc" | "aligned_alloc" => {
                EntryKind::Allocation
            }
            "free" | "realloc-free" => EntryKind::Free,
            "INIT" | "FINI" | "free(NULL)" => EntryKind::Marker,
            _ => EntryKind::Unknown,
        }
    }
}

/// One record of the allocation log: a `+` header plus the backtrace frames logged with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub method: String,
    pub address: String,
    /// Logged as `%zu`, so the full `u64` range is valid.
    pub size: u64,
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub kind: EntryKind,
    /// Every header field was present and parseable. Independent of `kind`.
    pub filled: bool,
    pub backtrace: Vec<String>,
    header: String,
}

impl Entry {
    /// Parses the text after the leading `+ ` of a record header.
    pub fn parse_header(header: &str) -> Self {
        let mut fields = header.split_whitespace();
        let method = fields.next().unwrap_or_default().to_string();
        let size = fields.next().and_then(|s| s.parse::<u64>().ok());
        let address = fields.next().map(str::to_string);
        let pid = fields.next().and_then(|p| p.parse().ok());
        let tid = fields.next().and_then(|t| t.parse().ok());

        let filled = !method.is_empty() && size.is_some() && address.is_some();
        let kind = if filled {
            EntryKind::from_method(&method)
        } else {
            EntryKind::Unknown
        };

        Entry {
            method,
            address: address.unwrap_or_default(),
            size: size.unwrap_or(0),
            pid,
            tid,
            kind,
            filled,
            backtrace: Vec::new(),
            header: format!("+ {}", header.trim_end()),
        }
    }

    pub fn known(&self) -> bool {
        self.kind != EntryKind::Unknown
    }

    pub fn is_allocation(&self) -> bool {
        self.kind == EntryKind::Allocation
    }

    pub fn is_free(&self) -> bool {
        self.kind == EntryKind::Free
    }

    /// Key used to attribute outstanding allocations to a call site.
    pub fn allocator_key(&self) -> String {
        if self.backtrace.is_empty() {
            self.method.clone()
        } else {
            self.backtrace.join("\n")
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header)?;
        for frame in &self.backtrace {
            write!(f, "\n\t{frame}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_entry(method: &str, address: &str, size: u64, key: &str) -> Entry {
    let mut entry = Entry::parse_header(&format!("{method} {size} {address} 100 100"));
    entry.backtrace.push(key.to_string());
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_header() {
        let entry = Entry::parse_header("malloc 32 0x55d1c0 4242 4243");
        assert_eq!(entry.kind, EntryKind::Allocation);
        assert!(entry.filled);
        assert!(entry.known());
        assert_eq!(entry.size, 32);
        assert_eq!(entry.address, "0x55d1c0");
        assert_eq!(entry.pid, Some(4242));
        assert_eq!(entry.tid, Some(4243));
    }

    #[test]
    fn size_covers_full_unsigned_range() {
        let entry = Entry::parse_header("malloc 18446744073709551615 0x2 1 1");
        assert!(entry.filled);
        assert_eq!(entry.kind, EntryKind::Allocation);
        assert_eq!(entry.size, u64::MAX);
    }

    #[test]
    fn unrecognized_method_is_filled_but_unknown() {
        let entry = Entry::parse_header("mmap 4096 0x7f0000");
        assert!(entry.filled);
        assert!(!entry.known());
    }

    #[test]
    fn truncated_header_is_not_filled() {
        let entry = Entry::parse_header("malloc twelve");
        assert!(!entry.filled);
        assert_eq!(entry.kind, EntryKind::Unknown);
        assert_eq!(entry.size, 0);
    }

    #[test]
    fn markers_are_known() {
        assert_eq!(EntryKind::from_method("free(NULL)"), EntryKind::Marker);
        assert_eq!(EntryKind::from_method("realloc-free"), EntryKind::Free);
        assert_eq!(EntryKind::from_method("realloc-inplace"), EntryKind::Allocation);
    }

    #[test]
    fn allocator_key_falls_back_to_method() {
        let mut entry = Entry::parse_header("calloc 64 0x10");
        assert_eq!(entry.allocator_key(), "calloc");
        entry.backtrace.push("./app(main+0x10)[0x401000]".to_string());
        entry.backtrace.push("/lib/libc.so.6(+0x2d1ca)[0x7f00]".to_string());
        assert_eq!(
            entry.allocator_key(),
            "./app(main+0x10)[0x401000]\n/lib/libc.so.6(+0x2d1ca)[0x7f00]"
        );
        assert_eq!(
            entry.to_string(),
            "+ calloc 64 0x10\n\t./app(main+0x10)[0x401000]\n\t/lib/libc.so.6(+0x2d1ca)[0x7f00]"
        );
    }
}
