use std::path::PathBuf;

use crate::entry::Entry;
use crate::syms::{MemoryMap, ParsedModule};

/// Process details the logger writes before the first record.
#[derive(Debug, Default)]
pub struct SessionInfo {
    pub pid: Option<u32>,
    pub exe: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub maps: MemoryMap,
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Outside,
    Record,
    Maps,
}

/// Turns log lines into entries.
///
/// A record starts at a `+ ` header and collects backtrace frames until `-`, the next
/// header, a control line or the end of input.
#[derive(Debug)]
pub struct LogParser {
    pending: Option<Entry>,
    mode: Mode,
    session: SessionInfo,
}

impl Default for LogParser {
    fn default() -> Self {
        Self {
            pending: None,
            mode: Mode::Outside,
            session: SessionInfo::default(),
        }
    }
}

impl LogParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Feeds one line, returning a record if this line completed one.
    pub fn push_line(&mut self, line: &str) -> Option<Entry> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(header) = line.strip_prefix("+ ") {
            let done = self.pending.take();
            self.pending = Some(Entry::parse_header(header));
            self.mode = Mode::Record;
            return done;
        }

        if line == "-" || line.starts_with("+=") || line.starts_with('|') {
            self.mode = Mode::Outside;
            return self.pending.take();
        }

        if let Some(meta) = line.strip_prefix('#') {
            let done = self.pending.take();
            self.session_line(meta.trim());
            return done;
        }

        if line.trim().is_empty() {
            return None;
        }

        match self.mode {
            Mode::Record => {
                if let Some(entry) = self.pending.as_mut() {
                    entry.backtrace.push(line.trim().to_string());
                }
            }
            Mode::Maps => {
                if let Some(module) = ParsedModule::parse(line) {
                    self.session.maps.add_module(module);
                }
            }
            Mode::Outside => tracing::trace!("ignoring line outside of a record: {line}"),
        }
        None
    }

    /// Flushes the record still open at end of input.
    pub fn finish(&mut self) -> Option<Entry> {
        self.mode = Mode::Outside;
        self.pending.take()
    }

    fn session_line(&mut self, meta: &str) {
        let (tag, value) = meta.split_once(' ').unwrap_or((meta, ""));
        let value = value.trim();
        self.mode = Mode::Outside;
        match tag {
            "PID" => self.session.pid = value.parse().ok(),
            "EXE" => self.session.exe = Some(PathBuf::from(value)),
            "CWD" => self.session.cwd = Some(PathBuf::from(value)),
            "MAPS" => self.mode = Mode::Maps,
            _ => tracing::debug!("unrecognized session line: #{meta}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;

    fn parse_all(log: &str) -> (Vec<Entry>, LogParser) {
        let mut parser = LogParser::new();
        let mut entries: Vec<Entry> = log.lines().filter_map(|l| parser.push_line(l)).collect();
        entries.extend(parser.finish());
        (entries, parser)
    }

    #[test]
    fn single_line_records() {
        let (entries, _) = parse_all(
            "INIT\n\
             + malloc 32 0x5581a0 10 10\n\
             + free 32 0x5581a0 10 10\n\
             + free(NULL) 0 (nil) 10 10\n",
        );
        let kinds: Vec<EntryKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [EntryKind::Allocation, EntryKind::Free, EntryKind::Marker]
        );
        assert!(entries.iter().all(|e| e.backtrace.is_empty()));
    }

    #[test]
    fn backtrace_frames_belong_to_their_record() {
        let (entries, _) = parse_all(
            "+ malloc 16 0x1000\n\
             ./app(make_node+0x1a)[0x401a2a]\n\
             ./app(main+0x42)[0x401b00]\n\
             -\n\
             stray line\n\
             + free 16 0x1000\n\
             -\n",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].backtrace,
            ["./app(make_node+0x1a)[0x401a2a]", "./app(main+0x42)[0x401b00]"]
        );
        assert!(entries[1].backtrace.is_empty());
    }

    #[test]
    fn session_header_and_maps() {
        let (entries, parser) = parse_all(
            "# PID 4242\n\
             # EXE /usr/bin/app\n\
             # CWD /home/dev\n\
             # MAPS\n\
             00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/app\n\
             00651000-00652000 rw-p 00051000 08:02 173521 /usr/bin/app\n\
             + INIT 0 0x6010a0 4242 4242\n\
             + malloc 8 0x2000 4242 4242\n",
        );
        let session = parser.session();
        assert_eq!(session.pid, Some(4242));
        assert_eq!(session.exe, Some(PathBuf::from("/usr/bin/app")));
        assert_eq!(session.cwd, Some(PathBuf::from("/home/dev")));
        assert_eq!(session.maps.len(), 1);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Marker);
    }

    #[test]
    fn statistics_banner_closes_record() {
        let (entries, _) = parse_all(
            "+ malloc 8 0x2000\n\
             +=====================\n\
             | allocs  : 1         , deallocs: 0         , inuse: 8\n\
             +=====================\n\
             + FINI\n\
             -\n",
        );
        assert_eq!(entries.len(), 2);
        assert!(entries[0].backtrace.is_empty());
        assert_eq!(entries[1].method, "FINI");
        assert!(!entries[1].filled);
    }

    #[test]
    fn malformed_header_is_unfilled() {
        let (entries, _) = parse_all("+ malloc lots 0x1\n");
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].filled);
        assert!(!entries[0].known());
    }
}
