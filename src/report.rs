use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::entry::Entry;
use crate::matcher::{MatcherState, Outstanding};

/// Outstanding allocations that share an allocator key.
#[derive(Debug)]
pub struct AllocatorGroup<'a> {
    pub key: String,
    pub total_bytes: i128,
    /// In arrival order, so the first one is the oldest live allocation.
    pub entries: Vec<&'a Entry>,
}

/// Formats an integer with `,` between thousands, independent of locale.
pub fn format_grouped<N: Into<i128>>(n: N) -> String {
    let n = n.into();
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(digit);
    }
    out
}

/// Groups outstanding allocations by allocator key, highest key first.
pub fn group_by_allocator(state: &MatcherState) -> Vec<AllocatorGroup<'_>> {
    let mut live: Vec<&Outstanding> = state.outstanding().collect();
    live.sort_unstable_by_key(|o| o.seq);

    let mut by_key: BTreeMap<String, Vec<&Entry>> = BTreeMap::new();
    for outstanding in live {
        by_key
            .entry(outstanding.entry.allocator_key())
            .or_default()
            .push(&outstanding.entry);
    }

    by_key
        .into_iter()
        .rev()
        .map(|(key, entries)| AllocatorGroup {
            total_bytes: entries.iter().map(|e| i128::from(e.size)).sum(),
            key,
            entries,
        })
        .collect()
}

/// Writes the leak summary for `state` to `out`.
///
/// Byte amounts and the timespan are grouped with [`format_grouped`]; counts are plain.
pub fn render<W: Write>(state: &MatcherState, out: &mut W) -> io::Result<()> {
    let elapsed = state
        .session_start()
        .map(|start| start.elapsed().as_millis())
        .unwrap_or(0);
    let elapsed = i128::try_from(elapsed).unwrap_or(i128::MAX);

    writeln!(
        out,
        "Processing timespan in millis (since first log entry processed): {}",
        format_grouped(elapsed)
    )?;
    writeln!(
        out,
        "Allocation balance (bytes, negative means leak): {}",
        format_grouped(state.balance())
    )?;
    writeln!(
        out,
        "Number of objects allocated in log session but not freed yet: {}",
        state.outstanding_count()
    )?;
    writeln!(
        out,
        "Size of objects freed in log session but not allocated in log session (bytes): {}",
        format_grouped(state.prior_freed_bytes())
    )?;
    writeln!(
        out,
        "Number of objects freed in session but not allocated in session: {} without multiple frees: {}",
        state.prior_freed_count(),
        state.prior_free_addresses()
    )?;
    writeln!(
        out,
        "Matching alloc/free pairs through the logging session (n, bytes): {} {}",
        state.matched_pair_count(),
        format_grouped(state.matched_pair_bytes())
    )?;

    for group in group_by_allocator(state) {
        writeln!(out)?;
        writeln!(out, "allocator: {}", group.key)?;
        writeln!(
            out,
            "\tN:{} BYTES: {}",
            group.entries.len(),
            format_grouped(group.total_bytes)
        )?;
        if let Some(first) = group.entries.first() {
            writeln!(out, "{first}")?;
        }
    }
    Ok(())
}
