//! Human-facing formatting of listings.

use fastdbfs_storage::FileInfo;
use time::OffsetDateTime;
use time::macros::format_description;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// `1.5K`, `3.2M`, `1.0G`; small sizes stay exact.
pub fn human_size(size: u64) -> String {
    let scaled = |unit: u64, suffix: &str| format!("{:.1}{suffix}", size as f64 / unit as f64);
    if size >= GIB {
        scaled(GIB, "G")
    } else if size > MIB {
        scaled(MIB, "M")
    } else if size > KIB {
        scaled(KIB, "K")
    } else {
        size.to_string()
    }
}

/// `YYYY-MM-DD HH:MM:SS`, in UTC.
pub fn format_time(at: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    at.format(format).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// One row per entry: `kind size modified name`, with the size column
/// right-aligned to the widest value.
pub fn long_listing<'a>(entries: impl IntoIterator<Item = (&'a str, &'a FileInfo)>, human: bool) -> Vec<String> {
    let rows: Vec<_> = entries
        .into_iter()
        .map(|(name, info)| {
            let size = match (info.is_dir, human) {
                (true, _) => "-".to_string(),
                (false, true) => human_size(info.size),
                (false, false) => info.size.to_string(),
            };
            (info.kind(), size, format_time(info.modified), name)
        })
        .collect();
    let width = rows.iter().map(|(_, size, _, _)| size.len()).max().unwrap_or(0);
    rows.into_iter()
        .map(|(kind, size, modified, name)| format!("{kind:<4} {size:>width$} {modified} {name}"))
        .collect()
}
