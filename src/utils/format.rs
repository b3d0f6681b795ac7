// === CLI output formatting ===
use chrono::{DateTime, Local};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::fs::{Entry, EntryKind};

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    }
}

/// Format file permissions in short format (rwxrwxrwx)
#[cfg(unix)]
pub fn format_permissions_short(mode: u32) -> String {
    const PERMS: [&str; 8] = ["---", "--x", "-w-", "-wx", "r--", "r-x", "rw-", "rwx"];

    let owner = PERMS[((mode >> 6) & 7) as usize];
    let group = PERMS[((mode >> 3) & 7) as usize];
    let other = PERMS[(mode & 7) as usize];

    format!("{}{}{}", owner, group, other)
}

#[cfg(not(unix))]
pub fn format_permissions_short(_mode: u32) -> String {
    String::new()
}

/// Listing timestamp, local time to the minute
pub fn format_timestamp(time: &DateTime<Local>) -> String {
    time.format("%Y-%m-%d %H:%M").to_string()
}

// === CJK-aware display width utilities ===

/// Cut `s` to at most `max_width` terminal columns, padding with spaces when a
/// wide character straddles the boundary so the result is exactly `max_width` wide.
pub fn truncate_to_display_width(s: &str, max_width: usize) -> String {
    let mut width = 0;
    let mut result = String::new();
    for c in s.chars() {
        let cw = c.width().unwrap_or(1);
        if width + cw > max_width {
            break;
        }
        result.push(c);
        width += cw;
    }
    while width < max_width {
        result.push(' ');
        width += 1;
    }
    result
}

/// Right-pad `s` to `target_width` columns; longer strings are cut.
pub fn pad_to_display_width(s: &str, target_width: usize) -> String {
    let current = s.width();
    if current >= target_width {
        truncate_to_display_width(s, target_width)
    } else {
        format!("{}{}", s, " ".repeat(target_width - current))
    }
}

/// Cut to `max_width` columns with a trailing "..." when it does not fit.
pub fn truncate_with_ellipsis(s: &str, max_width: usize) -> String {
    if s.width() <= max_width {
        return s.to_string();
    }
    if max_width <= 3 {
        return ".".repeat(max_width);
    }
    let truncated = truncate_to_display_width(s, max_width.saturating_sub(3));
    let trimmed = truncated.trim_end();
    format!("{}...", trimmed)
}

/// One `ls` row: permissions, size (or `<DIR>`), mtime, name
pub fn format_entry_line(entry: &Entry, name_width: usize) -> String {
    let size = match entry.kind {
        EntryKind::Directory => "<DIR>".to_string(),
        EntryKind::File => format_size(entry.size),
    };
    let name = if entry.is_directory() {
        format!("{}/", entry.name)
    } else {
        entry.name.clone()
    };
    format!(
        "{}  {:>10}  {}  {}",
        pad_to_display_width(&entry.permissions, 9),
        size,
        format_timestamp(&entry.modified_at),
        truncate_with_ellipsis(&name, name_width)
    )
}
