use std::fs;
use std::path::{Path, PathBuf};

/// What the caller wants to happen when the destination already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Explicit rename: the user has to pick a free name
    FailFast,
    /// Imports and moves: pick a free name automatically
    AutoRename,
    /// Only after explicit user confirmation
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Destination is free; proceed as requested
    NoConflict,
    Overwrite,
    /// Insert this token between the stem and the extension
    AutoRename(String),
    Abort,
}

impl ConflictDecision {
    /// Where the mutation should land, or `None` when it must not happen
    pub fn target(&self, destination: &Path) -> Option<PathBuf> {
        match self {
            ConflictDecision::NoConflict | ConflictDecision::Overwrite => Some(destination.to_path_buf()),
            ConflictDecision::AutoRename(suffix) => {
                let name = destination.file_name()?.to_string_lossy();
                Some(destination.with_file_name(with_suffix(&name, suffix)))
            }
            ConflictDecision::Abort => None,
        }
    }
}

/// How auto-rename tokens are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuffixStyle {
    /// `_<unixTimestamp>`, with `_<n>` appended if that is taken too
    #[default]
    Timestamp,
    /// `_1`, `_2`, ...
    Counter,
}

pub fn parse_suffix_style(s: &str) -> SuffixStyle {
    match s.to_lowercase().as_str() {
        "counter" => SuffixStyle::Counter,
        _ => SuffixStyle::Timestamp,
    }
}

/// Pure decision function; never touches the filesystem beyond an existence check
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    style: SuffixStyle,
    clock: fn() -> i64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(SuffixStyle::default())
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl ConflictResolver {
    pub fn new(style: SuffixStyle) -> Self {
        Self { style, clock: unix_now }
    }

    /// Replace the clock used for timestamp suffixes
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn style(&self) -> SuffixStyle {
        self.style
    }

    pub fn decide(&self, destination: &Path, policy: OnConflict) -> ConflictDecision {
        if !exists(destination) {
            return ConflictDecision::NoConflict;
        }
        match policy {
            OnConflict::FailFast => ConflictDecision::Abort,
            OnConflict::Overwrite => ConflictDecision::Overwrite,
            OnConflict::AutoRename => match self.free_suffix(destination) {
                Some(suffix) => ConflictDecision::AutoRename(suffix),
                None => ConflictDecision::Abort,
            },
        }
    }

    fn free_suffix(&self, destination: &Path) -> Option<String> {
        let name = destination.file_name()?.to_string_lossy().to_string();
        let is_free = |suffix: &str| !exists(&destination.with_file_name(with_suffix(&name, suffix)));

        let base = match self.style {
            SuffixStyle::Timestamp => {
                let token = format!("_{}", (self.clock)());
                if is_free(&token) {
                    return Some(token);
                }
                token
            }
            SuffixStyle::Counter => String::new(),
        };

        let first = if base.is_empty() { 1 } else { 2 };
        // Safety limit to prevent infinite loop
        (first..=10_000)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| is_free(candidate))
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// "y.txt" + "_17" -> "y_17.txt"; dot-files and extensionless names get a plain suffix
pub fn with_suffix(name: &str, suffix: &str) -> String {
    match name.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => {
            let (base, ext) = name.split_at(dot_pos);
            format!("{}{}{}", base, suffix, ext)
        }
        _ => format!("{}{}", name, suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixed_clock() -> i64 {
        1_700_000_000
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(with_suffix("y.txt", "_5"), "y_5.txt");
        assert_eq!(with_suffix("archive.tar.gz", "_5"), "archive.tar_5.gz");
        assert_eq!(with_suffix("Makefile", "_5"), "Makefile_5");
        assert_eq!(with_suffix(".bashrc", "_5"), ".bashrc_5");
    }

    #[test]
    fn test_free_destination_is_no_conflict() {
        let temp = TempDir::new().unwrap();
        let resolver = ConflictResolver::default();
        for policy in [OnConflict::FailFast, OnConflict::AutoRename, OnConflict::Overwrite] {
            assert_eq!(resolver.decide(&temp.path().join("free.txt"), policy), ConflictDecision::NoConflict);
        }
    }

    #[test]
    fn test_policies_on_existing_destination() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("y.txt");
        fs::write(&dest, "y").unwrap();
        let resolver = ConflictResolver::default().with_clock(fixed_clock);

        assert_eq!(resolver.decide(&dest, OnConflict::FailFast), ConflictDecision::Abort);
        assert_eq!(resolver.decide(&dest, OnConflict::Overwrite), ConflictDecision::Overwrite);

        let decision = resolver.decide(&dest, OnConflict::AutoRename);
        assert_eq!(decision, ConflictDecision::AutoRename("_1700000000".to_string()));
        assert_eq!(decision.target(&dest).unwrap(), temp.path().join("y_1700000000.txt"));
    }

    #[test]
    fn test_timestamp_collision_falls_back_to_counter() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("y.txt");
        fs::write(&dest, "y").unwrap();
        fs::write(temp.path().join("y_1700000000.txt"), "taken").unwrap();
        let resolver = ConflictResolver::default().with_clock(fixed_clock);

        let decision = resolver.decide(&dest, OnConflict::AutoRename);
        assert_eq!(decision.target(&dest).unwrap(), temp.path().join("y_1700000000_2.txt"));
    }

    #[test]
    fn test_counter_style() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("doc.md");
        fs::write(&dest, "").unwrap();
        fs::write(temp.path().join("doc_1.md"), "").unwrap();
        let resolver = ConflictResolver::new(SuffixStyle::Counter);
        let decision = resolver.decide(&dest, OnConflict::AutoRename);
        assert_eq!(decision, ConflictDecision::AutoRename("_2".to_string()));
    }

    #[test]
    fn test_decide_is_side_effect_free() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("a.txt");
        fs::write(&dest, "a").unwrap();
        let resolver = ConflictResolver::default().with_clock(fixed_clock);
        let first = resolver.decide(&dest, OnConflict::AutoRename);
        let second = resolver.decide(&dest, OnConflict::AutoRename);
        assert_eq!(first, second);
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_abort_has_no_target() {
        assert!(ConflictDecision::Abort.target(Path::new("/x/y")).is_none());
    }
}
