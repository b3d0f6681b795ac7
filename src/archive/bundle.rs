use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::archive::plist::{self, PlistValue};
use crate::archive::reader::{ArchiveReader, ExtractSummary, ZipArchive};
use crate::error::ArchiveError;
use crate::task::TaskContext;

/// Identity of an application bundle packaged as `Payload/<Name>.app/`
#[derive(Debug, Clone, Serialize)]
pub struct BundleInfo {
    pub display_name: Option<String>,
    pub bundle_identifier: Option<String>,
    pub version: Option<String>,
    pub short_version: Option<String>,
    pub executable: Option<String>,
    pub minimum_os_version: Option<String>,
    /// Relative to the archive root, e.g. `Payload/Demo.app`
    pub app_dir: PathBuf,
    pub properties: PlistValue,
}

impl BundleInfo {
    fn from_plist(app_dir: PathBuf, properties: PlistValue) -> Self {
        let text = |key: &str| properties.get_str(key).map(str::to_string);
        let display_name = text("CFBundleDisplayName").or_else(|| text("CFBundleName"));
        Self {
            display_name,
            bundle_identifier: text("CFBundleIdentifier"),
            version: text("CFBundleVersion"),
            short_version: text("CFBundleShortVersionString"),
            executable: text("CFBundleExecutable"),
            minimum_os_version: text("MinimumOSVersion"),
            app_dir,
            properties,
        }
    }

    /// Read `Info.plist` straight from the archive, nothing extracted
    pub fn from_archive(archive: &Path) -> Result<Self, ArchiveError> {
        let mut zip = ZipArchive::open(archive)?;
        let index = zip
            .entries()
            .iter()
            .position(|e| is_bundle_info_plist(&e.path))
            .ok_or_else(|| missing_info(archive))?;
        let app_dir = zip.entries()[index].relative_path().parent().map(Path::to_path_buf).unwrap_or_default();
        let bytes = zip.read_entry(index)?;
        Ok(Self::from_plist(app_dir, plist::parse(&bytes)?))
    }
}

/// `Payload/<Name>.app/Info.plist`, exactly three components
fn is_bundle_info_plist(path: &str) -> bool {
    let parts: Vec<&str> = path.split('/').collect();
    matches!(parts.as_slice(), ["Payload", app, "Info.plist"] if app.ends_with(".app") && app.len() > 4)
}

fn missing_info(archive: &Path) -> ArchiveError {
    ArchiveError::Corrupt(format!("{}: no Payload/<name>.app/Info.plist", archive.display()))
}

/// First `*.app` directory under `<root>/Payload`, by name
fn find_app_dir(root: &Path) -> Option<PathBuf> {
    let mut apps: Vec<PathBuf> = fs::read_dir(root.join("Payload"))
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.extension().is_some_and(|ext| ext == "app"))
        .collect();
    apps.sort();
    apps.into_iter().next()
}

impl ArchiveReader {
    /// Extract an application archive and describe the bundle inside it
    pub fn extract_bundle(
        &self,
        archive: &Path,
        destination: &Path,
        ctx: &TaskContext,
    ) -> Result<(ExtractSummary, BundleInfo), ArchiveError> {
        let summary = self.extract(archive, destination, ctx)?;

        let app_dir = find_app_dir(destination).ok_or_else(|| missing_info(archive))?;
        let plist_path = app_dir.join("Info.plist");
        let bytes = fs::read(&plist_path).map_err(|_| missing_info(archive))?;
        let relative = app_dir.strip_prefix(destination).map(Path::to_path_buf).unwrap_or_else(|_| app_dir.clone());
        let info = BundleInfo::from_plist(relative, plist::parse(&bytes)?);

        info!(
            archive = %archive.display(),
            bundle = info.bundle_identifier.as_deref().unwrap_or("?"),
            "extracted application bundle"
        );
        Ok((summary, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::writer::ZipWriter;
    use tempfile::TempDir;

    const PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>CFBundleName</key><string>Demo</string>
    <key>CFBundleIdentifier</key><string>com.example.demo</string>
    <key>CFBundleShortVersionString</key><string>1.2</string>
    <key>CFBundleVersion</key><string>42</string>
    <key>CFBundleExecutable</key><string>Demo</string>
    <key>MinimumOSVersion</key><string>15.0</string>
</dict>
</plist>"#;

    fn build_ipa(path: &Path) {
        let mut writer = ZipWriter::create(path).unwrap();
        writer.add_directory("Payload", None).unwrap();
        writer.add_directory("Payload/Demo.app", None).unwrap();
        writer.add_bytes("Payload/Demo.app/Info.plist", PLIST.as_bytes()).unwrap();
        writer.add_bytes("Payload/Demo.app/Demo", b"\xCF\xFA\xED\xFE").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_is_bundle_info_plist() {
        assert!(is_bundle_info_plist("Payload/Demo.app/Info.plist"));
        assert!(!is_bundle_info_plist("Payload/Demo.app/Frameworks/X.framework/Info.plist"));
        assert!(!is_bundle_info_plist("Payload/.app/Info.plist"));
        assert!(!is_bundle_info_plist("Other/Demo.app/Info.plist"));
    }

    #[test]
    fn test_extract_bundle() {
        let temp = TempDir::new().unwrap();
        let ipa = temp.path().join("Demo.ipa");
        build_ipa(&ipa);
        let dest = temp.path().join("Demo");

        let (summary, info) = ArchiveReader::default()
            .extract_bundle(&ipa, &dest, &TaskContext::detached())
            .unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(info.display_name.as_deref(), Some("Demo"));
        assert_eq!(info.bundle_identifier.as_deref(), Some("com.example.demo"));
        assert_eq!(info.short_version.as_deref(), Some("1.2"));
        assert_eq!(info.version.as_deref(), Some("42"));
        assert_eq!(info.minimum_os_version.as_deref(), Some("15.0"));
        assert_eq!(info.app_dir, PathBuf::from("Payload/Demo.app"));
        assert!(dest.join("Payload/Demo.app/Demo").exists());
    }

    #[test]
    fn test_bundle_info_from_archive() {
        let temp = TempDir::new().unwrap();
        let ipa = temp.path().join("Demo.ipa");
        build_ipa(&ipa);
        let info = BundleInfo::from_archive(&ipa).unwrap();
        assert_eq!(info.executable.as_deref(), Some("Demo"));
        assert_eq!(info.app_dir, PathBuf::from("Payload/Demo.app"));
    }

    #[test]
    fn test_plain_zip_is_not_a_bundle() {
        let temp = TempDir::new().unwrap();
        let zip = temp.path().join("plain.zip");
        let mut writer = ZipWriter::create(&zip).unwrap();
        writer.add_bytes("readme.txt", b"hi").unwrap();
        writer.finish().unwrap();

        assert!(BundleInfo::from_archive(&zip).is_err());
        let result = ArchiveReader::default().extract_bundle(&zip, &temp.path().join("out"), &TaskContext::detached());
        assert!(matches!(result, Err(ArchiveError::Corrupt(_))));
    }
}
