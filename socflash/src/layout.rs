//! Firmware image layout.
//!
//! Release images are unpacked into a root directory. The EDL payload lives
//! in a well-known subfolder (`sail_nor`); an empty subfolder means there is
//! nothing to flash in EDL mode. Every other artifact (fastboot script,
//! firehose programmer, MCU images, programmer executables) is found by name
//! through a recursive, depth-first search in sorted order, so the same tree
//! always yields the same file.

use crate::error::{Error, Result};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

/// Default name of the EDL payload folder.
pub const DEFAULT_EDL_FOLDER: &str = "sail_nor";

/// Default fastboot flashing scripts, in order of preference.
pub const FASTBOOT_SCRIPTS: &[&str] = &[
    "fastboot_nscdc_high_blank_flash.bat",
    "fastboot_nscdc_std_blank_flash.bat",
];

/// Firehose programmer loaded over Sahara.
pub const FIREHOSE_PROGRAMMER: &str = "prog_firehose_ddr.elf";

/// Partition program manifest.
pub const RAWPROGRAM_MANIFEST: &str = "rawprogram0.xml";

/// Partition patch manifest.
pub const PATCH_MANIFEST: &str = "patch0.xml";

/// Placeholder replaced by the image path in component arguments.
pub const IMAGE_PLACEHOLDER: &str = "{image}";

/// Renesas flash programmer executable names.
pub const RFP_PROGRAMMER: &[&str] = &["rfp-cli.exe", "rfp-cli"];

/// Files needed for EDL flashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdlPayload {
    /// The EDL folder, used as the loader's search path.
    pub folder: PathBuf,
    /// Firehose programmer image.
    pub firehose: PathBuf,
    /// Partition program manifest.
    pub rawprogram: PathBuf,
    /// Patch manifest, when shipped.
    pub patch: Option<PathBuf>,
}

/// How to find and flash one MCU component.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComponentSpec {
    /// Component name (e.g. `METER`).
    pub name: String,
    /// Image file extension without the dot.
    pub extension: String,
    /// Substrings the image file name must contain.
    pub include: Vec<String>,
    /// Substrings the image file name must not contain.
    #[cfg_attr(feature = "serde", serde(default))]
    pub exclude: Vec<String>,
    /// Programmer arguments; `{image}` is replaced by the image path.
    pub args: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items
        .iter()
        .map(ToString::to_string)
        .collect()
}

impl ComponentSpec {
    /// Meter cluster MCU (RH850, E2 emulator).
    pub fn meter() -> Self {
        Self {
            name: "METER".to_string(),
            extension: "s19".to_string(),
            include: owned(&["NCDCMETER"]),
            exclude: Vec::new(),
            args: owned(&[
                "-d", "RH850", "-tool", "E2", "-p", "-v", "-e", "-osc", "8.0", "-file", IMAGE_PLACEHOLDER,
                "-reset",
            ]),
        }
    }

    /// IVI MCU (RH850 over UART, with option bytes).
    pub fn ivi() -> Self {
        Self {
            name: "IVI".to_string(),
            extension: "s19".to_string(),
            include: owned(&["NCDCIVI"]),
            exclude: owned(&["VHSM"]),
            args: owned(&[
                "-d",
                "RH850",
                "-tool",
                "E2",
                "-if",
                "uart",
                "-osc",
                "8.0",
                "-fo",
                "opbt",
                "FA27FFCF,FFFFFDFF,FFFFFFFF,FFFFFFFF,FFFFFFFF,FFFFFFFF,FFFFFFFF,FFFFFFFF",
                "-e",
                "-p",
                "-v",
                "-file",
                IMAGE_PLACEHOLDER,
                "-reset",
            ]),
        }
    }

    /// Default components in flashing order.
    pub fn defaults() -> Vec<Self> {
        vec![Self::meter(), Self::ivi()]
    }

    /// Whether `file_name` is an image for this component.
    pub fn matches(&self, file_name: &str) -> bool {
        let ext_ok = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension));

        ext_ok
            && self
                .include
                .iter()
                .all(|s| file_name.contains(s.as_str()))
            && !self
                .exclude
                .iter()
                .any(|s| file_name.contains(s.as_str()))
    }

    /// Programmer arguments for `image`.
    pub fn args_for(&self, image: &Path) -> Vec<String> {
        let image = image
            .to_string_lossy()
            .into_owned();
        self.args
            .iter()
            .map(|a| a.replace(IMAGE_PLACEHOLDER, &image))
            .collect()
    }
}

/// Depth-first search for the first file accepted by `accept`.
///
/// Files of a directory are checked before its subdirectories; entries are
/// visited in name order. Symlinked directories are not followed.
pub fn find_file<F>(root: &Path, accept: F) -> Option<PathBuf>
where
    F: Fn(&str) -> bool,
{
    fn walk(dir: &Path, accept: &dyn Fn(&str) -> bool) -> Option<PathBuf> {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .ok()?
            .filter_map(std::result::Result::ok)
            .collect();
        entries.sort_by_key(fs::DirEntry::file_name);

        let mut subdirs = Vec::new();
        for entry in entries {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                subdirs.push(entry.path());
            } else if entry
                .file_name()
                .to_str()
                .is_some_and(accept)
            {
                return Some(entry.path());
            }
        }

        subdirs
            .iter()
            .find_map(|d| walk(d, accept))
    }

    walk(root, &accept)
}

/// Search `root` for the first of `names`, preferring earlier names within
/// the same directory.
pub fn find_first_named(root: &Path, names: &[String]) -> Option<PathBuf> {
    fn walk(dir: &Path, names: &[String]) -> Option<PathBuf> {
        if let Some(hit) = names
            .iter()
            .map(|n| dir.join(n))
            .find(|p| p.is_file())
        {
            return Some(hit);
        }

        let mut subdirs: Vec<PathBuf> = fs::read_dir(dir)
            .ok()?
            .filter_map(std::result::Result::ok)
            .filter(|e| {
                e.file_type()
                    .is_ok_and(|t| t.is_dir())
            })
            .map(|e| e.path())
            .collect();
        subdirs.sort();
        subdirs
            .iter()
            .find_map(|d| walk(d, names))
    }

    walk(root, names)
}

/// Locate a programmer executable under `tools_root` (case-insensitive).
pub fn find_programmer(tools_root: &Path, names: &[&str]) -> Result<PathBuf> {
    find_file(tools_root, |file| {
        names
            .iter()
            .any(|n| file.eq_ignore_ascii_case(n))
    })
    .ok_or_else(|| Error::LayoutMissing {
        what: format!("programmer {}", names.join(" / ")),
        path: tools_root.to_path_buf(),
    })
}

/// A validated images root.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    root: PathBuf,
    edl_folder: PathBuf,
}

impl ImageLayout {
    /// Validate `root` and remember where the EDL folder should be.
    pub fn open(root: impl Into<PathBuf>, edl_folder_name: &str) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::LayoutMissing {
                what: "images directory".to_string(),
                path: root,
            });
        }
        let edl_folder = root.join(edl_folder_name);
        Ok(Self { root, edl_folder })
    }

    /// Images root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// EDL payload folder (may not exist).
    pub fn edl_folder(&self) -> &Path {
        &self.edl_folder
    }

    /// Whether the EDL folder contains anything.
    pub fn has_edl_payload(&self) -> Result<bool> {
        if !self.edl_folder.is_dir() {
            return Err(Error::LayoutMissing {
                what: "EDL folder".to_string(),
                path: self
                    .edl_folder
                    .clone(),
            });
        }
        let mut entries = fs::read_dir(&self.edl_folder)?;
        Ok(entries
            .next()
            .is_some())
    }

    /// EDL payload files, or `None` when the EDL folder is empty.
    pub fn edl_payload(&self) -> Result<Option<EdlPayload>> {
        if !self.has_edl_payload()? {
            info!(
                "{} is empty, EDL flashing will be skipped",
                self.edl_folder.display()
            );
            return Ok(None);
        }

        let firehose = find_file(&self.root, |f| f == FIREHOSE_PROGRAMMER).ok_or_else(|| {
            Error::LayoutMissing {
                what: format!("firehose programmer {FIREHOSE_PROGRAMMER}"),
                path: self
                    .root
                    .clone(),
            }
        })?;

        let rawprogram = self
            .edl_folder
            .join(RAWPROGRAM_MANIFEST);
        if !rawprogram.is_file() {
            return Err(Error::LayoutMissing {
                what: format!("manifest {RAWPROGRAM_MANIFEST}"),
                path: self
                    .edl_folder
                    .clone(),
            });
        }

        let patch = Some(
            self.edl_folder
                .join(PATCH_MANIFEST),
        )
        .filter(|p| p.is_file());

        debug!("EDL payload: firehose {}", firehose.display());
        Ok(Some(EdlPayload {
            folder: self
                .edl_folder
                .clone(),
            firehose,
            rawprogram,
            patch,
        }))
    }

    /// Locate the fastboot flashing script.
    pub fn find_fastboot_script(&self, names: &[String]) -> Result<PathBuf> {
        let script = find_first_named(&self.root, names).ok_or_else(|| Error::LayoutMissing {
            what: format!("flash script ({})", names.join(", ")),
            path: self
                .root
                .clone(),
        })?;
        info!("Found flash script: {}", script.display());
        Ok(script)
    }

    /// Locate the image of an MCU component under `search_root`.
    pub fn find_component_image(search_root: &Path, spec: &ComponentSpec) -> Result<PathBuf> {
        find_file(search_root, |f| spec.matches(f)).ok_or_else(|| Error::LayoutMissing {
            what: format!("{} image (.{})", spec.name, spec.extension),
            path: search_root.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"x").unwrap();
        path
    }

    fn scripts() -> Vec<String> {
        FASTBOOT_SCRIPTS
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_missing_root() {
        let err = ImageLayout::open("/nonexistent/images", DEFAULT_EDL_FOLDER).unwrap_err();
        assert!(matches!(err, Error::LayoutMissing { .. }));
    }

    #[test]
    fn test_empty_edl_folder_means_no_payload() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sail_nor")).unwrap();
        let layout = ImageLayout::open(dir.path(), DEFAULT_EDL_FOLDER).unwrap();
        assert!(!layout.has_edl_payload().unwrap());
        assert!(layout.edl_payload().unwrap().is_none());
    }

    #[test]
    fn test_missing_edl_folder_is_an_error() {
        let dir = TempDir::new().unwrap();
        let layout = ImageLayout::open(dir.path(), DEFAULT_EDL_FOLDER).unwrap();
        assert!(matches!(
            layout.has_edl_payload(),
            Err(Error::LayoutMissing { .. })
        ));
    }

    #[test]
    fn test_edl_payload_files() {
        let dir = TempDir::new().unwrap();
        let firehose = touch(dir.path(), "2025-04-28/prog_firehose_ddr.elf");
        let rawprogram = touch(dir.path(), "sail_nor/rawprogram0.xml");
        touch(dir.path(), "sail_nor/patch0.xml");

        let layout = ImageLayout::open(dir.path(), DEFAULT_EDL_FOLDER).unwrap();
        let payload = layout.edl_payload().unwrap().unwrap();
        assert_eq!(payload.firehose, firehose);
        assert_eq!(payload.rawprogram, rawprogram);
        assert!(payload.patch.is_some());
        assert_eq!(payload.folder, dir.path().join("sail_nor"));
    }

    #[test]
    fn test_edl_payload_without_manifest() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "prog_firehose_ddr.elf");
        touch(dir.path(), "sail_nor/NON-HLOS.bin");
        let layout = ImageLayout::open(dir.path(), DEFAULT_EDL_FOLDER).unwrap();
        assert!(matches!(
            layout.edl_payload(),
            Err(Error::LayoutMissing { .. })
        ));
    }

    #[test]
    fn test_script_search_is_recursive_and_ordered() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "b/fastboot_nscdc_high_blank_flash.bat");
        let std_script = touch(dir.path(), "a/deep/fastboot_nscdc_std_blank_flash.bat");
        let layout = ImageLayout::open(dir.path(), DEFAULT_EDL_FOLDER).unwrap();
        assert_eq!(layout.find_fastboot_script(&scripts()).unwrap(), std_script);

        let high = touch(dir.path(), "a/deep/fastboot_nscdc_high_blank_flash.bat");
        assert_eq!(layout.find_fastboot_script(&scripts()).unwrap(), high);
    }

    #[test]
    fn test_missing_script() {
        let dir = TempDir::new().unwrap();
        let layout = ImageLayout::open(dir.path(), DEFAULT_EDL_FOLDER).unwrap();
        let err = layout.find_fastboot_script(&scripts()).unwrap_err();
        assert!(err.to_string().contains("flash script"));
    }

    #[test]
    fn test_component_matching() {
        let ivi = ComponentSpec::ivi();
        assert!(ivi.matches("NCDCIVI_PI26_01.s19"));
        assert!(ivi.matches("NCDCIVI_PI26_01.S19"));
        assert!(!ivi.matches("NCDCIVI_VHSM_PI26.s19"));
        assert!(!ivi.matches("NCDCIVI_PI26_01.hex"));
        assert!(ComponentSpec::meter().matches("NCDCMETER_PI26_01_01.s19"));
        assert!(!ComponentSpec::meter().matches("NCDCIVI_PI26_01.s19"));
    }

    #[test]
    fn test_component_image_and_args() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "MCU/NCDCIVI_VHSM_01.s19");
        let image = touch(dir.path(), "MCU/ivi/NCDCIVI_01.s19");

        let spec = ComponentSpec::ivi();
        let found = ImageLayout::find_component_image(dir.path(), &spec).unwrap();
        assert_eq!(found, image);

        let args = spec.args_for(&found);
        let file_idx = args.iter().position(|a| a == "-file").unwrap();
        assert_eq!(args[file_idx + 1], image.to_string_lossy());
        assert_eq!(args.last().map(String::as_str), Some("-reset"));
    }

    #[test]
    fn test_find_programmer_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let exe = touch(dir.path(), "Renesas Flash Programmer V3.16/RFP-CLI.EXE");
        assert_eq!(find_programmer(dir.path(), RFP_PROGRAMMER).unwrap(), exe);
        let empty = TempDir::new().unwrap();
        assert!(find_programmer(empty.path(), RFP_PROGRAMMER).is_err());
    }
}
