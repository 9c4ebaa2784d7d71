//! Volume copy metadata (`volumecopy.meta.json`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::system::SECTOR_SIZE;
use crate::{Error, Result};

/// Name of the metadata file inside the copy meta directory.
pub const META_FILE_NAME: &str = "volumecopy.meta.json";

/// Layout of copy data files.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CopyFormat {
    /// One data file per segment.
    Bin,

    /// One data file holding the whole volume.
    Image,
}

impl TryFrom<u8> for CopyFormat {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Bin),
            1 => Ok(Self::Image),
            other => Err(format!("unsupported copy format {}", other)),
        }
    }
}

impl From<CopyFormat> for u8 {
    fn from(value: CopyFormat) -> Self {
        match value {
            CopyFormat::Bin => 0,
            CopyFormat::Image => 1,
        }
    }
}

impl fmt::Display for CopyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bin => "BIN",
            Self::Image => "IMAGE",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopySegment {
    pub copy_data_file: String,
    #[serde(default)]
    pub checksum_bin_file: String,
    #[serde(default)]
    pub index: u32,
    pub offset: u64,
    pub length: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCopyMeta {
    pub copy_name: String,
    #[serde(default)]
    pub backup_type: i32,
    pub copy_format: CopyFormat,
    pub volume_size: u64,
    #[serde(default)]
    pub block_size: u64,
    #[serde(default)]
    pub volume_path: String,
    pub segments: Vec<CopySegment>,
}

/// Part of the volume backed by a single data file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyExtent {
    /// Absolute path to data file.
    pub file: PathBuf,

    /// Offset within the volume.
    pub offset: u64,

    /// Number of bytes.
    pub length: u64,
}

impl VolumeCopyMeta {
    /// Read metadata from the copy meta directory.
    pub fn read(meta_dir: &Path) -> Result<Self> {
        let path = meta_dir.join(META_FILE_NAME);
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == IoErrorKind::NotFound {
                Error::consistency(format!("copy metadata {} not found", path.display()))
            } else {
                Error::consistency(format!("read copy metadata {}: {}", path.display(), e))
            }
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::consistency(format!("parse copy metadata {}: {}", path.display(), e))
        })
    }

    /// Check layout against the data directory and return extents in volume order.
    pub fn validate(&self, data_dir: &Path) -> Result<Vec<CopyExtent>> {
        let invalid = |msg: String| Error::consistency(format!("copy {}: {}", self.copy_name, msg));

        if self.volume_size == 0 {
            return Err(invalid("volume size is zero".to_string()));
        }
        if self.segments.is_empty() {
            return Err(invalid("no segments".to_string()));
        }

        let mut expected = 0u64;
        for segment in &self.segments {
            if segment.length == 0 {
                return Err(invalid(format!("segment {} is empty", segment.index)));
            }
            if segment.offset != expected {
                return Err(invalid(format!(
                    "segment {} starts at {}, expected {}",
                    segment.index, segment.offset, expected
                )));
            }
            expected = segment
                .offset
                .checked_add(segment.length)
                .ok_or_else(|| invalid(format!("segment {} overflows", segment.index)))?;
        }
        if expected != self.volume_size {
            return Err(invalid(format!(
                "segments cover {} bytes, volume size is {}",
                expected, self.volume_size
            )));
        }

        match self.copy_format {
            CopyFormat::Image => {
                let name = &self.segments[0].copy_data_file;
                if let Some(other) = self.segments.iter().find(|s| &s.copy_data_file != name) {
                    return Err(invalid(format!(
                        "image copy references several data files ({}, {})",
                        name, other.copy_data_file
                    )));
                }
                let file = data_file(data_dir, name, self.volume_size)
                    .map_err(|e| e.context(format!("copy {}", self.copy_name)))?;
                Ok(vec![CopyExtent {
                    file,
                    offset: 0,
                    length: self.volume_size,
                }])
            }
            CopyFormat::Bin => {
                let multi = self.segments.len() > 1;
                self.segments
                    .iter()
                    .map(|segment| {
                        if multi
                            && (segment.offset % SECTOR_SIZE != 0
                                || segment.length % SECTOR_SIZE != 0)
                        {
                            return Err(invalid(format!(
                                "segment {} is not aligned to {} bytes",
                                segment.index, SECTOR_SIZE
                            )));
                        }
                        let file = data_file(data_dir, &segment.copy_data_file, segment.length)
                            .map_err(|e| e.context(format!("copy {}", self.copy_name)))?;
                        Ok(CopyExtent {
                            file,
                            offset: segment.offset,
                            length: segment.length,
                        })
                    })
                    .collect()
            }
        }
    }
}

/// Resolve data file and check it holds at least `min_size` bytes.
fn data_file(data_dir: &Path, name: &str, min_size: u64) -> Result<PathBuf> {
    let relative = Path::new(name);
    let mut components = relative.components();
    if !matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) {
        return Err(Error::consistency(format!(
            "data file name '{}' is not a plain file name",
            name
        )));
    }

    let path = data_dir.join(relative);
    let metadata = fs::metadata(&path).map_err(|e| {
        Error::consistency(format!("data file {} is missing: {}", path.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(Error::consistency(format!(
            "data file {} is not a regular file",
            path.display()
        )));
    }
    if metadata.len() < min_size {
        return Err(Error::consistency(format!(
            "data file {} is truncated: {} bytes, expected {}",
            path.display(),
            metadata.len(),
            min_size
        )));
    }
    Ok(path)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{CopyFormat, CopySegment, VolumeCopyMeta, META_FILE_NAME};
    use crate::ErrorKind;
    use anyhow::Result;
    use std::fs;
    use std::path::Path;
    use tempdir::TempDir;

    /// Write a BIN copy with given segment sizes into `meta` and `data`.
    pub(crate) fn write_bin_copy(meta: &Path, data: &Path, sizes: &[u64]) -> Result<()> {
        let mut segments = Vec::new();
        let mut offset = 0;
        for (index, size) in sizes.iter().enumerate() {
            let name = format!("vc1.{}.copydata.bin", index);
            fs::write(data.join(&name), vec![0u8; *size as usize])?;
            segments.push(CopySegment {
                copy_data_file: name,
                checksum_bin_file: format!("vc1.{}.sha256.meta.bin", index),
                index: index as u32,
                offset,
                length: *size,
            });
            offset += size;
        }
        let meta_obj = VolumeCopyMeta {
            copy_name: "vc1".to_string(),
            backup_type: 0,
            copy_format: CopyFormat::Bin,
            volume_size: offset,
            block_size: 4096,
            volume_path: "/dev/sdb1".to_string(),
            segments,
        };
        fs::write(
            meta.join(META_FILE_NAME),
            serde_json::to_string_pretty(&meta_obj)?,
        )?;
        Ok(())
    }

    #[test]
    fn test_parse_meta_file() -> Result<()> {
        let meta: VolumeCopyMeta = serde_json::from_str(
            r#"{
                "copyName": "vc1",
                "backupType": 0,
                "copyFormat": 1,
                "volumeSize": 4194304,
                "blockSize": 4096,
                "volumePath": "/dev/sdb1",
                "segments": [
                    { "copyDataFile": "vc1.copydata.img", "checksumBinFile": "vc1.sha256.meta.bin",
                      "index": 0, "offset": 0, "length": 4194304 }
                ]
            }"#,
        )?;
        assert_eq!(meta.copy_format, CopyFormat::Image);
        assert_eq!(meta.segments[0].length, 4194304);
        Ok(())
    }

    #[test]
    fn test_unsupported_copy_format() -> Result<()> {
        let tmp = TempDir::new("test-meta")?;
        fs::write(
            tmp.path().join(META_FILE_NAME),
            r#"{"copyName":"vc1","copyFormat":3,"volumeSize":512,"segments":[]}"#,
        )?;
        let err = VolumeCopyMeta::read(tmp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(err.message().contains("unsupported copy format 3"));
        Ok(())
    }

    #[test]
    fn test_missing_meta_file() -> Result<()> {
        let tmp = TempDir::new("test-meta")?;
        let err = VolumeCopyMeta::read(tmp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        Ok(())
    }

    #[test]
    fn test_validate_multi_segment() -> Result<()> {
        let meta_dir = TempDir::new("test-meta")?;
        let data_dir = TempDir::new("test-data")?;
        write_bin_copy(meta_dir.path(), data_dir.path(), &[4096, 1024])?;

        let meta = VolumeCopyMeta::read(meta_dir.path())?;
        let extents = meta.validate(data_dir.path())?;
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[1].offset, 4096);
        assert_eq!(extents[1].length, 1024);
        assert!(extents[1].file.ends_with("vc1.1.copydata.bin"));
        Ok(())
    }

    #[test]
    fn test_validate_truncated_data() -> Result<()> {
        let meta_dir = TempDir::new("test-meta")?;
        let data_dir = TempDir::new("test-data")?;
        write_bin_copy(meta_dir.path(), data_dir.path(), &[4096])?;
        fs::write(data_dir.path().join("vc1.0.copydata.bin"), [0u8; 100])?;

        let err = VolumeCopyMeta::read(meta_dir.path())?
            .validate(data_dir.path())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(err.message().contains("truncated"));
        Ok(())
    }

    #[test]
    fn test_validate_layout_errors() -> Result<()> {
        let data_dir = TempDir::new("test-data")?;
        fs::write(data_dir.path().join("a.bin"), [0u8; 1024])?;
        let segment = |file: &str, offset, length| CopySegment {
            copy_data_file: file.to_string(),
            checksum_bin_file: String::new(),
            index: 0,
            offset,
            length,
        };
        let meta = |segments, volume_size| VolumeCopyMeta {
            copy_name: "vc1".to_string(),
            backup_type: 0,
            copy_format: CopyFormat::Bin,
            volume_size,
            block_size: 4096,
            volume_path: String::new(),
            segments,
        };

        let cases = vec![
            meta(vec![], 1024),
            meta(vec![segment("a.bin", 0, 1024)], 0),
            meta(vec![segment("a.bin", 512, 512)], 1024),
            meta(vec![segment("a.bin", 0, 512)], 1024),
            meta(vec![segment("a.bin", 0, 500), segment("a.bin", 500, 524)], 1024),
            meta(vec![segment("../a.bin", 0, 1024)], 1024),
            meta(vec![segment("missing.bin", 0, 1024)], 1024),
        ];
        for case in cases {
            let err = case.validate(data_dir.path()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Consistency, "{:?}", case);
        }

        meta(vec![segment("a.bin", 0, 1000)], 1000).validate(data_dir.path())?;
        Ok(())
    }
}
