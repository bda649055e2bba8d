//! Parquet export of stored tables.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Lz4,
    Zstd,
}

impl Compression {
    pub const ALL: [Compression; 5] = [
        Compression::Uncompressed,
        Compression::Snappy,
        Compression::Gzip,
        Compression::Lz4,
        Compression::Zstd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Uncompressed => "uncompressed",
            Compression::Snappy => "snappy",
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    fn to_parquet(self) -> ParquetCompression {
        match self {
            Compression::Uncompressed => ParquetCompression::Uncompressed,
            Compression::Snappy => ParquetCompression::Snappy,
            Compression::Gzip => ParquetCompression::Gzip(None),
            Compression::Lz4 => ParquetCompression::Lz4Raw,
            Compression::Zstd => ParquetCompression::Zstd(None),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        if wanted == "none" {
            return Ok(Compression::Uncompressed);
        }
        Compression::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| {
                format!("unknown compression '{s}' (expected uncompressed, snappy, gzip, lz4 or zstd)")
            })
    }
}

/// `{dir}/{table_name}.{compression}.parquet`
pub fn export_path(dir: &Path, table_name: &str, compression: Compression) -> PathBuf {
    dir.join(format!("{table_name}.{compression}.parquet"))
}

/// Write `frame` to `path` via a temp file and rename, so readers never see
/// a half-written file.
pub fn write_parquet(
    frame: &DataFrame,
    path: &Path,
    compression: Compression,
) -> Result<(), StoreError> {
    let io_err = |source: std::io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp_path = path.with_extension("parquet.tmp");
    let file = fs::File::create(&tmp_path).map_err(io_err)?;
    let written = ParquetWriter::new(file)
        .with_compression(compression.to_parquet())
        .finish(&mut frame.clone());
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        io_err(e)
    })
}
