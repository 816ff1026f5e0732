use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use camino::Utf8Path;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::error::FiregridError;

fn fs_err(path: &Utf8Path, err: impl std::fmt::Display) -> FiregridError {
    FiregridError::Filesystem(format!("{path}: {err}"))
}

pub fn ensure_dir(path: &Utf8Path) -> Result<(), FiregridError> {
    fs::create_dir_all(path.as_std_path()).map_err(|err| fs_err(path, err))
}

/// A temp file next to `path`, so the final rename stays on one filesystem.
pub fn temp_file_for(path: &Utf8Path) -> Result<NamedTempFile, FiregridError> {
    let parent = path
        .parent()
        .ok_or_else(|| FiregridError::Filesystem(format!("invalid destination path {path}")))?;
    ensure_dir(parent)?;
    tempfile::Builder::new()
        .prefix(".firegrid")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| fs_err(path, err))
}

pub fn persist_temp(temp: NamedTempFile, path: &Utf8Path) -> Result<(), FiregridError> {
    temp.persist(path.as_std_path())
        .map_err(|err| fs_err(path, err.error))?;
    Ok(())
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), FiregridError> {
    let mut temp = temp_file_for(path)?;
    temp.write_all(content).map_err(|err| fs_err(path, err))?;
    persist_temp(temp, path)
}

pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), FiregridError> {
    let content = serde_json::to_vec_pretty(value).map_err(|err| fs_err(path, err))?;
    write_bytes_atomic(path, &content)
}

/// Compact JSON through gzip; used for layer payloads.
pub fn write_json_gz<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), FiregridError> {
    let temp = temp_file_for(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(temp), Compression::default());
    serde_json::to_writer(&mut encoder, value).map_err(|err| fs_err(path, err))?;
    let temp = encoder
        .finish()
        .and_then(|writer| writer.into_inner().map_err(|err| err.into_error()))
        .map_err(|err| fs_err(path, err))?;
    persist_temp(temp, path)
}

pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, FiregridError> {
    let content = fs::read(path.as_std_path()).map_err(|err| fs_err(path, err))?;
    serde_json::from_slice(&content).map_err(|err| FiregridError::Decode {
        path: path.to_string(),
        detail: err.to_string(),
    })
}

pub fn read_json_gz<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, FiregridError> {
    let file = fs::File::open(path.as_std_path()).map_err(|err| fs_err(path, err))?;
    let mut content = Vec::new();
    GzDecoder::new(BufReader::new(file))
        .read_to_end(&mut content)
        .map_err(|err| FiregridError::Decode {
            path: path.to_string(),
            detail: err.to_string(),
        })?;
    serde_json::from_slice(&content).map_err(|err| FiregridError::Decode {
        path: path.to_string(),
        detail: err.to_string(),
    })
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn gzip_json_survives_a_write() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let path = root.join("nested").join("values.json.gz");
        write_json_gz(&path, &vec![Some(1.5), None]).unwrap();
        let back: Vec<Option<f64>> = read_json_gz(&path).unwrap();
        assert_eq!(back, vec![Some(1.5), None]);
        let leftovers = fs::read_dir(root.join("nested").as_std_path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
