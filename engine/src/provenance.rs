// In engine/src/provenance.rs
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::Error;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn file_sha256(path: &Path) -> Result<String, Error> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Relative path (`/`-separated) to sha256 for each file under `base`.
pub fn manifest(base: &Path, files: &[PathBuf]) -> Result<BTreeMap<String, String>, Error> {
    let mut entries = BTreeMap::new();
    for file in files {
        let relative = file.strip_prefix(base).unwrap_or(file);
        let key = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        entries.insert(key, file_sha256(file)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_digest_matches_in_memory_digest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("replace-schema.sql");
        let content = "create table member(id integer primary key);\n".repeat(500);
        fs::write(&path, &content).unwrap();

        assert_eq!(file_sha256(&path).unwrap(), sha256_hex(content.as_bytes()));
    }

    #[test]
    fn manifest_keys_are_relative() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path();
        let nested = base.join("playsql").join("data").join("01.sql");
        fs::create_dir_all(nested.parent().unwrap()).unwrap();
        fs::write(&nested, "select 1;").unwrap();

        let manifest = manifest(base, &[nested]).unwrap();
        assert_eq!(
            manifest.get("playsql/data/01.sql").map(String::as_str),
            Some(sha256_hex(b"select 1;").as_str())
        );
    }
}
