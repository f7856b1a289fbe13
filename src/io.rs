use std::fmt::Display;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;

use crate::error::AssetError;

const ANSI_BLUE: Style = Style::new().blue();

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

fn io_error(path: &Utf8Path, source: std::io::Error) -> AssetError {
    if source.kind() == ErrorKind::NotFound {
        AssetError::NotFound(path.to_owned())
    } else {
        AssetError::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// Read a whole file, telling a missing file apart from other failures.
pub fn read_bytes(path: &Utf8Path) -> Result<Vec<u8>, AssetError> {
    fs::read(path).map_err(|e| io_error(path, e))
}

/// Read a whole UTF-8 file. Invalid UTF-8 counts as malformed content.
pub fn read_text(path: &Utf8Path) -> Result<String, AssetError> {
    let bytes = read_bytes(path)?;
    String::from_utf8(bytes).map_err(|e| AssetError::deserialize(path, e))
}

/// Create every missing parent directory of `path`.
pub fn ensure_parent(path: &Utf8Path) -> Result<(), AssetError> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| AssetError::Io {
            path: dir.to_owned(),
            source,
        })?;
    }
    Ok(())
}

/// Write `data` to `path`, creating the directory tree first.
pub fn write_bytes(path: &Utf8Path, data: impl AsRef<[u8]>) -> Result<(), AssetError> {
    ensure_parent(path)?;
    fs::write(path, data).map_err(|source| AssetError::Io {
        path: path.to_owned(),
        source,
    })
}

pub fn copy_rec(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> std::io::Result<()> {
    fs::create_dir_all(&dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let filetype = entry.file_type()?;
        if filetype.is_dir() {
            copy_rec(entry.path(), dst.as_ref().join(entry.file_name()))?;
        } else {
            fs::copy(entry.path(), dst.as_ref().join(entry.file_name()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn tmp() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_write_creates_tree() {
        let (_dir, root) = tmp();
        let path = root.join("a/b/c.txt");
        write_bytes(&path, "hello").unwrap();
        write_bytes(&path, "again").unwrap();
        assert_eq!(read_text(&path).unwrap(), "again");
    }

    #[test]
    fn test_read_missing() {
        let (_dir, root) = tmp();
        let err = read_bytes(&root.join("nope.bin")).unwrap_err();
        assert!(matches!(err, AssetError::NotFound(_)));
    }

    #[test]
    fn test_write_rejected_by_filesystem() {
        let (_dir, root) = tmp();
        write_bytes(&root.join("blocker"), "a file, not a directory").unwrap();

        let path = root.join("blocker/x.txt");
        let err = write_bytes(&path, "data").unwrap_err();
        assert!(matches!(err, AssetError::Io { .. }), "{err:?}");

        let err = write_bytes(&root.join("blocker/deeper/x.txt"), "data").unwrap_err();
        assert!(matches!(err, AssetError::Io { .. }), "{err:?}");

        // writing onto a directory fails the same way
        let err = write_bytes(&root, "data").unwrap_err();
        assert!(matches!(err, AssetError::Io { .. }), "{err:?}");
    }

    #[test]
    fn test_read_invalid_utf8() {
        let (_dir, root) = tmp();
        let path = root.join("bad.txt");
        write_bytes(&path, [0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(
            read_text(&path),
            Err(AssetError::Deserialize { .. })
        ));
    }

    #[test]
    fn test_copy_rec() {
        let (_dir, root) = tmp();
        write_bytes(&root.join("src/x/one.log"), "1").unwrap();
        write_bytes(&root.join("src/two.log"), "2").unwrap();
        copy_rec(root.join("src"), root.join("dst")).unwrap();
        assert_eq!(read_text(&root.join("dst/x/one.log")).unwrap(), "1");
        assert_eq!(read_text(&root.join("dst/two.log")).unwrap(), "2");
    }
}
