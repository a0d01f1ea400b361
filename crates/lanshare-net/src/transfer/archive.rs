use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

fn zip_error(e: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        if kind.is_symlink() {
            continue;
        }
        let path = entry.path();
        if kind.is_dir() {
            collect(&path, out)?;
        }
        out.push(path);
    }
    Ok(())
}

/// Zip `dir` into `out`. Entries are named `<dir name>/<relative path>` and
/// written in sorted order so the same tree always yields the same listing.
pub fn zip_directory(dir: &Path, out: &Path) -> io::Result<()> {
    let root = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "directory has no name"))?;

    let mut entries = Vec::new();
    collect(dir, &mut entries)?;
    entries.sort();

    let mut zip = ZipWriter::new(File::create(out)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.add_directory(format!("{root}/"), options).map_err(zip_error)?;

    for path in entries {
        let relative = path
            .strip_prefix(dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let name = format!("{root}/{relative}");

        if path.is_dir() {
            zip.add_directory(format!("{name}/"), options).map_err(zip_error)?;
        } else {
            zip.start_file(name, options).map_err(zip_error)?;
            let mut source = File::open(&path)?;
            io::copy(&mut source, &mut zip)?;
        }
    }

    zip.finish().map_err(zip_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_entries_are_rooted_and_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("project");
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("b.txt"), b"bee").unwrap();
        std::fs::write(root.join("a.txt"), b"ay").unwrap();
        std::fs::write(root.join("src").join("main.rs"), b"fn main() {}").unwrap();

        let out = tmp.path().join("project.zip");
        zip_directory(&root, &out).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "project/",
                "project/a.txt",
                "project/b.txt",
                "project/src/",
                "project/src/main.rs",
            ]
        );

        let mut content = String::new();
        archive
            .by_name("project/src/main.rs")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "fn main() {}");
    }
}
