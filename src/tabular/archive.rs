//! Zip-bundle handling for portals that ship multi-report exports as one
//! archive.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::ZipArchive;

use crate::core::error::{HarvestError, Result};

/// Extract every member of `archive` into `dest`, returning the extracted
/// paths in archive order. Members with unsafe paths (absolute, or escaping
/// `dest` via `..`) are rejected.
pub fn unpack_zip(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)
        .map_err(|e| HarvestError::Parse(format!("{}: {e}", archive.display())))?;

    std::fs::create_dir_all(dest)?;
    let mut extracted = Vec::new();

    for index in 0..zip.len() {
        let mut member = zip
            .by_index(index)
            .map_err(|e| HarvestError::Parse(format!("{}: {e}", archive.display())))?;
        let Some(relative) = member.enclosed_name() else {
            return Err(HarvestError::Parse(format!(
                "{}: archive member {:?} has an unsafe path",
                archive.display(),
                member.name()
            )));
        };
        let target = dest.join(relative);
        if member.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut member, &mut out)?;
        debug!(member = %target.display(), "extracted archive member");
        extracted.push(target);
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_archive(path: &Path, members: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        for (name, contents) in members {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn members_extract_in_archive_order() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        build_archive(
            &archive,
            &[("1 Roster.csv", "id\n1\n"), ("2 Waitlist.csv", "id\n2\n")],
        );

        let dest = dir.path().join("out");
        let extracted = unpack_zip(&archive, &dest).unwrap();
        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted[0].file_name().unwrap(), "1 Roster.csv");
        assert_eq!(std::fs::read_to_string(&extracted[1]).unwrap(), "id\n2\n");
    }

    #[test]
    fn nested_members_land_under_dest() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        build_archive(&archive, &[("reports/3 Lottery.csv", "id\n3\n")]);

        let dest = dir.path().join("out");
        let extracted = unpack_zip(&archive, &dest).unwrap();
        assert!(extracted[0].starts_with(&dest));
        assert!(extracted[0].exists());
    }
}
