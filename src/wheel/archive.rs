// src/wheel/archive.rs

//! Zip-level wheel operations: unpack, repack with a fresh RECORD, retag,
//! and metadata extraction
//!
//! Entry timestamps come from `SOURCE_DATE_EPOCH` so rebuilt archives are
//! byte-for-byte reproducible.

use super::WheelName;
use crate::config::get_source_epoch;
use crate::error::{Error, Result};
use crate::hash::record_digest;
use crate::recipe::canonicalize_name;
use chrono::{Datelike, Timelike};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Convert a unix timestamp into a zip entry timestamp
fn zip_timestamp(epoch: i64) -> zip::DateTime {
    chrono::DateTime::from_timestamp(epoch, 0)
        .and_then(|dt| {
            zip::DateTime::from_date_and_time(
                dt.year() as u16,
                dt.month() as u8,
                dt.day() as u8,
                dt.hour() as u8,
                dt.minute() as u8,
                dt.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

fn entry_options(compression_level: i64) -> FileOptions {
    let options = FileOptions::default().last_modified_time(zip_timestamp(get_source_epoch()));
    if compression_level > 0 {
        options
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(compression_level.min(9) as i32))
    } else {
        options.compression_method(CompressionMethod::Stored)
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> io::Result<u32> {
    Ok(fs::metadata(path)?.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> io::Result<u32> {
    Ok(0o644)
}

/// Archive-relative name with forward slashes
fn archive_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Extract every entry of a zip archive below `dest`
fn extract_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(target) = entry.enclosed_name().map(|p| dest.join(p)) else {
            warn!("Skipping unsafe archive entry {}", entry.name());
            continue;
        };
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Unpack a zip archive (wheel, sdist zip) into `dest`
pub fn unpack_zip_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    extract_zip(archive_path, dest)
}

/// Unpack a wheel into `target_dir/{name}-{version}` and return that directory
pub fn unpack_wheel(wheel: &Path, target_dir: &Path) -> Result<PathBuf> {
    let parsed = WheelName::from_path(wheel)?;
    let wheel_dir = target_dir.join(format!("{}-{}", parsed.name, parsed.version));
    fs::create_dir_all(&wheel_dir)?;
    debug!("Unpacking {} into {}", wheel.display(), wheel_dir.display());
    extract_zip(wheel, &wheel_dir)?;
    Ok(wheel_dir)
}

/// Read `Tag:` and `Build:` lines from a WHEEL metadata file
fn read_wheel_tags(wheel_file: &Path) -> Result<(Vec<String>, Option<String>)> {
    let content = fs::read_to_string(wheel_file)
        .map_err(|e| Error::io(format!("Failed to read {}", wheel_file.display()), e))?;
    let mut tags = Vec::new();
    let mut build = None;
    for line in content.lines() {
        if let Some(tag) = line.strip_prefix("Tag:") {
            tags.push(tag.trim().to_string());
        } else if let Some(b) = line.strip_prefix("Build:") {
            build = Some(b.trim().to_string());
        }
    }
    Ok((tags, build))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Pack an unpacked wheel directory back into `dest_dir`
///
/// The file name is derived from the directory name plus the `Tag` and
/// `Build` lines of `*.dist-info/WHEEL`. RECORD is regenerated and the
/// dist-info directory is written last.
pub fn pack_wheel(wheel_dir: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name_version = wheel_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::WheelError(format!("Invalid wheel directory: {}", wheel_dir.display())))?
        .to_string();
    let dist_info = format!("{}.dist-info", name_version);
    let dist_info_dir = wheel_dir.join(&dist_info);
    if !dist_info_dir.is_dir() {
        return Err(Error::WheelError(format!(
            "Not a directory: {}",
            dist_info_dir.display()
        )));
    }

    let (tags, build) = read_wheel_tags(&dist_info_dir.join("WHEEL"))?;
    if tags.is_empty() {
        return Err(Error::WheelError(format!(
            "No tags present in {}/WHEEL",
            dist_info
        )));
    }
    let component = |i: usize| -> String {
        let set: BTreeSet<&str> = tags.iter().filter_map(|t| t.split('-').nth(i)).collect();
        set.into_iter().collect::<Vec<_>>().join(".")
    };
    let build_part = build.map(|b| format!("-{}", b)).unwrap_or_default();
    let filename = format!(
        "{}{}-{}-{}-{}.whl",
        name_version,
        build_part,
        component(0),
        component(1),
        component(2)
    );

    let record_name = format!("{}/RECORD", dist_info);
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(wheel_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::io("Failed to walk wheel directory", e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = archive_name(wheel_dir, entry.path()) else {
            continue;
        };
        if name == record_name {
            continue;
        }
        files.push((name, entry.path().to_path_buf()));
    }
    // dist-info last, keeping sorted order within each group
    files.sort_by_key(|(name, _)| name.starts_with(&format!("{}/", dist_info)));

    let mut record = String::new();
    for (name, path) in &files {
        let (digest, size) = record_digest(path)?;
        record.push_str(&format!("{},{},{}\n", csv_field(name), digest, size));
    }
    record.push_str(&format!("{},,\n", record_name));
    fs::write(dist_info_dir.join("RECORD"), &record)?;

    fs::create_dir_all(dest_dir)?;
    let wheel_path = dest_dir.join(&filename);
    let mut zip = ZipWriter::new(File::create(&wheel_path)?);
    let options = entry_options(6);
    for (name, path) in &files {
        zip.start_file(name.as_str(), options.unix_permissions(file_mode(path)?))?;
        io::copy(&mut File::open(path)?, &mut zip)?;
    }
    zip.start_file(record_name.as_str(), options)?;
    zip.write_all(record.as_bytes())?;
    zip.finish()?;

    debug!("Packed {}", wheel_path.display());
    Ok(wheel_path)
}

/// Unpack `wheel`, let `edit` change the tree, then replace the wheel
///
/// If `edit` or repacking fails the original wheel is left untouched.
/// Returns the path of the repacked wheel, which differs from `wheel` when
/// tags changed.
pub fn modify_wheel<F>(wheel: &Path, edit: F) -> Result<PathBuf>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let temp = tempfile::tempdir()?;
    let wheel_dir = unpack_wheel(wheel, temp.path())?;
    edit(&wheel_dir)?;
    let dest = wheel
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    // Staged beside the original so the rename stays on one filesystem
    let staging = tempfile::Builder::new()
        .prefix(".repack")
        .tempdir_in(&dest)?;
    let packed = pack_wheel(&wheel_dir, staging.path())?;
    let file_name = packed
        .file_name()
        .ok_or_else(|| Error::WheelError(format!("Invalid wheel path: {}", packed.display())))?
        .to_owned();
    let target = dest.join(&file_name);
    fs::rename(&packed, &target)?;
    if wheel.file_name() != Some(file_name.as_os_str()) {
        fs::remove_file(wheel)?;
    }
    Ok(target)
}

/// Replace the platform tag (and optionally python/abi tags) of a wheel
pub fn retag_wheel(
    wheel: &Path,
    platform: &str,
    python: Option<&str>,
    abi: Option<&str>,
) -> Result<PathBuf> {
    let old = WheelName::from_path(wheel)?;
    let mut new = old.clone();
    new.platform_tags = vec![platform.to_string()];
    if let Some(py) = python {
        new.python_tags = vec![py.to_string()];
    }
    if let Some(abi) = abi {
        new.abi_tags = vec![abi.to_string()];
    }
    if new == old {
        return Ok(wheel.to_path_buf());
    }

    let new_tags: Vec<String> = new.tags().iter().map(ToString::to_string).collect();
    let retagged = modify_wheel(wheel, |dir| {
        let wheel_file = dir
            .join(format!("{}-{}.dist-info", old.name, old.version))
            .join("WHEEL");
        let content = fs::read_to_string(&wheel_file)?;
        let mut lines: Vec<String> = content
            .lines()
            .filter(|l| !l.starts_with("Tag:"))
            .map(str::to_string)
            .collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        for tag in &new_tags {
            lines.push(format!("Tag: {}", tag));
        }
        fs::write(&wheel_file, lines.join("\n") + "\n")?;
        Ok(())
    })?;
    debug!(
        "Retagged {} -> {}",
        old.filename(),
        retagged.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    );
    Ok(retagged)
}

/// Zip the contents of `input_dir` into `archive_path`
///
/// A compression level of 0 stores entries uncompressed.
pub fn make_zip_archive(archive_path: &Path, input_dir: &Path, compression_level: i64) -> Result<()> {
    let mut zip = ZipWriter::new(File::create(archive_path)?);
    let options = entry_options(compression_level);
    for entry in WalkDir::new(input_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::io("Failed to walk archive input", e))?;
        let Some(name) = archive_name(input_dir, entry.path()) else {
            continue;
        };
        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else {
            zip.start_file(name, options.unix_permissions(file_mode(entry.path())?))?;
            io::copy(&mut File::open(entry.path())?, &mut zip)?;
        }
    }
    zip.finish()?;
    Ok(())
}

/// Rewrite a zip archive with a different compression level
pub fn repack_zip_archive(archive_path: &Path, compression_level: i64) -> Result<()> {
    let temp = tempfile::tempdir()?;
    let input_path = temp.path().join("input.zip");
    fs::copy(archive_path, &input_path)?;

    let mut input = ZipArchive::new(File::open(&input_path)?)?;
    let mut output = ZipWriter::new(File::create(archive_path)?);
    let options = entry_options(compression_level);
    for i in 0..input.len() {
        let mut entry = input.by_index(i)?;
        let name = entry.name().to_string();
        if entry.is_dir() {
            output.add_directory(name, options)?;
            continue;
        }
        let mut entry_options = options;
        if let Some(mode) = entry.unix_mode() {
            entry_options = entry_options.unix_permissions(mode);
        }
        output.start_file(name, entry_options)?;
        io::copy(&mut entry, &mut output)?;
    }
    output.finish()?;
    Ok(())
}

/// Top-level `*.dist-info` directory of a wheel belonging to `pkg_name`
fn wheel_dist_info_dir<R: Read + io::Seek>(archive: &ZipArchive<R>, pkg_name: &str) -> Result<String> {
    let candidates: BTreeSet<String> = archive
        .file_names()
        .filter_map(|n| n.split('/').next())
        .filter(|top| top.ends_with(".dist-info"))
        .map(str::to_string)
        .collect();

    let mut iter = candidates.into_iter();
    let Some(info_dir) = iter.next() else {
        return Err(Error::WheelError(format!(
            "{} has no .dist-info directory",
            pkg_name
        )));
    };
    if iter.next().is_some() {
        return Err(Error::WheelError(format!(
            "{} has multiple .dist-info directories",
            pkg_name
        )));
    }
    if !canonicalize_name(&info_dir).starts_with(&canonicalize_name(pkg_name)) {
        return Err(Error::WheelError(format!(
            ".dist-info directory {} does not start with {}",
            info_dir, pkg_name
        )));
    }
    Ok(info_dir)
}

/// Write the wheel's `METADATA` file to `output_path`
pub fn extract_wheel_metadata_file(wheel: &Path, output_path: &Path) -> Result<()> {
    let filename = wheel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let pkg_name = filename.split('-').next().unwrap_or_default().to_string();

    let mut archive = ZipArchive::new(File::open(wheel)?)?;
    let info_dir = wheel_dist_info_dir(&archive, &pkg_name)?;
    let metadata_name = format!("{}/METADATA", info_dir);
    let mut entry = archive
        .by_name(&metadata_name)
        .map_err(|_| Error::NotFound(format!("METADATA file not found for {}", pkg_name)))?;
    let mut out = File::create(output_path)?;
    io::copy(&mut entry, &mut out)?;
    Ok(())
}

fn valid_package_dir(name: &str) -> bool {
    !name.contains(['.', '-', ' '])
}

/// Guess the importable top-level names of a wheel
///
/// A name is either a top-level `.py` module or a top-level directory
/// (without `.`, `-` or spaces) containing a `.py` file reachable through
/// similarly valid subdirectories. Returns `None` when nothing is found.
pub fn parse_top_level_import_name(wheel: &Path) -> Result<Option<Vec<String>>> {
    if wheel.extension().and_then(|e| e.to_str()) != Some("whl") {
        return Err(Error::WheelError(format!(
            "{} is not a wheel file.",
            wheel.display()
        )));
    }

    let archive = ZipArchive::new(File::open(wheel)?)?;
    let mut imports: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !imports.iter().any(|i| i == name) {
            imports.push(name.to_string());
        }
    };

    for name in archive.file_names() {
        let parts: Vec<&str> = name.split('/').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [file] if !name.ends_with('/') => {
                if let Some(module) = file.strip_suffix(".py") {
                    push(module);
                }
            }
            [top, middle @ .., file] if !name.ends_with('/') => {
                if valid_package_dir(top)
                    && file.ends_with(".py")
                    && middle.iter().all(|d| valid_package_dir(d))
                {
                    push(top);
                }
            }
            _ => {}
        }
    }

    if imports.is_empty() {
        warn!("Failed to parse top level import name from {}.", wheel.display());
        return Ok(None);
    }
    Ok(Some(imports))
}
