// src/recipe/kitchen/archive.rs

//! Source download, checksum and archive utilities for the kitchen

use crate::error::{Error, Result};
use crate::hash::sha256_file;
use crate::wheel::unpack_zip_archive;
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_DISPOSITION;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tar::Archive;
use tracing::{debug, info, warn};
use url::Url;
use xz2::read::XzDecoder;

/// Connection timeout for source downloads
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum attempts for a failed download
pub const MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Archive suffixes stripped to guess the extracted directory name
const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tgz", ".tar", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".tar.zst", ".zip", ".whl",
];

/// Download `url` into `dest_dir`
///
/// The file name comes from the `Content-Disposition` header when the
/// server sends one, otherwise from the last URL segment. Network errors
/// and HTTP error statuses are retried.
pub fn download_source(url: &str, dest_dir: &Path) -> Result<PathBuf> {
    info!("Downloading {}", url);
    fs::create_dir_all(dest_dir)?;

    let client = Client::builder()
        .connect_timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {}", e)))?;

    let mut attempt = 0;
    let response = loop {
        attempt += 1;
        let result = client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status());
        match result {
            Ok(response) => break response,
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(Error::DownloadError(format!(
                        "Failed to download {} after {} trials: {}",
                        url, MAX_RETRIES, e
                    )));
                }
                warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
            }
        }
    };

    let disposition = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let tarballname = extract_tarballname(url, disposition.as_deref());
    let dest = dest_dir.join(&tarballname);

    let bytes = response
        .bytes()
        .map_err(|e| Error::DownloadError(format!("Failed to read response from {}: {}", url, e)))?;

    // Write to a temporary file first
    let temp_path = dest_dir.join(format!("{}.tmp", tarballname));
    fs::write(&temp_path, &bytes)
        .map_err(|e| Error::io(format!("Failed to write {}", temp_path.display()), e))?;
    fs::rename(&temp_path, &dest).map_err(|e| {
        Error::io(
            format!("Failed to move {} to {}", temp_path.display(), dest.display()),
            e,
        )
    })?;

    debug!("Downloaded {} bytes to {}", bytes.len(), dest.display());
    Ok(dest)
}

/// File name for a download: `Content-Disposition` filename, else the URL's last segment
///
/// Both `filename="..."` and the RFC 5987 `filename*=charset''...` forms are
/// understood; the latter wins when both are present.
pub fn extract_tarballname(url: &str, content_disposition: Option<&str>) -> String {
    let from_url = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(|segment| {
                    percent_encoding::percent_decode_str(segment)
                        .decode_utf8_lossy()
                        .into_owned()
                })
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| url.rsplit('/').next().unwrap_or(url).to_string());

    let Some(header) = content_disposition else {
        return from_url;
    };

    let mut plain = None;
    let mut extended = None;
    for param in header.split(';').skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "filename" => plain = Some(value.to_string()),
            "filename*" => {
                // charset'language'percent-encoded-value
                let encoded = value.splitn(3, '\'').nth(2).unwrap_or(value);
                extended = Some(
                    percent_encoding::percent_decode_str(encoded)
                        .decode_utf8_lossy()
                        .into_owned(),
                );
            }
            _ => {}
        }
    }

    extended
        .or(plain)
        .filter(|name| !name.is_empty())
        .unwrap_or(from_url)
}

/// Verify the sha256 of `archive`
pub fn check_checksum(archive: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(archive)
        .map_err(|e| Error::io(format!("Failed to hash {}", archive.display()), e))?;
    if actual != expected {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Strip a known archive extension from a file name
pub fn trim_archive_extension(tarballname: &str) -> &str {
    ARCHIVE_EXTENSIONS
        .iter()
        .find_map(|ext| tarballname.strip_suffix(ext))
        .unwrap_or(tarballname)
}

/// Extract an archive to a destination directory
///
/// Supports: .tar.gz, .tgz, .tar.xz, .txz, .tar.bz2, .tbz2, .tar.zst, .tar, .zip
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let filename = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    fs::create_dir_all(dest)?;

    if filename.ends_with(".zip") {
        return unpack_zip_archive(archive, dest);
    }
    if filename.ends_with(".tar.bz2") || filename.ends_with(".tbz2") {
        return unpack_with_system_tar(archive, dest);
    }

    let file = File::open(archive)
        .map_err(|e| Error::io(format!("Failed to open {}", archive.display()), e))?;
    let reader: Box<dyn Read> = if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        Box::new(GzDecoder::new(file))
    } else if filename.ends_with(".tar.xz") || filename.ends_with(".txz") {
        Box::new(XzDecoder::new(file))
    } else if filename.ends_with(".tar.zst") {
        Box::new(
            zstd::Decoder::new(file)
                .map_err(|e| Error::io("Failed to create zstd decoder", e))?,
        )
    } else if filename.ends_with(".tar") {
        Box::new(file)
    } else {
        return Err(Error::ParseError(format!(
            "Unknown archive format: {}",
            filename
        )));
    };

    let mut tar = Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.set_preserve_mtime(true);
    tar.set_overwrite(true);
    tar.unpack(dest)
        .map_err(|e| Error::io(format!("Failed to extract {}", archive.display()), e))
}

fn unpack_with_system_tar(archive: &Path, dest: &Path) -> Result<()> {
    let output = Command::new("tar")
        .arg("-xjf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()
        .map_err(|e| Error::io("tar failed", e))?;

    if !output.status.success() {
        return Err(Error::IoError(format!(
            "Failed to extract archive: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// Apply a patch to the source directory with `patch -p1 --binary`
pub fn apply_patch(source_dir: &Path, patch_path: &Path) -> Result<(String, String)> {
    let output = Command::new("patch")
        .args(["-p1", "--binary", "--verbose", "-i"])
        .arg(patch_path)
        .current_dir(source_dir)
        .output()
        .map_err(|e| Error::io("patch failed", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(Error::CommandFailed {
            phase: format!("Patch {}", patch_path.display()),
            code: output.status.code(),
            stdout,
            stderr,
        });
    }

    Ok((stdout, stderr))
}

/// Recursively copy `src` into `dst`, merging with existing content
///
/// `skip` is called with each source directory and entry file name; entries
/// for which it returns true are not copied.
pub fn copy_tree<F>(src: &Path, dst: &Path, skip: F) -> Result<()>
where
    F: Fn(&Path, &str) -> bool + Copy,
{
    fs::create_dir_all(dst)
        .map_err(|e| Error::io(format!("Failed to create {}", dst.display()), e))?;

    for entry in fs::read_dir(src)
        .map_err(|e| Error::io(format!("Failed to read {}", src.display()), e))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if skip(src, &name) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&from, &to, skip)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            if to.symlink_metadata().is_ok() {
                fs::remove_file(&to)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &to)?;
            #[cfg(not(unix))]
            fs::copy(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| {
                Error::io(format!("Failed to copy {} to {}", from.display(), to.display()), e)
            })?;
        }
    }
    Ok(())
}

/// Remove a directory tree, retrying briefly on transient failures
pub fn remove_dir_all_retrying(path: &Path) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(Error::io(format!("Failed to remove {}", path.display()), e));
                }
                debug!("Removing {} failed: {}, retrying...", path.display(), e);
                std::thread::sleep(Duration::from_millis(100 * attempt as u64));
            }
        }
    }
}
