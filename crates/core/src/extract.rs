use std::error::Error as StdError;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tracing::{debug, warn};

use crate::{Error, Result};

pub const ARCHIVE_SUFFIX: &str = ".csv.tar";
pub const PAYLOAD_SUFFIX: &str = ".csv.gz";

const PARTIAL_SUFFIX: &str = ".partial";
const METADATA_MARKERS: [&str; 2] = ["README", "LICENSE"];
const COPY_BUF_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub decompressed_bytes: u64,
    pub output_path: Option<PathBuf>,
    pub metadata_removed: u32,
}

/// Unpacks a downloaded `.csv.tar` next to itself, inflates the `.csv.gz`
/// payload and removes every intermediate. Blocking.
pub fn extract_archive(archive_path: &Path) -> Result<ExtractOutcome> {
    let dir = archive_dir(archive_path);

    unpack_tar(archive_path, &dir)?;
    let scan = scan_extracted(&dir, archive_path)?;
    remove_best_effort(archive_path, "archive");

    let Some(gz_path) = scan.payload else {
        debug!(
            event = "extract.no_payload",
            archive = %archive_path.display(),
            "extract.no_payload"
        );
        return Ok(ExtractOutcome {
            metadata_removed: scan.metadata_removed,
            ..ExtractOutcome::default()
        });
    };

    let csv_path = gz_path.with_extension("");
    let decompressed_bytes = decompress_gzip(&gz_path, &csv_path)?;
    remove_best_effort(&gz_path, "payload.compressed");

    Ok(ExtractOutcome {
        decompressed_bytes,
        output_path: Some(csv_path),
        metadata_removed: scan.metadata_removed,
    })
}

/// Final artifact path for an archive path: `x.csv.tar` -> `x.csv`.
pub fn output_path_for_archive(archive_path: &Path) -> PathBuf {
    archive_path.with_extension("")
}

fn archive_dir(archive_path: &Path) -> PathBuf {
    match archive_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Header and framing errors are `ArchiveCorrupt`. Failures the OS reports
/// while writing below `dest` are `Io`.
fn unpack_tar(archive_path: &Path, dest: &Path) -> Result<()> {
    let corrupt = |e: std::io::Error| Error::ArchiveCorrupt {
        path: archive_path.to_path_buf(),
        message: e.to_string(),
    };

    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    archive.set_overwrite(true);

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        match entry.unpack_in(dest) {
            Ok(true) => {}
            Ok(false) => {
                let member = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
                warn!(
                    event = "extract.unsafe_member",
                    archive = %archive_path.display(),
                    member = %member,
                    "skipping tar member outside the archive directory"
                );
            }
            Err(e) if has_os_cause(&e) => return Err(Error::Io(e)),
            Err(e) => return Err(corrupt(e)),
        }
    }
    Ok(())
}

/// tar wraps OS errors in its own error type; walk the chain to find one.
fn has_os_cause(e: &std::io::Error) -> bool {
    if e.raw_os_error().is_some() {
        return true;
    }
    let mut cause = e
        .get_ref()
        .map(|inner| inner as &(dyn StdError + 'static));
    while let Some(err) = cause {
        if err
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.raw_os_error().is_some())
        {
            return true;
        }
        cause = err.source();
    }
    false
}

struct DirScan {
    payload: Option<PathBuf>,
    metadata_removed: u32,
}

fn scan_extracted(dir: &Path, archive_path: &Path) -> Result<DirScan> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name());
    }
    names.sort();

    let mut payloads = Vec::new();
    let mut metadata_removed = 0u32;
    for name in names {
        let Some(name_str) = name.to_str() else {
            continue;
        };
        let path = dir.join(&name);
        if path == archive_path {
            continue;
        }

        if name_str.ends_with(PAYLOAD_SUFFIX) {
            if path.is_file() {
                payloads.push(path);
            }
        } else if is_metadata_name(name_str) && remove_best_effort(&path, "metadata") {
            metadata_removed += 1;
        }
    }

    if payloads.len() > 1 {
        warn!(
            event = "extract.multiple_payloads",
            dir = %dir.display(),
            count = payloads.len(),
            chosen = %payloads[payloads.len() - 1].display(),
            "more than one payload in archive directory; using the last one"
        );
    }

    Ok(DirScan {
        payload: payloads.pop(),
        metadata_removed,
    })
}

fn is_metadata_name(name: &str) -> bool {
    METADATA_MARKERS.iter().any(|m| name.contains(m))
}

fn decompress_gzip(gz_path: &Path, dest: &Path) -> Result<u64> {
    let partial = partial_path(dest);
    if let Err(e) = inflate_into(gz_path, &partial) {
        remove_best_effort(&partial, "decompress.partial");
        return Err(e);
    }
    fs::rename(&partial, dest)?;
    Ok(fs::metadata(dest)?.len())
}

fn inflate_into(gz_path: &Path, dest: &Path) -> Result<()> {
    let input = File::open(gz_path)?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let mut out = BufWriter::new(File::create(dest)?);

    let mut buf = vec![0u8; COPY_BUF_BYTES];
    loop {
        let n = match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(Error::DecompressionFailed {
                    path: gz_path.to_path_buf(),
                    message: e.to_string(),
                });
            }
        };
        out.write_all(&buf[..n])?;
    }
    out.flush()?;
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}

/// Removes a file, logging instead of failing. Returns whether a file was
/// actually removed.
pub(crate) fn remove_best_effort(path: &Path, what: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(
                event = "extract.cleanup_failed",
                path = %path.display(),
                what,
                error = %e,
                "extract.cleanup_failed"
            );
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use std::path::Path;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    pub fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    pub fn tar_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub fn write_archive(path: &Path, members: &[(&str, &[u8])]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, tar_bytes(members)).unwrap();
    }
}
