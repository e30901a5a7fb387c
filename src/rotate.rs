//! Generations of old trace files: `name` → `name.1` → `name.2`.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use lz4_flex::frame::FrameEncoder;
use tracing::debug;

/// Extension of compressed generations.
pub const COMPRESSED_EXT: &str = "lz4";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Every rotation moves `name.1` to `name.2`, dropping the old `name.2`.
    #[default]
    Shift,
    /// `name.1` moves to `name.2` only while no `name.2` exists, so the file
    /// of the very first run survives any number of restarts.
    KeepOldest,
}

pub fn generation(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

pub fn compressed(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", COMPRESSED_EXT));
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Shifts existing generations of `path` out of the way before a new file
/// is created there. With `compress`, the new `name.1` is lz4 framed into
/// `name.1.lz4`.
pub fn rotate(path: &Path, policy: RotationPolicy, compress: bool) -> io::Result<()> {
    let one = generation(path, 1);
    let two = generation(path, 2);
    let (one_z, two_z) = (compressed(&one), compressed(&two));

    if policy == RotationPolicy::Shift || !(two.exists() || two_z.exists()) {
        remove_if_exists(&two)?;
        remove_if_exists(&two_z)?;
        if one_z.exists() {
            fs::rename(&one_z, &two_z)?;
        } else if one.exists() {
            fs::rename(&one, &two)?;
        }
    }
    remove_if_exists(&one_z)?;

    if path.exists() {
        fs::rename(path, &one)?;
        debug!(from = %path.display(), to = %one.display(), "rotated trace file");
        if compress {
            compress_file(&one, &one_z)?;
            fs::remove_file(&one)?;
        }
    }
    Ok(())
}

fn compress_file(from: &Path, to: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(from)?);
    let mut encoder = FrameEncoder::new(BufWriter::new(File::create(to)?));
    io::copy(&mut reader, &mut encoder)?;
    let writer = encoder.finish().map_err(io::Error::other)?;
    writer.into_inner().map_err(|e| e.into_error())?;
    Ok(())
}
