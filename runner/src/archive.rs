use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::{
    fs::File,
    io,
    path::Path,
};
use tar::{Archive, Builder};

/// suffix of job folder archives in the orphan and hold directories
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Compress the contents of `dir` into an in-memory tar.gz archive.
/// Entries are stored relative to the folder root, so unpacking into an empty
/// directory reproduces the folder contents.
pub fn pack_dir(dir: &Path) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner()?;

    encoder.finish()
}

/// Compress the contents of `dir` into a tar.gz file at `target`.
pub fn pack_dir_to(dir: &Path, target: &Path) -> io::Result<u64> {
    let file = File::create(target)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;

    file.metadata().map(|metadata| metadata.len())
}

/// Expand a tar.gz archive into `target_dir`, creating it if missing.
pub fn unpack_to(payload: &[u8], target_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(target_dir)?;
    Archive::new(GzDecoder::new(payload)).unpack(target_dir)
}

/// Job key encoded in an archive file name, if it carries the expected suffix.
pub fn key_from_archive_name(name: &str) -> Option<&str> {
    name.strip_suffix(ARCHIVE_SUFFIX).filter(|key| !key.is_empty())
}
