//! Per-layer table of contents (ztoc).
//!
//! A ztoc lists every entry of a layer's tar stream with its offset in the
//! uncompressed archive, which is what lets a lazy-loading snapshotter fetch
//! a single file without downloading the whole layer.

use std::io::Read;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use soci_builder_core::error::{BuilderError, Result};
use tar::{Archive, EntryType};

use crate::oci::descriptor::{
    MEDIA_TYPE_DOCKER_LAYER_GZIP, MEDIA_TYPE_OCI_LAYER, MEDIA_TYPE_OCI_LAYER_GZIP,
};

pub const ZTOC_VERSION: &str = "0.9";

/// Compression of a layer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerCompression {
    Gzip,
    None,
}

impl LayerCompression {
    /// Compression for a layer media type, `None` if ztocs cannot be built for it.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            MEDIA_TYPE_DOCKER_LAYER_GZIP | MEDIA_TYPE_OCI_LAYER_GZIP => Some(Self::Gzip),
            MEDIA_TYPE_OCI_LAYER => Some(Self::None),
            _ => None,
        }
    }
}

/// One tar entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub uncompressed_offset: u64,
    pub uncompressed_size: u64,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ztoc {
    pub version: String,
    pub build_tool: String,
    pub compression: LayerCompression,
    pub compressed_archive_size: u64,
    pub uncompressed_archive_size: u64,
    pub toc: Vec<FileMetadata>,
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Build the ztoc of a layer blob, reading it once from `layer`.
pub fn build_ztoc<R: Read>(layer: R, compression: LayerCompression) -> Result<Ztoc> {
    let mut compressed = CountingReader {
        inner: layer,
        count: 0,
    };
    let (toc, uncompressed_archive_size) = match compression {
        LayerCompression::Gzip => scan_archive(GzDecoder::new(&mut compressed))?,
        LayerCompression::None => scan_archive(&mut compressed)?,
    };
    // Bytes past the end of the gzip member still belong to the blob
    std::io::copy(&mut compressed, &mut std::io::sink()).map_err(tar_error)?;

    Ok(Ztoc {
        version: ZTOC_VERSION.to_string(),
        build_tool: format!("soci-builder {}", soci_builder_core::VERSION),
        compression,
        compressed_archive_size: compressed.count,
        uncompressed_archive_size,
        toc,
    })
}

/// Walk a tar stream, returning its entries and its total size.
fn scan_archive<R: Read>(reader: R) -> Result<(Vec<FileMetadata>, u64)> {
    let mut counting = CountingReader {
        inner: reader,
        count: 0,
    };

    let toc = {
        let mut archive = Archive::new(&mut counting);
        let entries = archive.entries().map_err(tar_error)?;

        let mut toc = Vec::new();
        for entry in entries {
            let entry = entry.map_err(tar_error)?;
            let header = entry.header();
            let link_name = entry
                .link_name()
                .map_err(tar_error)?
                .map(|l| l.to_string_lossy().into_owned());

            toc.push(FileMetadata {
                name: entry.path().map_err(tar_error)?.to_string_lossy().into_owned(),
                entry_type: entry_type_name(header.entry_type()).to_string(),
                uncompressed_offset: entry.raw_file_position(),
                uncompressed_size: entry.size(),
                mode: header.mode().unwrap_or(0),
                link_name,
            });
        }
        toc
    };

    // Trailing padding and end-of-archive blocks count towards the archive size
    std::io::copy(&mut counting, &mut std::io::sink()).map_err(tar_error)?;
    Ok((toc, counting.count))
}

fn tar_error(e: std::io::Error) -> BuilderError {
    BuilderError::BuildError(format!("Failed to read layer archive: {}", e))
}

fn entry_type_name(entry_type: EntryType) -> &'static str {
    match entry_type {
        EntryType::Regular | EntryType::Continuous => "reg",
        EntryType::Directory => "dir",
        EntryType::Symlink => "symlink",
        EntryType::Link => "hardlink",
        EntryType::Char => "char",
        EntryType::Block => "block",
        EntryType::Fifo => "fifo",
        _ => "other",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    pub(crate) fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn gzip_layer(files: &[(&str, &[u8])]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes(files)).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_compression_from_media_type() {
        assert_eq!(
            LayerCompression::from_media_type(MEDIA_TYPE_OCI_LAYER_GZIP),
            Some(LayerCompression::Gzip)
        );
        assert_eq!(
            LayerCompression::from_media_type(MEDIA_TYPE_DOCKER_LAYER_GZIP),
            Some(LayerCompression::Gzip)
        );
        assert_eq!(
            LayerCompression::from_media_type(MEDIA_TYPE_OCI_LAYER),
            Some(LayerCompression::None)
        );
        assert_eq!(
            LayerCompression::from_media_type("application/vnd.oci.image.layer.v1.tar+zstd"),
            None
        );
    }

    #[test]
    fn test_ztoc_of_gzip_layer() {
        let layer = gzip_layer(&[
            ("etc/hosts", &b"127.0.0.1 localhost\n"[..]),
            ("bin/app", &b"\x7fELF"[..]),
        ]);
        let ztoc = build_ztoc(&layer[..], LayerCompression::Gzip).unwrap();

        assert_eq!(ztoc.version, ZTOC_VERSION);
        assert_eq!(ztoc.compression, LayerCompression::Gzip);
        assert_eq!(ztoc.compressed_archive_size, layer.len() as u64);
        assert_eq!(ztoc.toc.len(), 2);

        let hosts = &ztoc.toc[0];
        assert_eq!(hosts.name, "etc/hosts");
        assert_eq!(hosts.entry_type, "reg");
        assert_eq!(hosts.uncompressed_size, 20);
        assert_eq!(hosts.mode, 0o644);
        // Content starts after the 512-byte header
        assert_eq!(hosts.uncompressed_offset, 512);
    }

    #[test]
    fn test_offsets_point_at_content() {
        let raw = tar_bytes(&[("a.txt", b"alpha"), ("b.txt", b"bravo")]);
        let ztoc = build_ztoc(&raw[..], LayerCompression::None).unwrap();

        assert_eq!(ztoc.uncompressed_archive_size, raw.len() as u64);
        for (file, expected) in ztoc.toc.iter().zip([&b"alpha"[..], &b"bravo"[..]]) {
            let start = file.uncompressed_offset as usize;
            let end = start + file.uncompressed_size as usize;
            assert_eq!(&raw[start..end], expected);
        }
    }

    #[test]
    fn test_garbage_layer_fails() {
        let garbage = vec![0xffu8; 2048];
        assert!(build_ztoc(&garbage[..], LayerCompression::Gzip).is_err());
    }

    #[test]
    fn test_ztoc_serializes() {
        let ztoc = build_ztoc(tar_bytes(&[("f", b"x")]).as_slice(), LayerCompression::None).unwrap();
        let json = serde_json::to_value(&ztoc).unwrap();
        assert_eq!(json["compression"], "none");
        assert_eq!(json["toc"][0]["type"], "reg");
    }

    #[test]
    fn test_ztoc_streams_from_file() {
        let contents = vec![b'z'; 3 * 1024 * 1024];
        let layer = gzip_layer(&[("big.bin", &contents[..]), ("small", &b"s"[..])]);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), &layer).unwrap();

        let file = std::io::BufReader::new(std::fs::File::open(tmp.path()).unwrap());
        let ztoc = build_ztoc(file, LayerCompression::Gzip).unwrap();

        assert_eq!(ztoc, build_ztoc(&layer[..], LayerCompression::Gzip).unwrap());
        assert_eq!(ztoc.compressed_archive_size, layer.len() as u64);
        assert_eq!(ztoc.toc[0].uncompressed_size, contents.len() as u64);
        assert_eq!(ztoc.toc[1].name, "small");
    }
}
