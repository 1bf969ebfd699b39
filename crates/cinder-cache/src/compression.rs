//! Compression of stored blobs.

use cinder_core::cache::Compression;
use cinder_core::{Error, Result};
use std::io::{Read, Write};

const ZSTD_LEVEL: i32 = 3;

pub fn compress(data: &[u8], algorithm: Compression) -> Result<Vec<u8>> {
    match algorithm {
        Compression::None => Ok(data.to_vec()),
        Compression::Zstd => zstd::stream::encode_all(data, ZSTD_LEVEL).map_err(codec("zstd")),
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(codec("gzip"))?;
            encoder.finish().map_err(codec("gzip"))
        }
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
    }
}

pub fn decompress(data: &[u8], algorithm: Compression) -> Result<Vec<u8>> {
    match algorithm {
        Compression::None => Ok(data.to_vec()),
        Compression::Zstd => zstd::stream::decode_all(data).map_err(codec("zstd")),
        Compression::Gzip => {
            let mut output = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut output)
                .map_err(codec("gzip"))?;
            Ok(output)
        }
        Compression::Lz4 => lz4_flex::decompress_size_prepended(data).map_err(codec("lz4")),
    }
}

/// File extension for blobs stored with `algorithm`.
pub fn extension(algorithm: Compression) -> &'static str {
    match algorithm {
        Compression::None => "tar",
        Compression::Zstd => "tar.zst",
        Compression::Gzip => "tar.gz",
        Compression::Lz4 => "tar.lz4",
    }
}

fn codec<E: std::fmt::Display>(name: &'static str) -> impl Fn(E) -> Error {
    move |e| Error::Internal(format!("{name} codec failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_algorithm_restores_input() {
        let data = b"target/debug/deps target/debug/deps target/debug/deps".repeat(20);
        for algorithm in [
            Compression::None,
            Compression::Zstd,
            Compression::Gzip,
            Compression::Lz4,
        ] {
            let packed = compress(&data, algorithm).unwrap();
            assert_eq!(decompress(&packed, algorithm).unwrap(), data, "{algorithm:?}");
        }
    }

    #[test]
    fn test_zstd_shrinks_repetitive_data() {
        let data = vec![b'a'; 4096];
        assert!(compress(&data, Compression::Zstd).unwrap().len() < data.len());
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        assert!(decompress(b"not zstd", Compression::Zstd).is_err());
    }
}
