//! gzip bodies for peers that advertise `callbackcompression`

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub const GZIP_ENCODING: &str = "gzip";

pub fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

pub fn gunzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(body).read_to_end(&mut decoded)?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetitive_json_shrinks() {
        let body = serde_json::to_vec(&vec!["memory"; 500]).unwrap();
        let packed = gzip(&body).unwrap();
        assert!(packed.len() < body.len() / 4);
        assert_eq!(gunzip(&packed).unwrap(), body);
    }

    #[test]
    fn test_gunzip_rejects_plain_bytes() {
        assert!(gunzip(b"{\"not\":\"gzip\"}").is_err());
    }
}
