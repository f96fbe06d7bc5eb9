use std::io::Write;

use flate2::write::{GzDecoder, ZlibDecoder};

use crate::model::ResponseBody;

/// Decoded bytes are checked against the cap after every slice of this size,
/// so a small compressed chunk cannot expand far past the cap unchecked.
const SLICE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Anything other than gzip or deflate passes through undecoded.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("gzip") | Some("x-gzip") => ContentEncoding::Gzip,
            Some("deflate") => ContentEncoding::Deflate,
            _ => ContentEncoding::Identity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// Decoded size went over the cap
    Exceeded { limit: usize },
    Decode(String),
}

enum Decoder {
    Identity(Vec<u8>),
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

impl Decoder {
    fn decoded_len(&self) -> usize {
        match self {
            Decoder::Identity(buf) => buf.len(),
            Decoder::Gzip(decoder) => decoder.get_ref().len(),
            Decoder::Deflate(decoder) => decoder.get_ref().len(),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Decoder::Identity(buf) => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
            Decoder::Gzip(decoder) => decoder.write_all(bytes).and_then(|_| decoder.flush()),
            Decoder::Deflate(decoder) => decoder.write_all(bytes).and_then(|_| decoder.flush()),
        }
    }

    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Decoder::Identity(buf) => Ok(buf),
            Decoder::Gzip(decoder) => decoder.finish(),
            Decoder::Deflate(decoder) => decoder.finish(),
        }
    }
}

/// Collects a response body, decoding as it goes and enforcing the size cap
/// on decoded bytes.
pub struct BodyAccumulator {
    decoder: Decoder,
    limit: usize,
    raw_bytes: usize,
}

impl BodyAccumulator {
    pub fn new(encoding: ContentEncoding, limit: usize) -> Self {
        let decoder = match encoding {
            ContentEncoding::Identity => Decoder::Identity(Vec::new()),
            ContentEncoding::Gzip => Decoder::Gzip(GzDecoder::new(Vec::new())),
            ContentEncoding::Deflate => Decoder::Deflate(ZlibDecoder::new(Vec::new())),
        };
        Self { decoder, limit, raw_bytes: 0 }
    }

    /// Feed one network chunk. Returns the decoded total so far.
    pub fn push(&mut self, chunk: &[u8]) -> Result<usize, BodyError> {
        self.raw_bytes += chunk.len();
        for slice in chunk.chunks(SLICE) {
            self.decoder.write(slice).map_err(|e| BodyError::Decode(e.to_string()))?;
            if self.decoder.decoded_len() > self.limit {
                return Err(BodyError::Exceeded { limit: self.limit });
            }
        }
        Ok(self.decoder.decoded_len())
    }

    pub fn decoded_len(&self) -> usize {
        self.decoder.decoded_len()
    }

    /// Complete decoding at end of stream
    pub fn finish(self) -> Result<Vec<u8>, BodyError> {
        if self.raw_bytes == 0 {
            return Ok(Vec::new());
        }
        let limit = self.limit;
        let bytes = self.decoder.finish().map_err(|e| BodyError::Decode(e.to_string()))?;
        if bytes.len() > limit {
            return Err(BodyError::Exceeded { limit });
        }
        Ok(bytes)
    }
}

/// Decode structured bodies opportunistically; anything else, or JSON that
/// fails to parse, comes back as text.
pub fn parse_body(content_type: Option<&str>, bytes: &[u8]) -> Option<ResponseBody> {
    if bytes.is_empty() {
        return None;
    }
    let is_json = content_type.is_some_and(|value| value.to_ascii_lowercase().contains("json"));
    if is_json {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return Some(ResponseBody::Json(value));
        }
    }
    Some(ResponseBody::Text(String::from_utf8_lossy(bytes).into_owned()))
}
