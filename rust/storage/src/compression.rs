//! Stream compression for batch files. The codec is not a container format:
//! framing stays with the tick codec, the codec only wraps the byte stream.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, Read, Write};
use std::path::Path;

/// Leading magic bytes of a zstd frame.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CompressionCodec {
    None,
    Zstd,
}

impl CompressionCodec {
    /// The filename suffix appended after `.pb` for files written with this
    /// codec.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionCodec::None => "",
            CompressionCodec::Zstd => ".zst",
        }
    }

    /// Detect the codec from a file path. Returns `None` when the extension
    /// is not conclusive and the caller should fall back to magic bytes.
    pub fn from_extension(path: &Path) -> Option<CompressionCodec> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("zst") => Some(CompressionCodec::Zstd),
            Some("pb") | Some("parquet") | Some("json") => Some(CompressionCodec::None),
            _ => None,
        }
    }

    /// Detect the codec from the first bytes of a stream.
    pub fn from_magic(prefix: &[u8]) -> CompressionCodec {
        if prefix.len() >= ZSTD_MAGIC.len() && prefix[..ZSTD_MAGIC.len()] == ZSTD_MAGIC {
            CompressionCodec::Zstd
        } else {
            CompressionCodec::None
        }
    }

    pub fn wrap_writer<W: Write>(&self, writer: W, level: i32) -> std::io::Result<CodecWriter<W>> {
        match self {
            CompressionCodec::None => Ok(CodecWriter::Plain(writer)),
            CompressionCodec::Zstd => Ok(CodecWriter::Zstd(zstd::stream::write::Encoder::new(
                writer, level,
            )?)),
        }
    }

    pub fn wrap_reader<R: BufRead>(&self, reader: R) -> std::io::Result<CodecReader<R>> {
        match self {
            CompressionCodec::None => Ok(CodecReader::Plain(reader)),
            CompressionCodec::Zstd => Ok(CodecReader::Zstd(
                zstd::stream::read::Decoder::with_buffer(reader)?,
            )),
        }
    }
}

/////////////////////////////////////////// CodecWriter ////////////////////////////////////////////

/// Write half of a codec. The zstd encoder buffers a partial frame until
/// [`CodecWriter::finish`]; dropping it without finishing loses data, which
/// is exactly what the temp-file write protocol wants on failure.
pub enum CodecWriter<W: Write> {
    Plain(W),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CodecWriter<W> {
    /// Flush any buffered frame and hand back the underlying writer.
    pub fn finish(self) -> std::io::Result<W> {
        match self {
            CodecWriter::Plain(mut writer) => {
                writer.flush()?;
                Ok(writer)
            }
            CodecWriter::Zstd(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for CodecWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            CodecWriter::Plain(writer) => writer.write(buf),
            CodecWriter::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            CodecWriter::Plain(writer) => writer.flush(),
            CodecWriter::Zstd(encoder) => encoder.flush(),
        }
    }
}

/////////////////////////////////////////// CodecReader ////////////////////////////////////////////

pub enum CodecReader<R: BufRead> {
    Plain(R),
    Zstd(zstd::stream::read::Decoder<'static, R>),
}

impl<R: BufRead> Read for CodecReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            CodecReader::Plain(reader) => reader.read(buf),
            CodecReader::Zstd(decoder) => decoder.read(buf),
        }
    }
}

///////////////////////////////////////////// config ///////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CompressionConfig {
    #[serde(default = "CompressionConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "CompressionConfig::default_codec")]
    pub codec: String,
    #[serde(default = "CompressionConfig::default_level")]
    pub level: i32,
}

impl CompressionConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_codec() -> String {
        "zstd".to_string()
    }

    fn default_level() -> i32 {
        DEFAULT_ZSTD_LEVEL
    }

    pub fn resolve(&self) -> Result<CompressionCodec, UnknownCodecError> {
        if !self.enabled {
            return Ok(CompressionCodec::None);
        }
        match self.codec.as_str() {
            "none" => Ok(CompressionCodec::None),
            "zstd" => Ok(CompressionCodec::Zstd),
            other => Err(UnknownCodecError(other.to_string())),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            enabled: CompressionConfig::default_enabled(),
            codec: CompressionConfig::default_codec(),
            level: CompressionConfig::default_level(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("unknown compression codec '{0}'")]
pub struct UnknownCodecError(pub String);

impl evochora_error::EvochoraError for UnknownCodecError {
    fn code(&self) -> evochora_error::ErrorCodes {
        evochora_error::ErrorCodes::InvalidArgument
    }
}
