//! The tick codec: length-delimited framing plus the four read modes over
//! chunk bytes (full, filtered, header-only, snapshot-only).
//!
//! The filtered and partial parsers walk the protobuf wire format directly
//! so that skipped regions are never materialized. They share tag constants
//! with the prost message definitions in `evochora-types`; the two must stay
//! in lockstep.

use bytes::Buf;
use evochora_error::{ErrorCodes, EvochoraError};
use evochora_types::{
    chunk_tags, tick_data_tags, tick_delta_tags, TickData, TickDataChunk, TickDelta,
};
use prost::encoding::{decode_key, decode_varint, skip_field, DecodeContext, WireType};
use prost::Message;
use std::io::{Read, Write};
use thiserror::Error;

/// Upper bound on a single delimited frame. Anything larger is treated as
/// corruption rather than an allocation request.
pub const MAX_FRAME_LEN: u64 = 1 << 30;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("truncated frame: {0}")]
    TruncatedFrame(String),
    #[error("frame length {0} exceeds the {MAX_FRAME_LEN} byte cap")]
    FrameTooLarge(u64),
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("unexpected wire type for tag {tag}")]
    UnexpectedWireType { tag: u32 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EvochoraError for CodecError {
    fn code(&self) -> ErrorCodes {
        match self {
            CodecError::TruncatedFrame(_) => ErrorCodes::DataLoss,
            CodecError::FrameTooLarge(_) => ErrorCodes::DataLoss,
            CodecError::Decode(_) => ErrorCodes::DataLoss,
            CodecError::UnexpectedWireType { .. } => ErrorCodes::DataLoss,
            CodecError::Io(err) => err.code(),
        }
    }
}

/// Which sub-fields a filtered parse discards at the wire level.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FieldFilter {
    All,
    SkipOrganisms,
    SkipCells,
}

/// The addressing metadata of a chunk, read without touching its payload.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChunkHeader {
    pub first_tick: i64,
    pub last_tick: i64,
    pub tick_count: i64,
}

/// A chunk's raw bytes plus its header, for zero-copy forwarding.
#[derive(Clone, Debug)]
pub struct RawChunk {
    pub first_tick: i64,
    pub last_tick: i64,
    pub tick_count: i64,
    pub bytes: Vec<u8>,
}

///////////////////////////////////////////// framing //////////////////////////////////////////////

/// Write one length-delimited message. Returns the number of bytes written
/// (varint prefix included).
pub fn write_delimited<M: Message>(writer: &mut impl Write, message: &M) -> Result<u64, CodecError> {
    let encoded = message.encode_length_delimited_to_vec();
    writer.write_all(&encoded)?;
    Ok(encoded.len() as u64)
}

/// Read one length-delimited frame. Returns `None` at a clean end of
/// stream; EOF inside the varint or the body is corruption.
pub fn read_delimited_frame(reader: &mut impl Read) -> Result<Option<Vec<u8>>, CodecError> {
    let len = match read_frame_len(reader)? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut frame = vec![0u8; len as usize];
    reader
        .read_exact(&mut frame)
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                CodecError::TruncatedFrame(format!("frame body ended early, wanted {} bytes", len))
            }
            _ => CodecError::Io(err),
        })?;
    Ok(Some(frame))
}

fn read_frame_len(reader: &mut impl Read) -> Result<Option<u64>, CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte)?;
        if n == 0 {
            if shift == 0 {
                return Ok(None);
            }
            return Err(CodecError::TruncatedFrame(
                "stream ended inside a varint length prefix".to_string(),
            ));
        }
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        if shift >= 64 {
            return Err(CodecError::TruncatedFrame(
                "varint length prefix overflows u64".to_string(),
            ));
        }
    }
}

///////////////////////////////////////////// parsing //////////////////////////////////////////////

/// Full parse of one chunk's message bytes.
pub fn parse_chunk(bytes: &[u8]) -> Result<TickDataChunk, CodecError> {
    Ok(TickDataChunk::decode(bytes)?)
}

/// Parse a chunk while discarding filtered fields at the wire level. With
/// `FieldFilter::All` this is a plain full parse.
pub fn parse_chunk_filtered(bytes: &[u8], filter: FieldFilter) -> Result<TickDataChunk, CodecError> {
    if filter == FieldFilter::All {
        return parse_chunk(bytes);
    }
    let mut buf = bytes;
    let mut chunk = TickDataChunk::default();
    let ctx = DecodeContext::default();
    while buf.has_remaining() {
        let (tag, wire_type) = decode_key(&mut buf)?;
        match tag {
            chunk_tags::SIMULATION_RUN_ID => prost::encoding::string::merge(
                wire_type,
                &mut chunk.simulation_run_id,
                &mut buf,
                ctx.clone(),
            )?,
            chunk_tags::FIRST_TICK => {
                prost::encoding::int64::merge(wire_type, &mut chunk.first_tick, &mut buf, ctx.clone())?
            }
            chunk_tags::LAST_TICK => {
                prost::encoding::int64::merge(wire_type, &mut chunk.last_tick, &mut buf, ctx.clone())?
            }
            chunk_tags::TICK_COUNT => {
                prost::encoding::int64::merge(wire_type, &mut chunk.tick_count, &mut buf, ctx.clone())?
            }
            chunk_tags::SNAPSHOT => {
                let sub = take_submessage(tag, wire_type, &mut buf)?;
                chunk.snapshot = Some(parse_tick_data_filtered(sub, filter)?);
            }
            chunk_tags::DELTAS => {
                let sub = take_submessage(tag, wire_type, &mut buf)?;
                chunk.deltas.push(parse_tick_delta_filtered(sub, filter)?);
            }
            _ => skip_field(wire_type, tag, &mut buf, ctx.clone())?,
        }
    }
    Ok(chunk)
}

/// Read only the chunk's addressing fields; everything else is skipped.
pub fn parse_chunk_header(bytes: &[u8]) -> Result<ChunkHeader, CodecError> {
    let mut buf = bytes;
    let mut header = ChunkHeader::default();
    let ctx = DecodeContext::default();
    while buf.has_remaining() {
        let (tag, wire_type) = decode_key(&mut buf)?;
        match tag {
            chunk_tags::FIRST_TICK => {
                prost::encoding::int64::merge(wire_type, &mut header.first_tick, &mut buf, ctx.clone())?
            }
            chunk_tags::LAST_TICK => {
                prost::encoding::int64::merge(wire_type, &mut header.last_tick, &mut buf, ctx.clone())?
            }
            chunk_tags::TICK_COUNT => {
                prost::encoding::int64::merge(wire_type, &mut header.tick_count, &mut buf, ctx.clone())?
            }
            _ => skip_field(wire_type, tag, &mut buf, ctx.clone())?,
        }
    }
    Ok(header)
}

/// Parse metadata and the snapshot; the deltas field is wire-skipped and
/// never materialized.
pub fn parse_chunk_snapshot_only(bytes: &[u8]) -> Result<TickDataChunk, CodecError> {
    let mut buf = bytes;
    let mut chunk = TickDataChunk::default();
    let ctx = DecodeContext::default();
    while buf.has_remaining() {
        let (tag, wire_type) = decode_key(&mut buf)?;
        match tag {
            chunk_tags::SIMULATION_RUN_ID => prost::encoding::string::merge(
                wire_type,
                &mut chunk.simulation_run_id,
                &mut buf,
                ctx.clone(),
            )?,
            chunk_tags::FIRST_TICK => {
                prost::encoding::int64::merge(wire_type, &mut chunk.first_tick, &mut buf, ctx.clone())?
            }
            chunk_tags::LAST_TICK => {
                prost::encoding::int64::merge(wire_type, &mut chunk.last_tick, &mut buf, ctx.clone())?
            }
            chunk_tags::TICK_COUNT => {
                prost::encoding::int64::merge(wire_type, &mut chunk.tick_count, &mut buf, ctx.clone())?
            }
            chunk_tags::SNAPSHOT => {
                let sub = take_submessage(tag, wire_type, &mut buf)?;
                chunk.snapshot = Some(TickData::decode(sub)?);
            }
            _ => skip_field(wire_type, tag, &mut buf, ctx.clone())?,
        }
    }
    Ok(chunk)
}

fn take_submessage<'a>(
    tag: u32,
    wire_type: WireType,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], CodecError> {
    if wire_type != WireType::LengthDelimited {
        return Err(CodecError::UnexpectedWireType { tag });
    }
    let len = decode_varint(buf)? as usize;
    if len > buf.len() {
        return Err(CodecError::TruncatedFrame(format!(
            "submessage for tag {} wants {} bytes, {} remain",
            tag,
            len,
            buf.len()
        )));
    }
    let (sub, rest) = buf.split_at(len);
    *buf = rest;
    Ok(sub)
}

fn parse_tick_data_filtered(bytes: &[u8], filter: FieldFilter) -> Result<TickData, CodecError> {
    let mut buf = bytes;
    let mut tick = TickData::default();
    let ctx = DecodeContext::default();
    while buf.has_remaining() {
        let (tag, wire_type) = decode_key(&mut buf)?;
        match tag {
            tick_data_tags::SIMULATION_RUN_ID => prost::encoding::string::merge(
                wire_type,
                &mut tick.simulation_run_id,
                &mut buf,
                ctx.clone(),
            )?,
            tick_data_tags::TICK_NUMBER => {
                prost::encoding::int64::merge(wire_type, &mut tick.tick_number, &mut buf, ctx.clone())?
            }
            tick_data_tags::CAPTURE_TIME_MS => prost::encoding::int64::merge(
                wire_type,
                &mut tick.capture_time_ms,
                &mut buf,
                ctx.clone(),
            )?,
            tick_data_tags::ORGANISMS if filter == FieldFilter::SkipOrganisms => {
                skip_field(wire_type, tag, &mut buf, ctx.clone())?
            }
            tick_data_tags::ORGANISMS => prost::encoding::message::merge_repeated(
                wire_type,
                &mut tick.organisms,
                &mut buf,
                ctx.clone(),
            )?,
            tick_data_tags::CELL_COLUMNS if filter == FieldFilter::SkipCells => {
                skip_field(wire_type, tag, &mut buf, ctx.clone())?
            }
            tick_data_tags::CELL_COLUMNS => prost::encoding::message::merge(
                wire_type,
                tick.cell_columns.get_or_insert_with(Default::default),
                &mut buf,
                ctx.clone(),
            )?,
            tick_data_tags::RNG_STATE => prost::encoding::bytes::merge(
                wire_type,
                &mut tick.rng_state,
                &mut buf,
                ctx.clone(),
            )?,
            tick_data_tags::PLUGIN_STATES => prost::encoding::message::merge_repeated(
                wire_type,
                &mut tick.plugin_states,
                &mut buf,
                ctx.clone(),
            )?,
            tick_data_tags::TOTAL_ORGANISMS_CREATED => prost::encoding::int64::merge(
                wire_type,
                &mut tick.total_organisms_created,
                &mut buf,
                ctx.clone(),
            )?,
            tick_data_tags::TOTAL_UNIQUE_GENOMES => prost::encoding::int64::merge(
                wire_type,
                &mut tick.total_unique_genomes,
                &mut buf,
                ctx.clone(),
            )?,
            // Accepts both packed and unpacked encodings.
            tick_data_tags::ALL_GENOME_HASHES_EVER_SEEN => prost::encoding::int64::merge_repeated(
                wire_type,
                &mut tick.all_genome_hashes_ever_seen,
                &mut buf,
                ctx.clone(),
            )?,
            _ => skip_field(wire_type, tag, &mut buf, ctx.clone())?,
        }
    }
    Ok(tick)
}

fn parse_tick_delta_filtered(bytes: &[u8], filter: FieldFilter) -> Result<TickDelta, CodecError> {
    let mut buf = bytes;
    let mut delta = TickDelta::default();
    let ctx = DecodeContext::default();
    while buf.has_remaining() {
        let (tag, wire_type) = decode_key(&mut buf)?;
        match tag {
            tick_delta_tags::TICK_NUMBER => {
                prost::encoding::int64::merge(wire_type, &mut delta.tick_number, &mut buf, ctx.clone())?
            }
            tick_delta_tags::CAPTURE_TIME_MS => prost::encoding::int64::merge(
                wire_type,
                &mut delta.capture_time_ms,
                &mut buf,
                ctx.clone(),
            )?,
            tick_delta_tags::DELTA_TYPE => prost::encoding::int32::merge(
                wire_type,
                &mut delta.delta_type,
                &mut buf,
                ctx.clone(),
            )?,
            tick_delta_tags::CHANGED_CELLS if filter == FieldFilter::SkipCells => {
                skip_field(wire_type, tag, &mut buf, ctx.clone())?
            }
            tick_delta_tags::CHANGED_CELLS => prost::encoding::message::merge(
                wire_type,
                delta.changed_cells.get_or_insert_with(Default::default),
                &mut buf,
                ctx.clone(),
            )?,
            tick_delta_tags::ORGANISMS if filter == FieldFilter::SkipOrganisms => {
                skip_field(wire_type, tag, &mut buf, ctx.clone())?
            }
            tick_delta_tags::ORGANISMS => prost::encoding::message::merge_repeated(
                wire_type,
                &mut delta.organisms,
                &mut buf,
                ctx.clone(),
            )?,
            tick_delta_tags::TOTAL_ORGANISMS_CREATED => prost::encoding::int64::merge(
                wire_type,
                &mut delta.total_organisms_created,
                &mut buf,
                ctx.clone(),
            )?,
            tick_delta_tags::RNG_STATE => prost::encoding::bytes::merge(
                wire_type,
                &mut delta.rng_state,
                &mut buf,
                ctx.clone(),
            )?,
            tick_delta_tags::PLUGIN_STATES => prost::encoding::message::merge_repeated(
                wire_type,
                &mut delta.plugin_states,
                &mut buf,
                ctx.clone(),
            )?,
            tick_delta_tags::TOTAL_UNIQUE_GENOMES => prost::encoding::int64::merge(
                wire_type,
                &mut delta.total_unique_genomes,
                &mut buf,
                ctx.clone(),
            )?,
            _ => skip_field(wire_type, tag, &mut buf, ctx.clone())?,
        }
    }
    Ok(delta)
}
