use std::io::Read;

use nom::{
    bytes::complete::take,
    combinator::{map, map_res},
    number::complete::{le_u16, le_u32, le_u64, le_u8},
    sequence::tuple,
    IResult,
};
use uuid::{Builder, Uuid};

use crate::{
    error::{ClfsError, ClfsParseError},
    lsn::Lsn,
    signatures::{NodeId, NodeType},
};

/// Symbol names are NUL-terminated with no stored length; never read more
/// than this many bytes of name from a (possibly corrupt) block.
pub const MAX_SYMBOL_NAME_BYTES: usize = 1024;

pub fn t_u8(buffer: &[u8]) -> IResult<&[u8], u8, ClfsParseError<&[u8]>> {
    le_u8(buffer)
}

pub fn t_u16(buffer: &[u8]) -> IResult<&[u8], u16, ClfsParseError<&[u8]>> {
    le_u16(buffer)
}

pub fn t_u32(buffer: &[u8]) -> IResult<&[u8], u32, ClfsParseError<&[u8]>> {
    le_u32(buffer)
}

pub fn t_u64(buffer: &[u8]) -> IResult<&[u8], u64, ClfsParseError<&[u8]>> {
    le_u64(buffer)
}

pub fn t_lsn(buffer: &[u8]) -> IResult<&[u8], Lsn, ClfsParseError<&[u8]>> {
    map(le_u64, Lsn)(buffer)
}

pub fn t_node_type(buffer: &[u8]) -> IResult<&[u8], NodeType, ClfsParseError<&[u8]>> {
    map(le_u32, NodeType::from)(buffer)
}

pub fn t_node_id(buffer: &[u8]) -> IResult<&[u8], NodeId, ClfsParseError<&[u8]>> {
    map(tuple((t_node_type, le_u32)), |(node_type, node)| NodeId {
        node_type,
        node,
    })(buffer)
}

pub fn t_guid(buffer: &[u8]) -> IResult<&[u8], Uuid, ClfsParseError<&[u8]>> {
    map_res(take(16usize), |bytes: &[u8]| {
        Ok::<Uuid, uuid::Error>(Builder::from_slice_le(bytes)?.into_uuid())
    })(buffer)
}

/// Read a UTF-16LE string two bytes at a time until a NUL terminator.
///
/// The on-disk format does not store the name length anywhere, so the read
/// is bounded by [`MAX_SYMBOL_NAME_BYTES`] to keep corrupt input from
/// walking the whole block.
pub fn read_utf16z<T>(reader: &mut T) -> Result<String, ClfsError>
where
    T: Read,
{
    let mut units = Vec::new();
    loop {
        let mut pair = [0u8; 2];
        reader.read_exact(&mut pair)?;
        let unit = u16::from_le_bytes(pair);
        if unit == 0 {
            break;
        }
        units.push(unit);
        if units.len() * 2 >= MAX_SYMBOL_NAME_BYTES {
            return Err(ClfsError::InvalidSymbolTable(format!(
                "symbol name exceeds {MAX_SYMBOL_NAME_BYTES} bytes without a terminator"
            )));
        }
    }

    String::from_utf16(&units)
        .map_err(|_| ClfsError::InvalidSymbolTable("symbol name is not valid UTF-16".to_string()))
}
