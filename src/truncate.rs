use std::io::{Read, Seek, SeekFrom};

use nom::{
    bytes::complete::take,
    combinator::map,
    sequence::tuple,
    Finish,
};

use crate::{
    block::LogBlock,
    control::MetadataBlockType,
    error::{ClfsError, Result},
    lsn::Lsn,
    parse_utils::{t_lsn, t_u16, t_u32, t_u64, t_u8},
    DeSerialise,
};

/// CLFS_TRUNCATE_RECORD_HEADER plus the offset at which the next record
/// in the scratch block begins. Truncate records have not been observed
/// in the wild yet; the header and the chain arithmetic are exposed for
/// forward compatibility.
#[derive(Debug)]
pub struct TruncateRecord {
    pub block_type: MetadataBlockType,

    pub dump_count: u64,
    pub client_change_offset: u32,
    pub owner_page_offset: u32,

    /// Offset of the data following this record, relative to the block
    /// start: the fixed header size when no client change is recorded,
    /// the client change offset otherwise.
    pub next_offset: u64,
}

impl TruncateRecord {
    const HEADER_SIZE: usize = 16;

    pub fn read<T>(fh: &mut T, offset: u64, block_type: MetadataBlockType) -> Result<Self>
    where
        T: Read + Seek,
    {
        let block = LogBlock::read(fh, offset)?;

        let record_offset = block.header.record_offsets[0] as u64;
        let mut reader = block.open();
        reader.seek(SeekFrom::Start(record_offset))?;

        let mut buffer = [0; TruncateRecord::HEADER_SIZE];
        reader
            .read_exact(&mut buffer)
            .map_err(|_| ClfsError::InvalidRecordBlock("invalid truncate record, possibly corrupt/empty"))?;

        let (_, (dump_count, client_change_offset, owner_page_offset)) =
            tuple((t_u64, t_u32, t_u32))(&buffer).finish()?;

        let next_offset = if client_change_offset == 0 {
            record_offset + TruncateRecord::HEADER_SIZE as u64
        } else {
            record_offset + client_change_offset as u64
        };

        Ok(TruncateRecord {
            block_type,
            dump_count,
            client_change_offset,
            owner_page_offset,
            next_offset,
        })
    }
}

/// CLFS_TRUNCATE_CLIENT_CHANGE: one client's pending truncation, trailed
/// by the sector images being saved. Not consumed by anything downstream.
#[derive(Debug)]
pub struct TruncateClientChange {
    pub client_id: u8,
    pub lsn: Lsn,
    pub lsn_client: Lsn,
    pub lsn_restart: Lsn,
    pub length: u16,
    pub old_length: u16,
    pub sectors: Vec<SectorChange>,
}

impl TruncateClientChange {
    // Fixed part, up to the variable sector array.
    const FIXED_SIZE: usize = 33;
}

impl<T> DeSerialise<T> for TruncateClientChange {
    type Item = TruncateClientChange;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek,
    {
        let mut buffer = [0; TruncateClientChange::FIXED_SIZE];
        reader.read_exact(&mut buffer)?;

        let (_, (client_id, lsn, lsn_client, lsn_restart, length, old_length, sector_count)) =
            tuple((t_u8, t_lsn, t_lsn, t_lsn, t_u16, t_u16, t_u32))(&buffer).finish()?;

        let mut sectors = Vec::with_capacity(sector_count as usize);
        for _ in 0..sector_count {
            sectors.push(SectorChange::deserialize(reader)?);
        }

        Ok(TruncateClientChange {
            client_id,
            lsn,
            lsn_client,
            lsn_restart,
            length,
            old_length,
            sectors,
        })
    }
}

/// CLFS_SECTOR_CHANGE, a saved 512-byte sector image.
#[derive(Debug)]
pub struct SectorChange {
    pub initialized_sector: u32,
    pub sector: Vec<u8>,
}

impl SectorChange {
    const SIZE: usize = 520;
}

impl<T> DeSerialise<T> for SectorChange {
    type Item = SectorChange;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek,
    {
        let mut buffer = [0; SectorChange::SIZE];
        reader.read_exact(&mut buffer)?;

        let (_, change) = map(
            tuple((t_u32, t_u32, take(512usize))),
            |(initialized_sector, _unused, sector): (u32, u32, &[u8])| SectorChange {
                initialized_sector,
                sector: sector.to_vec(),
            },
        )(&buffer)
        .finish()?;
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use crate::fixtures::truncate_block;

    use super::*;

    #[test]
    fn next_offset_uses_fixed_header_size_without_client_change() {
        let mut fh = Cursor::new(truncate_block(0));

        let record = TruncateRecord::read(&mut fh, 0, MetadataBlockType::Scratch).unwrap();

        assert_eq!(0x3, record.dump_count);
        assert_eq!(0, record.client_change_offset);
        assert_eq!(0x70 + 0x10, record.next_offset);
    }

    #[test]
    fn next_offset_follows_client_change_offset() {
        let mut fh = Cursor::new(truncate_block(0x40));

        let record = TruncateRecord::read(&mut fh, 0, MetadataBlockType::Scratch).unwrap();

        assert_eq!(0x40, record.client_change_offset);
        assert_eq!(0x70 + 0x40, record.next_offset);
    }

    #[test]
    fn parse_client_change_with_one_sector() {
        let mut bytes = Vec::new();
        bytes.push(0x02); // client id
        bytes.extend_from_slice(&0x100u64.to_le_bytes());
        bytes.extend_from_slice(&0x200u64.to_le_bytes());
        bytes.extend_from_slice(&0x300u64.to_le_bytes());
        bytes.extend_from_slice(&8u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        // One sector change
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&[0xEE; 512]);

        let mut reader = Cursor::new(bytes);
        let change = TruncateClientChange::deserialize(&mut reader).unwrap();

        assert_eq!(0x02, change.client_id);
        assert_eq!(0x100, change.lsn.physical_offset());
        assert_eq!(8, change.length);
        assert_eq!(16, change.old_length);
        assert_eq!(1, change.sectors.len());
        assert_eq!(7, change.sectors[0].initialized_sector);
        assert_eq!(vec![0xEE; 512], change.sectors[0].sector);
    }

    #[test]
    fn truncated_client_change_is_io_error() {
        let mut reader = Cursor::new(vec![0u8; 10]);

        let err = TruncateClientChange::deserialize(&mut reader).unwrap_err();

        assert!(matches!(err, ClfsError::Io(_)));
    }
}
