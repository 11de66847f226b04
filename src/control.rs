use std::io::{Read, Seek, SeekFrom};

use nom::{
    bytes::complete::take,
    combinator::map,
    sequence::tuple,
    Finish, IResult,
};

use crate::{
    block::LogBlock,
    error::{ClfsError, ClfsParseError, Result},
    lsn::Lsn,
    parse_utils::{t_lsn, t_u16, t_u32, t_u64, t_u8},
    signatures::CONTROL_RECORD_MAGIC,
    DeSerialise,
};

/// CLFS_METADATA_BLOCK_TYPE. Odd values are shadow copies carrying the
/// state of the previous transaction on the paired even block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBlockType {
    Control,
    ControlShadow,
    General,
    GeneralShadow,
    Scratch,
    ScratchShadow,
    Unknown(u32),
}

impl From<u32> for MetadataBlockType {
    fn from(value: u32) -> Self {
        match value {
            0 => MetadataBlockType::Control,
            1 => MetadataBlockType::ControlShadow,
            2 => MetadataBlockType::General,
            3 => MetadataBlockType::GeneralShadow,
            4 => MetadataBlockType::Scratch,
            5 => MetadataBlockType::ScratchShadow,
            other => MetadataBlockType::Unknown(other),
        }
    }
}

/// One entry of the control record's block table: where a metadata block
/// lives within the BLF and what kind of block it is.
#[derive(Debug, Clone, Copy)]
pub struct MetadataBlock {
    // Size of the block image in bytes.
    pub image_size: u32,

    // Absolute offset of the log block within the BLF.
    pub offset: u32,

    pub block_type: MetadataBlockType,
}

impl MetadataBlock {
    const SIZE: usize = 24;
}

impl<T> DeSerialise<T> for MetadataBlock {
    type Item = MetadataBlock;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek,
    {
        let mut buffer = [0; MetadataBlock::SIZE];
        reader.read_exact(&mut buffer)?;

        // The leading quadword is the in-memory image pointer overlaid with
        // an alignment field; only the on-disk size/offset/type matter here.
        let (_, entry) = map(
            tuple((t_u64, t_u32, t_u32, t_u32, t_u32)),
            |(_alignment, image_size, offset, block_type, _padding)| MetadataBlock {
                image_size,
                offset,
                block_type: MetadataBlockType::from(block_type),
            },
        )(&buffer)
        .finish()?;
        Ok(entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendState {
    None,
    ExtendingFsd,
    FlushingBlock,
    Unknown(u32),
}

impl From<u32> for ExtendState {
    fn from(value: u32) -> Self {
        match value {
            0 => ExtendState::None,
            1 => ExtendState::ExtendingFsd,
            2 => ExtendState::FlushingBlock,
            other => ExtendState::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateState {
    None,
    ModifyingStream,
    SavingOwner,
    ModifyingOwner,
    SavingDiscardBlock,
    ModifyingDiscardBlock,
    Unknown(u32),
}

impl From<u32> for TruncateState {
    fn from(value: u32) -> Self {
        match value {
            0 => TruncateState::None,
            1 => TruncateState::ModifyingStream,
            2 => TruncateState::SavingOwner,
            3 => TruncateState::ModifyingOwner,
            4 => TruncateState::SavingDiscardBlock,
            5 => TruncateState::ModifyingDiscardBlock,
            other => TruncateState::Unknown(other),
        }
    }
}

/// CLFS_TRUNCATE_CONTEXT, the in-flight truncate state machine embedded in
/// the control record. Opaque to downstream consumers, kept for inspection.
#[derive(Debug, Clone, Copy)]
pub struct TruncateContext {
    pub truncate_state: TruncateState,
    pub clients: u8,
    pub client: u8,
    pub lsn_owner_page: Lsn,
    pub lsn_last_owner_page: Lsn,
    pub invalid_sector: u64,
}

fn t_truncate_context(buffer: &[u8]) -> IResult<&[u8], TruncateContext, ClfsParseError<&[u8]>> {
    map(
        tuple((t_u32, t_u8, t_u8, t_u16, t_lsn, t_lsn, t_u64)),
        |(truncate_state, clients, client, _truncate_field, lsn_owner_page, lsn_last_owner_page, invalid_sector)| {
            TruncateContext {
                truncate_state: TruncateState::from(truncate_state),
                clients,
                client,
                lsn_owner_page,
                lsn_last_owner_page,
                invalid_sector,
            }
        },
    )(buffer)
}

/// CLFS_CONTROL_RECORD, the record stored in the block at offset 0 of a
/// BLF. It carries the magic value used to validate the file and the table
/// locating every other metadata block within the BLF.
#[derive(Debug)]
pub struct ControlRecord {
    pub block_type: MetadataBlockType,

    pub dump_count: u64,
    pub magic: u64,
    pub version: u8,
    pub extend_state: ExtendState,
    pub extend_block: u16,
    pub flush_block: u16,
    pub new_block_sectors: u32,
    pub extend_start_sectors: u32,
    pub extend_sectors: u32,
    pub truncate: TruncateContext,
    pub rg_blocks: Vec<MetadataBlock>,
}

impl ControlRecord {
    // Fixed part of CLFS_CONTROL_RECORD, up to the variable block table.
    const FIXED_SIZE: usize = 80;

    pub fn read<T>(fh: &mut T, offset: u64, block_type: MetadataBlockType) -> Result<Self>
    where
        T: Read + Seek,
    {
        let block = LogBlock::read(fh, offset)?;

        let record_offset = block.header.record_offsets[0];
        let mut reader = block.open();
        reader.seek(SeekFrom::Start(record_offset as u64))?;

        Self::parse(&mut reader, block_type)
            .map_err(|e| e.or_record_block("invalid control record, possibly corrupt/empty"))
    }

    fn parse<T>(reader: &mut T, block_type: MetadataBlockType) -> Result<Self>
    where
        T: Read + Seek,
    {
        let mut buffer = [0; ControlRecord::FIXED_SIZE];
        reader.read_exact(&mut buffer)?;

        let (_, (dump_count, magic, version, extend, sectors, truncate, blocks)) = map(
            tuple((
                t_u64,
                t_u64,
                t_u8,
                take(3usize),
                tuple((t_u32, t_u16, t_u16)),
                tuple((t_u32, t_u32, t_u32)),
                t_truncate_context,
                t_u32,
                t_u32,
            )),
            |(dump_count, magic, version, _reserved, extend, sectors, truncate, blocks, _)| {
                (dump_count, magic, version, extend, sectors, truncate, blocks)
            },
        )(&buffer)
        .finish()?;

        let mut rg_blocks = Vec::with_capacity(blocks as usize);
        for _ in 0..blocks {
            rg_blocks.push(MetadataBlock::deserialize(reader)?);
        }

        Ok(ControlRecord {
            block_type,
            dump_count,
            magic,
            version,
            extend_state: ExtendState::from(extend.0),
            extend_block: extend.1,
            flush_block: extend.2,
            new_block_sectors: sectors.0,
            extend_start_sectors: sectors.1,
            extend_sectors: sectors.2,
            truncate,
            rg_blocks,
        })
    }

    /// Whether the record carries the CLFS control record magic.
    pub fn valid(&self) -> bool {
        self.magic == CONTROL_RECORD_MAGIC
    }

    pub fn blocks(&self) -> &[MetadataBlock] {
        &self.rg_blocks
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use crate::fixtures::control_record_blf;

    use super::*;

    #[test]
    fn parse_control_record() {
        let mut fh = Cursor::new(control_record_blf());

        let record = ControlRecord::read(&mut fh, 0, MetadataBlockType::Control).unwrap();

        assert_eq!(0x1, record.dump_count);
        assert_eq!(0xC1F5C1F500005F1C, record.magic);
        assert_eq!(0x1, record.version);
        assert_eq!(ExtendState::None, record.extend_state);
        assert_eq!(0x0, record.extend_block);
        assert_eq!(0x0, record.flush_block);
        assert_eq!(0x0, record.new_block_sectors);
        assert_eq!(0x0, record.extend_start_sectors);
        assert_eq!(0x0, record.extend_sectors);
        assert_eq!(TruncateState::None, record.truncate.truncate_state);
        assert_eq!(6, record.blocks().len());
        assert!(record.valid());
    }

    #[test]
    fn block_table_types_and_offsets() {
        let mut fh = Cursor::new(control_record_blf());

        let record = ControlRecord::read(&mut fh, 0, MetadataBlockType::Control).unwrap();
        let blocks = record.blocks();

        assert_eq!(MetadataBlockType::Control, blocks[0].block_type);
        assert_eq!(MetadataBlockType::ControlShadow, blocks[1].block_type);
        assert_eq!(MetadataBlockType::General, blocks[2].block_type);
        assert_eq!(MetadataBlockType::GeneralShadow, blocks[3].block_type);
        assert_eq!(MetadataBlockType::Scratch, blocks[4].block_type);
        assert_eq!(MetadataBlockType::ScratchShadow, blocks[5].block_type);
        assert_eq!(0, blocks[0].offset);
    }

    #[test]
    fn unknown_block_type_keeps_value() {
        assert_eq!(MetadataBlockType::Unknown(42), MetadataBlockType::from(42));
    }
}
