use std::io::{Cursor, Read, Seek, SeekFrom};

use nom::{
    combinator::map,
    multi::count,
    sequence::tuple,
    Finish,
};

use crate::{
    error::{ClfsError, Result},
    lsn::Lsn,
    parse_utils::{t_lsn, t_u16, t_u32, t_u8},
    signatures::SECTOR_SIZE,
    DeSerialise,
};

/// CLFS_LOG_BLOCK_HEADER, the 108-byte header at the start of every log
/// block in a BLF or container file.
#[derive(Debug, Clone)]
pub struct LogBlockHeader {
    pub major_version: u8,
    pub minor_version: u8,

    // Length of the fix-up word array, one word per sector.
    pub fixup: u8,
    pub client_id: u8,

    // A block always spans TotalSectors * 512 bytes on disk; ValidSectors
    // counts the sectors that carry meaningful data.
    pub total_sectors: u16,
    pub valid_sectors: u16,

    // Not verified by this parser.
    pub checksum: u32,

    // CLFS_LOG_BLOCK_FLAGS word; blocks at rest normally carry ENCODED,
    // meaning the sector tails still hold fix-up signatures.
    pub flags: u32,

    pub current_lsn: Lsn,
    pub next_lsn: Lsn,

    // Offsets of up to 16 record headers, relative to the block start.
    // Slot 0 is the one every known consumer reads.
    pub record_offsets: Vec<u32>,

    // Offset of the fix-up word array within the block.
    pub fixup_offset: u32,
}

impl LogBlockHeader {
    pub const SIZE: usize = 108;
}

impl<T> DeSerialise<T> for LogBlockHeader {
    type Item = LogBlockHeader;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek,
    {
        let mut buffer = [0; LogBlockHeader::SIZE];
        reader.read_exact(&mut buffer)?;

        let (_, header) = map(
            tuple((
                t_u8,
                t_u8,
                t_u8,
                t_u8,
                t_u16,
                t_u16,
                t_u32,
                t_u32,
                t_u32,
                t_u32,
                t_lsn,
                t_lsn,
                count(t_u32, 16),
                t_u32,
            )),
            |(
                major_version,
                minor_version,
                fixup,
                client_id,
                total_sectors,
                valid_sectors,
                _reserved1,
                checksum,
                flags,
                _reserved2,
                current_lsn,
                next_lsn,
                record_offsets,
                fixup_offset,
            )| {
                LogBlockHeader {
                    major_version,
                    minor_version,
                    fixup,
                    client_id,
                    total_sectors,
                    valid_sectors,
                    checksum,
                    flags,
                    current_lsn,
                    next_lsn,
                    record_offsets,
                    fixup_offset,
                }
            },
        )(&buffer)
        .finish()?;
        Ok(header)
    }
}

/// A log block decoded into memory with its multi-sector fix-up applied.
///
/// On disk the last two bytes of every sector are replaced by a fix-up
/// signature; the true bytes live in the fix-up word array pointed to by
/// the header. Decoding copies word i of that array back over the tail of
/// sector i, restoring the real content.
#[derive(Debug)]
pub struct LogBlock {
    pub offset: u64,
    pub header: LogBlockHeader,
    data: Vec<u8>,
}

impl LogBlock {
    pub fn read<T>(fh: &mut T, offset: u64) -> Result<Self, ClfsError>
    where
        T: Read + Seek,
    {
        fh.seek(SeekFrom::Start(offset))?;
        let header = LogBlockHeader::deserialize(fh)
            .map_err(|e| e.or_record_block("invalid log block header, possibly corrupt/empty"))?;

        let block_length = header.total_sectors as usize * SECTOR_SIZE;
        fh.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0; block_length];
        fh.read_exact(&mut data)
            .map_err(|e| ClfsError::Io(e).or_record_block("log block extends past the end of file"))?;

        let fixup_start = header.fixup_offset as usize;
        let fixup_len = header.total_sectors as usize * 2;
        if fixup_start + fixup_len > data.len() {
            return Err(ClfsError::InvalidRecordBlock(
                "fix-up array extends past the log block",
            ));
        }

        for sector in 0..header.total_sectors as usize {
            let word = fixup_start + sector * 2;
            let tail = (sector + 1) * SECTOR_SIZE - 2;
            data.copy_within(word..word + 2, tail);
        }

        Ok(LogBlock {
            offset,
            header,
            data,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// A seekable view over the decoded block content.
    pub fn open(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use crate::fixtures::{control_record_blf, encode_block};
    use crate::signatures::BLOCK_ENCODED;

    use super::*;

    #[test]
    fn parse_block_header() {
        let mut fh = Cursor::new(control_record_blf());

        let header = LogBlockHeader::deserialize(&mut fh).unwrap();

        assert_eq!(0x15, header.major_version);
        assert_eq!(0x0, header.minor_version);
        assert_eq!(0x1, header.fixup);
        assert_eq!(0x0, header.client_id);
        assert_eq!(0x2, header.total_sectors);
        assert_eq!(0x2, header.valid_sectors);
        assert_eq!(0xC64C824B, header.checksum);
        assert_eq!(BLOCK_ENCODED, header.flags);
        assert_eq!(0xFFFFFFFF00000000, header.current_lsn.physical_offset());
        assert_eq!(0xFFFFFFFF00000000, header.next_lsn.physical_offset());
        assert_eq!(0x70, header.record_offsets[0]);
        assert_eq!(0x3F8, header.fixup_offset);
    }

    #[test]
    fn decoded_block_restores_sector_tails() {
        // Build a two-sector block with a recognizable byte at the tail of
        // each sector, then encode it the way it would sit on disk.
        let mut data = vec![0u8; 1024];
        crate::fixtures::write_block_header(&mut data, 2, 0x70, 0x3F8);
        data[510] = 0xAA;
        data[511] = 0xBB;
        data[1022] = 0xCC;
        data[1023] = 0xDD;
        let encoded = encode_block(data.clone(), 2, 0x3F8);
        assert_ne!(encoded[510..512], data[510..512]);

        let mut fh = Cursor::new(encoded);
        let block = LogBlock::read(&mut fh, 0).unwrap();

        assert_eq!(1024, block.data().len());
        assert_eq!([0xAA, 0xBB], block.data()[510..512]);
        assert_eq!([0xCC, 0xDD], block.data()[1022..1024]);
    }

    #[test]
    fn truncated_header_is_invalid_record_block() {
        let bytes = control_record_blf();
        let mut fh = Cursor::new(&bytes[..0x40]);

        let err = LogBlock::read(&mut fh, 0).unwrap_err();

        assert!(matches!(err, ClfsError::InvalidRecordBlock(_)));
    }

    #[test]
    fn truncated_body_is_invalid_record_block() {
        let bytes = control_record_blf();
        // Header intact, body cut short of TotalSectors * 512.
        let mut fh = Cursor::new(&bytes[..600]);

        let err = LogBlock::read(&mut fh, 0).unwrap_err();

        assert!(matches!(err, ClfsError::InvalidRecordBlock(_)));
    }

    #[test]
    fn fixup_array_out_of_bounds_is_rejected() {
        let mut data = vec![0u8; 1024];
        // FixupOffset points past the end of the two-sector block.
        crate::fixtures::write_block_header(&mut data, 2, 0x70, 0x500);

        let mut fh = Cursor::new(data);
        let err = LogBlock::read(&mut fh, 0).unwrap_err();

        assert!(matches!(err, ClfsError::InvalidRecordBlock(_)));
    }
}
