use std::io::{Cursor, Read, Seek, SeekFrom};

use nom::{combinator::map, sequence::tuple, Finish};

use crate::{
    block::LogBlock,
    error::{ClfsError, Result},
    lsn::Lsn,
    parse_utils::{t_lsn, t_u16, t_u32},
    DeSerialise,
};

/// Record type bitmask of a container record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordType(pub u32);

impl RecordType {
    pub const NULL: u32 = 0x00;
    pub const DATA: u32 = 0x01;
    pub const RESTART: u32 = 0x02;
    pub const START: u32 = 0x04;
    pub const END: u32 = 0x08;
    pub const CONTINUATION: u32 = 0x10;
    pub const LAST: u32 = 0x20;

    pub fn contains(self, mask: u32) -> bool {
        self.0 & mask != 0
    }
}

/// The record header preceding every record inside a container log block.
///
/// The record bytes sit directly behind the header, so a record spans
/// `data_size - offset` bytes, where `offset` holds the header size.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub lsn_virtual: Lsn,
    pub lsn_undo_next: Lsn,

    // Backwards link: the record written before this one, or zero at the
    // start of the chain.
    pub lsn_previous: Lsn,

    pub data_size: u32,
    pub record_flags: u16,
    pub offset: u16,
    pub record_type: RecordType,
}

impl RecordHeader {
    pub const SIZE: usize = 40;
}

impl<T> DeSerialise<T> for RecordHeader {
    type Item = RecordHeader;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek,
    {
        let mut buffer = [0; RecordHeader::SIZE];
        reader.read_exact(&mut buffer)?;

        let (_, header) = map(
            tuple((t_lsn, t_lsn, t_lsn, t_u32, t_u32, t_u16, t_u16, t_u32)),
            |(
                lsn_virtual,
                lsn_undo_next,
                lsn_previous,
                data_size,
                _unknown,
                record_flags,
                offset,
                record_type,
            )| {
                RecordHeader {
                    lsn_virtual,
                    lsn_undo_next,
                    lsn_previous,
                    data_size,
                    record_flags,
                    offset,
                    record_type: RecordType(record_type),
                }
            },
        )(&buffer)
        .finish()?;
        Ok(header)
    }
}

/// One record pulled out of a container file.
///
/// `record_data` and `block_data` are independent views consumers may
/// correlate: the former is the record itself, the latter the inline data
/// payload of the block the walk passed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Absolute offset of the record header within the container file.
    pub offset: u64,
    pub record_data: Vec<u8>,
    pub block_data: Vec<u8>,
}

/// Walker over the records of one container file, starting from the block
/// offset derived from a stream's physical base LSN.
///
/// Records come out in reverse chronological order: every Start record
/// names its predecessor through `lsn_previous`, and the walk follows that
/// chain backwards until it reaches zero.
#[derive(Debug)]
pub struct Container<T> {
    fh: T,
    offset: u64,
}

impl<T> Container<T>
where
    T: Read + Seek,
{
    pub fn new(fh: T, offset: u64) -> Self {
        Container { fh, offset }
    }

    pub fn records(&mut self) -> Records<'_, T> {
        Records {
            fh: &mut self.fh,
            start_offset: self.offset,
            state: None,
            started: false,
            done: false,
        }
    }
}

// Upper bound on state machine passes between two pulled records. A well
// formed chain needs a handful; a corrupt block that never sets a Start
// bit would otherwise spin forever.
const WALK_BUDGET: usize = 0x1_0000;

struct WalkState {
    log_block_offset: u64,
    buf: Cursor<Vec<u8>>,
    record_offset: u32,
    header: RecordHeader,
    block_data: Vec<u8>,
}

pub struct Records<'a, T> {
    fh: &'a mut T,
    start_offset: u64,
    state: Option<WalkState>,
    started: bool,
    done: bool,
}

impl<T> Records<'_, T>
where
    T: Read + Seek,
{
    fn open_block(fh: &mut T, offset: u64) -> Result<(Cursor<Vec<u8>>, u32)> {
        let block = LogBlock::read(fh, offset)?;
        let record_offset = block.header.record_offsets[0];

        let mut buf = Cursor::new(block.into_data());
        buf.seek(SeekFrom::Start(record_offset as u64))?;
        Ok((buf, record_offset))
    }

    fn advance(&mut self) -> Result<Option<Record>> {
        let mut state = match self.state.take() {
            Some(state) => state,
            None if self.started => return Ok(None),
            None => {
                self.started = true;
                let (mut buf, record_offset) = Self::open_block(self.fh, self.start_offset)?;
                let header = RecordHeader::deserialize(&mut buf)
                    .map_err(|e| e.or_record_block("record header extends past the log block"))?;
                WalkState {
                    log_block_offset: self.start_offset,
                    buf,
                    record_offset,
                    header,
                    block_data: Vec::new(),
                }
            }
        };

        for _ in 0..WALK_BUDGET {
            // The inline data payload of the current block.
            if state.header.record_type.contains(RecordType::DATA) {
                state.block_data =
                    read_record_bytes(&mut state.buf, state.header.data_size, state.header.offset)?;
            }

            // A Start record is followed by the true record header; the
            // record bytes sit right behind that header.
            if state.header.record_type.contains(RecordType::START) {
                let next = RecordHeader::deserialize(&mut state.buf)
                    .map_err(|e| e.or_record_block("record header extends past the log block"))?;
                let record_data = read_record_bytes(&mut state.buf, next.data_size, next.offset)?;

                let record = Record {
                    offset: state.log_block_offset + state.record_offset as u64,
                    record_data,
                    block_data: state.block_data.clone(),
                };

                if next.lsn_previous.physical_offset() != 0 {
                    state.log_block_offset = next.lsn_previous.physical_offset() - 1;
                    state.header = next;
                    self.state = Some(state);
                }
                // A zero previous LSN ends the chain; the state is dropped
                // and the next pull reports exhaustion.
                return Ok(Some(record));
            }

            // End of this block's records: re-read from the block boundary.
            if state.header.record_type.contains(RecordType::LAST) {
                let (buf, record_offset) = Self::open_block(self.fh, state.log_block_offset)?;
                state.buf = buf;
                state.record_offset = record_offset;
                state.header = RecordHeader::deserialize(&mut state.buf)
                    .map_err(|e| e.or_record_block("record header extends past the log block"))?;
            }
        }

        Err(ClfsError::InvalidRecordBlock(
            "record chain did not terminate",
        ))
    }
}

fn read_record_bytes(
    buf: &mut Cursor<Vec<u8>>,
    data_size: u32,
    header_size: u16,
) -> Result<Vec<u8>> {
    let length = data_size
        .checked_sub(header_size as u32)
        .ok_or(ClfsError::InvalidRecordBlock(
            "record data size smaller than its header size",
        ))?;

    let mut data = vec![0; length as usize];
    buf.read_exact(&mut data)
        .map_err(|_| ClfsError::InvalidRecordBlock("record data extends past the log block"))?;
    Ok(data)
}

impl<T> Iterator for Records<'_, T>
where
    T: Read + Seek,
{
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use crate::fixtures::{container_file, null_record_container, CONTAINER_WALK_START};

    use super::*;

    #[test]
    fn walks_the_chain_in_reverse_order() {
        let mut container =
            Container::new(Cursor::new(container_file()), CONTAINER_WALK_START);

        let records: Vec<_> = container
            .records()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(2, records.len());

        // Newest first: the chain runs backwards through the file.
        assert_eq!(1024 + 0x70, records[0].offset);
        assert_eq!(0x70, records[1].offset);
        assert!(records[0].offset > records[1].offset);

        assert_eq!(vec![0xB1; 32], records[0].record_data);
        assert_eq!(vec![0xB0; 72], records[0].block_data);
        assert_eq!(vec![0xA1; 32], records[1].record_data);
        assert_eq!(vec![0xA0; 72], records[1].block_data);
    }

    #[test]
    fn iterator_is_fused_after_the_chain_ends() {
        let mut container =
            Container::new(Cursor::new(container_file()), CONTAINER_WALK_START);

        let mut records = container.records();
        assert!(records.next().unwrap().is_ok());
        assert!(records.next().unwrap().is_ok());
        assert!(records.next().is_none());
        assert!(records.next().is_none());
    }

    #[test]
    fn record_header_fields() {
        let bytes = container_file();
        let mut reader = Cursor::new(&bytes[CONTAINER_WALK_START as usize + 0x70..]);

        let header = RecordHeader::deserialize(&mut reader).unwrap();

        assert_eq!(0x70, header.data_size);
        assert_eq!(RecordHeader::SIZE as u16, header.offset);
        assert!(header.record_type.contains(RecordType::DATA));
        assert!(header.record_type.contains(RecordType::START));
        assert!(!header.record_type.contains(RecordType::LAST));
    }

    #[test]
    fn walk_from_empty_file_is_invalid_record_block() {
        let mut container = Container::new(Cursor::new(Vec::new()), 0);

        let err = container.records().next().unwrap().unwrap_err();

        assert!(matches!(err, ClfsError::InvalidRecordBlock(_)));
    }

    #[test]
    fn block_that_never_progresses_hits_the_iteration_guard() {
        let mut container = Container::new(Cursor::new(null_record_container()), 0);

        let err = container.records().next().unwrap().unwrap_err();

        assert!(matches!(
            err,
            ClfsError::InvalidRecordBlock("record chain did not terminate")
        ));
    }

    #[test]
    fn restarting_the_walk_yields_the_same_records() {
        let mut container =
            Container::new(Cursor::new(container_file()), CONTAINER_WALK_START);

        let first: Vec<_> = container.records().collect::<Result<_, _>>().unwrap();
        let second: Vec<_> = container.records().collect::<Result<_, _>>().unwrap();

        assert_eq!(first, second);
    }
}
