use std::io::{Read, Seek};

use crate::{
    base::BaseRecord,
    control::{ControlRecord, MetadataBlock, MetadataBlockType},
    error::{ClfsError, Result},
    truncate::TruncateRecord,
};

/// A parsed Base Log File.
///
/// Construction decodes the control record at offset 0 and validates its
/// magic; the retained block table then drives three lazy iterators, one
/// per metadata block type pair. Shadow blocks (odd types) carry the state
/// of the previous transaction and are yielded alongside their live
/// counterparts; callers that only want live metadata filter on the block
/// type carried by every yielded record.
#[derive(Debug)]
pub struct Blf<T> {
    fh: T,
    control: ControlRecord,
    metablocks: Vec<MetadataBlock>,
}

impl<T> Blf<T>
where
    T: Read + Seek,
{
    pub fn new(mut fh: T) -> Result<Self> {
        let control = ControlRecord::read(&mut fh, 0, MetadataBlockType::Control)?;

        if !control.valid() {
            return Err(ClfsError::InvalidBlf);
        }

        let metablocks = control.blocks().to_vec();
        Ok(Blf {
            fh,
            control,
            metablocks,
        })
    }

    pub fn valid(&self) -> bool {
        self.control.valid()
    }

    /// The control record parsed from offset 0.
    pub fn control_record(&self) -> &ControlRecord {
        &self.control
    }

    /// The metadata block table of the root control record.
    pub fn blocks(&self) -> &[MetadataBlock] {
        &self.metablocks
    }

    /// Control records, live and shadow.
    pub fn control_records(&mut self) -> impl Iterator<Item = Result<ControlRecord>> + '_ {
        let fh = &mut self.fh;
        self.metablocks
            .iter()
            .filter(|block| {
                matches!(
                    block.block_type,
                    MetadataBlockType::Control | MetadataBlockType::ControlShadow
                )
            })
            .map(move |block| ControlRecord::read(&mut *fh, block.offset as u64, block.block_type))
    }

    /// Base records, live and shadow. These hold the stream and container
    /// bindings needed to walk the associated container files.
    pub fn base_records(&mut self) -> impl Iterator<Item = Result<BaseRecord>> + '_ {
        let fh = &mut self.fh;
        self.metablocks
            .iter()
            .filter(|block| {
                matches!(
                    block.block_type,
                    MetadataBlockType::General | MetadataBlockType::GeneralShadow
                )
            })
            .map(move |block| BaseRecord::read(&mut *fh, block.offset as u64, block.block_type))
    }

    /// Truncate records, live and shadow.
    pub fn truncate_records(&mut self) -> impl Iterator<Item = Result<TruncateRecord>> + '_ {
        let fh = &mut self.fh;
        self.metablocks
            .iter()
            .filter(|block| {
                matches!(
                    block.block_type,
                    MetadataBlockType::Scratch | MetadataBlockType::ScratchShadow
                )
            })
            .map(move |block| TruncateRecord::read(&mut *fh, block.offset as u64, block.block_type))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use crate::fixtures::{control_record_blf, full_blf, invalid_magic_blf};

    use super::*;

    #[test]
    fn open_valid_blf() {
        let blf = Blf::new(Cursor::new(control_record_blf())).unwrap();

        assert!(blf.valid());
        assert_eq!(0x1, blf.control_record().dump_count);
        assert_eq!(6, blf.blocks().len());
    }

    #[test]
    fn truncated_blf_is_invalid_record_block() {
        let bytes = control_record_blf();

        let err = Blf::new(Cursor::new(&bytes[..0x30])).unwrap_err();

        assert!(matches!(err, ClfsError::InvalidRecordBlock(_)));
    }

    #[test]
    fn wrong_magic_is_invalid_blf() {
        let err = Blf::new(Cursor::new(invalid_magic_blf())).unwrap_err();

        assert!(matches!(err, ClfsError::InvalidBlf));
    }

    #[test]
    fn base_records_filter_general_blocks() {
        let mut blf = Blf::new(Cursor::new(full_blf())).unwrap();

        let records: Vec<_> = blf
            .base_records()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(2, records.len());
        assert_eq!(MetadataBlockType::General, records[0].block_type);
        assert_eq!(MetadataBlockType::GeneralShadow, records[1].block_type);
        for record in &records {
            assert_eq!(2, record.streams.len());
            assert_eq!(1, record.containers.len());
            for stream in &record.streams {
                assert_eq!(record.block_type, stream.block_type);
            }
        }
    }

    #[test]
    fn control_records_filter_control_blocks() {
        let mut blf = Blf::new(Cursor::new(full_blf())).unwrap();

        let records: Vec<_> = blf
            .control_records()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(2, records.len());
        assert_eq!(MetadataBlockType::Control, records[0].block_type);
        assert_eq!(MetadataBlockType::ControlShadow, records[1].block_type);
        assert!(records.iter().all(ControlRecord::valid));
    }

    #[test]
    fn truncate_records_filter_scratch_blocks() {
        let mut blf = Blf::new(Cursor::new(full_blf())).unwrap();

        let records: Vec<_> = blf
            .truncate_records()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(2, records.len());
        assert_eq!(MetadataBlockType::Scratch, records[0].block_type);
        assert_eq!(MetadataBlockType::ScratchShadow, records[1].block_type);
    }

    #[test]
    fn iterators_are_restartable() {
        let mut blf = Blf::new(Cursor::new(full_blf())).unwrap();

        let first: Vec<_> = blf.base_records().collect::<Result<_, _>>().unwrap();
        let second: Vec<_> = blf.base_records().collect::<Result<_, _>>().unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.streams, b.streams);
            assert_eq!(a.containers, b.containers);
        }
    }
}
