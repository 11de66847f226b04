use std::io::{Read, Seek, SeekFrom};

use nom::{
    bytes::complete::take,
    combinator::map,
    multi::count,
    sequence::tuple,
    Finish,
};
use uuid::Uuid;

use crate::{
    block::LogBlock,
    control::MetadataBlockType,
    error::{ClfsError, Result},
    lsn::Lsn,
    parse_utils::{read_utf16z, t_guid, t_lsn, t_node_id, t_u16, t_u32, t_u64, t_u8},
    signatures::{NodeId, NodeType},
    DeSerialise,
};

/// Windows file attribute bits as stored on the client context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes(pub u16);

impl FileAttributes {
    pub const READONLY: u16 = 0x0001;
    pub const HIDDEN: u16 = 0x0002;
    pub const SYSTEM: u16 = 0x0004;
    pub const DIRECTORY: u16 = 0x0010;
    pub const ARCHIVE: u16 = 0x0020;
    pub const DEVICE: u16 = 0x0040;
    pub const NORMAL: u16 = 0x0080;
    pub const TEMPORARY: u16 = 0x0100;
    pub const SPARSE_FILE: u16 = 0x0200;
    pub const REPARSE_POINT: u16 = 0x0400;
    pub const COMPRESSED: u16 = 0x0800;
    pub const OFFLINE: u16 = 0x1000;
    pub const NOT_CONTENT_INDEXED: u16 = 0x2000;
    pub const ENCRYPTED: u16 = 0x4000;

    pub fn contains(self, mask: u16) -> bool {
        self.0 & mask != 0
    }
}

/// CLFS_LOG_STATE word of a client context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Uninitialized,
    Initialized,
    Active,
    PendingDelete,
    PendingArchive,
    Shutdown,
    Multiplexed,
    Secure,
    Unknown(u32),
}

impl From<u32> for LogState {
    fn from(value: u32) -> Self {
        match value {
            0x01 => LogState::Uninitialized,
            0x02 => LogState::Initialized,
            0x04 => LogState::Active,
            0x08 => LogState::PendingDelete,
            0x10 => LogState::PendingArchive,
            0x20 => LogState::Shutdown,
            0x40 => LogState::Multiplexed,
            0x80 => LogState::Secure,
            other => LogState::Unknown(other),
        }
    }
}

/// CLFS_BASE_RECORD_HEADER.
///
/// The three symbol tables are 11-slot open-addressed hash tables of byte
/// offsets relative to the start of the record. They are traversed here as
/// plain arrays, in slot order; the stored hashes are never recomputed and
/// occupied slots past the live entries are yielded verbatim, since later
/// slots can be left-over artifacts of earlier transactions.
#[derive(Debug, Clone)]
pub struct BaseRecordHeader {
    pub dump_count: u64,
    pub id_log: Uuid,
    pub client_symbol_table: Vec<u64>,
    pub container_symbol_table: Vec<u64>,
    pub security_symbol_table: Vec<u64>,
    pub next_container: u32,
    pub next_client: u32,
    pub free_containers: u32,
    pub active_containers: u32,
    pub free_containers_count: u32,
    pub busy_containers: u32,
    pub client_containers: Vec<u32>,
    pub container_array: Vec<u32>,
    pub symbol_zone: u32,
    pub sector: u32,
    pub usn: u8,
    pub clients: u8,
}

impl BaseRecordHeader {
    pub const SIZE: usize = 4917;
    pub const SYMBOL_TABLE_SLOTS: usize = 11;
}

impl<T> DeSerialise<T> for BaseRecordHeader {
    type Item = BaseRecordHeader;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek,
    {
        let mut buffer = vec![0; BaseRecordHeader::SIZE];
        reader.read_exact(&mut buffer)?;

        let (_, header) = map(
            tuple((
                t_u64,
                t_guid,
                count(t_u64, BaseRecordHeader::SYMBOL_TABLE_SLOTS),
                count(t_u64, BaseRecordHeader::SYMBOL_TABLE_SLOTS),
                count(t_u64, BaseRecordHeader::SYMBOL_TABLE_SLOTS),
                tuple((t_u32, t_u32, t_u32, t_u32, t_u32, t_u32)),
                count(t_u32, 124),
                count(t_u32, 1024),
                t_u32,
                t_u32,
                take(3usize),
                t_u8,
                t_u8,
            )),
            |(
                dump_count,
                id_log,
                client_symbol_table,
                container_symbol_table,
                security_symbol_table,
                containers,
                client_containers,
                container_array,
                symbol_zone,
                sector,
                _unused,
                usn,
                clients,
            )| {
                BaseRecordHeader {
                    dump_count,
                    id_log,
                    client_symbol_table,
                    container_symbol_table,
                    security_symbol_table,
                    next_container: containers.0,
                    next_client: containers.1,
                    free_containers: containers.2,
                    active_containers: containers.3,
                    free_containers_count: containers.4,
                    busy_containers: containers.5,
                    client_containers,
                    container_array,
                    symbol_zone,
                    sector,
                    usn,
                    clients,
                }
            },
        )(&buffer)
        .finish()?;
        Ok(header)
    }
}

/// ClfsHashSym, the node preceding every named client, container or
/// security context in the base record.
#[derive(Debug, Clone, Copy)]
pub struct HashSymbol {
    pub node_id: NodeId,
    pub hash: u32,
    pub cb_hash: u32,

    // Sibling links of the in-memory hash structure. Never followed when
    // reading a persisted record; kept for forensic inspection only.
    pub below: u64,
    pub above: u64,

    // Offset of the UTF-16LE symbol name, relative to the record start.
    pub symbol_name: u32,

    // Offset of the described context, relative to the record start.
    pub offset: u16,
    pub deleted: u16,
}

impl HashSymbol {
    const SIZE: usize = 40;
}

impl<T> DeSerialise<T> for HashSymbol {
    type Item = HashSymbol;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek,
    {
        let mut buffer = [0; HashSymbol::SIZE];
        reader.read_exact(&mut buffer)?;

        let (_, symbol) = map(
            tuple((t_node_id, t_u32, t_u32, t_u64, t_u64, t_u32, t_u16, t_u16)),
            |(node_id, hash, cb_hash, below, above, symbol_name, offset, deleted)| HashSymbol {
                node_id,
                hash,
                cb_hash,
                below,
                above,
                symbol_name,
                offset,
                deleted,
            },
        )(&buffer)
        .finish()?;
        Ok(symbol)
    }
}

/// CLFS_CLIENT_CONTEXT, the per-stream record of a base record.
#[derive(Debug, Clone, Copy)]
pub struct ClientContext {
    pub node_id: NodeId,
    pub client_id: u8,
    pub file_attributes: FileAttributes,
    pub flush_threshold: u32,
    pub lsn_archive_tail: Lsn,
    pub lsn_base: Lsn,
    pub lsn_flush: Lsn,
    pub lsn_last: Lsn,
    pub lsn_physical_base: Lsn,
    pub state: LogState,
    pub security_context: u64,
}

impl ClientContext {
    const SIZE: usize = 124;
}

impl<T> DeSerialise<T> for ClientContext {
    type Item = ClientContext;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek,
    {
        let mut buffer = [0; ClientContext::SIZE];
        reader.read_exact(&mut buffer)?;

        let (_, context) = map(
            tuple((
                t_node_id,
                t_u8,
                take(1usize),
                t_u16,
                t_u32,
                take(40usize),
                tuple((t_lsn, t_lsn, t_lsn, t_lsn, t_lsn, t_lsn, t_lsn)),
                t_u32,
                t_u64,
            )),
            |(
                node_id,
                client_id,
                _unknown,
                file_attributes,
                flush_threshold,
                _timestamps,
                lsns,
                state,
                security_context,
            )| {
                ClientContext {
                    node_id,
                    client_id,
                    file_attributes: FileAttributes(file_attributes),
                    flush_threshold,
                    lsn_archive_tail: lsns.0,
                    lsn_base: lsns.1,
                    lsn_flush: lsns.2,
                    lsn_last: lsns.3,
                    lsn_physical_base: lsns.4,
                    state: LogState::from(state),
                    security_context,
                }
            },
        )(&buffer)
        .finish()?;
        Ok(context)
    }
}

/// CLFS_CONTAINER_CONTEXT, the per-container record of a base record.
#[derive(Debug, Clone, Copy)]
pub struct ContainerContext {
    pub node_id: NodeId,

    // Symbolic size of the container file in bytes.
    pub container: u64,

    pub container_id: u32,
    pub queue_id: u32,
    pub current_usn: u8,
    pub state: u8,
    pub previous_offset: u32,
    pub next_offset: u32,
}

impl ContainerContext {
    const SIZE: usize = 42;
}

impl<T> DeSerialise<T> for ContainerContext {
    type Item = ContainerContext;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek,
    {
        let mut buffer = [0; ContainerContext::SIZE];
        reader.read_exact(&mut buffer)?;

        let (_, context) = map(
            tuple((t_node_id, t_u64, t_u32, t_u32, t_u64, t_u8, t_u8, t_u32, t_u32)),
            |(
                node_id,
                container,
                container_id,
                queue_id,
                _alignment,
                current_usn,
                state,
                previous_offset,
                next_offset,
            )| {
                ContainerContext {
                    node_id,
                    container,
                    container_id,
                    queue_id,
                    current_usn,
                    state,
                    previous_offset,
                    next_offset,
                }
            },
        )(&buffer)
        .finish()?;
        Ok(context)
    }
}

/// CLFS_SHARED_SECURITY_CONTEXT. Only ever observed as an in-memory
/// artifact of the source OS; the descriptor payload is left opaque.
#[derive(Debug, Clone, Copy)]
pub struct SharedSecurityContext {
    pub node_id: NodeId,
    pub ref_count: u32,
    pub ref_active: u32,
    pub descriptor_offset: u32,
    pub descriptor: u32,
}

impl SharedSecurityContext {
    const SIZE: usize = 24;
}

impl<T> DeSerialise<T> for SharedSecurityContext {
    type Item = SharedSecurityContext;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek,
    {
        let mut buffer = [0; SharedSecurityContext::SIZE];
        reader.read_exact(&mut buffer)?;

        let (_, context) = map(
            tuple((t_node_id, t_u32, t_u32, t_u32, t_u32)),
            |(node_id, ref_count, ref_active, descriptor_offset, descriptor)| {
                SharedSecurityContext {
                    node_id,
                    ref_count,
                    ref_active,
                    descriptor_offset,
                    descriptor,
                }
            },
        )(&buffer)
        .finish()?;
        Ok(context)
    }
}

/// A client stream recovered from a base record. The record index of
/// `lsn_physical_base`, minus one, is the starting block offset within the
/// container file the stream writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    pub name: String,
    pub id: u8,
    pub file_attributes: FileAttributes,
    pub block_type: MetadataBlockType,
    pub lsn_archive_tail: Lsn,
    pub lsn_base: Lsn,
    pub lsn_last: Lsn,
    pub lsn_flush: Lsn,
    pub lsn_physical_base: Lsn,
    pub offset: u32,
}

/// A container binding recovered from a base record. The name is the
/// on-disk file that holds the record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub size: u64,
    pub id: u32,
    pub block_type: MetadataBlockType,
}

/// A parsed base record: the header plus every stream and container
/// recovered from its three symbol tables.
#[derive(Debug)]
pub struct BaseRecord {
    pub block_type: MetadataBlockType,
    pub header: BaseRecordHeader,
    pub streams: Vec<Stream>,
    pub containers: Vec<Container>,
}

impl BaseRecord {
    pub fn read<T>(fh: &mut T, offset: u64, block_type: MetadataBlockType) -> Result<Self>
    where
        T: Read + Seek,
    {
        let block = LogBlock::read(fh, offset)?;

        let record_offset = block.header.record_offsets[0] as u64;
        let mut reader = block.open();
        reader.seek(SeekFrom::Start(record_offset))?;

        let header = BaseRecordHeader::deserialize(&mut reader)
            .map_err(|e| e.or_record_block("invalid base record, possibly corrupt/empty"))?;

        let mut record = BaseRecord {
            block_type,
            header,
            streams: Vec::new(),
            containers: Vec::new(),
        };

        let contexts = [
            (record.header.client_symbol_table.clone(), NodeType::ClientContext),
            (
                record.header.container_symbol_table.clone(),
                NodeType::ContainerContext,
            ),
            (
                record.header.security_symbol_table.clone(),
                NodeType::SharedSecurityContext,
            ),
        ];

        for (table, ctx_type) in contexts {
            record.walk_symbol_table(&mut reader, record_offset, &table, ctx_type)?;
        }

        Ok(record)
    }

    /// Visit every occupied slot of one symbol table and collect the
    /// contexts it names. Zero slots are skipped; everything else is
    /// emitted in slot order, duplicates included.
    fn walk_symbol_table<T>(
        &mut self,
        reader: &mut T,
        record_offset: u64,
        table: &[u64],
        ctx_type: NodeType,
    ) -> Result<()>
    where
        T: Read + Seek,
    {
        for &slot in table {
            if slot == 0 {
                continue;
            }

            reader.seek(SeekFrom::Start(record_offset + slot))?;
            let symbol = HashSymbol::deserialize(reader)
                .map_err(|e| symbol_table_truncation(e, "hash symbol"))?;

            if symbol.node_id.node_type != NodeType::Symbol {
                return Err(ClfsError::InvalidContext(format!(
                    "invalid node id type: {:?}",
                    symbol.node_id.node_type
                )));
            }

            reader.seek(SeekFrom::Start(record_offset + symbol.symbol_name as u64))?;
            let name =
                read_utf16z(reader).map_err(|e| symbol_table_truncation(e, "symbol name"))?;

            let ctx_offset = record_offset + symbol.offset as u64;
            reader.seek(SeekFrom::Start(ctx_offset))?;

            match ctx_type {
                NodeType::ClientContext => {
                    let context = ClientContext::deserialize(reader)
                        .map_err(|e| symbol_table_truncation(e, "client context"))?;
                    expect_node_type(context.node_id, NodeType::ClientContext)?;
                    self.streams.push(Stream {
                        name,
                        id: context.client_id,
                        file_attributes: context.file_attributes,
                        block_type: self.block_type,
                        lsn_archive_tail: context.lsn_archive_tail,
                        lsn_base: context.lsn_base,
                        lsn_last: context.lsn_last,
                        lsn_flush: context.lsn_flush,
                        lsn_physical_base: context.lsn_physical_base,
                        offset: context.lsn_physical_base.record_index().wrapping_sub(1),
                    });
                }
                NodeType::ContainerContext => {
                    let context = ContainerContext::deserialize(reader)
                        .map_err(|e| symbol_table_truncation(e, "container context"))?;
                    expect_node_type(context.node_id, NodeType::ContainerContext)?;
                    self.containers.push(Container {
                        name,
                        size: context.container,
                        id: context.container_id,
                        block_type: self.block_type,
                    });
                }
                NodeType::SharedSecurityContext => {
                    let context = SharedSecurityContext::deserialize(reader)
                        .map_err(|e| symbol_table_truncation(e, "security context"))?;
                    expect_node_type(context.node_id, NodeType::SharedSecurityContext)?;
                }
                other => {
                    return Err(ClfsError::InvalidContext(format!(
                        "invalid context type: {other:?}"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn expect_node_type(node_id: NodeId, expected: NodeType) -> Result<()> {
    if node_id.node_type != expected {
        return Err(ClfsError::InvalidContext(format!(
            "invalid node id type: {:?}",
            node_id.node_type
        )));
    }
    Ok(())
}

fn symbol_table_truncation(err: ClfsError, what: &str) -> ClfsError {
    match err {
        ClfsError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            ClfsError::InvalidSymbolTable(format!("{what} extends past the log block"))
        }
        other => other,
    }
}
