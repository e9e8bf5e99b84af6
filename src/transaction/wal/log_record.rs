use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, PageId, Rid, TxnId, INVALID_LSN};
use crate::storage::page::tuple::Tuple;

/// Fixed header prefix of every record:
/// `size:u32, lsn:u64, txn_id:u32, prev_lsn:u64, type:u32`, little-endian.
pub const HEADER_SIZE: usize = 28;

const RID_SIZE: usize = 8;

/// Types of log records written ahead of table page mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogRecordType {
    Invalid = 0,
    Insert = 1,
    MarkDelete = 2,
    ApplyDelete = 3,
    RollbackDelete = 4,
    Update = 5,
    Begin = 6,
    Commit = 7,
    Abort = 8,
    NewPage = 9,
}

impl LogRecordType {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Insert),
            2 => Some(Self::MarkDelete),
            3 => Some(Self::ApplyDelete),
            4 => Some(Self::RollbackDelete),
            5 => Some(Self::Update),
            6 => Some(Self::Begin),
            7 => Some(Self::Commit),
            8 => Some(Self::Abort),
            9 => Some(Self::NewPage),
            _ => None,
        }
    }
}

/// Type-specific payload carried after the header.
#[derive(Debug, Clone)]
pub enum LogPayload {
    /// BEGIN / COMMIT / ABORT carry nothing beyond the header.
    Transaction,
    /// INSERT and the delete family carry the affected rid and tuple image.
    TupleOp { rid: Rid, tuple: Tuple },
    /// UPDATE carries the rid plus before and after images.
    Update { rid: Rid, old_tuple: Tuple, new_tuple: Tuple },
    /// NEWPAGE records the page linked in behind `prev_page_id`.
    NewPage { prev_page_id: PageId, page_id: PageId },
}

/// One write-ahead log record. `lsn` is stamped by the log manager when the
/// record is appended.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub size: u32,
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub record_type: LogRecordType,
    pub payload: LogPayload,
}

impl LogRecord {
    fn new(
        txn_id: TxnId,
        prev_lsn: Lsn,
        record_type: LogRecordType,
        payload: LogPayload,
    ) -> Self {
        let payload_size = match &payload {
            LogPayload::Transaction => 0,
            LogPayload::TupleOp { tuple, .. } => RID_SIZE + tuple.serialized_size(),
            LogPayload::Update { old_tuple, new_tuple, .. } => {
                RID_SIZE + old_tuple.serialized_size() + new_tuple.serialized_size()
            }
            LogPayload::NewPage { .. } => 8,
        };
        Self {
            size: (HEADER_SIZE + payload_size) as u32,
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            record_type,
            payload,
        }
    }

    pub fn new_begin(txn_id: TxnId) -> Self {
        Self::new(txn_id, INVALID_LSN, LogRecordType::Begin, LogPayload::Transaction)
    }

    pub fn new_commit(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::Commit, LogPayload::Transaction)
    }

    pub fn new_abort(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::Abort, LogPayload::Transaction)
    }

    pub fn new_insert(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::Insert, LogPayload::TupleOp { rid, tuple })
    }

    pub fn new_mark_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::MarkDelete, LogPayload::TupleOp { rid, tuple })
    }

    pub fn new_apply_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::ApplyDelete, LogPayload::TupleOp { rid, tuple })
    }

    pub fn new_rollback_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::RollbackDelete,
            LogPayload::TupleOp { rid, tuple },
        )
    }

    pub fn new_update(
        txn_id: TxnId,
        prev_lsn: Lsn,
        rid: Rid,
        old_tuple: Tuple,
        new_tuple: Tuple,
    ) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::Update,
            LogPayload::Update { rid, old_tuple, new_tuple },
        )
    }

    pub fn new_new_page(txn_id: TxnId, prev_lsn: Lsn, prev_page_id: PageId, page_id: PageId) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::NewPage,
            LogPayload::NewPage { prev_page_id, page_id },
        )
    }

    /// Rid a data record targets, if it has one.
    pub fn rid(&self) -> Option<Rid> {
        match &self.payload {
            LogPayload::TupleOp { rid, .. } | LogPayload::Update { rid, .. } => Some(*rid),
            _ => None,
        }
    }

    /// Serialize header and payload into `buf`, which must hold `size` bytes.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= self.size as usize);
        LittleEndian::write_u32(&mut buf[0..4], self.size);
        LittleEndian::write_u64(&mut buf[4..12], self.lsn);
        LittleEndian::write_u32(&mut buf[12..16], self.txn_id);
        LittleEndian::write_u64(&mut buf[16..24], self.prev_lsn);
        LittleEndian::write_u32(&mut buf[24..28], self.record_type as u32);

        let mut pos = HEADER_SIZE;
        match &self.payload {
            LogPayload::Transaction => {}
            LogPayload::TupleOp { rid, tuple } => {
                pos += write_rid(&mut buf[pos..], rid);
                tuple.serialize_to(&mut buf[pos..]);
            }
            LogPayload::Update { rid, old_tuple, new_tuple } => {
                pos += write_rid(&mut buf[pos..], rid);
                pos += old_tuple.serialize_to(&mut buf[pos..]);
                new_tuple.serialize_to(&mut buf[pos..]);
            }
            LogPayload::NewPage { prev_page_id, page_id } => {
                LittleEndian::write_u32(&mut buf[pos..pos + 4], *prev_page_id);
                LittleEndian::write_u32(&mut buf[pos + 4..pos + 8], *page_id);
            }
        }
    }

    /// Parse one record from the front of `buf`. Returns None on a
    /// truncated or corrupt prefix, which recovery treats as end-of-log.
    pub fn deserialize(buf: &[u8]) -> Option<LogRecord> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let size = LittleEndian::read_u32(&buf[0..4]);
        if (size as usize) < HEADER_SIZE || size as usize > buf.len() {
            return None;
        }
        let lsn = LittleEndian::read_u64(&buf[4..12]);
        let txn_id = LittleEndian::read_u32(&buf[12..16]);
        let prev_lsn = LittleEndian::read_u64(&buf[16..24]);
        let record_type = LogRecordType::from_u32(LittleEndian::read_u32(&buf[24..28]))?;

        let body = &buf[HEADER_SIZE..size as usize];
        let payload = match record_type {
            LogRecordType::Begin | LogRecordType::Commit | LogRecordType::Abort => {
                LogPayload::Transaction
            }
            LogRecordType::Insert
            | LogRecordType::MarkDelete
            | LogRecordType::ApplyDelete
            | LogRecordType::RollbackDelete => {
                let rid = read_rid(body)?;
                let tuple = Tuple::deserialize_from(&body[RID_SIZE..])?;
                LogPayload::TupleOp { rid, tuple }
            }
            LogRecordType::Update => {
                let rid = read_rid(body)?;
                let old_tuple = Tuple::deserialize_from(&body[RID_SIZE..])?;
                let new_start = RID_SIZE + old_tuple.serialized_size();
                let new_tuple = Tuple::deserialize_from(&body[new_start..])?;
                LogPayload::Update { rid, old_tuple, new_tuple }
            }
            LogRecordType::NewPage => {
                if body.len() < 8 {
                    return None;
                }
                LogPayload::NewPage {
                    prev_page_id: LittleEndian::read_u32(&body[0..4]),
                    page_id: LittleEndian::read_u32(&body[4..8]),
                }
            }
            LogRecordType::Invalid => return None,
        };

        Some(LogRecord {
            size,
            lsn,
            txn_id,
            prev_lsn,
            record_type,
            payload,
        })
    }
}

fn write_rid(buf: &mut [u8], rid: &Rid) -> usize {
    LittleEndian::write_u32(&mut buf[0..4], rid.page_id);
    LittleEndian::write_u32(&mut buf[4..8], rid.slot_num);
    RID_SIZE
}

fn read_rid(buf: &[u8]) -> Option<Rid> {
    if buf.len() < RID_SIZE {
        return None;
    }
    let page_id = LittleEndian::read_u32(&buf[0..4]);
    let slot_num = LittleEndian::read_u32(&buf[4..8]);
    Some(Rid::new(page_id, slot_num))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(mut record: LogRecord, lsn: Lsn) -> LogRecord {
        record.lsn = lsn;
        let mut buf = vec![0u8; record.size as usize];
        record.serialize_into(&mut buf);
        LogRecord::deserialize(&buf).expect("record should parse back")
    }

    #[test]
    fn test_begin_round_trip() {
        let back = round_trip(LogRecord::new_begin(7), 1);
        assert_eq!(back.size as usize, HEADER_SIZE);
        assert_eq!(back.lsn, 1);
        assert_eq!(back.txn_id, 7);
        assert_eq!(back.prev_lsn, INVALID_LSN);
        assert_eq!(back.record_type, LogRecordType::Begin);
    }

    #[test]
    fn test_insert_round_trip() {
        let rid = Rid::new(4, 2);
        let tuple = Tuple::new(vec![9, 8, 7]);
        let back = round_trip(LogRecord::new_insert(3, 11, rid, tuple), 12);

        assert_eq!(back.record_type, LogRecordType::Insert);
        assert_eq!(back.prev_lsn, 11);
        match back.payload {
            LogPayload::TupleOp { rid: r, tuple: t } => {
                assert_eq!(r, rid);
                assert_eq!(t.data, vec![9, 8, 7]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_update_round_trip() {
        let rid = Rid::new(5, 0);
        let back = round_trip(
            LogRecord::new_update(2, 5, rid, Tuple::new(vec![1, 2]), Tuple::new(vec![3, 4, 5])),
            6,
        );
        match back.payload {
            LogPayload::Update { rid: r, old_tuple, new_tuple } => {
                assert_eq!(r, rid);
                assert_eq!(old_tuple.data, vec![1, 2]);
                assert_eq!(new_tuple.data, vec![3, 4, 5]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_new_page_round_trip() {
        let back = round_trip(LogRecord::new_new_page(1, 3, 6, 9), 4);
        match back.payload {
            LogPayload::NewPage { prev_page_id, page_id } => {
                assert_eq!(prev_page_id, 6);
                assert_eq!(page_id, 9);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        // all zeroes: size 0 -> treated as end of log
        assert!(LogRecord::deserialize(&[0u8; 64]).is_none());
        // truncated header
        assert!(LogRecord::deserialize(&[1u8; 10]).is_none());
    }
}
