use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::Rid;

/// A length-prefixed byte string stored in a table page slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple {
    pub data: Vec<u8>,
    pub rid: Option<Rid>,
}

impl Tuple {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, rid: None }
    }

    pub fn with_rid(data: Vec<u8>, rid: Rid) -> Self {
        Self { data, rid: Some(rid) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes this tuple occupies in serialized form: a u32 length prefix
    /// followed by the payload.
    pub fn serialized_size(&self) -> usize {
        4 + self.data.len()
    }

    /// Write the length-prefixed form into `buf`, returning the bytes used.
    pub fn serialize_to(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(&mut buf[0..4], self.data.len() as u32);
        buf[4..4 + self.data.len()].copy_from_slice(&self.data);
        self.serialized_size()
    }

    /// Read a length-prefixed tuple from `buf`. Returns None when the buffer
    /// is too short for the declared length.
    pub fn deserialize_from(buf: &[u8]) -> Option<Tuple> {
        if buf.len() < 4 {
            return None;
        }
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        if buf.len() < 4 + len {
            return None;
        }
        Some(Tuple::new(buf[4..4 + len].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_round_trip() {
        let tuple = Tuple::new(vec![1, 2, 3, 4, 5]);
        let mut buf = vec![0u8; tuple.serialized_size()];
        assert_eq!(tuple.serialize_to(&mut buf), 9);

        let back = Tuple::deserialize_from(&buf).unwrap();
        assert_eq!(back.data, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_deserialize_short_buffer() {
        assert_eq!(Tuple::deserialize_from(&[1, 0]), None);

        let mut buf = vec![0u8; 4];
        LittleEndian::write_u32(&mut buf, 100);
        assert_eq!(Tuple::deserialize_from(&buf), None);
    }
}
