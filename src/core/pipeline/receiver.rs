//! Receive-side reassembly of one inbound file.
//!
//! Chunks must arrive contiguously (the channel is ordered); a resumed
//! sender may rewind to an earlier offset, which truncates the tail.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use uuid::Uuid;

use crate::core::error::TransferError;
use crate::core::pipeline::progress::{Rate, SpeedMeter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Accepted,
    /// Already held (a resend after reconnect); ignored.
    Duplicate,
}

#[derive(Debug)]
pub struct ReceiveBuffer {
    pub peer_id: String,
    pub remote_item_id: Uuid,
    pub local_item_id: Uuid,
    pub name: String,
    expected_size: u64,
    received: u64,
    chunks: Vec<(u64, Vec<u8>)>,
    meter: SpeedMeter,
}

impl ReceiveBuffer {
    pub fn new(
        peer_id: impl Into<String>,
        remote_item_id: Uuid,
        name: impl Into<String>,
        expected_size: u64,
        progress_interval: Duration,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            remote_item_id,
            local_item_id: Uuid::new_v4(),
            name: name.into(),
            expected_size,
            received: 0,
            chunks: Vec::new(),
            meter: SpeedMeter::new(expected_size, progress_interval),
        }
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.expected_size
    }

    pub fn append(&mut self, offset: u64, data: Vec<u8>) -> Result<Appended, TransferError> {
        let len = data.len() as u64;
        let Some(end) = offset.checked_add(len) else {
            return Err(TransferError::OutOfOrder {
                offset,
                received: self.received,
            });
        };
        if offset != self.received {
            if end <= self.received {
                return Ok(Appended::Duplicate);
            }
            return Err(TransferError::OutOfOrder {
                offset,
                received: self.received,
            });
        }
        if end > self.expected_size {
            return Err(TransferError::Overflow {
                received: end,
                expected: self.expected_size,
            });
        }
        if len > 0 {
            self.chunks.push((offset, data));
            self.received += len;
        }
        Ok(Appended::Accepted)
    }

    /// Continue from `offset` after the sender reconnected.
    ///
    /// Bytes beyond `offset` are dropped; an offset past what we hold
    /// cannot be resumed.
    pub fn rewind_to(&mut self, offset: u64) -> Result<(), TransferError> {
        if offset > self.received {
            return Err(TransferError::OutOfOrder {
                offset,
                received: self.received,
            });
        }
        while let Some((start, chunk)) = self.chunks.last_mut() {
            if *start >= offset {
                self.chunks.pop();
            } else {
                chunk.truncate((offset - *start) as usize);
                break;
            }
        }
        self.received = offset;
        self.meter.rebase(offset);
        Ok(())
    }

    /// A progress reading if the report interval elapsed.
    pub fn progress(&mut self, force: bool) -> Option<Rate> {
        self.meter.sample(self.received, force)
    }

    /// Concatenate the chunks into one buffer, releasing them as it goes.
    pub fn finish(mut self) -> Result<Bytes, TransferError> {
        if !self.is_complete() {
            return Err(TransferError::Incomplete {
                received: self.received,
                expected: self.expected_size,
            });
        }
        let mut out = BytesMut::with_capacity(self.expected_size as usize);
        for (_, chunk) in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn buffer(size: u64) -> ReceiveBuffer {
        ReceiveBuffer::new("peer", Uuid::new_v4(), "f.bin", size, Duration::from_millis(500))
    }

    #[test]
    fn test_random_chunkings_reconstruct_original() {
        let mut rng = StdRng::seed_from_u64(7);
        for round in 0..50 {
            let size = rng.gen_range(0..200_000usize);
            let original: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
            let mut buf = buffer(size as u64);

            let mut offset = 0usize;
            while offset < size {
                let len = rng.gen_range(1..=32_768).min(size - offset);
                buf.append(offset as u64, original[offset..offset + len].to_vec())
                    .unwrap();
                offset += len;
            }
            assert_eq!(buf.finish().unwrap().as_ref(), &original[..], "round {round}");
        }
    }

    #[test]
    fn test_gap_is_rejected_and_duplicate_ignored() {
        let mut buf = buffer(100);
        buf.append(0, vec![1; 40]).unwrap();
        assert!(matches!(
            buf.append(50, vec![2; 10]),
            Err(TransferError::OutOfOrder { offset: 50, received: 40 })
        ));
        assert_eq!(buf.append(0, vec![1; 40]).unwrap(), Appended::Duplicate);
        assert_eq!(buf.received(), 40);
    }

    #[test]
    fn test_offset_near_u64_max_is_rejected() {
        let mut buf = buffer(100);
        buf.append(0, vec![0; 10]).unwrap();
        assert!(matches!(
            buf.append(u64::MAX - 2, vec![0; 10]),
            Err(TransferError::OutOfOrder { offset, received: 10 }) if offset == u64::MAX - 2
        ));
        assert!(matches!(
            buf.append(u64::MAX, vec![0; 1]),
            Err(TransferError::OutOfOrder { .. })
        ));
        assert_eq!(buf.received(), 10);
        buf.append(10, vec![0; 90]).unwrap();
        assert!(buf.is_complete());
    }

    #[test]
    fn test_overflow_and_incomplete() {
        let mut buf = buffer(10);
        assert!(matches!(
            buf.append(0, vec![0; 11]),
            Err(TransferError::Overflow { .. })
        ));
        buf.append(0, vec![0; 5]).unwrap();
        assert!(matches!(
            buf.finish(),
            Err(TransferError::Incomplete { received: 5, expected: 10 })
        ));
    }

    #[test]
    fn test_rewind_truncates_tail() {
        let mut buf = buffer(12);
        buf.append(0, b"abcd".to_vec()).unwrap();
        buf.append(4, b"efgh".to_vec()).unwrap();
        buf.append(8, b"ijkl".to_vec()).unwrap();

        buf.rewind_to(6).unwrap();
        assert_eq!(buf.received(), 6);
        buf.append(6, b"GHIJKL".to_vec()).unwrap();
        assert_eq!(buf.finish().unwrap().as_ref(), b"abcdefGHIJKL");
    }

    #[test]
    fn test_rewind_past_received_fails() {
        let mut buf = buffer(100);
        buf.append(0, vec![0; 10]).unwrap();
        assert!(buf.rewind_to(20).is_err());
        buf.rewind_to(0).unwrap();
        assert_eq!(buf.received(), 0);
    }

    #[test]
    fn test_empty_file_completes_immediately() {
        let buf = buffer(0);
        assert!(buf.is_complete());
        assert!(buf.finish().unwrap().is_empty());
    }
}
