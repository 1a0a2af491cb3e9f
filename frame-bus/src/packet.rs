use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    #[default]
    Video,
    Audio,
}

/// One compressed packet.
///
/// Metadata is plain data and is copied per recipient; the payload is shared.
/// Every [`EncoderPacket::share`] adds an owner, every
/// [`EncoderPacket::release`] (or drop) removes one, and the bytes are freed
/// with the last owner. A published payload is never written again.
#[derive(Debug, Clone, Default)]
pub struct EncoderPacket {
    pub pts: i64,
    pub dts: i64,
    pub timebase_num: u32,
    pub timebase_den: u32,
    pub kind: EncoderType,
    pub keyframe: bool,
    pub track_idx: usize,
    /// Decode time in microseconds on the encoder's clock.
    pub dts_usec: i64,
    /// Decode time in microseconds on the system clock.
    pub sys_dts_usec: i64,
    pub priority: i32,
    payload: Option<Arc<Bytes>>,
}

impl EncoderPacket {
    pub fn new(kind: EncoderType) -> Self {
        Self {
            kind,
            timebase_num: 1,
            timebase_den: 1,
            ..Default::default()
        }
    }

    /// Replaces the payload with a fresh allocation owned only by this packet.
    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.payload = Some(Arc::new(data.into()));
    }

    /// Deep copy: metadata plus a new payload with a single owner.
    pub fn create_instance(&self) -> Self {
        let mut dst = self.clone();
        dst.payload = self
            .payload
            .as_ref()
            .map(|payload| Arc::new(Bytes::copy_from_slice(payload)));
        dst
    }

    /// Copies the metadata and shares the payload.
    pub fn share(&self) -> Self {
        self.clone()
    }

    /// Drops this packet's share of the payload and clears its metadata.
    pub fn release(&mut self) {
        *self = Self::default();
    }

    /// `prefix` followed by this packet's payload, as a new single-owner
    /// packet with the same metadata.
    pub fn with_prefix(&self, prefix: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(prefix.len() + self.size());
        buf.extend_from_slice(prefix);
        buf.extend_from_slice(self.data());
        let mut dst = self.clone();
        dst.set_data(buf.freeze());
        dst
    }

    pub fn data(&self) -> &[u8] {
        self.payload.as_deref().map(|b| b.as_ref()).unwrap_or_default()
    }

    /// Cheap handle to the payload bytes.
    pub fn bytes(&self) -> Bytes {
        self.payload.as_deref().cloned().unwrap_or_default()
    }

    pub fn size(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of packets currently sharing the payload, 0 without one.
    pub fn ref_count(&self) -> usize {
        self.payload.as_ref().map(Arc::strong_count).unwrap_or(0)
    }

    pub fn shares_payload_with(&self, other: &EncoderPacket) -> bool {
        match (&self.payload, &other.payload) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `dts` converted to microseconds.
    pub fn packet_dts_usec(&self) -> i64 {
        if self.timebase_den == 0 {
            return 0;
        }
        (self.dts as i128 * 1_000_000 * self.timebase_num as i128 / self.timebase_den as i128)
            as i64
    }

    #[cfg(test)]
    pub(crate) fn payload_weak(&self) -> Option<std::sync::Weak<Bytes>> {
        self.payload.as_ref().map(Arc::downgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet() -> EncoderPacket {
        let mut pkt = EncoderPacket::new(EncoderType::Video);
        pkt.pts = 3;
        pkt.dts = 2;
        pkt.timebase_num = 1;
        pkt.timebase_den = 30;
        pkt.keyframe = true;
        pkt.set_data(vec![1u8, 2, 3, 4]);
        pkt
    }

    #[test]
    fn test_create_instance_is_independent() {
        let src = packet();
        let mut copy = src.create_instance();
        assert_eq!(copy.data(), src.data());
        assert!(!copy.shares_payload_with(&src));
        assert_eq!(src.ref_count(), 1);
        assert_eq!(copy.ref_count(), 1);

        copy.pts = 99;
        assert_eq!(src.pts, 3);
    }

    #[test]
    fn test_share_and_release() {
        let mut src = packet();
        let weak = src.payload_weak().unwrap();

        let mut shared = src.share();
        assert!(shared.shares_payload_with(&src));
        assert_eq!(src.ref_count(), 2);

        shared.keyframe = false;
        assert!(src.keyframe);

        src.release();
        assert_eq!(src.size(), 0);
        assert_eq!(src.pts, 0);
        assert_eq!(src.ref_count(), 0);
        assert!(weak.upgrade().is_some());
        assert_eq!(shared.data(), &[1, 2, 3, 4]);

        shared.release();
        assert!(weak.upgrade().is_none());
        // releasing an empty packet is harmless
        shared.release();
    }

    #[test]
    fn test_concurrent_share_release_frees_once() {
        let src = packet();
        let weak = src.payload_weak().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mut mine = src.share();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut extra = mine.share();
                        assert_eq!(extra.data(), &[1, 2, 3, 4]);
                        extra.release();
                    }
                    mine.release();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(src.ref_count(), 1);
        drop(src);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_with_prefix() {
        let src = packet();
        let decorated = src.with_prefix(&[0, 0, 0, 1]);
        assert_eq!(decorated.data(), &[0, 0, 0, 1, 1, 2, 3, 4]);
        assert_eq!(decorated.pts, src.pts);
        assert!(decorated.keyframe);
        assert_eq!(src.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_packet_dts_usec() {
        let mut pkt = packet();
        pkt.dts = 15;
        assert_eq!(pkt.packet_dts_usec(), 500_000);
        pkt.timebase_den = 0;
        assert_eq!(pkt.packet_dts_usec(), 0);
    }
}
