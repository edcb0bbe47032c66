use bytes::BufMut;

use super::{Error, Frame, Head, Kind, StreamId};

/// A PRIORITY frame re-targets a stream inside the dependency tree.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Priority {
    pub stream_id: StreamId,
    pub dependency: StreamDependency,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamDependency {
    /// The ID of the stream dependency target.
    pub dependency_id: StreamId,

    /// The weight for the stream. The value carried here is in
    /// [0, 255]; section 5.3.2 weights [1, 256] map down by one so the
    /// value fits a `u8`.
    pub weight: u8,

    /// True if the stream dependency is exclusive.
    pub is_exclusive: bool,
}

impl Priority {
    #[must_use]
    pub fn new(stream_id: StreamId, dependency: StreamDependency) -> Self {
        Self {
            stream_id,
            dependency,
        }
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        let dependency = StreamDependency::load(payload)?;

        if dependency.dependency_id == head.stream_id() {
            return Err(Error::InvalidDependencyId);
        }

        Ok(Self {
            stream_id: head.stream_id(),
            dependency,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let head = Head::new(Kind::Priority, 0, self.stream_id);
        head.encode(5, dst);
        self.dependency.encode(dst);
    }
}

impl From<Priority> for Frame {
    fn from(src: Priority) -> Self {
        Self::Priority(src)
    }
}

// ===== impl StreamDependency =====

impl StreamDependency {
    #[must_use]
    pub fn new(dependency_id: StreamId, weight: u8, is_exclusive: bool) -> Self {
        Self {
            dependency_id,
            weight,
            is_exclusive,
        }
    }

    pub fn load(src: &[u8]) -> Result<Self, Error> {
        if src.len() != 5 {
            return Err(Error::InvalidPayloadLength);
        }

        // The exclusive flag rides the reserved bit of the dependency id.
        let (dependency_id, is_exclusive) = StreamId::parse(&src[..4]);
        let weight = src[4];

        Ok(Self::new(dependency_id, weight, is_exclusive))
    }

    pub fn encode<T: BufMut>(&self, dst: &mut T) {
        const STREAM_ID_MASK: u32 = 1 << 31;
        let mut dependency_id: u32 = self.dependency_id.into();
        if self.is_exclusive {
            dependency_id |= STREAM_ID_MASK;
        }
        dst.put_u32(dependency_id);
        dst.put_u8(self.weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::frame::HEADER_LEN;

    #[test]
    fn priority_round_trip() {
        let dependency = StreamDependency::new(StreamId::zero(), 201, false);
        let priority = Priority::new(StreamId::from(3), dependency);

        let mut buf = Vec::new();
        priority.encode(&mut buf);

        let head = Head::parse(&buf[3..]);
        let parsed = Priority::load(head, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, priority);
    }

    #[test]
    fn exclusive_flag_rides_the_reserved_bit() {
        let dependency = StreamDependency::new(StreamId::from(5), 15, true);
        let mut buf = Vec::new();
        dependency.encode(&mut buf);
        assert_eq!(buf[0] & 0x80, 0x80);

        let parsed = StreamDependency::load(&buf).unwrap();
        assert!(parsed.is_exclusive);
        assert_eq!(parsed.dependency_id, StreamId::from(5));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let dependency = StreamDependency::new(StreamId::from(3), 10, false);
        let mut payload = Vec::new();
        dependency.encode(&mut payload);

        let head = Head::new(Kind::Priority, 0, StreamId::from(3));
        assert_eq!(
            Priority::load(head, &payload),
            Err(Error::InvalidDependencyId)
        );
    }
}
