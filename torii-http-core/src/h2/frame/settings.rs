use std::fmt;

use bytes::BufMut;

use super::{Error, Frame, FrameSize, Head, Kind, StreamId, util};

/// The default value of SETTINGS_HEADER_TABLE_SIZE.
pub const DEFAULT_SETTINGS_HEADER_TABLE_SIZE: usize = 4_096;

/// The stream-level send window this server grants and refills.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 16_384;

/// The default value of MAX_FRAME_SIZE.
pub const DEFAULT_MAX_FRAME_SIZE: FrameSize = 16_384;

/// INITIAL_WINDOW_SIZE upper bound.
const MAX_INITIAL_WINDOW_SIZE: usize = (1 << 31) - 1;

/// MAX_FRAME_SIZE upper bound.
pub const MAX_MAX_FRAME_SIZE: FrameSize = (1 << 24) - 1;

const ACK: u8 = 0x1;

/// A SETTINGS frame: the six parameters this server understands, each
/// optional. Unknown identifiers are ignored on load.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Settings {
    flags: SettingsFlags,
    pub header_table_size: Option<u32>,
    pub enable_push: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

#[derive(Copy, Clone, Eq, PartialEq, Default)]
struct SettingsFlags(u8);

/// Setting identifiers from RFC 7540 §6.5.2.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SettingId {
    HeaderTableSize = 1,
    EnablePush = 2,
    MaxConcurrentStreams = 3,
    InitialWindowSize = 4,
    MaxFrameSize = 5,
    MaxHeaderListSize = 6,
}

// ===== impl Settings =====

impl Settings {
    #[must_use]
    pub fn ack() -> Self {
        Self {
            flags: SettingsFlags(ACK),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.flags.0 & ACK == ACK
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Settings);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let flags = SettingsFlags(head.flag() & ACK);

        if flags.0 & ACK == ACK {
            // An ACK must not carry a payload.
            if !payload.is_empty() {
                return Err(Error::InvalidPayloadLength);
            }
            return Ok(Self::ack());
        }

        // Each setting is a 6-byte (id:16, value:32) entry.
        if !payload.len().is_multiple_of(6) {
            tracing::debug!(len = payload.len(), "invalid settings payload length");
            return Err(Error::InvalidPayloadAckSettings);
        }

        let mut settings = Self::default();
        for raw in payload.chunks(6) {
            let id = u16::from_be_bytes([raw[0], raw[1]]);
            let value = util::unpack_octets_as_u32(raw, 2);
            match id {
                1 => settings.header_table_size = Some(value),
                2 => match value {
                    0 | 1 => settings.enable_push = Some(value),
                    _ => return Err(Error::InvalidSettingValue),
                },
                3 => settings.max_concurrent_streams = Some(value),
                4 => {
                    if value as usize > MAX_INITIAL_WINDOW_SIZE {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.initial_window_size = Some(value);
                }
                5 => {
                    if (DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        settings.max_frame_size = Some(value);
                    } else {
                        return Err(Error::InvalidSettingValue);
                    }
                }
                6 => settings.max_header_list_size = Some(value),
                other => {
                    tracing::trace!(id = other, value, "ignoring unknown h2 setting");
                }
            }
        }

        Ok(settings)
    }

    fn payload_len(&self) -> usize {
        let mut len = 0;
        self.for_each(|_, _| len += 6);
        len
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let head = Head::new(Kind::Settings, self.flags.0, StreamId::zero());
        let payload_len = self.payload_len();

        tracing::trace!(len = payload_len, "encoding SETTINGS");
        head.encode(payload_len, dst);

        self.for_each(|id, value| {
            dst.put_u16(id as u16);
            dst.put_u32(value);
        });
    }

    fn for_each<F: FnMut(SettingId, u32)>(&self, mut f: F) {
        if let Some(v) = self.header_table_size {
            f(SettingId::HeaderTableSize, v);
        }
        if let Some(v) = self.enable_push {
            f(SettingId::EnablePush, v);
        }
        if let Some(v) = self.max_concurrent_streams {
            f(SettingId::MaxConcurrentStreams, v);
        }
        if let Some(v) = self.initial_window_size {
            f(SettingId::InitialWindowSize, v);
        }
        if let Some(v) = self.max_frame_size {
            f(SettingId::MaxFrameSize, v);
        }
        if let Some(v) = self.max_header_list_size {
            f(SettingId::MaxHeaderListSize, v);
        }
    }
}

impl From<Settings> for Frame {
    fn from(src: Settings) -> Self {
        Self::Settings(src)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Settings");
        if self.is_ack() {
            builder.field("flags", &"ACK");
        }
        self.for_each(|id, value| {
            builder.field(
                match id {
                    SettingId::HeaderTableSize => "header_table_size",
                    SettingId::EnablePush => "enable_push",
                    SettingId::MaxConcurrentStreams => "max_concurrent_streams",
                    SettingId::InitialWindowSize => "initial_window_size",
                    SettingId::MaxFrameSize => "max_frame_size",
                    SettingId::MaxHeaderListSize => "max_header_list_size",
                },
                &value,
            );
        });
        builder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::frame::HEADER_LEN;

    fn round_trip(settings: &Settings) -> Settings {
        let mut buf = Vec::new();
        settings.encode(&mut buf);
        let head = Head::parse(&buf[3..]);
        Settings::load(head, &buf[HEADER_LEN..]).unwrap()
    }

    #[test]
    fn settings_round_trip() {
        let settings = Settings {
            header_table_size: Some(8192),
            initial_window_size: Some(65_535),
            max_concurrent_streams: Some(100),
            ..Settings::default()
        };
        assert_eq!(round_trip(&settings), settings);
    }

    #[test]
    fn ack_round_trip() {
        let parsed = round_trip(&Settings::ack());
        assert!(parsed.is_ack());
    }

    #[test]
    fn ack_with_payload_is_rejected() {
        let head = Head::new(Kind::Settings, ACK, StreamId::zero());
        assert_eq!(
            Settings::load(head, &[0; 6]),
            Err(Error::InvalidPayloadLength)
        );
    }

    #[test]
    fn non_zero_stream_id_is_rejected() {
        let head = Head::new(Kind::Settings, 0, StreamId::from(1));
        assert_eq!(Settings::load(head, &[]), Err(Error::InvalidStreamId));
    }

    #[test]
    fn ragged_payload_is_rejected() {
        let head = Head::new(Kind::Settings, 0, StreamId::zero());
        assert_eq!(
            Settings::load(head, &[0; 7]),
            Err(Error::InvalidPayloadAckSettings)
        );
    }

    #[test]
    fn unknown_settings_are_ignored() {
        let head = Head::new(Kind::Settings, 0, StreamId::zero());
        let mut payload = Vec::new();
        payload.extend_from_slice(&9u16.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        assert_eq!(Settings::load(head, &payload).unwrap(), Settings::default());
    }

    #[test]
    fn h2c_upgrade_settings_payload_decodes() {
        // `AAMAAABkAAQAAP__` from the upgrade scenario:
        // MAX_CONCURRENT_STREAMS=100, INITIAL_WINDOW_SIZE=65535.
        let payload = [
            0x00, 0x03, 0x00, 0x00, 0x00, 0x64, 0x00, 0x04, 0x00, 0x00, 0xFF, 0xFF,
        ];
        let head = Head::new(Kind::Settings, 0, StreamId::zero());
        let settings = Settings::load(head, &payload).unwrap();
        assert_eq!(settings.max_concurrent_streams, Some(100));
        assert_eq!(settings.initial_window_size, Some(65_535));
    }
}
