use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE};

const SETTING_MAX_FRAME_SIZE: u16 = 0x1;
const SETTING_MAX_STREAMS: u16 = 0x2;
const SETTING_INITIAL_WINDOW: u16 = 0x3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("settings payload length is not a multiple of 6")]
    InvalidSize,

    #[error("max_frame_size {0} outside [{min}, {max}]", min = DEFAULT_MAX_FRAME_SIZE, max = MAX_FRAME_SIZE)]
    InvalidFrameSize(u32),
}

/// Connection-level parameters exchanged in SETTINGS frames.
///
/// Either side may only raise `max_frame_size` above the default, never lower
/// it; unknown setting ids are skipped for forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub max_frame_size: u32,
    pub max_streams: u32,
    pub initial_window: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_streams: 256,
            initial_window: 64 * 1024,
        }
    }
}

impl Settings {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        for (id, value) in [
            (SETTING_MAX_FRAME_SIZE, self.max_frame_size),
            (SETTING_MAX_STREAMS, self.max_streams),
            (SETTING_INITIAL_WINDOW, self.initial_window),
        ] {
            buf.put_u16(id);
            buf.put_u32(value);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(18);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, SettingsError> {
        if buf.remaining() % 6 != 0 {
            return Err(SettingsError::InvalidSize);
        }

        let mut settings = Settings::default();
        while buf.has_remaining() {
            let id = buf.get_u16();
            let value = buf.get_u32();
            match id {
                SETTING_MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&value) {
                        return Err(SettingsError::InvalidFrameSize(value));
                    }
                    settings.max_frame_size = value;
                }
                SETTING_MAX_STREAMS => settings.max_streams = value,
                SETTING_INITIAL_WINDOW => settings.initial_window = value,
                _ => {}
            }
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let settings = Settings {
            max_frame_size: 64 * 1024,
            max_streams: 16,
            initial_window: 128 * 1024,
        };
        let mut wire = settings.to_bytes();
        assert_eq!(Settings::decode(&mut wire).unwrap(), settings);
    }

    #[test]
    fn unknown_ids_are_skipped() {
        let mut wire = BytesMut::new();
        wire.put_u16(0x7F);
        wire.put_u32(42);
        let decoded = Settings::decode(&mut wire).unwrap();
        assert_eq!(decoded, Settings::default());
    }

    #[test]
    fn rejects_ragged_payload() {
        let mut wire = BytesMut::new();
        wire.put_slice(&[0, 1, 2]);
        assert_eq!(
            Settings::decode(&mut wire).unwrap_err(),
            SettingsError::InvalidSize
        );
    }

    #[test]
    fn rejects_frame_size_below_default() {
        let mut wire = BytesMut::new();
        wire.put_u16(SETTING_MAX_FRAME_SIZE);
        wire.put_u32(1024);
        assert!(matches!(
            Settings::decode(&mut wire).unwrap_err(),
            SettingsError::InvalidFrameSize(1024)
        ));
    }
}
