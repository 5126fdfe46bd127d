use std::sync::Mutex;

use crate::scp::{CHANNEL_BITMAP_LEN, INVALID_CHANNEL, MAX_CHANNELS};

struct CacheState {
    /// Bitmap of tunable channels, big-endian bit order: the MSB of byte 0
    /// is channel 223, the LSB of the last byte is channel 0.
    channel_map: [u8; CHANNEL_BITMAP_LEN],
    current_channel: u8,
}

/// Cached radio state shared between the link engine and readers.
///
/// The lock is a leaf: nothing else is acquired while it is held, and the
/// dispatcher writes here before emitting the corresponding event so
/// subscribers always observe a cache at least as new as the event.
pub struct RadioCache {
    state: Mutex<CacheState>,
}

impl Default for RadioCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                channel_map: [0; CHANNEL_BITMAP_LEN],
                current_channel: INVALID_CHANNEL,
            }),
        }
    }

    /// True iff `channel` is in range and its bitmap bit is set.
    pub fn is_valid_channel(&self, channel: u8) -> bool {
        if channel >= MAX_CHANNELS {
            return false;
        }
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let byte = CHANNEL_BITMAP_LEN - 1 - (channel / 8) as usize;
        let bit = channel % 8;
        state.channel_map[byte] >> bit & 1 == 1
    }

    pub fn channel_map(&self) -> [u8; CHANNEL_BITMAP_LEN] {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).channel_map
    }

    pub fn set_channel_map(&self, map: [u8; CHANNEL_BITMAP_LEN]) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).channel_map = map;
    }

    pub fn current_channel(&self) -> u8 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).current_channel
    }

    pub fn set_current_channel(&self, channel: u8) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).current_channel = channel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_bits_set_validates_full_range() {
        let cache = RadioCache::new();
        cache.set_channel_map([0xFF; CHANNEL_BITMAP_LEN]);
        for ch in 0..MAX_CHANNELS {
            assert!(cache.is_valid_channel(ch), "channel {ch}");
        }
        for ch in MAX_CHANNELS..=u8::MAX {
            assert!(!cache.is_valid_channel(ch), "channel {ch}");
        }
    }

    #[test]
    fn bit_order_is_big_endian() {
        let cache = RadioCache::new();
        let mut map = [0u8; CHANNEL_BITMAP_LEN];
        map[0] = 0x80; // channel 223
        map[CHANNEL_BITMAP_LEN - 1] = 0x01; // channel 0
        cache.set_channel_map(map);
        assert!(cache.is_valid_channel(223));
        assert!(cache.is_valid_channel(0));
        assert!(!cache.is_valid_channel(1));
        assert!(!cache.is_valid_channel(222));
    }

    #[test]
    fn starts_with_no_channel() {
        let cache = RadioCache::new();
        assert_eq!(cache.current_channel(), INVALID_CHANNEL);
        assert!(!cache.is_valid_channel(0));
    }
}
