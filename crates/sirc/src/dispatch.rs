//! Mapping from received SCP payloads to typed events.
//!
//! Pure except for the radio cache, which is updated under its lock before
//! the corresponding event is returned, so a subscriber reading the cache
//! sees a value consistent with the event just delivered.

use tracing::{debug, warn};

use crate::{
    cache::RadioCache,
    events::{
        self, decode_channel_info, decode_channel_map, decode_song_info, decode_status,
        decode_time, decode_tz_info, pascal_string, ScEvent,
    },
    scp::{self, get, opcode, set},
};

/// Translate one frame payload into zero or more events.
pub fn dispatch(payload: &[u8], cache: &RadioCache) -> Vec<ScEvent> {
    let Some((&op, rest)) = payload.split_first() else {
        warn!("empty payload");
        return Vec::new();
    };
    match op {
        opcode::GET_RESP => get_response(rest, cache),
        opcode::SET_RESP => set_response(rest, cache),
        opcode::ASYNC => async_notification(rest, cache),
        other => {
            warn!(opcode = other, "unknown message opcode");
            Vec::new()
        }
    }
}

fn get_response(data: &[u8], cache: &RadioCache) -> Vec<ScEvent> {
    let Some(&sub) = data.first() else {
        warn!("short GET response");
        return Vec::new();
    };
    let Some(result) = events::be_u16(&data[1..]) else {
        warn!("GET response missing result code");
        return Vec::new();
    };
    let mut out = vec![ScEvent::GetResult { result }];
    if result != 0 {
        debug!(sub, result, "GET failed at the radio");
        return out;
    }

    let body = &data[3..];
    match sub {
        get::GAIN => {
            if let Some(&db) = body.first() {
                out.push(ScEvent::Gain { db: db as i8 });
            }
        }
        get::MUTE => {
            if let Some(&on) = body.first() {
                out.push(ScEvent::Mute { on });
            }
        }
        get::POWER => {
            if let Some(&mode) = body.first() {
                out.push(ScEvent::Power { mode });
            }
        }
        get::CHANNEL => {
            if let Some(&channel) = body.first() {
                cache.set_current_channel(channel);
                out.push(ScEvent::Channel { channel });
            }
        }
        get::CHANNEL_INFO => out.extend(channel_info_pair(body, None)),
        get::SONG_INFO => {
            if let Some(si) = decode_song_info(body, cache.current_channel()) {
                out.push(ScEvent::SongInfo(si));
            }
        }
        get::CHANNEL_MAP => {
            if let Some(map) = decode_channel_map(body) {
                cache.set_channel_map(map);
                out.push(ScEvent::ChannelMap { map });
            }
        }
        get::SID => {
            if let Some((sid, _)) = pascal_string(body) {
                out.push(ScEvent::SiriusId { sid });
            }
        }
        get::TZ_INFO => {
            if let Some((offset_min, dst)) = decode_tz_info(body) {
                out.push(ScEvent::TimeZoneInfo { offset_min, dst });
            }
        }
        get::TIME => {
            if let Some(t) = decode_time(body) {
                out.push(ScEvent::Time(t));
            }
        }
        get::STATUS => out.extend(decode_status(body)),
        get::RSSI => {
            if let (Some(&composite), Some(&satellite), Some(&terrestrial)) =
                (body.first(), body.get(1), body.get(2))
            {
                out.push(ScEvent::Rssi { composite, satellite, terrestrial });
            }
        }
        other => warn!(sub = other, "unknown GET response"),
    }
    out
}

fn set_response(data: &[u8], cache: &RadioCache) -> Vec<ScEvent> {
    let Some(&sub) = data.first() else {
        warn!("short SET response");
        return Vec::new();
    };
    let Some(result) = events::be_u16(&data[1..]) else {
        warn!("SET response missing result code");
        return Vec::new();
    };
    let mut out = vec![ScEvent::SetResult { result }];
    if result != 0 {
        debug!(sub, result, "SET failed at the radio");
        return out;
    }

    // A successful tune echoes the new channel's info and current song.
    if sub == set::CHANNEL && data.len() > 3 {
        out.extend(channel_info_pair(&data[3..], Some(cache)));
    }
    out
}

fn async_notification(data: &[u8], cache: &RadioCache) -> Vec<ScEvent> {
    let Some((&kind, body)) = data.split_first() else {
        warn!("empty async notification");
        return Vec::new();
    };
    match kind {
        scp::async_id::RESET => vec![ScEvent::Reset],
        scp::async_id::SONG_INFO => decode_song_info(body, cache.current_channel())
            .map(|si| vec![ScEvent::SongInfo(si)])
            .unwrap_or_default(),
        scp::async_id::SONG_ID => pascal_string(body)
            .map(|(id, _)| vec![ScEvent::SongId { id }])
            .unwrap_or_default(),
        scp::async_id::TIME => {
            decode_time(body).map(|t| vec![ScEvent::Time(t)]).unwrap_or_default()
        }
        scp::async_id::STATUS => {
            let out = decode_status(body);
            // Tune-complete carries the channel we actually landed on.
            if let Some(ScEvent::Channel { channel }) = out.get(1) {
                cache.set_current_channel(*channel);
            }
            out
        }
        scp::async_id::SIGNAL => body
            .first()
            .map(|&state| vec![ScEvent::Signal { state }])
            .unwrap_or_default(),
        other => {
            warn!(kind = other, "unknown async notification");
            Vec::new()
        }
    }
}

/// Decode a channel-info record, then a song-info from whatever remains,
/// stamped with the record's channel. A tune echo passes the cache so the
/// current channel follows; a plain info query leaves the cache alone.
fn channel_info_pair(data: &[u8], tune_cache: Option<&RadioCache>) -> Vec<ScEvent> {
    let Some((ci, used)) = decode_channel_info(data) else {
        warn!("malformed channel info");
        return Vec::new();
    };
    let channel = ci.channel;
    if let Some(cache) = tune_cache {
        cache.set_current_channel(channel);
    }
    let mut out = vec![ScEvent::ChannelInfo(ci)];
    if data.len() > used {
        if let Some(si) = decode_song_info(&data[used..], channel) {
            out.push(ScEvent::SongInfo(si));
        }
    }
    out
}
