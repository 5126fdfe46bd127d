//! Typed radio events and their wire decoders.
//!
//! Each event is one variant of a closed sum; the `Display` impl produces
//! the canonical text line (without the trailing newline) broadcast to
//! clients. Multi-byte wire integers are big-endian; strings are Pascal
//! style, a length byte followed by that many bytes.

use std::fmt;

use tracing::warn;

use crate::scp::{self, tag, CHANNEL_BITMAP_LEN};

/// Song metadata for one channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SongInfo {
    /// The channel where this song is playing.
    pub channel: u8,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub composer: String,
    pub song_id: String,
    pub artist_id: String,
}

/// Descriptive info for one channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel: u8,
    pub genre: u8,
    /// Short channel name.
    pub sname: String,
    /// Long channel name.
    pub lname: String,
    /// Short genre name.
    pub sgenre: String,
    /// Long genre name.
    pub lgenre: String,
}

/// Radio wall-clock time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RadioTime {
    pub year: u16,
    pub mon: u8,
    pub day: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
    /// Day of the week, 0 = Sunday.
    pub dow: u8,
    pub dst: u8,
}

/// Everything the radio can tell us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScEvent {
    /// The link to the radio is up and the engine is running.
    Startup,
    /// Result code from a GET request.
    GetResult { result: u16 },
    /// Result code from a SET request.
    SetResult { result: u16 },
    /// The radio's unique subscription identifier string.
    SiriusId { sid: String },
    Gain { db: i8 },
    Mute { on: u8 },
    /// Sirius song identifier string for the current program.
    SongId { id: String },
    SongInfo(SongInfo),
    /// Channel the radio is currently tuned to.
    Channel { channel: u8 },
    ChannelInfo(ChannelInfo),
    /// The valid-channel bitmap changed; the payload lives in the cache.
    ChannelMap { map: [u8; CHANNEL_BITMAP_LEN] },
    Status { kind: u8, status1: u8, status2: u8 },
    Rssi { composite: u8, satellite: u8, terrestrial: u8 },
    Signal { state: u8 },
    Antenna { state: u8 },
    Reset,
    Power { mode: u8 },
    TimeZoneInfo { offset_min: i16, dst: u8 },
    Time(RadioTime),
    /// The engine is going away.
    Shutdown,
}

impl fmt::Display for ScEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => write!(f, "STARTUP"),
            Self::GetResult { result } => write!(f, "GET,{result}"),
            Self::SetResult { result } => write!(f, "SET,{result}"),
            Self::SiriusId { sid } => write!(f, "SID,{sid}"),
            Self::Gain { db } => write!(f, "GAIN,{db}"),
            Self::Mute { on } => write!(f, "MUTE,{on}"),
            Self::SongId { id } => write!(f, "SONGID,\"{id}\""),
            Self::SongInfo(si) => write!(
                f,
                "SONGINFO,{},\"{}\",\"{}\",\"{}\",\"{}\",\"{}\"",
                si.channel, si.song_id, si.artist_id, si.title, si.artist, si.composer
            ),
            Self::Channel { channel } => write!(f, "CHANNEL,{channel}"),
            Self::ChannelInfo(ci) => write!(
                f,
                "CHANNELINFO,{},{},\"{}\",\"{}\",\"{}\",\"{}\"",
                ci.channel, ci.genre, ci.lname, ci.sname, ci.lgenre, ci.sgenre
            ),
            Self::ChannelMap { .. } => write!(f, "CHANNELMAP"),
            Self::Status { kind, status1, status2 } => {
                write!(f, "STATUS,{kind},{status1},{status2}")
            }
            Self::Rssi { composite, satellite, terrestrial } => {
                write!(f, "RSSI,{composite},{satellite},{terrestrial}")
            }
            Self::Signal { state } => write!(f, "SIGNAL,{state}"),
            Self::Antenna { state } => write!(f, "ANTENNA,{state}"),
            Self::Reset => write!(f, "RESET"),
            Self::Power { mode } => write!(f, "POWER,{mode}"),
            Self::TimeZoneInfo { offset_min, dst } => write!(f, "TZINFO,{offset_min},{dst}"),
            Self::Time(t) => write!(
                f,
                "TIME,{},{},{},{},{},{},{},{}",
                t.year, t.mon, t.day, t.hour, t.min, t.sec, t.dow, t.dst
            ),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Decode a Pascal string: a length byte, then that many bytes.
///
/// Returns the string and the total number of bytes consumed.
pub fn pascal_string(data: &[u8]) -> Option<(String, usize)> {
    let len = *data.first()? as usize;
    let body = data.get(1..1 + len)?;
    Some((String::from_utf8_lossy(body).into_owned(), 1 + len))
}

/// Decode a big-endian u16.
pub fn be_u16(data: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*data.first()?, *data.get(1)?]))
}

/// Decode the tagged field list of a song-info message.
///
/// Layout: a field count, then `count` entries of a tag byte followed by a
/// Pascal string (the ERASE tag has no body and clears everything gathered
/// so far). Unknown tags are skipped over and logged.
pub fn decode_song_info(data: &[u8], channel: u8) -> Option<SongInfo> {
    let mut si = SongInfo { channel, ..SongInfo::default() };
    let count = *data.first()?;
    let mut rest = &data[1..];
    for _ in 0..count {
        let t = *rest.first()?;
        rest = &rest[1..];
        if t == tag::ERASE {
            si = SongInfo { channel, ..SongInfo::default() };
            continue;
        }
        let (value, used) = pascal_string(rest)?;
        rest = &rest[used..];
        match t {
            tag::ARTIST => si.artist = value,
            tag::TITLE => si.title = value,
            tag::ALBUM => si.album = value,
            tag::COMPOSER => si.composer = value,
            tag::SONG_ID => si.song_id = value,
            tag::ARTIST_ID => si.artist_id = value,
            other => warn!(tag = other, "unknown song info field tag"),
        }
    }
    Some(si)
}

/// Decode a channel-info record.
///
/// Layout: channel, genre, three reserved bytes, then short name, long
/// name, short genre, long genre as Pascal strings. Returns the record and
/// the number of bytes consumed so a trailing song-info can be decoded from
/// the remainder.
pub fn decode_channel_info(data: &[u8]) -> Option<(ChannelInfo, usize)> {
    let channel = *data.first()?;
    let genre = *data.get(1)?;
    let mut used = 5usize;
    data.get(..used)?;
    let (sname, n) = pascal_string(data.get(used..)?)?;
    used += n;
    let (lname, n) = pascal_string(data.get(used..)?)?;
    used += n;
    let (sgenre, n) = pascal_string(data.get(used..)?)?;
    used += n;
    let (lgenre, n) = pascal_string(data.get(used..)?)?;
    used += n;
    Some((ChannelInfo { channel, genre, sname, lname, sgenre, lgenre }, used))
}

/// Decode a time-zone record: UTC offset in minutes (big-endian, signed)
/// and a DST flag.
pub fn decode_tz_info(data: &[u8]) -> Option<(i16, u8)> {
    Some((be_u16(data)? as i16, *data.get(2)?))
}

pub fn decode_time(data: &[u8]) -> Option<RadioTime> {
    Some(RadioTime {
        year: be_u16(data)?,
        mon: *data.get(2)?,
        day: *data.get(3)?,
        hour: *data.get(4)?,
        min: *data.get(5)?,
        sec: *data.get(6)?,
        dow: *data.get(7)?,
        dst: *data.get(8)?,
    })
}

pub fn decode_channel_map(data: &[u8]) -> Option<[u8; CHANNEL_BITMAP_LEN]> {
    let mut map = [0u8; CHANNEL_BITMAP_LEN];
    map.copy_from_slice(data.get(..CHANNEL_BITMAP_LEN)?);
    Some(map)
}

/// Project a status report into its events.
///
/// The raw `Status` is always produced; the type code additionally
/// re-projects into the dedicated event for that condition.
pub fn decode_status(data: &[u8]) -> Vec<ScEvent> {
    let (Some(&kind), Some(&status1), Some(&status2)) =
        (data.first(), data.get(1), data.get(2))
    else {
        warn!(len = data.len(), "short status payload");
        return Vec::new();
    };
    let mut events = vec![ScEvent::Status { kind, status1, status2 }];
    match kind {
        scp::status_type::TUNE => events.push(ScEvent::Channel { channel: status1 }),
        scp::status_type::SIGNAL => events.push(ScEvent::Signal { state: status1 }),
        scp::status_type::ANTENNA => events.push(ScEvent::Antenna { state: status1 }),
        other => warn!(kind = other, "unknown status type"),
    }
    events
}
