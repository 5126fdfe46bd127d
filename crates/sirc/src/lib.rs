//! SiriusConnect radio interface.
//!
//! Everything between the serial cable and the daemon's text protocol:
//! the SCP wire codec, the stop-and-wait link engine, typed radio events
//! with their decoders, the cached radio state, and the TTS-100 unlock.

pub mod cache;
pub mod dispatch;
pub mod events;
pub mod handshake;
pub mod link;
pub mod request;
pub mod scp;

pub use cache::RadioCache;
pub use events::{ChannelInfo, RadioTime, ScEvent, SongInfo};
pub use link::{EventSink, LinkTask, Radio, RadioVariant};
pub use request::{CommandFuture, ScResult};
