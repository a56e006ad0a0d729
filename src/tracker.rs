//! The tracking engine: per-frame matching and rolling state for every
//! object type across the hierarchy.

pub mod level_tracks;
pub mod matcher;
pub mod object_tracks;
pub mod record;
pub mod tracks;
pub mod window;

pub use level_tracks::LevelTracks;
pub use object_tracks::{Membership, ObjectOutput, ObjectTracks};
pub use record::{MatchPair, MatchRecord};
pub use tracks::{FrameData, Tracks};
pub use window::FrameWindow;
