mod consumer;
mod directory;
mod launch;
mod user;

pub use consumer::{ChannelTemplate, Consumer, FieldMapping, TeamMapping};
pub use directory::{Channel, ChannelKind, ChannelMember, NewChannel, Team, TeamMember};
pub use launch::{
    slugify, AuthenticatedLaunch, LaunchPayload, LaunchRequest, PayloadError,
    CONSUMER_KEY_PARAM, NONCE_PARAM, SIGNATURE_METHOD_PARAM, TIMESTAMP_PARAM, VERSION_PARAM,
};
pub use user::{User, UserHint};
