pub mod lti;
pub mod metrics;

pub use lti::{login_with_lti, LAUNCH_DATA_COOKIE};
