pub mod authenticator;
pub mod database;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod nonce;
pub mod onboarding;
pub mod registry;
pub mod resolver;

pub use authenticator::{AuthOutcome, LaunchAuthenticator, RejectReason, DEFAULT_FRESHNESS_WINDOW_SECS};
pub use database::Database;
pub use directory::{Directory, MemoryDirectory};
pub use error::{ServiceError, StoreError};
pub use nonce::{MemoryNonceStore, NonceStore, NonceStoreError, RedisNonceStore};
pub use onboarding::{
    ChannelStep, ChannelWarning, OnboardingCoordinator, OnboardingError, OnboardingReport,
    OnboardingState,
};
pub use registry::{ConsumerRegistry, RegistryError};
pub use resolver::{ResolveError, UserResolver, UserStore};
