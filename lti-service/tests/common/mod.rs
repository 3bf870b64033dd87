//! Shared fixtures for lti-service integration tests: a directory wrapper
//! that counts calls and injects failures, and a signed-launch builder.

#![allow(dead_code)]

use async_trait::async_trait;
use lti_service::{
    build_router,
    config::LtiConfig,
    models::{
        Channel, ChannelKind, ChannelMember, ChannelTemplate, Consumer, LaunchPayload,
        LaunchRequest, NewChannel, Team, TeamMember, User,
    },
    services::{
        AuthOutcome, ConsumerRegistry, Directory, LaunchAuthenticator, MemoryDirectory,
        MemoryNonceStore, NonceStore, NonceStoreError, StoreError, UserStore,
    },
    AppState,
};
use service_core::axum::Router;
use service_core::utils::signature::{percent_encode, sign_request, SignatureMethod};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const SITE_URL: &str = "https://chat.example.com";
pub const LAUNCH_PATH: &str = "/login/lti";
pub const CONSUMER_KEY: &str = "lms1";
pub const CONSUMER_SECRET: &str = "s3cr3t";

/// [`MemoryDirectory`] plus call counters and failure injection.
#[derive(Default)]
pub struct RecordingDirectory {
    pub inner: MemoryDirectory,
    pub team_lookups: AtomicUsize,
    pub team_joins: AtomicUsize,
    pub channel_lookups: AtomicUsize,
    pub channel_creates: AtomicUsize,
    pub channel_joins: AtomicUsize,
    pub fail_team_join: AtomicBool,
    /// Channel names whose creation fails with an unavailable store.
    pub fail_create: Mutex<HashSet<String>>,
    /// Channel names whose membership add fails.
    pub fail_join: Mutex<HashSet<String>>,
    /// Channel names another launcher creates just before us.
    pub race_create: Mutex<HashSet<String>>,
    /// Added latency on team lookup, in milliseconds.
    pub team_lookup_delay_ms: AtomicU64,
}

impl RecordingDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_team(slug: &str) -> (Self, Team) {
        let directory = Self::new();
        let team = directory.inner.insert_team(Team::new(slug, slug));
        (directory, team)
    }

    pub fn store_calls(&self) -> usize {
        self.team_lookups.load(Ordering::SeqCst)
            + self.team_joins.load(Ordering::SeqCst)
            + self.channel_lookups.load(Ordering::SeqCst)
            + self.channel_creates.load(Ordering::SeqCst)
            + self.channel_joins.load(Ordering::SeqCst)
    }

    pub fn fail_create_of(&self, name: &str) {
        self.fail_create.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_join_of(&self, name: &str) {
        self.fail_join.lock().unwrap().insert(name.to_string());
    }

    pub fn race_create_of(&self, name: &str) {
        self.race_create.lock().unwrap().insert(name.to_string());
    }

    fn channel_name(&self, channel_id: Uuid) -> Option<String> {
        self.inner.channel_by_id(channel_id).map(|c| c.name)
    }
}

fn unavailable(what: &str) -> StoreError {
    StoreError::Unavailable(anyhow::anyhow!("injected failure: {}", what))
}

#[async_trait]
impl Directory for RecordingDirectory {
    async fn get_team_by_name(&self, name: &str) -> Result<Option<Team>, StoreError> {
        self.team_lookups.fetch_add(1, Ordering::SeqCst);
        let delay = self.team_lookup_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.get_team_by_name(name).await
    }

    async fn get_team_member(
        &self,
        team_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TeamMember>, StoreError> {
        self.inner.get_team_member(team_id, user_id).await
    }

    async fn add_team_member(
        &self,
        team_id: Uuid,
        user_id: Uuid,
    ) -> Result<TeamMember, StoreError> {
        self.team_joins.fetch_add(1, Ordering::SeqCst);
        if self.fail_team_join.load(Ordering::SeqCst) {
            return Err(unavailable("team join"));
        }
        self.inner.add_team_member(team_id, user_id).await
    }

    async fn get_channel_by_name(
        &self,
        team_id: Uuid,
        name: &str,
    ) -> Result<Option<Channel>, StoreError> {
        self.channel_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get_channel_by_name(team_id, name).await
    }

    async fn create_channel(&self, channel: NewChannel) -> Result<Channel, StoreError> {
        self.channel_creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.lock().unwrap().contains(&channel.name) {
            return Err(unavailable("channel create"));
        }
        let raced = self.race_create.lock().unwrap().remove(&channel.name);
        if raced {
            self.inner.create_channel(channel.clone()).await?;
        }
        self.inner.create_channel(channel).await
    }

    async fn get_channel_member(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ChannelMember>, StoreError> {
        self.inner.get_channel_member(channel_id, user_id).await
    }

    async fn add_channel_member(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<ChannelMember, StoreError> {
        self.channel_joins.fetch_add(1, Ordering::SeqCst);
        if let Some(name) = self.channel_name(channel_id) {
            if self.fail_join.lock().unwrap().contains(&name) {
                return Err(unavailable("channel join"));
            }
        }
        self.inner.add_channel_member(channel_id, user_id).await
    }
}

#[async_trait]
impl UserStore for RecordingDirectory {
    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        self.inner.get_user_by_external_id(external_id).await
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.inner.get_user_by_email(email).await
    }

    async fn update_user(&self, user: &User) -> Result<(), StoreError> {
        self.inner.update_user(user).await
    }

    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        self.inner.create_user(user).await
    }
}

/// Nonce store whose backend is always down.
pub struct UnavailableNonceStore;

#[async_trait]
impl NonceStore for UnavailableNonceStore {
    async fn record(
        &self,
        _consumer_key: &str,
        _nonce: &str,
        _expires_at: i64,
        _now: i64,
    ) -> Result<bool, NonceStoreError> {
        Err(NonceStoreError::Unavailable(anyhow::anyhow!("connection refused")))
    }

    async fn seen(&self, _consumer_key: &str, _nonce: &str, _now: i64) -> Result<bool, NonceStoreError> {
        Err(NonceStoreError::Unavailable(anyhow::anyhow!("connection refused")))
    }

    async fn health_check(&self) -> Result<(), NonceStoreError> {
        Err(NonceStoreError::Unavailable(anyhow::anyhow!("connection refused")))
    }
}

/// Consumer `lms1` mapping course `C101` to team `course-101`, with one open
/// and one private channel per course.
pub fn test_consumer() -> Consumer {
    let mut consumer = Consumer::new("Moodle", CONSUMER_KEY, CONSUMER_SECRET);
    consumer
        .fields
        .team
        .teams
        .insert("C101".to_string(), "course-101".to_string());
    consumer.fields.channels = vec![
        ChannelTemplate {
            kind: ChannelKind::Open,
            name: "general-{context_label}".to_string(),
            display_name: "General".to_string(),
        },
        ChannelTemplate {
            kind: ChannelKind::Private,
            name: "staff-{context_label}".to_string(),
            display_name: "{context_title} Staff".to_string(),
        },
    ];
    consumer
}

pub fn test_config() -> LtiConfig {
    let mut config = LtiConfig::development(SITE_URL, vec![test_consumer()]);
    config.log_level = "error".to_string();
    config
}

pub struct TestApp {
    pub router: Router,
    pub directory: Arc<RecordingDirectory>,
    pub nonces: Arc<MemoryNonceStore>,
    pub team: Team,
}

impl TestApp {
    pub fn new(config: LtiConfig) -> Self {
        let (directory, team) = RecordingDirectory::with_team("course-101");
        let directory = Arc::new(directory);
        let nonces = Arc::new(MemoryNonceStore::new(config.lti.nonce_cache_capacity));

        let state = AppState::new(config, directory.clone(), directory.clone(), nonces.clone())
            .expect("Failed to build app state");

        Self {
            router: build_router(state),
            directory,
            nonces,
            team,
        }
    }

    /// Seed a user linked to the launch identity `external_id`.
    pub fn seed_user(&self, email: &str, external_id: Option<&str>) -> User {
        let mut user = User::new(email, email.split('@').next().unwrap_or(email));
        user.external_lti_id = external_id.map(str::to_string);
        self.directory.inner.insert_user(user.clone()).unwrap();
        user
    }
}

/// Router over a fresh `course-101` directory and the given nonce store.
pub fn router_with_nonces(
    config: LtiConfig,
    nonces: Arc<dyn NonceStore>,
) -> (Router, Arc<RecordingDirectory>) {
    let (directory, _) = RecordingDirectory::with_team("course-101");
    let directory = Arc::new(directory);
    let state = AppState::new(config, directory.clone(), directory.clone(), nonces)
        .expect("Failed to build app state");
    (build_router(state), directory)
}

/// Launch parameters for a student of course C101.
pub fn launch_params(user_id: &str, email: &str) -> Vec<(String, String)> {
    [
        ("lti_message_type", "basic-lti-launch-request"),
        ("lti_version", "LTI-1p0"),
        ("user_id", user_id),
        ("lis_person_contact_email_primary", email),
        ("lis_person_name_given", "Ada"),
        ("context_id", "C101"),
        ("context_label", "101"),
        ("context_title", "Intro to Rust"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Add the OAuth parameters and a signature made with `secret`.
pub fn sign(
    params: Vec<(String, String)>,
    consumer_key: &str,
    secret: &str,
    nonce: &str,
) -> Vec<(String, String)> {
    let url = format!("{}{}", SITE_URL, LAUNCH_PATH);
    sign_for_url(params, &url, consumer_key, secret, nonce)
}

/// Like [`sign`], for a launch URL that may carry its own query string.
pub fn sign_for_url(
    mut params: Vec<(String, String)>,
    url: &str,
    consumer_key: &str,
    secret: &str,
    nonce: &str,
) -> Vec<(String, String)> {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    params.extend(
        [
            ("oauth_consumer_key", consumer_key),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_version", "1.0"),
            ("oauth_timestamp", timestamp.as_str()),
            ("oauth_nonce", nonce),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string())),
    );

    let signature = sign_request(SignatureMethod::HmacSha1, "POST", url, &params, secret)
        .expect("Failed to sign launch");
    params.push(("oauth_signature".to_string(), signature));
    params
}

pub fn signed_launch(user_id: &str, email: &str, nonce: &str) -> Vec<(String, String)> {
    sign(launch_params(user_id, email), CONSUMER_KEY, CONSUMER_SECRET, nonce)
}

pub fn form_body(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Payload for course `team` whose channel templates are the literal names
/// given, taken through the authenticator like any real launch.
pub async fn accepted_payload(
    team: &str,
    public: &[(&str, &str)],
    private: &[(&str, &str)],
) -> LaunchPayload {
    let templates = |pairs: &[(&str, &str)], kind: ChannelKind| {
        pairs
            .iter()
            .map(|(name, display_name)| ChannelTemplate {
                kind,
                name: name.to_string(),
                display_name: display_name.to_string(),
            })
            .collect::<Vec<_>>()
    };
    let mut consumer = Consumer::new("Moodle", CONSUMER_KEY, CONSUMER_SECRET);
    consumer.fields.channels = templates(public, ChannelKind::Open);
    consumer
        .fields
        .channels
        .extend(templates(private, ChannelKind::Private));

    let registry = ConsumerRegistry::from_consumers(vec![consumer]).expect("Invalid consumer");
    let authenticator =
        LaunchAuthenticator::new(Arc::new(registry), Arc::new(MemoryNonceStore::new(16)), 300);

    let mut params = launch_params("u-1", "ada@example.edu");
    for (key, value) in params.iter_mut() {
        if key == "context_id" {
            *value = team.to_string();
        }
    }
    let params = sign(params, CONSUMER_KEY, CONSUMER_SECRET, "payload-n-1");
    let request = LaunchRequest::new("POST", format!("{}{}", SITE_URL, LAUNCH_PATH), params);

    match authenticator.authenticate(request).await.expect("Nonce store failed") {
        AuthOutcome::Accepted(launch) => {
            LaunchPayload::from_launch(&launch).expect("Launch lacks payload fields")
        }
        AuthOutcome::Rejected(reason) => panic!("Launch rejected: {:?}", reason),
    }
}
