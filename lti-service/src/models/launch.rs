//! Launch requests and the payload derived from an accepted launch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

use super::{ChannelKind, Consumer, UserHint};

pub const CONSUMER_KEY_PARAM: &str = "oauth_consumer_key";
pub const SIGNATURE_METHOD_PARAM: &str = "oauth_signature_method";
pub const TIMESTAMP_PARAM: &str = "oauth_timestamp";
pub const NONCE_PARAM: &str = "oauth_nonce";
pub const VERSION_PARAM: &str = "oauth_version";

const MAX_SLUG_LEN: usize = 64;

/// Raw inbound launch as seen by the service.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub method: String,
    /// Scheme, host and path the LMS posted to. The signature covers it.
    pub url: String,
    /// Every form pair in arrival order, duplicates included.
    pub params: Vec<(String, String)>,
}

impl LaunchRequest {
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        params: Vec<(String, String)>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            params,
        }
    }

    /// First value for `name`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Form view: duplicate keys keep their first value.
    pub fn form(&self) -> HashMap<String, String> {
        let mut form = HashMap::with_capacity(self.params.len());
        for (k, v) in &self.params {
            form.entry(k.clone()).or_insert_with(|| v.clone());
        }
        form
    }

    pub fn consumer_key(&self) -> Option<&str> {
        self.param(CONSUMER_KEY_PARAM).filter(|k| !k.is_empty())
    }
}

/// A launch that passed authentication, together with the consumer that
/// signed it. Only the authenticator creates these.
#[derive(Debug, Clone)]
pub struct AuthenticatedLaunch {
    consumer: Arc<Consumer>,
    request: LaunchRequest,
}

impl AuthenticatedLaunch {
    pub(crate) fn new(consumer: Arc<Consumer>, request: LaunchRequest) -> Self {
        Self { consumer, request }
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    pub fn request(&self) -> &LaunchRequest {
        &self.request
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("launch is missing the {0} field")]
    MissingField(&'static str),
}

/// Onboarding instructions extracted from an authenticated launch. The only
/// constructor is [`LaunchPayload::from_launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPayload {
    consumer_key: String,
    user: UserHint,
    team_slug: String,
    /// slug -> display name
    public_channels: BTreeMap<String, String>,
    private_channels: BTreeMap<String, String>,
}

impl LaunchPayload {
    pub fn consumer_key(&self) -> &str {
        &self.consumer_key
    }

    pub fn user(&self) -> &UserHint {
        &self.user
    }

    pub fn team_slug(&self) -> &str {
        &self.team_slug
    }

    /// Open channels, slug -> display name.
    pub fn public_channels(&self) -> &BTreeMap<String, String> {
        &self.public_channels
    }

    pub fn private_channels(&self) -> &BTreeMap<String, String> {
        &self.private_channels
    }

    /// Apply the consumer's field mapping to the launch parameters.
    pub fn from_launch(launch: &AuthenticatedLaunch) -> Result<Self, PayloadError> {
        let consumer = launch.consumer();
        let fields = &consumer.fields;
        let form = launch.request().form();

        let value = |name: &str| {
            form.get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let external_id = value(&fields.user_id).ok_or(PayloadError::MissingField("user id"))?;
        let email = value(&fields.email).ok_or(PayloadError::MissingField("email"))?;
        let course = value(&fields.team.field).ok_or(PayloadError::MissingField("team"))?;

        let team_slug = fields
            .team
            .teams
            .get(&course)
            .cloned()
            .unwrap_or(course);

        let mut public_channels = BTreeMap::new();
        let mut private_channels = BTreeMap::new();
        for template in &fields.channels {
            let rendered = render(&template.name, &form)
                .map(|name| slugify(&name))
                .filter(|slug| !slug.is_empty());
            let display_name = render(&template.display_name, &form);

            let (Some(slug), Some(display_name)) = (rendered, display_name) else {
                tracing::warn!(
                    consumer = %consumer.name,
                    template = %template.name,
                    "Skipping channel template with unresolved launch fields"
                );
                continue;
            };

            match template.kind {
                ChannelKind::Open => public_channels.entry(slug).or_insert(display_name),
                ChannelKind::Private => private_channels.entry(slug).or_insert(display_name),
            };
        }

        Ok(Self {
            consumer_key: consumer.consumer_key.clone(),
            user: UserHint {
                external_id,
                email,
                username: value(&fields.username),
                first_name: value(&fields.first_name),
                last_name: value(&fields.last_name),
            },
            team_slug,
            public_channels,
            private_channels,
        })
    }
}

/// Substitute `{param}` placeholders. None when a referenced parameter is
/// absent or empty.
fn render(template: &str, form: &HashMap<String, String>) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}')?;
        let value = form.get(&after[..end]).filter(|v| !v.trim().is_empty())?;
        out.push_str(value.trim());
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Some(out)
}

/// Channel names are lower case `[a-z0-9_-]`, at most 64 characters.
pub fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut pending_dash = false;

    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }

    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
    }
    slug.trim_end_matches('-').to_string()
}
