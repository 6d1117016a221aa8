//! On-demand creation of bridged Matrix identities for Twitch users.
//!
//! Account creation is mandatory; profile enrichment is best-effort and can
//! never undo a created identity. Concurrent first-sight requests for the same
//! username share one in-flight provisioning attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use fancy_regex::Regex;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::bridge::directory::{BridgedRecord, Directory};
use crate::bridge::registry::SessionRegistry;
use crate::common::error::{ConfigError, ProvisioningError};
use crate::common::types::BridgeIdentity;
use crate::matrix::RoomMessenger;
use crate::twitch::api::ProfileLookup;

/// Suffix appended to a Twitch display name on the Matrix side.
pub const DISPLAY_NAME_SUFFIX: &str = " (Twitch)";

/// The appservice user namespace, split around its single `.+` wildcard.
#[derive(Debug, Clone)]
pub struct Namespace {
    prefix: String,
    suffix: String,
    pattern: Regex,
}

impl Namespace {
    /// Parse a registration namespace regex such as `@twitch_.+:example\.org`.
    pub fn parse(regex: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::Validation {
            message: format!("user namespace '{}' {}", regex, reason),
        };

        let body = regex.trim_start_matches('^').trim_end_matches('$');
        let mut parts = body.split(".+");
        let (prefix, suffix) = match (parts.next(), parts.next(), parts.next()) {
            (Some(prefix), Some(suffix), None) => (prefix, suffix),
            _ => return Err(invalid("must contain exactly one '.+'")),
        };

        let prefix = unescape(prefix);
        let suffix = unescape(suffix);
        if !prefix.starts_with('@') || !suffix.starts_with(':') {
            return Err(invalid("must look like '@prefix.+:server'"));
        }

        let pattern = Regex::new(&format!("^{}$", body))
            .map_err(|e| invalid(&format!("is not a valid regex: {}", e)))?;

        Ok(Self {
            prefix,
            suffix,
            pattern,
        })
    }

    /// Deterministic Matrix ID for a Twitch username.
    pub fn user_id(&self, username: &str) -> String {
        format!("{}{}{}", self.prefix, username.to_lowercase(), self.suffix)
    }

    /// Localpart of [`Self::user_id`], as used for registration.
    pub fn localpart(&self, username: &str) -> String {
        format!(
            "{}{}",
            self.prefix.trim_start_matches('@'),
            username.to_lowercase()
        )
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.pattern.is_match(user_id).unwrap_or(false)
    }
}

fn unescape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut chars = part.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

type ProvisionResult = Result<Arc<BridgeIdentity>, ProvisioningError>;
type InflightProvision = Shared<BoxFuture<'static, ProvisionResult>>;

/// Creates bridged identities, one per Twitch username.
pub struct IdentityProvisioner {
    registry: Arc<SessionRegistry>,
    messenger: Arc<dyn RoomMessenger>,
    profiles: Arc<dyn ProfileLookup>,
    directory: Arc<dyn Directory>,
    namespace: Namespace,
    /// Single-flight gate keyed by lowercase username.
    inflight: StdMutex<HashMap<String, InflightProvision>>,
}

impl IdentityProvisioner {
    pub fn new(
        registry: Arc<SessionRegistry>,
        messenger: Arc<dyn RoomMessenger>,
        profiles: Arc<dyn ProfileLookup>,
        directory: Arc<dyn Directory>,
        namespace: Namespace,
    ) -> Self {
        Self {
            registry,
            messenger,
            profiles,
            directory,
            namespace,
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    /// Existing identity for `username`, or a newly provisioned one.
    ///
    /// All concurrent callers for the same unknown username await the same
    /// attempt and observe the same outcome.
    pub async fn resolve(self: &Arc<Self>, username: &str) -> ProvisionResult {
        if let Some(identity) = self.registry.identity(username).await {
            return Ok(identity);
        }

        let key = username.to_lowercase();
        let attempt = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight
                .entry(key.clone())
                .or_insert_with(|| {
                    let this = Arc::clone(self);
                    let key = key.clone();
                    async move { this.provision(&key).await }.boxed().shared()
                })
                .clone()
        };

        let result = attempt.clone().await;

        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if inflight.get(&key).is_some_and(|current| current.ptr_eq(&attempt)) {
            inflight.remove(&key);
        }
        result
    }

    async fn provision(&self, username: &str) -> ProvisionResult {
        // Another attempt may have finished between the caller's lookup and ours.
        if let Some(identity) = self.registry.identity(username).await {
            return Ok(identity);
        }

        match self.profiles.user_exists(username).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(ProvisioningError::UnknownUser {
                    username: username.to_string(),
                })
            }
            Err(e) => {
                return Err(ProvisioningError::Lookup {
                    username: username.to_string(),
                    message: e.to_string(),
                })
            }
        }

        let identity = self.create_account(username).await?;
        self.enrich(&identity).await;

        let identity = self.registry.register_identity(identity).await;
        info!(twitch = %username, user_id = %identity.user_id, "Provisioned bridged identity");

        let record = BridgedRecord {
            user_id: identity.user_id.clone(),
            twitch_name: identity.twitch_name.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.directory.save_bridged(&record).await {
            warn!(user_id = %identity.user_id, "Failed to persist bridged identity: {}", e);
        }

        Ok(identity)
    }

    /// Mandatory step: register the Matrix account.
    async fn create_account(&self, username: &str) -> Result<BridgeIdentity, ProvisioningError> {
        let user_id = self.namespace.user_id(username);
        if !self.namespace.contains(&user_id) {
            return Err(ProvisioningError::Namespace { user_id });
        }

        self.messenger
            .register_user(&self.namespace.localpart(username))
            .await
            .map_err(|e| ProvisioningError::AccountCreation {
                user_id: user_id.clone(),
                message: e.to_string(),
            })?;

        Ok(BridgeIdentity::new(user_id, username.to_lowercase()))
    }

    /// Best-effort step: copy display name and avatar from Twitch.
    async fn enrich(&self, identity: &BridgeIdentity) {
        let profile = match self.profiles.fetch_profile(&identity.twitch_name).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                debug!(twitch = %identity.twitch_name, "No Twitch profile to copy");
                return;
            }
            Err(e) => {
                warn!(twitch = %identity.twitch_name, "Failed to fetch Twitch profile: {}", e);
                return;
            }
        };

        let display_name = format!("{}{}", profile.display_name, DISPLAY_NAME_SUFFIX);
        if let Err(e) = self
            .messenger
            .set_display_name(&identity.credential, &display_name)
            .await
        {
            warn!(user_id = %identity.user_id, "Failed to set display name: {}", e);
        }

        let Some(avatar_url) = profile.avatar_url else {
            return;
        };
        let uploaded = self
            .messenger
            .upload_from_url(&identity.credential, &avatar_url)
            .await;
        match uploaded {
            Ok(content_uri) => {
                if let Err(e) = self
                    .messenger
                    .set_avatar_url(&identity.credential, &content_uri)
                    .await
                {
                    warn!(user_id = %identity.user_id, "Failed to set avatar: {}", e);
                }
            }
            Err(e) => warn!(user_id = %identity.user_id, "Failed to upload avatar: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::testing::{MemoryDirectory, RecordingMessenger, ScriptedProfiles};

    const NAMESPACE: &str = r"@twitch_.+:example\.org";

    struct Fixture {
        registry: Arc<SessionRegistry>,
        messenger: Arc<RecordingMessenger>,
        directory: Arc<MemoryDirectory>,
        provisioner: Arc<IdentityProvisioner>,
    }

    fn fixture(profiles: ScriptedProfiles) -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let messenger = Arc::new(RecordingMessenger::default());
        let directory = Arc::new(MemoryDirectory::default());
        let provisioner = Arc::new(IdentityProvisioner::new(
            registry.clone(),
            messenger.clone(),
            Arc::new(profiles),
            directory.clone(),
            Namespace::parse(NAMESPACE).unwrap(),
        ));
        Fixture {
            registry,
            messenger,
            directory,
            provisioner,
        }
    }

    #[test]
    fn test_namespace_derivation() {
        let namespace = Namespace::parse(NAMESPACE).unwrap();
        assert_eq!(namespace.user_id("Foo"), "@twitch_foo:example.org");
        assert_eq!(namespace.localpart("Foo"), "twitch_foo");
        assert!(namespace.contains("@twitch_foo:example.org"));
        assert!(!namespace.contains("@alice:example.org"));
        assert_ne!(namespace.user_id("foo"), namespace.user_id("foo_"));
    }

    #[test]
    fn test_namespace_anchors_are_ignored() {
        let namespace = Namespace::parse(r"^@tw_.+:hs\.local$").unwrap();
        assert_eq!(namespace.user_id("bar"), "@tw_bar:hs.local");
    }

    #[test]
    fn test_namespace_requires_single_wildcard() {
        assert!(Namespace::parse("@twitch_:example.org").is_err());
        assert!(Namespace::parse("@.+_.+:example.org").is_err());
        assert!(Namespace::parse("twitch_.+").is_err());
    }

    #[tokio::test]
    async fn test_provisions_and_enriches_new_identity() {
        let f = fixture(ScriptedProfiles::new().with_user("foo", "Foo", Some("https://cdn/foo.png")));

        let identity = f.provisioner.resolve("foo").await.unwrap();
        assert_eq!(identity.user_id, "@twitch_foo:example.org");
        assert_eq!(identity.credential.user_id, identity.user_id);

        let calls = f.messenger.calls();
        assert!(calls.contains(&"register_user twitch_foo".to_string()));
        assert!(calls.contains(&"set_display_name @twitch_foo:example.org Foo (Twitch)".to_string()));
        assert!(calls.contains(&"set_avatar_url @twitch_foo:example.org mxc://example.org/avatar".to_string()));

        assert!(f.registry.is_bridged_user("@twitch_foo:example.org").await);
        assert_eq!(f.directory.snapshot().bridged[0].twitch_name, "foo");
    }

    #[tokio::test]
    async fn test_known_identity_is_not_provisioned_again() {
        let f = fixture(ScriptedProfiles::new().with_user("foo", "Foo", None));
        let first = f.provisioner.resolve("foo").await.unwrap();
        let second = f.provisioner.resolve("FOO").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.messenger.count("register_user"), 1);
    }

    #[tokio::test]
    async fn test_unknown_twitch_user_is_rejected() {
        let f = fixture(ScriptedProfiles::new());

        let result = f.provisioner.resolve("ghost").await;
        assert!(matches!(result, Err(ProvisioningError::UnknownUser { .. })));
        assert_eq!(f.messenger.count("register_user"), 0);
        assert!(f.registry.identity("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_account_creation_failure_registers_nothing() {
        let f = fixture(ScriptedProfiles::new().with_user("foo", "Foo", None));
        f.messenger.fail("register_user");

        let result = f.provisioner.resolve("foo").await;
        assert!(matches!(result, Err(ProvisioningError::AccountCreation { .. })));
        assert!(f.registry.identity("foo").await.is_none());
        assert!(f.directory.snapshot().bridged.is_empty());
    }

    #[tokio::test]
    async fn test_enrichment_failures_do_not_invalidate_identity() {
        let f = fixture(ScriptedProfiles::new().with_user("foo", "Foo", Some("https://cdn/foo.png")));
        f.messenger.fail("set_display_name");
        f.messenger.fail("upload_from_url");

        let identity = f.provisioner.resolve("foo").await.unwrap();
        assert_eq!(identity.twitch_name, "foo");
        assert_eq!(f.messenger.count("set_avatar_url"), 0);
        assert!(f.registry.identity("foo").await.is_some());
    }

    #[tokio::test]
    async fn test_profile_fetch_failure_is_non_fatal() {
        let f = fixture(ScriptedProfiles::new().with_user("foo", "Foo", None).failing_fetch());

        assert!(f.provisioner.resolve("foo").await.is_ok());
        assert_eq!(f.messenger.count("set_display_name"), 0);
    }

    #[tokio::test]
    async fn test_directory_failure_keeps_identity_in_memory() {
        let f = fixture(ScriptedProfiles::new().with_user("foo", "Foo", None));
        f.directory.fail_saves();

        assert!(f.provisioner.resolve("foo").await.is_ok());
        assert!(f.registry.identity("foo").await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_first_sight_provisions_once() {
        let f = fixture(
            ScriptedProfiles::new()
                .with_user("foo", "Foo", None)
                .with_delay(Duration::from_millis(50)),
        );

        let attempts = (0..8).map(|_| {
            let provisioner = f.provisioner.clone();
            tokio::spawn(async move { provisioner.resolve("foo").await })
        });
        let results: Vec<_> = futures::future::join_all(attempts).await;

        let identities: Vec<Arc<BridgeIdentity>> = results
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();
        assert!(identities.iter().all(|identity| Arc::ptr_eq(identity, &identities[0])));
        assert_eq!(f.messenger.count("register_user"), 1);
        assert_eq!(f.directory.snapshot().bridged.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_failure() {
        let f = fixture(ScriptedProfiles::new().with_delay(Duration::from_millis(30)));

        let (a, b) = tokio::join!(f.provisioner.resolve("ghost"), f.provisioner.resolve("ghost"));
        assert!(matches!(a, Err(ProvisioningError::UnknownUser { .. })));
        assert!(matches!(b, Err(ProvisioningError::UnknownUser { .. })));
    }
}
