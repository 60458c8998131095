//! Credential resolution
//!
//! Providers resolve the credentials the store is accessed with,
//! optionally for a specific target account:
//! - `StaticCredentialProvider`: fixed credentials, for tests and embedding
//! - `EnvCredentialProvider`: `AWS_*` environment variables
//! - `AssumeRoleProvider`: wraps a base provider and switches accounts
//!   through a caller-supplied role assumption function

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const ENV_ACCOUNT_ID: &str = "AWS_ACCOUNT_ID";
pub const ENV_PRINCIPAL: &str = "AWS_PRINCIPAL";

/// Resolved credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// Account the credentials act in, when known
    pub account_id: Option<String>,
    /// Identity recorded as the creator of published versions
    pub principal: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            account_id: None,
            principal: None,
            expires_at: None,
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("account_id", &self.account_id)
            .field("principal", &self.principal)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credential errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no credentials found: {0}")]
    NotFound(String),

    #[error("credentials are for account {actual:?}, target is {expected}")]
    AccountMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[error("assuming role in {account} failed: {message}")]
    AssumeRole { account: String, message: String },

    #[error("credentials expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Source of credentials
pub trait CredentialProvider: Send + Sync {
    /// Credentials acting in `target_account`, or the provider's own
    /// account when `None`
    fn get_credentials(&self, target_account: Option<&str>)
        -> Result<Credentials, CredentialError>;
}

fn check_account(creds: &Credentials, target: Option<&str>) -> Result<(), CredentialError> {
    match target {
        Some(expected) if creds.account_id.as_deref() != Some(expected) => {
            Err(CredentialError::AccountMismatch {
                expected: expected.to_string(),
                actual: creds.account_id.clone(),
            })
        }
        _ => Ok(()),
    }
}

fn check_expiry(creds: &Credentials) -> Result<(), CredentialError> {
    match creds.expires_at {
        Some(at) if creds.is_expired(Utc::now()) => Err(CredentialError::Expired(at)),
        _ => Ok(()),
    }
}

/// Fixed credentials
pub struct StaticCredentialProvider {
    credentials: Credentials,
}

impl StaticCredentialProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get_credentials(
        &self,
        target_account: Option<&str>,
    ) -> Result<Credentials, CredentialError> {
        check_expiry(&self.credentials)?;
        check_account(&self.credentials, target_account)?;
        Ok(self.credentials.clone())
    }
}

/// Credentials from `AWS_*` variables
///
/// Variables are captured at construction, so a provider never observes
/// later changes to the process environment.
pub struct EnvCredentialProvider {
    vars: HashMap<String, String>,
}

impl EnvCredentialProvider {
    /// Capture the current process environment
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Use `vars` in place of the process environment
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .filter(|(k, _)| k.starts_with("AWS_"))
                .collect(),
        }
    }

    fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn get_credentials(
        &self,
        target_account: Option<&str>,
    ) -> Result<Credentials, CredentialError> {
        let (Some(key_id), Some(secret)) =
            (self.var(ENV_ACCESS_KEY_ID), self.var(ENV_SECRET_ACCESS_KEY))
        else {
            return Err(CredentialError::NotFound(format!(
                "{} and {} must both be set",
                ENV_ACCESS_KEY_ID, ENV_SECRET_ACCESS_KEY
            )));
        };

        let mut creds = Credentials::new(key_id, secret);
        creds.session_token = self.var(ENV_SESSION_TOKEN).map(str::to_string);
        creds.account_id = self.var(ENV_ACCOUNT_ID).map(str::to_string);
        creds.principal = self.var(ENV_PRINCIPAL).map(str::to_string);

        check_account(&creds, target_account)?;
        debug!(account = ?creds.account_id, "credentials from environment");
        Ok(creds)
    }
}

/// Role assumption capability: base credentials and target account in,
/// credentials for that account out
pub type AssumeRoleFn =
    Box<dyn Fn(&Credentials, &str) -> Result<Credentials, String> + Send + Sync>;

/// Switches accounts by assuming a role when the base credentials act
/// elsewhere
pub struct AssumeRoleProvider {
    base: Box<dyn CredentialProvider>,
    assume: AssumeRoleFn,
}

impl AssumeRoleProvider {
    pub fn new(base: Box<dyn CredentialProvider>, assume: AssumeRoleFn) -> Self {
        Self { base, assume }
    }
}

impl CredentialProvider for AssumeRoleProvider {
    fn get_credentials(
        &self,
        target_account: Option<&str>,
    ) -> Result<Credentials, CredentialError> {
        let base = self.base.get_credentials(None)?;
        let Some(target) = target_account else {
            return Ok(base);
        };
        if base.account_id.as_deref() == Some(target) {
            return Ok(base);
        }

        debug!(account = target, "assuming role");
        let assumed = (self.assume)(&base, target).map_err(|message| {
            CredentialError::AssumeRole {
                account: target.to_string(),
                message,
            }
        })?;
        check_expiry(&assumed)?;
        check_account(&assumed, Some(target))?;
        Ok(assumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn env(account: Option<&str>) -> EnvCredentialProvider {
        let mut vars = vec![
            (ENV_ACCESS_KEY_ID, "AKIDEXAMPLE"),
            (ENV_SECRET_ACCESS_KEY, "secret"),
            (ENV_PRINCIPAL, "ci-bot"),
            ("HOME", "/root"),
        ];
        if let Some(account) = account {
            vars.push((ENV_ACCOUNT_ID, account));
        }
        EnvCredentialProvider::from_vars(vars)
    }

    #[test]
    fn test_env_provider_reads_vars() {
        let creds = env(Some("111111111111")).get_credentials(None).unwrap();
        assert_eq!(creds.access_key_id, "AKIDEXAMPLE");
        assert_eq!(creds.account_id.as_deref(), Some("111111111111"));
        assert_eq!(creds.principal.as_deref(), Some("ci-bot"));
        assert!(creds.session_token.is_none());
    }

    #[test]
    fn test_env_provider_missing_secret() {
        let provider = EnvCredentialProvider::from_vars([(ENV_ACCESS_KEY_ID, "AKID")]);
        let err = provider.get_credentials(None).unwrap_err();
        assert!(matches!(err, CredentialError::NotFound(_)));
    }

    #[test]
    fn test_env_provider_account_must_match() {
        let provider = env(Some("111111111111"));
        assert!(provider.get_credentials(Some("111111111111")).is_ok());

        match provider.get_credentials(Some("222222222222")).unwrap_err() {
            CredentialError::AccountMismatch { expected, actual } => {
                assert_eq!(expected, "222222222222");
                assert_eq!(actual.as_deref(), Some("111111111111"));
            }
            err => panic!("Expected AccountMismatch, got {:?}", err),
        }

        let err = env(None).get_credentials(Some("111111111111")).unwrap_err();
        assert!(matches!(err, CredentialError::AccountMismatch { actual: None, .. }));
    }

    #[test]
    fn test_assume_role_switches_account() {
        let provider = AssumeRoleProvider::new(
            Box::new(env(Some("111111111111"))),
            Box::new(|base, account| {
                Ok(Credentials::new(format!("{}-assumed", base.access_key_id), "s2")
                    .with_account(account)
                    .with_principal("deployer"))
            }),
        );

        let creds = provider.get_credentials(Some("222222222222")).unwrap();
        assert_eq!(creds.access_key_id, "AKIDEXAMPLE-assumed");
        assert_eq!(creds.account_id.as_deref(), Some("222222222222"));

        let own = provider.get_credentials(Some("111111111111")).unwrap();
        assert_eq!(own.access_key_id, "AKIDEXAMPLE");
    }

    #[test]
    fn test_assume_role_failure() {
        let provider = AssumeRoleProvider::new(
            Box::new(env(Some("111111111111"))),
            Box::new(|_, _| Err("access denied".to_string())),
        );
        let err = provider.get_credentials(Some("222222222222")).unwrap_err();
        assert!(matches!(err, CredentialError::AssumeRole { ref message, .. } if message == "access denied"));
    }

    #[test]
    fn test_expired_static_credentials() {
        let provider = StaticCredentialProvider::new(
            Credentials::new("a", "b").with_expiry(Utc::now() - ChronoDuration::minutes(5)),
        );
        assert!(matches!(
            provider.get_credentials(None).unwrap_err(),
            CredentialError::Expired(_)
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new("AKID", "topsecret").with_session_token("tok");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("topsecret"));
        assert!(!rendered.contains("tok\""));
    }
}
