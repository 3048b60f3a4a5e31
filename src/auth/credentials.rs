//! Credential resolution across layered sources.
//!
//! Each logical field is looked up by alias, case-insensitively, first in
//! the high-priority source (environment overrides filtered to `OS_*`) and
//! then in the low-priority source (the declared `keystone` section).

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use tracing::info;
use zeroize::Zeroizing;

use super::{ApiVersion, NegotiationError};

/// Prefix an override key must carry to be considered.
pub const OVERRIDE_PREFIX: &str = "OS_";

/// Flat key/value source of credential values.
pub type CredentialSource = BTreeMap<String, String>;

/// A logical credential field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CredentialField {
    /// User name.
    Username,
    /// User password.
    Password,
    /// Project (tenant) name.
    Project,
    /// Identity endpoint.
    AuthUrl,
    /// Domain of the user (v3 only).
    UserDomain,
    /// Domain of the project (v3 only).
    ProjectDomain,
}

impl CredentialField {
    /// Every field, in resolution order.
    pub const ALL: [Self; 6] = [
        Self::Username,
        Self::Password,
        Self::Project,
        Self::AuthUrl,
        Self::UserDomain,
        Self::ProjectDomain,
    ];

    /// Logical name used in error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Username => "username",
            Self::Password => "password",
            Self::Project => "project",
            Self::AuthUrl => "auth_url",
            Self::UserDomain => "user_domain",
            Self::ProjectDomain => "project_domain",
        }
    }

    /// Accepted lowercase aliases, in lookup order.
    #[must_use]
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::Username => &[
                "os_username",
                "os_user_name",
                "username",
                "user_name",
                "user",
                "os_user",
            ],
            Self::Password => &["os_password", "password", "pass", "os_pass"],
            Self::Project => &[
                "os_tenant_name",
                "os_tenantname",
                "tenant_name",
                "tenantname",
                "tenant",
                "project",
                "project_name",
                "projectname",
            ],
            Self::AuthUrl => &[
                "os_auth_url",
                "os_auth_uri",
                "auth_uri",
                "auth_url",
                "url",
                "uri",
            ],
            Self::UserDomain => &[
                "os_user_domain",
                "user_domain",
                "os_userdomain",
                "userdomain",
                "os_user_domain_name",
                "user_domain_name",
            ],
            Self::ProjectDomain => &[
                "os_project_domain",
                "project_domain",
                "os_projectdomain",
                "projectdomain",
                "os_project_domain_name",
                "project_domain_name",
            ],
        }
    }

    /// Value used when no source defines the field.
    #[must_use]
    pub const fn default_value(self) -> Option<&'static str> {
        match self {
            Self::UserDomain | Self::ProjectDomain => Some("default"),
            _ => None,
        }
    }
}

/// Resolves one field: high-priority aliases first, then low-priority
/// aliases, then the field default.
///
/// # Errors
///
/// Returns [`NegotiationError::CredentialNotFound`] when no alias is present
/// and the field has no default.
pub fn resolve_field(
    low: &CredentialSource,
    high: &CredentialSource,
    field: CredentialField,
) -> Result<String, NegotiationError> {
    [high, low]
        .into_iter()
        .find_map(|source| lookup(source, field.aliases()))
        .map(str::to_owned)
        .or_else(|| field.default_value().map(str::to_owned))
        .ok_or(NegotiationError::CredentialNotFound {
            field: field.name(),
            aliases: field.aliases(),
        })
}

fn lookup<'a>(source: &'a CredentialSource, aliases: &[&str]) -> Option<&'a str> {
    aliases.iter().find_map(|alias| {
        source
            .iter()
            .find(|(key, _)| key.to_ascii_lowercase() == *alias)
            .map(|(_, value)| value.as_str())
    })
}

/// Keeps only override keys starting with [`OVERRIDE_PREFIX`].
pub fn filter_overrides<I, K, V>(overrides: I) -> CredentialSource
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    overrides
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .filter(|(key, _)| key.starts_with(OVERRIDE_PREFIX))
        .collect()
}

/// Flattens the scalar entries of a declared `keystone` section into a
/// credential source. Nested values are ignored.
#[must_use]
pub fn declared_source(section: &Value) -> CredentialSource {
    section
        .as_object()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(key, value)| {
                    let rendered = match value {
                        Value::String(text) => text.clone(),
                        Value::Number(number) => number.to_string(),
                        Value::Bool(flag) => flag.to_string(),
                        _ => return None,
                    };
                    Some((key.clone(), rendered))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Fully resolved credentials, immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Negotiated identity API version.
    pub api_version: ApiVersion,
    /// User name.
    pub username: String,
    /// User password.
    pub password: Zeroizing<String>,
    /// Project (tenant) name.
    pub project: String,
    /// Identity endpoint.
    pub auth_url: String,
    /// User domain.
    pub user_domain: String,
    /// Project domain.
    pub project_domain: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_version", &self.api_version)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project", &self.project)
            .field("auth_url", &self.auth_url)
            .field("user_domain", &self.user_domain)
            .field("project_domain", &self.project_domain)
            .finish()
    }
}

/// Logical fields before the API version is known.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedFields {
    username: String,
    password: Zeroizing<String>,
    project: String,
    auth_url: String,
    user_domain: String,
    project_domain: String,
}

impl fmt::Debug for ResolvedFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedFields")
            .field("username", &self.username)
            .field("auth_url", &self.auth_url)
            .finish_non_exhaustive()
    }
}

impl ResolvedFields {
    /// Resolved identity endpoint.
    #[must_use]
    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// Binds the fields to a negotiated API version.
    #[must_use]
    pub fn with_version(self, api_version: ApiVersion) -> Credentials {
        Credentials {
            api_version,
            username: self.username,
            password: self.password,
            project: self.project,
            auth_url: self.auth_url,
            user_domain: self.user_domain,
            project_domain: self.project_domain,
        }
    }
}

/// Resolves every logical field from the declared section and the process
/// overrides.
///
/// # Errors
///
/// Returns [`NegotiationError::CredentialNotFound`] for the first field no
/// source provides.
pub fn resolve_credentials(
    declared: &CredentialSource,
    overrides: &CredentialSource,
) -> Result<ResolvedFields, NegotiationError> {
    for key in overrides.keys() {
        info!(variable = %key, "using credential override from the environment");
    }
    let field = |field| resolve_field(declared, overrides, field);
    Ok(ResolvedFields {
        username: field(CredentialField::Username)?,
        password: Zeroizing::new(field(CredentialField::Password)?),
        project: field(CredentialField::Project)?,
        auth_url: field(CredentialField::AuthUrl)?,
        user_domain: field(CredentialField::UserDomain)?,
        project_domain: field(CredentialField::ProjectDomain)?,
    })
}

/// Version-specific authentication parameters.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AuthParameters<'a> {
    /// Keystone v2.0 password credentials.
    V2 {
        /// Identity endpoint.
        auth_url: &'a str,
        /// Tenant the token is scoped to.
        tenant_name: &'a str,
        /// User name.
        username: &'a str,
        /// User password.
        password: &'a str,
    },
    /// Keystone v3 password credentials scoped to a project.
    V3 {
        /// Identity endpoint.
        auth_url: &'a str,
        /// User name.
        username: &'a str,
        /// User password.
        password: &'a str,
        /// Domain of the user.
        user_domain_name: &'a str,
        /// Domain of the project.
        project_domain_name: &'a str,
        /// Project the token is scoped to.
        project_name: &'a str,
    },
}

impl fmt::Debug for AuthParameters<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V2 {
                auth_url,
                tenant_name,
                username,
                ..
            } => f
                .debug_struct("V2")
                .field("auth_url", auth_url)
                .field("tenant_name", tenant_name)
                .field("username", username)
                .finish_non_exhaustive(),
            Self::V3 {
                auth_url,
                username,
                project_name,
                ..
            } => f
                .debug_struct("V3")
                .field("auth_url", auth_url)
                .field("username", username)
                .field("project_name", project_name)
                .finish_non_exhaustive(),
        }
    }
}

impl Credentials {
    /// Maps the logical fields onto the parameter set of the negotiated
    /// version.
    #[must_use]
    pub fn auth_parameters(&self) -> AuthParameters<'_> {
        match self.api_version {
            ApiVersion::V2 => AuthParameters::V2 {
                auth_url: &self.auth_url,
                tenant_name: &self.project,
                username: &self.username,
                password: &self.password,
            },
            ApiVersion::V3 => AuthParameters::V3 {
                auth_url: &self.auth_url,
                username: &self.username,
                password: &self.password,
                user_domain_name: &self.user_domain,
                project_domain_name: &self.project_domain,
                project_name: &self.project,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn source(pairs: &[(&str, &str)]) -> CredentialSource {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    fn full_declared() -> CredentialSource {
        source(&[
            ("os_username", "alice"),
            ("password", "secret"),
            ("tenant", "demo"),
            ("auth_url", "https://keystone.example/v3"),
        ])
    }

    #[test]
    fn high_priority_wins_case_insensitively() {
        let low = source(&[("os_username", "a")]);
        let high = source(&[("OS_USERNAME", "b")]);
        let resolved = resolve_field(&low, &high, CredentialField::Username)
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(resolved, "b");
    }

    #[test]
    fn alias_order_decides_within_a_source() {
        let low = source(&[("user", "later"), ("os_username", "first")]);
        let resolved = resolve_field(&low, &CredentialSource::new(), CredentialField::Username)
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(resolved, "first");
    }

    #[rstest]
    #[case(CredentialField::UserDomain)]
    #[case(CredentialField::ProjectDomain)]
    fn domains_default_to_default(#[case] field: CredentialField) {
        let resolved = resolve_field(&CredentialSource::new(), &CredentialSource::new(), field)
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(resolved, "default");
    }

    #[test]
    fn missing_field_names_aliases() {
        let err = resolve_field(
            &CredentialSource::new(),
            &CredentialSource::new(),
            CredentialField::Password,
        )
        .expect_err("password has no default");
        let NegotiationError::CredentialNotFound { field, aliases } = err else {
            panic!("expected CredentialNotFound, got {err:?}");
        };
        assert_eq!(field, "password");
        assert!(aliases.contains(&"os_password"));
    }

    #[test]
    fn overrides_are_filtered_to_os_prefix() {
        let filtered = filter_overrides([
            ("OS_PASSWORD", "hunter2"),
            ("PASSWORD", "ignored"),
            ("os_password", "lowercase"),
        ]);
        assert_eq!(filtered, source(&[("OS_PASSWORD", "hunter2")]));
    }

    #[test]
    fn declared_source_keeps_scalars_only() {
        let declared = declared_source(&json!({
            "username": "alice",
            "api_version": 3,
            "nested": {"x": 1},
            "insecure": false,
        }));
        assert_eq!(
            declared,
            source(&[("api_version", "3"), ("insecure", "false"), ("username", "alice")])
        );
    }

    #[test]
    fn v2_parameters_map_project_to_tenant() {
        let fields = resolve_credentials(&full_declared(), &CredentialSource::new())
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        let credentials = fields.with_version(ApiVersion::V2);
        let AuthParameters::V2 {
            tenant_name,
            username,
            ..
        } = credentials.auth_parameters()
        else {
            panic!("expected v2 parameters");
        };
        assert_eq!(tenant_name, "demo");
        assert_eq!(username, "alice");
    }

    #[test]
    fn v3_parameters_include_domains() {
        let overrides = source(&[("OS_USER_DOMAIN_NAME", "corp")]);
        let credentials = resolve_credentials(&full_declared(), &overrides)
            .unwrap_or_else(|err| panic!("resolve: {err}"))
            .with_version(ApiVersion::V3);
        let AuthParameters::V3 {
            user_domain_name,
            project_domain_name,
            project_name,
            ..
        } = credentials.auth_parameters()
        else {
            panic!("expected v3 parameters");
        };
        assert_eq!(user_domain_name, "corp");
        assert_eq!(project_domain_name, "default");
        assert_eq!(project_name, "demo");
    }

    #[test]
    fn debug_output_never_contains_password() {
        let credentials = resolve_credentials(&full_declared(), &CredentialSource::new())
            .unwrap_or_else(|err| panic!("resolve: {err}"))
            .with_version(ApiVersion::V3);
        assert!(!format!("{credentials:?}").contains("secret"));
        assert!(!format!("{:?}", credentials.auth_parameters()).contains("secret"));
    }
}
