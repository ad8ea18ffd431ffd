//! Domain ID generation
//!
//! All IDs use the format: `{8-char-hex}-{type}-{slug}`
//! Example: `9f3b21ac-plan-dark-mode-toggle`

/// Generate a domain ID from type and title.
///
/// The hex prefix comes from the random tail of a v7 UUID, so two
/// entities sharing a slug (a ping-pong step rerunning the same task)
/// still get distinct ids.
pub fn generate_id(domain_type: &str, title: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    let hex_prefix = &uuid[uuid.len() - 8..];
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-{}", hex_prefix, domain_type)
    } else {
        format!("{}-{}-{}", hex_prefix, domain_type, slug)
    }
}

/// Slugify a title for use in IDs
fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("-")
}

/// Domain ID wrapper for type-safe ID handling
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainId(String);

impl DomainId {
    /// Create a new domain ID from type and title
    pub fn new(domain_type: &str, title: &str) -> Self {
        Self(generate_id(domain_type, title))
    }

    /// Get the full ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the type portion
    pub fn domain_type(&self) -> Option<&str> {
        let parts: Vec<&str> = self.0.splitn(3, '-').collect();
        parts.get(1).copied()
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DomainId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DomainId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for DomainId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
