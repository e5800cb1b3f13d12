//! Request identity: the header map a harness carries on behalf of the
//! code under test, and the user record written into it.

use std::collections::BTreeMap;

pub const USER_EMAIL_HEADER: &str = "X-AppEngine-Internal-User-Email";
pub const USER_ID_HEADER: &str = "X-AppEngine-Internal-User-Id";
pub const USER_IS_ADMIN_HEADER: &str = "X-AppEngine-Internal-User-Is-Admin";
pub const USER_FEDERATED_IDENTITY_HEADER: &str = "X-AppEngine-Internal-User-Federated-Identity";
pub const CURRENT_NAMESPACE_HEADER: &str = "X-AppEngine-Current-Namespace";
pub const DEFAULT_NAMESPACE_HEADER: &str = "X-AppEngine-Default-Namespace";

/// Headers written by login and cleared by logout.
const USER_HEADERS: [&str; 4] = [
    USER_EMAIL_HEADER,
    USER_ID_HEADER,
    USER_IS_ADMIN_HEADER,
    USER_FEDERATED_IDENTITY_HEADER,
];

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Stable user id for an email: decimal CRC-32 of its bytes.
pub fn derive_user_id(email: &str) -> String {
    CRC32.checksum(email.as_bytes()).to_string()
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub email: String,
    /// Derived from the email when `None`.
    pub id: Option<String>,
    pub admin: bool,
    /// Defaults to the email when `None`.
    pub federated_identity: Option<String>,
}

impl User {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            id: None,
            admin: false,
            federated_identity: None,
        }
    }

    pub fn admin(email: impl Into<String>) -> Self {
        Self {
            admin: true,
            ..Self::new(email)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_federated_identity(mut self, identity: impl Into<String>) -> Self {
        self.federated_identity = Some(identity.into());
        self
    }

    pub fn resolved_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| derive_user_id(&self.email))
    }
}

// ---------------------------------------------------------------------------
// Header map
// ---------------------------------------------------------------------------

/// Per-harness request headers. Not synchronized; one owner at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    map: BTreeMap<String, String>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.map.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.map.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Replace any previous identity with `user`.
    pub fn login(&mut self, user: &User) {
        self.logout();
        self.set(USER_EMAIL_HEADER, user.email.clone());
        self.set(USER_ID_HEADER, user.resolved_id());
        self.set(USER_IS_ADMIN_HEADER, if user.admin { "1" } else { "0" });
        self.set(
            USER_FEDERATED_IDENTITY_HEADER,
            user.federated_identity
                .clone()
                .unwrap_or_else(|| user.email.clone()),
        );
    }

    /// Remove exactly the headers written by [`login`](Self::login).
    pub fn logout(&mut self) {
        for name in USER_HEADERS {
            self.map.remove(name);
        }
    }

    pub fn user(&self) -> Option<User> {
        let email = self.get(USER_EMAIL_HEADER)?;
        Some(User {
            email: email.to_string(),
            id: self.get(USER_ID_HEADER).map(str::to_string),
            admin: self.get(USER_IS_ADMIN_HEADER) == Some("1"),
            federated_identity: self.get(USER_FEDERATED_IDENTITY_HEADER).map(str::to_string),
        })
    }

    /// Current namespace, `""` when unset.
    pub fn namespace(&self) -> &str {
        self.get(CURRENT_NAMESPACE_HEADER).unwrap_or_default()
    }

    /// Set the current namespace; an empty string clears it.
    pub fn set_namespace(&mut self, namespace: &str) {
        if namespace.is_empty() {
            self.map.remove(CURRENT_NAMESPACE_HEADER);
        } else {
            self.set(CURRENT_NAMESPACE_HEADER, namespace);
        }
    }

    pub fn default_namespace(&self) -> &str {
        self.get(DEFAULT_NAMESPACE_HEADER).unwrap_or_default()
    }
}
