// ── User directory ──
//
// Cache of account users keyed by vendor user id. Lock operations name
// their operator by id only; the normalizer looks names and avatars up
// here. One directory per client, passed in explicitly.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// A cached account user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub user_type: Option<String>,
}

impl User {
    /// Build from a vendor user record (`FirstName`, `LastName`, `imageInfo`).
    pub fn from_record(user_id: &str, raw: &Value) -> Self {
        let text = |v: Option<&Value>| v.and_then(Value::as_str).map(String::from);
        Self {
            user_id: user_id.to_owned(),
            first_name: text(raw.get("FirstName")),
            last_name: text(raw.get("LastName")),
            image_url: text(raw.pointer("/imageInfo/original/secure_url")),
            thumbnail_url: text(raw.pointer("/imageInfo/thumbnail/secure_url")),
            user_type: text(raw.get("UserType")),
        }
    }
}

#[derive(Debug, Default)]
pub struct UserDirectory {
    users: DashMap<String, Arc<User>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_user(&self, user_id: &str) -> Option<Arc<User>> {
        self.users.get(user_id).map(|u| Arc::clone(u.value()))
    }

    /// Remember a user record. The first record seen for an id is kept.
    pub fn cache_user(&self, user_id: &str, raw: &Value) {
        self.users
            .entry(user_id.to_owned())
            .or_insert_with(|| Arc::new(User::from_record(user_id, raw)));
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn caches_names_and_images() {
        let users = UserDirectory::new();
        users.cache_user(
            "u1",
            &json!({
                "FirstName": "bob",
                "LastName": "smith",
                "UserType": "superuser",
                "imageInfo": {
                    "original": { "secure_url": "https://img/original.png" },
                    "thumbnail": { "secure_url": "https://img/thumb.png" }
                }
            }),
        );

        let user = users.get_user("u1").unwrap();
        assert_eq!(user.first_name.as_deref(), Some("bob"));
        assert_eq!(user.last_name.as_deref(), Some("smith"));
        assert_eq!(user.image_url.as_deref(), Some("https://img/original.png"));
        assert_eq!(user.thumbnail_url.as_deref(), Some("https://img/thumb.png"));
        assert_eq!(user.user_type.as_deref(), Some("superuser"));
    }

    #[test]
    fn first_record_wins() {
        let users = UserDirectory::new();
        users.cache_user("u1", &json!({ "FirstName": "first" }));
        users.cache_user("u1", &json!({ "FirstName": "second" }));

        assert_eq!(users.len(), 1);
        assert_eq!(users.get_user("u1").unwrap().first_name.as_deref(), Some("first"));
    }

    #[test]
    fn unknown_user_is_absent() {
        let users = UserDirectory::new();
        assert!(users.get_user("nobody").is_none());
        assert!(users.is_empty());
    }
}
