//! Mapping between profile documents and [`User`] values.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use society_api::{Document, Identity, Role, User};

pub const FIELD_NAME: &str = "name";
pub const FIELD_EMAIL: &str = "email";
pub const FIELD_ROLE: &str = "role";
pub const FIELD_CREATED_AT: &str = "createdAt";

const FALLBACK_NAME: &str = "User";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredProfile {
    name: Option<String>,
    email: Option<String>,
    role: Role,
    created_at: DateTime<Utc>,
}

/// Display name for a login: the given name if non-empty, else the email's
/// local part, else `"User"`. The given name is kept as-is.
pub fn display_name(given: Option<&str>, email: Option<&str>) -> String {
    given
        .filter(|n| !n.is_empty())
        .or_else(|| email.and_then(local_part))
        .unwrap_or(FALLBACK_NAME)
        .to_string()
}

fn local_part(email: &str) -> Option<&str> {
    email.split('@').next().filter(|p| !p.is_empty())
}

/// Fields written on login. `created_at` is left out when `None` so a merge
/// keeps the stored value.
pub fn profile_fields(
    identity: &Identity,
    fallback_email: &str,
    role: Role,
    name: Option<&str>,
    created_at: Option<DateTime<Utc>>,
) -> Document {
    let email = identity.email.as_deref().unwrap_or(fallback_email);

    let mut fields = Document::new();
    fields.insert(
        FIELD_NAME.to_string(),
        Value::String(display_name(name, Some(email))),
    );
    fields.insert(FIELD_EMAIL.to_string(), Value::String(email.to_string()));
    fields.insert(FIELD_ROLE.to_string(), Value::String(role.as_str().to_string()));
    if let Some(ts) = created_at {
        fields.insert(FIELD_CREATED_AT.to_string(), Value::String(ts.to_rfc3339()));
    }
    fields
}

/// Builds the local user from a stored profile. The identity's verified
/// email wins over the stored one.
pub fn user_from_document(identity: &Identity, doc: Document) -> Result<User, serde_json::Error> {
    let profile: StoredProfile = serde_json::from_value(Value::Object(doc))?;
    let email = identity
        .email
        .clone()
        .or(profile.email)
        .unwrap_or_default();
    let name = match profile.name {
        Some(name) if !name.is_empty() => name,
        _ => display_name(None, Some(email.as_str())),
    };

    Ok(User {
        id: identity.id.clone(),
        email,
        role: profile.role,
        name,
        created_at: profile.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(email: Option<&str>) -> Identity {
        Identity {
            id: "u1".to_string(),
            email: email.map(str::to_string),
        }
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    #[test]
    fn display_name_fallbacks() {
        assert_eq!(display_name(Some("Alice"), Some("member@society.com")), "Alice");
        assert_eq!(display_name(Some(""), Some("member@society.com")), "member");
        assert_eq!(display_name(Some("  "), Some("member@society.com")), "  ");
        assert_eq!(display_name(None, Some("core1@society.com")), "core1");
        assert_eq!(display_name(None, Some("@society.com")), "User");
        assert_eq!(display_name(None, None), "User");
    }

    #[test]
    fn fields_carry_role_and_optional_timestamp() {
        let id = identity(Some("eb@society.com"));
        let fields = profile_fields(&id, "EB@Society.com", Role::Eb, None, None);
        assert_eq!(fields[FIELD_NAME], "eb");
        assert_eq!(fields[FIELD_EMAIL], "eb@society.com");
        assert_eq!(fields[FIELD_ROLE], "EB");
        assert!(!fields.contains_key(FIELD_CREATED_AT));

        let ts = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let fields = profile_fields(
            &identity(None),
            "ec@society.com",
            Role::Ec,
            Some("Eve"),
            Some(ts),
        );
        assert_eq!(fields[FIELD_EMAIL], "ec@society.com");
        assert_eq!(fields[FIELD_NAME], "Eve");
        assert_eq!(fields[FIELD_CREATED_AT], "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn user_prefers_identity_email() {
        let user = user_from_document(
            &identity(Some("member@society.com")),
            doc(json!({
                "name": "Alice",
                "email": "stale@society.com",
                "role": "Member",
                "createdAt": "2024-05-01T10:00:00+00:00"
            })),
        )
        .unwrap();
        assert_eq!(user.email, "member@society.com");
        assert_eq!(user.name, "Alice");
        assert_eq!(user.role, Role::Member);
        assert_eq!(user.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn missing_name_defaults_to_local_part() {
        let user = user_from_document(
            &identity(None),
            doc(json!({
                "email": "core2@society.com",
                "role": "Core",
                "createdAt": "2024-05-01T10:00:00Z"
            })),
        )
        .unwrap();
        assert_eq!(user.email, "core2@society.com");
        assert_eq!(user.name, "core2");
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let id = identity(Some("eb@society.com"));
        assert!(user_from_document(&id, doc(json!({ "role": "EB" }))).is_err());
        assert!(
            user_from_document(
                &id,
                doc(json!({ "role": "Admin", "createdAt": "2024-05-01T10:00:00Z" }))
            )
            .is_err()
        );
    }
}
