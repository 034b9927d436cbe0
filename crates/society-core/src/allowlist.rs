use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use society_api::{Role, SocietyError};

const BUILTIN_TABLE: &[(Role, &[&str])] = &[
    (Role::Eb, &["eb@society.com", "eb1@society.com", "eb2@society.com"]),
    (Role::Ec, &["ec@society.com", "ec1@society.com", "ec2@society.com"]),
    (
        Role::Core,
        &["core@society.com", "core1@society.com", "core2@society.com"],
    ),
    (
        Role::Member,
        &[
            "member@society.com",
            "member1@society.com",
            "member2@society.com",
            "member3@society.com",
        ],
    ),
];

static BUILTIN: Lazy<Allowlist> = Lazy::new(|| Allowlist::from_trusted(BUILTIN_TABLE));

/// Which emails may sign in under which role.
///
/// Entries are stored lowercased; lookups lowercase the candidate email, so
/// matching is case-insensitive. A role with no entry permits nobody.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    roles: BTreeMap<Role, BTreeSet<String>>,
}

impl Allowlist {
    /// The fixed society table.
    pub fn builtin() -> &'static Allowlist {
        &BUILTIN
    }

    pub fn from_entries<I, E, S>(entries: I) -> Result<Self, SocietyError>
    where
        I: IntoIterator<Item = (Role, E)>,
        E: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut roles: BTreeMap<Role, BTreeSet<String>> = BTreeMap::new();
        for (role, emails) in entries {
            let set = roles.entry(role).or_default();
            for email in emails {
                let email = normalize(email.as_ref());
                if !email.contains('@') {
                    return Err(SocietyError::Validation(format!(
                        "allowlist entry {email:?} for role {role} is not an email address"
                    )));
                }
                set.insert(email);
            }
        }
        Ok(Self { roles })
    }

    fn from_trusted(entries: &[(Role, &[&str])]) -> Self {
        let roles = entries
            .iter()
            .map(|(role, emails)| (*role, emails.iter().map(|e| normalize(e)).collect()))
            .collect();
        Self { roles }
    }

    /// Exact match on the lowercased email. Surrounding whitespace is not
    /// stripped.
    pub fn permits(&self, email: &str, role: Role) -> bool {
        self.roles
            .get(&role)
            .is_some_and(|set| set.contains(&email.to_lowercase()))
    }

    pub fn emails(&self, role: Role) -> impl Iterator<Item = &str> {
        self.roles
            .get(&role)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }
}

fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_matches_roles() {
        let table = Allowlist::builtin();
        assert!(table.permits("eb2@society.com", Role::Eb));
        assert!(table.permits("member3@society.com", Role::Member));
        assert!(!table.permits("member3@society.com", Role::Core));
        assert!(!table.permits("eb@society.com", Role::Ec));
        assert_eq!(table.emails(Role::Member).count(), 4);
        assert_eq!(table.emails(Role::Core).count(), 3);
    }

    #[test]
    fn lookup_ignores_case() {
        let table = Allowlist::builtin();
        assert!(table.permits("EB@Society.com", Role::Eb));
        assert!(table.permits("CORE1@SOCIETY.COM", Role::Core));
    }

    #[test]
    fn every_builtin_email_is_permitted_only_for_its_role() {
        let table = Allowlist::builtin();
        for role in Role::ALL {
            for email in table.emails(role) {
                for other in Role::ALL {
                    assert_eq!(table.permits(email, other), role == other, "{email} {other}");
                }
            }
        }
    }

    #[test]
    fn padded_emails_are_not_permitted() {
        let table = Allowlist::builtin();
        assert!(!table.permits(" eb@society.com ", Role::Eb));
        assert!(!table.permits("member@society.com\n", Role::Member));
    }

    #[test]
    fn custom_entries_are_lowercased() {
        let table = Allowlist::from_entries([(Role::Core, [" Lead@Example.org"])]).unwrap();
        assert!(table.permits("lead@example.org", Role::Core));
        assert!(table.permits("LEAD@example.org", Role::Core));
        assert!(!table.permits("lead@example.org", Role::Member));
    }

    #[test]
    fn custom_entries_must_look_like_emails() {
        let err = Allowlist::from_entries([(Role::Eb, ["nobody"])]).unwrap_err();
        assert!(matches!(err, SocietyError::Validation(_)));
    }
}
