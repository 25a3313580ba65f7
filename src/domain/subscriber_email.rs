use std::fmt::Display;

use validator::ValidateEmail;

/// A syntactically valid email address, with surrounding whitespace removed.
/// Used for subscribers, explicit recipients and the sender alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberEmail(String);

impl SubscriberEmail {
    pub fn parse(email: String) -> Result<Self, String> {
        let email = email.trim().to_string();
        ValidateEmail::validate_email(&email)
            .then_some(Self(email.clone()))
            .ok_or(format!("Invalid email: {email:?}"))
    }

    /// Two addresses that only differ in case reach the same mailbox as far as
    /// we are concerned.
    pub fn dedup_key(&self) -> String { self.0.to_lowercase() }
}

impl AsRef<str> for SubscriberEmail {
    fn as_ref(&self) -> &str { &self.0 }
}

impl Display for SubscriberEmail {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
