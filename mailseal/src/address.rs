use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Canonical comparison form of an address or domain.
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAddress {
    address: String,
    display_name: Option<String>,
}

impl EmailAddress {
    /// Build from a bare address plus an optional display name.
    pub fn new(address: &str, display_name: Option<&str>) -> Result<Self> {
        let address = address.trim();
        validate_address(address)?;
        let display_name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        Ok(Self {
            address: address.to_string(),
            display_name,
        })
    }

    /// Parse a single mailbox: `a@b`, `<a@b>`, `Name <a@b>` or
    /// `"Last, First" <a@b>`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        match (input.rfind('<'), input.ends_with('>')) {
            (Some(open), true) => {
                let address = &input[open + 1..input.len() - 1];
                let name = unquote(input[..open].trim());
                Self::new(address, Some(name.as_str()))
            }
            (None, false) => Self::new(input, None),
            _ => Err(MailError::InvalidMessageContent(format!(
                "malformed address: {input}"
            ))),
        }
    }

    /// Split a header value into mailboxes. Commas inside quoted display
    /// names or angle brackets do not separate entries.
    pub fn parse_list(header: &str) -> Result<Vec<Self>> {
        let mut entries = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_angle = false;
        let mut escaped = false;

        for ch in header.chars() {
            if escaped {
                current.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' if in_quotes => {
                    current.push(ch);
                    escaped = true;
                }
                '"' => {
                    in_quotes = !in_quotes;
                    current.push(ch);
                }
                '<' if !in_quotes => {
                    in_angle = true;
                    current.push(ch);
                }
                '>' if !in_quotes => {
                    in_angle = false;
                    current.push(ch);
                }
                ',' if !in_quotes && !in_angle => {
                    entries.push(std::mem::take(&mut current));
                }
                _ => current.push(ch),
            }
        }
        if in_quotes || in_angle {
            return Err(MailError::InvalidMessageContent(format!(
                "unterminated address list: {header}"
            )));
        }
        entries.push(current);

        entries
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Address as the caller supplied it.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn normalized(&self) -> String {
        normalize(&self.address)
    }

    pub fn local_part(&self) -> &str {
        self.address
            .rsplit_once('@')
            .map(|(local, _)| local)
            .unwrap_or_default()
    }

    /// Normalized domain.
    pub fn domain(&self) -> String {
        self.address
            .rsplit_once('@')
            .map(|(_, domain)| normalize(domain))
            .unwrap_or_default()
    }

    /// Re-check lexical validity; values deserialized from storage bypass
    /// [`EmailAddress::new`].
    pub fn validate(&self) -> Result<()> {
        validate_address(&self.address)
    }
}

fn validate_address(address: &str) -> Result<()> {
    let invalid = || MailError::InvalidMessageContent(format!("invalid email address: {address}"));
    let (local, domain) = address.rsplit_once('@').ok_or_else(invalid)?;
    if local.is_empty()
        || domain.is_empty()
        || domain.starts_with('.')
        || domain.ends_with('.')
        || address.chars().any(|c| c.is_whitespace() || c == '<' || c == '>' || c == ',')
    {
        return Err(invalid());
    }
    Ok(())
}

fn unquote(name: &str) -> String {
    let inner = name
        .strip_prefix('"')
        .and_then(|n| n.strip_suffix('"'))
        .unwrap_or(name);
    inner.replace("\\\"", "\"").replace("\\\\", "\\")
}

impl PartialEq for EmailAddress {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for EmailAddress {}

impl Hash for EmailAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl PartialOrd for EmailAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EmailAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) if name.contains(|c: char| ",;<>\"@".contains(c)) => {
                let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, "\"{}\" <{}>", escaped, self.address)
            }
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_normalized_equality_preserves_display_case() {
        let lower = EmailAddress::parse("alice@sealed.test").unwrap();
        let upper = EmailAddress::parse("Alice <ALICE@Sealed.Test>").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(upper.address(), "ALICE@Sealed.Test");
        assert_eq!(upper.display_name(), Some("Alice"));
        assert_eq!(upper.domain(), "sealed.test");
        assert_eq!(upper.local_part(), "ALICE");
    }

    #[test]
    fn test_rejects_lexically_invalid_addresses() {
        for bad in ["", "no-at-sign", "@example.com", "user@", "a b@example.com", "<a@b"] {
            let err = EmailAddress::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidMessageContent, "{bad}");
        }
    }

    #[test]
    fn test_display_name_with_comma_survives_list_parsing() {
        let list = EmailAddress::parse_list(
            "\"Doe, Jane\" <jane@sealed.test>, bob@external.test,<carol@sealed.test>",
        )
        .unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].display_name(), Some("Doe, Jane"));
        assert_eq!(list[0].address(), "jane@sealed.test");
        assert_eq!(list[1].address(), "bob@external.test");
        assert_eq!(list[2].display_name(), None);
    }

    #[test]
    fn test_display_quotes_special_names() {
        let addr = EmailAddress::new("jane@sealed.test", Some("Doe, Jane")).unwrap();
        let rendered = addr.to_string();
        assert_eq!(rendered, "\"Doe, Jane\" <jane@sealed.test>");
        let reparsed = EmailAddress::parse(&rendered).unwrap();
        assert_eq!(reparsed.display_name(), Some("Doe, Jane"));
    }

    #[test]
    fn test_unterminated_list_is_rejected() {
        assert!(EmailAddress::parse_list("\"Doe, Jane <jane@sealed.test>").is_err());
    }
}
