use crate::address::normalize;
use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_MAX_OUTBOUND_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Domains whose addresses are served (and keyed) by this service.
    pub hosted_domains: Vec<String>,
    pub max_batch_size: usize,
    /// Page size used when a query carries no explicit limit.
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Ceiling on the sealed size of body plus attachments.
    pub max_outbound_message_bytes: usize,
    pub blocked_attachment_extensions: Vec<String>,
    pub blocked_attachment_mime_types: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            hosted_domains: Vec::new(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            max_outbound_message_bytes: DEFAULT_MAX_OUTBOUND_MESSAGE_BYTES,
            blocked_attachment_extensions: [
                "ade", "adp", "app", "bat", "chm", "cmd", "com", "cpl", "dll", "exe", "hta",
                "jar", "js", "jse", "lnk", "msc", "msi", "msp", "pif", "ps1", "reg", "scr",
                "sct", "sh", "shs", "vb", "vbe", "vbs", "wsc", "wsf", "wsh",
            ]
            .iter()
            .map(|ext| ext.to_string())
            .collect(),
            blocked_attachment_mime_types: [
                "application/x-msdownload",
                "application/x-msdos-program",
                "application/x-sh",
                "application/x-bat",
                "application/java-archive",
                "application/javascript",
            ]
            .iter()
            .map(|mime| mime.to_string())
            .collect(),
        }
    }
}

impl CoreConfig {
    pub fn with_hosted_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosted_domains: domains.into_iter().map(|d| normalize(d.as_ref())).collect(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(json)
            .map_err(|e| MailError::InvalidArgument(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(MailError::InvalidArgument(format!("config: {msg}")));
        if self.max_batch_size == 0 {
            return invalid("max_batch_size must be positive");
        }
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return invalid("page sizes must be positive");
        }
        if self.default_page_size > self.max_page_size {
            return invalid("default_page_size exceeds max_page_size");
        }
        if self.max_outbound_message_bytes == 0 {
            return invalid("max_outbound_message_bytes must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_batch_size, 100);
        assert!(config.blocked_attachment_extensions.iter().any(|e| e == "exe"));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config =
            CoreConfig::from_json(r#"{"hosted_domains":["sealed.test"],"max_batch_size":5}"#)
                .unwrap();
        assert_eq!(config.max_batch_size, 5);
        assert_eq!(config.default_page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_from_json_rejects_unknown_and_invalid() {
        assert!(CoreConfig::from_json(r#"{"unknown":1}"#).is_err());
        assert!(CoreConfig::from_json(r#"{"default_page_size":500}"#).is_err());
        assert!(CoreConfig::from_json(r#"{"max_batch_size":0}"#).is_err());
    }

    #[test]
    fn test_hosted_domains_are_normalized() {
        let config = CoreConfig::with_hosted_domains(["Sealed.TEST "]);
        assert_eq!(config.hosted_domains, vec!["sealed.test".to_string()]);
    }
}
