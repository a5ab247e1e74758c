//! # Folder Name Translation
//!
//! Bidirectional mapping between canonical folder names and provider-native
//! names.
//!
//! ## Overview
//!
//! The engine names folders canonically as `/`-separated component paths
//! (`Taxes/Accounting`). Each account stores them under its own hierarchy
//! separator and, on some servers, below a personal namespace prefix:
//!
//! | Canonical          | Prefix    | Separator | Provider-native           |
//! |--------------------|-----------|-----------|---------------------------|
//! | `Taxes/Accounting` | ``        | `/`       | `Taxes/Accounting`        |
//! | `Taxes/Accounting` | `INBOX.`  | `.`       | `INBOX.Taxes.Accounting`  |
//! | `Taxes/Accounting` | `INBOX`   | `.`       | `INBOX.Taxes.Accounting`  |
//! | `Red/Carpet`       | ``        | `.`       | `Red.Carpet`              |
//!
//! Translation is pure. Provider-native names are recomputed from the
//! current namespace on every dispatch and never stored.
//!
//! ## Round trips
//!
//! `to_canonical(to_remote(c)) == c` for every canonical name `to_remote`
//! accepts. Components that contain the account's separator are rejected
//! because they would split into several components on the way back.
//!
//! Every canonical name, `INBOX` included, is placed below the prefix. A
//! remote name equal to the prefix itself translates as a whole.

use std::fmt;
use thiserror::Error;

/// Separator of canonical folder names.
pub const CANONICAL_SEPARATOR: char = '/';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslationError {
    #[error("Folder name is empty")]
    EmptyName,

    #[error("Folder name {name:?} contains an empty component")]
    EmptyComponent { name: String },

    #[error("Folder component {component:?} contains the hierarchy separator {separator:?}")]
    SeparatorInComponent { component: String, separator: String },

    #[error("Folder name {name:?} is nested but the account has no hierarchy separator")]
    HierarchyUnsupported { name: String },
}

/// A validated canonical folder name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalFolderName {
    components: Vec<String>,
}

impl CanonicalFolderName {
    /// Parses a `/`-separated name, rejecting empty names and empty components.
    pub fn parse(name: &str) -> Result<Self, TranslationError> {
        if name.is_empty() {
            return Err(TranslationError::EmptyName);
        }

        let components: Vec<String> = name
            .split(CANONICAL_SEPARATOR)
            .map(str::to_string)
            .collect();

        if components.iter().any(String::is_empty) {
            return Err(TranslationError::EmptyComponent {
                name: name.to_string(),
            });
        }

        Ok(Self { components })
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Last component, the name shown to users for nested folders.
    pub fn leaf(&self) -> &str {
        self.components.last().map(String::as_str).unwrap_or_default()
    }

    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// Encodes this name for an account with the given prefix and separator.
    pub fn to_remote(&self, prefix: &str, separator: &str) -> Result<String, TranslationError> {
        if separator.is_empty() && self.components.len() > 1 {
            return Err(TranslationError::HierarchyUnsupported {
                name: self.to_string(),
            });
        }

        if !separator.is_empty() {
            if let Some(component) = self.components.iter().find(|c| c.contains(separator)) {
                return Err(TranslationError::SeparatorInComponent {
                    component: component.clone(),
                    separator: separator.to_string(),
                });
            }
        }

        let joined = self.components.join(separator);

        let remote = if prefix.is_empty() {
            joined
        } else if separator.is_empty() || prefix.ends_with(separator) {
            format!("{}{}", prefix, joined)
        } else {
            format!("{}{}{}", prefix, separator, joined)
        };

        Ok(remote)
    }
}

impl fmt::Display for CanonicalFolderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", CANONICAL_SEPARATOR)?;
            }
            f.write_str(component)?;
        }
        Ok(())
    }
}

/// Translates a canonical name into the provider-native form.
///
/// # Errors
///
/// Returns a [`TranslationError`] if the canonical name is malformed or
/// cannot be represented with `separator`.
///
/// # Example
///
/// ```
/// use core_syncback::folder_name::to_remote;
///
/// assert_eq!(to_remote("Taxes/Accounting", "INBOX.", ".").unwrap(), "INBOX.Taxes.Accounting");
/// assert_eq!(to_remote("Taxes/Accounting", "INBOX", ".").unwrap(), "INBOX.Taxes.Accounting");
/// assert!(to_remote("Taxes//Accounting", "", ".").is_err());
/// ```
pub fn to_remote(canonical: &str, prefix: &str, separator: &str) -> Result<String, TranslationError> {
    CanonicalFolderName::parse(canonical)?.to_remote(prefix, separator)
}

/// Translates a provider-native name into its canonical display form.
///
/// Never fails: names outside the prefix, or equal to it, are translated as
/// a whole.
///
/// # Example
///
/// ```
/// use core_syncback::folder_name::to_canonical;
///
/// assert_eq!(to_canonical("INBOX.Red.Carpet", "", "."), "INBOX/Red/Carpet");
/// assert_eq!(to_canonical("INBOX.Red.Carpet", "INBOX.", "."), "Red/Carpet");
/// assert_eq!(to_canonical("INBOX", "INBOX.", "."), "INBOX");
/// ```
pub fn to_canonical(remote: &str, prefix: &str, separator: &str) -> String {
    let body = strip_namespace_prefix(remote, prefix, separator)
        .filter(|rest| !split_components(rest, separator).is_empty())
        .unwrap_or(remote);

    let components = split_components(body, separator);
    if components.is_empty() {
        return remote.to_string();
    }

    components.join("/")
}

/// Returns what follows `prefix`, or `None` when `remote` is not below it.
///
/// A prefix without a trailing separator only matches at a separator
/// boundary, so `INBOXES.Old` is not below `INBOX`.
fn strip_namespace_prefix<'a>(remote: &'a str, prefix: &str, separator: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }

    let rest = remote.strip_prefix(prefix)?;

    if separator.is_empty() || prefix.ends_with(separator) || rest.is_empty() {
        return Some(rest);
    }

    rest.strip_prefix(separator)
}

fn split_components<'a>(name: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return if name.is_empty() { Vec::new() } else { vec![name] };
    }

    name.split(separator).filter(|c| !c.is_empty()).collect()
}

/// Prefix and separator of one account, bundled for repeated translation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FolderNamespace {
    pub prefix: String,
    pub separator: String,
}

impl FolderNamespace {
    pub fn new(prefix: impl Into<String>, separator: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            separator: separator.into(),
        }
    }

    pub fn to_remote(&self, canonical: &str) -> Result<String, TranslationError> {
        to_remote(canonical, &self.prefix, &self.separator)
    }

    pub fn to_canonical(&self, remote: &str) -> String {
        to_canonical(remote, &self.prefix, &self.separator)
    }
}
