//! Mailbox lookup through postfix-style `virtual` and `aliases` maps.

use crate::error::Error;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Resolves recipient addresses to the local mailboxes they end up in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxTable {
    virtual_map: HashMap<String, String>,
    aliases: HashMap<String, String>,
}

/// Parses `key value` / `key: value` lines, skipping blanks and comments.
fn parse_map(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once(|c: char| c == ':' || c.is_whitespace())?;
            let value = value.trim_start_matches(':').trim();
            Some((key.trim().to_lowercase(), value.to_string()))
        })
        .filter(|(key, value)| !key.is_empty() && !value.is_empty())
        .collect()
}

impl MailboxTable {
    pub fn parse(virtual_map: &str, aliases: &str) -> Self {
        Self {
            virtual_map: parse_map(virtual_map),
            aliases: parse_map(aliases),
        }
    }

    pub fn load(virtual_map: &Path, aliases: Option<&Path>) -> Result<Self, Error> {
        let virtual_map = std::fs::read_to_string(virtual_map)?;
        let aliases = match aliases {
            Some(path) => std::fs::read_to_string(path)?,
            None => String::new(),
        };
        Ok(Self::parse(&virtual_map, &aliases))
    }

    /// Sorted, de-duplicated mailboxes for all given addresses.
    pub fn lookup<'a>(&self, emails: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        emails
            .into_iter()
            .flat_map(|email| self.lookup_one(email))
            .collect()
    }

    fn lookup_one(&self, email: &str) -> Vec<String> {
        let key = email.trim().to_lowercase();
        match self.virtual_map.get(&key) {
            // forwarded to another domain, not a local mailbox
            Some(value) if !value.contains('@') => {
                let mut seen = Vec::new();
                self.expand(value, &mut seen)
            }
            _ => Vec::new(),
        }
    }

    /// Recursively expands aliases; a loop yields nothing for that branch.
    fn expand(&self, entry: &str, seen: &mut Vec<String>) -> Vec<String> {
        let mut results = Vec::new();
        for name in entry.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match self.aliases.get(&name.to_lowercase()) {
                Some(value) => {
                    if seen.contains(value) {
                        log::warn!("Alias loop detected at {name}");
                        return Vec::new();
                    }
                    seen.push(value.clone());
                    results.extend(self.expand(value, seen));
                }
                None => results.push(name.to_string()),
            }
        }
        results
    }
}
