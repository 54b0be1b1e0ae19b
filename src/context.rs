//! Process-wide context shared read-only by the stages.

use crate::address::local_part;
use crate::config::Global;
use crate::error::Error;
use crate::mailbox::MailboxTable;
use arc_swap::ArcSwap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One immutable snapshot of the lookup tables.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    whitelist: HashSet<String>,
    /// Send limit in KB per sender local part; `None` disables quota checks.
    quota: Option<HashMap<String, u64>>,
    mailboxes: Option<MailboxTable>,
}

/// Parses `localpart size-in-kb` lines.
fn parse_quota(text: &str) -> HashMap<String, u64> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once(|c: char| c == ':' || c.is_whitespace())?;
            match value.trim_start_matches(':').trim().parse() {
                Ok(limit) => Some((key.trim().to_lowercase(), limit)),
                Err(_) => {
                    log::warn!("Ignoring bad quota line: {line}");
                    None
                }
            }
        })
        .collect()
}

impl Tables {
    pub fn new(
        whitelist: impl IntoIterator<Item = String>,
        quota: Option<HashMap<String, u64>>,
        mailboxes: Option<MailboxTable>,
    ) -> Self {
        Self {
            whitelist: whitelist.into_iter().map(|w| w.to_lowercase()).collect(),
            quota,
            mailboxes,
        }
    }

    pub fn load(global: &Global) -> Result<Self, Error> {
        let quota = match &global.quotafile {
            Some(path) => Some(parse_quota(&std::fs::read_to_string(path)?)),
            None => None,
        };
        let mailboxes = match &global.virtualmap {
            Some(path) => Some(MailboxTable::load(path, global.aliasesmap.as_deref())?),
            None => None,
        };
        Ok(Self::new(global.whitelist.iter().cloned(), quota, mailboxes))
    }

    pub fn is_whitelisted(&self, address: &str) -> bool {
        self.whitelist.contains(&local_part(address))
    }

    /// Limit for a sender, `None` when quota checks are disabled; 0 means unlimited.
    pub fn quota(&self, address: &str) -> Option<u64> {
        let quota = self.quota.as_ref()?;
        Some(quota.get(&local_part(address)).copied().unwrap_or(0))
    }

    /// Authorized mailboxes, empty when no lookup table is configured.
    pub fn mailboxes<'a>(&self, emails: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        match &self.mailboxes {
            Some(table) => table.lookup(emails),
            None => BTreeSet::new(),
        }
    }
}

/// Built once by the coordinator; stages only read from it.
#[derive(Debug)]
pub struct Context {
    global: Global,
    tables: ArcSwap<Tables>,
    running: AtomicBool,
}

impl Context {
    pub fn new(global: Global) -> Result<Self, Error> {
        let tables = Tables::load(&global)?;
        Ok(Self::with_tables(global, tables))
    }

    pub fn with_tables(global: Global, tables: Tables) -> Self {
        Self {
            global,
            tables: ArcSwap::from_pointee(tables),
            running: AtomicBool::new(true),
        }
    }

    pub fn tables(&self) -> Arc<Tables> {
        self.tables.load_full()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Reloads the table files and publishes the new snapshot.
    pub fn reload(&self) -> Result<(), Error> {
        let tables = Tables::load(&self.global)?;
        self.tables.store(Arc::new(tables));
        Ok(())
    }

    fn has_table_files(&self) -> bool {
        self.global.quotafile.is_some() || self.global.virtualmap.is_some()
    }

    /// Starts the thread reloading the quota and mailbox tables, if any is configured.
    ///
    /// The thread parks between reloads; unpark it after [`Context::stop`] to end it.
    pub fn spawn_refresher(self: &Arc<Self>) -> Result<Option<std::thread::JoinHandle<()>>, Error> {
        if !self.has_table_files() {
            return Ok(None);
        }
        let context = self.clone();
        let interval = Duration::from_secs(self.global.refresh.max(1));
        let handle = std::thread::Builder::new()
            .name("refresher".to_string())
            .spawn(move || {
                log::debug!("Table refresher started, every {interval:?}");
                while context.is_running() {
                    std::thread::park_timeout(interval);
                    if !context.is_running() {
                        break;
                    }
                    match context.reload() {
                        Ok(()) => log::debug!("Lookup tables reloaded"),
                        Err(e) => log::warn!("Cannot reload lookup tables, keeping old ones: {e}"),
                    }
                }
            })?;
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use testresult::TestResult;

    #[rstest]
    #[case("alice 100", Some(100))]
    #[case("alice: 100", Some(100))]
    #[case("ALICE\t100", Some(100))]
    #[case("alice lots", None)]
    #[case("# alice 100", None)]
    fn test_parse_quota(#[case] text: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_quota(text).get("alice").copied(), expected);
    }

    #[test]
    fn test_table_queries() {
        let tables = Tables::new(
            vec!["Postmaster".to_string()],
            Some(HashMap::from([("alice".to_string(), 10)])),
            None,
        );
        assert!(tables.is_whitelisted("postmaster@example.org"));
        assert!(!tables.is_whitelisted("alice@example.org"));
        assert_eq!(tables.quota("alice@example.org"), Some(10));
        assert_eq!(tables.quota("bob@example.org"), Some(0));
        assert!(tables.mailboxes(["alice@example.org"]).is_empty());
        assert_eq!(Tables::default().quota("alice@example.org"), None);
    }

    #[test]
    fn test_reload_publishes_new_snapshot() -> TestResult {
        let dir = tempfile::tempdir()?;
        let quotafile = dir.path().join("quota");
        std::fs::write(&quotafile, "alice 10\n")?;

        let global = Global {
            quotafile: Some(quotafile.clone()),
            ..Global::default()
        };
        let context = Context::new(global)?;
        let before = context.tables();
        assert_eq!(before.quota("alice@x"), Some(10));

        std::fs::write(&quotafile, "alice 20\n")?;
        context.reload()?;
        assert_eq!(context.tables().quota("alice@x"), Some(20));
        // readers holding the old snapshot keep seeing it
        assert_eq!(before.quota("alice@x"), Some(10));
        Ok(())
    }
}
