//! Account persistence and the in-memory account cache
//!
//! Account metadata is read on every sync cycle but changes rarely, so the
//! sync engine goes through [`CachingAccountRepository`], which loads every
//! account once and answers lookups from memory.

use crate::{Account, Database, Result};
use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Account data access
pub trait AccountRepository: Send + Sync {
    /// All accounts ordered by index
    fn get_all(&self) -> Result<Vec<Account>>;

    /// Account with the given index
    fn find_by(&self, account_index: u32) -> Result<Option<Account>>;

    /// Insert or update an account
    fn update(&self, account: &Account) -> Result<()>;
}

/// SQLite account table
pub struct SqliteAccountRepository {
    db: Arc<Database>,
}

impl SqliteAccountRepository {
    /// Create a repository over an open database
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl AccountRepository for SqliteAccountRepository {
    fn get_all(&self) -> Result<Vec<Account>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT account_index, viewing_key, birthday_height, name FROM accounts ORDER BY account_index",
        )?;
        let accounts = stmt
            .query_map([], map_account)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    fn find_by(&self, account_index: u32) -> Result<Option<Account>> {
        let account = self
            .db
            .conn()
            .query_row(
                "SELECT account_index, viewing_key, birthday_height, name FROM accounts WHERE account_index = ?1",
                [account_index],
                map_account,
            )
            .optional()?;
        Ok(account)
    }

    fn update(&self, account: &Account) -> Result<()> {
        self.db.conn().execute(
            r#"
            INSERT INTO accounts (account_index, viewing_key, birthday_height, name, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_index) DO UPDATE SET
                viewing_key = excluded.viewing_key,
                birthday_height = excluded.birthday_height,
                name = excluded.name
            "#,
            params![
                account.account_index,
                account.viewing_key,
                account.birthday_height,
                account.name,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }
}

fn map_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        account_index: row.get(0)?,
        viewing_key: row.get(1)?,
        birthday_height: row.get(2)?,
        name: row.get(3)?,
    })
}

#[derive(Default)]
struct CacheState {
    loaded: bool,
    accounts: BTreeMap<u32, Account>,
}

/// Load-once, write-through cache in front of another repository
///
/// A lookup miss reloads the whole table from the inner repository instead
/// of issuing a point query, so accounts written by another handle become
/// visible on the next miss.
pub struct CachingAccountRepository<R> {
    inner: R,
    cache: RwLock<CacheState>,
}

impl<R: AccountRepository> CachingAccountRepository<R> {
    /// Wrap `inner`; nothing is loaded until first use
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: RwLock::new(CacheState::default()),
        }
    }

    /// Populate the cache if it has not been loaded yet
    pub fn load_cache(&self) -> Result<()> {
        if self.cache.read().loaded {
            return Ok(());
        }
        self.reload()
    }

    /// Drop cached entries; the next read reloads
    pub fn invalidate(&self) {
        let mut cache = self.cache.write();
        cache.loaded = false;
        cache.accounts.clear();
    }

    /// Number of cached accounts
    pub fn cached_len(&self) -> usize {
        self.cache.read().accounts.len()
    }

    fn reload(&self) -> Result<()> {
        let accounts = self.inner.get_all()?;
        let mut cache = self.cache.write();
        cache.accounts = accounts
            .into_iter()
            .map(|account| (account.account_index, account))
            .collect();
        cache.loaded = true;
        tracing::debug!("Account cache loaded with {} entries", cache.accounts.len());
        Ok(())
    }
}

impl<R: AccountRepository> AccountRepository for CachingAccountRepository<R> {
    fn get_all(&self) -> Result<Vec<Account>> {
        {
            let cache = self.cache.read();
            if cache.loaded && !cache.accounts.is_empty() {
                return Ok(cache.accounts.values().cloned().collect());
            }
        }
        self.reload()?;
        Ok(self.cache.read().accounts.values().cloned().collect())
    }

    fn find_by(&self, account_index: u32) -> Result<Option<Account>> {
        self.load_cache()?;
        if let Some(account) = self.cache.read().accounts.get(&account_index) {
            return Ok(Some(account.clone()));
        }
        self.reload()?;
        Ok(self.cache.read().accounts.get(&account_index).cloned())
    }

    fn update(&self, account: &Account) -> Result<()> {
        self.inner.update(account)?;
        self.cache
            .write()
            .accounts
            .insert(account.account_index, account.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn account(index: u32) -> Account {
        Account {
            account_index: index,
            viewing_key: format!("uview{}", index),
            birthday_height: 1000,
            name: None,
        }
    }

    /// Counts full loads against the underlying store
    struct CountingRepository {
        inner: SqliteAccountRepository,
        loads: Arc<AtomicUsize>,
    }

    impl AccountRepository for CountingRepository {
        fn get_all(&self) -> Result<Vec<Account>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_all()
        }

        fn find_by(&self, account_index: u32) -> Result<Option<Account>> {
            self.inner.find_by(account_index)
        }

        fn update(&self, account: &Account) -> Result<()> {
            self.inner.update(account)
        }
    }

    #[test]
    fn test_sqlite_repository_upsert() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let repo = SqliteAccountRepository::new(db);
        repo.update(&account(0)).unwrap();
        let mut renamed = account(0);
        renamed.name = Some("main".to_string());
        repo.update(&renamed).unwrap();

        assert_eq!(repo.get_all().unwrap(), vec![renamed.clone()]);
        assert_eq!(repo.find_by(0).unwrap(), Some(renamed));
        assert_eq!(repo.find_by(7).unwrap(), None);
    }

    #[test]
    fn test_cache_loads_once() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sqlite = SqliteAccountRepository::new(db);
        sqlite.update(&account(0)).unwrap();
        sqlite.update(&account(1)).unwrap();

        let loads = Arc::new(AtomicUsize::new(0));
        let cache = CachingAccountRepository::new(CountingRepository {
            inner: sqlite,
            loads: loads.clone(),
        });

        assert_eq!(cache.get_all().unwrap().len(), 2);
        assert_eq!(cache.find_by(1).unwrap(), Some(account(1)));
        assert_eq!(cache.get_all().unwrap().len(), 2);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_miss_triggers_full_reload() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let loads = Arc::new(AtomicUsize::new(0));
        let cache = CachingAccountRepository::new(CountingRepository {
            inner: SqliteAccountRepository::new(db.clone()),
            loads: loads.clone(),
        });
        SqliteAccountRepository::new(db.clone())
            .update(&account(0))
            .unwrap();
        cache.load_cache().unwrap();
        assert_eq!(cache.cached_len(), 1);

        // written behind the cache's back
        SqliteAccountRepository::new(db).update(&account(3)).unwrap();

        assert_eq!(cache.find_by(3).unwrap(), Some(account(3)));
        assert_eq!(cache.cached_len(), 2);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_update_is_write_through() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = CachingAccountRepository::new(SqliteAccountRepository::new(db.clone()));
        cache.load_cache().unwrap();

        cache.update(&account(5)).unwrap();
        assert_eq!(cache.find_by(5).unwrap(), Some(account(5)));
        assert_eq!(
            SqliteAccountRepository::new(db).find_by(5).unwrap(),
            Some(account(5))
        );
    }

    #[test]
    fn test_invalidate() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = CachingAccountRepository::new(SqliteAccountRepository::new(db));
        cache.update(&account(1)).unwrap();
        cache.invalidate();
        assert_eq!(cache.cached_len(), 0);
        assert_eq!(cache.get_all().unwrap(), vec![account(1)]);
    }
}
