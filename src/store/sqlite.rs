use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags};

use crate::constants;
use crate::model::{self, IngestError};
use crate::store::historical_bar;

/// Shared handle to one SQLite database. Cloning shares the connection; the
/// connection mutex serialises all workers.
#[derive(Clone)]
pub struct Store {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (or creates) the database file in WAL mode and ensures the bar table exists.
    pub fn open(path: &Path) -> model::Result<Store> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| IngestError::Store(format!("fail to open sqlite file {}. {}", path.display(), e)))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_row| Ok(()))
            .map_err(|e| IngestError::Store(format!("fail to execute PRAGMA journal_mode=WAL. {}", e)))?;
        Store::init(conn, Some(path.to_path_buf()))
    }

    #[cfg(test)]
    pub fn open_in_memory() -> model::Result<Store> {
        let conn = Connection::open_in_memory().map_err(|e| IngestError::Store(e.to_string()))?;
        Store::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> model::Result<Store> {
        conn.busy_timeout(constants::BUSY_TIMEOUT)
            .map_err(|e| IngestError::Store(e.to_string()))?;
        historical_bar::create_table(&conn).map_err(|e| IngestError::Store(e.to_string()))?;
        Ok(Store {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Locks the connection. A poisoned lock is recovered since SQLite keeps its
    /// own transactional state.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` with exclusive access to the connection.
    pub fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> R {
        let mut conn = self.lock();
        f(&mut conn)
    }
}

/// Routes symbols and source tables to their destination store.
#[derive(Clone)]
pub struct StoreRouter {
    default: Store,
    routes: HashMap<String, Store>,
}

impl StoreRouter {
    #[cfg(test)]
    pub fn single(store: Store) -> StoreRouter {
        StoreRouter {
            default: store,
            routes: HashMap::new(),
        }
    }

    /// Opens the default store plus one store per distinct routed path. Keys may
    /// name a source table or a symbol.
    pub fn open(default_path: &Path, routes: &[(String, PathBuf)]) -> model::Result<StoreRouter> {
        let default = Store::open(default_path)?;
        let mut by_path: HashMap<PathBuf, Store> = HashMap::new();
        by_path.insert(default_path.to_path_buf(), default.clone());

        let mut routed = HashMap::new();
        for (key, path) in routes {
            let store = match by_path.get(path) {
                Some(store) => store.clone(),
                None => {
                    let store = Store::open(path)?;
                    by_path.insert(path.clone(), store.clone());
                    store
                }
            };
            log::info!("routing {} to {}", key, path.display());
            routed.insert(key.clone(), store);
        }
        Ok(StoreRouter {
            default,
            routes: routed,
        })
    }

    #[cfg(test)]
    pub fn with_route(mut self, key: &str, store: Store) -> StoreRouter {
        self.routes.insert(key.to_string(), store);
        self
    }

    #[cfg(test)]
    pub fn default_store(&self) -> &Store {
        &self.default
    }

    /// Store holding a source table.
    pub fn for_table(&self, table: &str) -> &Store {
        self.routes.get(table).unwrap_or(&self.default)
    }

    /// Destination of a symbol's bars: symbol route, then table route, then default.
    pub fn for_symbol(&self, symbol: &str, table: Option<&str>) -> &Store {
        if let Some(store) = self.routes.get(symbol) {
            return store;
        }
        match table {
            Some(table) => self.for_table(table),
            None => &self.default,
        }
    }

    /// Every distinct store, default first.
    pub fn stores(&self) -> Vec<Store> {
        let mut stores = vec![self.default.clone()];
        for store in self.routes.values() {
            if !stores.iter().any(|s| Arc::ptr_eq(&s.conn, &store.conn)) {
                stores.push(store.clone());
            }
        }
        stores
    }
}
