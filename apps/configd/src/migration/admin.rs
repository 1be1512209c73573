use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::Db;
use crate::migration::schema::{Ident, IndexSpec, RoutineSpec, SearchIndexSpec, TableSpec};

#[derive(Debug, thiserror::Error)]
pub enum SchemaAdminError {
    #[error("db error: {0}")]
    Db(String),
}

/// Seam between the coordinator and the live store's catalog: existence,
/// shape, privilege, and extension probes plus create-if-absent DDL
/// execution. Probes never mutate; mutations are only ever issued for
/// objects a probe reported absent.
#[async_trait]
pub trait SchemaAdmin: Send + Sync {
    async fn extension_available(&self, name: &str) -> Result<bool, SchemaAdminError>;
    async fn extension_installed(&self, name: &str) -> Result<bool, SchemaAdminError>;
    async fn install_extension(&self, name: &str) -> Result<(), SchemaAdminError>;

    async fn has_create_privilege(&self, schema: &Ident) -> Result<bool, SchemaAdminError>;

    async fn table_exists(&self, table: &TableSpec) -> Result<bool, SchemaAdminError>;

    /// Declared width of a `vector` column, None when the column is absent
    /// or not a vector. The shape probe behind mismatch detection.
    async fn vector_column_width(
        &self,
        table: &TableSpec,
        column: &Ident,
    ) -> Result<Option<u32>, SchemaAdminError>;

    async fn index_exists(&self, schema: &Ident, index: &Ident) -> Result<bool, SchemaAdminError>;
    async fn routine_exists(&self, routine: &RoutineSpec) -> Result<bool, SchemaAdminError>;

    async fn create_table(&self, table: &TableSpec) -> Result<(), SchemaAdminError>;
    async fn create_index(&self, index: &IndexSpec) -> Result<(), SchemaAdminError>;
    async fn create_search_index(&self, index: &SearchIndexSpec) -> Result<(), SchemaAdminError>;
    async fn create_routine(&self, routine: &RoutineSpec) -> Result<(), SchemaAdminError>;

    async fn drop_routine(&self, routine: &RoutineSpec) -> Result<(), SchemaAdminError>;
    async fn drop_table(&self, table: &TableSpec) -> Result<(), SchemaAdminError>;

    async fn row_count(&self, table: &TableSpec) -> Result<i64, SchemaAdminError>;

    /// Most recent value in the named timestamp column, None for an empty
    /// table. Drives the rollback recency guard.
    async fn newest_row_at(
        &self,
        table: &TableSpec,
        column: &Ident,
    ) -> Result<Option<DateTime<Utc>>, SchemaAdminError>;
}

pub fn postgres(db: Arc<Db>) -> Arc<dyn SchemaAdmin> {
    Arc::new(PostgresSchemaAdmin { db })
}

/// Simulated catalog for offline tests. Tracks which objects exist, which
/// extensions are available, whether CREATE is granted, and how many
/// mutating statements ran — the counter the idempotency tests pivot on.
#[derive(Default)]
pub struct MemorySchemaAdmin {
    inner: Mutex<MemoryCatalog>,
}

struct MemoryCatalog {
    available_extensions: HashSet<String>,
    installed_extensions: HashSet<String>,
    create_privilege: bool,
    tables: HashMap<String, MemoryTable>,
    indexes: HashSet<String>,
    routines: HashSet<String>,
    mutations: u64,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self {
            available_extensions: HashSet::from(["vector".to_string(), "pg_trgm".to_string()]),
            installed_extensions: HashSet::new(),
            create_privilege: true,
            tables: HashMap::new(),
            indexes: HashSet::new(),
            routines: HashSet::new(),
            mutations: 0,
        }
    }
}

#[derive(Default)]
struct MemoryTable {
    vector_width: Option<u32>,
    row_times: Vec<DateTime<Utc>>,
}

impl MemorySchemaAdmin {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_available_extensions(&self, names: &[&str]) {
        let mut inner = self.inner.lock().await;
        inner.available_extensions = names.iter().map(|name| name.to_string()).collect();
    }

    pub async fn set_create_privilege(&self, granted: bool) {
        let mut inner = self.inner.lock().await;
        inner.create_privilege = granted;
    }

    /// Pre-create a table with an explicit vector width, bypassing the DDL
    /// path; used to stage shape-mismatch scenarios.
    pub async fn seed_table(&self, qualified: &str, vector_width: Option<u32>) {
        let mut inner = self.inner.lock().await;
        inner.tables.insert(
            qualified.to_string(),
            MemoryTable {
                vector_width,
                row_times: Vec::new(),
            },
        );
    }

    pub async fn seed_rows(&self, qualified: &str, times: &[DateTime<Utc>]) {
        let mut inner = self.inner.lock().await;
        if let Some(table) = inner.tables.get_mut(qualified) {
            table.row_times.extend_from_slice(times);
        }
    }

    pub async fn mutation_count(&self) -> u64 {
        self.inner.lock().await.mutations
    }

    pub async fn has_table(&self, qualified: &str) -> bool {
        self.inner.lock().await.tables.contains_key(qualified)
    }

    pub async fn has_routine(&self, qualified: &str) -> bool {
        self.inner.lock().await.routines.contains(qualified)
    }
}

#[async_trait]
impl SchemaAdmin for MemorySchemaAdmin {
    async fn extension_available(&self, name: &str) -> Result<bool, SchemaAdminError> {
        Ok(self.inner.lock().await.available_extensions.contains(name))
    }

    async fn extension_installed(&self, name: &str) -> Result<bool, SchemaAdminError> {
        Ok(self.inner.lock().await.installed_extensions.contains(name))
    }

    async fn install_extension(&self, name: &str) -> Result<(), SchemaAdminError> {
        let mut inner = self.inner.lock().await;
        if !inner.available_extensions.contains(name) {
            return Err(SchemaAdminError::Db(format!(
                "extension {name} is not available"
            )));
        }
        if inner.installed_extensions.insert(name.to_string()) {
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn has_create_privilege(&self, _schema: &Ident) -> Result<bool, SchemaAdminError> {
        Ok(self.inner.lock().await.create_privilege)
    }

    async fn table_exists(&self, table: &TableSpec) -> Result<bool, SchemaAdminError> {
        Ok(self.inner.lock().await.tables.contains_key(&table.qualified()))
    }

    async fn vector_column_width(
        &self,
        table: &TableSpec,
        _column: &Ident,
    ) -> Result<Option<u32>, SchemaAdminError> {
        Ok(self
            .inner
            .lock()
            .await
            .tables
            .get(&table.qualified())
            .and_then(|table| table.vector_width))
    }

    async fn index_exists(&self, schema: &Ident, index: &Ident) -> Result<bool, SchemaAdminError> {
        let key = format!("{}.{}", schema.as_str(), index.as_str());
        Ok(self.inner.lock().await.indexes.contains(&key))
    }

    async fn routine_exists(&self, routine: &RoutineSpec) -> Result<bool, SchemaAdminError> {
        Ok(self.inner.lock().await.routines.contains(&routine.qualified()))
    }

    async fn create_table(&self, table: &TableSpec) -> Result<(), SchemaAdminError> {
        let mut inner = self.inner.lock().await;
        if !inner.create_privilege {
            return Err(SchemaAdminError::Db("permission denied for schema".to_string()));
        }
        let qualified = table.qualified();
        if inner.tables.contains_key(&qualified) {
            return Ok(());
        }
        let vector_width = table.columns.iter().find_map(|column| match column.column_type {
            crate::migration::schema::ColumnType::Vector { dim } => Some(dim),
            _ => None,
        });
        inner.tables.insert(
            qualified,
            MemoryTable {
                vector_width,
                row_times: Vec::new(),
            },
        );
        inner.mutations += 1;
        Ok(())
    }

    async fn create_index(&self, index: &IndexSpec) -> Result<(), SchemaAdminError> {
        let mut inner = self.inner.lock().await;
        let key = format!("{}.{}", index.schema.as_str(), index.name.as_str());
        if inner.indexes.insert(key) {
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn create_search_index(&self, index: &SearchIndexSpec) -> Result<(), SchemaAdminError> {
        let mut inner = self.inner.lock().await;
        let (schema, name) = match index {
            SearchIndexSpec::Vector { schema, name, .. }
            | SearchIndexSpec::Trigram { schema, name, .. } => (schema, name),
        };
        let key = format!("{}.{}", schema.as_str(), name.as_str());
        if inner.indexes.insert(key) {
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn create_routine(&self, routine: &RoutineSpec) -> Result<(), SchemaAdminError> {
        let mut inner = self.inner.lock().await;
        if inner.routines.insert(routine.qualified()) {
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn drop_routine(&self, routine: &RoutineSpec) -> Result<(), SchemaAdminError> {
        let mut inner = self.inner.lock().await;
        if inner.routines.remove(&routine.qualified()) {
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn drop_table(&self, table: &TableSpec) -> Result<(), SchemaAdminError> {
        let mut inner = self.inner.lock().await;
        if inner.tables.remove(&table.qualified()).is_some() {
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn row_count(&self, table: &TableSpec) -> Result<i64, SchemaAdminError> {
        Ok(self
            .inner
            .lock()
            .await
            .tables
            .get(&table.qualified())
            .map(|table| table.row_times.len() as i64)
            .unwrap_or(0))
    }

    async fn newest_row_at(
        &self,
        table: &TableSpec,
        _column: &Ident,
    ) -> Result<Option<DateTime<Utc>>, SchemaAdminError> {
        Ok(self
            .inner
            .lock()
            .await
            .tables
            .get(&table.qualified())
            .and_then(|table| table.row_times.iter().max().copied()))
    }
}

struct PostgresSchemaAdmin {
    db: Arc<Db>,
}

impl PostgresSchemaAdmin {
    async fn probe_one(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<bool, SchemaAdminError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(sql, params)
            .await
            .map_err(|error| SchemaAdminError::Db(error.to_string()))?;
        Ok(row.is_some())
    }

    async fn execute_ddl(&self, sql: &str) -> Result<(), SchemaAdminError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .batch_execute(sql)
            .await
            .map_err(|error| SchemaAdminError::Db(error.to_string()))
    }
}

#[async_trait]
impl SchemaAdmin for PostgresSchemaAdmin {
    async fn extension_available(&self, name: &str) -> Result<bool, SchemaAdminError> {
        self.probe_one(
            "SELECT 1 FROM pg_available_extensions WHERE name = $1",
            &[&name],
        )
        .await
    }

    async fn extension_installed(&self, name: &str) -> Result<bool, SchemaAdminError> {
        self.probe_one("SELECT 1 FROM pg_extension WHERE extname = $1", &[&name])
            .await
    }

    async fn install_extension(&self, name: &str) -> Result<(), SchemaAdminError> {
        // Extension names come from CapabilityKind::extension(), a closed
        // set; they never travel through configuration.
        self.execute_ddl(&format!("CREATE EXTENSION IF NOT EXISTS \"{name}\""))
            .await
    }

    async fn has_create_privilege(&self, schema: &Ident) -> Result<bool, SchemaAdminError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                "SELECT has_schema_privilege(current_user, $1, 'CREATE')",
                &[&schema.as_str()],
            )
            .await
            .map_err(|error| SchemaAdminError::Db(error.to_string()))?;
        row.try_get(0)
            .map_err(|error| SchemaAdminError::Db(error.to_string()))
    }

    async fn table_exists(&self, table: &TableSpec) -> Result<bool, SchemaAdminError> {
        self.probe_one(
            r#"
            SELECT 1
              FROM information_schema.tables
             WHERE table_schema = $1 AND table_name = $2
            "#,
            &[&table.schema.as_str(), &table.name.as_str()],
        )
        .await
    }

    async fn vector_column_width(
        &self,
        table: &TableSpec,
        column: &Ident,
    ) -> Result<Option<u32>, SchemaAdminError> {
        let client = self.db.client();
        let client = client.lock().await;
        // pgvector keeps the declared dimension in atttypmod.
        let row = client
            .query_opt(
                r#"
                SELECT a.atttypmod, t.typname
                  FROM pg_attribute a
                  JOIN pg_class c ON c.oid = a.attrelid
                  JOIN pg_namespace n ON n.oid = c.relnamespace
                  JOIN pg_type t ON t.oid = a.atttypid
                 WHERE n.nspname = $1 AND c.relname = $2 AND a.attname = $3
                   AND NOT a.attisdropped
                "#,
                &[&table.schema.as_str(), &table.name.as_str(), &column.as_str()],
            )
            .await
            .map_err(|error| SchemaAdminError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let type_name: String = row
            .try_get("typname")
            .map_err(|error| SchemaAdminError::Db(error.to_string()))?;
        if type_name != "vector" {
            return Ok(None);
        }
        let typmod: i32 = row
            .try_get("atttypmod")
            .map_err(|error| SchemaAdminError::Db(error.to_string()))?;
        Ok(u32::try_from(typmod).ok().filter(|width| *width > 0))
    }

    async fn index_exists(&self, schema: &Ident, index: &Ident) -> Result<bool, SchemaAdminError> {
        self.probe_one(
            "SELECT 1 FROM pg_indexes WHERE schemaname = $1 AND indexname = $2",
            &[&schema.as_str(), &index.as_str()],
        )
        .await
    }

    async fn routine_exists(&self, routine: &RoutineSpec) -> Result<bool, SchemaAdminError> {
        self.probe_one(
            r#"
            SELECT 1
              FROM pg_proc p
              JOIN pg_namespace n ON n.oid = p.pronamespace
             WHERE n.nspname = $1 AND p.proname = $2
            "#,
            &[&routine.schema.as_str(), &routine.name.as_str()],
        )
        .await
    }

    async fn create_table(&self, table: &TableSpec) -> Result<(), SchemaAdminError> {
        self.execute_ddl(&table.create_sql()).await
    }

    async fn create_index(&self, index: &IndexSpec) -> Result<(), SchemaAdminError> {
        self.execute_ddl(&index.create_sql()).await
    }

    async fn create_search_index(&self, index: &SearchIndexSpec) -> Result<(), SchemaAdminError> {
        self.execute_ddl(&index.create_sql()).await
    }

    async fn create_routine(&self, routine: &RoutineSpec) -> Result<(), SchemaAdminError> {
        self.execute_ddl(&routine.create_sql).await
    }

    async fn drop_routine(&self, routine: &RoutineSpec) -> Result<(), SchemaAdminError> {
        self.execute_ddl(&routine.drop_sql()).await
    }

    async fn drop_table(&self, table: &TableSpec) -> Result<(), SchemaAdminError> {
        self.execute_ddl(&format!("DROP TABLE IF EXISTS {}", table.qualified()))
            .await
    }

    async fn row_count(&self, table: &TableSpec) -> Result<i64, SchemaAdminError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", table.qualified()), &[])
            .await
            .map_err(|error| SchemaAdminError::Db(error.to_string()))?;
        row.try_get(0)
            .map_err(|error| SchemaAdminError::Db(error.to_string()))
    }

    async fn newest_row_at(
        &self,
        table: &TableSpec,
        column: &Ident,
    ) -> Result<Option<DateTime<Utc>>, SchemaAdminError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                &format!(
                    "SELECT MAX({}) FROM {}",
                    column.as_str(),
                    table.qualified()
                ),
                &[],
            )
            .await
            .map_err(|error| SchemaAdminError::Db(error.to_string()))?;
        row.try_get(0)
            .map_err(|error| SchemaAdminError::Db(error.to_string()))
    }
}
