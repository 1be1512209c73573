//! Typed descriptors for capability-backing schema objects.
//!
//! Every identifier that ends up in DDL passes through [`Ident`], and every
//! numeric parameter is range-checked before a plan exists. Plans are plain
//! values: they can be built, validated, and rendered to SQL with no live
//! store, which is also how the construction logic is tested.

use serde_json::{Value, json};

/// Built-in fallbacks for every recognized tunable. These are the bottom of
/// the parameter-resolution chain; anything above (system defaults document,
/// the feature's global document, flag settings) replaces them.
pub const DEFAULT_VECTOR_TABLE: &str = "memory_vectors";
pub const DEFAULT_FUZZY_TABLE: &str = "memory_texts";
pub const DEFAULT_EMBEDDING_DIM: u32 = 1536;
pub const DEFAULT_METRIC: &str = "cosine";
pub const DEFAULT_INDEX_KIND: &str = "ivfflat";
pub const DEFAULT_IVFFLAT_LISTS: u32 = 100;
pub const DEFAULT_HNSW_M: u32 = 16;
pub const DEFAULT_HNSW_EF_CONSTRUCTION: u32 = 64;
pub const DEFAULT_CONTENT_MAX_CHARS: u32 = 8192;
pub const DEFAULT_SEARCH_LIMIT: u32 = 5;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.25;

/// pgvector rejects dimensions above 16000 for indexed columns.
const MAX_EMBEDDING_DIM: u32 = 16000;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("missing capability parameter")]
    MissingCapability,
    #[error("unknown capability {0:?}")]
    UnknownCapability(String),
}

/// An allow-list-validated SQL identifier: `[a-z_][a-z0-9_]*`, at most 63
/// bytes, never the reserved `pg_` namespace. The only way identifiers reach
/// rendered DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident(String);

impl Ident {
    pub fn new(raw: &str) -> Result<Self, SchemaError> {
        let valid_start = raw
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        let valid_rest = raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if raw.is_empty() || raw.len() > 63 || !valid_start || !valid_rest || raw.starts_with("pg_")
        {
            return Err(SchemaError::InvalidIdentifier(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn suffixed(&self, suffix: &str) -> Result<Self, SchemaError> {
        Self::new(&format!("{}_{suffix}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    InnerProduct,
}

impl DistanceMetric {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cosine" => Some(Self::Cosine),
            "euclidean" | "l2" => Some(Self::Euclidean),
            "inner_product" | "ip" => Some(Self::InnerProduct),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
            Self::InnerProduct => "inner_product",
        }
    }

    /// pgvector operator class for index creation.
    pub fn ops_class(self) -> &'static str {
        match self {
            Self::Cosine => "vector_cosine_ops",
            Self::Euclidean => "vector_l2_ops",
            Self::InnerProduct => "vector_ip_ops",
        }
    }

    /// Distance operator used by the generated search routine.
    pub fn order_operator(self) -> &'static str {
        match self {
            Self::Cosine => "<=>",
            Self::Euclidean => "<->",
            Self::InnerProduct => "<#>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigSerial,
    Text { max_chars: Option<u32> },
    Jsonb,
    TimestampTz,
    Vector { dim: u32 },
}

impl ColumnType {
    fn sql(self) -> String {
        match self {
            Self::BigSerial => "BIGSERIAL".to_string(),
            Self::Text { max_chars: Some(max) } => format!("VARCHAR({max})"),
            Self::Text { max_chars: None } => "TEXT".to_string(),
            Self::Jsonb => "JSONB".to_string(),
            Self::TimestampTz => "TIMESTAMPTZ".to_string(),
            Self::Vector { dim } => format!("VECTOR({dim})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: Ident,
    pub column_type: ColumnType,
    pub not_null: bool,
    pub primary_key: bool,
    pub default_now: bool,
}

impl ColumnSpec {
    fn plain(name: Ident, column_type: ColumnType, not_null: bool) -> Self {
        Self {
            name,
            column_type,
            not_null,
            primary_key: false,
            default_now: false,
        }
    }

    fn sql(&self) -> String {
        let mut sql = format!("{} {}", self.name.as_str(), self.column_type.sql());
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if self.not_null && !self.primary_key {
            sql.push_str(" NOT NULL");
        }
        if self.default_now {
            sql.push_str(" DEFAULT NOW()");
        }
        sql
    }
}

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub schema: Ident,
    pub name: Ident,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema.as_str(), self.name.as_str())
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(ColumnSpec::sql).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.qualified(),
            columns.join(",\n    ")
        )
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|col| col.name.as_str() == name)
    }
}

#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: Ident,
    pub schema: Ident,
    pub table: Ident,
    pub columns: Vec<Ident>,
}

impl IndexSpec {
    pub fn create_sql(&self) -> String {
        let columns: Vec<&str> = self.columns.iter().map(Ident::as_str).collect();
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}.{} ({})",
            self.name.as_str(),
            self.schema.as_str(),
            self.table.as_str(),
            columns.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorIndexKind {
    IvfFlat { lists: u32 },
    Hnsw { m: u32, ef_construction: u32 },
}

/// The capability-specific search index: an ANN index over a vector column
/// or a trigram GIN index over a text column.
#[derive(Debug, Clone)]
pub enum SearchIndexSpec {
    Vector {
        name: Ident,
        schema: Ident,
        table: Ident,
        column: Ident,
        metric: DistanceMetric,
        kind: VectorIndexKind,
    },
    Trigram {
        name: Ident,
        schema: Ident,
        table: Ident,
        column: Ident,
    },
}

impl SearchIndexSpec {
    pub fn name(&self) -> &Ident {
        match self {
            Self::Vector { name, .. } | Self::Trigram { name, .. } => name,
        }
    }

    pub fn create_sql(&self) -> String {
        match self {
            Self::Vector {
                name,
                schema,
                table,
                column,
                metric,
                kind,
            } => match kind {
                VectorIndexKind::IvfFlat { lists } => format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {}.{} USING ivfflat ({} {}) WITH (lists = {})",
                    name.as_str(),
                    schema.as_str(),
                    table.as_str(),
                    column.as_str(),
                    metric.ops_class(),
                    lists
                ),
                VectorIndexKind::Hnsw { m, ef_construction } => format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {}.{} USING hnsw ({} {}) WITH (m = {}, ef_construction = {})",
                    name.as_str(),
                    schema.as_str(),
                    table.as_str(),
                    column.as_str(),
                    metric.ops_class(),
                    m,
                    ef_construction
                ),
            },
            Self::Trigram {
                name,
                schema,
                table,
                column,
            } => format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}.{} USING gin ({} gin_trgm_ops)",
                name.as_str(),
                schema.as_str(),
                table.as_str(),
                column.as_str()
            ),
        }
    }
}

/// A capability-specific SQL routine. `create_sql` is rendered exclusively
/// from validated idents and range-checked numbers.
#[derive(Debug, Clone)]
pub struct RoutineSpec {
    pub schema: Ident,
    pub name: Ident,
    pub arg_signature: &'static str,
    pub create_sql: String,
}

impl RoutineSpec {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema.as_str(), self.name.as_str())
    }

    pub fn drop_sql(&self) -> String {
        format!(
            "DROP FUNCTION IF EXISTS {}({})",
            self.qualified(),
            self.arg_signature
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    VectorSearch,
    FuzzyText,
}

impl CapabilityKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "vector_search" => Some(Self::VectorSearch),
            "fuzzy_text" => Some(Self::FuzzyText),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::VectorSearch => "vector_search",
            Self::FuzzyText => "fuzzy_text",
        }
    }

    /// Postgres extension the capability rides on.
    pub fn extension(self) -> &'static str {
        match self {
            Self::VectorSearch => "vector",
            Self::FuzzyText => "pg_trgm",
        }
    }
}

/// Everything the coordinator needs to converge one capability: the backing
/// table, its standard secondary indexes, the search index, the query
/// routines, and the shape expectation used for mismatch detection.
#[derive(Debug, Clone)]
pub struct CapabilityPlan {
    pub kind: CapabilityKind,
    pub table: TableSpec,
    pub secondary_indexes: Vec<IndexSpec>,
    pub search_index: SearchIndexSpec,
    pub routines: Vec<RoutineSpec>,
    pub expected_vector_dim: Option<u32>,
    pub summary: Value,
}

impl CapabilityPlan {
    pub fn extension(&self) -> &'static str {
        self.kind.extension()
    }

    /// The vector column carrying the shape expectation, when the plan has
    /// one.
    pub fn vector_column(&self) -> Option<&Ident> {
        match &self.search_index {
            SearchIndexSpec::Vector { column, .. } => Some(column),
            SearchIndexSpec::Trigram { .. } => None,
        }
    }
}

/// Build and validate the plan for one feature from its resolved parameter
/// document. Pure; any live-store concern stays in the coordinator.
pub fn build_plan(schema: &Ident, params: &Value) -> Result<CapabilityPlan, SchemaError> {
    let capability = match params.get("capability") {
        Some(Value::String(raw)) => raw.as_str(),
        Some(_) => {
            return Err(SchemaError::InvalidParameter {
                name: "capability",
                reason: "must be a string".to_string(),
            });
        }
        None => return Err(SchemaError::MissingCapability),
    };
    match CapabilityKind::parse(capability) {
        Some(CapabilityKind::VectorSearch) => vector_search_plan(schema, params),
        Some(CapabilityKind::FuzzyText) => fuzzy_text_plan(schema, params),
        None => Err(SchemaError::UnknownCapability(capability.to_string())),
    }
}

fn vector_search_plan(schema: &Ident, params: &Value) -> Result<CapabilityPlan, SchemaError> {
    let table_name = ident_param(params, "table", DEFAULT_VECTOR_TABLE)?;
    let dim = u32_param(params, "embedding_dim", DEFAULT_EMBEDDING_DIM, 1, MAX_EMBEDDING_DIM)?;
    let metric_raw = str_param(params, "metric", DEFAULT_METRIC)?;
    let metric = DistanceMetric::parse(&metric_raw).ok_or(SchemaError::InvalidParameter {
        name: "metric",
        reason: format!("unknown metric {metric_raw:?}"),
    })?;
    let index_kind_raw = str_param(params, "index_kind", DEFAULT_INDEX_KIND)?;
    let index_kind = match index_kind_raw.as_str() {
        "ivfflat" => VectorIndexKind::IvfFlat {
            lists: u32_param(params, "ivfflat_lists", DEFAULT_IVFFLAT_LISTS, 1, 32_768)?,
        },
        "hnsw" => VectorIndexKind::Hnsw {
            m: u32_param(params, "hnsw_m", DEFAULT_HNSW_M, 2, 100)?,
            ef_construction: u32_param(
                params,
                "hnsw_ef_construction",
                DEFAULT_HNSW_EF_CONSTRUCTION,
                4,
                1_000,
            )?,
        },
        other => {
            return Err(SchemaError::InvalidParameter {
                name: "index_kind",
                reason: format!("unknown index kind {other:?}"),
            });
        }
    };
    let content_max_chars =
        u32_param(params, "content_max_chars", DEFAULT_CONTENT_MAX_CHARS, 1, 1_000_000)?;
    let search_limit = u32_param(params, "search_limit", DEFAULT_SEARCH_LIMIT, 1, 1_000)?;

    let table = TableSpec {
        schema: schema.clone(),
        name: table_name.clone(),
        columns: vec![
            ColumnSpec {
                name: Ident::new("id")?,
                column_type: ColumnType::BigSerial,
                not_null: true,
                primary_key: true,
                default_now: false,
            },
            ColumnSpec::plain(Ident::new("user_id")?, ColumnType::Text { max_chars: None }, true),
            ColumnSpec::plain(
                Ident::new("content")?,
                ColumnType::Text {
                    max_chars: Some(content_max_chars),
                },
                true,
            ),
            ColumnSpec::plain(Ident::new("metadata")?, ColumnType::Jsonb, false),
            ColumnSpec::plain(Ident::new("embedding")?, ColumnType::Vector { dim }, false),
            ColumnSpec {
                name: Ident::new("created_at")?,
                column_type: ColumnType::TimestampTz,
                not_null: true,
                primary_key: false,
                default_now: true,
            },
        ],
    };

    let secondary_indexes = vec![
        IndexSpec {
            name: table_name.suffixed("user_id_idx")?,
            schema: schema.clone(),
            table: table_name.clone(),
            columns: vec![Ident::new("user_id")?],
        },
        IndexSpec {
            name: table_name.suffixed("created_at_idx")?,
            schema: schema.clone(),
            table: table_name.clone(),
            columns: vec![Ident::new("created_at")?],
        },
    ];

    let search_index = SearchIndexSpec::Vector {
        name: table_name.suffixed("embedding_idx")?,
        schema: schema.clone(),
        table: table_name.clone(),
        column: Ident::new("embedding")?,
        metric,
        kind: index_kind,
    };

    let routine_name = table_name.suffixed("search")?;
    let routine_sql = format!(
        r#"CREATE OR REPLACE FUNCTION {schema}.{routine}(p_user_id TEXT, p_query VECTOR({dim}), p_limit INT DEFAULT {limit})
RETURNS TABLE (content TEXT, metadata JSONB, distance DOUBLE PRECISION)
LANGUAGE sql STABLE AS $$
    SELECT content, metadata, (embedding {op} p_query)::double precision AS distance
      FROM {schema}.{table}
     WHERE user_id = p_user_id AND embedding IS NOT NULL
     ORDER BY embedding {op} p_query
     LIMIT p_limit
$$"#,
        schema = schema.as_str(),
        routine = routine_name.as_str(),
        table = table_name.as_str(),
        dim = dim,
        limit = search_limit,
        op = metric.order_operator(),
    );
    let routines = vec![RoutineSpec {
        schema: schema.clone(),
        name: routine_name,
        arg_signature: "TEXT, VECTOR, INT",
        create_sql: routine_sql,
    }];

    let summary = json!({
        "capability": CapabilityKind::VectorSearch.as_str(),
        "table": table.qualified(),
        "embedding_dim": dim,
        "metric": metric.as_str(),
        "index_kind": index_kind_raw,
        "index_params": match index_kind {
            VectorIndexKind::IvfFlat { lists } => json!({ "lists": lists }),
            VectorIndexKind::Hnsw { m, ef_construction } => {
                json!({ "m": m, "ef_construction": ef_construction })
            }
        },
        "content_max_chars": content_max_chars,
        "search_limit": search_limit,
    });

    Ok(CapabilityPlan {
        kind: CapabilityKind::VectorSearch,
        table,
        secondary_indexes,
        search_index,
        routines,
        expected_vector_dim: Some(dim),
        summary,
    })
}

fn fuzzy_text_plan(schema: &Ident, params: &Value) -> Result<CapabilityPlan, SchemaError> {
    let table_name = ident_param(params, "table", DEFAULT_FUZZY_TABLE)?;
    let content_max_chars =
        u32_param(params, "content_max_chars", DEFAULT_CONTENT_MAX_CHARS, 1, 1_000_000)?;
    let search_limit = u32_param(params, "search_limit", DEFAULT_SEARCH_LIMIT, 1, 1_000)?;
    let threshold = f64_param(
        params,
        "similarity_threshold",
        DEFAULT_SIMILARITY_THRESHOLD,
        0.0,
        1.0,
    )?;

    let table = TableSpec {
        schema: schema.clone(),
        name: table_name.clone(),
        columns: vec![
            ColumnSpec {
                name: Ident::new("id")?,
                column_type: ColumnType::BigSerial,
                not_null: true,
                primary_key: true,
                default_now: false,
            },
            ColumnSpec::plain(Ident::new("user_id")?, ColumnType::Text { max_chars: None }, true),
            ColumnSpec::plain(
                Ident::new("content")?,
                ColumnType::Text {
                    max_chars: Some(content_max_chars),
                },
                true,
            ),
            ColumnSpec::plain(Ident::new("metadata")?, ColumnType::Jsonb, false),
            ColumnSpec {
                name: Ident::new("created_at")?,
                column_type: ColumnType::TimestampTz,
                not_null: true,
                primary_key: false,
                default_now: true,
            },
        ],
    };

    let secondary_indexes = vec![IndexSpec {
        name: table_name.suffixed("user_id_idx")?,
        schema: schema.clone(),
        table: table_name.clone(),
        columns: vec![Ident::new("user_id")?],
    }];

    let search_index = SearchIndexSpec::Trigram {
        name: table_name.suffixed("content_trgm_idx")?,
        schema: schema.clone(),
        table: table_name.clone(),
        column: Ident::new("content")?,
    };

    let routine_name = table_name.suffixed("match")?;
    let routine_sql = format!(
        r#"CREATE OR REPLACE FUNCTION {schema}.{routine}(p_user_id TEXT, p_query TEXT, p_limit INT DEFAULT {limit})
RETURNS TABLE (content TEXT, metadata JSONB, score REAL)
LANGUAGE sql STABLE AS $$
    SELECT content, metadata, similarity(content, p_query) AS score
      FROM {schema}.{table}
     WHERE user_id = p_user_id AND similarity(content, p_query) >= {threshold}
     ORDER BY score DESC
     LIMIT p_limit
$$"#,
        schema = schema.as_str(),
        routine = routine_name.as_str(),
        table = table_name.as_str(),
        limit = search_limit,
        threshold = threshold,
    );
    let routines = vec![RoutineSpec {
        schema: schema.clone(),
        name: routine_name,
        arg_signature: "TEXT, TEXT, INT",
        create_sql: routine_sql,
    }];

    let summary = json!({
        "capability": CapabilityKind::FuzzyText.as_str(),
        "table": table.qualified(),
        "content_max_chars": content_max_chars,
        "search_limit": search_limit,
        "similarity_threshold": threshold,
    });

    Ok(CapabilityPlan {
        kind: CapabilityKind::FuzzyText,
        table,
        secondary_indexes,
        search_index,
        routines,
        expected_vector_dim: None,
        summary,
    })
}

fn str_param(params: &Value, name: &'static str, default: &str) -> Result<String, SchemaError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(raw)) => Ok(raw.clone()),
        Some(_) => Err(SchemaError::InvalidParameter {
            name,
            reason: "must be a string".to_string(),
        }),
    }
}

fn ident_param(params: &Value, name: &'static str, default: &str) -> Result<Ident, SchemaError> {
    Ident::new(&str_param(params, name, default)?)
}

fn u32_param(
    params: &Value,
    name: &'static str,
    default: u32,
    min: u32,
    max: u32,
) -> Result<u32, SchemaError> {
    let value = match params.get(name) {
        None | Some(Value::Null) => default,
        Some(Value::Number(number)) => number
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(SchemaError::InvalidParameter {
                name,
                reason: "must be a non-negative integer".to_string(),
            })?,
        Some(_) => {
            return Err(SchemaError::InvalidParameter {
                name,
                reason: "must be an integer".to_string(),
            });
        }
    };
    if value < min || value > max {
        return Err(SchemaError::InvalidParameter {
            name,
            reason: format!("{value} outside [{min}, {max}]"),
        });
    }
    Ok(value)
}

fn f64_param(
    params: &Value,
    name: &'static str,
    default: f64,
    min: f64,
    max: f64,
) -> Result<f64, SchemaError> {
    let value = match params.get(name) {
        None | Some(Value::Null) => default,
        Some(Value::Number(number)) => {
            number.as_f64().ok_or(SchemaError::InvalidParameter {
                name,
                reason: "must be a number".to_string(),
            })?
        }
        Some(_) => {
            return Err(SchemaError::InvalidParameter {
                name,
                reason: "must be a number".to_string(),
            });
        }
    };
    if !(min..=max).contains(&value) {
        return Err(SchemaError::InvalidParameter {
            name,
            reason: format!("{value} outside [{min}, {max}]"),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Ident {
        match Ident::new("companion") {
            Ok(ident) => ident,
            Err(error) => panic!("schema ident: {error}"),
        }
    }

    #[test]
    fn idents_reject_injection_and_reserved_names() {
        assert!(Ident::new("memory_vectors").is_ok());
        assert!(Ident::new("users; drop table users").is_err());
        assert!(Ident::new("Users").is_err());
        assert!(Ident::new("").is_err());
        assert!(Ident::new("pg_catalog").is_err());
        assert!(Ident::new(&"a".repeat(64)).is_err());
        assert!(Ident::new(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn vector_plan_uses_builtin_fallbacks_when_params_are_empty() {
        let plan = match build_plan(&schema(), &json!({"capability": "vector_search"})) {
            Ok(plan) => plan,
            Err(error) => panic!("plan: {error}"),
        };
        assert_eq!(plan.table.qualified(), "companion.memory_vectors");
        assert_eq!(plan.expected_vector_dim, Some(DEFAULT_EMBEDDING_DIM));
        let sql = plan.search_index.create_sql();
        assert!(sql.contains("USING ivfflat"));
        assert!(sql.contains("vector_cosine_ops"));
        assert!(sql.contains("WITH (lists = 100)"));
        assert!(plan.table.create_sql().contains("embedding VECTOR(1536)"));
    }

    #[test]
    fn resolved_parameters_override_every_fallback() {
        let params = json!({
            "capability": "vector_search",
            "table": "recall_vectors",
            "embedding_dim": 768,
            "metric": "inner_product",
            "index_kind": "hnsw",
            "hnsw_m": 32,
            "hnsw_ef_construction": 128,
            "content_max_chars": 2048,
            "search_limit": 10,
        });
        let plan = match build_plan(&schema(), &params) {
            Ok(plan) => plan,
            Err(error) => panic!("plan: {error}"),
        };
        assert_eq!(plan.table.qualified(), "companion.recall_vectors");
        let index_sql = plan.search_index.create_sql();
        assert!(index_sql.contains("USING hnsw"));
        assert!(index_sql.contains("vector_ip_ops"));
        assert!(index_sql.contains("m = 32, ef_construction = 128"));
        assert!(plan.table.create_sql().contains("content VARCHAR(2048)"));
        let routine_sql = &plan.routines[0].create_sql;
        assert!(routine_sql.contains("VECTOR(768)"));
        assert!(routine_sql.contains("p_limit INT DEFAULT 10"));
        assert!(routine_sql.contains("<#>"));
    }

    #[test]
    fn malicious_table_parameter_is_rejected_before_any_sql_exists() {
        let params = json!({
            "capability": "vector_search",
            "table": "memories; DROP TABLE companion.config_versions; --",
        });
        assert!(matches!(
            build_plan(&schema(), &params),
            Err(SchemaError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn out_of_range_dimension_is_rejected() {
        let params = json!({"capability": "vector_search", "embedding_dim": 90_000});
        assert!(matches!(
            build_plan(&schema(), &params),
            Err(SchemaError::InvalidParameter { name: "embedding_dim", .. })
        ));
    }

    #[test]
    fn unknown_capability_is_an_error_not_a_panic() {
        assert!(matches!(
            build_plan(&schema(), &json!({"capability": "telepathy"})),
            Err(SchemaError::UnknownCapability(_))
        ));
        assert!(matches!(
            build_plan(&schema(), &json!({})),
            Err(SchemaError::MissingCapability)
        ));
    }

    #[test]
    fn fuzzy_plan_renders_trigram_index_and_similarity_routine() {
        let plan = match build_plan(&schema(), &json!({"capability": "fuzzy_text"})) {
            Ok(plan) => plan,
            Err(error) => panic!("plan: {error}"),
        };
        assert_eq!(plan.table.qualified(), "companion.memory_texts");
        assert_eq!(plan.extension(), "pg_trgm");
        assert!(plan.search_index.create_sql().contains("gin_trgm_ops"));
        let routine = &plan.routines[0];
        assert!(routine.create_sql.contains("similarity(content, p_query)"));
        assert!(routine.create_sql.contains(">= 0.25"));
        assert_eq!(
            routine.drop_sql(),
            "DROP FUNCTION IF EXISTS companion.memory_texts_match(TEXT, TEXT, INT)"
        );
    }

    #[test]
    fn create_statements_are_all_create_if_absent() {
        let plan = match build_plan(&schema(), &json!({"capability": "vector_search"})) {
            Ok(plan) => plan,
            Err(error) => panic!("plan: {error}"),
        };
        assert!(plan.table.create_sql().starts_with("CREATE TABLE IF NOT EXISTS"));
        for index in &plan.secondary_indexes {
            assert!(index.create_sql().starts_with("CREATE INDEX IF NOT EXISTS"));
        }
        assert!(plan.search_index.create_sql().starts_with("CREATE INDEX IF NOT EXISTS"));
    }
}
