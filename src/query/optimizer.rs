use crate::config::{StatementCacheConfig, MAX_CACHE_SIZE};
use crate::error::{Result, StoreError};
use crate::query::heuristics;
use crate::storage::service::DatabaseService;
use regex::Regex;
use rusqlite::types::Null;
use rusqlite::ToSql;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a captured execution plan stays fresh.
const PLAN_CACHE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Improvement scores are capped here.
const MAX_IMPROVEMENT: f64 = 95.0;

/// One row of EXPLAIN QUERY PLAN output.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PlanRow {
    pub id: i64,
    pub parent: i64,
    pub detail: String,
}

/// Captured execution plan with derived advisories.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryPlan {
    pub rows: Vec<PlanRow>,
    pub estimated_cost: f64,
    pub recommended_indexes: Vec<String>,
    pub optimization_hints: Vec<String>,
}

/// Result of `optimize_query`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OptimizedQuery {
    pub original_sql: String,
    pub optimized_sql: String,
    pub plan: QueryPlan,
    pub estimated_improvement: f64,
}

/// Result of `analyze_query_security`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SecurityReport {
    pub is_safe: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatementCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub evictions: u64,
}

struct CachedPlan {
    plan: QueryPlan,
    captured_at: Instant,
}

struct StatementEntry {
    uses: u64,
    last_used: Instant,
}

/// Tracks prepared-statement reuse by SQL text. The statement objects
/// themselves live on each pooled handle (`prepare_cached`); this cache
/// decides which texts are worth keeping warm and surfaces reuse stats.
struct StatementCache {
    entries: HashMap<String, StatementEntry>,
    max_size: usize,
    enabled: bool,
    hits: u64,
    evictions: u64,
}

impl StatementCache {
    fn register(&mut self, sql: &str) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        if let Some(entry) = self.entries.get_mut(sql) {
            entry.uses += 1;
            entry.last_used = now;
            self.hits += 1;
        } else {
            self.entries.insert(
                sql.to_string(),
                StatementEntry {
                    uses: 1,
                    last_used: now,
                },
            );
        }
        while self.entries.len() > self.max_size {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
                self.evictions += 1;
            } else {
                break;
            }
        }
    }
}

/// Caches execution plans by a stable hash of the SQL text and applies a
/// small set of rewrite heuristics.
pub struct QueryOptimizer {
    service: Arc<DatabaseService>,
    plan_cache: Mutex<HashMap<u64, CachedPlan>>,
    statements: Mutex<StatementCache>,
    plan_ttl: Duration,
}

impl QueryOptimizer {
    pub fn new(service: Arc<DatabaseService>, statement_config: &StatementCacheConfig) -> Self {
        Self {
            service,
            plan_cache: Mutex::new(HashMap::new()),
            statements: Mutex::new(StatementCache {
                entries: HashMap::new(),
                max_size: statement_config.max_size,
                enabled: statement_config.enabled,
                hits: 0,
                evictions: 0,
            }),
            plan_ttl: PLAN_CACHE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_plan_ttl(mut self, ttl: Duration) -> Self {
        self.plan_ttl = ttl;
        self
    }

    /// Stable hash of the normalized SQL text (FNV-1a).
    pub fn query_hash(sql: &str) -> u64 {
        let normalized = normalize_whitespace(sql);
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in normalized.to_ascii_lowercase().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    /// Captures (or reuses) the execution plan and applies the rewrite
    /// heuristics.
    pub fn optimize_query(&self, sql: &str) -> Result<OptimizedQuery> {
        let hash = Self::query_hash(sql);
        let plan = match self.cached_plan(hash) {
            Some(plan) => plan,
            None => {
                let plan = self.capture_plan(sql)?;
                self.plan_cache
                    .lock()
                    .expect("plan cache lock poisoned")
                    .insert(
                        hash,
                        CachedPlan {
                            plan: plan.clone(),
                            captured_at: Instant::now(),
                        },
                    );
                plan
            }
        };

        self.statements
            .lock()
            .expect("statement cache lock poisoned")
            .register(sql);

        let mut optimized = rewrite_sql(sql);
        if let Some(index) = plan.recommended_indexes.first() {
            optimized = insert_index_hint(&optimized, index);
        }

        let estimated_improvement = estimate_improvement(&plan);
        Ok(OptimizedQuery {
            original_sql: sql.to_string(),
            optimized_sql: optimized,
            plan,
            estimated_improvement,
        })
    }

    fn cached_plan(&self, hash: u64) -> Option<QueryPlan> {
        let cache = self.plan_cache.lock().expect("plan cache lock poisoned");
        cache.get(&hash).and_then(|entry| {
            if entry.captured_at.elapsed() < self.plan_ttl {
                Some(entry.plan.clone())
            } else {
                None
            }
        })
    }

    /// Placeholders are bound to NULL; the planner only needs the statement
    /// shape.
    fn capture_plan(&self, sql: &str) -> Result<QueryPlan> {
        let explain_sql = format!("EXPLAIN QUERY PLAN {sql}");
        let rows = self.service.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&explain_sql)
                .map_err(|e| StoreError::query(e, &explain_sql, 0))?;
            let nulls = vec![Null; stmt.parameter_count()];
            let params: Vec<&dyn ToSql> = nulls.iter().map(|n| n as &dyn ToSql).collect();
            let result = stmt
                .query_map(&params[..], |row| {
                    Ok(PlanRow {
                        id: row.get(0)?,
                        parent: row.get(1)?,
                        detail: row.get(3)?,
                    })
                })
                .map_err(|e| StoreError::query(e, &explain_sql, params.len()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| StoreError::query(e, &explain_sql, params.len()));
            result
        })?;
        debug!(rows = rows.len(), "captured execution plan");
        Ok(derive_plan(rows))
    }

    /// Advisory security scan: the shared pattern set plus a rule that
    /// string literals in un-parameterized SQL raise a warning.
    pub fn analyze_query_security(&self, sql: &str) -> SecurityReport {
        let mut warnings = heuristics::scan(sql);
        if has_string_literal(sql) && !sql.contains('?') {
            warnings.push("string literal without placeholders".to_string());
        }
        SecurityReport {
            is_safe: warnings.is_empty(),
            warnings,
        }
    }

    /// Fixed-shape index advisories for known table name patterns.
    pub fn suggest_indexes(&self, table: &str) -> Vec<String> {
        let lowered = table.to_ascii_lowercase();
        if lowered.starts_with("files") {
            vec![
                "CREATE INDEX IF NOT EXISTS idx_files_path ON files(path)".to_string(),
                "CREATE INDEX IF NOT EXISTS idx_files_language ON files(language)".to_string(),
                "CREATE INDEX IF NOT EXISTS idx_files_last_modified ON files(last_modified)"
                    .to_string(),
            ]
        } else if lowered.starts_with("search") || lowered.starts_with("fts") {
            vec![
                "CREATE INDEX IF NOT EXISTS idx_file_tags_tag ON file_tags(tag)".to_string(),
                "CREATE INDEX IF NOT EXISTS idx_file_tags_weight ON file_tags(weight)".to_string(),
            ]
        } else {
            Vec::new()
        }
    }

    /// Drops plan cache entries past the TTL.
    pub fn clear_stale_plans(&self) {
        let mut cache = self.plan_cache.lock().expect("plan cache lock poisoned");
        let ttl = self.plan_ttl;
        let before = cache.len();
        cache.retain(|_, entry| entry.captured_at.elapsed() < ttl);
        if cache.len() < before {
            debug!(dropped = before - cache.len(), "stale plans cleared");
        }
    }

    pub fn plan_cache_len(&self) -> usize {
        self.plan_cache
            .lock()
            .expect("plan cache lock poisoned")
            .len()
    }

    pub fn statement_cache_stats(&self) -> StatementCacheStats {
        let statements = self.statements.lock().expect("statement cache lock poisoned");
        StatementCacheStats {
            entries: statements.entries.len(),
            hits: statements.hits,
            evictions: statements.evictions,
        }
    }
}

fn normalize_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn derive_plan(rows: Vec<PlanRow>) -> QueryPlan {
    let mut recommended_indexes = Vec::new();
    let mut optimization_hints = Vec::new();
    let mut estimated_cost = 0.0;
    let mut saw_cost = false;

    for row in &rows {
        let detail = row.detail.as_str();
        let upper = detail.to_ascii_uppercase();

        if let Some(cost) = parse_cost(detail) {
            estimated_cost += cost;
            saw_cost = true;
        }

        if upper.contains("SCAN") && !upper.contains("USING INDEX") && !upper.contains("USING COVERING INDEX") {
            if let Some(table) = scanned_table(detail) {
                optimization_hints.push(format!("full table scan on {table}"));
                let index = format!("idx_{table}_auto");
                if !recommended_indexes.contains(&index) {
                    recommended_indexes.push(index);
                }
            }
        }
        if upper.contains("USE TEMP B-TREE") {
            optimization_hints.push("temporary b-tree for sorting or grouping".to_string());
        }
        if upper.contains("SUBQUERY") {
            optimization_hints.push("subquery in plan".to_string());
        }
        if upper.contains("USING COVERING INDEX") {
            optimization_hints.push("covering index in use".to_string());
        }
    }

    if !saw_cost {
        estimated_cost = rows.len() as f64;
    }

    QueryPlan {
        rows,
        estimated_cost,
        recommended_indexes,
        optimization_hints,
    }
}

fn parse_cost(detail: &str) -> Option<f64> {
    let start = detail.find("cost=")?;
    let rest = &detail[start + 5..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn scanned_table(detail: &str) -> Option<String> {
    // Plan rows read "SCAN files" or, in older output, "SCAN TABLE files"
    let upper = detail.to_ascii_uppercase();
    let after = if let Some(pos) = upper.find("SCAN TABLE ") {
        &detail[pos + "SCAN TABLE ".len()..]
    } else if let Some(pos) = upper.find("SCAN ") {
        &detail[pos + "SCAN ".len()..]
    } else {
        return None;
    };
    let table: String = after
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if table.is_empty() {
        None
    } else {
        Some(table)
    }
}

fn bounded_query_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(id|rowid|[a-z0-9_]+_id)\s*=").expect("invalid pattern")
    })
}

/// Whitespace collapse, quote normalization, and the safety LIMIT for
/// unbounded SELECTs.
fn rewrite_sql(sql: &str) -> String {
    let mut out = normalize_whitespace(sql).replace('"', "'");
    let upper = out.to_ascii_uppercase();
    let is_select = upper.starts_with("SELECT");
    let has_limit = upper.contains(" LIMIT ");
    let is_bounded = bounded_query_pattern().is_match(&out);
    if is_select && !has_limit && !is_bounded {
        out.push_str(&format!(" LIMIT {MAX_CACHE_SIZE}"));
    }
    out
}

/// Appends INDEXED BY after the first FROM table.
fn insert_index_hint(sql: &str, index: &str) -> String {
    let upper = sql.to_ascii_uppercase();
    let Some(from_pos) = upper.find(" FROM ") else {
        return sql.to_string();
    };
    let table_start = from_pos + " FROM ".len();
    let table_len = sql[table_start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count();
    if table_len == 0 {
        return sql.to_string();
    }
    let insert_at = table_start + table_len;
    format!(
        "{} INDEXED BY {}{}",
        &sql[..insert_at],
        index,
        &sql[insert_at..]
    )
}

fn estimate_improvement(plan: &QueryPlan) -> f64 {
    let mut score: f64 = 0.0;
    if plan
        .optimization_hints
        .iter()
        .any(|h| h.contains("covering index"))
    {
        score += 20.0;
    }
    if !plan.recommended_indexes.is_empty() {
        score += 25.0;
    }
    if plan.estimated_cost < 10.0 {
        score += 15.0;
    }
    score.min(MAX_IMPROVEMENT)
}

fn has_string_literal(sql: &str) -> bool {
    let mut chars = sql.chars();
    while let Some(c) = chars.next() {
        if c == '\'' {
            for inner in chars.by_ref() {
                if inner == '\'' {
                    return true;
                }
            }
        }
    }
    false
}
