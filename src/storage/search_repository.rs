use crate::error::{Result, StoreError};
use crate::monitor::degradation::{Capability, DegradationManager};
use crate::monitor::error_aggregator::{Alert, ErrorAggregator, ErrorStatistics};
use crate::query::heuristics::contains_dangerous_pattern;
use crate::resilience::CancelToken;
use crate::storage::search_cache::{CacheStats, SearchCache};
use crate::storage::service::DatabaseService;
use crate::storage::tag_expansion::expand_tags;
use rusqlite::{Row, ToSql};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const MAX_TAGS: usize = 5;
const MAX_TAG_LENGTH: usize = 100;
const MAX_QUERY_LENGTH: usize = 1000;
const MAX_PREFIX_LENGTH: usize = 100;
const DEFAULT_LIMIT: i64 = 20;
const SNIPPET_OPEN: &str = "<match>";
const SNIPPET_CLOSE: &str = "</match>";
const SNIPPET_ELLIPSIS: &str = "\u{2026}";
const SNIPPET_TOKENS: i32 = 8;

/// Columns of the inverted index, in snippet-field order.
const FTS_FIELDS: &[&str] = &[
    "filename",
    "path",
    "definitions",
    "imports",
    "docstrings",
    "tags",
];

/// Options shared by tag and free-text search.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOptions {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub language: Option<String>,
    /// Filter on file extension
    pub file_type: Option<String>,
    /// Substring filter on the path
    pub path_contains: Option<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    /// last_modified lower bound, milliseconds
    pub modified_after: Option<i64>,
    /// last_modified upper bound, milliseconds
    pub modified_before: Option<i64>,
    pub min_score: Option<f64>,
    pub include_snippets: bool,
    /// Double the limit before pagination
    pub over_retrieve: bool,
}

/// A snippet of a matched field with marker positions and matched terms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnippetMatch {
    pub field: String,
    pub snippet: String,
    pub start: usize,
    pub end: usize,
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HitMetadata {
    pub extension: String,
    pub language: String,
    pub size: i64,
    pub last_modified: i64,
}

/// One search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub path: String,
    pub filename: String,
    pub score: f64,
    pub matches: Vec<SnippetMatch>,
    pub metadata: HitMetadata,
}

/// Term suggestion for interactive prefix completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub term: String,
    pub kind: String,
    pub frequency: i64,
}

/// Index maintenance report. Failures are reported in-band rather than as
/// errors so maintenance tooling keeps running.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceOutcome {
    pub success: bool,
    pub operation: String,
    pub duration_ms: u64,
    pub before_bytes: i64,
    pub after_bytes: i64,
    pub error: Option<String>,
}

/// Progress observation and cancellation for maintenance operations.
#[derive(Default)]
pub struct MaintenanceOptions {
    pub progress: Option<Box<dyn Fn(u8) + Send + Sync>>,
    pub cancel: Option<CancelToken>,
}

impl MaintenanceOptions {
    fn report(&self, pct: u8) {
        if let Some(progress) = &self.progress {
            progress(pct);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false)
    }
}

/// Aggregate index statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SearchStats {
    pub indexed_documents: i64,
    pub total_files: i64,
    pub total_tags: i64,
    pub cache: CacheStats,
}

#[derive(Serialize)]
struct CacheKey<'a> {
    kind: &'static str,
    terms: Vec<String>,
    limit: i64,
    offset: i64,
    options: &'a SearchOptions,
}

/// Front end to the inverted-index virtual table: tag and free-text search
/// with snippet extraction, a TTL result cache, and index maintenance.
pub struct SearchRepository {
    service: Arc<DatabaseService>,
    cache: SearchCache<Vec<SearchHit>>,
    degradation: Option<Arc<DegradationManager>>,
    errors: Option<Arc<ErrorAggregator>>,
}

impl SearchRepository {
    pub fn new(service: Arc<DatabaseService>, cache_config: &crate::config::QueryCacheConfig) -> Self {
        Self {
            service,
            cache: SearchCache::new(cache_config),
            degradation: None,
            errors: None,
        }
    }

    pub fn with_degradation(mut self, degradation: Arc<DegradationManager>) -> Self {
        self.degradation = Some(degradation);
        self
    }

    pub fn with_error_aggregator(mut self, errors: Arc<ErrorAggregator>) -> Self {
        self.errors = Some(errors);
        self
    }

    fn caching_allowed(&self) -> bool {
        self.degradation
            .as_ref()
            .map(|d| d.is_capability_available(Capability::Caching))
            .unwrap_or(true)
    }

    fn indexing_allowed(&self) -> bool {
        self.degradation
            .as_ref()
            .map(|d| d.is_capability_available(Capability::Indexing))
            .unwrap_or(true)
    }

    fn observe<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Some(errors) = &self.errors {
            match &result {
                Ok(_) => errors.record_success("search", operation),
                Err(err) => errors.record_error(err, "search", operation),
            }
        }
        result
    }

    // === Validation ===

    fn validate_tags(tags: &[String]) -> Result<()> {
        if tags.is_empty() {
            return Err(StoreError::validation("at least one tag is required"));
        }
        if tags.len() > MAX_TAGS {
            return Err(StoreError::validation(format!(
                "too many tags: {} (maximum {MAX_TAGS})",
                tags.len()
            )));
        }
        for tag in tags {
            if tag.trim().is_empty() {
                return Err(StoreError::validation("tags cannot be empty"));
            }
            if tag.len() > MAX_TAG_LENGTH {
                return Err(StoreError::validation(format!(
                    "tag exceeds {MAX_TAG_LENGTH} characters"
                )));
            }
            if contains_dangerous_pattern(tag) {
                return Err(StoreError::validation(format!(
                    "tag contains a disallowed pattern: {tag:?}"
                )));
            }
        }
        Ok(())
    }

    fn validate_query(query: &str) -> Result<()> {
        if query.trim().is_empty() {
            return Err(StoreError::validation("query cannot be empty"));
        }
        if query.len() > MAX_QUERY_LENGTH {
            return Err(StoreError::validation(format!(
                "query exceeds {MAX_QUERY_LENGTH} characters"
            )));
        }
        if contains_dangerous_pattern(query) {
            return Err(StoreError::validation(
                "query contains a disallowed pattern",
            ));
        }
        Ok(())
    }

    // === Search ===

    /// Searches by tags with expansion: each tag contributes its case
    /// variants and fixed aliases as separate MATCH legs, OR-composed via
    /// UNION ALL.
    pub fn search_by_tags(&self, tags: &[String], options: &SearchOptions) -> Result<Vec<SearchHit>> {
        let result = self.search_by_tags_inner(tags, options);
        self.observe("search_by_tags", result)
    }

    fn search_by_tags_inner(
        &self,
        tags: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        Self::validate_tags(tags)?;
        let expanded = expand_tags(tags);

        let (limit, offset) = effective_page(options);
        let cache_key = self.cache_key("tags", &expanded, limit, offset, options);
        if self.caching_allowed() {
            if let Some(hits) = self.cache.get(&cache_key) {
                debug!(tags = ?tags, "tag search served from cache");
                return Ok(hits);
            }
        }

        let match_params: Vec<String> = expanded.iter().map(|t| tag_match_expr(t)).collect();
        let hits = self.run_fts_query(&match_params, options, limit, offset, 3)?;

        if self.caching_allowed() {
            self.cache.insert(cache_key, hits.clone());
        }
        Ok(hits)
    }

    /// Free-text search over every indexed field with a single MATCH
    /// parameter.
    pub fn search_by_text(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        let result = self.search_by_text_inner(query, options);
        self.observe("search_by_text", result)
    }

    fn search_by_text_inner(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        Self::validate_query(query)?;

        let (limit, offset) = effective_page(options);
        let terms = vec![query.to_string()];
        let cache_key = self.cache_key("text", &terms, limit, offset, options);
        if self.caching_allowed() {
            if let Some(hits) = self.cache.get(&cache_key) {
                debug!("text search served from cache");
                return Ok(hits);
            }
        }

        let hits = self.run_fts_query(&terms, options, limit, offset, 5)?;

        if self.caching_allowed() {
            self.cache.insert(cache_key, hits.clone());
        }
        Ok(hits)
    }

    fn cache_key(
        &self,
        kind: &'static str,
        terms: &[String],
        limit: i64,
        offset: i64,
        options: &SearchOptions,
    ) -> String {
        let mut sorted = terms.to_vec();
        sorted.sort();
        serde_json::to_string(&CacheKey {
            kind,
            terms: sorted.clone(),
            limit,
            offset,
            options,
        })
        .unwrap_or_else(|_| format!("{kind}:{sorted:?}:{limit}:{offset}"))
    }

    /// Builds and runs the UNION ALL query: one MATCH leg per term, grouped
    /// by file with the best score, ordered by score descending.
    fn run_fts_query(
        &self,
        match_exprs: &[String],
        options: &SearchOptions,
        limit: i64,
        offset: i64,
        snippet_fields: usize,
    ) -> Result<Vec<SearchHit>> {
        let snippets = if options.include_snippets {
            snippet_fields
        } else {
            0
        };

        let mut leg_sql = String::from(
            "SELECT f.id AS id, f.path AS path, f.filename AS filename, f.extension AS extension, \
             f.language AS language, f.size AS size, f.last_modified AS last_modified, \
             -files_fts.rank AS score",
        );
        for (index, field) in FTS_FIELDS.iter().take(snippets).enumerate() {
            leg_sql.push_str(&format!(
                ", snippet(files_fts, {index}, '{SNIPPET_OPEN}', '{SNIPPET_CLOSE}', '{SNIPPET_ELLIPSIS}', {SNIPPET_TOKENS}) AS snippet_{field}"
            ));
        }
        leg_sql.push_str(
            " FROM files_fts JOIN files f ON f.id = files_fts.file_id WHERE files_fts MATCH ?",
        );

        let mut filters = String::new();
        let mut filter_values: Vec<FilterValue> = Vec::new();
        if let Some(language) = &options.language {
            filters.push_str(" AND f.language = ?");
            filter_values.push(FilterValue::Text(language.clone()));
        }
        if let Some(file_type) = &options.file_type {
            filters.push_str(" AND f.extension = ?");
            filter_values.push(FilterValue::Text(file_type.clone()));
        }
        if let Some(fragment) = &options.path_contains {
            filters.push_str(" AND f.path LIKE ?");
            filter_values.push(FilterValue::Text(format!("%{fragment}%")));
        }
        if let Some(min_size) = options.min_size {
            filters.push_str(" AND f.size >= ?");
            filter_values.push(FilterValue::Int(min_size));
        }
        if let Some(max_size) = options.max_size {
            filters.push_str(" AND f.size <= ?");
            filter_values.push(FilterValue::Int(max_size));
        }
        if let Some(after) = options.modified_after {
            filters.push_str(" AND f.last_modified >= ?");
            filter_values.push(FilterValue::Int(after));
        }
        if let Some(before) = options.modified_before {
            filters.push_str(" AND f.last_modified <= ?");
            filter_values.push(FilterValue::Int(before));
        }
        leg_sql.push_str(&filters);

        let legs: Vec<String> = match_exprs.iter().map(|_| leg_sql.clone()).collect();

        let mut projection = String::from(
            "id, path, filename, extension, language, size, last_modified, MAX(score) AS score",
        );
        for field in FTS_FIELDS.iter().take(snippets) {
            projection.push_str(&format!(", snippet_{field}"));
        }
        let mut sql = format!(
            "SELECT {projection} FROM ({}) GROUP BY id",
            legs.join(" UNION ALL ")
        );
        if options.min_score.is_some() {
            sql.push_str(" HAVING score >= ?");
        }
        sql.push_str(" ORDER BY score DESC LIMIT ? OFFSET ?");

        // Parameter order: per leg, the MATCH expression then its filters;
        // then min_score, limit, offset.
        let mut params: Vec<Box<dyn ToSql + Send>> = Vec::new();
        for expr in match_exprs {
            params.push(Box::new(expr.clone()));
            for value in &filter_values {
                params.push(value.boxed());
            }
        }
        if let Some(min_score) = options.min_score {
            params.push(Box::new(min_score));
        }
        params.push(Box::new(limit));
        params.push(Box::new(offset));

        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref() as &dyn ToSql).collect();
        let snippet_count = snippets;
        self.service.execute_query(&sql, &refs, move |row| {
            map_search_hit(row, snippet_count)
        })
    }

    // === Suggestions ===

    /// Prefix suggestions: a union of tag terms and filename terms, each
    /// half ordered by frequency.
    pub fn get_suggestions(&self, prefix: &str, limit: usize) -> Result<Vec<Suggestion>> {
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(StoreError::validation(format!(
                "prefix exceeds {MAX_PREFIX_LENGTH} characters"
            )));
        }
        let cleaned: String = prefix.chars().filter(|c| *c != '"' && *c != '\'').collect();
        let cleaned = cleaned.trim().to_string();
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }

        let tag_limit = (limit + 1) / 2;
        let filename_limit = limit / 2;
        let filename_match = format!("filename : \"{cleaned}\"*");
        let tag_like = format!("{cleaned}%");

        let sql = "SELECT term, kind, frequency FROM ( \
                     SELECT tag AS term, 'tag' AS kind, COUNT(*) AS frequency \
                     FROM file_tags WHERE tag LIKE ?1 GROUP BY tag \
                     ORDER BY frequency DESC LIMIT ?2 \
                   ) \
                   UNION ALL \
                   SELECT term, kind, frequency FROM ( \
                     SELECT filename AS term, 'filename' AS kind, COUNT(*) AS frequency \
                     FROM files_fts WHERE files_fts MATCH ?3 GROUP BY filename \
                     ORDER BY frequency DESC LIMIT ?4 \
                   )";

        let result = self.service.execute_query(
            sql,
            &[
                &tag_like,
                &(tag_limit as i64),
                &filename_match,
                &(filename_limit as i64),
            ],
            |row| {
                Ok(Suggestion {
                    term: row.get(0)?,
                    kind: row.get(1)?,
                    frequency: row.get(2)?,
                })
            },
        );
        self.observe("get_suggestions", result)
    }

    // === Maintenance ===

    /// Issues the inverted-index rebuild control row, then optimizes.
    pub fn rebuild_index(&self, options: &MaintenanceOptions) -> MaintenanceOutcome {
        self.maintenance("rebuild", options, |service| {
            service.with_connection(|conn| {
                conn.execute("INSERT INTO files_fts(files_fts) VALUES('rebuild')", [])
                    .map_err(StoreError::from)?;
                Ok(())
            })
        })
    }

    /// Issues the optimize control row, then refreshes planner statistics.
    pub fn optimize_index(&self, options: &MaintenanceOptions) -> MaintenanceOutcome {
        self.maintenance("optimize", options, |_service| Ok(()))
    }

    fn maintenance<F>(
        &self,
        operation: &str,
        options: &MaintenanceOptions,
        primary: F,
    ) -> MaintenanceOutcome
    where
        F: FnOnce(&DatabaseService) -> Result<()>,
    {
        let started = Instant::now();
        let before_bytes = self.database_size().unwrap_or(0);

        let mut outcome = MaintenanceOutcome {
            success: false,
            operation: operation.to_string(),
            duration_ms: 0,
            before_bytes,
            after_bytes: before_bytes,
            error: None,
        };

        if !self.indexing_allowed() {
            outcome.error = Some("indexing capability is currently degraded".to_string());
            outcome.duration_ms = started.elapsed().as_millis() as u64;
            return outcome;
        }

        options.report(0);
        let result = primary(&self.service).and_then(|_| {
            options.report(50);
            if options.cancelled() {
                return Err(StoreError::validation("maintenance cancelled"));
            }
            self.service.with_connection(|conn| {
                conn.execute("INSERT INTO files_fts(files_fts) VALUES('optimize')", [])
                    .map_err(StoreError::from)?;
                conn.execute_batch("ANALYZE").map_err(StoreError::from)?;
                Ok(())
            })
        });

        match result {
            Ok(()) => {
                options.report(100);
                self.cache.clear();
                outcome.success = true;
                outcome.after_bytes = self.database_size().unwrap_or(before_bytes);
                info!(operation, "search index maintenance complete");
            }
            Err(err) => {
                warn!(operation, error = %err, "search index maintenance failed");
                if let Some(errors) = &self.errors {
                    errors.record_error(&err, "search", operation);
                }
                outcome.error = Some(err.to_string());
            }
        }
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        outcome
    }

    fn database_size(&self) -> Result<i64> {
        self.service.with_connection(|conn| {
            let page_count: i64 = conn
                .query_row("PRAGMA page_count", [], |row| row.get(0))
                .map_err(StoreError::from)?;
            let page_size: i64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .map_err(StoreError::from)?;
            Ok(page_count * page_size)
        })
    }

    // === Introspection ===

    pub fn get_stats(&self) -> Result<SearchStats> {
        let indexed_documents: i64 = self
            .service
            .execute_one("SELECT COUNT(*) FROM files_fts", &[], |row| row.get(0))?
            .unwrap_or(0);
        let total_files: i64 = self
            .service
            .execute_one("SELECT COUNT(*) FROM files", &[], |row| row.get(0))?
            .unwrap_or(0);
        let total_tags: i64 = self
            .service
            .execute_one("SELECT COUNT(*) FROM file_tags", &[], |row| row.get(0))?
            .unwrap_or(0);
        Ok(SearchStats {
            indexed_documents,
            total_files,
            total_tags,
            cache: self.cache.stats(),
        })
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Error statistics observed by this repository's aggregator.
    pub fn get_error_statistics(&self) -> Option<ErrorStatistics> {
        self.errors.as_ref().map(|e| e.get_error_statistics())
    }

    /// Alerts currently active for search failures.
    pub fn check_failure_alerts(&self) -> Vec<Alert> {
        self.errors
            .as_ref()
            .map(|e| e.get_active_alerts())
            .unwrap_or_default()
    }
}

fn effective_page(options: &SearchOptions) -> (i64, i64) {
    let mut limit = options.limit.unwrap_or(DEFAULT_LIMIT).max(0);
    if options.over_retrieve {
        limit *= 2;
    }
    (limit, options.offset.unwrap_or(0).max(0))
}

/// Builds the MATCH expression for one expanded tag. Quotes inside the tag
/// are doubled per FTS string syntax; the expression itself always travels
/// as a positional parameter.
fn tag_match_expr(tag: &str) -> String {
    format!("tags : \"{}\"", tag.replace('"', "\"\""))
}

/// Filter values are repeated once per UNION ALL leg, so they are kept in a
/// cloneable form rather than as boxed trait objects.
#[derive(Debug, Clone)]
enum FilterValue {
    Text(String),
    Int(i64),
}

impl FilterValue {
    fn boxed(&self) -> Box<dyn ToSql + Send> {
        match self {
            FilterValue::Text(v) => Box::new(v.clone()),
            FilterValue::Int(v) => Box::new(*v),
        }
    }
}

fn map_search_hit(row: &Row<'_>, snippet_count: usize) -> rusqlite::Result<SearchHit> {
    let mut matches = Vec::with_capacity(snippet_count);
    for (index, field) in FTS_FIELDS.iter().take(snippet_count).enumerate() {
        let snippet: Option<String> = row.get(8 + index)?;
        let snippet = snippet.unwrap_or_default();
        if snippet.contains(SNIPPET_OPEN) {
            matches.push(parse_snippet(field, snippet));
        }
    }
    Ok(SearchHit {
        id: row.get(0)?,
        path: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        filename: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        score: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
        matches,
        metadata: HitMetadata {
            extension: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            language: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            size: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
            last_modified: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
        },
    })
}

/// Extracts marker positions and matched terms from a snippet string.
fn parse_snippet(field: &str, snippet: String) -> SnippetMatch {
    let start = snippet.find(SNIPPET_OPEN).unwrap_or(0);
    let end = snippet
        .rfind(SNIPPET_CLOSE)
        .map(|pos| pos + SNIPPET_CLOSE.len())
        .unwrap_or(snippet.len());

    let mut terms: Vec<String> = Vec::new();
    let mut rest = snippet.as_str();
    while let Some(open) = rest.find(SNIPPET_OPEN) {
        let after = &rest[open + SNIPPET_OPEN.len()..];
        match after.find(SNIPPET_CLOSE) {
            Some(close) => {
                let term = after[..close].to_string();
                if !terms.contains(&term) {
                    terms.push(term);
                }
                rest = &after[close + SNIPPET_CLOSE.len()..];
            }
            None => break,
        }
    }

    SnippetMatch {
        field: field.to_string(),
        snippet,
        start,
        end,
        terms,
    }
}
