//! Loader Service - Incremental dimensional loads for the movie warehouse
//!
//! Responsibilities:
//! - Normalize cleaned records against the declared star schema
//! - Assign stable surrogate keys per business key per dimension
//! - Reconcile dimension attributes with SCD Type 2 history tracking
//! - Resolve fact foreign keys to the dimension version active at the
//!   fact's as-of date
//! - Commit each batch atomically and advance the source watermark
//!
//! CRITICAL: This service must be IDEMPOTENT
//! Re-running an already-committed batch with identical input is a no-op;
//! a failed batch leaves the warehouse byte-for-byte untouched.
//!
//! Usage:
//!   cargo run --bin loader -- --batch-id 2024-07-01T00 \
//!       --input data/cleaned/batch-2024-07-01.jsonl \
//!       --watermark 2024-07-01T00:00:00Z

use anyhow::{bail, ensure, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads cleaned records into the dimensional warehouse")]
struct Args {
    /// Batch identifier assigned by the orchestrator
    #[arg(long)]
    batch_id: String,

    /// Path to the cleaned-record stream (JSON Lines)
    #[arg(long)]
    input: String,

    /// Source watermark for this batch (RFC 3339 timestamp)
    #[arg(long)]
    watermark: String,

    /// Dry run - reconcile and report but don't save to database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    max_connections: u32,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
        })
    }
}

/// Advisory lock key for the single-writer-per-warehouse discipline.
/// Concurrent loader runs serialize on this lock so a later batch can never
/// reconcile against state older than a still-in-flight earlier batch.
const WAREHOUSE_LOCK_KEY: i64 = 0x4d57_4c4f_4144; // "MWLOAD"

// =============================================================================
// Declared warehouse schema
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Text,
    Integer,
    Date,
    Decimal,
}

impl FieldType {
    fn name(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Date => "date",
            FieldType::Decimal => "decimal",
        }
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    ftype: FieldType,
    required: bool,
}

fn field(name: &str, ftype: FieldType, required: bool) -> FieldSpec {
    FieldSpec {
        name: name.to_string(),
        ftype,
        required,
    }
}

/// One dimension table. Attributes listed in `type2` get a new history row
/// when they change; everything else is corrected in place.
#[derive(Debug, Clone)]
struct DimensionSchema {
    name: String,
    fields: Vec<FieldSpec>,
    type2: BTreeSet<String>,
}

/// Reference from a fact record attribute to the dimension it points at.
#[derive(Debug, Clone)]
struct DimensionRef {
    field: String,
    dimension: String,
}

#[derive(Debug, Clone)]
struct MeasureSpec {
    name: String,
    required: bool,
}

fn measure(name: &str, required: bool) -> MeasureSpec {
    MeasureSpec {
        name: name.to_string(),
        required,
    }
}

#[derive(Debug, Clone)]
struct FactSchema {
    name: String,
    dimensions: Vec<DimensionRef>,
    measures: Vec<MeasureSpec>,
}

/// Schema for one warehouse: dimensions in load order, then fact tables.
/// Dimensions must all load before any fact resolves.
#[derive(Debug, Clone)]
struct WarehouseSchema {
    dimensions: Vec<DimensionSchema>,
    facts: Vec<FactSchema>,
}

impl WarehouseSchema {
    fn dimension(&self, name: &str) -> Option<&DimensionSchema> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    fn fact(&self, name: &str) -> Option<&FactSchema> {
        self.facts.iter().find(|f| f.name == name)
    }
}

/// The movie-catalog star schema this loader ships with.
///
/// The type-1/type-2 split is a domain decision: title typos are overwritten,
/// while genre reclassifications, credited-name changes and studio ownership
/// changes are tracked as history.
fn movie_catalog_schema() -> WarehouseSchema {
    WarehouseSchema {
        dimensions: vec![
            DimensionSchema {
                name: "dim_movie".to_string(),
                fields: vec![
                    field("title", FieldType::Text, true),
                    field("genre", FieldType::Text, false),
                    field("certification", FieldType::Text, false),
                    field("release_date", FieldType::Date, false),
                ],
                type2: ["genre", "certification"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            DimensionSchema {
                name: "dim_director".to_string(),
                fields: vec![
                    field("credited_name", FieldType::Text, true),
                    field("birth_year", FieldType::Integer, false),
                ],
                type2: ["credited_name"].iter().map(|s| s.to_string()).collect(),
            },
            DimensionSchema {
                name: "dim_studio".to_string(),
                fields: vec![
                    field("name", FieldType::Text, true),
                    field("parent_company", FieldType::Text, false),
                    field("country", FieldType::Text, false),
                ],
                type2: ["parent_company"].iter().map(|s| s.to_string()).collect(),
            },
        ],
        facts: vec![FactSchema {
            name: "fact_movie_metrics".to_string(),
            dimensions: vec![
                DimensionRef {
                    field: "title_id".to_string(),
                    dimension: "dim_movie".to_string(),
                },
                DimensionRef {
                    field: "director_id".to_string(),
                    dimension: "dim_director".to_string(),
                },
                DimensionRef {
                    field: "studio_id".to_string(),
                    dimension: "dim_studio".to_string(),
                },
            ],
            measures: vec![
                measure("avg_rating", true),
                measure("num_votes", true),
                measure("revenue", false),
            ],
        }],
    }
}

// =============================================================================
// Typed values and cleaned-record input
// =============================================================================

/// A typed attribute value. The normalizer is the only producer; everything
/// downstream compares these for equality.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Text(String),
    Integer(i64),
    Date(NaiveDate),
    Decimal(f64),
}

impl Value {
    fn from_json(ftype: FieldType, raw: &serde_json::Value) -> Option<Value> {
        match ftype {
            FieldType::Text => raw.as_str().map(|s| Value::Text(s.trim().to_string())),
            FieldType::Integer => raw
                .as_i64()
                .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))
                .map(Value::Integer),
            FieldType::Date => raw
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
                .map(Value::Date),
            FieldType::Decimal => json_number(raw).map(Value::Decimal),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Text(s) => serde_json::json!(s),
            Value::Integer(i) => serde_json::json!(i),
            Value::Date(d) => serde_json::json!(d.format("%Y-%m-%d").to_string()),
            Value::Decimal(f) => serde_json::json!(f),
        }
    }
}

fn json_number(raw: &serde_json::Value) -> Option<f64> {
    raw.as_f64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))
}

/// One record from the upstream cleaning/profiling step: a target entity
/// name, a business/grain key, an as-of date and an attribute mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CleanedRecord {
    entity: String,
    key: String,
    as_of: NaiveDate,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// Rejects - validation and referential failures are data, not errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RejectReason {
    MissingRequiredField,
    TypeMismatch,
    BusinessKeyEmpty,
    UnknownEntity,
    StaleAsOfDate,
    DimensionNotFound,
}

impl RejectReason {
    fn as_str(self) -> &'static str {
        match self {
            RejectReason::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            RejectReason::TypeMismatch => "TYPE_MISMATCH",
            RejectReason::BusinessKeyEmpty => "BUSINESS_KEY_EMPTY",
            RejectReason::UnknownEntity => "UNKNOWN_ENTITY",
            RejectReason::StaleAsOfDate => "STALE_AS_OF_DATE",
            RejectReason::DimensionNotFound => "DIMENSION_NOT_FOUND",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Reject {
    entity: String,
    key: String,
    reason: RejectReason,
    detail: String,
}

fn reject(entity: &str, key: &str, reason: RejectReason, detail: String) -> Reject {
    Reject {
        entity: entity.to_string(),
        key: key.to_string(),
        reason,
        detail,
    }
}

// =============================================================================
// Record Normalizer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct NormalizedDimension {
    dimension: String,
    business_key: String,
    as_of: NaiveDate,
    attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
struct NormalizedFact {
    fact_table: String,
    grain_key: String,
    as_of: NaiveDate,
    /// dimension name -> business key of the referenced dimension row
    dim_business_keys: BTreeMap<String, String>,
    measures: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Normalized {
    Dimension(NormalizedDimension),
    Fact(NormalizedFact),
}

/// Validate and type one cleaned record against the declared schema.
/// Pure function: same record + same schema = same output.
fn normalize_record(rec: &CleanedRecord, schema: &WarehouseSchema) -> Result<Normalized, Reject> {
    if let Some(dim) = schema.dimension(&rec.entity) {
        if rec.key.trim().is_empty() {
            return Err(reject(
                &rec.entity,
                &rec.key,
                RejectReason::BusinessKeyEmpty,
                "dimension record has an empty business key".to_string(),
            ));
        }

        let mut attributes = BTreeMap::new();
        for spec in &dim.fields {
            match rec.attributes.get(&spec.name) {
                Some(raw) if !raw.is_null() => match Value::from_json(spec.ftype, raw) {
                    Some(value) => {
                        attributes.insert(spec.name.clone(), value);
                    }
                    None => {
                        return Err(reject(
                            &rec.entity,
                            &rec.key,
                            RejectReason::TypeMismatch,
                            format!("field '{}': expected {}, got {}", spec.name, spec.ftype.name(), raw),
                        ));
                    }
                },
                _ if spec.required => {
                    return Err(reject(
                        &rec.entity,
                        &rec.key,
                        RejectReason::MissingRequiredField,
                        format!("required field '{}' is missing", spec.name),
                    ));
                }
                _ => {}
            }
        }

        return Ok(Normalized::Dimension(NormalizedDimension {
            dimension: dim.name.clone(),
            business_key: rec.key.trim().to_string(),
            as_of: rec.as_of,
            attributes,
        }));
    }

    if let Some(fact) = schema.fact(&rec.entity) {
        if rec.key.trim().is_empty() {
            return Err(reject(
                &rec.entity,
                &rec.key,
                RejectReason::BusinessKeyEmpty,
                "fact record has an empty grain key".to_string(),
            ));
        }

        let mut dim_business_keys = BTreeMap::new();
        for dref in &fact.dimensions {
            let raw = rec.attributes.get(&dref.field).filter(|v| !v.is_null());
            let business_key = match raw.and_then(|v| v.as_str()) {
                Some(s) => s.trim().to_string(),
                None if raw.is_some() => {
                    return Err(reject(
                        &rec.entity,
                        &rec.key,
                        RejectReason::TypeMismatch,
                        format!("field '{}': expected text business key", dref.field),
                    ));
                }
                None => {
                    return Err(reject(
                        &rec.entity,
                        &rec.key,
                        RejectReason::MissingRequiredField,
                        format!("required dimension reference '{}' is missing", dref.field),
                    ));
                }
            };
            if business_key.is_empty() {
                return Err(reject(
                    &rec.entity,
                    &rec.key,
                    RejectReason::BusinessKeyEmpty,
                    format!("dimension reference '{}' is empty", dref.field),
                ));
            }
            dim_business_keys.insert(dref.dimension.clone(), business_key);
        }

        let mut measures = BTreeMap::new();
        for spec in &fact.measures {
            match rec.attributes.get(&spec.name).filter(|v| !v.is_null()) {
                Some(raw) => match json_number(raw) {
                    Some(value) => {
                        measures.insert(spec.name.clone(), value);
                    }
                    None => {
                        return Err(reject(
                            &rec.entity,
                            &rec.key,
                            RejectReason::TypeMismatch,
                            format!("measure '{}': expected a number, got {}", spec.name, raw),
                        ));
                    }
                },
                None if spec.required => {
                    return Err(reject(
                        &rec.entity,
                        &rec.key,
                        RejectReason::MissingRequiredField,
                        format!("required measure '{}' is missing", spec.name),
                    ));
                }
                None => {}
            }
        }

        return Ok(Normalized::Fact(NormalizedFact {
            fact_table: fact.name.clone(),
            grain_key: rec.key.trim().to_string(),
            as_of: rec.as_of,
            dim_business_keys,
            measures,
        }));
    }

    Err(reject(
        &rec.entity,
        &rec.key,
        RejectReason::UnknownEntity,
        format!("'{}' is not a declared dimension or fact table", rec.entity),
    ))
}

// =============================================================================
// Warehouse state - the staged in-memory snapshot
// =============================================================================

/// One SCD Type 2 history row. `effective_to` is the inclusive last day the
/// version applies; None means currently active.
#[derive(Debug, Clone, PartialEq)]
struct DimensionRow {
    surrogate_key: i64,
    business_key: String,
    attributes: BTreeMap<String, Value>,
    effective_from: NaiveDate,
    effective_to: Option<NaiveDate>,
    is_current: bool,
}

impl DimensionRow {
    fn covers(&self, as_of: NaiveDate) -> bool {
        self.effective_from <= as_of && self.effective_to.map_or(true, |to| as_of <= to)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FactRow {
    grain_key: String,
    /// dimension name -> surrogate key, resolved as of the fact's date
    dimension_keys: BTreeMap<String, i64>,
    measures: BTreeMap<String, f64>,
    batch_id: String,
}

/// Surrogate Key Registry: the single source of truth for key uniqueness.
/// Keys are allocated per dimension and never reused; the mapping becomes
/// durable together with the batch it was allocated in.
#[derive(Debug, Clone, Default, PartialEq)]
struct KeyRegistry {
    next: BTreeMap<String, i64>,
    keys: BTreeMap<String, BTreeMap<String, i64>>,
}

impl KeyRegistry {
    fn assign_or_get(&mut self, dimension: &str, business_key: &str) -> i64 {
        if let Some(existing) = self.keys.get(dimension).and_then(|m| m.get(business_key)) {
            return *existing;
        }
        let next = self.next.entry(dimension.to_string()).or_insert(1);
        let key = *next;
        *next += 1;
        self.keys
            .entry(dimension.to_string())
            .or_default()
            .insert(business_key.to_string(), key);
        key
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CommittedBatch {
    input_hash: String,
    watermark: DateTime<Utc>,
    committed_at: DateTime<Utc>,
}

/// Full warehouse snapshot. A run loads this, stages every change on a
/// clone, and installs the clone only when the batch commits - an aborted
/// batch leaves the original untouched.
#[derive(Debug, Clone, Default, PartialEq)]
struct Warehouse {
    dimensions: BTreeMap<String, Vec<DimensionRow>>,
    facts: BTreeMap<String, Vec<FactRow>>,
    registry: KeyRegistry,
    batches: BTreeMap<String, CommittedBatch>,
    watermark: Option<DateTime<Utc>>,
}

// =============================================================================
// SCD Reconciler
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum ScdAction {
    FirstInsert,
    NoChange,
    CorrectedInPlace(Vec<String>),
    NewVersion,
}

/// Reconcile one incoming dimension record against the current active row.
///
/// First sight of a business key inserts the initial version. Changes to
/// type-1 attributes are corrected in place; any type-2 change closes the
/// current row at `as_of - 1 day` and inserts a new version carrying the
/// same surrogate key and the merged attribute set. A record dated before
/// the current row's effective_from is late-arriving data and is rejected -
/// history is never rewritten here.
fn reconcile_dimension(
    table: &mut Vec<DimensionRow>,
    registry: &mut KeyRegistry,
    dim: &DimensionSchema,
    rec: &NormalizedDimension,
) -> Result<ScdAction, Reject> {
    let current_idx = table
        .iter()
        .position(|r| r.business_key == rec.business_key && r.is_current);

    let Some(idx) = current_idx else {
        let surrogate_key = registry.assign_or_get(&dim.name, &rec.business_key);
        table.push(DimensionRow {
            surrogate_key,
            business_key: rec.business_key.clone(),
            attributes: rec.attributes.clone(),
            effective_from: rec.as_of,
            effective_to: None,
            is_current: true,
        });
        return Ok(ScdAction::FirstInsert);
    };

    if rec.as_of < table[idx].effective_from {
        return Err(reject(
            &dim.name,
            &rec.business_key,
            RejectReason::StaleAsOfDate,
            format!(
                "as-of {} predates current version effective from {}; late data needs a backfill",
                rec.as_of, table[idx].effective_from
            ),
        ));
    }

    let mut changed: Vec<String> = Vec::new();
    let mut type2_changed = false;
    for (name, value) in &rec.attributes {
        if table[idx].attributes.get(name) != Some(value) {
            if dim.type2.contains(name) {
                type2_changed = true;
            }
            changed.push(name.clone());
        }
    }

    if changed.is_empty() {
        return Ok(ScdAction::NoChange);
    }

    // A type-2 change dated the same day the current version became
    // effective corrects that version rather than opening a zero-day one.
    if !type2_changed || rec.as_of == table[idx].effective_from {
        for name in &changed {
            table[idx]
                .attributes
                .insert(name.clone(), rec.attributes[name].clone());
        }
        return Ok(ScdAction::CorrectedInPlace(changed));
    }

    let closed_at = match rec.as_of.pred_opt() {
        Some(d) => d,
        // unreachable: as_of > effective_from in this branch
        None => rec.as_of,
    };
    let mut merged = table[idx].attributes.clone();
    for (name, value) in &rec.attributes {
        merged.insert(name.clone(), value.clone());
    }
    let surrogate_key = table[idx].surrogate_key;

    table[idx].effective_to = Some(closed_at);
    table[idx].is_current = false;
    table.push(DimensionRow {
        surrogate_key,
        business_key: rec.business_key.clone(),
        attributes: merged,
        effective_from: rec.as_of,
        effective_to: None,
        is_current: true,
    });

    Ok(ScdAction::NewVersion)
}

// =============================================================================
// Fact Resolver
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum FactAction {
    Inserted,
    Updated,
    NoChange,
}

/// Resolve one fact record: every referenced dimension must have a version
/// active at the fact's as-of date, otherwise the fact is rejected and no
/// row is written. Facts are not version-tracked: an existing grain row is
/// updated in place when its measures change.
///
/// The outer `Result` is fatal (a record that bypassed normalization); the
/// inner one is a per-record reject that the batch survives.
fn resolve_fact(
    dimensions: &BTreeMap<String, Vec<DimensionRow>>,
    table: &mut Vec<FactRow>,
    schema: &FactSchema,
    rec: &NormalizedFact,
    batch_id: &str,
) -> Result<Result<FactAction, Reject>> {
    let mut resolved: BTreeMap<String, i64> = BTreeMap::new();
    for dref in &schema.dimensions {
        let Some(business_key) = rec.dim_business_keys.get(&dref.dimension) else {
            // the normalizer fills every declared reference; a hole here
            // would write a fact row with a missing foreign key
            bail!(
                "fact {} '{}' has no {} reference after normalization",
                rec.fact_table,
                rec.grain_key,
                dref.dimension
            );
        };
        let version = dimensions
            .get(&dref.dimension)
            .and_then(|rows| {
                rows.iter()
                    .find(|r| r.business_key == *business_key && r.covers(rec.as_of))
            });
        match version {
            Some(row) => {
                resolved.insert(dref.dimension.clone(), row.surrogate_key);
            }
            None => {
                return Ok(Err(reject(
                    &rec.fact_table,
                    &rec.grain_key,
                    RejectReason::DimensionNotFound,
                    format!(
                        "no version of {} '{}' active on {}",
                        dref.dimension, business_key, rec.as_of
                    ),
                )));
            }
        }
    }

    match table.iter_mut().find(|r| r.grain_key == rec.grain_key) {
        None => {
            table.push(FactRow {
                grain_key: rec.grain_key.clone(),
                dimension_keys: resolved,
                measures: rec.measures.clone(),
                batch_id: batch_id.to_string(),
            });
            Ok(Ok(FactAction::Inserted))
        }
        Some(existing) => {
            if existing.measures == rec.measures && existing.dimension_keys == resolved {
                Ok(Ok(FactAction::NoChange))
            } else {
                existing.measures = rec.measures.clone();
                existing.dimension_keys = resolved;
                existing.batch_id = batch_id.to_string();
                Ok(Ok(FactAction::Updated))
            }
        }
    }
}

// =============================================================================
// Load report
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum BatchStatus {
    Committed,
    Failed,
}

impl BatchStatus {
    fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Committed => "committed",
            BatchStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
struct EntityCounts {
    inserted: u32,
    updated: u32,
    unchanged: u32,
    rejected: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct LoadReport {
    batch_id: String,
    status: BatchStatus,
    committed_at: Option<DateTime<Utc>>,
    watermark: Option<DateTime<Utc>>,
    counts: BTreeMap<String, EntityCounts>,
    rejects: Vec<Reject>,
}

impl LoadReport {
    fn failed(batch_id: &str) -> Self {
        LoadReport {
            batch_id: batch_id.to_string(),
            status: BatchStatus::Failed,
            committed_at: None,
            watermark: None,
            counts: BTreeMap::new(),
            rejects: Vec::new(),
        }
    }

    fn total_rejects(&self) -> u32 {
        self.counts.values().map(|c| c.rejected).sum()
    }
}

fn print_report(report: &LoadReport) {
    println!("\n=== Load Report ===");
    println!("Batch:  {}", report.batch_id);
    println!("Status: {}", report.status.as_str());
    if let Some(wm) = report.watermark {
        println!("Watermark: {}", wm.to_rfc3339());
    }
    for (entity, counts) in &report.counts {
        println!(
            "  {:<20} inserted={} updated={} unchanged={} rejected={}",
            entity, counts.inserted, counts.updated, counts.unchanged, counts.rejected
        );
    }
    if !report.rejects.is_empty() {
        println!("Rejects ({}):", report.rejects.len());
        for rej in report.rejects.iter().take(10) {
            println!(
                "  [{}] {} '{}': {}",
                rej.reason.as_str(),
                rej.entity,
                rej.key,
                rej.detail
            );
        }
        if report.rejects.len() > 10 {
            println!("  ... and {} more", report.rejects.len() - 10);
        }
    }
}

// =============================================================================
// Load Coordinator
// =============================================================================

/// Per-entity tallies accumulated over a run. A reject always bumps the
/// rejected count of the entity it belongs to.
#[derive(Debug, Default)]
struct BatchTally {
    counts: BTreeMap<String, EntityCounts>,
    rejects: Vec<Reject>,
}

impl BatchTally {
    fn entry(&mut self, entity: &str) -> &mut EntityCounts {
        self.counts.entry(entity.to_string()).or_default()
    }

    fn reject(&mut self, rej: Reject) {
        self.entry(&rej.entity).rejected += 1;
        self.rejects.push(rej);
    }
}

/// Proof that the dimension stage ran to completion. The fact stage demands
/// it, so a fact can never resolve against half-loaded dimensions - the
/// ordering invariant holds by construction instead of by convention.
struct DimensionStageComplete;

fn dimension_stage(
    dimensions: &mut BTreeMap<String, Vec<DimensionRow>>,
    registry: &mut KeyRegistry,
    schema: &WarehouseSchema,
    mut dim_groups: BTreeMap<String, Vec<NormalizedDimension>>,
    tally: &mut BatchTally,
) -> DimensionStageComplete {
    for dim in &schema.dimensions {
        let group = dim_groups.remove(&dim.name).unwrap_or_default();
        let table = dimensions.entry(dim.name.clone()).or_default();
        let _ = tally.entry(&dim.name);
        for rec in &group {
            match reconcile_dimension(table, registry, dim, rec) {
                Ok(ScdAction::FirstInsert) | Ok(ScdAction::NewVersion) => {
                    tally.entry(&dim.name).inserted += 1;
                }
                Ok(ScdAction::CorrectedInPlace(_)) => tally.entry(&dim.name).updated += 1,
                Ok(ScdAction::NoChange) => tally.entry(&dim.name).unchanged += 1,
                Err(rej) => tally.reject(rej),
            }
        }
    }
    DimensionStageComplete
}

fn fact_stage(
    _dimensions_loaded: DimensionStageComplete,
    dimensions: &BTreeMap<String, Vec<DimensionRow>>,
    facts: &mut BTreeMap<String, Vec<FactRow>>,
    schema: &WarehouseSchema,
    fact_recs: &[NormalizedFact],
    batch_id: &str,
    tally: &mut BatchTally,
) -> Result<()> {
    for fact_schema in &schema.facts {
        let table = facts.entry(fact_schema.name.clone()).or_default();
        let _ = tally.entry(&fact_schema.name);
        for rec in fact_recs.iter().filter(|r| r.fact_table == fact_schema.name) {
            match resolve_fact(dimensions, table, fact_schema, rec, batch_id)? {
                Ok(FactAction::Inserted) => tally.entry(&fact_schema.name).inserted += 1,
                Ok(FactAction::Updated) => tally.entry(&fact_schema.name).updated += 1,
                Ok(FactAction::NoChange) => tally.entry(&fact_schema.name).unchanged += 1,
                Err(rej) => tally.reject(rej),
            }
        }
    }
    Ok(())
}

/// Fingerprint the batch input so a re-run of a committed batch can be
/// recognized (and a re-run with *different* input refused).
fn fingerprint_records(records: &[CleanedRecord]) -> Result<String> {
    let mut hasher = Sha256::new();
    for rec in records {
        let line = serde_json::to_string(rec).context("serialize record for fingerprint")?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Run one batch: normalize, load dimensions in declared order, then resolve
/// facts, then commit. All changes are staged on a clone of the warehouse
/// and become visible only at commit, so any error aborts with no side
/// effects. Re-running a committed batch with identical input is a no-op.
fn run_batch(
    warehouse: &mut Warehouse,
    schema: &WarehouseSchema,
    batch_id: &str,
    records: &[CleanedRecord],
    watermark: DateTime<Utc>,
) -> Result<LoadReport> {
    let input_hash = fingerprint_records(records)?;

    if let Some(prev) = warehouse.batches.get(batch_id) {
        ensure!(
            prev.input_hash == input_hash,
            "batch '{}' was already committed with different input (hash {} != {})",
            batch_id,
            prev.input_hash,
            input_hash
        );
        return Ok(LoadReport {
            batch_id: batch_id.to_string(),
            status: BatchStatus::Committed,
            committed_at: Some(prev.committed_at),
            watermark: warehouse.watermark,
            counts: BTreeMap::new(),
            rejects: Vec::new(),
        });
    }

    let mut staged = warehouse.clone();
    let mut tally = BatchTally::default();

    // Stage 1: normalize, partitioning into dimension groups and facts.
    let mut dim_groups: BTreeMap<String, Vec<NormalizedDimension>> = BTreeMap::new();
    let mut fact_recs: Vec<NormalizedFact> = Vec::new();
    for rec in records {
        match normalize_record(rec, schema) {
            Ok(Normalized::Dimension(d)) => dim_groups.entry(d.dimension.clone()).or_default().push(d),
            Ok(Normalized::Fact(f)) => fact_recs.push(f),
            Err(rej) => tally.reject(rej),
        }
    }

    // Stages 2 and 3: dimensions in declared order, then facts. The fact
    // stage requires the dimension stage's completion proof.
    {
        let Warehouse {
            dimensions,
            facts,
            registry,
            ..
        } = &mut staged;
        let dimensions_loaded = dimension_stage(dimensions, registry, schema, dim_groups, &mut tally);
        fact_stage(dimensions_loaded, dimensions, facts, schema, &fact_recs, batch_id, &mut tally)?;
    }

    // Stage 4: commit. The staged snapshot replaces the live one atomically;
    // the watermark only ever moves forward.
    let committed_at = Utc::now();
    staged.batches.insert(
        batch_id.to_string(),
        CommittedBatch {
            input_hash,
            watermark,
            committed_at,
        },
    );
    staged.watermark = Some(staged.watermark.map_or(watermark, |w| w.max(watermark)));
    *warehouse = staged;

    Ok(LoadReport {
        batch_id: batch_id.to_string(),
        status: BatchStatus::Committed,
        committed_at: Some(committed_at),
        watermark: warehouse.watermark,
        counts: tally.counts,
        rejects: tally.rejects,
    })
}

// =============================================================================
// Database store - snapshot in, staged deltas out, one transaction
// =============================================================================

async fn create_job_run(pool: &PgPool, batch_id: &str) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, batch_id, status, detail)
        VALUES ($1, 'loader', $2, 'running', '{}')
        "#,
    )
    .bind(job_run_id)
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(job_run_id)
}

async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    error: Option<&str>,
    detail: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = now(), status = $2, error = $3, detail = $4
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(error)
    .bind(detail)
    .execute(pool)
    .await?;
    Ok(())
}

fn attributes_json(row: &DimensionRow) -> serde_json::Value {
    serde_json::Value::Object(
        row.attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

fn typed_attributes(dim: &DimensionSchema, raw: &serde_json::Value) -> Result<BTreeMap<String, Value>> {
    let obj = raw
        .as_object()
        .context("stored attributes column is not a JSON object")?;
    let mut attributes = BTreeMap::new();
    for spec in &dim.fields {
        if let Some(v) = obj.get(&spec.name) {
            if v.is_null() {
                continue;
            }
            let value = Value::from_json(spec.ftype, v).with_context(|| {
                format!(
                    "stored attribute '{}' of {} does not match declared type {}",
                    spec.name,
                    dim.name,
                    spec.ftype.name()
                )
            })?;
            attributes.insert(spec.name.clone(), value);
        }
    }
    Ok(attributes)
}

/// Load the full warehouse snapshot: key registry, dimension history, fact
/// rows and the committed-batch ledger.
async fn load_warehouse(pool: &PgPool, schema: &WarehouseSchema) -> Result<Warehouse> {
    let mut warehouse = Warehouse::default();

    let keys: Vec<(String, String, i64)> =
        sqlx::query_as("SELECT dimension, business_key, surrogate_key FROM dim_keys")
            .fetch_all(pool)
            .await
            .context("load surrogate key registry")?;
    for (dimension, business_key, surrogate_key) in keys {
        let next = warehouse.registry.next.entry(dimension.clone()).or_insert(1);
        *next = (*next).max(surrogate_key + 1);
        warehouse
            .registry
            .keys
            .entry(dimension)
            .or_default()
            .insert(business_key, surrogate_key);
    }

    let rows: Vec<(String, i64, String, serde_json::Value, NaiveDate, Option<NaiveDate>, bool)> =
        sqlx::query_as(
            r#"
            SELECT dimension, surrogate_key, business_key, attributes,
                   effective_from, effective_to, is_current
            FROM dim_rows
            ORDER BY dimension, surrogate_key, effective_from
            "#,
        )
        .fetch_all(pool)
        .await
        .context("load dimension rows")?;
    for (dimension, surrogate_key, business_key, attributes, effective_from, effective_to, is_current) in rows {
        let dim = schema.dimension(&dimension).with_context(|| {
            format!("warehouse contains dimension '{}' not in the declared schema", dimension)
        })?;
        let attributes = typed_attributes(dim, &attributes)?;
        warehouse
            .dimensions
            .entry(dimension)
            .or_default()
            .push(DimensionRow {
                surrogate_key,
                business_key,
                attributes,
                effective_from,
                effective_to,
                is_current,
            });
    }

    let facts: Vec<(String, String, serde_json::Value, serde_json::Value, String)> =
        sqlx::query_as(
            "SELECT fact_table, grain_key, dimension_keys, measures, batch_id FROM fact_rows",
        )
        .fetch_all(pool)
        .await
        .context("load fact rows")?;
    for (fact_table, grain_key, dimension_keys, measures, batch_id) in facts {
        let dimension_keys: BTreeMap<String, i64> =
            serde_json::from_value(dimension_keys).context("decode fact dimension keys")?;
        let measures: BTreeMap<String, f64> =
            serde_json::from_value(measures).context("decode fact measures")?;
        warehouse.facts.entry(fact_table).or_default().push(FactRow {
            grain_key,
            dimension_keys,
            measures,
            batch_id,
        });
    }

    let batches: Vec<(String, String, DateTime<Utc>, Option<DateTime<Utc>>)> = sqlx::query_as(
        "SELECT batch_id, input_hash, watermark, committed_at FROM load_batches WHERE status = 'committed'",
    )
    .fetch_all(pool)
    .await
    .context("load committed batch ledger")?;
    for (batch_id, input_hash, watermark, committed_at) in batches {
        warehouse.watermark = Some(warehouse.watermark.map_or(watermark, |w| w.max(watermark)));
        warehouse.batches.insert(
            batch_id,
            CommittedBatch {
                input_hash,
                watermark,
                committed_at: committed_at.unwrap_or(watermark),
            },
        );
    }

    Ok(warehouse)
}

/// Persist the committed snapshot in a single transaction: key mappings,
/// dimension history upserts, fact upserts and the batch ledger row. If
/// anything fails here the transaction rolls back and the batch is failed.
async fn persist_run(pool: &PgPool, warehouse: &Warehouse, report: &LoadReport) -> Result<()> {
    let batch = warehouse
        .batches
        .get(&report.batch_id)
        .context("committed batch missing from the ledger")?;

    let mut tx = pool.begin().await.context("begin commit transaction")?;

    for (dimension, keys) in &warehouse.registry.keys {
        for (business_key, surrogate_key) in keys {
            sqlx::query(
                r#"
                INSERT INTO dim_keys (dimension, business_key, surrogate_key)
                VALUES ($1, $2, $3)
                ON CONFLICT (dimension, business_key) DO NOTHING
                "#,
            )
            .bind(dimension)
            .bind(business_key)
            .bind(surrogate_key)
            .execute(&mut *tx)
            .await
            .context("persist surrogate key mapping")?;
        }
    }

    for (dimension, rows) in &warehouse.dimensions {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO dim_rows
                (dimension, surrogate_key, business_key, attributes, effective_from, effective_to, is_current)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (dimension, surrogate_key, effective_from)
                DO UPDATE SET attributes = EXCLUDED.attributes,
                              effective_to = EXCLUDED.effective_to,
                              is_current = EXCLUDED.is_current
                "#,
            )
            .bind(dimension)
            .bind(row.surrogate_key)
            .bind(&row.business_key)
            .bind(attributes_json(row))
            .bind(row.effective_from)
            .bind(row.effective_to)
            .bind(row.is_current)
            .execute(&mut *tx)
            .await
            .context("persist dimension row")?;
        }
    }

    for (fact_table, rows) in &warehouse.facts {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO fact_rows (fact_table, grain_key, dimension_keys, measures, batch_id)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (fact_table, grain_key)
                DO UPDATE SET dimension_keys = EXCLUDED.dimension_keys,
                              measures = EXCLUDED.measures,
                              batch_id = EXCLUDED.batch_id
                "#,
            )
            .bind(fact_table)
            .bind(&row.grain_key)
            .bind(serde_json::to_value(&row.dimension_keys).context("encode dimension keys")?)
            .bind(serde_json::to_value(&row.measures).context("encode measures")?)
            .bind(&row.batch_id)
            .execute(&mut *tx)
            .await
            .context("persist fact row")?;
        }
    }

    let sql = format!(
        "INSERT INTO load_batches (batch_id, input_hash, watermark, status, committed_at, report) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (batch_id) {}",
        ledger_conflict_clause(BatchStatus::Committed)
    );
    sqlx::query(&sql)
        .bind(&report.batch_id)
        .bind(&batch.input_hash)
        .bind(batch.watermark)
        .bind(BatchStatus::Committed.as_str())
        .bind(batch.committed_at)
        .bind(serde_json::to_value(report).context("encode load report")?)
        .execute(&mut *tx)
        .await
        .context("persist batch ledger row")?;

    tx.commit().await.context("commit batch transaction")?;
    Ok(())
}

/// Conflict policy for the batch ledger. A successful commit overwrites any
/// leftover row for the same batch id, so retrying a previously failed batch
/// flips its 'failed' row to 'committed'. A failure marker only lands when
/// no row exists yet: it can never demote a committed batch (the engine has
/// already refused re-runs of committed batches before this point).
fn ledger_conflict_clause(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Committed => {
            "DO UPDATE SET input_hash = EXCLUDED.input_hash, \
             watermark = EXCLUDED.watermark, \
             status = EXCLUDED.status, \
             committed_at = EXCLUDED.committed_at, \
             report = EXCLUDED.report"
        }
        BatchStatus::Failed => "DO NOTHING",
    }
}

/// Record a failed batch. Best effort: the warehouse itself was never
/// touched, and the watermark does not advance.
async fn record_failed_batch(pool: &PgPool, batch_id: &str, watermark: DateTime<Utc>, error: &str) -> Result<()> {
    let sql = format!(
        "INSERT INTO load_batches (batch_id, input_hash, watermark, status, committed_at, report) \
         VALUES ($1, '', $2, $3, NULL, $4) \
         ON CONFLICT (batch_id) {}",
        ledger_conflict_clause(BatchStatus::Failed)
    );
    sqlx::query(&sql)
        .bind(batch_id)
        .bind(watermark)
        .bind(BatchStatus::Failed.as_str())
        .bind(serde_json::json!({ "error": error }))
        .execute(pool)
        .await?;
    Ok(())
}

// =============================================================================
// Entry point
// =============================================================================

fn parse_input(content: &str) -> Result<Vec<CleanedRecord>> {
    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: CleanedRecord = serde_json::from_str(line)
            .with_context(|| format!("line {}: malformed cleaned record", idx + 1))?;
        records.push(rec);
    }
    Ok(records)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;
    let schema = movie_catalog_schema();

    let watermark: DateTime<Utc> = DateTime::parse_from_rfc3339(&args.watermark)
        .context("Invalid --watermark, expected RFC 3339")?
        .with_timezone(&Utc);

    println!("=== Movie Warehouse Loader ===");
    println!("Batch ID: {}", args.batch_id);
    println!("Watermark: {}", watermark.to_rfc3339());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let content = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("Failed to read input file {}", args.input))?;
    let records = parse_input(&content)?;
    println!("Input records: {}", records.len());

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.db_url)
        .await
        .context("Failed to connect to database")?;

    // Single writer: concurrent loader runs serialize here, so the snapshot
    // loaded below is always the latest committed state.
    let mut lock_conn = pool.acquire().await.context("acquire lock connection")?;
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(WAREHOUSE_LOCK_KEY)
        .execute(&mut *lock_conn)
        .await
        .context("acquire warehouse writer lock")?;

    let job_run_id = if !args.dry_run {
        Some(create_job_run(&pool, &args.batch_id).await?)
    } else {
        None
    };

    let result = async {
        let mut warehouse = load_warehouse(&pool, &schema).await?;
        let report = run_batch(&mut warehouse, &schema, &args.batch_id, &records, watermark)?;

        if args.dry_run {
            println!("\nDry run - nothing persisted");
        } else {
            persist_run(&pool, &warehouse, &report).await?;
        }
        Ok::<LoadReport, anyhow::Error>(report)
    }
    .await;

    match &result {
        Ok(report) => {
            if let Some(job_id) = job_run_id {
                let detail = serde_json::json!({
                    "rejects": report.total_rejects(),
                    "counts": report.counts,
                });
                // best effort: the batch is already committed, a broken
                // audit row must not turn the run into a failure
                if let Err(e) = finish_job_run(&pool, job_id, "ok", None, detail).await {
                    eprintln!("Warning: could not finish job run record: {:#}", e);
                }
            }
        }
        Err(e) => {
            if !args.dry_run {
                record_failed_batch(&pool, &args.batch_id, watermark, &e.to_string())
                    .await
                    .ok();
            }
            if let Some(job_id) = job_run_id {
                finish_job_run(&pool, job_id, "failed", Some(&e.to_string()), serde_json::json!({}))
                    .await
                    .ok();
            }
        }
    }

    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(WAREHOUSE_LOCK_KEY)
        .execute(&mut *lock_conn)
        .await
        .ok();

    match result {
        Ok(report) => {
            print_report(&report);
            println!("\n=== Load Complete ===");
            Ok(())
        }
        Err(e) => {
            print_report(&LoadReport::failed(&args.batch_id));
            eprintln!("\nBatch failed: {:#}", e);
            Err(e)
        }
    }
}

// =============================================================================
// TESTS - the engine is pure, so every property tests without a database
// =============================================================================
