//! Persistence Store
//!
//! SQLite storage for agents, tools, execution history, learning checkpoints,
//! project assignments, scope versions and the routing log.
//!
//! Records, checkpoints and scope versions are append-only; agents and tools
//! are upserted by name. Embeddings are little-endian f32 BLOBs, structured
//! fields (patterns, requirements, model config) are JSON text, timestamps
//! are unix milliseconds.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::embeddings::{embedding_from_bytes, embedding_to_bytes};
use crate::error::{Result, RouterError};
use crate::router::Route;
use crate::types::{
    AgentProfile, ChangeMagnitude, ExecutionOutcome, ExecutionRecord, LearningCheckpoint,
    NewAgent, NewTool, PerformanceSnapshot, ProjectAgent, ProjectTool, RouteMetrics,
    ScopeVersion, ToolProfile,
};

/// An execution about to be appended
#[derive(Debug, Clone)]
pub struct NewExecution<'a> {
    pub agent_id: i64,
    pub project_id: &'a str,
    pub task: &'a str,
    pub route: Option<Route>,
    pub outcome: ExecutionOutcome,
    pub cost_usd: f64,
    pub at: DateTime<Utc>,
}

/// A scope version about to be appended; the version number is assigned by the store
#[derive(Debug, Clone)]
pub struct NewScopeVersion {
    pub description: String,
    pub requirements: Vec<String>,
    pub embedding: Vec<f32>,
    pub magnitude: ChangeMagnitude,
    pub similarity: Option<f64>,
    pub tool_review_required: bool,
    pub created_at: DateTime<Utc>,
}

/// One routing decision
#[derive(Debug, Clone)]
pub struct RouteLogEntry {
    pub task_hash: String,
    pub route: Route,
    pub agent_id: Option<i64>,
    pub processing_ms: u64,
    pub cached: bool,
    pub at: DateTime<Utc>,
}

const AGENT_COLUMNS: &str = "id, name, agent_type, purpose, system_prompt, tools_enabled, model_config, \
     embedding, routing_priority, total_tasks, success_rate, avg_execution_ms, last_used, \
     learned_patterns, created_at";

const TOOL_COLUMNS: &str =
    "id, name, tool_type, description, embedding, reliability, total_uses, success_rate, install_command";

const CHECKPOINT_COLUMNS: &str = "id, agent_id, version, success_rate, avg_execution_ms, total_tasks, \
     patterns, new_patterns, improvement_delta, tasks_since_last, created_at";

const SCOPE_COLUMNS: &str = "id, project_id, version, description, requirements, embedding, magnitude, \
     similarity, tool_review_required, tool_review_completed, created_at";

/// SQLite-backed store
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RouterError::validation(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;
        info!("Store opened: {}", path.display());
        Ok(store)
    }

    /// Throwaway database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                agent_type TEXT NOT NULL,
                purpose TEXT NOT NULL,
                system_prompt TEXT NOT NULL DEFAULT '',
                tools_enabled TEXT NOT NULL DEFAULT '[]',
                model_config TEXT NOT NULL DEFAULT 'null',
                embedding BLOB NOT NULL,
                routing_priority REAL NOT NULL DEFAULT 0.5,
                total_tasks INTEGER NOT NULL DEFAULT 0,
                success_rate REAL NOT NULL DEFAULT 0.0,
                avg_execution_ms REAL NOT NULL DEFAULT 0.0,
                last_used INTEGER,
                learned_patterns TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_agents_type ON agents(agent_type);

            CREATE TABLE IF NOT EXISTS execution_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id INTEGER NOT NULL REFERENCES agents(id),
                project_id TEXT NOT NULL,
                task TEXT NOT NULL,
                route TEXT,
                success INTEGER NOT NULL,
                execution_ms INTEGER NOT NULL,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                feedback_score INTEGER,
                cost_usd REAL NOT NULL DEFAULT 0.0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_agent ON execution_history(agent_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_history_project ON execution_history(project_id);

            CREATE TABLE IF NOT EXISTS learning_checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id INTEGER NOT NULL REFERENCES agents(id),
                version INTEGER NOT NULL,
                success_rate REAL NOT NULL,
                avg_execution_ms REAL NOT NULL,
                total_tasks INTEGER NOT NULL,
                patterns TEXT NOT NULL,
                new_patterns TEXT NOT NULL,
                improvement_delta REAL NOT NULL,
                tasks_since_last INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(agent_id, version)
            );

            CREATE TABLE IF NOT EXISTS tools (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                tool_type TEXT NOT NULL,
                description TEXT NOT NULL,
                embedding BLOB NOT NULL,
                reliability REAL NOT NULL,
                total_uses INTEGER NOT NULL DEFAULT 0,
                success_rate REAL NOT NULL DEFAULT 0.0,
                install_command TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS project_tools (
                project_id TEXT NOT NULL,
                tool_id INTEGER NOT NULL REFERENCES tools(id),
                reason TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, tool_id)
            );

            CREATE TABLE IF NOT EXISTS project_agents (
                project_id TEXT NOT NULL,
                agent_id INTEGER NOT NULL REFERENCES agents(id),
                task_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                assigned_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, agent_id)
            );

            CREATE TABLE IF NOT EXISTS scope_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                description TEXT NOT NULL,
                requirements TEXT NOT NULL,
                embedding BLOB NOT NULL,
                magnitude TEXT NOT NULL,
                similarity REAL,
                tool_review_required INTEGER NOT NULL,
                tool_review_completed INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(project_id, version)
            );

            CREATE TABLE IF NOT EXISTS routing_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_hash TEXT NOT NULL,
                route TEXT NOT NULL,
                agent_id INTEGER,
                processing_ms INTEGER NOT NULL,
                cached INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_routing_logs_time ON routing_logs(created_at);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Insert or update an agent by name; rolling statistics survive an update
    pub fn upsert_agent(
        &self,
        agent: &NewAgent,
        embedding: &[f32],
        at: DateTime<Utc>,
    ) -> Result<AgentProfile> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (name, agent_type, purpose, system_prompt, tools_enabled, model_config,
                                 embedding, routing_priority, success_rate, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(name) DO UPDATE SET
                agent_type = excluded.agent_type,
                purpose = excluded.purpose,
                system_prompt = excluded.system_prompt,
                tools_enabled = excluded.tools_enabled,
                model_config = excluded.model_config,
                embedding = excluded.embedding,
                routing_priority = excluded.routing_priority",
            params![
                agent.name,
                agent.agent_type,
                agent.purpose,
                agent.system_prompt,
                serde_json::to_string(&agent.tools_enabled)?,
                serde_json::to_string(&agent.model_config)?,
                embedding_to_bytes(embedding),
                agent.routing_priority,
                agent.initial_success_rate.unwrap_or(0.0),
                millis(at),
            ],
        )?;

        let sql = format!("SELECT {} FROM agents WHERE name = ?1", AGENT_COLUMNS);
        let profile = conn.query_row(&sql, params![agent.name], row_to_agent)?;
        debug!("Upserted agent {} ({})", profile.name, profile.id);
        Ok(profile)
    }

    pub fn load_agents(&self) -> Result<Vec<AgentProfile>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM agents ORDER BY id", AGENT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let agents = stmt
            .query_map([], row_to_agent)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }

    pub fn get_agent(&self, id: i64) -> Result<Option<AgentProfile>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_agent).optional()?)
    }

    /// Append an execution and commit the agent's updated statistics, its
    /// project assignment counters and an optional checkpoint in one transaction
    ///
    /// Returns the record id and the checkpoint id, if one was written.
    pub fn commit_execution(
        &self,
        execution: &NewExecution<'_>,
        updated: &AgentProfile,
        checkpoint: Option<&LearningCheckpoint>,
    ) -> Result<(i64, Option<i64>)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let outcome = &execution.outcome;
        let at = millis(execution.at);

        tx.execute(
            "INSERT INTO execution_history
                (agent_id, project_id, task, route, success, execution_ms, tokens_used,
                 feedback_score, cost_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                execution.agent_id,
                execution.project_id,
                execution.task,
                execution.route.map(|r| r.as_str()),
                outcome.success as i64,
                outcome.execution_ms as i64,
                outcome.tokens_used as i64,
                outcome.feedback_score.map(i64::from),
                execution.cost_usd,
                at,
            ],
        )?;
        let record_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE agents SET total_tasks = ?1, success_rate = ?2, avg_execution_ms = ?3,
                               last_used = ?4, learned_patterns = ?5
             WHERE id = ?6",
            params![
                updated.total_tasks as i64,
                updated.success_rate,
                updated.avg_execution_ms,
                updated.last_used.map(millis),
                serde_json::to_string(&updated.learned_patterns)?,
                updated.id,
            ],
        )?;

        tx.execute(
            "INSERT INTO project_agents (project_id, agent_id, task_count, success_count, assigned_at)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT(project_id, agent_id) DO UPDATE SET
                task_count = task_count + 1,
                success_count = success_count + excluded.success_count",
            params![
                execution.project_id,
                execution.agent_id,
                outcome.success as i64,
                at,
            ],
        )?;

        let checkpoint_id = match checkpoint {
            Some(cp) => {
                tx.execute(
                    "INSERT INTO learning_checkpoints
                        (agent_id, version, success_rate, avg_execution_ms, total_tasks, patterns,
                         new_patterns, improvement_delta, tasks_since_last, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        cp.agent_id,
                        cp.version as i64,
                        cp.performance.success_rate,
                        cp.performance.avg_execution_ms,
                        cp.performance.total_tasks as i64,
                        serde_json::to_string(&cp.patterns)?,
                        serde_json::to_string(&cp.new_patterns)?,
                        cp.improvement_delta,
                        cp.tasks_since_last as i64,
                        millis(cp.created_at),
                    ],
                )?;
                Some(tx.last_insert_rowid())
            }
            None => None,
        };

        tx.commit()?;
        Ok((record_id, checkpoint_id))
    }

    /// Most recent executions for an agent
    pub fn recent_executions(&self, agent_id: i64, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, project_id, task, route, success, execution_ms, tokens_used,
                    feedback_score, cost_usd, created_at
             FROM execution_history
             WHERE agent_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![agent_id, limit as i64], |row| {
                let route: Option<String> = row.get(4)?;
                Ok(ExecutionRecord {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    project_id: row.get(2)?,
                    task: row.get(3)?,
                    route: route.and_then(|r| r.parse().ok()),
                    outcome: ExecutionOutcome {
                        success: row.get::<_, i64>(5)? != 0,
                        execution_ms: row.get::<_, i64>(6)? as u64,
                        tokens_used: row.get::<_, i64>(7)? as u64,
                        feedback_score: row.get::<_, Option<i64>>(8)?.map(|s| s as u8),
                    },
                    cost_usd: row.get(9)?,
                    created_at: from_millis(row.get(10)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Total recorded cost per agent
    pub fn agent_costs(&self) -> Result<HashMap<i64, f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT agent_id, COALESCE(SUM(cost_usd), 0.0) FROM execution_history GROUP BY agent_id",
        )?;
        let costs = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(costs)
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub fn checkpoints(&self, agent_id: i64) -> Result<Vec<LearningCheckpoint>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM learning_checkpoints WHERE agent_id = ?1 ORDER BY version",
            CHECKPOINT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let checkpoints = stmt
            .query_map(params![agent_id], row_to_checkpoint)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(checkpoints)
    }

    pub fn latest_checkpoint(&self, agent_id: i64) -> Result<Option<LearningCheckpoint>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM learning_checkpoints WHERE agent_id = ?1 ORDER BY version DESC LIMIT 1",
            CHECKPOINT_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![agent_id], row_to_checkpoint)
            .optional()?)
    }

    // ------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------

    /// Insert or update a tool by name; usage statistics survive an update
    pub fn upsert_tool(&self, tool: &NewTool, embedding: &[f32], at: DateTime<Utc>) -> Result<ToolProfile> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tools (name, tool_type, description, embedding, reliability, install_command, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                tool_type = excluded.tool_type,
                description = excluded.description,
                embedding = excluded.embedding,
                reliability = excluded.reliability,
                install_command = excluded.install_command",
            params![
                tool.name,
                tool.tool_type,
                tool.description,
                embedding_to_bytes(embedding),
                tool.reliability,
                tool.install_command,
                millis(at),
            ],
        )?;

        let sql = format!("SELECT {} FROM tools WHERE name = ?1", TOOL_COLUMNS);
        Ok(conn.query_row(&sql, params![tool.name], row_to_tool)?)
    }

    pub fn load_tools(&self) -> Result<Vec<ToolProfile>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM tools ORDER BY id", TOOL_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let tools = stmt
            .query_map([], row_to_tool)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tools)
    }

    pub fn tool_by_name(&self, name: &str) -> Result<Option<ToolProfile>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM tools WHERE name = ?1", TOOL_COLUMNS);
        Ok(conn.query_row(&sql, params![name], row_to_tool).optional()?)
    }

    /// Attach a tool to a project, reactivating it if it was removed
    pub fn add_project_tool(
        &self,
        project_id: &str,
        tool_id: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO project_tools (project_id, tool_id, reason, added_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(project_id, tool_id) DO UPDATE SET
                is_active = 1,
                reason = excluded.reason",
            params![project_id, tool_id, reason, millis(at)],
        )?;
        Ok(())
    }

    /// Soft-remove a tool from a project; false if it was not attached
    pub fn deactivate_project_tool(&self, project_id: &str, tool_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE project_tools SET is_active = 0 WHERE project_id = ?1 AND tool_id = ?2 AND is_active = 1",
            params![project_id, tool_id],
        )?;
        Ok(changed > 0)
    }

    /// Active tools for a project, most used first
    pub fn project_tools(&self, project_id: &str) -> Result<Vec<ProjectTool>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT t.name, t.tool_type, t.description, pt.reason, pt.usage_count, pt.success_count,
                    pt.is_active, t.install_command, pt.added_at
             FROM project_tools pt
             JOIN tools t ON t.id = pt.tool_id
             WHERE pt.project_id = ?1 AND pt.is_active = 1
             ORDER BY pt.usage_count DESC, t.name",
        )?;
        let tools = stmt
            .query_map(params![project_id], |row| {
                Ok(ProjectTool {
                    name: row.get(0)?,
                    tool_type: row.get(1)?,
                    description: row.get(2)?,
                    reason: row.get(3)?,
                    usage_count: row.get::<_, i64>(4)? as u64,
                    success_count: row.get::<_, i64>(5)? as u64,
                    is_active: row.get::<_, i64>(6)? != 0,
                    install_command: row.get(7)?,
                    added_at: from_millis(row.get(8)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tools)
    }

    /// Count one use of a tool on a project and fold it into the tool's global stats
    ///
    /// Returns false if the tool is not attached to the project.
    pub fn record_tool_usage(&self, project_id: &str, tool_id: i64, success: bool) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE project_tools SET usage_count = usage_count + 1, success_count = success_count + ?3
             WHERE project_id = ?1 AND tool_id = ?2",
            params![project_id, tool_id, success as i64],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE tools SET
                success_rate = (success_rate * total_uses + ?2) / (total_uses + 1),
                total_uses = total_uses + 1
             WHERE id = ?1",
            params![tool_id, if success { 1.0 } else { 0.0 }],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Project agents
    // ------------------------------------------------------------------

    /// Record that an agent works on a project; existing assignments keep their counters
    pub fn assign_agent(&self, project_id: &str, agent_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO project_agents (project_id, agent_id, assigned_at) VALUES (?1, ?2, ?3)",
            params![project_id, agent_id, millis(at)],
        )?;
        Ok(())
    }

    pub fn project_agents(&self, project_id: &str) -> Result<Vec<ProjectAgent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.name, a.agent_type, pa.task_count, pa.success_count, pa.assigned_at
             FROM project_agents pa
             JOIN agents a ON a.id = pa.agent_id
             WHERE pa.project_id = ?1
             ORDER BY pa.assigned_at, a.id",
        )?;
        let agents = stmt
            .query_map(params![project_id], |row| {
                let task_count = row.get::<_, i64>(3)? as u64;
                let success_count = row.get::<_, i64>(4)? as u64;
                Ok(ProjectAgent {
                    agent_id: row.get(0)?,
                    agent_name: row.get(1)?,
                    agent_type: row.get(2)?,
                    task_count,
                    success_rate: if task_count > 0 {
                        success_count as f64 / task_count as f64
                    } else {
                        0.0
                    },
                    assigned_at: from_millis(row.get(5)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }

    // ------------------------------------------------------------------
    // Scope versions
    // ------------------------------------------------------------------

    pub fn latest_scope(&self, project_id: &str) -> Result<Option<ScopeVersion>> {
        let conn = self.conn.lock();
        latest_scope_locked(&conn, project_id)
    }

    pub fn scope_history(&self, project_id: &str) -> Result<Vec<ScopeVersion>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM scope_versions WHERE project_id = ?1 ORDER BY version",
            SCOPE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let versions = stmt
            .query_map(params![project_id], row_to_scope)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(versions)
    }

    /// Append the next scope version for a project
    ///
    /// `build` sees the current latest version and produces the new one while
    /// the connection is held, so concurrent writers for one project are
    /// serialized and each compares against the version it replaces.
    pub fn append_scope_version<F>(
        &self,
        project_id: &str,
        build: F,
    ) -> Result<(Option<ScopeVersion>, ScopeVersion)>
    where
        F: FnOnce(Option<&ScopeVersion>) -> NewScopeVersion,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let previous = latest_scope_locked(&tx, project_id)?;
        let next = build(previous.as_ref());
        let version = previous.as_ref().map(|p| p.version + 1).unwrap_or(1);

        tx.execute(
            "INSERT INTO scope_versions
                (project_id, version, description, requirements, embedding, magnitude, similarity,
                 tool_review_required, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                project_id,
                version as i64,
                next.description,
                serde_json::to_string(&next.requirements)?,
                embedding_to_bytes(&next.embedding),
                next.magnitude.as_str(),
                next.similarity,
                next.tool_review_required as i64,
                millis(next.created_at),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        let stored = ScopeVersion {
            id,
            project_id: project_id.to_string(),
            version,
            description: next.description,
            requirements: next.requirements,
            embedding: next.embedding,
            magnitude: next.magnitude,
            similarity: next.similarity,
            tool_review_required: next.tool_review_required,
            tool_review_completed: false,
            created_at: next.created_at,
        };
        Ok((previous, stored))
    }

    /// Mark a scope version's tool review done; false if no such version
    pub fn complete_tool_review(&self, project_id: &str, version: u32) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE scope_versions SET tool_review_completed = 1 WHERE project_id = ?1 AND version = ?2",
            params![project_id, version as i64],
        )?;
        Ok(changed > 0)
    }

    // ------------------------------------------------------------------
    // Routing log
    // ------------------------------------------------------------------

    pub fn log_route(&self, entry: &RouteLogEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO routing_logs (task_hash, route, agent_id, processing_ms, cached, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.task_hash,
                entry.route.as_str(),
                entry.agent_id,
                entry.processing_ms as i64,
                entry.cached as i64,
                millis(entry.at),
            ],
        )?;
        Ok(())
    }

    /// Per-route counts and average latency since `since`, busiest first
    pub fn routing_metrics(&self, since: DateTime<Utc>) -> Result<Vec<RouteMetrics>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT route, COUNT(*), AVG(processing_ms), SUM(cached)
             FROM routing_logs
             WHERE created_at >= ?1
             GROUP BY route
             ORDER BY COUNT(*) DESC, route",
        )?;
        let rows = stmt
            .query_map(params![millis(since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(route, count, avg, cached)| {
                Some(RouteMetrics {
                    route: route.parse().ok()?,
                    count: count as u64,
                    avg_processing_ms: avg,
                    cache_hits: cached as u64,
                })
            })
            .collect())
    }
}

fn latest_scope_locked(conn: &Connection, project_id: &str) -> Result<Option<ScopeVersion>> {
    let sql = format!(
        "SELECT {} FROM scope_versions WHERE project_id = ?1 ORDER BY version DESC LIMIT 1",
        SCOPE_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![project_id], row_to_scope)
        .optional()?)
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<AgentProfile> {
    let embedding: Vec<u8> = row.get(7)?;
    Ok(AgentProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        agent_type: row.get(2)?,
        purpose: row.get(3)?,
        system_prompt: row.get(4)?,
        tools_enabled: json_column(row, 5)?,
        model_config: json_column(row, 6)?,
        embedding: embedding_from_bytes(&embedding),
        routing_priority: row.get(8)?,
        total_tasks: row.get::<_, i64>(9)? as u64,
        success_rate: row.get(10)?,
        avg_execution_ms: row.get(11)?,
        last_used: row.get::<_, Option<i64>>(12)?.map(from_millis),
        learned_patterns: json_column(row, 13)?,
        created_at: from_millis(row.get(14)?),
    })
}

fn row_to_tool(row: &Row<'_>) -> rusqlite::Result<ToolProfile> {
    let embedding: Vec<u8> = row.get(4)?;
    Ok(ToolProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        tool_type: row.get(2)?,
        description: row.get(3)?,
        embedding: embedding_from_bytes(&embedding),
        reliability: row.get(5)?,
        total_uses: row.get::<_, i64>(6)? as u64,
        success_rate: row.get(7)?,
        install_command: row.get(8)?,
    })
}

fn row_to_checkpoint(row: &Row<'_>) -> rusqlite::Result<LearningCheckpoint> {
    Ok(LearningCheckpoint {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        version: row.get::<_, i64>(2)? as u32,
        performance: PerformanceSnapshot {
            success_rate: row.get(3)?,
            avg_execution_ms: row.get(4)?,
            total_tasks: row.get::<_, i64>(5)? as u64,
        },
        patterns: json_column(row, 6)?,
        new_patterns: json_column(row, 7)?,
        improvement_delta: row.get(8)?,
        tasks_since_last: row.get::<_, i64>(9)? as u64,
        created_at: from_millis(row.get(10)?),
    })
}

fn row_to_scope(row: &Row<'_>) -> rusqlite::Result<ScopeVersion> {
    let embedding: Vec<u8> = row.get(5)?;
    let magnitude: String = row.get(6)?;
    Ok(ScopeVersion {
        id: row.get(0)?,
        project_id: row.get(1)?,
        version: row.get::<_, i64>(2)? as u32,
        description: row.get(3)?,
        requirements: json_column(row, 4)?,
        embedding: embedding_from_bytes(&embedding),
        magnitude: ChangeMagnitude::parse(&magnitude).unwrap_or(ChangeMagnitude::Major),
        similarity: row.get(7)?,
        tool_review_required: row.get::<_, i64>(8)? != 0,
        tool_review_completed: row.get::<_, i64>(9)? != 0,
        created_at: from_millis(row.get(10)?),
    })
}
