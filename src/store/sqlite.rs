//! SQLite implementation of the score store.
//!
//! Tables are scoped by run name:
//!
//! - `<run>_config`: one row per configuration, two columns per stage
//!   (`step<i>_name`, `step<i>_id`) plus `score` and the `failed` marker
//! - `<run>_step_<group>`: one row per distinct edge, one TEXT column per
//!   parameter
//! - `<run>_sample`: one row per sampling observation

use std::path::Path;
use std::time::Duration;

use log::{debug, info, trace, warn};
use rusqlite::{Connection, OptionalExtension, ToSql, TransactionBehavior};

use super::{
    DEFAULT_SCORE_RANGE, GroupScore, RetryPolicy, ScoreStore, ScoreSum, StoreError,
};
use crate::schema::{
    ConfigId, ConfigStatus, Configuration, EdgeId, Parameter, StageChoice, is_identifier,
};
use crate::search::relative_score_sum;

/// How long SQLite itself waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Score store backed by a SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    run: String,
    retry: RetryPolicy,
    stage_count: Option<usize>,
    /// Ids of configurations not marked as failed, loaded on first use.
    config_cache: Option<Vec<ConfigId>>,
    /// Running (min, max) of succeeded scores, loaded on first use.
    score_bounds: Option<(f64, f64)>,
}

impl SqliteStore {
    /// Open or create the database at `path` for the given run.
    pub fn open<P: AsRef<Path>>(
        path: P,
        run_name: &str,
        retry: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = retry
            .run("open database", || Connection::open(path))
            .map_err(|failure| StoreError::from_retry("open database", failure))?;
        debug!("Opened score store at {}", path.display());
        Self::with_connection(conn, run_name, retry)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(run_name: &str, retry: RetryPolicy) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, run_name, retry)
    }

    fn with_connection(
        conn: Connection,
        run_name: &str,
        retry: RetryPolicy,
    ) -> Result<Self, StoreError> {
        check_identifier(run_name)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        trace!("Journal mode: {}", mode);

        Ok(Self {
            conn,
            run: run_name.to_string(),
            retry,
            stage_count: None,
            config_cache: None,
            score_bounds: None,
        })
    }

    fn config_table(&self) -> String {
        quote(&format!("{}_config", self.run))
    }

    fn sample_table(&self) -> String {
        quote(&format!("{}_sample", self.run))
    }

    fn edge_table(&self, group: &str) -> String {
        quote(&format!("{}_step_{}", self.run, group))
    }

    fn stages(&self) -> Result<usize, StoreError> {
        self.stage_count.ok_or(StoreError::NotPrepared)
    }

    /// Run `f` inside an immediate transaction, retried as a unit.
    fn transact<T, F>(&mut self, operation: &str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        let policy = self.retry;
        let conn = &mut self.conn;
        policy
            .run(operation, || {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            })
            .map_err(|failure| StoreError::from_retry(operation, failure))
    }
}

impl ScoreStore for SqliteStore {
    fn run_name(&self) -> &str {
        &self.run
    }

    fn prepare_run(&mut self, stage_count: usize) -> Result<(), StoreError> {
        let table = self.config_table();
        let samples = self.sample_table();
        let raw_table = format!("{}_config", self.run);

        let existing = self.transact("inspect run tables", |conn| {
            let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
            let names = stmt
                .query_map([&raw_table], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names
                .iter()
                .filter(|n| n.starts_with("step") && n.ends_with("_name"))
                .count())
        })?;
        if existing > 0 && existing != stage_count {
            return Err(StoreError::StageCountMismatch {
                run: self.run.clone(),
                existing,
                requested: stage_count,
            });
        }

        let mut columns = String::new();
        for i in 0..stage_count {
            columns.push_str(&format!(
                "step{i}_name TEXT NOT NULL, step{i}_id INTEGER NOT NULL, "
            ));
        }
        let index = quote(&format!("{}_config_step0", self.run));
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                {columns}
                score REAL DEFAULT 0,
                failed INTEGER DEFAULT -1
            );
            CREATE INDEX IF NOT EXISTS {index} ON {table} (step0_name, step0_id);
            CREATE TABLE IF NOT EXISTS {samples} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                config_id INTEGER NOT NULL,
                score REAL,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
            );"
        );

        self.transact("prepare run", |conn| conn.execute_batch(&create))?;
        self.stage_count = Some(stage_count);
        debug!("Prepared run '{}' with {} stages", self.run, stage_count);
        Ok(())
    }

    fn create_edge_group(&mut self, group: &str, param_names: &[&str]) -> Result<(), StoreError> {
        check_identifier(group)?;
        let mut columns = String::from("id INTEGER PRIMARY KEY AUTOINCREMENT");
        for name in param_names {
            check_identifier(name)?;
            columns.push_str(&format!(", {} TEXT NOT NULL", quote(name)));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({columns})",
            self.edge_table(group)
        );

        self.transact("create edge group", |conn| conn.execute_batch(&sql))?;
        debug!("Table for edge group {} created", group);
        Ok(())
    }

    fn add_edge(
        &mut self,
        group: &str,
        values: &[String],
        params: &[Parameter],
    ) -> Result<EdgeId, StoreError> {
        if params.is_empty() && values.is_empty() {
            return Ok(0);
        }
        if values.len() != params.len() {
            return Err(StoreError::CountMismatch {
                what: "parameter values",
                expected: params.len(),
                actual: values.len(),
            });
        }

        let table = self.edge_table(group);
        let names: Vec<String> = params.iter().map(|p| quote(p.name())).collect();
        let filter = names
            .iter()
            .map(|n| format!("{n} = ?"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let select = format!("SELECT id FROM {table} WHERE {filter} LIMIT 1");
        let insert = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        );

        let (id, created) = self.transact("add edge", |conn| {
            let existing: Option<EdgeId> = conn
                .query_row(&select, rusqlite::params_from_iter(values), |row| row.get(0))
                .optional()?;
            if let Some(id) = existing {
                return Ok((id, false));
            }
            conn.execute(&insert, rusqlite::params_from_iter(values))?;
            Ok((conn.last_insert_rowid(), true))
        })?;

        if created {
            debug!("Added edge {} to group {}", id, group);
        } else {
            trace!("Edge already exists in group {} with id {}", group, id);
        }
        Ok(id)
    }

    fn add_configuration(&mut self, choices: &[StageChoice]) -> Result<ConfigId, StoreError> {
        let stages = self.stages()?;
        if choices.len() != stages {
            return Err(StoreError::CountMismatch {
                what: "stage choices",
                expected: stages,
                actual: choices.len(),
            });
        }

        let columns = (0..stages)
            .map(|i| format!("step{i}_name, step{i}_id"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({columns}) VALUES ({})",
            self.config_table(),
            vec!["?, ?"; stages].join(", ")
        );
        let args = choice_args(choices);

        let id = self.transact("add configuration", |conn| {
            conn.execute(&sql, args.as_slice())?;
            Ok(conn.last_insert_rowid())
        })?;

        if let Some(cache) = self.config_cache.as_mut() {
            cache.push(id);
        }
        debug!("Created new configuration with id {}", id);
        Ok(id)
    }

    fn contains_subset(
        &mut self,
        prefix: &[StageChoice],
        include_failed: bool,
    ) -> Result<Option<ConfigId>, StoreError> {
        let stages = self.stages()?;
        if prefix.len() > stages {
            return Err(StoreError::CountMismatch {
                what: "stage choices",
                expected: stages,
                actual: prefix.len(),
            });
        }

        let status = if include_failed { "1 = 1" } else { "failed = 0" };
        let sql = format!(
            "SELECT id FROM {} WHERE {status}{} ORDER BY score DESC, id ASC LIMIT 1",
            self.config_table(),
            prefix_filter(prefix, "")
        );
        let args = choice_args(prefix);

        let found = self.transact("find configuration subset", |conn| {
            conn.query_row(&sql, args.as_slice(), |row| row.get(0))
                .optional()
        })?;
        trace!(
            "Subset of length {} (include failed: {}): {:?}",
            prefix.len(),
            include_failed,
            found
        );
        Ok(found)
    }

    fn fail_configuration(&mut self, id: ConfigId, stage: usize) -> Result<(), StoreError> {
        if stage == 0 {
            warn!("Configuration {} failed at stage 0, recording stage 1", id);
        }
        let stage = stage.max(1);
        let marker = ConfigStatus::FailedAt(stage).marker();
        let sql = format!("UPDATE {} SET failed = ?1 WHERE id = ?2", self.config_table());

        self.transact("fail configuration", |conn| {
            conn.execute(&sql, rusqlite::params![marker, id])
        })?;

        if let Some(cache) = self.config_cache.as_mut() {
            cache.retain(|&c| c != id);
        }
        info!("Failed configuration {} at stage {}", id, stage);
        Ok(())
    }

    fn update_configuration(&mut self, id: ConfigId, score: f64) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET score = ?1, failed = 0 WHERE id = ?2",
            self.config_table()
        );

        self.transact("update configuration", |conn| {
            conn.execute(&sql, rusqlite::params![score, id])
        })?;

        if let Some((min, max)) = self.score_bounds.as_mut() {
            *min = min.min(score);
            *max = max.max(score);
        }
        info!("Updated configuration {} with score {}", id, score);
        Ok(())
    }

    fn score_for_config(&mut self, id: ConfigId) -> Result<Option<f64>, StoreError> {
        let sql = format!(
            "SELECT score FROM {} WHERE failed = 0 AND id = ?1",
            self.config_table()
        );
        self.transact("read configuration score", |conn| {
            conn.query_row(&sql, [id], |row| row.get(0)).optional()
        })
    }

    fn record_sample(&mut self, id: ConfigId, score: Option<f64>) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (config_id, score) VALUES (?1, ?2)",
            self.sample_table()
        );
        self.transact("record sample", |conn| {
            conn.execute(&sql, rusqlite::params![id, score])
        })?;
        Ok(())
    }

    fn edge_group_scores(
        &mut self,
        stage: usize,
        history: &[StageChoice],
    ) -> Result<Vec<GroupScore>, StoreError> {
        let stages = self.stages()?;
        if stage >= stages || history.len() > stage {
            return Err(StoreError::CountMismatch {
                what: "history choices",
                expected: stage.min(stages),
                actual: history.len(),
            });
        }

        let sql = format!(
            "SELECT step{stage}_name, MAX(score) AS ms FROM {} WHERE failed = 0{}
             GROUP BY step{stage}_name ORDER BY ms ASC, step{stage}_name ASC",
            self.config_table(),
            prefix_filter(history, "")
        );
        let args = choice_args(history);

        let rows = self.transact("read edge group scores", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(args.as_slice(), |row| {
                    Ok(GroupScore {
                        group: row.get(0)?,
                        score: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        Ok(rows.into_iter().filter(|g| g.score > 0.0).collect())
    }

    fn score_sum_for_param_range(
        &mut self,
        stage: usize,
        history: &[StageChoice],
        group: &str,
        param: &Parameter,
        max_id: u64,
        temperature: f64,
    ) -> Result<ScoreSum, StoreError> {
        let stages = self.stages()?;
        if stage >= stages || history.len() > stage {
            return Err(StoreError::CountMismatch {
                what: "history choices",
                expected: stage.min(stages),
                actual: history.len(),
            });
        }
        check_identifier(param.name())?;

        let column = quote(param.name());
        let sql = format!(
            "SELECT step.{column}, MAX(config.score) AS m
             FROM {config} config JOIN {edges} step ON config.step{stage}_id = step.id
             WHERE config.failed = 0 AND config.step{stage}_name = ?{filter}
             GROUP BY step.{column} ORDER BY m ASC",
            config = self.config_table(),
            edges = self.edge_table(group),
            filter = prefix_filter(history, "config."),
        );
        let group_name = group.to_string();
        let mut args: Vec<&dyn ToSql> = vec![&group_name];
        args.extend(choice_args(history));

        let rows = self.transact("read parameter score sum", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(args.as_slice(), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let scores: Vec<f64> = rows
            .iter()
            .filter(|(value, _)| param.position_of(value).is_some_and(|id| id <= max_id))
            .map(|&(_, score)| score)
            .collect();

        let sum = ScoreSum {
            visited: scores.len() as u64,
            score: relative_score_sum(&scores, temperature),
        };
        trace!(
            "Parameter {} ids [0, {}]: {} visited, score sum {}",
            param.name(),
            max_id,
            sum.visited,
            sum.score
        );
        Ok(sum)
    }

    fn score_range(&mut self) -> Result<f64, StoreError> {
        if let Some((min, max)) = self.score_bounds {
            return Ok(max - min);
        }

        let sql = format!(
            "SELECT MIN(score), MAX(score) FROM {} WHERE failed = 0",
            self.config_table()
        );
        let bounds: (Option<f64>, Option<f64>) = self.transact("read score range", |conn| {
            conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
        })?;

        match bounds {
            (Some(min), Some(max)) => {
                self.score_bounds = Some((min, max));
                Ok(max - min)
            }
            _ => {
                trace!("No scores yet, using default score range");
                Ok(DEFAULT_SCORE_RANGE)
            }
        }
    }

    fn configuration(&mut self, id: ConfigId) -> Result<Option<Configuration>, StoreError> {
        let stages = self.stages()?;
        let table = self.config_table();
        self.transact("read configuration", |conn| {
            load_configuration(conn, &table, stages, id)
        })
    }

    fn configurations(&mut self) -> Result<Vec<ConfigId>, StoreError> {
        if let Some(cache) = &self.config_cache {
            return Ok(cache.clone());
        }

        let sql = format!(
            "SELECT id FROM {} WHERE failed <= 0 ORDER BY id",
            self.config_table()
        );
        let ids = self.transact("list configurations", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<ConfigId>>>()?;
            Ok(ids)
        })?;

        debug!("Run {} has {} configurations", self.run, ids.len());
        self.config_cache = Some(ids.clone());
        Ok(ids)
    }

    fn best_configuration(&mut self) -> Result<Option<Configuration>, StoreError> {
        let stages = self.stages()?;
        let table = self.config_table();
        let sql = format!(
            "SELECT id FROM {table} WHERE failed = 0 ORDER BY score DESC, id ASC LIMIT 1"
        );
        self.transact("read best configuration", |conn| {
            let best: Option<ConfigId> = conn.query_row(&sql, [], |row| row.get(0)).optional()?;
            match best {
                Some(id) => load_configuration(conn, &table, stages, id),
                None => Ok(None),
            }
        })
    }
}

fn load_configuration(
    conn: &Connection,
    table: &str,
    stages: usize,
    id: ConfigId,
) -> rusqlite::Result<Option<Configuration>> {
    let columns = (0..stages)
        .map(|i| format!("step{i}_name, step{i}_id"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT {columns}, score, failed FROM {table} WHERE id = ?1");

    conn.query_row(&sql, [id], |row| {
        let mut choices = Vec::with_capacity(stages);
        for i in 0..stages {
            choices.push(StageChoice {
                group: row.get(2 * i)?,
                edge_id: row.get(2 * i + 1)?,
            });
        }
        Ok(Configuration {
            id,
            choices,
            score: row.get(2 * stages)?,
            status: ConfigStatus::from_marker(row.get(2 * stages + 1)?),
        })
    })
    .optional()
}

/// `AND step<i>_name = ? AND step<i>_id = ?` for every prefix element.
fn prefix_filter(prefix: &[StageChoice], alias: &str) -> String {
    (0..prefix.len())
        .map(|i| format!(" AND {alias}step{i}_name = ? AND {alias}step{i}_id = ?"))
        .collect()
}

fn choice_args(choices: &[StageChoice]) -> Vec<&dyn ToSql> {
    choices
        .iter()
        .flat_map(|c| [&c.group as &dyn ToSql, &c.edge_id as &dyn ToSql])
        .collect()
}

fn check_identifier(name: &str) -> Result<(), StoreError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}
