use std::{collections::HashMap, collections::HashSet, panic::AssertUnwindSafe, time::Instant};

use chrono::Utc;
use futures_util::{future::BoxFuture, FutureExt};

use crate::{
    config::DEFAULT_TABLE_NAME,
    dialect::{Dialect, Lease},
    error::{Error, Result},
    executor::{Executor, Transaction, Value},
    migration::{AppliedMigration, Migration},
};

/// Applies migrations to a database, each exactly once.
///
/// A `Migrator` remembers the first failure it runs into. From then on every
/// call returns that same error without touching the database; build a new
/// `Migrator` to try again.
///
/// ```rust,ignore
/// let mut migrator = Migrator::new()
///     .dialect(SqliteDialect::new())
///     .table_name("app_migrations");
///
/// let mut conn = pool.acquire().await?;
/// migrator.apply(Some(&mut *conn), &migrations).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Migrator {
    dialect: Dialect,
    table_name: String,
    schema_name: Option<String>,
    err: Option<Error>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            table_name: DEFAULT_TABLE_NAME.to_owned(),
            schema_name: None,
            err: None,
        }
    }
}

impl Migrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialect(mut self, dialect: impl Into<Dialect>) -> Self {
        self.dialect = dialect.into();
        self
    }

    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    /// Schema holding the tracking table. Ignored by SQLite.
    pub fn schema_name(mut self, name: impl Into<String>) -> Self {
        self.schema_name = Some(name.into());
        self
    }

    pub fn quoted_table_name(&self) -> String {
        self.dialect
            .quoted_table_name(self.schema_name.as_deref(), &self.table_name)
    }

    /// The latched failure, if any.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Applies every migration not yet recorded in the tracking table, in
    /// ascending id order.
    ///
    /// The whole run holds the dialect's migration lock, so concurrent callers
    /// against the same tracking table wait for each other and never run a
    /// migration twice. Each migration commits together with its tracking row.
    /// The first failure stops the run and is latched.
    pub async fn apply(
        &mut self,
        db: Option<&mut dyn Executor>,
        migrations: &[Migration],
    ) -> Result<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }

        let Some(db) = db else {
            return Err(self.latch(Error::NoDatabase));
        };

        match self.run(db, migrations).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.latch(err)),
        }
    }

    /// Reads the tracking table, keyed by migration id. Takes no lock.
    pub async fn get_applied_migrations(
        &self,
        db: &mut dyn Executor,
    ) -> Result<HashMap<String, AppliedMigration>> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }

        self.fetch_applied(db).await
    }

    fn latch(&mut self, err: Error) -> Error {
        if let Some(prior) = &self.err {
            return prior.clone();
        }

        tracing::error!(
            table = %self.table_name,
            dialect = self.dialect.name(),
            error = %err,
            "Migration run failed"
        );

        self.err = Some(err.clone());

        err
    }

    fn check(&self) -> Result<()> {
        match self.err {
            Some(_) => Err(Error::PriorFailure),
            None => Ok(()),
        }
    }

    async fn run(&self, db: &mut dyn Executor, migrations: &[Migration]) -> Result<()> {
        let lease = self.lock(db).await?;
        let res = self.migrate(db, migrations).await;

        let Some(lease) = lease else {
            return res;
        };

        let unlocked = self.unlock(db, lease).await;

        res.and(unlocked)
    }

    async fn migrate(&self, db: &mut dyn Executor, migrations: &[Migration]) -> Result<()> {
        self.create_migrations_table(db).await?;

        let plan = self.compute_migration_plan(db, migrations).await?;

        tracing::debug!(
            table = %self.table_name,
            pending = plan.len(),
            total = migrations.len(),
            "Computed migration plan"
        );

        let insert = self.dialect.insert_sql(&self.quoted_table_name());

        for migration in plan {
            let id = migration.id.to_owned();
            let insert = insert.clone();

            let elapsed = self
                .transaction(db, move |tx| {
                    async move {
                        let checksum = migration.checksum();
                        let started = Instant::now();

                        tx.execute(&migration.script, &[])
                            .await
                            .map_err(|err| Error::script(&migration.id, err))?;

                        let elapsed =
                            i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

                        tx.execute(
                            &insert,
                            &[
                                Value::Text(migration.id),
                                Value::Text(checksum),
                                Value::Int(elapsed),
                                Value::Timestamp(Utc::now()),
                            ],
                        )
                        .await?;

                        Ok::<_, Error>(elapsed)
                    }
                    .boxed()
                })
                .await?;

            tracing::info!(id = %id, elapsed_ms = elapsed, "Migration applied");
        }

        Ok(())
    }

    async fn lock(&self, db: &mut dyn Executor) -> Result<Option<Lease>> {
        self.check()?;

        let Some(locker) = self.dialect.locker() else {
            return Ok(None);
        };

        let table = self.quoted_table_name();
        tracing::debug!(table = %table, dialect = self.dialect.name(), "Acquiring migration lock");

        let lease = locker.lock(db, &table).await?;

        tracing::debug!(table = %table, owner = %lease.owner, "Acquired migration lock");

        Ok(Some(lease))
    }

    /// Runs even when a failure is latched, a held lease must always be
    /// released.
    async fn unlock(&self, db: &mut dyn Executor, lease: Lease) -> Result<()> {
        let Some(locker) = self.dialect.locker() else {
            return Ok(());
        };

        tracing::debug!(table = %lease.table, "Releasing migration lock");

        locker.unlock(db, lease).await
    }

    async fn create_migrations_table(&self, db: &mut dyn Executor) -> Result<()> {
        self.check()?;

        db.execute(&self.dialect.create_sql(&self.quoted_table_name()), &[])
            .await?;

        Ok(())
    }

    /// Pending migrations in the order they must run.
    async fn compute_migration_plan(
        &self,
        db: &mut dyn Executor,
        migrations: &[Migration],
    ) -> Result<Vec<Migration>> {
        self.check()?;

        let applied = self.fetch_applied(db).await?;

        let mut seen = HashSet::new();
        for migration in migrations {
            if !seen.insert(migration.id.as_str()) {
                return Err(Error::DuplicateMigration(migration.id.to_owned()));
            }
        }

        let mut plan = Vec::new();
        for migration in migrations {
            let Some(recorded) = applied.get(&migration.id) else {
                plan.push(migration.clone());
                continue;
            };

            if !recorded.checksum.is_empty() && recorded.checksum != migration.checksum() {
                tracing::warn!(
                    id = %migration.id,
                    applied = %recorded.checksum,
                    current = %migration.checksum(),
                    "Migration script changed after it was applied"
                );
            }
        }

        plan.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(plan)
    }

    async fn fetch_applied(
        &self,
        db: &mut dyn Executor,
    ) -> Result<HashMap<String, AppliedMigration>> {
        let sql = self.dialect.select_sql(&self.quoted_table_name());
        let rows = db.fetch_applied(&sql).await.map_err(Error::query)?;

        Ok(rows
            .into_iter()
            .map(|migration| (migration.id.to_owned(), migration))
            .collect())
    }

    /// Runs `body` inside a transaction, committing on success and rolling
    /// back on error. A panic raised while beginning, running or finishing
    /// the transaction is caught and returned as [`Error::Panic`].
    async fn transaction<T, F>(&self, db: &mut dyn Executor, body: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, Result<T>> + Send,
    {
        self.check()?;

        let step = async {
            let mut tx = db.begin().await.map_err(Error::begin)?;

            let res = AssertUnwindSafe(async { body(&mut *tx).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(Error::from_panic(payload)));

            match res {
                Ok(value) => {
                    tx.commit().await?;

                    Ok(value)
                }
                Err(err) => {
                    if let Err(rollback) = tx.rollback().await {
                        tracing::warn!(error = %rollback, "Failed to rollback migration");
                    }

                    Err(err)
                }
            }
        };

        AssertUnwindSafe(step)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(Error::from_panic(payload)))
    }
}
