use std::{io, time::Duration};

use async_trait::async_trait;
use futures_util::{future::join_all, Future, TryFutureExt};
use migrata::{Dialect, Error, Executor, Migration, Migrator, Transaction, Value};
use uuid::Uuid;

/// Script that makes [`Panicking`] panic instead of running it.
pub const PANIC_SCRIPT: &str = "PANIC";

/// What the shared tests need from a database under test.
#[async_trait]
pub trait Backend: Sync {
    type Conn: Executor + 'static;

    async fn connect(&self) -> anyhow::Result<Self::Conn>;

    fn dialect(&self) -> Dialect;

    /// A statement that takes a noticeable amount of time to run.
    fn delay_sql(&self, table: &str) -> String;

    /// Creates a table with a generated `id` and a `created_at` column.
    fn data_table_sql(&self, table: &str) -> String;

    async fn count(&self, conn: &mut Self::Conn, table: &str) -> anyhow::Result<i64>;
}

pub fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

fn insert_sql(table: &str) -> String {
    format!("INSERT INTO {table} (created_at) VALUES (CURRENT_TIMESTAMP)")
}

pub async fn apply_in_lexical_order<B: Backend>(backend: &B) -> anyhow::Result<()> {
    let last = unique("last");
    let first = unique("first");
    let mut conn = backend.connect().await?;
    let mut migrator = Migrator::new()
        .dialect(backend.dialect())
        .table_name(unique("lexical_order_migrations"));

    let migrations = vec![
        Migration::new(
            "2019-01-01 999 Should Run Last",
            format!("CREATE TABLE {last} (id INTEGER NOT NULL)"),
        ),
        Migration::new(
            "2019-01-01 001 Should Run First",
            format!("CREATE TABLE {first} (id INTEGER NOT NULL)"),
        ),
    ];

    migrator.apply(Some(&mut conn), &migrations).await?;

    let applied = migrator.get_applied_migrations(&mut conn).await?;
    assert_eq!(applied.len(), 2);

    let first = &applied["2019-01-01 001 Should Run First"];
    let last = &applied["2019-01-01 999 Should Run Last"];

    assert_eq!(first.checksum, migrations[1].checksum());
    assert_eq!(last.checksum, migrations[0].checksum());
    assert!(first.execution_time_millis >= 0);
    assert!(first.applied_at <= last.applied_at);

    Ok(())
}

pub async fn apply_is_idempotent<B: Backend>(backend: &B) -> anyhow::Result<()> {
    let table = unique("migrations");
    let data = unique("data");
    let mut conn = backend.connect().await?;

    let migrations = vec![
        Migration::new("2021-01-01 001 Create Data Table", backend.data_table_sql(&data)),
        Migration::new("2021-01-01 002 Add Initial Record", insert_sql(&data)),
    ];

    let mut migrator = Migrator::new().dialect(backend.dialect()).table_name(&table);
    migrator.apply(Some(&mut conn), &migrations).await?;
    let before = migrator.get_applied_migrations(&mut conn).await?;

    let mut migrator = Migrator::new().dialect(backend.dialect()).table_name(&table);
    migrator.apply(Some(&mut conn), &migrations).await?;
    let after = migrator.get_applied_migrations(&mut conn).await?;

    assert_eq!(before, after);
    assert_eq!(backend.count(&mut conn, &data).await?, 1);

    Ok(())
}

pub async fn failed_migration<B: Backend>(backend: &B) -> anyhow::Result<()> {
    let mut conn = backend.connect().await?;
    let mut migrator = Migrator::new()
        .dialect(backend.dialect())
        .table_name(unique("migrations"));

    let migrations = vec![Migration::new(
        "2019-01-01 Bad Migration",
        "CREATE TIBBLE bad_table_name (id INTEGER NOT NULL PRIMARY KEY)",
    )];

    let err = migrator
        .apply(Some(&mut conn), &migrations)
        .await
        .unwrap_err();

    assert!(matches!(&err, Error::Script { id, .. } if id == "2019-01-01 Bad Migration"));
    assert!(err.to_string().contains("TIBBLE"), "{err}");
    assert!(migrator.error().is_some());

    let rows = backend
        .count(&mut conn, &migrator.quoted_table_name())
        .await?;
    assert_eq!(rows, 0);

    Ok(())
}

/// Every caller applies the same migrations then inserts one row of its own.
/// The seed row must only be inserted once.
pub async fn simultaneous_apply<B: Backend>(backend: &B, concurrency: usize) -> anyhow::Result<()> {
    let data = unique("data");
    let table = format!("Migrations {}", Uuid::new_v4());

    let migrations = vec![
        Migration::new("2020-05-01 Sleep", backend.delay_sql(&unique("delay"))),
        Migration::new("2020-05-02 Create Data Table", backend.data_table_sql(&data)),
        Migration::new("2020-05-03 Add Initial Record", insert_sql(&data)),
    ];

    let (migrations, table, data) = (&migrations, &table, &data);
    let runs = (0..concurrency).map(move |_| async move {
        let mut conn = backend.connect().await?;
        let mut migrator = Migrator::new().dialect(backend.dialect()).table_name(table);

        migrator.apply(Some(&mut conn), migrations).await?;
        conn.execute(&insert_sql(data), &[]).await?;

        anyhow::Ok(())
    });

    for res in join_all(runs).await {
        res?;
    }

    let mut conn = backend.connect().await?;
    assert_eq!(backend.count(&mut conn, data).await?, concurrency as i64 + 1);

    Ok(())
}

pub async fn panic_releases_lock<B: Backend>(backend: &B) -> anyhow::Result<()> {
    let table = unique("migrations");
    let after = unique("after");

    let mut conn = Panicking(backend.connect().await?);
    let mut migrator = Migrator::new().dialect(backend.dialect()).table_name(&table);

    let err = migrator
        .apply(
            Some(&mut conn),
            &[Migration::new("2019-01-01 Panic", PANIC_SCRIPT)],
        )
        .await
        .unwrap_err();

    assert!(matches!(&err, Error::Panic(msg) if msg == "Panic String"));

    let mut other = backend.connect().await?;
    let mut migrator = Migrator::new().dialect(backend.dialect()).table_name(&table);

    migrator
        .apply(
            Some(&mut other),
            &[Migration::new(
                "2019-01-02 After Panic",
                format!("CREATE TABLE {after} (id INTEGER)"),
            )],
        )
        .await?;

    let applied = migrator.get_applied_migrations(&mut other).await?;
    assert_eq!(applied.len(), 1);
    assert!(applied.contains_key("2019-01-02 After Panic"));

    Ok(())
}

/// Executor whose transactions panic when asked to run [`PANIC_SCRIPT`].
pub struct Panicking<E>(pub E);

#[async_trait]
impl<E: Executor> Executor for Panicking<E> {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<(), sqlx::Error> {
        self.0.execute(sql, args).await
    }

    async fn fetch_flag(&mut self, sql: &str) -> Result<bool, sqlx::Error> {
        self.0.fetch_flag(sql).await
    }

    async fn fetch_applied(
        &mut self,
        sql: &str,
    ) -> Result<Vec<migrata::AppliedMigration>, sqlx::Error> {
        self.0.fetch_applied(sql).await
    }

    async fn begin<'a>(&'a mut self) -> Result<Box<dyn Transaction + 'a>, sqlx::Error> {
        let tx = self.0.begin().await?;

        Ok(Box::new(PanickingTx(tx)))
    }
}

struct PanickingTx<'a>(Box<dyn Transaction + 'a>);

#[async_trait]
impl<'a> Transaction for PanickingTx<'a> {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<(), sqlx::Error> {
        if sql == PANIC_SCRIPT {
            panic!("Panic String");
        }

        self.0.execute(sql, args).await
    }

    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.0.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.0.rollback().await
    }
}

/// Attempt an operation that may return errors like `ConnectionRefused`,
/// retrying for up to ten seconds.
#[allow(dead_code)]
pub async fn retry_connect_errors<'a, F, Fut, T>(
    database_url: &'a str,
    mut connect: F,
) -> sqlx::Result<T>
where
    F: FnMut(&'a str) -> Fut,
    Fut: Future<Output = sqlx::Result<T>> + 'a,
{
    backoff::future::retry(
        backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::from_secs(10)))
            .build(),
        || {
            connect(database_url).map_err(|e| -> backoff::Error<sqlx::Error> {
                if let sqlx::Error::Io(ref ioe) = e {
                    match ioe.kind() {
                        io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted => {
                            return backoff::Error::transient(e);
                        }
                        _ => (),
                    }
                }

                backoff::Error::permanent(e)
            })
        },
    )
    .await
}
