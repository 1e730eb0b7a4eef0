use diesel::sql_types::BigInt;
use diesel::{Connection, ConnectionError, PgConnection, RunQueryDsl};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::info;
use miette::Diagnostic;
use std::error::Error;
use thiserror::Error;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("../migrations");

// Arbitrary app-wide constant. Every instance takes the same advisory lock
// so only one of them runs migrations at startup.
const MIGRATION_LOCK_ID: i64 = 57114;

#[derive(Debug, Error, Diagnostic)]
pub enum MigrationError {
    #[error("couldn't connect to database")]
    FailedToConnectToDatabase(#[source] ConnectionError),

    #[error("error acquiring migrations lock")]
    FailedToAcquireMigrationsLock(#[source] diesel::result::Error),

    #[error("error running migrations")]
    FailedToRunMigrations(#[source] Box<dyn Error + Send + Sync>),
}

pub fn run_migrations() -> Result<(), MigrationError> {
    let url = crate::postgres_url_from_environment();

    let mut conn =
        PgConnection::establish(&url).map_err(MigrationError::FailedToConnectToDatabase)?;

    info!("Acquiring migrations lock");
    diesel::sql_query("select pg_advisory_lock($1);")
        .bind::<BigInt, _>(MIGRATION_LOCK_ID)
        .execute(&mut conn)
        .map_err(MigrationError::FailedToAcquireMigrationsLock)?;

    info!("Running pending migrations");
    let versions = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(MigrationError::FailedToRunMigrations)?;
    info!("Applied {} migration(s)", versions.len());

    // The advisory lock is session-scoped; dropping the connection
    // releases it.
    Ok(())
}
