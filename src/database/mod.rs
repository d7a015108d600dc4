use anyhow::{Context, Result};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection};
use tracing::{error, info};

pub async fn create_connection(database_url: &str) -> Result<DatabaseConnection> {
    info!("Connecting to database");
    let db = Database::connect(database_url)
        .await
        .context("Failed to connect to database")?;

    setup_database(&db)
        .await
        .context("Failed to setup database schema")?;

    info!("Database connection established successfully");
    Ok(db)
}

async fn setup_database(db: &DatabaseConnection) -> Result<()> {
    info!("Setting up database schema...");

    create_tables(db).await?;
    create_indexes(db).await?;

    info!("Database schema setup completed");
    Ok(())
}

async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let tables = vec![
        ("strategies", include_str!("sql/create_strategies_table.sql")),
        ("signals", include_str!("sql/create_signals_table.sql")),
        ("trades", include_str!("sql/create_trades_table.sql")),
        (
            "evolution_log",
            include_str!("sql/create_evolution_log_table.sql"),
        ),
        (
            "engine_settings",
            include_str!("sql/create_engine_settings_table.sql"),
        ),
    ];

    for (table_name, sql) in tables {
        match db.execute_unprepared(sql).await {
            Ok(_) => info!("✓ Created table: {}", table_name),
            Err(e) => {
                error!("✗ Failed to create table {}: {}", table_name, e);
                return Err(e.into());
            }
        }
    }

    Ok(())
}

async fn create_indexes(db: &DatabaseConnection) -> Result<()> {
    let indexes_sql = include_str!("sql/create_indexes.sql");
    db.execute_unprepared(indexes_sql)
        .await
        .context("Failed to create database indexes")?;

    info!("✓ Database indexes created successfully");
    Ok(())
}
