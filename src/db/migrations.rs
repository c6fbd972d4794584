use crate::db::Database;
use crate::error::Result;

const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    CREATE TABLE IF NOT EXISTS rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        enabled INTEGER NOT NULL DEFAULT 1,
        conditions TEXT NOT NULL,
        actions TEXT NOT NULL,
        last_run_at TEXT,
        last_result TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS devices (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS zones (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        cooldown_period_days INTEGER NOT NULL DEFAULT 0,
        device_id TEXT
    );

    CREATE TABLE IF NOT EXISTS sensor_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL UNIQUE,
        rain_24h REAL,
        rain_1h REAL,
        temperature REAL,
        humidity REAL,
        pressure REAL,
        soil_moisture REAL,
        soil_channels TEXT
    );

    CREATE TABLE IF NOT EXISTS watering_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        zone_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        duration_sec INTEGER NOT NULL,
        source TEXT NOT NULL,
        raw_payload TEXT
    );

    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        rule_id INTEGER,
        rule_name TEXT NOT NULL,
        action TEXT NOT NULL,
        details TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    "#,
    // Migration 2: Add indexes
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensor_readings_timestamp
        ON sensor_readings(timestamp);
    CREATE INDEX IF NOT EXISTS idx_watering_events_zone_timestamp
        ON watering_events(zone_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp
        ON audit_log(timestamp);
    "#,
];

pub fn run(db: &Database) -> Result<()> {
    db.with_conn_mut(|conn| {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        if current_version > MIGRATIONS.len() as i32 {
            tracing::warn!(
                current_version,
                known = MIGRATIONS.len(),
                "Database schema is newer than this build"
            );
        }

        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i32;
            if version > current_version {
                tracing::info!(version, "Applying migration");
                let tx = conn.transaction()?;
                tx.execute_batch(migration)?;
                tx.execute(
                    "INSERT INTO schema_migrations (version) VALUES (?1)",
                    [version],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        run(&db).unwrap();

        let version: i32 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                    row.get(0)
                })?)
            })
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i32);
    }
}
