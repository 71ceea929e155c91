use chrono::Utc;
use log::error;
use rusqlite::{params, Connection, Result};

pub fn open(path: &str) -> Result<Connection> {
    init(Connection::open(path)?)
}

#[cfg(test)]
pub fn open_in_memory() -> Result<Connection> {
    init(Connection::open_in_memory()?)
}

fn init(conn: Connection) -> Result<Connection> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS gate_event (plate TEXT NOT NULL, reason TEXT NOT NULL, timestamp INTEGER NOT NULL)",
        [],
    )?;
    Ok(conn)
}

/// Appends a row to 'gate_event'. Failures are logged; the gate has already opened.
pub fn record_gate_event(conn: &Connection, plate: &str, reason: &str) {
    if let Err(e) = conn.execute(
        "INSERT INTO gate_event(plate, reason, timestamp) VALUES (?1, ?2, ?3)",
        params![plate, reason, Utc::now().timestamp()],
    ) {
        error!(
            "Unable to journal gate event '{}' for plate '{}': {:?}",
            reason, plate, e
        );
    }
}

pub fn count_gate_events(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM gate_event", [], |row| row.get(0))?;
    Ok(count as usize)
}

#[cfg(test)]
pub fn reasons_for(conn: &Connection, plate: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT reason FROM gate_event WHERE plate = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map([plate], |row| row.get(0))?;
    rows.collect()
}
