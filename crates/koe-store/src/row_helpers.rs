use chrono::{DateTime, Utc};

use koe_core::clock;

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

pub fn get_time(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = get(row, idx, table, column)?;
    parse_time(&raw, table, column)
}

pub fn get_time_opt(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    get_opt::<String>(row, idx, table, column)?
        .map(|raw| parse_time(&raw, table, column))
        .transpose()
}

fn parse_time(raw: &str, table: &'static str, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    clock::from_stored(raw).ok_or_else(|| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid timestamp: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionStatus;

    #[test]
    fn parse_enum_success() {
        let status: SessionStatus = parse_enum("abandoned", "chat_sessions", "status").unwrap();
        assert_eq!(status, SessionStatus::Abandoned);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<SessionStatus, _> = parse_enum("archived", "chat_sessions", "status");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "chat_sessions", column: "status", .. })
        ));
    }

    #[test]
    fn bad_timestamp_is_corrupt_row() {
        let err = parse_time("tuesday", "chat_sessions", "started_at").unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "started_at", .. }));
    }
}
