/// Metadata schema created by `primary register`.
pub const CREATE_SCHEMA_SQL: &str = "\
CREATE SCHEMA IF NOT EXISTS repmgr;

CREATE TABLE IF NOT EXISTS repmgr.nodes (
    node_id          INTEGER     PRIMARY KEY,
    upstream_node_id INTEGER     NULL REFERENCES repmgr.nodes (node_id) DEFERRABLE,
    active           BOOLEAN     NOT NULL DEFAULT TRUE,
    node_name        TEXT        NOT NULL,
    type             TEXT        NOT NULL CHECK (type IN ('primary', 'standby', 'witness', 'bdr')),
    location         TEXT        NOT NULL DEFAULT 'default',
    priority         INT         NOT NULL DEFAULT 100 CHECK (priority >= 0),
    conninfo         TEXT        NOT NULL,
    repluser         VARCHAR(63) NOT NULL,
    slot_name        TEXT        NULL,
    config_file      TEXT        NOT NULL,
    CONSTRAINT nodes_node_name_key UNIQUE (node_name)
);

CREATE UNIQUE INDEX IF NOT EXISTS nodes_slot_name_idx
    ON repmgr.nodes (slot_name)
    WHERE slot_name IS NOT NULL AND slot_name <> '';

CREATE TABLE IF NOT EXISTS repmgr.events (
    node_id          INTEGER     NOT NULL,
    event            TEXT        NOT NULL,
    successful       BOOLEAN     NOT NULL DEFAULT TRUE,
    event_timestamp  TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
    details          TEXT        NULL
);

CREATE INDEX IF NOT EXISTS events_timestamp_idx ON repmgr.events (event_timestamp);
";

/// Map a unique-constraint name to the column it protects.
pub fn constraint_field(constraint: &str) -> &'static str {
    match constraint {
        "nodes_pkey" => "node_id",
        "nodes_node_name_key" => "node_name",
        "nodes_slot_name_idx" => "slot_name",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_field() {
        assert_eq!(constraint_field("nodes_pkey"), "node_id");
        assert_eq!(constraint_field("nodes_slot_name_idx"), "slot_name");
        assert_eq!(constraint_field("other"), "unknown");
    }

    #[test]
    fn test_schema_names_constraints() {
        assert!(CREATE_SCHEMA_SQL.contains("nodes_node_name_key"));
        assert!(CREATE_SCHEMA_SQL.contains("nodes_slot_name_idx"));
    }
}
