/// SQL statements for the local store and the sync queue.
pub struct Queries;

impl Queries {
    /// Local persistence schema: one `entities` table shared by the three
    /// domain collections, plus the durable outbox. Secondary lookups go
    /// through expression indexes over the JSON payload.
    pub const SCHEMA: &'static str = r#"
        CREATE TABLE IF NOT EXISTS entities (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            payload JSON NOT NULL,
            updated_at TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (kind, id),
            CHECK (kind IN ('message', 'medical_record', 'conversation'))
        );

        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            payload JSON NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            enqueued_at TEXT NOT NULL,
            CHECK (action IN ('create', 'update', 'delete'))
        );

        CREATE INDEX IF NOT EXISTS idx_entities_synced ON entities(kind, synced);
        CREATE INDEX IF NOT EXISTS idx_entities_updated_at ON entities(kind, updated_at);
        CREATE INDEX IF NOT EXISTS idx_entities_conversation
            ON entities(json_extract(payload, '$.conversation_id'));
        CREATE INDEX IF NOT EXISTS idx_entities_record_type
            ON entities(json_extract(payload, '$.record_type'));
        CREATE INDEX IF NOT EXISTS idx_entities_record_date
            ON entities(json_extract(payload, '$.date'));
        CREATE INDEX IF NOT EXISTS idx_entities_last_message
            ON entities(json_extract(payload, '$.last_message_at'));
        CREATE INDEX IF NOT EXISTS idx_sync_queue_kind ON sync_queue(entity_kind);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_enqueued_at ON sync_queue(enqueued_at);
    "#;

    // Entity queries
    pub const UPSERT_ENTITY: &'static str = r#"
        INSERT INTO entities (kind, id, payload, updated_at, synced)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(kind, id) DO UPDATE SET
            payload = excluded.payload,
            updated_at = excluded.updated_at,
            synced = excluded.synced
    "#;

    pub const GET_ENTITY: &'static str = r#"
        SELECT kind, id, payload, updated_at, synced
        FROM entities
        WHERE kind = ?1 AND id = ?2
    "#;

    pub const GET_ALL: &'static str = r#"
        SELECT kind, id, payload, updated_at, synced
        FROM entities
        WHERE kind = ?1
        ORDER BY updated_at ASC, id ASC
    "#;

    pub const GET_ALL_BY_SYNCED: &'static str = r#"
        SELECT kind, id, payload, updated_at, synced
        FROM entities
        WHERE kind = ?1 AND synced = ?2
        ORDER BY updated_at ASC, id ASC
    "#;

    pub const GET_ALL_BY_JSON_FIELD: &'static str = r#"
        SELECT kind, id, payload, updated_at, synced
        FROM entities
        WHERE kind = ?1 AND json_extract(payload, ?2) = ?3
        ORDER BY updated_at ASC, id ASC
    "#;

    pub const MARK_SYNCED: &'static str =
        "UPDATE entities SET synced = 1 WHERE kind = ?1 AND id = ?2";

    pub const DELETE_ENTITY: &'static str = "DELETE FROM entities WHERE kind = ?1 AND id = ?2";

    pub const EXPORT_ALL: &'static str = r#"
        SELECT kind, id, payload, updated_at, synced
        FROM entities
        ORDER BY kind ASC, id ASC
    "#;

    pub const CLEAR_ENTITIES: &'static str = "DELETE FROM entities";

    pub const STORAGE_USED: &'static str =
        "SELECT page_count * page_size AS used FROM pragma_page_count(), pragma_page_size()";

    // Sync queue queries
    pub const INSERT_SYNC_QUEUE: &'static str = r#"
        INSERT INTO sync_queue (entity_kind, entity_id, action, payload, max_retries, enqueued_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    "#;

    pub const GET_SYNC_QUEUE: &'static str = r#"
        SELECT id, entity_kind, entity_id, action, payload, retry_count, max_retries, enqueued_at
        FROM sync_queue
        ORDER BY id ASC
    "#;

    pub const DELETE_FROM_QUEUE: &'static str = "DELETE FROM sync_queue WHERE id = ?1";

    pub const INCREMENT_RETRY_COUNT: &'static str =
        "UPDATE sync_queue SET retry_count = retry_count + 1 WHERE id = ?1";

    pub const COUNT_QUEUE: &'static str = "SELECT COUNT(*) AS count FROM sync_queue";
}
