pub const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
      seq INTEGER PRIMARY KEY AUTOINCREMENT,
      collection TEXT NOT NULL,
      key TEXT NOT NULL,
      body TEXT NOT NULL,
      updated_at INTEGER NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_collection_key
      ON documents(collection, key);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_documents_collection_seq
      ON documents(collection, seq);
    "#,
];
