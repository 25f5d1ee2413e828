use std::path::Path;

use anyhow::{Context, Result};
use constsleuth::annotate::{merge_comment, Annotation, AnnotationError, Annotator, StructDef};
use constsleuth::DataType;
use rusqlite::{Connection, OptionalExtension};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS names (
        address INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS comments (
        address INTEGER PRIMARY KEY,
        comment TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS types (
        address INTEGER PRIMARY KEY,
        size INTEGER NOT NULL,
        data_type TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS structs (
        name TEXT PRIMARY KEY,
        definition TEXT NOT NULL
    );
";

fn backend(err: impl std::fmt::Display) -> AnnotationError {
    AnnotationError::Backend(err.to_string())
}

/// Annotations persisted to a SQLite database so repeated runs see earlier results.
pub struct SqliteAnnotations {
    conn: Connection,
}
impl SqliteAnnotations {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create annotation tables")?;
        Ok(Self { conn })
    }

    fn owner_of(&self, name: &str) -> Result<Option<usize>, AnnotationError> {
        self.conn
            .query_row("SELECT address FROM names WHERE name = ?1", (name,), |row| {
                row.get(0)
            })
            .optional()
            .map_err(backend)
    }

    fn set_name(&mut self, address: usize, name: String) -> Result<(), AnnotationError> {
        match self.owner_of(&name)? {
            Some(owner) if owner != address => Err(AnnotationError::NameInUse { name, owner }),
            Some(_) => Ok(()),
            None => {
                self.conn
                    .execute(
                        "INSERT INTO names (address, name) VALUES (?1, ?2)
                         ON CONFLICT(address) DO UPDATE SET name = excluded.name",
                        (address, &name),
                    )
                    .map_err(backend)?;
                Ok(())
            }
        }
    }

    fn set_comment(&mut self, address: usize, text: &str) -> Result<(), AnnotationError> {
        let existing = self.comment(address)?;
        if let Some(merged) = merge_comment(existing.as_deref(), text) {
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO comments (address, comment) VALUES (?1, ?2)",
                    (address, &merged),
                )
                .map_err(backend)?;
        }
        Ok(())
    }

    fn set_type(&mut self, address: usize, data_type: DataType) -> Result<(), AnnotationError> {
        let size = data_type.size();
        let json = serde_json::to_string(&data_type).map_err(backend)?;
        let tx = self.conn.transaction().map_err(backend)?;
        tx.execute(
            "DELETE FROM types WHERE address < ?1 AND address + size > ?2",
            (address + size, address),
        )
        .map_err(backend)?;
        tx.execute(
            "INSERT OR REPLACE INTO types (address, size, data_type) VALUES (?1, ?2, ?3)",
            (address, size, &json),
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)
    }

    #[cfg(test)]
    pub fn data_type(&self, address: usize) -> Result<Option<DataType>, AnnotationError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT data_type FROM types WHERE address = ?1",
                (address,),
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        json.map(|json| serde_json::from_str(&json).map_err(backend))
            .transpose()
    }
}

impl Annotator for SqliteAnnotations {
    fn annotate(&mut self, address: usize, annotation: Annotation) -> Result<(), AnnotationError> {
        match annotation {
            Annotation::Name(name) => self.set_name(address, name),
            Annotation::Comment(text) => self.set_comment(address, &text),
            Annotation::Type(data_type) => self.set_type(address, data_type),
        }
    }
    fn name_exists(&self, name: &str) -> Result<bool, AnnotationError> {
        Ok(self.owner_of(name)?.is_some())
    }
    fn name_of(&self, address: usize) -> Result<Option<String>, AnnotationError> {
        self.conn
            .query_row("SELECT name FROM names WHERE address = ?1", (address,), |row| {
                row.get(0)
            })
            .optional()
            .map_err(backend)
    }
    fn comment(&self, address: usize) -> Result<Option<String>, AnnotationError> {
        self.conn
            .query_row(
                "SELECT comment FROM comments WHERE address = ?1",
                (address,),
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }
    fn struct_exists(&self, name: &str) -> Result<bool, AnnotationError> {
        self.conn
            .query_row("SELECT 1 FROM structs WHERE name = ?1", (name,), |_| Ok(()))
            .optional()
            .map(|row| row.is_some())
            .map_err(backend)
    }
    fn define_struct(&mut self, def: &StructDef) -> Result<(), AnnotationError> {
        let json = serde_json::to_string(def).map_err(backend)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO structs (name, definition) VALUES (?1, ?2)",
                (&def.name, &json),
            )
            .map_err(backend)?;
        Ok(())
    }
}
