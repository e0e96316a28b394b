//! Ledger Store: append-only rows of marks, one SQLite file per ledger.
//!
//! A ledger is named by a client-supplied relative identifier (for example
//! `marks.xlsx`) and lives at `<root>/<identifier>.sqlite`. Entries get
//! consecutive sequence ids starting at 1 and are never modified; the schema
//! rejects updates and deletes.

mod path;
mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use sqlx::Row as _;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::OnceCell;
use tracing::{info, instrument};

use crate::error::LedgerError;
use crate::models::{AppendReceipt, LedgerEntry, Row};

pub use path::LedgerPath;
use state::LedgerState;

type Slot = Arc<OnceCell<LedgerState>>;

pub struct LedgerStore {
    root: PathBuf,
    /// Open ledgers by backing file. A slot is created before its file is
    /// opened so concurrent first uses share one open.
    slots: Mutex<HashMap<PathBuf, Slot>>,
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore").field("root", &self.root).finish()
    }
}

impl LedgerStore {
    /// Store rooted at `root`. Nothing is created until the first append.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Validate an identifier without touching storage.
    pub fn validate(&self, raw: &str) -> Result<LedgerPath, LedgerError> {
        LedgerPath::parse(raw)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn slot(&self, file: &Path) -> Slot {
        self.slots().entry(file.to_path_buf()).or_default().clone()
    }

    /// Drop the slot for `file` if its open failed, so a later call retries
    /// and a failed path does not stay in the map.
    fn forget_unopened(&self, file: &Path) {
        let mut slots = self.slots();
        if slots.get(file).is_some_and(|slot| !slot.initialized()) {
            slots.remove(file);
        }
    }

    async fn open_existing(&self, ledger: &LedgerPath) -> Result<Option<Slot>, LedgerError> {
        let file = ledger.file_in(&self.root);
        let known = self.slots().get(&file).cloned();
        if let Some(slot) = known.filter(|slot| slot.initialized()) {
            return Ok(Some(slot));
        }
        if !file.is_file() {
            return Ok(None);
        }
        let slot = self.slot(&file);
        if let Err(e) = slot.get_or_try_init(|| LedgerState::open(&file)).await {
            self.forget_unopened(&file);
            return Err(e);
        }
        Ok(Some(slot))
    }

    async fn open_or_create(&self, ledger: &LedgerPath) -> Result<Slot, LedgerError> {
        let file = ledger.file_in(&self.root);
        let slot = self.slot(&file);
        let opened = slot
            .get_or_try_init(|| async {
                if let Some(parent) = file.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|source| LedgerError::Io {
                            path: parent.to_path_buf(),
                            source,
                        })?;
                }
                LedgerState::open(&file).await
            })
            .await;
        if let Err(e) = opened {
            self.forget_unopened(&file);
            return Err(e);
        }
        Ok(slot)
    }

    /// Durably append `row` and return the new entry with the grand total
    /// including it. Creates the ledger on first use.
    #[instrument(skip(self, row), fields(marks = row.marks.len()))]
    pub async fn append(&self, path: &str, row: &Row) -> Result<AppendReceipt, LedgerError> {
        let ledger = LedgerPath::parse(path)?;
        let slot = self.open_or_create(&ledger).await?;
        let state = slot.get().ok_or_else(|| LedgerError::Corrupt {
            path: ledger.file_in(&self.root),
            detail: "ledger was not opened".to_string(),
        })?;

        let row_total: i64 = row.marks.iter().map(|&m| m as i64).sum();
        let recorded_at = OffsetDateTime::now_utc();
        let recorded_text = recorded_at.format(&Rfc3339).map_err(|e| LedgerError::Corrupt {
            path: state.file().to_path_buf(),
            detail: format!("cannot format timestamp: {e}"),
        })?;

        let _writer = state.lock_writer().await;
        let err = |e: sqlx::Error| state.persistence_error(e);
        let mut tx = state.pool().begin().await.map_err(err)?;

        let sequence_id = sqlx::query("INSERT INTO ledger_entry (recorded_at, row_total) VALUES ($1, $2)")
            .bind(&recorded_text)
            .bind(row_total)
            .execute(&mut *tx)
            .await
            .map_err(err)?
            .last_insert_rowid();

        for (position, &digit) in row.marks.iter().enumerate() {
            sqlx::query("INSERT INTO ledger_mark (entry_id, position, digit) VALUES ($1, $2, $3)")
                .bind(sequence_id)
                .bind(position as i64)
                .bind(digit as i64)
                .execute(&mut *tx)
                .await
                .map_err(err)?;
        }

        let grand_total: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(row_total), 0) FROM ledger_entry")
                .fetch_one(&mut *tx)
                .await
                .map_err(err)?;
        tx.commit().await.map_err(err)?;

        info!(
            ledger = ledger.as_str(),
            sequence_id,
            row_total,
            grand_total,
            "Row appended"
        );
        Ok(AppendReceipt {
            entry: LedgerEntry {
                sequence_id,
                recorded_at,
                row: Row::from_marks(row.marks.clone()),
            },
            grand_total: grand_total as u64,
        })
    }

    /// Sum of every row total in the ledger; 0 for a ledger that does not
    /// exist yet. Never creates anything.
    pub async fn grand_total(&self, path: &str) -> Result<u64, LedgerError> {
        let ledger = LedgerPath::parse(path)?;
        let Some(slot) = self.open_existing(&ledger).await? else {
            return Ok(0);
        };
        let Some(state) = slot.get() else {
            return Ok(0);
        };
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(row_total), 0) FROM ledger_entry")
            .fetch_one(state.pool())
            .await
            .map_err(|e| state.persistence_error(e))?;
        Ok(total as u64)
    }

    /// Every entry in sequence order; empty for a ledger that does not exist.
    pub async fn entries(&self, path: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let ledger = LedgerPath::parse(path)?;
        let Some(slot) = self.open_existing(&ledger).await? else {
            return Ok(Vec::new());
        };
        let Some(state) = slot.get() else {
            return Ok(Vec::new());
        };
        let err = |e: sqlx::Error| state.persistence_error(e);
        let corrupt = |detail: String| LedgerError::Corrupt {
            path: state.file().to_path_buf(),
            detail,
        };

        // One read transaction, so entries and marks come from the same
        // snapshot even while appends land.
        let mut tx = state.pool().begin().await.map_err(err)?;
        let entry_rows = sqlx::query("SELECT id, recorded_at FROM ledger_entry ORDER BY id")
            .fetch_all(&mut *tx)
            .await
            .map_err(err)?;
        let mark_rows =
            sqlx::query("SELECT entry_id, digit FROM ledger_mark ORDER BY entry_id, position")
                .fetch_all(&mut *tx)
                .await
                .map_err(err)?;
        tx.commit().await.map_err(err)?;

        let mut marks: HashMap<i64, Vec<u8>> = HashMap::new();
        for mark in mark_rows {
            let entry_id: i64 = mark.try_get("entry_id").map_err(err)?;
            let digit: i64 = mark.try_get("digit").map_err(err)?;
            let digit = u8::try_from(digit)
                .ok()
                .filter(|d| *d <= 9)
                .ok_or_else(|| corrupt(format!("entry {entry_id} has mark {digit}")))?;
            marks.entry(entry_id).or_default().push(digit);
        }

        let mut entries = Vec::with_capacity(entry_rows.len());
        for entry in entry_rows {
            let sequence_id: i64 = entry.try_get("id").map_err(err)?;
            let recorded_text: String = entry.try_get("recorded_at").map_err(err)?;
            let recorded_at = OffsetDateTime::parse(&recorded_text, &Rfc3339)
                .map_err(|e| corrupt(format!("entry {sequence_id} timestamp: {e}")))?;
            entries.push(LedgerEntry {
                sequence_id,
                recorded_at,
                row: Row::from_marks(marks.remove(&sequence_id).unwrap_or_default()),
            });
        }
        Ok(entries)
    }

    /// Spreadsheet view of the ledger: `Timestamp,Q1..Qn,Total`, one line per
    /// entry, where `n` is the widest row. Shorter rows leave trailing mark
    /// columns empty.
    pub async fn export_csv(&self, path: &str) -> Result<String, LedgerError> {
        let entries = self.entries(path).await?;
        let width = entries.iter().map(|e| e.row.marks.len()).max().unwrap_or(0);

        let mut header = vec!["Timestamp".to_string()];
        header.extend((1..=width).map(|i| format!("Q{i}")));
        header.push("Total".to_string());

        let mut out = header.join(",");
        out.push('\n');
        for entry in &entries {
            let timestamp = entry
                .recorded_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| entry.recorded_at.unix_timestamp().to_string());
            let mut fields = vec![timestamp];
            for i in 0..width {
                fields.push(entry.row.marks.get(i).map(u8::to_string).unwrap_or_default());
            }
            fields.push(entry.row.total.to_string());
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        Ok(out)
    }

    /// Close every open ledger. Later calls reopen on demand.
    pub async fn close(&self) {
        let slots: Vec<Slot> = self.slots().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(state) = slot.get() {
                state.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_of_missing_ledgers_keep_no_slots() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = LedgerStore::new(dir.path());

        for i in 0..200 {
            assert_eq!(store.grand_total(&format!("never-{i}.xlsx")).await.expect("total"), 0);
            assert!(store.entries(&format!("never-{i}.xlsx")).await.expect("entries").is_empty());
        }
        assert_eq!(store.slots().len(), 0);

        store.append("marks.xlsx", &Row::from_marks(vec![3])).await.expect("append");
        assert_eq!(store.grand_total("marks.xlsx").await.expect("total"), 3);
        assert_eq!(store.slots().len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn failed_open_does_not_keep_a_slot() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(
            dir.path().join("broken.xlsx.sqlite"),
            "this is a spreadsheet, honest. ".repeat(64),
        )
        .expect("write");
        let store = LedgerStore::new(dir.path());

        assert!(store.grand_total("broken.xlsx").await.is_err());
        assert!(store.append("broken.xlsx", &Row::from_marks(vec![1])).await.is_err());
        assert_eq!(store.slots().len(), 0);
    }
}
