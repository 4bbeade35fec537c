use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, Table,
    TableDefinition,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::access_log::AccessLogEntry;
use super::model::{SecretMetadata, SecretPayload};
use super::SecretStore;

const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("secret_metadata");
const PAYLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("secret_payload");
const ACCESS_LOGS: TableDefinition<u64, &[u8]> = TableDefinition::new("secret_access_logs");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
/// `(expires_at, id)` for every active secret, oldest expiry first.
const EXPIRY_INDEX: TableDefinition<(i64, &str), ()> = TableDefinition::new("active_expiry");
const OWNER_SECRETS: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("owner_secrets");
const SECRET_LOGS: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("secret_log_ids");
const ACCESS_LOG_SEQ_KEY: &str = "access_log_seq";

/// Leading byte of every stored record, so the layout can evolve later.
const RECORD_FORMAT_V1: u8 = 0x01;

/// Thread-safe handle to the redb store.
///
/// redb serializes write transactions, so every read-modify-write below is
/// atomic with respect to every other writer in the process.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(METADATA)?;
        write_txn.open_table(PAYLOADS)?;
        write_txn.open_table(ACCESS_LOGS)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.open_multimap_table(OWNER_SECRETS)?;
        write_txn.open_multimap_table(SECRET_LOGS)?;
        {
            let metas = write_txn.open_table(METADATA)?;
            let mut index = write_txn.open_table(EXPIRY_INDEX)?;
            // Databases written before the index existed get it built once.
            if index.first()?.is_none() {
                let mut rebuilt = 0usize;
                for item in metas.iter()? {
                    let (_k, v) = item?;
                    let meta: SecretMetadata = decode(v.value())?;
                    if meta.is_active {
                        index.insert((meta.expires_at, meta.id.as_str()), ())?;
                        rebuilt += 1;
                    }
                }
                if rebuilt > 0 {
                    debug!(rebuilt, "built expiry index");
                }
            }
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Read-modify-write one metadata row inside a single write transaction.
    /// `f` reports whether it changed the record; unchanged records are not rewritten.
    /// Returns `None` when the id is unknown.
    fn modify_metadata<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut SecretMetadata) -> (bool, R),
    ) -> Result<Option<R>> {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(METADATA)?;

            // Copy out so the AccessGuard is dropped before the insert.
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => None,
                Some(bytes) => {
                    let mut meta: SecretMetadata = decode(&bytes)?;
                    let before = meta.clone();
                    let (changed, out) = f(&mut meta);
                    if changed {
                        meta.normalize();
                        let updated = encode(&meta)?;
                        table.insert(id, updated.as_slice())?;
                        let mut index = write_txn.open_table(EXPIRY_INDEX)?;
                        reindex_expiry(&mut index, Some(&before), &meta)?;
                    }
                    Some(out)
                }
            }
        };
        write_txn.commit()?;
        Ok(result)
    }

    #[cfg(test)]
    pub(crate) fn expiry_index(&self) -> Result<Vec<(i64, String)>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(EXPIRY_INDEX)?;
        let mut entries = Vec::new();
        for item in index.iter()? {
            let (key, _) = item?;
            let (expires_at, id) = key.value();
            entries.push((expires_at, id.to_owned()));
        }
        Ok(entries)
    }

    /// Remove a payload row, leaving its metadata behind.
    #[cfg(test)]
    pub(crate) fn drop_payload(&self, id: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PAYLOADS)?;
            table.remove(id)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl SecretStore for Store {
    fn create(&self, metadata: &SecretMetadata, payload: &SecretPayload) -> Result<()> {
        if metadata.id != payload.id {
            anyhow::bail!(
                "metadata id {} and payload id {} differ",
                metadata.id,
                payload.id
            );
        }
        let meta_bytes = encode(metadata)?;
        let payload_bytes = encode(payload)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut metas = write_txn.open_table(METADATA)?;
            if metas.get(metadata.id.as_str())?.is_some() {
                anyhow::bail!("secret id already exists: {}", metadata.id);
            }
            metas.insert(metadata.id.as_str(), meta_bytes.as_slice())?;

            let mut index = write_txn.open_table(EXPIRY_INDEX)?;
            reindex_expiry(&mut index, None, metadata)?;

            let mut payloads = write_txn.open_table(PAYLOADS)?;
            payloads.insert(payload.id.as_str(), payload_bytes.as_slice())?;

            if let Some(ref owner) = metadata.owner_id {
                let mut owners = write_txn.open_multimap_table(OWNER_SECRETS)?;
                owners.insert(owner.as_str(), metadata.id.as_str())?;
            }
        }
        write_txn.commit()?;

        debug!(id = %metadata.id, "stored secret");
        Ok(())
    }

    fn find_metadata(&self, id: &str) -> Result<Option<SecretMetadata>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(METADATA)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn find_payload(&self, id: &str) -> Result<Option<SecretPayload>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAYLOADS)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn save(&self, metadata: &SecretMetadata) -> Result<()> {
        let mut meta = metadata.clone();
        meta.normalize();
        let bytes = encode(&meta)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(METADATA)?;
            let raw_bytes: Option<Vec<u8>> = table
                .get(meta.id.as_str())?
                .map(|guard| guard.value().to_vec());
            let Some(raw_bytes) = raw_bytes else {
                anyhow::bail!("cannot save unknown secret: {}", meta.id);
            };
            let before: SecretMetadata = decode(&raw_bytes)?;
            table.insert(meta.id.as_str(), bytes.as_slice())?;

            let mut index = write_txn.open_table(EXPIRY_INDEX)?;
            reindex_expiry(&mut index, Some(&before), &meta)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn soft_delete(&self, id: &str) -> Result<bool> {
        let found = self.modify_metadata(id, |meta| {
            let changed = !meta.is_deleted || meta.is_active;
            meta.is_deleted = true;
            meta.is_active = false;
            (changed, ())
        })?;
        Ok(found.is_some())
    }

    fn spend_view(&self, id: &str) -> Result<Option<u32>> {
        let spent = self.modify_metadata(id, |meta| {
            if meta.views_left == 0 {
                let changed = meta.is_active;
                meta.is_active = false;
                (changed, None)
            } else {
                meta.views_left -= 1;
                (true, Some(meta.views_left))
            }
        })?;
        Ok(spent.flatten())
    }

    fn record_views_left(&self, id: &str, remaining: u32) -> Result<()> {
        self.modify_metadata(id, |meta| {
            let lowered = remaining < meta.views_left;
            if lowered {
                meta.views_left = remaining;
            }
            (lowered || (meta.views_left == 0 && meta.is_active), ())
        })?;
        Ok(())
    }

    fn deactivate(&self, id: &str) -> Result<()> {
        self.modify_metadata(id, |meta| (std::mem::replace(&mut meta.is_active, false), ()))?;
        Ok(())
    }

    fn expire_now(&self, id: &str, now: i64) -> Result<Option<SecretMetadata>> {
        self.modify_metadata(id, |meta| {
            let moved = meta.expires_at != now;
            meta.expires_at = now;
            let was_active = std::mem::replace(&mut meta.is_active, false);
            (moved || was_active, meta.clone())
        })
    }

    fn deactivate_expired(&self, now: i64, limit: usize) -> Result<usize> {
        if limit == 0 {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        let count = {
            let mut table = write_txn.open_table(METADATA)?;
            let mut index = write_txn.open_table(EXPIRY_INDEX)?;

            // Every key below (now, "") has expires_at < now.
            let mut due: Vec<(i64, String)> = Vec::new();
            for item in index.range(..(now, ""))?.take(limit) {
                let (key, _) = item?;
                let (expires_at, id) = key.value();
                due.push((expires_at, id.to_owned()));
            }

            let mut count = 0;
            for (expires_at, id) in &due {
                index.remove((*expires_at, id.as_str()))?;

                let raw_bytes: Option<Vec<u8>> =
                    table.get(id.as_str())?.map(|guard| guard.value().to_vec());
                let Some(raw_bytes) = raw_bytes else {
                    continue;
                };
                let mut meta: SecretMetadata = decode(&raw_bytes)?;
                if meta.is_active && meta.expires_at < now {
                    meta.is_active = false;
                    let bytes = encode(&meta)?;
                    table.insert(id.as_str(), bytes.as_slice())?;
                    debug!(id = %id, "deactivated expired secret");
                    count += 1;
                }
            }
            count
        };
        write_txn.commit()?;
        Ok(count)
    }

    fn update_password_hash(&self, id: &str, password_hash: Option<String>) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut payloads = write_txn.open_table(PAYLOADS)?;
            let raw_payload: Option<Vec<u8>> =
                payloads.get(id)?.map(|guard| guard.value().to_vec());

            match raw_payload {
                None => false,
                Some(bytes) => {
                    let mut payload: SecretPayload = decode(&bytes)?;
                    let protected = password_hash.is_some();
                    payload.password_hash = password_hash;
                    let encoded = encode(&payload)?;
                    payloads.insert(id, encoded.as_slice())?;

                    let mut metas = write_txn.open_table(METADATA)?;
                    let raw_meta: Option<Vec<u8>> =
                        metas.get(id)?.map(|guard| guard.value().to_vec());
                    if let Some(bytes) = raw_meta {
                        let mut meta: SecretMetadata = decode(&bytes)?;
                        meta.password_protected = protected;
                        let encoded = encode(&meta)?;
                        metas.insert(id, encoded.as_slice())?;
                    }
                    true
                }
            }
        };
        write_txn.commit()?;
        Ok(updated)
    }

    fn list_owned(
        &self,
        owner_id: &str,
        page: usize,
        size: usize,
        only_active: bool,
    ) -> Result<Vec<SecretMetadata>> {
        let read_txn = self.db.begin_read()?;
        let owners = read_txn.open_multimap_table(OWNER_SECRETS)?;
        let table = read_txn.open_table(METADATA)?;

        let mut metas = Vec::new();
        for id in owners.get(owner_id)? {
            let id = id?;
            if let Some(guard) = table.get(id.value())? {
                let meta: SecretMetadata = decode(guard.value())?;
                if !only_active || meta.is_active {
                    metas.push(meta);
                }
            }
        }

        metas.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(metas
            .into_iter()
            .skip(page.saturating_mul(size))
            .take(size)
            .collect())
    }

    fn append_access_log(&self, mut entry: AccessLogEntry) -> Result<Option<u64>> {
        let write_txn = self.db.begin_write()?;
        let id = {
            let metas = write_txn.open_table(METADATA)?;
            if metas.get(entry.secret_id.as_str())?.is_none() {
                None
            } else {
                let mut counters = write_txn.open_table(COUNTERS)?;
                let seq = counters
                    .get(ACCESS_LOG_SEQ_KEY)?
                    .map(|g| g.value())
                    .unwrap_or(0)
                    + 1;
                counters.insert(ACCESS_LOG_SEQ_KEY, seq)?;
                entry.id = seq;

                let bytes = encode(&entry)?;
                let mut logs = write_txn.open_table(ACCESS_LOGS)?;
                logs.insert(seq, bytes.as_slice())?;

                let mut index = write_txn.open_multimap_table(SECRET_LOGS)?;
                index.insert(entry.secret_id.as_str(), seq)?;
                Some(seq)
            }
        };
        write_txn.commit()?;

        if id.is_none() {
            debug!(secret_id = %entry.secret_id, "secret not found, skipping access log");
        }
        Ok(id)
    }

    fn list_access_logs(
        &self,
        secret_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Vec<AccessLogEntry>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_multimap_table(SECRET_LOGS)?;
        let logs = read_txn.open_table(ACCESS_LOGS)?;

        let mut ids: Vec<u64> = Vec::new();
        for id in index.get(secret_id)? {
            ids.push(id?.value());
        }
        // Sequence ids are monotonic and multimap values sort ascending.
        ids.reverse();

        let mut entries = Vec::new();
        for id in ids.into_iter().skip(page.saturating_mul(size)).take(size) {
            if let Some(guard) = logs.get(id)? {
                entries.push(decode(guard.value())?);
            }
        }
        Ok(entries)
    }
}

/// Keep `EXPIRY_INDEX` in step with one metadata write: only active
/// secrets are indexed, under their current expiry.
fn reindex_expiry(
    index: &mut Table<(i64, &'static str), ()>,
    before: Option<&SecretMetadata>,
    after: &SecretMetadata,
) -> Result<()> {
    if let Some(before) = before.filter(|b| b.is_active) {
        index.remove((before.expires_at, before.id.as_str()))?;
    }
    if after.is_active {
        index.insert((after.expires_at, after.id.as_str()), ())?;
    }
    Ok(())
}

fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    let body = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(RECORD_FORMAT_V1);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match bytes.split_first() {
        Some((&RECORD_FORMAT_V1, body)) => {
            let (record, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())
                .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format {marker:#04x}"),
        None => anyhow::bail!("empty record"),
    }
}
