//! PostgreSQL store

use super::{BridgeTxStore, CommitStore, LedgerStore, SnapshotStore};
use crate::config::StoreConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{BridgeSnapshot, BridgeTx, BridgeTxType, ChainRange, LedgerEntry, ZERO_ROOT};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

/// Snapshots, ledgers and bridge records in PostgreSQL
pub struct PgStore {
    pool: PgPool,
}

fn h256(bytes: Vec<u8>) -> BridgeResult<H256> {
    if bytes.len() != 32 {
        return Err(BridgeError::Internal(format!(
            "expected 32-byte hash, got {} bytes",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(&bytes))
}

fn address(bytes: Vec<u8>) -> BridgeResult<Address> {
    if bytes.len() != 20 {
        return Err(BridgeError::Internal(format!(
            "expected 20-byte address, got {} bytes",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(&bytes))
}

fn amount(text: String) -> BridgeResult<U256> {
    U256::from_dec_str(&text).map_err(|e| BridgeError::Internal(format!("bad amount {}: {}", text, e)))
}

fn snapshot_from_row(row: &PgRow) -> BridgeResult<BridgeSnapshot> {
    let chains: serde_json::Value = row.try_get("chains")?;
    let chains: [ChainRange; 2] = serde_json::from_value(chains)?;
    Ok(BridgeSnapshot {
        parent_merkle_root: h256(row.try_get("parent_root")?)?,
        merkle_root: h256(row.try_get("merkle_root")?)?,
        chains,
    })
}

fn entry_from_row(row: &PgRow) -> BridgeResult<LedgerEntry> {
    Ok(LedgerEntry {
        snapshot_id: Some(row.try_get::<i64, _>("snapshot_id")? as u64),
        ledger_id: Some(row.try_get::<i64, _>("id")? as u64),
        merkle_root: h256(row.try_get("merkle_root")?)?,
        chain_name: row.try_get("chain_name")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        account: address(row.try_get("account")?)?,
        token: address(row.try_get("token")?)?,
        balance: amount(row.try_get("balance")?)?,
        valid: row.try_get("valid")?,
    })
}

fn tx_from_row(row: &PgRow) -> BridgeResult<BridgeTx> {
    let tx_type: String = row.try_get("tx_type")?;
    let tx_type = match tx_type.as_str() {
        "swap" => BridgeTxType::Swap,
        "claim" => BridgeTxType::Claim,
        other => {
            return Err(BridgeError::Internal(format!("unknown bridge tx type {}", other)));
        }
    };

    Ok(BridgeTx {
        bridge_tx_id: h256(row.try_get("bridge_tx_id")?)?,
        chain_name: row.try_get("chain_name")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_id: h256(row.try_get("block_id")?)?,
        txid: h256(row.try_get("txid")?)?,
        token: address(row.try_get("token")?)?,
        amount: amount(row.try_get("amount")?)?,
        recipient: address(row.try_get("recipient")?)?,
        sender: address(row.try_get("sender")?)?,
        reward: amount(row.try_get("reward")?)?,
        amount_out: amount(row.try_get("amount_out")?)?,
        swap_count: amount(row.try_get("swap_count")?)?,
        tx_type,
        swap_tx_hash: h256(row.try_get("swap_tx_hash")?)?,
    })
}

impl PgStore {
    pub async fn new(config: &StoreConfig) -> BridgeResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables and indexes
    pub async fn run_migrations(&self) -> BridgeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_snapshots (
                id BIGSERIAL PRIMARY KEY,
                merkle_root BYTEA NOT NULL UNIQUE,
                parent_root BYTEA NOT NULL,
                chains JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshot_ranges (
                snapshot_id BIGINT NOT NULL REFERENCES bridge_snapshots (id),
                chain_id BIGINT NOT NULL,
                begin_block BIGINT NOT NULL,
                locked_block BIGINT NOT NULL,
                end_block BIGINT NOT NULL,
                PRIMARY KEY (snapshot_id, chain_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ranges_chain_block
            ON snapshot_ranges (chain_id, begin_block, end_block)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledgers (
                merkle_root BYTEA PRIMARY KEY,
                snapshot_id BIGINT NOT NULL REFERENCES bridge_snapshots (id),
                saved_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id BIGSERIAL PRIMARY KEY,
                snapshot_id BIGINT NOT NULL REFERENCES bridge_snapshots (id),
                merkle_root BYTEA NOT NULL,
                chain_name VARCHAR(64) NOT NULL,
                chain_id BIGINT NOT NULL,
                account BYTEA NOT NULL,
                token BYTEA NOT NULL,
                balance TEXT NOT NULL,
                valid BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_entries_root
            ON ledger_entries (merkle_root)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_txs (
                seq BIGSERIAL,
                bridge_tx_id BYTEA PRIMARY KEY,
                chain_name VARCHAR(64) NOT NULL,
                chain_id BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                block_id BYTEA NOT NULL,
                txid BYTEA NOT NULL,
                token BYTEA NOT NULL,
                amount TEXT NOT NULL,
                recipient BYTEA NOT NULL,
                sender BYTEA NOT NULL,
                reward TEXT NOT NULL,
                amount_out TEXT NOT NULL,
                swap_count TEXT NOT NULL,
                tx_type VARCHAR(10) NOT NULL,
                swap_tx_hash BYTEA NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bridge_txs_chain_block
            ON bridge_txs (chain_id, block_number)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bridge_txs_swap_hash
            ON bridge_txs (swap_tx_hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    pub async fn health_check(&self) -> BridgeResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn snapshot_id(conn: &mut PgConnection, root: H256) -> BridgeResult<Option<i64>> {
    let row = sqlx::query("SELECT id FROM bridge_snapshots WHERE merkle_root = $1")
        .bind(root.as_bytes())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.get::<i64, _>("id")))
}

/// Insert `snapshot` unless an identical one is stored, returns its id
async fn insert_snapshot(conn: &mut PgConnection, snapshot: &BridgeSnapshot) -> BridgeResult<i64> {
    if !snapshot.is_computed() {
        return Err(BridgeError::Internal(
            "refusing to persist a snapshot without root".to_string(),
        ));
    }

    let existing = sqlx::query(
        "SELECT id, merkle_root, parent_root, chains FROM bridge_snapshots WHERE merkle_root = $1",
    )
    .bind(snapshot.merkle_root.as_bytes())
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = existing {
        if snapshot_from_row(&row)? != *snapshot {
            return Err(BridgeError::SnapshotConflict {
                root: snapshot.merkle_root,
            });
        }
        return Ok(row.try_get("id")?);
    }
    if snapshot.parent_merkle_root != ZERO_ROOT
        && snapshot_id(conn, snapshot.parent_merkle_root).await?.is_none()
    {
        return Err(BridgeError::MissingSnapshot {
            root: snapshot.parent_merkle_root,
        });
    }

    let row = sqlx::query(
        r#"
        INSERT INTO bridge_snapshots (merkle_root, parent_root, chains)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(snapshot.merkle_root.as_bytes())
    .bind(snapshot.parent_merkle_root.as_bytes())
    .bind(serde_json::to_value(&snapshot.chains)?)
    .fetch_one(&mut *conn)
    .await?;
    let id: i64 = row.get("id");

    for range in &snapshot.chains {
        sqlx::query(
            r#"
            INSERT INTO snapshot_ranges (snapshot_id, chain_id, begin_block, locked_block, end_block)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(range.chain_id as i64)
        .bind(range.begin_block_num as i64)
        .bind(range.locked_block_num as i64)
        .bind(range.end_block_num as i64)
        .execute(&mut *conn)
        .await?;
    }

    debug!("Stored snapshot {} with root {:?}", id, snapshot.merkle_root);
    Ok(id)
}

/// Insert the rows of `root` unless its ledger is stored already
async fn insert_ledger(
    conn: &mut PgConnection,
    root: H256,
    entries: &[LedgerEntry],
) -> BridgeResult<usize> {
    let snapshot_id = snapshot_id(conn, root)
        .await?
        .ok_or(BridgeError::MissingSnapshot { root })?;

    let marked = sqlx::query(
        r#"
        INSERT INTO ledgers (merkle_root, snapshot_id)
        VALUES ($1, $2)
        ON CONFLICT (merkle_root) DO NOTHING
        "#,
    )
    .bind(root.as_bytes())
    .bind(snapshot_id)
    .execute(&mut *conn)
    .await?;
    if marked.rows_affected() == 0 {
        return Ok(0);
    }

    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (snapshot_id, merkle_root, chain_name, chain_id, account, token, balance, valid)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(snapshot_id)
        .bind(root.as_bytes())
        .bind(&entry.chain_name)
        .bind(entry.chain_id as i64)
        .bind(entry.account.as_bytes())
        .bind(entry.token.as_bytes())
        .bind(entry.balance.to_string())
        .bind(entry.valid)
        .execute(&mut *conn)
        .await?;
    }

    debug!("Stored {} ledger rows for root {:?}", entries.len(), root);
    Ok(entries.len())
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn save(&self, snapshot: &BridgeSnapshot) -> BridgeResult<u64> {
        let mut tx = self.pool.begin().await?;
        let id = insert_snapshot(&mut tx, snapshot).await?;
        tx.commit().await?;
        Ok(id as u64)
    }

    async fn get_by_root(&self, root: H256) -> BridgeResult<Option<BridgeSnapshot>> {
        let row = sqlx::query(
            "SELECT merkle_root, parent_root, chains FROM bridge_snapshots WHERE merkle_root = $1",
        )
        .bind(root.as_bytes())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn get_last(&self) -> BridgeResult<Option<BridgeSnapshot>> {
        let row = sqlx::query(
            "SELECT merkle_root, parent_root, chains FROM bridge_snapshots ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn get_by_block(&self, chain_id: u64, block: u64) -> BridgeResult<Option<BridgeSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT s.merkle_root, s.parent_root, s.chains
            FROM bridge_snapshots s
            JOIN snapshot_ranges r ON r.snapshot_id = s.id
            WHERE r.chain_id = $1 AND r.begin_block <= $2 AND r.end_block >= $2
            ORDER BY s.id
            LIMIT 1
            "#,
        )
        .bind(chain_id as i64)
        .bind(block as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn save(&self, root: H256, entries: &[LedgerEntry]) -> BridgeResult<usize> {
        let mut tx = self.pool.begin().await?;
        let rows = insert_ledger(&mut tx, root, entries).await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn load(&self, root: H256) -> BridgeResult<Option<Vec<LedgerEntry>>> {
        let saved = sqlx::query("SELECT 1 FROM ledgers WHERE merkle_root = $1")
            .bind(root.as_bytes())
            .fetch_optional(&self.pool)
            .await?;
        if saved.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query(
            r#"
            SELECT id, snapshot_id, merkle_root, chain_name, chain_id, account, token, balance, valid
            FROM ledger_entries
            WHERE merkle_root = $1 AND valid
            ORDER BY id
            "#,
        )
        .bind(root.as_bytes())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect::<BridgeResult<Vec<_>>>().map(Some)
    }

    async fn invalidate(&self, root: H256) -> BridgeResult<usize> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET valid = FALSE WHERE merkle_root = $1 AND valid",
        )
        .bind(root.as_bytes())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl BridgeTxStore for PgStore {
    async fn save(&self, txs: &[BridgeTx]) -> BridgeResult<usize> {
        let mut inserted = 0;
        let mut db_tx = self.pool.begin().await?;
        for tx in txs {
            let result = sqlx::query(
                r#"
                INSERT INTO bridge_txs
                    (bridge_tx_id, chain_name, chain_id, block_number, block_id, txid, token,
                     amount, recipient, sender, reward, amount_out, swap_count, tx_type, swap_tx_hash)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (bridge_tx_id) DO NOTHING
                "#,
            )
            .bind(tx.bridge_tx_id.as_bytes())
            .bind(&tx.chain_name)
            .bind(tx.chain_id as i64)
            .bind(tx.block_number as i64)
            .bind(tx.block_id.as_bytes())
            .bind(tx.txid.as_bytes())
            .bind(tx.token.as_bytes())
            .bind(tx.amount.to_string())
            .bind(tx.recipient.as_bytes())
            .bind(tx.sender.as_bytes())
            .bind(tx.reward.to_string())
            .bind(tx.amount_out.to_string())
            .bind(tx.swap_count.to_string())
            .bind(tx.tx_type.as_str())
            .bind(tx.swap_tx_hash.as_bytes())
            .execute(&mut *db_tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        db_tx.commit().await?;
        Ok(inserted)
    }

    async fn get_range(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<BridgeTx>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bridge_txs
            WHERE chain_id = $1 AND block_number BETWEEN $2 AND $3
            ORDER BY block_number, seq
            "#,
        )
        .bind(chain_id as i64)
        .bind(from_block as i64)
        .bind(to_block as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tx_from_row).collect()
    }

    async fn remove_from(&self, chain_id: u64, block: u64) -> BridgeResult<usize> {
        let result = sqlx::query("DELETE FROM bridge_txs WHERE chain_id = $1 AND block_number >= $2")
            .bind(chain_id as i64)
            .bind(block as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_claims(&self, swap_tx_hash: H256) -> BridgeResult<Vec<BridgeTx>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bridge_txs
            WHERE swap_tx_hash = $1 AND tx_type = 'claim'
            ORDER BY chain_id, block_number, seq
            "#,
        )
        .bind(swap_tx_hash.as_bytes())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tx_from_row).collect()
    }
}

#[async_trait]
impl CommitStore for PgStore {
    async fn save_commit(
        &self,
        snapshot: &BridgeSnapshot,
        entries: &[LedgerEntry],
    ) -> BridgeResult<(u64, usize)> {
        let mut tx = self.pool.begin().await?;
        let id = insert_snapshot(&mut tx, snapshot).await?;
        let rows = insert_ledger(&mut tx, snapshot.merkle_root, entries).await?;
        tx.commit().await?;
        Ok((id as u64, rows))
    }
}
