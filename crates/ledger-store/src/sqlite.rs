//! SQLite-backed store

use crate::{check_commit_target, check_mutation_update};
use ledger_domain::traits::{
    Catalog, ClaimFilter, ClaimStore, CommitBatch, CommitReceipt, ConflictFilter, ConflictLedger, MutationLog,
};
use ledger_domain::{
    Claim, ClaimId, Conflict, ConflictId, Constraint, ConstraintId, Lens, LensKey, Mutation, MutationId,
    MutationStatus, Organism, OrganismId, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

trait SqlResultExt<T> {
    fn backend(self) -> Result<T, StoreError>;
}

impl<T> SqlResultExt<T> for Result<T, rusqlite::Error> {
    fn backend(self) -> Result<T, StoreError> {
        self.map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn id_bytes(value: u128) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn bytes_to_u128(bytes: &[u8]) -> Result<u128, StoreError> {
    let arr: [u8; 16] = bytes
        .try_into()
        .map_err(|_| StoreError::InvalidData(format!("Expected 16 bytes for id, got {}", bytes.len())))?;
    Ok(u128::from_be_bytes(arr))
}

fn encode<T: Serialize>(record: &T) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::InvalidData(e.to_string()))
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::InvalidData(e.to_string()))
}

fn decode_all<T: DeserializeOwned>(bodies: Vec<String>) -> Result<Vec<T>, StoreError> {
    bodies.iter().map(|b| decode(b)).collect()
}

/// SQLite implementation of every store trait
///
/// The connection sits behind a `Mutex`, so the store is `Send + Sync` and a
/// commit batch runs inside one SQLite transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database at `path`
    ///
    /// Use `:memory:` for an in-memory database (useful for testing).
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).backend()?;
        let store = Self { conn: Mutex::new(conn) };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an in-memory database
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let schema = include_str!("schema.sql");
        self.lock()?.execute_batch(schema).backend()?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn query_bodies(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<String>, StoreError> {
        let mut stmt = conn.prepare(sql).backend()?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, String>(0))
            .backend()?
            .collect::<Result<Vec<_>, _>>()
            .backend()?;
        Ok(rows)
    }

    fn query_body(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Option<String>, StoreError> {
        conn.query_row(sql, params, |row| row.get::<_, String>(0))
            .optional()
            .backend()
    }

    fn mutation_in(conn: &Connection, id: MutationId) -> Result<Option<Mutation>, StoreError> {
        Self::query_body(conn, "SELECT body FROM mutations WHERE id = ?1", &[&id_bytes(id.value())])?
            .map(|b| decode(&b))
            .transpose()
    }

    fn claim_version(tx: &Transaction<'_>, id: ClaimId) -> Result<Option<u64>, StoreError> {
        tx.query_row(
            "SELECT version FROM claims WHERE id = ?1",
            params![id_bytes(id.value())],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .backend()
        .map(|v| v.map(|v| v as u64))
    }

    fn lens_holder(tx: &Transaction<'_>, claim: &Claim) -> Result<Option<(ClaimId, u64)>, StoreError> {
        tx.query_row(
            "SELECT id, version FROM claims WHERE organism_id = ?1 AND lens_key = ?2",
            params![id_bytes(claim.organism_id.value()), claim.lens.to_string()],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .backend()?
        .map(|(bytes, version)| Ok((ClaimId::from_value(bytes_to_u128(&bytes)?), version as u64)))
        .transpose()
    }

    fn upsert_mutation(conn: &Connection, mutation: &Mutation, chain_seq: Option<i64>) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO mutations (id, organism_id, status, chain_seq, created_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             chain_seq = COALESCE(excluded.chain_seq, mutations.chain_seq),
             body = excluded.body",
            params![
                id_bytes(mutation.id.value()),
                id_bytes(mutation.organism_id.value()),
                mutation.status.as_str(),
                chain_seq,
                mutation.created_at as i64,
                encode(mutation)?,
            ],
        )
        .backend()?;
        Ok(())
    }
}

impl ClaimStore for SqliteStore {
    fn get_claim(&self, id: ClaimId) -> Result<Option<Claim>, StoreError> {
        let conn = self.lock()?;
        Self::query_body(&conn, "SELECT body FROM claims WHERE id = ?1", &[&id_bytes(id.value())])?
            .map(|b| decode(&b))
            .transpose()
    }

    fn find_claim(&self, organism_id: OrganismId, lens: &LensKey) -> Result<Option<Claim>, StoreError> {
        let conn = self.lock()?;
        Self::query_body(
            &conn,
            "SELECT body FROM claims WHERE organism_id = ?1 AND lens_key = ?2",
            &[&id_bytes(organism_id.value()), &lens.to_string()],
        )?
        .map(|b| decode(&b))
        .transpose()
    }

    fn list_claims(&self, organism_id: OrganismId, filter: &ClaimFilter) -> Result<Vec<Claim>, StoreError> {
        let conn = self.lock()?;
        let mut sql = String::from("SELECT body FROM claims WHERE organism_id = ?");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(id_bytes(organism_id.value()))];

        if !filter.include_deleted {
            sql.push_str(" AND deleted = 0");
        }

        if let Some(cluster) = &filter.cluster {
            sql.push_str(" AND lens_key LIKE ?");
            params.push(Box::new(format!("{}.%", cluster)));
        }

        sql.push_str(" ORDER BY lens_key");

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let bodies = Self::query_bodies(&conn, &sql, &param_refs)?;
        decode_all(bodies)
    }

    fn apply_changes(&self, batch: CommitBatch) -> Result<CommitReceipt, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().backend()?;

        check_commit_target(Self::mutation_in(&tx, batch.mutation.id)?.as_ref(), &batch.mutation)?;

        for write in &batch.writes {
            let claim = &write.claim;
            let current = Self::claim_version(&tx, claim.id)?;
            match (write.expected_version, current) {
                (None, None) => {
                    // Another writer created the lens first
                    if let Some((holder, version)) = Self::lens_holder(&tx, claim)? {
                        return Err(StoreError::VersionConflict {
                            claim_id: holder,
                            current_version: version,
                            expected_version: 0,
                        });
                    }
                }
                (None, Some(_)) => {
                    return Err(StoreError::Duplicate {
                        kind: "claim",
                        id: claim.id.to_string(),
                    })
                }
                (Some(_), None) => {
                    return Err(StoreError::NotFound {
                        kind: "claim",
                        id: claim.id.to_string(),
                    })
                }
                (Some(expected), Some(current)) if expected != current => {
                    return Err(StoreError::VersionConflict {
                        claim_id: claim.id,
                        current_version: current,
                        expected_version: expected,
                    })
                }
                (Some(_), Some(_)) => {}
            }
        }

        let head: Option<(Vec<u8>, i64)> = tx
            .query_row(
                "SELECT mutation_id, chain_seq FROM chain_heads WHERE organism_id = ?1",
                params![id_bytes(batch.organism_id.value())],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .backend()?;

        let mut mutation = batch.mutation;
        let seq = match &head {
            Some((bytes, seq)) => {
                mutation.prev_mutation_id = Some(MutationId::from_value(bytes_to_u128(bytes)?));
                seq + 1
            }
            None => {
                mutation.prev_mutation_id = None;
                1
            }
        };

        let mut claims = Vec::with_capacity(batch.writes.len());
        for write in batch.writes {
            let claim = write.claim;
            let body = encode(&claim)?;
            match write.expected_version {
                None => {
                    tx.execute(
                        "INSERT INTO claims (id, organism_id, lens_key, version, deleted, body)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            id_bytes(claim.id.value()),
                            id_bytes(claim.organism_id.value()),
                            claim.lens.to_string(),
                            claim.version as i64,
                            claim.deleted,
                            body,
                        ],
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                            StoreError::Duplicate {
                                kind: "claim",
                                id: format!("{} ({})", claim.id, claim.lens),
                            }
                        }
                        other => StoreError::Backend(other.to_string()),
                    })?;
                }
                Some(expected) => {
                    let updated = tx
                        .execute(
                            "UPDATE claims SET version = ?1, deleted = ?2, body = ?3
                             WHERE id = ?4 AND version = ?5",
                            params![
                                claim.version as i64,
                                claim.deleted,
                                body,
                                id_bytes(claim.id.value()),
                                expected as i64,
                            ],
                        )
                        .backend()?;
                    if updated != 1 {
                        return Err(StoreError::VersionConflict {
                            claim_id: claim.id,
                            current_version: Self::claim_version(&tx, claim.id)?.unwrap_or_default(),
                            expected_version: expected,
                        });
                    }
                }
            }
            claims.push(claim);
        }

        Self::upsert_mutation(&tx, &mutation, Some(seq))?;
        tx.execute(
            "INSERT INTO chain_heads (organism_id, mutation_id, chain_seq) VALUES (?1, ?2, ?3)
             ON CONFLICT(organism_id) DO UPDATE SET
             mutation_id = excluded.mutation_id, chain_seq = excluded.chain_seq",
            params![id_bytes(batch.organism_id.value()), id_bytes(mutation.id.value()), seq],
        )
        .backend()?;

        tx.commit().backend()?;
        debug!(mutation = %mutation.id, seq, "commit batch written");

        Ok(CommitReceipt { mutation, claims })
    }
}

impl MutationLog for SqliteStore {
    fn put_mutation(&self, mutation: &Mutation) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().backend()?;
        check_mutation_update(Self::mutation_in(&tx, mutation.id)?.as_ref(), mutation)?;
        Self::upsert_mutation(&tx, mutation, None)?;
        tx.commit().backend()
    }

    fn get_mutation(&self, id: MutationId) -> Result<Option<Mutation>, StoreError> {
        let conn = self.lock()?;
        Self::mutation_in(&conn, id)
    }

    fn list_mutations(
        &self,
        organism_id: Option<OrganismId>,
        status: Option<MutationStatus>,
    ) -> Result<Vec<Mutation>, StoreError> {
        let conn = self.lock()?;
        let mut sql = String::from("SELECT body FROM mutations WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(organism_id) = organism_id {
            sql.push_str(" AND organism_id = ?");
            params.push(Box::new(id_bytes(organism_id.value())));
        }

        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            params.push(Box::new(status.as_str()));
        }

        sql.push_str(" ORDER BY id");

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        decode_all(Self::query_bodies(&conn, &sql, &param_refs)?)
    }

    fn chain(&self, organism_id: OrganismId) -> Result<Vec<Mutation>, StoreError> {
        let conn = self.lock()?;
        let bodies = Self::query_bodies(
            &conn,
            "SELECT body FROM mutations WHERE organism_id = ?1 AND chain_seq IS NOT NULL ORDER BY chain_seq",
            &[&id_bytes(organism_id.value())],
        )?;
        decode_all(bodies)
    }

    fn head(&self, organism_id: OrganismId) -> Result<Option<MutationId>, StoreError> {
        let conn = self.lock()?;
        let head: Option<Vec<u8>> = conn
            .query_row(
                "SELECT mutation_id FROM chain_heads WHERE organism_id = ?1",
                params![id_bytes(organism_id.value())],
                |row| row.get(0),
            )
            .optional()
            .backend()?;
        head.map(|bytes| bytes_to_u128(&bytes).map(MutationId::from_value))
            .transpose()
    }
}

impl ConflictLedger for SqliteStore {
    fn put_conflict(&self, conflict: &Conflict) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conflicts (id, organism_id, status, severity, conflict_type, created_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
             status = excluded.status, severity = excluded.severity, body = excluded.body",
            params![
                id_bytes(conflict.id.value()),
                id_bytes(conflict.organism_id.value()),
                conflict.status.as_str(),
                conflict.severity.as_str(),
                conflict.conflict_type.as_str(),
                conflict.created_at as i64,
                encode(conflict)?,
            ],
        )
        .backend()?;
        Ok(())
    }

    fn get_conflict(&self, id: ConflictId) -> Result<Option<Conflict>, StoreError> {
        let conn = self.lock()?;
        Self::query_body(&conn, "SELECT body FROM conflicts WHERE id = ?1", &[&id_bytes(id.value())])?
            .map(|b| decode(&b))
            .transpose()
    }

    fn list_conflicts(&self, filter: &ConflictFilter) -> Result<Vec<Conflict>, StoreError> {
        let conn = self.lock()?;
        let mut sql = String::from("SELECT body FROM conflicts WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(organism_id) = filter.organism_id {
            sql.push_str(" AND organism_id = ?");
            params.push(Box::new(id_bytes(organism_id.value())));
        }

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(severity) = filter.severity {
            sql.push_str(" AND severity = ?");
            params.push(Box::new(severity.as_str()));
        }

        if let Some(conflict_type) = filter.conflict_type {
            sql.push_str(" AND conflict_type = ?");
            params.push(Box::new(conflict_type.as_str()));
        }

        sql.push_str(" ORDER BY id");

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let conflicts: Vec<Conflict> = decode_all(Self::query_bodies(&conn, &sql, &param_refs)?)?;

        // Claim membership lives in the JSON body
        Ok(conflicts.into_iter().filter(|c| filter.matches(c)).collect())
    }
}

impl Catalog for SqliteStore {
    fn put_organism(&self, organism: &Organism) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO organisms (id, created_at, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            params![id_bytes(organism.id.value()), organism.created_at as i64, encode(organism)?],
        )
        .backend()?;
        Ok(())
    }

    fn get_organism(&self, id: OrganismId) -> Result<Option<Organism>, StoreError> {
        let conn = self.lock()?;
        Self::query_body(&conn, "SELECT body FROM organisms WHERE id = ?1", &[&id_bytes(id.value())])?
            .map(|b| decode(&b))
            .transpose()
    }

    fn list_organisms(&self) -> Result<Vec<Organism>, StoreError> {
        let conn = self.lock()?;
        decode_all(Self::query_bodies(&conn, "SELECT body FROM organisms ORDER BY id", &[])?)
    }

    fn put_lens(&self, lens: &Lens) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO lenses (lens_key, body) VALUES (?1, ?2)
             ON CONFLICT(lens_key) DO UPDATE SET body = excluded.body",
            params![lens.key.to_string(), encode(lens)?],
        )
        .backend()?;
        Ok(())
    }

    fn get_lens(&self, key: &LensKey) -> Result<Option<Lens>, StoreError> {
        let conn = self.lock()?;
        Self::query_body(&conn, "SELECT body FROM lenses WHERE lens_key = ?1", &[&key.to_string()])?
            .map(|b| decode(&b))
            .transpose()
    }

    fn list_lenses(&self) -> Result<Vec<Lens>, StoreError> {
        let conn = self.lock()?;
        decode_all(Self::query_bodies(&conn, "SELECT body FROM lenses ORDER BY lens_key", &[])?)
    }

    fn put_constraint(&self, constraint: &Constraint) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO constraints (id, version, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(id, version) DO UPDATE SET body = excluded.body",
            params![id_bytes(constraint.id.value()), constraint.version, encode(constraint)?],
        )
        .backend()?;
        Ok(())
    }

    fn get_constraint(&self, id: ConstraintId) -> Result<Option<Constraint>, StoreError> {
        let conn = self.lock()?;
        Self::query_body(
            &conn,
            "SELECT body FROM constraints WHERE id = ?1 ORDER BY version DESC LIMIT 1",
            &[&id_bytes(id.value())],
        )?
        .map(|b| decode(&b))
        .transpose()
    }

    fn list_constraints(&self) -> Result<Vec<Constraint>, StoreError> {
        let conn = self.lock()?;
        let bodies = Self::query_bodies(
            &conn,
            "SELECT c.body FROM constraints c
             JOIN (SELECT id, MAX(version) AS version FROM constraints GROUP BY id) latest
             ON c.id = latest.id AND c.version = latest.version
             ORDER BY c.id",
            &[],
        )?;
        decode_all(bodies)
    }

    fn constraint_history(&self, id: ConstraintId) -> Result<Vec<Constraint>, StoreError> {
        let conn = self.lock()?;
        let bodies = Self::query_bodies(
            &conn,
            "SELECT body FROM constraints WHERE id = ?1 ORDER BY version",
            &[&id_bytes(id.value())],
        )?;
        decode_all(bodies)
    }
}
