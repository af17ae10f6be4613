//! Persisted desired-state store for NAT rules.
//!
//! The store is the single source of truth for what should be active. A
//! partial unique index on `(host_port, protocol)` over enabled rows closes
//! the check-then-commit race between concurrent creates at the persistence
//! layer; the application-level conflict check exists only for friendlier
//! error messages.

use crate::error::{BridgeError, BridgeResult};
use crate::nat::rule::{NatRule, NewRule, Protocol, RuleUpdate};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::net::IpAddr;
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nat_rules (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    node           TEXT NOT NULL,
    vmid           INTEGER NOT NULL,
    host_port      INTEGER NOT NULL,
    container_port INTEGER NOT NULL,
    protocol       TEXT NOT NULL,
    container_ip   TEXT NOT NULL,
    description    TEXT,
    enabled        INTEGER NOT NULL DEFAULT 1,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_nat_rules_active_endpoint
    ON nat_rules (host_port, protocol) WHERE enabled = 1;
CREATE INDEX IF NOT EXISTS idx_nat_rules_container
    ON nat_rules (node, vmid);
";

pub struct RuleStore {
    conn: Mutex<Connection>,
}

impl RuleStore {
    /// Open (and migrate) the store at the given path.
    pub fn open(path: &Path) -> BridgeResult<Self> {
        let conn = Connection::open(path).map_err(|e| {
            BridgeError::Storage(format!("cannot open database {}: {}", path.display(), e))
        })?;
        Self::init(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> BridgeResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BridgeError::Storage(format!("cannot open in-memory database: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> BridgeResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new rule. The unique index rejects a second enabled rule on
    /// the same (host_port, protocol); that surfaces as `Conflict`.
    pub fn insert(
        &self,
        new: &NewRule,
        container_ip: IpAddr,
        enabled: bool,
    ) -> BridgeResult<NatRule> {
        let now = Utc::now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nat_rules
                (node, vmid, host_port, container_port, protocol, container_ip,
                 description, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                new.node,
                new.vmid,
                new.host_port,
                new.container_port,
                new.protocol,
                container_ip.to_string(),
                new.description,
                enabled,
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.get(id)?
            .ok_or_else(|| BridgeError::Internal(format!("rule {} vanished after insert", id)))
    }

    pub fn get(&self, id: i64) -> BridgeResult<Option<NatRule>> {
        let conn = self.conn.lock();
        let rule = conn
            .query_row(
                "SELECT * FROM nat_rules WHERE id = ?1",
                params![id],
                row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    /// All rules, newest first.
    pub fn list(&self, offset: u32, limit: u32) -> BridgeResult<(Vec<NatRule>, u64)> {
        let conn = self.conn.lock();
        let total: u64 = conn.query_row("SELECT COUNT(*) FROM nat_rules", [], |row| row.get(0))?;
        let mut stmt = conn
            .prepare("SELECT * FROM nat_rules ORDER BY id DESC LIMIT ?1 OFFSET ?2")?;
        let rules = stmt
            .query_map(params![limit, offset], row_to_rule)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((rules, total))
    }

    pub fn list_for_container(&self, node: &str, vmid: u32) -> BridgeResult<Vec<NatRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM nat_rules WHERE node = ?1 AND vmid = ?2 ORDER BY id DESC",
        )?;
        let rules = stmt
            .query_map(params![node, vmid], row_to_rule)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// The desired set: all enabled rules, in stable id order.
    pub fn list_enabled(&self) -> BridgeResult<Vec<NatRule>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM nat_rules WHERE enabled = 1 ORDER BY id ASC")?;
        let rules = stmt
            .query_map([], row_to_rule)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Is (host_port, protocol) already claimed by another enabled rule?
    pub fn has_conflict(
        &self,
        host_port: u16,
        protocol: Protocol,
        exclude_id: Option<i64>,
    ) -> BridgeResult<bool> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM nat_rules
             WHERE host_port = ?1 AND protocol = ?2 AND enabled = 1
               AND id != COALESCE(?3, -1)",
            params![host_port, protocol, exclude_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Apply a partial update and return the persisted rule.
    pub fn update(&self, id: i64, update: &RuleUpdate) -> BridgeResult<NatRule> {
        let current = self
            .get(id)?
            .ok_or_else(|| BridgeError::NotFound(format!("NAT rule {}", id)))?;

        let host_port = update.host_port.unwrap_or(current.host_port);
        let container_port = update.container_port.unwrap_or(current.container_port);
        let protocol = update.protocol.unwrap_or(current.protocol);
        let description = update
            .description
            .clone()
            .or_else(|| current.description.clone());
        let enabled = update.enabled.unwrap_or(current.enabled);

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE nat_rules
             SET host_port = ?2, container_port = ?3, protocol = ?4,
                 description = ?5, enabled = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                id,
                host_port,
                container_port,
                protocol,
                description,
                enabled,
                Utc::now().to_rfc3339(),
            ],
        )?;
        drop(conn);

        self.get(id)?
            .ok_or_else(|| BridgeError::Internal(format!("rule {} vanished during update", id)))
    }

    pub fn set_enabled(&self, id: i64, enabled: bool) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE nat_rules SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, enabled, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(BridgeError::NotFound(format!("NAT rule {}", id)));
        }
        Ok(())
    }

    pub fn set_container_ip(&self, id: i64, ip: IpAddr) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE nat_rules SET container_ip = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, ip.to_string(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(BridgeError::NotFound(format!("NAT rule {}", id)));
        }
        Ok(())
    }

    pub fn delete(&self, id: i64) -> BridgeResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM nat_rules WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(BridgeError::NotFound(format!("NAT rule {}", id)));
        }
        Ok(())
    }

    /// Persist all mutations of one resync pass in a single transaction.
    pub fn commit_resync(
        &self,
        ip_updates: &[(i64, IpAddr)],
        disable_ids: &[i64],
    ) -> BridgeResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for (id, ip) in ip_updates {
            tx.execute(
                "UPDATE nat_rules SET container_ip = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, ip.to_string(), now],
            )?;
        }
        for id in disable_ids {
            tx.execute(
                "UPDATE nat_rules SET enabled = 0, updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<NatRule> {
    let ip: String = row.get("container_ip")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(NatRule {
        id: row.get("id")?,
        node: row.get("node")?,
        vmid: row.get("vmid")?,
        host_port: row.get("host_port")?,
        container_port: row.get("container_port")?,
        protocol: row.get("protocol")?,
        container_ip: ip.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::other(format!("invalid ip: {}", e))),
            )
        })?,
        description: row.get("description")?,
        enabled: row.get("enabled")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::other(format!("invalid timestamp: {}", e))),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RuleStore {
        RuleStore::open_in_memory().unwrap()
    }

    fn new_rule(host_port: u16, protocol: Protocol) -> NewRule {
        NewRule {
            node: "pve".into(),
            vmid: 105,
            host_port,
            container_port: 80,
            protocol,
            description: Some("web".into()),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn insert_and_get() {
        let store = store();
        let rule = store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();

        assert!(rule.id > 0);
        assert_eq!(rule.host_port, 8080);
        assert_eq!(rule.container_ip, ip("10.0.0.5"));
        assert!(rule.enabled);

        let fetched = store.get(rule.id).unwrap().unwrap();
        assert_eq!(fetched, rule);
    }

    #[test]
    fn enabled_duplicate_endpoint_is_a_conflict() {
        let store = store();
        store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();

        let err = store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.6"), true)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));

        // Same port on the other protocol is fine.
        store
            .insert(&new_rule(8080, Protocol::Udp), ip("10.0.0.6"), true)
            .unwrap();
    }

    #[test]
    fn disabled_duplicate_is_allowed() {
        let store = store();
        store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();
        // The record of intent survives even when enforcement failed.
        store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.6"), false)
            .unwrap();
    }

    #[test]
    fn conflict_check_excludes_own_id() {
        let store = store();
        let rule = store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();

        assert!(store.has_conflict(8080, Protocol::Tcp, None).unwrap());
        assert!(!store
            .has_conflict(8080, Protocol::Tcp, Some(rule.id))
            .unwrap());
        assert!(!store.has_conflict(8081, Protocol::Tcp, None).unwrap());
    }

    #[test]
    fn disabled_rules_do_not_conflict() {
        let store = store();
        let rule = store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();
        store.set_enabled(rule.id, false).unwrap();
        assert!(!store.has_conflict(8080, Protocol::Tcp, None).unwrap());
    }

    #[test]
    fn update_applies_partial_fields() {
        let store = store();
        let rule = store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();

        let updated = store
            .update(
                rule.id,
                &RuleUpdate {
                    host_port: Some(9090),
                    enabled: Some(false),
                    ..RuleUpdate::default()
                },
            )
            .unwrap();

        assert_eq!(updated.host_port, 9090);
        assert!(!updated.enabled);
        // Untouched fields survive.
        assert_eq!(updated.container_port, 80);
        assert_eq!(updated.protocol, Protocol::Tcp);
        assert_eq!(updated.description.as_deref(), Some("web"));
    }

    #[test]
    fn list_paginates_newest_first() {
        let store = store();
        for port in [8080, 8081, 8082] {
            store
                .insert(&new_rule(port, Protocol::Tcp), ip("10.0.0.5"), true)
                .unwrap();
        }

        let (page, total) = store.list(0, 2).unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].host_port, 8082);
        assert_eq!(page[1].host_port, 8081);

        let (rest, _) = store.list(2, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].host_port, 8080);
    }

    #[test]
    fn list_enabled_skips_disabled() {
        let store = store();
        let a = store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();
        let b = store
            .insert(&new_rule(8081, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();
        store.set_enabled(a.id, false).unwrap();

        let enabled = store.list_enabled().unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, b.id);
    }

    #[test]
    fn list_for_container_matches_identity() {
        let store = store();
        store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();
        let mut other = new_rule(9090, Protocol::Tcp);
        other.vmid = 200;
        store.insert(&other, ip("10.0.0.6"), true).unwrap();

        let rules = store.list_for_container("pve", 105).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].host_port, 8080);
        assert!(store.list_for_container("pve2", 105).unwrap().is_empty());
    }

    #[test]
    fn delete_removes_row() {
        let store = store();
        let rule = store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();

        store.delete(rule.id).unwrap();
        assert!(store.get(rule.id).unwrap().is_none());
        assert!(matches!(
            store.delete(rule.id),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn commit_resync_batches_mutations() {
        let store = store();
        let a = store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();
        let b = store
            .insert(&new_rule(8081, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();

        store
            .commit_resync(&[(a.id, ip("10.0.0.9"))], &[b.id])
            .unwrap();

        let a = store.get(a.id).unwrap().unwrap();
        let b = store.get(b.id).unwrap().unwrap();
        assert_eq!(a.container_ip, ip("10.0.0.9"));
        assert!(a.enabled);
        assert!(!b.enabled);
    }

    #[test]
    fn reenabling_into_conflict_fails() {
        let store = store();
        let a = store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.5"), true)
            .unwrap();
        store.set_enabled(a.id, false).unwrap();
        store
            .insert(&new_rule(8080, Protocol::Tcp), ip("10.0.0.6"), true)
            .unwrap();

        // The partial index also guards re-enable paths.
        let err = store.set_enabled(a.id, true).unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
    }
}
