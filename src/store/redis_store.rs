//! Redis-backed `StateStore` (spec §6's schema: `ws:<userId>`, `inst:<id>`,
//! `ws:pings`, `ws:pool`).
//!
//! Grounded on the `redis` crate's `tokio-comp` + `connection-manager`
//! dependency shape pulled from `examples/other_examples/manifests/
//! Govcraft-acton-service/Cargo.toml`. Multi-key writes (spec §4.3, §4.9)
//! are pushed into `redis::Script` (server-side Lua) rather than emulated
//! with sequential calls, per spec §9's explicit prohibition on that
//! shortcut — the same discipline the teacher's `daemon/pool.rs` applies to
//! its own two-lock ordering, just enforced by the store instead of by a
//! mutex.

use super::{SetOutcome, StateStore};
use crate::errors::StoreError;
use crate::model::{WorkspaceRecord, WorkspaceState};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::collections::HashMap;

const SET_WORKSPACE_IF_ABSENT: &str = r#"
local ws_key = KEYS[1]
local inst_key = KEYS[2]
local pings_key = KEYS[3]
local user_id = ARGV[1]
local instance_id = ARGV[2]
local public_endpoint = ARGV[3]
local custom_domain = ARGV[4]
local state = ARGV[5]
local last_seen = ARGV[6]
local ts = ARGV[7]

local existing_state = redis.call('HGET', ws_key, 'state')
if existing_state == 'RUNNING' then
    local fields = redis.call('HGETALL', ws_key)
    return fields
end

redis.call('HSET', ws_key,
    'instanceId', instance_id,
    'publicEndpoint', public_endpoint,
    'customDomain', custom_domain,
    'state', state,
    'lastSeen', last_seen,
    'ts', ts)
redis.call('SET', inst_key, user_id)
redis.call('ZADD', pings_key, last_seen, user_id)
return {}
"#;

const UPDATE_PING: &str = r#"
local ws_key = KEYS[1]
local pings_key = KEYS[2]
local user_id = ARGV[1]
local now = ARGV[2]

if redis.call('EXISTS', ws_key) == 0 then
    return 0
end

redis.call('HSET', ws_key, 'lastSeen', now, 'state', 'RUNNING')
redis.call('ZADD', pings_key, now, user_id)
return 1
"#;

const CLEANUP: &str = r#"
local ws_key = KEYS[1]
local pings_key = KEYS[2]
local inst_key = KEYS[3]
local user_id = ARGV[1]

redis.call('HSET', ws_key, 'state', 'STOPPED')
redis.call('ZREM', pings_key, user_id)
redis.call('DEL', inst_key)
redis.call('DEL', ws_key)
return 1
"#;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Fatal(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| classify(e))?;
        Ok(Self { conn })
    }

    fn pool_key() -> &'static str {
        "ws:pool"
    }
    fn pings_key() -> &'static str {
        "ws:pings"
    }
    fn ws_key(user_id: &str) -> String {
        format!("ws:{user_id}")
    }
    fn inst_key(instance_id: &str) -> String {
        format!("inst:{instance_id}")
    }
}

fn classify(e: RedisError) -> StoreError {
    if e.is_connection_dropped() || e.is_timeout() || e.is_io_error() {
        StoreError::Transient(e.to_string())
    } else {
        StoreError::Fatal(e.to_string())
    }
}

fn record_from_fields(fields: &HashMap<String, String>) -> Result<WorkspaceRecord, StoreError> {
    let instance_id = fields
        .get("instanceId")
        .ok_or_else(|| StoreError::Fatal("workspace hash missing instanceId".to_string()))?
        .clone();
    let public_endpoint = fields.get("publicEndpoint").cloned().unwrap_or_default();
    let custom_domain = fields
        .get("customDomain")
        .filter(|s| !s.is_empty())
        .cloned();
    let state: WorkspaceState = fields
        .get("state")
        .ok_or_else(|| StoreError::Fatal("workspace hash missing state".to_string()))?
        .parse()
        .map_err(StoreError::Fatal)?;
    let last_seen: i64 = fields
        .get("lastSeen")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::Fatal("workspace hash missing lastSeen".to_string()))?;
    let ts: i64 = fields
        .get("ts")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::Fatal("workspace hash missing ts".to_string()))?;

    Ok(WorkspaceRecord {
        instance_id,
        public_endpoint,
        custom_domain,
        state,
        last_seen,
        ts,
    })
}

#[async_trait]
impl StateStore for RedisStore {
    async fn pool_pop(&self) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.spop(Self::pool_key()).await.map_err(classify)
    }

    async fn pool_add(&self, instance_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .sadd(Self::pool_key(), instance_id)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn pool_remove(&self, instance_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .srem(Self::pool_key(), instance_id)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn pool_size(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        conn.scard(Self::pool_key()).await.map_err(classify)
    }

    async fn get_workspace(&self, user_id: &str) -> Result<Option<WorkspaceRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(Self::ws_key(user_id)).await.map_err(classify)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(record_from_fields(&fields)?))
    }

    async fn set_workspace_if_absent(
        &self,
        user_id: &str,
        record: WorkspaceRecord,
    ) -> Result<SetOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let fields: Vec<String> = Script::new(SET_WORKSPACE_IF_ABSENT)
            .key(Self::ws_key(user_id))
            .key(Self::inst_key(&record.instance_id))
            .key(Self::pings_key())
            .arg(user_id)
            .arg(&record.instance_id)
            .arg(&record.public_endpoint)
            .arg(record.custom_domain.clone().unwrap_or_default())
            .arg(record.state.to_string())
            .arg(record.last_seen)
            .arg(record.ts)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        if fields.is_empty() {
            return Ok(SetOutcome::Written);
        }

        let mut map = HashMap::with_capacity(fields.len() / 2);
        for pair in fields.chunks_exact(2) {
            map.insert(pair[0].clone(), pair[1].clone());
        }
        Ok(SetOutcome::Conflict(record_from_fields(&map)?))
    }

    async fn get_user_for_instance(&self, instance_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(Self::inst_key(instance_id)).await.map_err(classify)
    }

    async fn update_ping(&self, user_id: &str, now_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let found: i64 = Script::new(UPDATE_PING)
            .key(Self::ws_key(user_id))
            .key(Self::pings_key())
            .arg(user_id)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        if found == 0 {
            return Err(StoreError::NotFound(format!("no workspace for {user_id}")));
        }
        Ok(())
    }

    async fn list_idle(&self, cutoff_ms: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.zrangebyscore(Self::pings_key(), "-inf", cutoff_ms)
            .await
            .map_err(classify)
    }

    async fn active_count(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        conn.zcard(Self::pings_key()).await.map_err(classify)
    }

    async fn cleanup(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(CLEANUP)
            .key(Self::ws_key(user_id))
            .key(Self::pings_key())
            .key(Self::inst_key(instance_id))
            .arg(user_id)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
