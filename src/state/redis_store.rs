// * Redis Key-Value Store
// * Pooled standalone or cluster connections; atomic steps run server-side

use super::store::{ttl_millis, KeyValueStore, StateError};
use crate::config::{parse_node, RedisConfig, RedisMode};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection, RunError};
use lazy_static::lazy_static;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::{
    AsyncCommands, Cmd, ConnectionAddr, ConnectionInfo, Pipeline, RedisError, RedisFuture,
    RedisConnectionInfo, Script, Value,
};
use std::time::Duration;
use tracing::{debug, info};

lazy_static! {
    // * INCR then PEXPIRE in one step so a crash can never leave a counter without expiry
    static ref INCR_AND_EXPIRE: Script = Script::new(
        r"
local count = redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return count
",
    );

    // * SADD and extend the set's expiry to at least ARGV[2] milliseconds
    static ref INDEX_ADD: Script = Script::new(
        r"
redis.call('SADD', KEYS[1], ARGV[1])
local ttl = redis.call('PTTL', KEYS[1])
local requested = tonumber(ARGV[2])
if ttl < requested then
  redis.call('PEXPIRE', KEYS[1], requested)
end
return 1
",
    );
}

/// A single connection of either deployment mode
#[derive(Clone)]
pub enum RedisConnection {
    Standalone(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            RedisConnection::Standalone(conn) => conn.req_packed_command(cmd),
            RedisConnection::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            RedisConnection::Standalone(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConnection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConnection::Standalone(conn) => conn.get_db(),
            RedisConnection::Cluster(conn) => conn.get_db(),
        }
    }
}

enum ConnectTarget {
    Standalone(redis::Client),
    Cluster(redis::cluster::ClusterClient),
}

/// bb8 manager opening connections for the configured mode
pub struct RedisConnectionManager {
    target: ConnectTarget,
}

impl RedisConnectionManager {
    pub fn new(config: &RedisConfig) -> Result<Self, StateError> {
        let target = match config.mode {
            RedisMode::Standalone => {
                ConnectTarget::Standalone(redis::Client::open(standalone_info(config))?)
            }
            RedisMode::Cluster => {
                let nodes = config
                    .nodes
                    .iter()
                    .map(|node| parse_node(node))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| StateError::Config(e.to_string()))?;

                let mut builder = ClusterClientBuilder::new(nodes).retries(config.max_redirects);
                if let Some(username) = &config.username {
                    builder = builder.username(username.clone());
                }
                if let Some(password) = &config.password {
                    builder = builder.password(password.clone());
                }
                ConnectTarget::Cluster(builder.build()?)
            }
        };
        Ok(Self { target })
    }

    /// Standalone manager from a `redis://` URL
    pub fn from_url(url: &str) -> Result<Self, StateError> {
        Ok(Self {
            target: ConnectTarget::Standalone(redis::Client::open(url)?),
        })
    }
}

#[async_trait]
impl ManageConnection for RedisConnectionManager {
    type Connection = RedisConnection;
    type Error = RedisError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        match &self.target {
            ConnectTarget::Standalone(client) => Ok(RedisConnection::Standalone(
                ConnectionManager::new(client.clone()).await?,
            )),
            ConnectTarget::Cluster(client) => {
                Ok(RedisConnection::Cluster(client.get_async_connection().await?))
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let _: String = redis::cmd("PING").query_async(conn).await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Connection settings for a single node
pub fn standalone_info(config: &RedisConfig) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
        redis: RedisConnectionInfo {
            db: config.database,
            username: config.username.clone(),
            password: config.password.clone(),
            ..Default::default()
        },
    }
}

impl From<RunError<RedisError>> for StateError {
    fn from(err: RunError<RedisError>) -> Self {
        match err {
            RunError::User(e) => StateError::Redis(e),
            RunError::TimedOut => StateError::Pool("timed out waiting for a connection".into()),
        }
    }
}

fn millis_arg(ttl: Duration) -> i64 {
    i64::try_from(ttl_millis(ttl)).unwrap_or(i64::MAX)
}

/// Key-value store shared by every evaluator replica
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
}

impl RedisStore {
    /// Builds the pool for the configured mode and checks one connection out
    pub async fn connect(config: &RedisConfig) -> Result<Self, StateError> {
        let manager = RedisConnectionManager::new(config)?;
        let store = Self::with_manager(manager, config).await?;
        info!(
            mode = ?config.mode,
            max_size = config.pool.max_size,
            "Redis state store connected"
        );
        Ok(store)
    }

    /// Standalone store from a URL with default pool sizing
    pub async fn from_url(url: &str) -> Result<Self, StateError> {
        let manager = RedisConnectionManager::from_url(url)?;
        Self::with_manager(manager, &RedisConfig::default()).await
    }

    async fn with_manager(
        manager: RedisConnectionManager,
        config: &RedisConfig,
    ) -> Result<Self, StateError> {
        let pool = Pool::builder()
            .max_size(config.pool.max_size)
            .min_idle(Some(config.pool.min_idle))
            .idle_timeout(Some(config.pool.idle_timeout))
            .connection_timeout(config.pool.connection_timeout)
            .build(manager)
            .await?;

        let store = Self { pool };
        // * Fail fast on unreachable servers instead of on the first evaluation
        drop(store.conn().await?);
        Ok(store)
    }

    async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>, StateError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn incr(&self, key: &str) -> Result<i64, StateError> {
        let mut conn = self.conn().await?;
        let count: i64 = conn.incr(key, 1).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;
        let updated: bool = conn.pexpire(key, millis_arg(ttl)).await?;
        Ok(updated)
    }

    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64, StateError> {
        let mut conn = self.conn().await?;
        let count: i64 = INCR_AND_EXPIRE
            .key(key)
            .arg(millis_arg(ttl))
            .invoke_async(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis_arg(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StateError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis_arg(ttl));
        }
        let _: () = cmd.query_async(&mut *conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool, StateError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn get_expire(&self, key: &str) -> Result<Option<Duration>, StateError> {
        let mut conn = self.conn().await?;
        // * -2 when missing, -1 when persistent
        let remaining: i64 = conn.pttl(key).await?;
        Ok(u64::try_from(remaining)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }

    async fn index_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StateError> {
        let mut conn = self.conn().await?;
        let _: i64 = INDEX_ADD
            .key(key)
            .arg(member)
            .arg(millis_arg(ttl))
            .invoke_async(&mut *conn)
            .await?;
        debug!(key, member, "Label indexed");
        Ok(())
    }

    async fn index_members(&self, key: &str) -> Result<Vec<String>, StateError> {
        let mut conn = self.conn().await?;
        let mut members: Vec<String> = conn.smembers(key).await?;
        members.sort();
        Ok(members)
    }
}
