//! RPC client for the metadata service.
//!
//! Mutations must reach the Raft leader; read-only calls settle for any
//! reachable replica. The last replica that answered is reused until a call to
//! it fails with a retryable error, at which point every configured address is
//! probed again.

use super::http;
use crate::config::ClientConfig;
use crate::error::{BlockFsError, Result};
use crate::metadata::operations::*;
use crate::types::{BlockId, FetchOp, FileInfo};
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Which replicas may serve a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Leader,
    AnyReplica,
}

/// Whether a call may run twice if a retry follows a lost reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Safe,
    /// Retried only when the request cannot have executed.
    Unsafe,
}

fn should_retry(error: &BlockFsError, replay: Replay) -> bool {
    match replay {
        Replay::Safe => error.is_retryable(),
        Replay::Unsafe => matches!(
            error,
            BlockFsError::NotLeader { .. } | BlockFsError::Unreachable(_)
        ),
    }
}

#[derive(Debug, Clone)]
struct Resolved {
    addr: String,
    is_leader: bool,
}

pub struct MetadataClient {
    addrs: Vec<String>,
    client: Client,
    connect_rounds: u32,
    retry_interval: Duration,
    current: Mutex<Option<Resolved>>,
}

impl MetadataClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_addrs(config.metadata_addrs.clone(), config)
    }

    pub fn with_addrs(addrs: Vec<String>, config: &ClientConfig) -> Self {
        Self {
            addrs,
            client: http::build_client(http::DEFAULT_CONNECT_TIMEOUT, config.request_timeout),
            connect_rounds: config.connect_rounds.max(1),
            retry_interval: config.retry_interval,
            current: Mutex::new(None),
        }
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Ask one replica whether it leads.
    pub async fn is_leader(&self, addr: &str) -> Result<IsLeaderResponse> {
        http::get_json(&self.client, addr, "metadata/is_leader").await
    }

    /// Probe every address until a suitable replica answers.
    async fn resolve(&self, target: Target) -> Result<String> {
        for round in 0..self.connect_rounds {
            for addr in &self.addrs {
                match self.is_leader(addr).await {
                    Ok(status) if status.is_leader || target == Target::AnyReplica => {
                        debug!(addr = %addr, is_leader = status.is_leader, "Resolved metadata replica");
                        *self.current.lock() = Some(Resolved {
                            addr: addr.clone(),
                            is_leader: status.is_leader,
                        });
                        return Ok(addr.clone());
                    }
                    Ok(status) => {
                        debug!(addr = %addr, leader = ?status.leader, "Metadata replica is not the leader");
                    }
                    Err(e) => debug!(addr = %addr, error = %e, "Metadata replica unreachable"),
                }
                if round + 1 < self.connect_rounds {
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }

        Err(BlockFsError::Unreachable(format!(
            "no {} among {:?}",
            match target {
                Target::Leader => "metadata leader",
                Target::AnyReplica => "reachable metadata replica",
            },
            self.addrs
        )))
    }

    fn cached(&self, target: Target) -> Option<String> {
        self.current
            .lock()
            .as_ref()
            .filter(|r| r.is_leader || target == Target::AnyReplica)
            .map(|r| r.addr.clone())
    }

    fn invalidate(&self, addr: &str) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|r| r.addr == addr) {
            *current = None;
        }
    }

    async fn call<Req, Resp>(
        &self,
        endpoint: &str,
        body: &Req,
        target: Target,
        replay: Replay,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut attempts = self.connect_rounds;
        loop {
            let addr = match self.cached(target) {
                Some(addr) => addr,
                None => self.resolve(target).await?,
            };
            match http::post_json(&self.client, &addr, endpoint, body).await {
                Err(e) if should_retry(&e, replay) && attempts > 1 => {
                    warn!(addr = %addr, endpoint, error = %e, "Metadata call failed, re-resolving");
                    self.invalidate(&addr);
                    attempts -= 1;
                }
                result => return result,
            }
        }
    }

    pub async fn register(&self, addr: &str) -> Result<RegisterResponse> {
        let request = RegisterRequest {
            addr: addr.to_string(),
        };
        self.call("metadata/register", &request, Target::Leader, Replay::Unsafe).await
    }

    pub async fn create(&self, path: &str, size: u64) -> Result<CreateResponse> {
        let request = CreateRequest {
            path: path.to_string(),
            size,
        };
        self.call("metadata/create", &request, Target::Leader, Replay::Unsafe).await
    }

    pub async fn open(&self, path: &str) -> Result<OpenResponse> {
        let request = OpenRequest {
            path: path.to_string(),
        };
        self.call("metadata/open", &request, Target::AnyReplica, Replay::Safe).await
    }

    pub async fn fetch_block_addrs(
        &self,
        path: &str,
        index: u64,
        op: FetchOp,
    ) -> Result<FetchBlockAddrsResponse> {
        let request = FetchBlockAddrsRequest {
            path: path.to_string(),
            index,
            op,
        };
        // A REMOVE fetch of the last block deletes the file.
        let (target, replay) = match op {
            FetchOp::Get => (Target::AnyReplica, Replay::Safe),
            FetchOp::Put => (Target::Leader, Replay::Safe),
            FetchOp::Remove => (Target::Leader, Replay::Unsafe),
        };
        self.call("metadata/fetch_block_addrs", &request, target, replay)
            .await
    }

    pub async fn locs_validity_notify(
        &self,
        block_id: BlockId,
        validity: BTreeMap<String, bool>,
    ) -> Result<()> {
        let request = LocsValidityNotifyRequest { block_id, validity };
        let _: Ack = self
            .call(
                "metadata/locs_validity_notify",
                &request,
                Target::Leader,
                Replay::Safe,
            )
            .await?;
        Ok(())
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let request = RenameRequest {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        };
        let _: Ack = self
            .call("metadata/rename", &request, Target::Leader, Replay::Unsafe)
            .await?;
        Ok(())
    }

    pub async fn fetch_file_info(&self, path: &str) -> Result<Vec<FileInfo>> {
        let request = FetchFileInfoRequest {
            path: path.to_string(),
        };
        let response: FetchFileInfoResponse = self
            .call(
                "metadata/fetch_file_info",
                &request,
                Target::AnyReplica,
                Replay::Safe,
            )
            .await?;
        Ok(response.infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsafe_calls_retry_only_undelivered_requests() {
        let redirected = BlockFsError::NotLeader { leader: Some(2) };
        let refused = BlockFsError::Unreachable("connection refused".into());
        let timed_out = BlockFsError::Timeout("proposal".into());
        let dropped = BlockFsError::Network("connection reset".into());

        for e in [&redirected, &refused, &timed_out, &dropped] {
            assert!(should_retry(e, Replay::Safe), "{}", e);
        }
        assert!(should_retry(&redirected, Replay::Unsafe));
        assert!(should_retry(&refused, Replay::Unsafe));
        assert!(!should_retry(&timed_out, Replay::Unsafe));
        assert!(!should_retry(&dropped, Replay::Unsafe));

        let exists = BlockFsError::AlreadyExists("/a".into());
        assert!(!should_retry(&exists, Replay::Safe));
    }
}
