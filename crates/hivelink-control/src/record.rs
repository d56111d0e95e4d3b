//! Live session records and per-request identity propagation.

use hivelink_connection::Muxer;
use hivelink_proto::{MinionIdent, MinionIssue};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// One live minion session: the identity it presented, the credential it
/// was issued, and the session multiplexer. The serve loop owns the record;
/// the routing fabric only ever calls `muxer().dial()` through it.
pub struct ConnectionRecord {
    ident: MinionIdent,
    issue: MinionIssue,
    mux: Arc<dyn Muxer>,
}

impl ConnectionRecord {
    pub fn new(ident: MinionIdent, issue: MinionIssue, mux: Arc<dyn Muxer>) -> Self {
        Self { ident, issue, mux }
    }

    pub fn session_id(&self) -> i64 {
        self.issue.id
    }

    /// Registry key for this session.
    pub fn session_key(&self) -> String {
        self.issue.id.to_string()
    }

    pub fn ident(&self) -> &MinionIdent {
        &self.ident
    }

    pub fn issue(&self) -> &MinionIssue {
        &self.issue
    }

    pub fn inet(&self) -> Ipv4Addr {
        self.ident.inet
    }

    pub fn muxer(&self) -> &Arc<dyn Muxer> {
        &self.mux
    }
}

/// The calling minion's session record, when the request arrived over a
/// joined session. Absent (never a panic) for requests from anywhere else.
pub fn caller<B>(req: &http::Request<B>) -> Option<Arc<ConnectionRecord>> {
    req.extensions().get::<Arc<ConnectionRecord>>().cloned()
}

#[cfg(test)]
pub(crate) fn test_record(id: i64) -> Arc<ConnectionRecord> {
    use async_trait::async_trait;
    use hivelink_connection::{MuxError, MuxStream};

    struct DeadMux;

    #[async_trait]
    impl Muxer for DeadMux {
        async fn dial(&self) -> Result<MuxStream, MuxError> {
            Err(MuxError::Closed)
        }

        async fn accept(&self) -> Result<MuxStream, MuxError> {
            Err(MuxError::Closed)
        }

        async fn close(&self) {}
    }

    let ident = MinionIdent {
        semver: "1.0.0".to_string(),
        inet: Ipv4Addr::new(10, 0, 0, 1),
        mac: String::new(),
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        cpu: 2,
        pid: 1,
        workdir: String::new(),
        executable: String::new(),
        username: String::new(),
        hostname: "test".to_string(),
        time_at: chrono::Utc::now(),
    };
    let issue = MinionIssue {
        id,
        passwd: vec![0u8; 32],
    };
    Arc::new(ConnectionRecord::new(ident, issue, Arc::new(DeadMux)))
}
