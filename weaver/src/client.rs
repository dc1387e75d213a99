//! The thin client.
//!
//! A client talks to one (randomly chosen) VT. Writes are collected into a
//! pending transaction between `begin_tx` and `end_tx`; reads are node
//! programs that block until the VT relays the answer. One outstanding
//! request at a time, matching the wire protocol.

use std::sync::Arc;
use std::time::Duration;

use failure::Fail;
use rand::Rng;

use weaver_channel::{RecvError, SendError, Transport};
use weaver_services::ServerMgr;

use crate::data::{EdgeHandle, NodeHandle, PendingUpdate, ServerId};
use crate::message::Message;
use crate::prog::{
    EdgeCountParams, ProgParams, ProgType, ReachParams, ReadNEdgesParams, ReadNodePropsParams,
};

const PROG_RETRIES: usize = 5;

#[derive(Debug, Fail)]
pub enum ClientError {
    #[fail(display = "connection to the VT was disrupted")]
    Disrupted,
    #[fail(display = "request timed out")]
    Timeout,
    #[fail(display = "node program failed after {} attempts", _0)]
    ProgFailed(usize),
    #[fail(display = "unexpected reply: {}", _0)]
    Protocol(String),
}

/// Result of `end_tx` when the wire survived the round trip.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxOutcome {
    Committed,
    Aborted,
}

pub struct Client {
    transport: Arc<dyn Transport<Message>>,
    server_mgr: Option<Arc<dyn ServerMgr>>,
    vt_id: u64,
    timeout: Duration,
    /// Fail-fast mode: report NODE_PROG_FAIL instead of retrying.
    fail_fast: bool,

    cur_tx: Option<Vec<PendingUpdate>>,
    tx_id_ctr: u64,
    handle_ctr: u64,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("vt_id", &self.vt_id)
            .field("tx_active", &self.cur_tx.is_some())
            .finish()
    }
}

impl Client {
    pub fn new(transport: Arc<dyn Transport<Message>>, num_vts: u64) -> Self {
        let vt_id = rand::thread_rng().gen_range(0, num_vts);
        Self::with_vt(transport, vt_id)
    }

    /// Pin the client to a specific VT (tests want determinism).
    pub fn with_vt(transport: Arc<dyn Transport<Message>>, vt_id: u64) -> Self {
        Client {
            transport,
            server_mgr: None,
            vt_id,
            timeout: Duration::from_secs(10),
            fail_fast: false,
            cur_tx: None,
            tx_id_ctr: 0,
            handle_ctr: 0,
        }
    }

    pub fn set_server_mgr(&mut self, sm: Arc<dyn ServerMgr>) {
        self.server_mgr = Some(sm);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_fail_fast(&mut self, fail_fast: bool) {
        self.fail_fast = fail_fast;
    }

    pub fn vt_id(&self) -> u64 {
        self.vt_id
    }

    // -------- transactions --------

    pub fn begin_tx(&mut self) {
        assert!(
            self.cur_tx.is_none(),
            "only one concurrent transaction per client"
        );
        self.cur_tx = Some(Vec::new());
    }

    fn push(&mut self, upd: PendingUpdate) {
        self.cur_tx
            .as_mut()
            .expect("no transaction in progress")
            .push(upd);
    }

    /// Queue a node creation; a fresh handle is generated when `handle` is
    /// `None`.
    pub fn create_node(&mut self, handle: Option<&str>) -> NodeHandle {
        let node: NodeHandle = match handle {
            Some(h) => h.into(),
            None => self.generate_handle().into(),
        };
        self.push(PendingUpdate::CreateNode { node: node.clone() });
        node
    }

    pub fn create_edge(
        &mut self,
        handle: Option<&str>,
        src: &NodeHandle,
        dst: &NodeHandle,
    ) -> EdgeHandle {
        let edge: EdgeHandle = match handle {
            Some(h) => h.into(),
            None => self.generate_handle().into(),
        };
        self.push(PendingUpdate::CreateEdge {
            edge: edge.clone(),
            src: src.clone(),
            dst: dst.clone(),
            dst_loc: None,
        });
        edge
    }

    pub fn delete_node(&mut self, node: &NodeHandle) {
        self.push(PendingUpdate::DeleteNode { node: node.clone() });
    }

    pub fn delete_edge(&mut self, edge: &EdgeHandle, src: &NodeHandle) {
        self.push(PendingUpdate::DeleteEdge {
            edge: edge.clone(),
            src: src.clone(),
        });
    }

    pub fn set_node_property(&mut self, node: &NodeHandle, key: &str, value: &str) {
        self.push(PendingUpdate::SetNodeProperty {
            node: node.clone(),
            key: key.to_owned(),
            value: value.to_owned(),
        });
    }

    pub fn set_edge_property(&mut self, src: &NodeHandle, edge: &EdgeHandle, key: &str, value: &str) {
        self.push(PendingUpdate::SetEdgeProperty {
            src: src.clone(),
            edge: edge.clone(),
            key: key.to_owned(),
            value: value.to_owned(),
        });
    }

    /// Submit the pending transaction and wait for the verdict.
    ///
    /// A disrupted connection is NOT retried: the transaction may have
    /// committed, so re-execution is the caller's decision. The client
    /// refreshes its view of the deployment and reports the disruption.
    pub fn end_tx(&mut self) -> Result<TxOutcome, ClientError> {
        let updates = self.cur_tx.take().expect("no transaction in progress");
        self.tx_id_ctr += 1;
        let tx_id = self.tx_id_ctr;

        if let Err(e) = self
            .transport
            .send(self.vt_id, Message::ClientTxInit { tx_id, updates })
        {
            self.reconfigure();
            return Err(match e {
                SendError::Timeout => ClientError::Timeout,
                SendError::Disrupted => ClientError::Disrupted,
            });
        }

        loop {
            match self.transport.recv_timeout(self.timeout) {
                Ok(env) => match env.msg {
                    Message::ClientTxSuccess { tx_id: done } if done == tx_id => {
                        return Ok(TxOutcome::Committed);
                    }
                    Message::ClientTxAbort { tx_id: done } if done == tx_id => {
                        return Ok(TxOutcome::Aborted);
                    }
                    // stale replies from an earlier, timed-out request
                    _ => continue,
                },
                Err(RecvError::Timeout) => {
                    self.reconfigure();
                    return Err(ClientError::Timeout);
                }
                Err(RecvError::Disconnected) => {
                    self.reconfigure();
                    return Err(ClientError::Disrupted);
                }
            }
        }
    }

    // -------- node programs --------

    /// Run a node program and return its final parameters.
    pub fn run_node_program(
        &mut self,
        prog: ProgType,
        args: Vec<(NodeHandle, ProgParams)>,
    ) -> Result<ProgParams, ClientError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .transport
                .send(self.vt_id, Message::ClientNodeProgReq {
                    prog,
                    args: args.clone(),
                }) {
                Ok(()) => {}
                Err(SendError::Disrupted) if attempts <= PROG_RETRIES => {
                    self.reconfigure();
                    continue;
                }
                Err(SendError::Disrupted) => return Err(ClientError::Disrupted),
                Err(SendError::Timeout) => return Err(ClientError::Timeout),
            }

            // drain stale replies (an earlier attempt may answer late)
            // without burning a resend
            let failed = loop {
                match self.transport.recv_timeout(self.timeout) {
                    Ok(env) => match env.msg {
                        Message::NodeProgReturn {
                            prog: got, params, ..
                        } if got == prog => return Ok(params),
                        Message::NodeProgFail { .. } => break true,
                        _ => continue,
                    },
                    Err(RecvError::Timeout) => break false,
                    Err(RecvError::Disconnected) => return Err(ClientError::Disrupted),
                }
            };

            if failed && self.fail_fast {
                return Err(ClientError::ProgFailed(attempts));
            }
            if attempts > PROG_RETRIES {
                return if failed {
                    Err(ClientError::ProgFailed(attempts))
                } else {
                    Err(ClientError::Timeout)
                };
            }
            self.reconfigure();
        }
    }

    pub fn read_n_edges(&mut self, node: &NodeHandle) -> Result<u64, ClientError> {
        let params = self.run_node_program(
            ProgType::ReadNEdges,
            vec![(
                node.clone(),
                ProgParams::ReadNEdges(ReadNEdgesParams::default()),
            )],
        )?;
        match params {
            ProgParams::ReadNEdges(p) => Ok(p.num_edges),
            other => Err(ClientError::Protocol(format!("{:?}", other))),
        }
    }

    pub fn read_node_props(
        &mut self,
        node: &NodeHandle,
        keys: Vec<String>,
    ) -> Result<Vec<(String, String)>, ClientError> {
        let params = self.run_node_program(
            ProgType::ReadNodeProps,
            vec![(
                node.clone(),
                ProgParams::ReadNodeProps(ReadNodePropsParams {
                    keys,
                    node_props: Vec::new(),
                }),
            )],
        )?;
        match params {
            ProgParams::ReadNodeProps(p) => Ok(p.node_props),
            other => Err(ClientError::Protocol(format!("{:?}", other))),
        }
    }

    pub fn reach(
        &mut self,
        src: &NodeHandle,
        dest: &NodeHandle,
        edge_props: Vec<(String, String)>,
    ) -> Result<bool, ClientError> {
        let mut params = ReachParams::to(dest.clone());
        params.edge_props = edge_props;
        let params = self.run_node_program(
            ProgType::Reachability,
            vec![(src.clone(), ProgParams::Reachability(params))],
        )?;
        match params {
            ProgParams::Reachability(p) => Ok(p.reachable),
            other => Err(ClientError::Protocol(format!("{:?}", other))),
        }
    }

    /// Total live-edge count across the whole graph (global program).
    pub fn edge_count(&mut self) -> Result<u64, ClientError> {
        let params = self.run_node_program(
            ProgType::EdgeCount,
            vec![(
                NodeHandle::default(),
                ProgParams::EdgeCount(EdgeCountParams::default()),
            )],
        )?;
        match params {
            ProgParams::EdgeCount(p) => Ok(p.total),
            other => Err(ClientError::Protocol(format!("{:?}", other))),
        }
    }

    // -------- control --------

    pub fn node_count(&mut self) -> Result<Vec<u64>, ClientError> {
        loop {
            match self.transport.send(self.vt_id, Message::ClientNodeCount) {
                Ok(()) => {}
                Err(_) => {
                    self.reconfigure();
                    return Err(ClientError::Disrupted);
                }
            }
            match self.transport.recv_timeout(self.timeout) {
                Ok(env) => match env.msg {
                    Message::NodeCountReply { counts } => return Ok(counts),
                    _ => continue,
                },
                Err(RecvError::Timeout) => {
                    self.reconfigure();
                    continue;
                }
                Err(RecvError::Disconnected) => return Err(ClientError::Disrupted),
            }
        }
    }

    /// Kick off a migration pass; returns immediately.
    pub fn start_migration(&mut self) -> Result<(), ClientError> {
        self.transport
            .send(self.vt_id, Message::StartMigration)
            .map_err(|_| ClientError::Disrupted)
    }

    /// One full token pass around the shard ring; blocks until the token
    /// comes back to the VT.
    pub fn single_stream_migration(&mut self) -> Result<(), ClientError> {
        self.transport
            .send(self.vt_id, Message::OneStreamMigration)
            .map_err(|_| ClientError::Disrupted)?;
        loop {
            match self.transport.recv_timeout(self.timeout) {
                Ok(env) => match env.msg {
                    Message::MigrationDone => return Ok(()),
                    _ => continue,
                },
                Err(RecvError::Timeout) => return Err(ClientError::Timeout),
                Err(RecvError::Disconnected) => return Err(ClientError::Disrupted),
            }
        }
    }

    pub fn exit_weaver(&mut self) {
        let _ = self.transport.send(self.vt_id, Message::ExitWeaver);
    }

    fn generate_handle(&mut self) -> String {
        self.handle_ctr += 1;
        format!("{}.{}", self.handle_ctr, ServerId(self.transport.local_id()))
    }

    fn reconfigure(&mut self) {
        if let Some(ref sm) = self.server_mgr {
            // refresh the view; the transport reconnects lazily on the next
            // send, so there is nothing else to rebuild here
            let _ = sm.view();
        }
    }
}
