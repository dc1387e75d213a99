//! Identifiers and the client-visible update vocabulary.
//!
//! Nodes and edges are named by opaque string handles that are stable for
//! the element's lifetime; memory identity never crosses the wire. Servers
//! are named by dense u64 ids: VTs occupy `0..num_vts`, shards are assigned
//! from `num_vts` upward, and client ids start above [`MAX_NUM_SERVERS`].

use std::fmt;

/// Server ids must stay below this bound; ids above it belong to clients.
pub const MAX_NUM_SERVERS: u64 = 1000;

#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ServerId {
    fn from(id: u64) -> Self {
        ServerId(id)
    }
}

macro_rules! handle_type {
    ($name:ident) => {
        #[derive(
            Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
        )]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl<'a> From<&'a str> for $name {
            fn from(s: &'a str) -> Self {
                $name(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

handle_type!(NodeHandle);
handle_type!(EdgeHandle);

/// A node as seen from another shard: where it lives plus its handle.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct RemoteNode {
    pub loc: ServerId,
    pub handle: NodeHandle,
}

impl RemoteNode {
    pub fn new(loc: ServerId, handle: NodeHandle) -> Self {
        RemoteNode { loc, handle }
    }

    /// The sentinel a node program uses to address its answer back to the
    /// coordinating VT.
    pub fn coordinator(vt_id: u64) -> Self {
        RemoteNode {
            loc: ServerId(vt_id),
            handle: NodeHandle::default(),
        }
    }
}

/// One write inside a client transaction.
///
/// `dst_loc` on `CreateEdge` is resolved by the VT before the update is
/// forwarded to a shard; clients leave it `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PendingUpdate {
    CreateNode {
        node: NodeHandle,
    },
    CreateEdge {
        edge: EdgeHandle,
        src: NodeHandle,
        dst: NodeHandle,
        dst_loc: Option<ServerId>,
    },
    DeleteNode {
        node: NodeHandle,
    },
    DeleteEdge {
        edge: EdgeHandle,
        src: NodeHandle,
    },
    SetNodeProperty {
        node: NodeHandle,
        key: String,
        value: String,
    },
    SetEdgeProperty {
        src: NodeHandle,
        edge: EdgeHandle,
        key: String,
        value: String,
    },
}

impl PendingUpdate {
    /// The node whose shard must apply this update.
    pub fn target(&self) -> &NodeHandle {
        match *self {
            PendingUpdate::CreateNode { ref node }
            | PendingUpdate::DeleteNode { ref node }
            | PendingUpdate::SetNodeProperty { ref node, .. } => node,
            PendingUpdate::CreateEdge { ref src, .. }
            | PendingUpdate::DeleteEdge { ref src, .. }
            | PendingUpdate::SetEdgeProperty { ref src, .. } => src,
        }
    }

    pub fn is_create_node(&self) -> bool {
        match *self {
            PendingUpdate::CreateNode { .. } => true,
            _ => false,
        }
    }
}
