//! KRPC (BEP-5) message parsing and construction.

use crate::bencode::{self, Value};
use crate::routing::{NodeId, RoutingEntry};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const ERR_PROTOCOL: i64 = 203;
pub const ERR_METHOD_UNKNOWN: i64 = 204;

const COMPACT_NODE_V4: usize = 26;
const COMPACT_NODE_V6: usize = 38;

#[derive(Debug, PartialEq, Eq)]
pub enum Message<'a> {
    Query { tx: &'a [u8], query: Query<'a> },
    Response { tx: &'a [u8], response: Response<'a> },
    Error { tx: &'a [u8], code: Option<i64> },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Query<'a> {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: [u8; 20],
    },
    GetPeers {
        id: NodeId,
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: [u8; 20],
        port: u16,
        implied_port: bool,
        token: &'a [u8],
    },
    Unknown {
        id: NodeId,
        method: &'a [u8],
    },
    /// Well-formed envelope whose arguments are missing or invalid.
    Malformed {
        reason: &'static str,
    },
}

impl Query<'_> {
    /// Sender id, when the arguments carried a valid one.
    pub fn sender_id(&self) -> Option<NodeId> {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. }
            | Query::Unknown { id, .. } => Some(*id),
            Query::Malformed { .. } => None,
        }
    }

    /// Infohash carried by peer-lookup and announce queries.
    pub fn info_hash(&self) -> Option<[u8; 20]> {
        match self {
            Query::GetPeers { info_hash, .. } | Query::AnnouncePeer { info_hash, .. } => {
                Some(*info_hash)
            }
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response<'a> {
    pub id: NodeId,
    pub nodes: Option<&'a [u8]>,
    pub nodes6: Option<&'a [u8]>,
}

impl<'a> Message<'a> {
    /// Parses a datagram. `None` means it is not a KRPC message we can even
    /// address a reply to, and should be dropped.
    pub fn parse(raw: &'a [u8]) -> Option<Self> {
        let root = bencode::decode(raw).ok()?;
        let tx = root.get(b"t")?.as_bytes()?;
        match root.get(b"y")?.as_bytes()? {
            b"q" => Some(Message::Query {
                tx,
                query: parse_query(&root),
            }),
            b"r" => {
                let r = root.get(b"r")?;
                Some(Message::Response {
                    tx,
                    response: Response {
                        id: NodeId::from_slice(r.get(b"id")?.as_bytes()?)?,
                        nodes: r.get(b"nodes").and_then(Value::as_bytes),
                        nodes6: r.get(b"nodes6").and_then(Value::as_bytes),
                    },
                })
            }
            b"e" => {
                let code = root
                    .get(b"e")
                    .and_then(Value::as_list)
                    .and_then(|l| l.first())
                    .and_then(Value::as_int);
                Some(Message::Error { tx, code })
            }
            _ => None,
        }
    }
}

fn parse_query<'a>(root: &Value<'a>) -> Query<'a> {
    let Some(method) = root.get(b"q").and_then(Value::as_bytes) else {
        return Query::Malformed {
            reason: "missing method",
        };
    };
    let Some(args) = root.get(b"a").filter(|a| a.as_dict().is_some()) else {
        return Query::Malformed {
            reason: "missing arguments",
        };
    };
    let Some(id) = args
        .get(b"id")
        .and_then(Value::as_bytes)
        .and_then(NodeId::from_slice)
    else {
        return Query::Malformed {
            reason: "invalid id",
        };
    };

    let hash_arg = |key: &[u8]| -> Option<[u8; 20]> {
        args.get(key)
            .and_then(Value::as_bytes)
            .and_then(|b| b.try_into().ok())
    };

    match method {
        b"ping" => Query::Ping { id },
        b"find_node" => match hash_arg(b"target") {
            Some(target) => Query::FindNode { id, target },
            None => Query::Malformed {
                reason: "invalid target",
            },
        },
        b"get_peers" => match hash_arg(b"info_hash") {
            Some(info_hash) => Query::GetPeers { id, info_hash },
            None => Query::Malformed {
                reason: "invalid info_hash",
            },
        },
        b"announce_peer" => {
            let Some(info_hash) = hash_arg(b"info_hash") else {
                return Query::Malformed {
                    reason: "invalid info_hash",
                };
            };
            let Some(token) = args.get(b"token").and_then(Value::as_bytes) else {
                return Query::Malformed {
                    reason: "missing token",
                };
            };
            let implied_port = args
                .get(b"implied_port")
                .and_then(Value::as_int)
                .is_some_and(|v| v != 0);
            let port = args
                .get(b"port")
                .and_then(Value::as_int)
                .and_then(|p| u16::try_from(p).ok())
                .filter(|p| *p != 0);
            match (port, implied_port) {
                (Some(port), _) => Query::AnnouncePeer {
                    id,
                    info_hash,
                    port,
                    implied_port,
                    token,
                },
                (None, true) => Query::AnnouncePeer {
                    id,
                    info_hash,
                    port: 0,
                    implied_port,
                    token,
                },
                (None, false) => Query::Malformed {
                    reason: "invalid port",
                },
            }
        }
        _ => Query::Unknown { id, method },
    }
}

// ------------------------------
// Construction
// ------------------------------

fn envelope<'a>(tx: &'a [u8], kind: &'a [u8], key: &'a [u8], body: Value<'a>) -> Vec<u8> {
    let mut root = BTreeMap::new();
    root.insert(&b"t"[..], Value::Bytes(tx));
    root.insert(&b"y"[..], Value::Bytes(kind));
    root.insert(key, body);
    bencode::encode(&Value::Dict(root))
}

pub fn find_node_query(tx: &[u8], id: &NodeId, target: &[u8; 20]) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(&b"id"[..], Value::Bytes(id.as_bytes()));
    args.insert(&b"target"[..], Value::Bytes(target));

    let mut root = BTreeMap::new();
    root.insert(&b"t"[..], Value::Bytes(tx));
    root.insert(&b"y"[..], Value::Bytes(b"q"));
    root.insert(&b"q"[..], Value::Bytes(b"find_node"));
    root.insert(&b"a"[..], Value::Dict(args));
    bencode::encode(&Value::Dict(root))
}

pub fn id_reply(tx: &[u8], id: &NodeId) -> Vec<u8> {
    let mut r = BTreeMap::new();
    r.insert(&b"id"[..], Value::Bytes(id.as_bytes()));
    envelope(tx, b"r", b"r", Value::Dict(r))
}

/// `find_node` reply; `nodes`/`nodes6` are chosen by the family of each entry.
pub fn find_node_reply(tx: &[u8], id: &NodeId, closest: &[RoutingEntry]) -> Vec<u8> {
    nodes_reply(tx, id, None, closest)
}

pub fn get_peers_reply(tx: &[u8], id: &NodeId, token: &[u8], closest: &[RoutingEntry]) -> Vec<u8> {
    nodes_reply(tx, id, Some(token), closest)
}

fn nodes_reply(tx: &[u8], id: &NodeId, token: Option<&[u8]>, closest: &[RoutingEntry]) -> Vec<u8> {
    let (v4, v6) = encode_compact_nodes(closest);
    let mut r = BTreeMap::new();
    r.insert(&b"id"[..], Value::Bytes(id.as_bytes()));
    // `nodes` is always present, possibly empty; some clients treat its
    // absence as a malformed reply.
    r.insert(&b"nodes"[..], Value::Bytes(&v4));
    if !v6.is_empty() {
        r.insert(&b"nodes6"[..], Value::Bytes(&v6));
    }
    if let Some(token) = token {
        r.insert(&b"token"[..], Value::Bytes(token));
    }
    envelope(tx, b"r", b"r", Value::Dict(r))
}

pub fn error_reply(tx: &[u8], code: i64, message: &str) -> Vec<u8> {
    let e = Value::List(vec![Value::Int(code), Value::Bytes(message.as_bytes())]);
    envelope(tx, b"e", b"e", e)
}

// ------------------------------
// Compact node info
// ------------------------------

pub fn encode_compact_nodes(entries: &[RoutingEntry]) -> (Vec<u8>, Vec<u8>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for e in entries {
        match e.addr.ip() {
            IpAddr::V4(ip) => {
                v4.extend_from_slice(e.id.as_bytes());
                v4.extend_from_slice(&ip.octets());
                v4.extend_from_slice(&e.addr.port().to_be_bytes());
            }
            IpAddr::V6(ip) => {
                v6.extend_from_slice(e.id.as_bytes());
                v6.extend_from_slice(&ip.octets());
                v6.extend_from_slice(&e.addr.port().to_be_bytes());
            }
        }
    }
    (v4, v6)
}

/// Compact node info: 20-byte id + 4-byte IPv4 + 2-byte port per node.
pub fn parse_compact_nodes(nodes: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    nodes
        .chunks_exact(COMPACT_NODE_V4)
        .filter_map(|c| {
            let id = NodeId::from_slice(&c[..20])?;
            let ip = Ipv4Addr::new(c[20], c[21], c[22], c[23]);
            let port = u16::from_be_bytes([c[24], c[25]]);
            Some((id, SocketAddr::new(IpAddr::V4(ip), port)))
        })
        .collect()
}

/// nodes6: 20-byte id + 16-byte IPv6 + 2-byte port per node.
pub fn parse_compact_nodes6(nodes: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    nodes
        .chunks_exact(COMPACT_NODE_V6)
        .filter_map(|c| {
            let id = NodeId::from_slice(&c[..20])?;
            let octets: [u8; 16] = c[20..36].try_into().ok()?;
            let port = u16::from_be_bytes([c[36], c[37]]);
            Some((id, SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn entry(b: u8, addr: &str) -> RoutingEntry {
        RoutingEntry {
            id: NodeId([b; 20]),
            addr: addr.parse().unwrap(),
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn parses_get_peers_query() {
        let raw = b"d1:ad2:id20:abcdefghij01234567899:info_hash20:mnopqrstuvwxyz123456e1:q9:get_peers1:t2:aa1:y1:qe";
        let msg = Message::parse(raw).unwrap();
        let Message::Query { tx, query } = msg else {
            panic!("expected query");
        };
        assert_eq!(tx, b"aa");
        assert_eq!(query.info_hash(), Some(*b"mnopqrstuvwxyz123456"));
        assert_eq!(query.sender_id(), Some(NodeId(*b"abcdefghij0123456789")));
    }

    #[test]
    fn parses_announce_with_implied_port() {
        let raw = b"d1:ad2:id20:abcdefghij012345678912:implied_porti1e9:info_hash20:mnopqrstuvwxyz1234564:porti0e5:token8:aoeusnthe1:q13:announce_peer1:t2:aa1:y1:qe";
        let Some(Message::Query { query, .. }) = Message::parse(raw) else {
            panic!("expected query");
        };
        assert_eq!(
            query,
            Query::AnnouncePeer {
                id: NodeId(*b"abcdefghij0123456789"),
                info_hash: *b"mnopqrstuvwxyz123456",
                port: 0,
                implied_port: true,
                token: b"aoeusnth",
            }
        );
    }

    #[test]
    fn flags_bad_arguments_but_keeps_transaction() {
        let raw = b"d1:ad2:id3:abce1:q4:ping1:t2:zz1:y1:qe";
        assert_eq!(
            Message::parse(raw),
            Some(Message::Query {
                tx: b"zz",
                query: Query::Malformed {
                    reason: "invalid id"
                },
            })
        );
    }

    #[test]
    fn drops_garbage() {
        assert_eq!(Message::parse(b""), None);
        assert_eq!(Message::parse(b"not bencode"), None);
        assert_eq!(Message::parse(b"d1:y1:qe"), None); // no transaction id
        assert_eq!(Message::parse(b"d1:t2:aa1:y1:re"), None); // response without body
    }

    #[test]
    fn replies_are_well_formed() {
        let id = NodeId([7u8; 20]);
        let closest = [entry(1, "1.2.3.4:5"), entry(2, "[2001::1]:6")];
        let raw = get_peers_reply(b"tx", &id, b"tok", &closest);
        let v = bencode::decode(&raw).unwrap();
        assert_eq!(v.get(b"t").unwrap().as_bytes(), Some(&b"tx"[..]));
        assert_eq!(v.get(b"y").unwrap().as_bytes(), Some(&b"r"[..]));
        let r = v.get(b"r").unwrap();
        assert_eq!(r.get(b"token").unwrap().as_bytes(), Some(&b"tok"[..]));

        let nodes = parse_compact_nodes(r.get(b"nodes").unwrap().as_bytes().unwrap());
        assert_eq!(nodes, vec![(NodeId([1u8; 20]), "1.2.3.4:5".parse().unwrap())]);
        let nodes6 = parse_compact_nodes6(r.get(b"nodes6").unwrap().as_bytes().unwrap());
        assert_eq!(nodes6, vec![(NodeId([2u8; 20]), "[2001::1]:6".parse().unwrap())]);
    }

    #[test]
    fn error_reply_layout() {
        assert_eq!(
            error_reply(b"aa", ERR_METHOD_UNKNOWN, "Method Unknown"),
            b"d1:eli204e14:Method Unknowne1:t2:aa1:y1:ee".to_vec()
        );
    }

    #[test]
    fn find_node_query_roundtrips_through_parser() {
        let id = NodeId([3u8; 20]);
        let raw = find_node_query(b"\x00\x01", &id, &[9u8; 20]);
        assert_eq!(
            Message::parse(&raw),
            Some(Message::Query {
                tx: b"\x00\x01",
                query: Query::FindNode {
                    id,
                    target: [9u8; 20]
                },
            })
        );
    }
}
