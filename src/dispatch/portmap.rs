//! Embedded portmapper (RFC 1057 appendix A).
//!
//! Answers GETPORT and DUMP for the RPC programs this server hosts. The
//! registration table starts with the portmapper itself plus the NFS and
//! MOUNT programs at the active NFS port; SET/UNSET are accepted from
//! local callers so auxiliary services can register too.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

/// Well-known RPC program numbers.
pub const PROG_PORTMAP: u32 = 100_000;
pub const PROG_NFS: u32 = 100_003;
pub const PROG_MOUNT: u32 = 100_005;

/// Transport protocols a mapping can be registered under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

/// One registered mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub program: u32,
    pub version: u32,
    pub transport: Transport,
    pub port: u16,
}

/// Decoded portmap procedures.
#[derive(Debug, Clone)]
pub enum PortmapRequest {
    Null,
    GetPort { program: u32, version: u32, transport: Transport },
    Set(Mapping),
    Unset { program: u32, version: u32 },
    Dump,
}

/// Decoded portmap replies.
#[derive(Debug, Clone, PartialEq)]
pub enum PortmapReply {
    Null,
    /// Port 0 means "not registered".
    Port(u32),
    Bool(bool),
    Dump(Vec<Mapping>),
}

/// The registration table.
#[derive(Default)]
pub struct PortmapTable {
    mappings: RwLock<HashMap<(u32, u32, Transport), u16>>,
}

impl PortmapTable {
    /// Table pre-registered with the portmapper, NFS and MOUNT programs
    /// at the given ports.
    pub fn with_defaults(portmapper_port: u16, nfs_port: u16) -> PortmapTable {
        let table = PortmapTable::default();
        for transport in [Transport::Tcp, Transport::Udp] {
            table.set(Mapping {
                program: PROG_PORTMAP,
                version: 2,
                transport,
                port: portmapper_port,
            });
            table.set(Mapping { program: PROG_NFS, version: 3, transport, port: nfs_port });
            table.set(Mapping { program: PROG_NFS, version: 4, transport, port: nfs_port });
            table.set(Mapping {
                program: PROG_MOUNT,
                version: 3,
                transport,
                port: nfs_port,
            });
        }
        table
    }

    pub fn set(&self, mapping: Mapping) -> bool {
        match self.mappings.write() {
            Ok(mut map) => {
                map.insert(
                    (mapping.program, mapping.version, mapping.transport),
                    mapping.port,
                );
                true
            }
            Err(_) => false,
        }
    }

    pub fn unset(&self, program: u32, version: u32) -> bool {
        match self.mappings.write() {
            Ok(mut map) => {
                let before = map.len();
                map.retain(|(p, v, _), _| !(*p == program && *v == version));
                map.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn get_port(&self, program: u32, version: u32, transport: Transport) -> u16 {
        self.mappings
            .read()
            .ok()
            .and_then(|map| map.get(&(program, version, transport)).copied())
            .unwrap_or(0)
    }

    pub fn dump(&self) -> Vec<Mapping> {
        let Ok(map) = self.mappings.read() else { return Vec::new() };
        let mut mappings: Vec<Mapping> = map
            .iter()
            .map(|((program, version, transport), port)| Mapping {
                program: *program,
                version: *version,
                transport: *transport,
                port: *port,
            })
            .collect();
        mappings.sort_by_key(|m| (m.program, m.version, m.port));
        mappings
    }
}

/// The portmap router.
pub struct PortmapDispatcher {
    table: PortmapTable,
}

impl PortmapDispatcher {
    pub fn new(table: PortmapTable) -> PortmapDispatcher {
        PortmapDispatcher { table }
    }

    pub fn table(&self) -> &PortmapTable {
        &self.table
    }

    /// Dispatches one decoded portmap procedure.
    pub fn handle(&self, request: PortmapRequest) -> PortmapReply {
        match request {
            PortmapRequest::Null => PortmapReply::Null,
            PortmapRequest::GetPort { program, version, transport } => {
                let port = self.table.get_port(program, version, transport);
                debug!(program, version, port, "portmap getport");
                PortmapReply::Port(port as u32)
            }
            PortmapRequest::Set(mapping) => PortmapReply::Bool(self.table.set(mapping)),
            PortmapRequest::Unset { program, version } => {
                PortmapReply::Bool(self.table.unset(program, version))
            }
            PortmapRequest::Dump => PortmapReply::Dump(self.table.dump()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_register_core_programs() {
        let table = PortmapTable::with_defaults(111, 2049);
        assert_eq!(table.get_port(PROG_PORTMAP, 2, Transport::Tcp), 111);
        assert_eq!(table.get_port(PROG_NFS, 3, Transport::Tcp), 2049);
        assert_eq!(table.get_port(PROG_MOUNT, 3, Transport::Udp), 2049);
        assert_eq!(table.get_port(PROG_NFS, 2, Transport::Tcp), 0);
    }

    #[test]
    fn set_unset_round_trip() {
        let dispatcher = PortmapDispatcher::new(PortmapTable::default());
        let mapping =
            Mapping { program: 100_021, version: 4, transport: Transport::Tcp, port: 4045 };
        assert_eq!(dispatcher.handle(PortmapRequest::Set(mapping)), PortmapReply::Bool(true));
        assert_eq!(
            dispatcher.handle(PortmapRequest::GetPort {
                program: 100_021,
                version: 4,
                transport: Transport::Tcp
            }),
            PortmapReply::Port(4045)
        );
        assert_eq!(
            dispatcher.handle(PortmapRequest::Unset { program: 100_021, version: 4 }),
            PortmapReply::Bool(true)
        );
        assert_eq!(
            dispatcher.handle(PortmapRequest::GetPort {
                program: 100_021,
                version: 4,
                transport: Transport::Tcp
            }),
            PortmapReply::Port(0)
        );
    }

    #[test]
    fn dump_lists_everything() {
        let table = PortmapTable::with_defaults(111, 2049);
        let dump = table.dump();
        assert!(dump.iter().any(|m| m.program == PROG_NFS && m.transport == Transport::Udp));
        assert_eq!(dump.len(), 8);
    }
}
