//! mcpd Bibliothek
//! Lizenz: GPL V3
//! Daniel Sigg
//!
//! Märklin CAN Protokoll (MCP): Frames, Transporte, Dispatcher und Zustand der Anlage.
//! Der Daemon in main.rs startet daraus die konfigurierten Interfaces.

pub mod layout_cluster;
pub mod layout_lockable;
pub mod layout_object_identifier;
pub mod layout_objects;
pub mod layout_storage;
pub mod layout_world;
pub mod mcp_address;
pub mod mcp_commands;
pub mod mcp_config_stream;
pub mod mcp_crc;
pub mod mcp_cs2_file;
pub mod mcp_dispatcher;
pub mod mcp_frame;
pub mod mcp_server_tcp;
pub mod mcp_server_types;
pub mod mcp_transport;
#[cfg(feature = "socketcan")]
pub mod mcp_transport_can;
pub mod mcp_transport_serial;
pub mod mcp_transport_tcp;
pub mod mcp_transport_udp;
