use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use nix::sys::socket::{SockaddrLike, SockaddrStorage};

use crate::error::{ErrorKind, ToolError};
use crate::tools::{Args, ParamSchema, ToolDef, ToolHandler, ToolRegistry};
use crate::types::ToolResult;

const SYS_NET: &str = "/sys/class/net";
const IFF_UP: u32 = 0x1;

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(ToolDef::new(
        "get_network_interfaces",
        "List network interfaces with their addresses, netmasks and broadcast addresses.",
        ParamSchema::new(),
        InterfaceTool::new(InterfaceOp::Addresses),
    ));
    registry.register(ToolDef::new(
        "get_network_stats",
        "Byte, packet, error and drop counters for every network interface.",
        ParamSchema::new(),
        InterfaceTool::new(InterfaceOp::Stats),
    ));
    registry.register(ToolDef::new(
        "get_interface_status",
        "Up/down state, link speed, duplex and MTU of every network interface.",
        ParamSchema::new(),
        InterfaceTool::new(InterfaceOp::Status),
    ));
}

#[derive(Debug, Clone, Copy)]
enum InterfaceOp {
    Addresses,
    Stats,
    Status,
}

struct InterfaceTool {
    op: InterfaceOp,
    sys_net: PathBuf,
}

impl InterfaceTool {
    fn new(op: InterfaceOp) -> Self {
        Self {
            op,
            sys_net: PathBuf::from(SYS_NET),
        }
    }
}

#[async_trait]
impl ToolHandler for InterfaceTool {
    async fn call(&self, _args: &Args) -> ToolResult {
        match self.op {
            InterfaceOp::Addresses => addresses(),
            InterfaceOp::Stats => stats(&self.sys_net).await,
            InterfaceOp::Status => status(&self.sys_net).await,
        }
    }
}

fn heading(title: &str) -> String {
    format!("{title}\n{}\n", "=".repeat(50))
}

fn interface_heading(out: &mut String, name: &str) {
    let _ = write!(out, "\nInterface: {name}\n{}\n", "-".repeat(30));
}

fn describe(addr: &SockaddrStorage) -> (String, String) {
    if let Some(v4) = addr.as_sockaddr_in() {
        ("IPv4".into(), v4.ip().to_string())
    } else if let Some(v6) = addr.as_sockaddr_in6() {
        ("IPv6".into(), v6.ip().to_string())
    } else if let Some(link) = addr.as_link_addr() {
        let mac = link
            .addr()
            .map(|bytes| {
                bytes
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":")
            })
            .unwrap_or_default();
        ("Link".into(), mac)
    } else {
        let family = addr
            .family()
            .map(|f| format!("{f:?}"))
            .unwrap_or_else(|| "Unknown".into());
        (family, addr.to_string())
    }
}

fn addresses() -> ToolResult {
    let ifaddrs = getifaddrs().map_err(|e| {
        ToolError::new(ErrorKind::Io, format!("failed to enumerate interfaces: {e}"))
    })?;

    let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for ifaddr in ifaddrs {
        let entries = by_name.entry(ifaddr.interface_name.clone()).or_default();
        let Some(address) = ifaddr.address.as_ref() else {
            continue;
        };
        let (family, addr) = describe(address);
        let mut entry = format!("    Family: {family}\n    Address: {addr}\n");
        if let Some(mask) = ifaddr.netmask.as_ref() {
            let _ = writeln!(entry, "    Netmask: {}", describe(mask).1);
        }
        if let Some(broadcast) = ifaddr.broadcast.as_ref() {
            let _ = writeln!(entry, "    Broadcast: {}", describe(broadcast).1);
        }
        if let Some(ptp) = ifaddr.destination.as_ref() {
            let _ = writeln!(entry, "    PTP: {}", describe(ptp).1);
        }
        entries.push(entry);
    }

    let mut out = heading("Network Interfaces");
    for (name, entries) in by_name {
        interface_heading(&mut out, &name);
        for (i, entry) in entries.iter().enumerate() {
            let _ = write!(out, "  Address {}:\n{entry}\n", i + 1);
        }
    }
    Ok(out)
}

/// Interface names under the sysfs net directory, sorted.
async fn interface_names(sys_net: &Path) -> Result<Vec<String>, ToolError> {
    let shown = sys_net.display().to_string();
    let mut reader = tokio::fs::read_dir(sys_net)
        .await
        .map_err(|e| ToolError::from_io(&shown, &e))?;
    let mut names = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| ToolError::from_io(&shown, &e))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// One sysfs attribute, trimmed. `None` when missing or unreadable,
/// which is normal for e.g. `speed` on a link that is down.
async fn attribute(path: PathBuf) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

async fn counter(dir: &Path, name: &str) -> u64 {
    attribute(dir.join("statistics").join(name))
        .await
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// `1234567` → `1,234,567`.
fn grouped(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

async fn stats(sys_net: &Path) -> ToolResult {
    let mut out = heading("Network Interface Statistics");
    for name in interface_names(sys_net).await? {
        let dir = sys_net.join(&name);
        interface_heading(&mut out, &name);
        for (label, file) in [
            ("Bytes Sent", "tx_bytes"),
            ("Bytes Received", "rx_bytes"),
            ("Packets Sent", "tx_packets"),
            ("Packets Received", "rx_packets"),
            ("Errors In", "rx_errors"),
            ("Errors Out", "tx_errors"),
            ("Drops In", "rx_dropped"),
            ("Drops Out", "tx_dropped"),
        ] {
            let _ = writeln!(out, "  {label}: {}", grouped(counter(&dir, file).await));
        }
    }
    Ok(out)
}

async fn status(sys_net: &Path) -> ToolResult {
    let mut out = heading("Network Interface Status");
    for name in interface_names(sys_net).await? {
        let dir = sys_net.join(&name);
        let flags = attribute(dir.join("flags"))
            .await
            .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0);
        let up = if flags & IFF_UP != 0 { "UP" } else { "DOWN" };
        let operstate = attribute(dir.join("operstate"))
            .await
            .unwrap_or_else(|| "unknown".into());
        let speed = attribute(dir.join("speed"))
            .await
            .filter(|s| !s.starts_with('-'))
            .unwrap_or_else(|| "0".into());
        let duplex = attribute(dir.join("duplex"))
            .await
            .map(|d| d.to_uppercase())
            .filter(|d| d == "FULL" || d == "HALF")
            .unwrap_or_else(|| "UNKNOWN".into());
        let mtu = attribute(dir.join("mtu")).await.unwrap_or_else(|| "unknown".into());

        interface_heading(&mut out, &name);
        let _ = writeln!(out, "  Status: {up}");
        let _ = writeln!(out, "  Operstate: {operstate}");
        let _ = writeln!(out, "  Speed: {speed} Mbps");
        let _ = writeln!(out, "  Duplex: {duplex}");
        let _ = writeln!(out, "  MTU: {mtu}");
    }
    Ok(out)
}
