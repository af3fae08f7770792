// Per-device snapshot document parser
//
// Collectors write one JSON document per device. Field names and protocol spellings
// differ by vendor, so records are read leniently from `serde_json::Value` and any
// record that cannot be understood is skipped with a warning instead of failing the
// whole device.

use super::{
    Adjacency, DEFAULT_VRF, DeviceSnapshot, LabelAction, LabelBinding, LabelOperation, Protocol,
    RouteEntry, parse_prefix,
};
use crate::error::{TracerError, TracerResult};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::net::IpAddr;

/// Parse one device document. `fallback_name` is used when the document does not name
/// its device (typically the file stem).
pub fn parse_device_document(json_str: &str, fallback_name: &str) -> TracerResult<DeviceSnapshot> {
    let doc: Value = serde_json::from_str(json_str)?;
    if !doc.is_object() {
        return Err(TracerError::Snapshot(format!(
            "{}: snapshot document must be a JSON object",
            fallback_name
        )));
    }

    let device = str_field(&doc, &["device", "hostname", "host"])
        .unwrap_or(fallback_name)
        .to_string();
    let mut snapshot = DeviceSnapshot::new(device);
    snapshot.vendor = str_field(&doc, &["vendor", "platform"]).map(str::to_lowercase);
    snapshot.collected_at = str_field(&doc, &["collected_at", "timestamp"])
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));
    let local_as = u32_field(&doc, &["local_as", "asn"]);

    for (i, record) in array_field(&doc, &["routes", "rib"]).iter().enumerate() {
        match parse_route(record, local_as) {
            Ok((vrf, entries)) => {
                for entry in entries {
                    snapshot.add_route(&vrf, entry);
                }
            }
            Err(reason) => snapshot
                .warnings
                .push(format!("{}: route #{} skipped: {}", snapshot.device, i, reason)),
        }
    }

    for (i, record) in array_field(&doc, &["labels", "mpls"]).iter().enumerate() {
        match parse_label(record) {
            Ok(binding) => snapshot.labels.push(binding),
            Err(reason) => snapshot
                .warnings
                .push(format!("{}: label #{} skipped: {}", snapshot.device, i, reason)),
        }
    }

    for (i, record) in array_field(&doc, &["adjacencies", "isis", "neighbors"])
        .iter()
        .enumerate()
    {
        match parse_adjacency(record) {
            Ok(adjacency) => snapshot.adjacencies.push(adjacency),
            Err(reason) => snapshot
                .warnings
                .push(format!("{}: adjacency #{} skipped: {}", snapshot.device, i, reason)),
        }
    }

    for warning in &snapshot.warnings {
        tracing::warn!("{}", warning);
    }

    Ok(snapshot)
}

/// One route record may carry several next-hops (ECMP); each becomes its own entry.
fn parse_route(record: &Value, local_as: Option<u32>) -> Result<(String, Vec<RouteEntry>), String> {
    let raw_prefix = str_field(record, &["prefix", "destination", "dst", "rt-destination"])
        .ok_or("missing prefix")?;
    let prefix = parse_prefix(raw_prefix).ok_or_else(|| format!("malformed prefix {}", raw_prefix))?;

    let vrf = normalize_vrf(str_field(record, &["vrf", "table", "routing-instance"]));

    let as_path = match field(record, &["as_path", "as-path"]) {
        Some(Value::String(s)) => parse_as_path(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .filter_map(|v| u32::try_from(v).ok())
            .collect(),
        _ => Vec::new(),
    };

    let peer_as = u32_field(record, &["peer_as", "peer-as"]);
    let protocol = normalize_protocol(
        str_field(record, &["protocol", "proto", "source-protocol"]).unwrap_or("unknown"),
        str_field(record, &["peer_type", "peer-type"]),
        peer_as,
        local_as,
        &as_path,
    );

    let communities = field(record, &["communities", "community"])
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                .collect()
        })
        .unwrap_or_default();

    let active = match field(record, &["active", "best", "selected"]) {
        Some(Value::Bool(b)) => *b,
        _ => field(record, &["flags"])
            .and_then(Value::as_array)
            .is_some_and(|flags| flags.iter().any(|f| f.as_str() == Some("*"))),
    };

    let mut template = RouteEntry::new(prefix, protocol);
    template.as_path = as_path;
    template.communities = communities;
    template.local_pref = u32_field(record, &["local_pref", "local-preference", "localpref"]);
    template.metric = u32_field(record, &["metric", "med", "igp_cost"]);
    template.active = active;
    template.peer = str_field(record, &["peer", "source", "peer-id"]).map(str::to_string);
    template.interface = str_field(record, &["interface", "dev", "via_interface"]).map(str::to_string);
    template.next_vrf = str_field(record, &["next_vrf", "next-table"]).map(|v| normalize_vrf(Some(v)));

    let next_hops = next_hops(record)?;
    if next_hops.is_empty() {
        let listed = field(record, &["next_hops", "nexthops"]).is_some();
        if listed && matches!(protocol, Protocol::Ibgp | Protocol::Ebgp) {
            return Err("empty next-hop list on a BGP route".to_string());
        }
        return Ok((vrf, vec![template]));
    }

    let entries = next_hops
        .into_iter()
        .map(|nh| {
            let mut entry = template.clone();
            entry.next_hop = Some(nh);
            entry
        })
        .collect();
    Ok((vrf, entries))
}

fn next_hops(record: &Value) -> Result<Vec<IpAddr>, String> {
    if let Some(list) = field(record, &["next_hops", "nexthops"]).and_then(Value::as_array) {
        return list
            .iter()
            .map(|v| {
                v.as_str()
                    .and_then(parse_next_hop)
                    .ok_or_else(|| format!("malformed next-hop {}", v))
            })
            .collect();
    }

    match str_field(record, &["next_hop", "nexthop", "gateway", "via", "to"]) {
        None => Ok(Vec::new()),
        Some(s) if s.is_empty() || s == "self" || s == "0.0.0.0" => Ok(Vec::new()),
        Some(s) => parse_next_hop(s)
            .map(|nh| vec![nh])
            .ok_or_else(|| format!("malformed next-hop {}", s)),
    }
}

fn parse_next_hop(raw: &str) -> Option<IpAddr> {
    raw.trim()
        .split('/')
        .next()
        .and_then(|addr| addr.parse().ok())
}

fn parse_label(record: &Value) -> Result<LabelBinding, String> {
    let fec = match str_field(record, &["fec", "prefix", "destination"]) {
        Some(raw) => parse_prefix(raw).ok_or_else(|| format!("malformed FEC {}", raw))?,
        None => return Err("missing FEC".to_string()),
    };

    let action = match str_field(record, &["action", "operation"]).map(str::to_lowercase) {
        Some(a) if a == "push" => LabelAction::Push,
        Some(a) if a == "swap" => LabelAction::Swap,
        Some(a) if a == "pop" || a == "php" => LabelAction::Pop,
        Some(other) => return Err(format!("unknown label action {}", other)),
        None => return Err("missing label action".to_string()),
    };

    let label = u32_field(record, &["label", "label_out", "out-label"]).ok_or("missing label value")?;

    let next_hop = match str_field(record, &["next_hop", "nexthop"]) {
        None => None,
        Some(s) if s == "0.0.0.0" || s == "any" => None,
        Some(s) => Some(parse_next_hop(s).ok_or_else(|| format!("malformed next-hop {}", s))?),
    };

    Ok(LabelBinding {
        fec,
        next_hop,
        operation: LabelOperation {
            action,
            label,
            lsp: str_field(record, &["lsp", "lsp_name", "name"]).map(str::to_string),
        },
    })
}

fn parse_adjacency(record: &Value) -> Result<Adjacency, String> {
    let neighbor = str_field(record, &["neighbor", "system", "hostname"]).ok_or("missing neighbor")?;
    let neighbor_address = match str_field(record, &["address", "neighbor_address", "ip"]) {
        None => None,
        Some(s) => Some(parse_next_hop(s).ok_or_else(|| format!("malformed address {}", s))?),
    };

    Ok(Adjacency {
        neighbor: neighbor.to_string(),
        local_interface: str_field(record, &["interface", "local_interface"]).map(str::to_string),
        neighbor_address,
        protocol: str_field(record, &["protocol"]).map(str::to_lowercase),
    })
}

/// Map a vendor protocol spelling onto [`Protocol`].
///
/// Untyped BGP is internal when the peer shares the local AS (or the AS-path is empty)
/// and external otherwise.
pub fn normalize_protocol(
    raw: &str,
    peer_type: Option<&str>,
    peer_as: Option<u32>,
    local_as: Option<u32>,
    as_path: &[u32],
) -> Protocol {
    match raw.trim() {
        "C" | "Direct" => return Protocol::Connected,
        "L" | "Local" => return Protocol::Local,
        "S" | "S*" => return Protocol::Static,
        "O" => return Protocol::Ospf,
        "i" => return Protocol::Isis,
        "B" => return classify_bgp(peer_type, peer_as, local_as, as_path),
        _ => {}
    }

    match raw.trim().to_lowercase().as_str() {
        "connected" | "direct" | "kernel" => Protocol::Connected,
        "local" | "access-internal" => Protocol::Local,
        "static" | "access" => Protocol::Static,
        "policy" | "pbr" | "policy-route" => Protocol::Policy,
        "ebgp" => Protocol::Ebgp,
        "ibgp" => Protocol::Ibgp,
        "bgp" => classify_bgp(peer_type, peer_as, local_as, as_path),
        "ospf" | "ospf3" => Protocol::Ospf,
        "isis" | "is-is" => Protocol::Isis,
        "mpls" | "ldp" | "rsvp" | "l-isis" => Protocol::Mpls,
        _ => Protocol::Unknown,
    }
}

fn classify_bgp(
    peer_type: Option<&str>,
    peer_as: Option<u32>,
    local_as: Option<u32>,
    as_path: &[u32],
) -> Protocol {
    match peer_type.map(str::to_lowercase).as_deref() {
        Some("internal") | Some("ibgp") => return Protocol::Ibgp,
        Some("external") | Some("ebgp") => return Protocol::Ebgp,
        _ => {}
    }

    match (peer_as, local_as) {
        (Some(peer), Some(local)) if peer == local => Protocol::Ibgp,
        (Some(_), Some(_)) => Protocol::Ebgp,
        _ if as_path.is_empty() => Protocol::Ibgp,
        _ => Protocol::Ebgp,
    }
}

/// Junos names the global table `inet.0` and VRF tables `<vrf>.inet.0`.
pub fn normalize_vrf(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        None | Some("") | Some("global") | Some("inet.0") | Some("inet6.0") => DEFAULT_VRF.to_string(),
        Some(name) => name
            .strip_suffix(".inet.0")
            .or_else(|| name.strip_suffix(".inet6.0"))
            .unwrap_or(name)
            .to_string(),
    }
}

/// "7018 15169 I" / "AS path: 7018 15169 ?" style AS-path strings.
fn parse_as_path(raw: &str) -> Vec<u32> {
    raw.replace("AS path:", "")
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect()
}

fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| value.get(*k))
        .filter(|v| !v.is_null())
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    field(value, keys).and_then(Value::as_str)
}

fn u32_field(value: &Value, keys: &[&str]) -> Option<u32> {
    match field(value, keys)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn array_field<'a>(value: &'a Value, keys: &[&str]) -> &'a [Value] {
    field(value, keys)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
