//! The allocation table: one CSV row per provisioned node
//!
//! Rows are only ever appended. The encoded form always starts with the
//! exact header `NodeKey,RouterKey,NodeName,NodeIP,PodNet` and uses `\n`
//! line endings regardless of what the parser was fed.

use crate::{ApiError, Result};
use serde::{Deserialize, Serialize};

/// Column order of the encoded table
pub const ALLOCATION_FIELDS: [&str; 5] = ["NodeKey", "RouterKey", "NodeName", "NodeIP", "PodNet"];

/// A node's slice of the address space
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAllocation {
    /// Node WireGuard public key; unique per row
    #[serde(rename = "NodeKey")]
    pub node_key: String,
    /// Public key of the router the addresses were carved from
    #[serde(rename = "RouterKey")]
    pub router_key: String,
    #[serde(rename = "NodeName")]
    pub node_name: String,
    /// Single tunnel address, without prefix length
    #[serde(rename = "NodeIP")]
    pub node_ip: String,
    /// Pod subnet in CIDR form
    #[serde(rename = "PodNet")]
    pub pod_net: String,
}

/// Ordered set of allocations as stored in the allocation ConfigMap
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationTable {
    rows: Vec<NodeAllocation>,
}

impl AllocationTable {
    pub fn new(rows: Vec<NodeAllocation>) -> Self {
        Self { rows }
    }

    /// Text of a freshly bootstrapped table: the header row only
    pub fn empty_text() -> String {
        format!("{}\n", ALLOCATION_FIELDS.join(","))
    }

    /// Parse the CSV text of the `table` key
    pub fn parse(raw: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(raw.as_bytes());

        let mut rows = Vec::new();
        for result in reader.deserialize() {
            let row: NodeAllocation = result?;
            rows.push(row);
        }

        Ok(Self { rows })
    }

    /// Encode back to CSV text with `\n` line endings
    pub fn encode(&self) -> Result<String> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(vec![]);

        wtr.write_record(ALLOCATION_FIELDS)?;
        for row in &self.rows {
            wtr.write_record([
                &row.node_key,
                &row.router_key,
                &row.node_name,
                &row.node_ip,
                &row.pod_net,
            ])?;
        }

        let data = wtr
            .into_inner()
            .map_err(|e| ApiError::EncodingError(format!("CSV writer error: {}", e)))?;
        let text = String::from_utf8(data)
            .map_err(|e| ApiError::EncodingError(format!("UTF-8 conversion error: {}", e)))?;
        Ok(text.replace("\r\n", "\n"))
    }

    /// Find the row for a node public key
    pub fn find_by_node_key(&self, node_key: &str) -> Option<&NodeAllocation> {
        self.rows.iter().find(|row| row.node_key == node_key)
    }

    /// Rows carved from a given router
    pub fn for_router<'a>(&'a self, router_key: &'a str) -> impl Iterator<Item = &'a NodeAllocation> {
        self.rows.iter().filter(move |row| row.router_key == router_key)
    }

    pub fn push(&mut self, row: NodeAllocation) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[NodeAllocation] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, name: &str, ip: &str, net: &str) -> NodeAllocation {
        NodeAllocation {
            node_key: key.to_string(),
            router_key: "router=".to_string(),
            node_name: name.to_string(),
            node_ip: ip.to_string(),
            pod_net: net.to_string(),
        }
    }

    #[test]
    fn test_empty_table_text() {
        assert_eq!(AllocationTable::empty_text(), "NodeKey,RouterKey,NodeName,NodeIP,PodNet\n");
        let table = AllocationTable::parse(&AllocationTable::empty_text()).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.encode().unwrap(), AllocationTable::empty_text());
    }

    #[test]
    fn test_round_trip_with_crlf_input() {
        let table = AllocationTable::new(vec![
            row("a+b/c=", "pet-1", "10.1.0.1", "10.2.0.0/24"),
            row("d+e/f=", "pet-2", "10.1.0.2", "10.2.1.0/24"),
        ]);
        let encoded = table.encode().unwrap();
        assert!(!encoded.contains('\r'));
        assert!(encoded.starts_with("NodeKey,RouterKey,NodeName,NodeIP,PodNet\n"));

        let crlf = encoded.replace('\n', "\r\n");
        assert_eq!(AllocationTable::parse(&crlf).unwrap(), table);
        assert_eq!(AllocationTable::parse(&encoded).unwrap(), table);
    }

    #[test]
    fn test_lookup_helpers() {
        let mut table = AllocationTable::default();
        table.push(row("k1=", "pet-1", "10.1.0.1", "10.2.0.0/24"));
        table.push(NodeAllocation {
            router_key: "other=".to_string(),
            ..row("k2=", "pet-2", "10.5.0.1", "10.6.0.0/24")
        });

        assert_eq!(table.find_by_node_key("k2=").unwrap().node_name, "pet-2");
        assert!(table.find_by_node_key("k3=").is_none());
        assert_eq!(table.for_router("router=").count(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let raw = "NodeKey,RouterKey,NodeName\nk,r,n\n";
        assert!(AllocationTable::parse(raw).is_err());
    }
}
