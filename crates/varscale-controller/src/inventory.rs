use std::collections::BTreeMap;

use varscale_common::NodeInfo;

/// How one accelerator vendor labels its nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vendor {
    pub domain: String,
}

impl Vendor {
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into() }
    }

    pub fn product_label(&self) -> String {
        format!("{}/gpu.product", self.domain)
    }

    pub fn memory_label(&self) -> String {
        format!("{}/gpu.memory", self.domain)
    }

    pub fn resource_name(&self) -> String {
        format!("{}/gpu", self.domain)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceleratorInfo {
    pub count: u64,
    pub memory: String,
}

/// node -> accelerator model -> info
pub type Inventory = BTreeMap<String, BTreeMap<String, AcceleratorInfo>>;

#[derive(Debug, Clone)]
pub struct VendorRegistry {
    vendors: Vec<Vendor>,
}

impl Default for VendorRegistry {
    fn default() -> Self {
        Self {
            vendors: ["nvidia.com", "amd.com", "intel.com"]
                .into_iter()
                .map(Vendor::new)
                .collect(),
        }
    }
}

impl VendorRegistry {
    pub fn new(vendors: Vec<Vendor>) -> Self {
        Self { vendors }
    }

    pub fn vendors(&self) -> &[Vendor] {
        &self.vendors
    }

    /// Scan node labels once for every registered vendor.
    pub fn collect(&self, nodes: &[NodeInfo]) -> Inventory {
        let mut inv = Inventory::new();
        for node in nodes {
            for vendor in &self.vendors {
                let Some(model) = node.labels.get(&vendor.product_label()) else {
                    continue;
                };
                let info = AcceleratorInfo {
                    count: node.allocatable.get(&vendor.resource_name()).copied().unwrap_or(0),
                    memory: node.labels.get(&vendor.memory_label()).cloned().unwrap_or_default(),
                };
                tracing::debug!(node=%node.name, model=%model, count=info.count, memory=%info.memory, "found accelerators");
                inv.entry(node.name.clone()).or_default().insert(model.clone(), info);
            }
        }
        inv
    }
}

/// Units per accelerator model across all nodes.
pub fn totals(inventory: &Inventory) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for models in inventory.values() {
        for (model, info) in models {
            *out.entry(model.clone()).or_insert(0) += info.count;
        }
    }
    out
}
