//! CPU definitions for the mock host: parsing, comparison and baseline.
//!
//! Models are ranked oldest to newest; a newer model is assumed to run
//! everything an older one does.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Known CPU models, oldest first.
pub const CPU_MODELS: &[&str] = &[
    "486",
    "pentium",
    "pentium2",
    "pentium3",
    "athlon",
    "qemu64",
    "core2duo",
    "Nehalem",
    "Westmere",
    "SandyBridge",
    "Haswell",
];

/// Position of a model in [`CPU_MODELS`].
pub fn model_rank(model: &str) -> Option<usize> {
    CPU_MODELS.iter().position(|known| known.eq_ignore_ascii_case(model))
}

/// The CPU of a mock host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCpu {
    pub arch: String,
    pub model: String,
    pub vendor: String,
    pub features: Vec<String>,
}

impl Default for HostCpu {
    fn default() -> Self {
        Self {
            arch: "x86_64".to_string(),
            model: "Haswell".to_string(),
            vendor: "Intel".to_string(),
            features: ["vmx", "aes", "avx", "avx2", "sse4.2", "x2apic"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl HostCpu {
    fn as_definition(&self) -> CpuDefinition {
        CpuDefinition {
            arch: Some(self.arch.clone()),
            model: Some(self.model.clone()),
            features: self.features.iter().cloned().collect(),
        }
    }
}

// =============================================================================
// XML
// =============================================================================

#[derive(Debug, Deserialize)]
struct CpuXml {
    #[serde(default)]
    arch: Option<String>,
    #[serde(default)]
    model: Option<ModelXml>,
    #[serde(rename = "feature", default)]
    features: Vec<FeatureXml>,
}

#[derive(Debug, Deserialize)]
struct ModelXml {
    #[serde(rename = "$value", default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeatureXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@policy", default)]
    policy: Option<String>,
}

impl FeatureXml {
    /// Features the guest cannot do without.
    fn is_required(&self) -> bool {
        matches!(self.policy.as_deref(), None | Some("require") | Some("force"))
    }
}

/// A parsed CPU definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuDefinition {
    pub arch: Option<String>,
    pub model: Option<String>,
    /// Required features only
    pub features: BTreeSet<String>,
}

impl CpuDefinition {
    /// Parse a `<cpu>` document.
    pub fn parse(xml: &str) -> Result<Self, String> {
        let xml = xml.trim();
        if !xml.starts_with("<cpu") {
            return Err("document is not a CPU definition".to_string());
        }

        let parsed: CpuXml =
            quick_xml::de::from_str(xml).map_err(|e| format!("malformed CPU XML: {}", e))?;

        let model = parsed
            .model
            .and_then(|model| model.name)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let arch = parsed
            .arch
            .map(|arch| arch.trim().to_string())
            .filter(|arch| !arch.is_empty());

        if model.is_none() && arch.is_none() {
            return Err("CPU definition has neither a model nor an arch".to_string());
        }

        Ok(Self {
            arch,
            model,
            features: parsed
                .features
                .into_iter()
                .filter(FeatureXml::is_required)
                .map(|feature| feature.name)
                .collect(),
        })
    }

    fn rank(&self) -> Result<Option<usize>, String> {
        match &self.model {
            Some(model) => model_rank(model)
                .map(Some)
                .ok_or_else(|| format!("unknown CPU model '{}'", model)),
            None => Ok(None),
        }
    }
}

/// Outcome of [`compare`], mirroring `CpuCompareResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Incompatible,
    Identical,
    Superset,
}

/// Compare a guest CPU definition against the host CPU.
pub fn compare(host: &HostCpu, guest_xml: &str) -> Result<Comparison, String> {
    let guest = CpuDefinition::parse(guest_xml)?;
    let host = host.as_definition();

    let guest_rank = guest.rank()?;
    let host_rank = host.rank()?.unwrap_or(0);

    if let Some(arch) = &guest.arch {
        if host.arch.as_deref() != Some(arch.as_str()) {
            return Ok(Comparison::Incompatible);
        }
    }
    if !guest.features.is_subset(&host.features) {
        return Ok(Comparison::Incompatible);
    }

    match guest_rank {
        Some(rank) if rank > host_rank => Ok(Comparison::Incompatible),
        Some(rank) if rank == host_rank && guest.features == host.features => {
            Ok(Comparison::Identical)
        }
        _ => Ok(Comparison::Superset),
    }
}

/// Compute the baseline CPU of several definitions.
///
/// The result uses the oldest model and only the features all definitions
/// require. Definitions for different architectures have no baseline.
pub fn baseline(cpu_xmls: &[String]) -> Result<String, String> {
    let mut cpus = Vec::with_capacity(cpu_xmls.len());
    for (index, xml) in cpu_xmls.iter().enumerate() {
        let cpu = CpuDefinition::parse(xml).map_err(|e| format!("CPU {}: {}", index, e))?;
        cpus.push(cpu);
    }

    let mut arch: Option<&str> = None;
    for cpu in &cpus {
        if let Some(cpu_arch) = cpu.arch.as_deref() {
            match arch {
                Some(existing) if existing != cpu_arch => {
                    return Err(format!(
                        "CPUs are incompatible: architectures {} and {} differ",
                        existing, cpu_arch
                    ))
                }
                _ => arch = Some(cpu_arch),
            }
        }
    }

    let mut lowest: Option<usize> = None;
    for cpu in &cpus {
        if let Some(rank) = cpu.rank()? {
            lowest = Some(lowest.map_or(rank, |current| current.min(rank)));
        }
    }
    let model = lowest
        .map(|rank| CPU_MODELS[rank])
        .ok_or_else(|| "no CPU model to compute a baseline from".to_string())?;

    let mut features = cpus[0].features.clone();
    for cpu in &cpus[1..] {
        features = features.intersection(&cpu.features).cloned().collect();
    }

    let mut xml = String::from("<cpu mode='custom' match='exact'>\n");
    if let Some(arch) = arch {
        xml.push_str(&format!("  <arch>{}</arch>\n", arch));
    }
    xml.push_str(&format!("  <model fallback='forbid'>{}</model>\n", model));
    for feature in &features {
        xml.push_str(&format!("  <feature policy='require' name='{}'/>\n", feature));
    }
    xml.push_str("</cpu>\n");
    Ok(xml)
}
