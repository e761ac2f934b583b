//! Trace preamble: format tag, version and the recorded environment block

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use crate::error::FormatError;
use crate::lexer::{split_fields, FieldList, LineSplit, TraceLine};
use crate::live::LiveEnvironment;
use crate::types::{FormatVersion, Verbosity};

/// Format tag written by the recorder on line 1
pub const DEFAULT_FORMAT_TAG: &str = "Vulkan Memory Allocator,Calls recording";

/// First version whose recordings may carry a `Config` block
pub const CONFIG_BLOCK_VERSION: FormatVersion = FormatVersion::new(1, 3);

pub const SUPPORTED_MAJOR: u32 = 1;
pub const MAX_SUPPORTED_MINOR: u32 = 8;

const CONFIG_BEGIN: &str = "Config,Begin";
const CONFIG_END: &str = "Config,End";

/// Parsed preamble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub version: FormatVersion,
    pub config: Option<ReplayConfig>,
    /// Non-fatal problems in the config block
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedHeap {
    pub size: Option<u64>,
    pub flags: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedMemoryType {
    pub heap_index: Option<u32>,
    pub property_flags: Option<u32>,
}

/// Environment the trace was recorded on. Fields the recording did not
/// mention stay `None` and are never compared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    pub api_version: Option<u32>,
    pub driver_version: Option<u32>,
    pub vendor_id: Option<u32>,
    pub device_id: Option<u32>,
    pub device_type: Option<u32>,
    pub device_name: Option<String>,
    pub max_memory_allocation_count: Option<u32>,
    pub buffer_image_granularity: Option<u64>,
    pub non_coherent_atom_size: Option<u64>,
    pub heap_count: Option<u32>,
    pub type_count: Option<u32>,
    pub heaps: BTreeMap<u32, RecordedHeap>,
    pub memory_types: BTreeMap<u32, RecordedMemoryType>,
    pub extensions: BTreeMap<String, bool>,
    /// Build-time switches of the recording program
    pub macros: BTreeMap<String, String>,
}

/// One recorded-versus-live difference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub field: String,
    pub recorded: String,
    pub current: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: recorded {}, current {}", self.field, self.recorded, self.current)
    }
}

struct MismatchList(Vec<Mismatch>);

impl MismatchList {
    fn check<T: PartialEq + fmt::Display>(
        &mut self,
        field: impl Into<String>,
        recorded: Option<T>,
        current: T,
    ) {
        if let Some(recorded) = recorded {
            if recorded != current {
                self.0.push(Mismatch {
                    field: field.into(),
                    recorded: recorded.to_string(),
                    current: current.to_string(),
                });
            }
        }
    }
}

impl ReplayConfig {
    /// Differences between the recording and the live environment.
    ///
    /// Device identity (driver, vendor, device id/type/name) differs on
    /// almost every machine, so it is only reported at maximum verbosity.
    pub fn compare(&self, env: &LiveEnvironment, verbosity: Verbosity) -> Vec<Mismatch> {
        let mut list = MismatchList(Vec::new());

        list.check("apiVersion", self.api_version, env.api_version);
        if verbosity == Verbosity::Maximum {
            list.check("driverVersion", self.driver_version, env.driver_version);
            list.check("vendorID", self.vendor_id, env.vendor_id);
            list.check("deviceID", self.device_id, env.device_id);
            list.check("deviceType", self.device_type, env.device_type);
            list.check("deviceName", self.device_name.as_deref(), env.device_name.as_str());
        }

        list.check(
            "maxMemoryAllocationCount",
            self.max_memory_allocation_count,
            env.limits.max_memory_allocation_count,
        );
        list.check(
            "bufferImageGranularity",
            self.buffer_image_granularity,
            env.limits.buffer_image_granularity,
        );
        list.check(
            "nonCoherentAtomSize",
            self.non_coherent_atom_size,
            env.limits.non_coherent_atom_size,
        );

        list.check("HeapCount", self.heap_count, env.memory_heaps.len() as u32);
        for (&index, heap) in &self.heaps {
            if let Some(current) = env.memory_heaps.get(index as usize) {
                list.check(format!("Heap[{}].size", index), heap.size, current.size);
                list.check(format!("Heap[{}].flags", index), heap.flags, current.flags);
            }
        }

        list.check("TypeCount", self.type_count, env.memory_types.len() as u32);
        for (&index, memory_type) in &self.memory_types {
            if let Some(current) = env.memory_types.get(index as usize) {
                list.check(
                    format!("Type[{}].heapIndex", index),
                    memory_type.heap_index,
                    current.heap_index,
                );
                list.check(
                    format!("Type[{}].propertyFlags", index),
                    memory_type.property_flags,
                    current.property_flags,
                );
            }
        }

        for (name, &enabled) in &self.extensions {
            if let Some(current) = env.extensions.by_name(name) {
                list.check(format!("Extension {}", name), Some(enabled), current);
            }
        }

        list.0
    }

    fn apply_row(&mut self, line: &TraceLine<'_>, warnings: &mut Vec<String>) {
        let row = split_fields(line.bytes, 2);
        let applied = match row.str_at(0) {
            Some("PhysicalDevice") => self.apply_device(&split_rest(&row, 2)),
            Some("PhysicalDeviceLimits") => self.apply_limits(&split_rest(&row, 2)),
            Some("PhysicalDeviceMemory") => self.apply_memory(&split_rest(&row, 4)),
            Some("Extension") => {
                let fields = split_rest(&row, 2);
                match (fields.str_at(0), fields.bool_at(1)) {
                    (Some(name), Some(enabled)) => {
                        self.extensions.insert(name.to_string(), enabled);
                        true
                    }
                    _ => false,
                }
            }
            Some("Macro") => {
                let fields = split_rest(&row, 2);
                match (fields.str_at(0), fields.str_at(1)) {
                    (Some(name), Some(value)) => {
                        self.macros.insert(name.to_string(), value.to_string());
                        true
                    }
                    _ => false,
                }
            }
            _ => false,
        };

        if !applied {
            warnings.push(format!(
                "Line {}: unrecognized configuration row: {}",
                line.number,
                line.text()
            ));
        }
    }

    fn apply_device(&mut self, fields: &FieldList<'_>) -> bool {
        let slot = match fields.str_at(0) {
            Some("apiVersion") => &mut self.api_version,
            Some("driverVersion") => &mut self.driver_version,
            Some("vendorID") => &mut self.vendor_id,
            Some("deviceID") => &mut self.device_id,
            Some("deviceType") => &mut self.device_type,
            Some("deviceName") => {
                return match fields.str_at(1) {
                    Some(name) => {
                        self.device_name = Some(name.to_string());
                        true
                    }
                    None => false,
                };
            }
            _ => return false,
        };
        store(slot, fields.u32_at(1))
    }

    fn apply_limits(&mut self, fields: &FieldList<'_>) -> bool {
        match fields.str_at(0) {
            Some("maxMemoryAllocationCount") => {
                store(&mut self.max_memory_allocation_count, fields.u32_at(1))
            }
            Some("bufferImageGranularity") => {
                store(&mut self.buffer_image_granularity, fields.u64_at(1))
            }
            Some("nonCoherentAtomSize") => {
                store(&mut self.non_coherent_atom_size, fields.u64_at(1))
            }
            _ => false,
        }
    }

    fn apply_memory(&mut self, fields: &FieldList<'_>) -> bool {
        match fields.str_at(0) {
            Some("HeapCount") => store(&mut self.heap_count, fields.u32_at(1)),
            Some("TypeCount") => store(&mut self.type_count, fields.u32_at(1)),
            Some("Heap") => {
                let Some(index) = fields.u32_at(1) else { return false };
                let heap = self.heaps.entry(index).or_default();
                match fields.str_at(2) {
                    Some("size") => store(&mut heap.size, fields.u64_at(3)),
                    Some("flags") => store(&mut heap.flags, fields.u32_at(3)),
                    _ => false,
                }
            }
            Some("Type") => {
                let Some(index) = fields.u32_at(1) else { return false };
                let memory_type = self.memory_types.entry(index).or_default();
                match fields.str_at(2) {
                    Some("heapIndex") => store(&mut memory_type.heap_index, fields.u32_at(3)),
                    Some("propertyFlags") => {
                        store(&mut memory_type.property_flags, fields.u32_at(3))
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

fn split_rest<'a>(row: &FieldList<'a>, max_count: usize) -> FieldList<'a> {
    match row.get(1) {
        Some(rest) => split_fields(rest.bytes(), max_count),
        None => FieldList::empty(),
    }
}

fn store<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(value) => {
            *slot = Some(value);
            true
        }
        None => false,
    }
}

/// Consume the preamble from `lines`, leaving it positioned at the first
/// data line.
pub fn parse_header(
    lines: &mut LineSplit<'_>,
    format_tag: &str,
) -> Result<TraceHeader, FormatError> {
    let tag = lines.next_line().ok_or(FormatError::MissingTag)?;
    if !tag.matches(format_tag) {
        return Err(FormatError::BadTag {
            expected: format_tag.to_string(),
            found: tag.text(),
        });
    }

    let version_line = lines.next_line().ok_or(FormatError::MissingVersion)?;
    let version = parse_version(&version_line)?;

    let mut header = TraceHeader {
        version,
        config: None,
        warnings: Vec::new(),
    };

    if version >= CONFIG_BLOCK_VERSION
        && lines.peek_line().is_some_and(|line| line.matches(CONFIG_BEGIN))
    {
        let begin = lines.next_line().map(|line| line.number).unwrap_or_default();
        let mut config = ReplayConfig::default();
        loop {
            let line = lines
                .next_line()
                .ok_or(FormatError::UnterminatedConfig { line: begin })?;
            if line.matches(CONFIG_END) {
                break;
            }
            if !line.is_blank() {
                config.apply_row(&line, &mut header.warnings);
            }
        }
        header.config = Some(config);
    }

    Ok(header)
}

fn parse_version(line: &TraceLine<'_>) -> Result<FormatVersion, FormatError> {
    let fields = split_fields(line.bytes, 2);
    let version = match (fields.u32_at(0), fields.u32_at(1)) {
        (Some(major), Some(minor)) => FormatVersion::new(major, minor),
        _ => return Err(FormatError::BadVersion { found: line.text() }),
    };
    if version.major != SUPPORTED_MAJOR || version.minor > MAX_SUPPORTED_MINOR {
        return Err(FormatError::UnsupportedVersion { version });
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::{DeviceLimits, ExtensionToggles, MemoryHeap, MemoryType};

    fn environment() -> LiveEnvironment {
        LiveEnvironment {
            api_version: 4198400,
            driver_version: 1,
            vendor_id: 0x10DE,
            device_id: 0x1234,
            device_type: 2,
            device_name: "Test GPU".to_string(),
            limits: DeviceLimits {
                max_memory_allocation_count: 4096,
                buffer_image_granularity: 1024,
                non_coherent_atom_size: 64,
            },
            memory_heaps: vec![MemoryHeap { size: 1 << 30, flags: 1 }],
            memory_types: vec![MemoryType { heap_index: 0, property_flags: 1 }],
            extensions: ExtensionToggles::default(),
        }
    }

    #[test]
    fn test_minimal_header() {
        let mut lines = LineSplit::new(b"FMT\n1,8\n12552,0.5,0,vmaCreatePool\n");
        let header = parse_header(&mut lines, "FMT").unwrap();

        assert_eq!(header.version, FormatVersion::new(1, 8));
        assert!(header.config.is_none());
        assert_eq!(lines.next_line().unwrap().number, 3);
    }

    #[test]
    fn test_header_errors() {
        let parse =
            |data: &'static [u8]| parse_header(&mut LineSplit::new(data), DEFAULT_FORMAT_TAG);

        assert_eq!(parse(b""), Err(FormatError::MissingTag));
        assert!(matches!(parse(b"Something else\n1,0\n"), Err(FormatError::BadTag { .. })));
        assert_eq!(
            parse(b"Vulkan Memory Allocator,Calls recording\n"),
            Err(FormatError::MissingVersion)
        );
        assert!(matches!(
            parse(b"Vulkan Memory Allocator,Calls recording\nabc\n"),
            Err(FormatError::BadVersion { .. })
        ));
        assert_eq!(
            parse(b"Vulkan Memory Allocator,Calls recording\n1,9\n"),
            Err(FormatError::UnsupportedVersion { version: FormatVersion::new(1, 9) })
        );
        assert_eq!(
            parse(b"Vulkan Memory Allocator,Calls recording\n2,0\n"),
            Err(FormatError::UnsupportedVersion { version: FormatVersion::new(2, 0) })
        );
    }

    #[test]
    fn test_config_block() {
        let data = b"T\n1,5\nConfig,Begin\n\
PhysicalDevice,apiVersion,4198400\n\
PhysicalDevice,deviceName,Vendor GPU, rev 2\n\
PhysicalDeviceLimits,bufferImageGranularity,2048\n\
PhysicalDeviceMemory,HeapCount,1\n\
PhysicalDeviceMemory,Heap,0,size,1073741824\n\
PhysicalDeviceMemory,Type,0,propertyFlags,1\n\
Extension,VK_KHR_dedicated_allocation,0\n\
Macro,VMA_DEBUG_MARGIN,0\n\
Bogus,row\n\
PhysicalDevice,vendorID,notanumber\n\
Config,End\n\
1,0.0,0,CreateAllocator\n";
        let mut lines = LineSplit::new(data);
        let header = parse_header(&mut lines, "T").unwrap();
        let config = header.config.unwrap();

        assert_eq!(config.api_version, Some(4198400));
        assert_eq!(config.device_name.as_deref(), Some("Vendor GPU, rev 2"));
        assert_eq!(config.buffer_image_granularity, Some(2048));
        assert_eq!(config.heaps[&0].size, Some(1 << 30));
        assert_eq!(config.memory_types[&0].property_flags, Some(1));
        assert_eq!(config.extensions["VK_KHR_dedicated_allocation"], false);
        assert_eq!(config.macros["VMA_DEBUG_MARGIN"], "0");
        assert_eq!(config.vendor_id, None);
        assert_eq!(header.warnings.len(), 2);
        assert!(lines.next_line().unwrap().matches("1,0.0,0,CreateAllocator"));
    }

    #[test]
    fn test_config_block_needs_end() {
        let mut lines = LineSplit::new(b"T\n1,3\nConfig,Begin\nMacro,A,1\n");
        assert_eq!(
            parse_header(&mut lines, "T"),
            Err(FormatError::UnterminatedConfig { line: 3 })
        );
    }

    #[test]
    fn test_config_ignored_before_block_version() {
        let mut lines = LineSplit::new(b"T\n1,2\nConfig,Begin\n");
        let header = parse_header(&mut lines, "T").unwrap();
        assert!(header.config.is_none());
        assert!(lines.next_line().unwrap().matches(CONFIG_BEGIN));
    }

    #[test]
    fn test_compare_respects_verbosity() {
        let config = ReplayConfig {
            api_version: Some(4198400),
            device_name: Some("Other GPU".to_string()),
            buffer_image_granularity: Some(1),
            heap_count: Some(2),
            extensions: [("VK_KHR_dedicated_allocation".to_string(), false)].into_iter().collect(),
            ..Default::default()
        };
        let env = environment();

        let fields: Vec<String> = config
            .compare(&env, Verbosity::Default)
            .into_iter()
            .map(|m| m.field)
            .collect();
        assert_eq!(
            fields,
            vec!["bufferImageGranularity", "HeapCount", "Extension VK_KHR_dedicated_allocation"]
        );

        let maximum = config.compare(&env, Verbosity::Maximum);
        assert!(maximum.iter().any(|m| m.field == "deviceName" && m.current == "Test GPU"));
    }
}
